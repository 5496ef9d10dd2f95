//! Artifact publication opcodes: `uploadArtifact`, `generateTestReport`,
//! `generateProperty`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sxd_document::parser;
use sxd_xpath::{Context as XpathContext, Factory, Value};
use tracing::{debug, warn};

use super::resolve_path;
use crate::instruction::Instruction;
use crate::session::{BuildSession, Interrupt, StepResult};

/// Uploads everything matched by the `src` glob under the working directory.
pub(crate) fn upload_artifact(
    session: &mut BuildSession,
    node: &Instruction,
    wd: &Path,
) -> StepResult {
    let Some(src) = node.arg("src") else {
        return Err(Interrupt::Config(format!(
            "uploadArtifact src is missing: {node:?}"
        )));
    };
    let dest = node.arg("dest").unwrap_or_default().to_string();

    let pattern = resolve_path(wd, src);
    let matches = match glob::glob(&pattern.to_string_lossy()) {
        Ok(paths) => paths.filter_map(std::result::Result::ok).collect::<Vec<_>>(),
        Err(e) => {
            return Err(Interrupt::Config(format!(
                "uploadArtifact pattern '{src}' is not valid: {e}"
            )));
        }
    };

    if matches.is_empty() {
        session.println_prefixed(&format!(
            "The rule [{src}] cannot match any resource under [{}]",
            wd.display()
        ));
        return Ok(false);
    }

    for path in matches {
        debug!(path = %path.display(), dest = %dest, "uploading artifact");
        if let Err(error) = session.repository.upload(&path, &dest) {
            session.println_prefixed(&format!(
                "Failed to upload [{}]: {error:#}",
                path.display()
            ));
            return Ok(false);
        }
    }
    Ok(true)
}

/// Scans the named test-result locations for XML reports, uploads a summary
/// of them, and echoes the totals.
pub(crate) fn generate_test_report(
    session: &mut BuildSession,
    node: &Instruction,
    wd: &Path,
) -> StepResult {
    let dest = node.arg("dest").unwrap_or("testoutput").to_string();
    let mut files = Vec::new();
    for src in node.list_args() {
        let pattern = resolve_path(wd, src);
        let matches: Vec<PathBuf> = glob::glob(&pattern.to_string_lossy())
            .map(|paths| paths.filter_map(std::result::Result::ok).collect())
            .unwrap_or_default();
        if matches.is_empty() {
            session.println(&format!(
                "The Directory {} specified as a test artifact was not found. Please check your configuration",
                pattern.display()
            ));
            continue;
        }
        for path in matches {
            collect_xml_files(&path, &mut files);
        }
    }

    if files.is_empty() {
        session.println_prefixed("No files were found in the Test Results folders");
        return Ok(false);
    }

    let mut totals = TestTotals::default();
    for file in &files {
        match parse_junit_report(file) {
            Ok(report) => totals.add(&report),
            Err(error) => warn!(file = %file.display(), %error, "skipping unparsable report"),
        }
    }

    if let Err(error) = upload_summary(session, &totals, &dest) {
        session.println_prefixed(&format!("Failed to upload test report: {error:#}"));
        return Ok(false);
    }
    session.println_prefixed(&format!(
        "Tests run: {}, Failures: {}, Errors: {}, Time elapsed: {:.2} sec",
        totals.tests, totals.failures, totals.errors, totals.time
    ));
    Ok(true)
}

/// Evaluates an XPath over an XML file and publishes the result as a build
/// property.
pub(crate) fn generate_property(
    session: &mut BuildSession,
    node: &Instruction,
    wd: &Path,
) -> StepResult {
    let (Some(name), Some(src), Some(xpath)) =
        (node.arg("name"), node.arg("src"), node.arg("xpath"))
    else {
        return Err(Interrupt::Config(format!(
            "generateProperty needs name, src and xpath: {node:?}"
        )));
    };
    let name = name.to_string();
    let xpath_text = xpath.to_string();
    let file = resolve_path(wd, src);

    if !file.is_file() {
        session.println(&format!(
            "Failed to create property {name}. File {} does not exist.",
            file.display()
        ));
        return Ok(false);
    }

    let value = match evaluate(&file, &xpath_text) {
        Ok(Some(value)) => value,
        Ok(None) => {
            session.println(&format!(
                "Nothing matched xpath \"{xpath_text}\" in the file: {}.",
                file.display()
            ));
            return Ok(false);
        }
        Err(XpathFailure::BadXpath) => {
            session.println(&format!("Illegal xpath: \"{xpath_text}\""));
            return Ok(false);
        }
        Err(XpathFailure::BadFile(error)) => {
            session.println(&format!(
                "Failed to create property {name}. Could not read {}: {error:#}",
                file.display()
            ));
            return Ok(false);
        }
    };

    if let Err(error) = session.repository.set_property(&name, &value) {
        session.println_prefixed(&format!("Failed to save property {name}: {error:#}"));
    } else {
        session.println(&format!("Property {name} = {value} created."));
    }
    Ok(true)
}

enum XpathFailure {
    BadXpath,
    BadFile(anyhow::Error),
}

fn evaluate(file: &Path, xpath_text: &str) -> Result<Option<String>, XpathFailure> {
    let content = fs::read_to_string(file)
        .with_context(|| format!("read {}", file.display()))
        .map_err(XpathFailure::BadFile)?;
    let package = parser::parse(&content)
        .map_err(|e| XpathFailure::BadFile(anyhow::anyhow!("parse xml: {e}")))?;
    let document = package.as_document();

    let xpath = Factory::new()
        .build(xpath_text)
        .ok()
        .flatten()
        .ok_or(XpathFailure::BadXpath)?;
    let value = xpath
        .evaluate(&XpathContext::new(), document.root())
        .map_err(|_| XpathFailure::BadXpath)?;

    match value {
        Value::Nodeset(ref nodes) if nodes.size() == 0 => Ok(None),
        other => Ok(Some(other.string())),
    }
}

#[derive(Default)]
struct TestTotals {
    tests: u64,
    failures: u64,
    errors: u64,
    time: f64,
}

impl TestTotals {
    fn add(&mut self, other: &TestTotals) {
        self.tests += other.tests;
        self.failures += other.failures;
        self.errors += other.errors;
        self.time += other.time;
    }
}

fn collect_xml_files(path: &Path, out: &mut Vec<PathBuf>) {
    if path.is_file() {
        out.push(path.to_path_buf());
        return;
    }
    let Ok(entries) = fs::read_dir(path) else {
        return;
    };
    for entry in entries.flatten() {
        let entry_path = entry.path();
        if entry_path.is_dir() {
            collect_xml_files(&entry_path, out);
        } else if entry_path.extension().is_some_and(|e| e == "xml") {
            out.push(entry_path);
        }
    }
}

/// Reads the summary attributes of a JUnit-style `<testsuite>` root (or the
/// aggregate `<testsuites>` wrapper).
fn parse_junit_report(file: &Path) -> Result<TestTotals> {
    let content = fs::read_to_string(file).with_context(|| format!("read {}", file.display()))?;
    let package =
        parser::parse(&content).map_err(|e| anyhow::anyhow!("parse {}: {e}", file.display()))?;
    let document = package.as_document();

    let mut totals = TestTotals::default();
    let root = document
        .root()
        .children()
        .into_iter()
        .find_map(|c| c.element())
        .context("no root element")?;

    let mut suites = Vec::new();
    if root.name().local_part() == "testsuites" {
        for child in root.children() {
            if let Some(element) = child.element() {
                if element.name().local_part() == "testsuite" {
                    suites.push(element);
                }
            }
        }
    } else {
        suites.push(root);
    }

    for suite in suites {
        let attr = |name: &str| {
            suite
                .attribute(name)
                .map(|a| a.value().to_string())
                .unwrap_or_default()
        };
        totals.tests += attr("tests").parse::<u64>().unwrap_or(0);
        totals.failures += attr("failures").parse::<u64>().unwrap_or(0);
        totals.errors += attr("errors").parse::<u64>().unwrap_or(0);
        totals.time += attr("time").parse::<f64>().unwrap_or(0.0);
    }
    Ok(totals)
}

fn upload_summary(session: &BuildSession, totals: &TestTotals, dest: &str) -> Result<()> {
    let dir = std::env::temp_dir().join(format!("agent-test-report-{}", std::process::id()));
    fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    let summary = dir.join("index.txt");
    fs::write(
        &summary,
        format!(
            "tests: {}\nfailures: {}\nerrors: {}\ntime: {:.2}\n",
            totals.tests, totals.failures, totals.errors, totals.time
        ),
    )
    .with_context(|| format!("write {}", summary.display()))?;
    let outcome = session.repository.upload(&summary, dest);
    let _ = fs::remove_dir_all(&dir);
    outcome
}
