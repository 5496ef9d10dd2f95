//! Filesystem opcodes: `test`, `mkdirs`, `cleandir`.

use std::fs;
use std::path::Path;

use anyhow::Context;

use super::resolve_path;
use crate::instruction::Instruction;
use crate::session::{BuildSession, Interrupt, StepResult};

/// Evaluates a predicate without touching the pass/fail state of the build.
///
/// `-d` and `-f` check the filesystem; `-eq`/`-neq` run the first child with
/// its console captured and compare the trimmed output against `left`.
pub(crate) fn test(session: &mut BuildSession, node: &Instruction, wd: &Path) -> StepResult {
    let Some(flag) = node.arg("flag") else {
        return Err(Interrupt::Config(format!("test flag is missing: {node:?}")));
    };

    match flag {
        "-d" => {
            let left = required_left(node)?;
            Ok(resolve_path(wd, left).is_dir())
        }
        "-f" => {
            let left = required_left(node)?;
            Ok(resolve_path(wd, left).is_file())
        }
        "-eq" | "-neq" => {
            let left = required_left(node)?.to_string();
            let Some(probe) = node.sub_commands.first() else {
                return Err(Interrupt::Config(format!(
                    "test {flag} needs a sub command: {node:?}"
                )));
            };
            let (_, output) = session.run_captured(probe, wd)?;
            let equal = left == output.trim();
            Ok(if flag == "-eq" { equal } else { !equal })
        }
        other => Err(Interrupt::Config(format!("unknown test flag '{other}'"))),
    }
}

/// Creates a directory chain; fails when the leaf already exists.
pub(crate) fn mkdirs(session: &mut BuildSession, node: &Instruction, wd: &Path) -> StepResult {
    let Some(path) = node.arg("path") else {
        return Err(Interrupt::Config(format!("mkdirs path is missing: {node:?}")));
    };
    let dir = resolve_path(wd, path);
    if dir.exists() {
        return Ok(false);
    }
    match fs::create_dir_all(&dir) {
        Ok(()) => Ok(true),
        Err(error) => {
            session.println_prefixed(&format!("Failed to create directory: {error}"));
            Ok(false)
        }
    }
}

/// Deletes the contents of a directory, sparing an optional allow-list of
/// top-level entry names.
pub(crate) fn cleandir(session: &mut BuildSession, node: &Instruction, wd: &Path) -> StepResult {
    let Some(path) = node.arg("path") else {
        return Err(Interrupt::Config(format!(
            "cleandir path is missing: {node:?}"
        )));
    };
    let allowed: Vec<String> = match node.arg("allowed") {
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| Interrupt::Config(format!("cleandir allow-list is not valid: {e}")))?,
        None => Vec::new(),
    };

    let dir = resolve_path(wd, path);
    if !dir.exists() {
        return Ok(true);
    }

    match clean(&dir, &allowed) {
        Ok(()) => Ok(true),
        Err(error) => {
            session.println_prefixed(&format!(
                "Failed to clean directory [{}]: {error:#}",
                dir.display()
            ));
            Ok(false)
        }
    }
}

fn clean(dir: &Path, allowed: &[String]) -> anyhow::Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let entry = entry?;
        let name = entry.file_name();
        if allowed.iter().any(|a| a.as_str() == name.to_string_lossy()) {
            continue;
        }
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&path).with_context(|| format!("remove {}", path.display()))?;
        } else {
            fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
        }
    }
    Ok(())
}

fn required_left(node: &Instruction) -> Result<&str, Interrupt> {
    node.arg("left")
        .ok_or_else(|| Interrupt::Config(format!("test operand is missing: {node:?}")))
}

#[cfg(test)]
mod tests {
    use crate::instruction::Instruction;
    use crate::ports::BuildResult;
    use crate::test_support::SessionHarness;
    use std::fs;

    #[test]
    fn test_checks_files_and_directories() {
        let mut harness = SessionHarness::new();
        let sandbox = harness.sandbox.path().to_path_buf();
        fs::create_dir(sandbox.join("dir")).expect("mkdir");
        fs::write(sandbox.join("file"), "x").expect("write");

        let session = &mut harness.session;
        let check = |session: &mut crate::session::BuildSession, flag: &str, left: &str| {
            session
                .run_captured(&Instruction::test_cond(flag, left), &sandbox)
                .expect("predicate")
                .0
        };
        assert!(check(session, "-d", "dir"));
        assert!(!check(session, "-d", "file"));
        assert!(check(session, "-f", "file"));
        assert!(!check(session, "-f", "dir"));
    }

    #[test]
    fn test_eq_compares_captured_output() {
        let mut harness = SessionHarness::new();
        let sandbox = harness.sandbox.path().to_path_buf();
        let session = &mut harness.session;

        let eq = Instruction::test_eq("hello", Instruction::echo(&["hello"]));
        assert!(session.run_captured(&eq, &sandbox).expect("predicate").0);

        let neq = Instruction::test_eq("goodbye", Instruction::echo(&["hello"]));
        assert!(!session.run_captured(&neq, &sandbox).expect("predicate").0);
        assert_eq!(harness.console.lines(), Vec::<String>::new());
    }

    #[test]
    fn unknown_test_flag_aborts_the_build() {
        let mut harness = SessionHarness::new();
        let result = harness.execute(&Instruction::test_cond("-x", "whatever"));
        assert_eq!(result, BuildResult::Failed);
        assert!(harness.console.output().contains("Build aborted:"));
    }

    #[test]
    fn mkdirs_creates_once_then_fails() {
        let mut harness = SessionHarness::new();
        let sandbox = harness.sandbox.path().to_path_buf();
        let session = &mut harness.session;

        let node = Instruction::mkdirs("a/b/c");
        assert!(matches!(session.process(&node, &sandbox), Ok(true)));
        assert!(sandbox.join("a/b/c").is_dir());
        assert!(matches!(session.process(&node, &sandbox), Ok(false)));
    }

    #[test]
    fn cleandir_spares_the_allow_list() {
        let mut harness = SessionHarness::new();
        let sandbox = harness.sandbox.path().to_path_buf();
        let dir = sandbox.join("work");
        fs::create_dir_all(dir.join("keep-me")).expect("mkdir");
        fs::create_dir_all(dir.join("drop-me")).expect("mkdir");
        fs::write(dir.join("stray.txt"), "x").expect("write");

        let node = Instruction::cleandir("work", &["keep-me"]);
        let result = harness.execute(&node);
        assert_eq!(result, BuildResult::Passed);
        assert!(dir.join("keep-me").is_dir());
        assert!(!dir.join("drop-me").exists());
        assert!(!dir.join("stray.txt").exists());
    }

    #[test]
    fn cleandir_of_a_missing_directory_passes() {
        let mut harness = SessionHarness::new();
        let result = harness.execute(&Instruction::cleandir("missing", &[] as &[&str]));
        assert_eq!(result, BuildResult::Passed);
    }
}
