//! Build console plumbing: sinks, secret redaction, variable substitution.
//!
//! Console output is a product surface (it becomes the server-side build
//! log), distinct from the dev diagnostics emitted through `tracing`. Every
//! line passes through variable substitution and secret redaction before it
//! reaches a sink.

use std::collections::BTreeMap;
use std::sync::{LazyLock, Mutex};

use regex::Regex;

/// Product-name prefix used for agent-generated console lines.
pub const PRODUCT_NAME: &str = "agent";

/// Replacement shown for redacted secrets without an explicit substitution.
pub const DEFAULT_SECRET_MASK: &str = "******";

/// Display placeholder for values of secure environment variables.
pub const SECURE_VALUE_MASK: &str = "********";

/// Destination for redacted build console lines.
pub trait ConsoleSink: Send + Sync {
    fn write_line(&self, line: &str);

    /// Tear down any transmitter resources. Called by the `end` opcode.
    fn close(&self) {}
}

/// Sink that prints to stdout; used by the CLI.
pub struct StdoutSink;

impl ConsoleSink for StdoutSink {
    fn write_line(&self, line: &str) {
        println!("{line}");
    }
}

/// In-memory sink backing `-eq` test predicates.
#[derive(Default)]
pub struct CaptureSink {
    lines: Mutex<Vec<String>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        CaptureSink::default()
    }

    /// Captured lines joined with newlines.
    pub fn captured(&self) -> String {
        self.lines.lock().expect("capture lock").join("\n")
    }
}

impl ConsoleSink for CaptureSink {
    fn write_line(&self, line: &str) {
        self.lines.lock().expect("capture lock").push(line.to_string());
    }
}

#[derive(Clone, Debug)]
struct SecretSubstitution {
    plain: String,
    substitution: String,
}

/// Ordered set of secret substitution pairs applied to all console output.
#[derive(Clone, Debug, Default)]
pub struct SecretStore {
    entries: Vec<SecretSubstitution>,
}

impl SecretStore {
    /// Registers `plain` for redaction for the rest of the build. A repeated
    /// registration of the same value updates its substitution.
    pub fn register(&mut self, plain: &str, substitution: Option<&str>) {
        if plain.is_empty() {
            return;
        }
        let substitution = substitution.unwrap_or(DEFAULT_SECRET_MASK).to_string();
        if let Some(existing) = self.entries.iter_mut().find(|e| e.plain == plain) {
            existing.substitution = substitution;
            return;
        }
        self.entries.push(SecretSubstitution {
            plain: plain.to_string(),
            substitution,
        });
    }

    /// Applies every registered substitution, in registration order.
    pub fn redact(&self, line: &str) -> String {
        let mut out = line.to_string();
        for entry in &self.entries {
            out = out.replace(&entry.plain, &entry.substitution);
        }
        out
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

static VARIABLE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z0-9_.\-]+)\}").expect("variable pattern"));

/// Replaces `${name}` references from `vars`; unknown names stay verbatim.
pub fn substitute_variables(line: &str, vars: &BTreeMap<String, String>) -> String {
    VARIABLE_PATTERN
        .replace_all(line, |caps: &regex::Captures<'_>| match vars.get(&caps[1]) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redaction_masks_registered_values() {
        let mut secrets = SecretStore::default();
        secrets.register("42", None);
        assert_eq!(secrets.redact("the answer is 42"), "the answer is ******");
    }

    #[test]
    fn redaction_uses_explicit_substitution() {
        let mut secrets = SecretStore::default();
        secrets.register("foo:bar@ssss.com", Some("foo:******@ssss.com"));
        assert_eq!(
            secrets.redact("connecting to foo:bar@ssss.com"),
            "connecting to foo:******@ssss.com"
        );
        assert_eq!(
            secrets.redact("connecting to foo:bar@tttt.com"),
            "connecting to foo:bar@tttt.com"
        );
    }

    #[test]
    fn substitution_reads_known_variables_and_keeps_unknown() {
        let mut vars = BTreeMap::new();
        assert_eq!(
            substitute_variables("hello ${test.foo}", &vars),
            "hello ${test.foo}"
        );
        vars.insert("test.foo".to_string(), "world".to_string());
        assert_eq!(substitute_variables("hello ${test.foo}", &vars), "hello world");
    }

    #[test]
    fn capture_sink_joins_lines() {
        let sink = CaptureSink::new();
        sink.write_line("a");
        sink.write_line("b");
        assert_eq!(sink.captured(), "a\nb");
    }
}
