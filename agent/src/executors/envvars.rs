//! Console and environment opcodes: `echo`, `export`, `secret`, `fail`.

use std::path::Path;

use crate::console::SECURE_VALUE_MASK;
use crate::instruction::Instruction;
use crate::session::{BuildSession, Interrupt, StepResult};

pub(crate) fn echo(session: &mut BuildSession, node: &Instruction) -> StepResult {
    for line in node.list_args() {
        session.println(line);
    }
    Ok(true)
}

/// Sets, displays, or dumps session environment variables.
///
/// With `name` and `value` the variable is set (the console line says
/// "overriding" when it already existed, and masks secure values). With only
/// `name` the current value is displayed. With no args the whole table is
/// dumped as `export NAME=value` lines.
pub(crate) fn export(session: &mut BuildSession, node: &Instruction, wd: &Path) -> StepResult {
    let Some(name) = node.arg("name").map(str::to_string) else {
        // The dump goes back through the interpreter as a plain echo node.
        let lines: Vec<String> = session
            .envs
            .iter()
            .map(|(name, value)| format!("export {name}={value}"))
            .collect();
        return session.process(&Instruction::echo(&lines), wd);
    };

    match node.arg("value").map(str::to_string) {
        Some(value) => {
            let secure = node.arg("secure") == Some("true");
            if secure {
                session.secrets.register(&value, Some(SECURE_VALUE_MASK));
            }
            let display = if secure { SECURE_VALUE_MASK } else { &value };
            let exists = session.envs.contains_key(&name) || std::env::var_os(&name).is_some();
            let message = if exists {
                format!("overriding environment variable '{name}' with value '{display}'")
            } else {
                format!("setting environment variable '{name}' to value '{display}'")
            };
            session.envs.insert(name, value);
            session.println_prefixed(&message);
        }
        None => {
            let value = session
                .envs
                .get(&name)
                .cloned()
                .or_else(|| std::env::var(&name).ok())
                .unwrap_or_else(|| "null".to_string());
            session.println_prefixed(&format!(
                "setting environment variable '{name}' to value '{value}'"
            ));
        }
    }
    Ok(true)
}

/// Registers a value for console redaction for the rest of the build.
pub(crate) fn secret(session: &mut BuildSession, node: &Instruction) -> StepResult {
    let Some(value) = node.arg("value") else {
        return Err(Interrupt::Config(format!(
            "secret value is missing: {node:?}"
        )));
    };
    let value = value.to_string();
    let substitution = node.arg("substitution").map(str::to_string);
    session.secrets.register(&value, substitution.as_deref());
    Ok(true)
}

/// Prints its message and fails unconditionally.
pub(crate) fn fail(session: &mut BuildSession, node: &Instruction) -> StepResult {
    if let Some(message) = node.arg("0") {
        session.println(message);
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use crate::instruction::Instruction;
    use crate::ports::BuildResult;
    use crate::test_support::SessionHarness;

    #[test]
    fn export_announces_setting_then_overriding() {
        let mut harness = SessionHarness::new();
        harness.execute(&Instruction::compose(vec![
            Instruction::export("ANSWER", "42", false),
            Instruction::export("ANSWER", "43", false),
        ]));
        let lines = harness.console.lines();
        assert_eq!(
            lines,
            vec![
                "[agent] setting environment variable 'ANSWER' to value '42'",
                "[agent] overriding environment variable 'ANSWER' with value '43'",
            ]
        );
    }

    #[test]
    fn secure_export_masks_the_value_everywhere() {
        let mut harness = SessionHarness::new();
        harness.execute(&Instruction::compose(vec![
            Instruction::export("TOKEN", "s3cr3t", true),
            Instruction::echo(&["token is s3cr3t"]),
        ]));
        let output = harness.console.output();
        assert!(output.contains("setting environment variable 'TOKEN' to value '********'"));
        assert!(output.contains("token is ********"));
        assert!(!output.contains("s3cr3t"));
    }

    #[test]
    fn export_with_only_a_name_shows_the_current_value() {
        let mut harness = SessionHarness::new();
        harness.execute(&Instruction::compose(vec![
            Instruction::export("GREETING", "hi", false),
            Instruction::export_name("GREETING"),
            Instruction::export_name("AGENT_TEST_UNSET_VARIABLE"),
        ]));
        let output = harness.console.output();
        assert!(output.contains("[agent] setting environment variable 'GREETING' to value 'hi'"));
        assert!(output
            .contains("[agent] setting environment variable 'AGENT_TEST_UNSET_VARIABLE' to value 'null'"));
    }

    #[test]
    fn export_without_args_dumps_the_table_as_echo_lines() {
        let mut harness = SessionHarness::new();
        harness.execute(&Instruction::compose(vec![
            Instruction::export("A", "1", false),
            Instruction::export("B", "2", false),
            Instruction::export_dump(),
        ]));
        // The dump lines come from a synthesized echo, so they carry no
        // product-name prefix.
        let lines = harness.console.lines();
        assert_eq!(&lines[2..], ["export A=1", "export B=2"]);
    }

    #[test]
    fn secret_substitution_pairs_are_honored() {
        let mut harness = SessionHarness::new();
        harness.execute(&Instruction::compose(vec![
            Instruction::secret_with_substitution("foo:bar@host", "foo:******@host"),
            Instruction::echo(&["connect foo:bar@host"]),
        ]));
        assert!(harness.console.output().contains("connect foo:******@host"));
    }

    #[test]
    fn fail_prints_and_fails() {
        let mut harness = SessionHarness::new();
        let result = harness.execute(&Instruction::fail("expected failure"));
        assert_eq!(result, BuildResult::Failed);
        assert!(harness.console.output().contains("expected failure"));
    }
}
