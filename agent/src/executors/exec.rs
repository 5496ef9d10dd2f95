//! The `exec` opcode: run an external command in the resolved working
//! directory, streaming its output to the build console.

use std::path::Path;

use crate::instruction::Instruction;
use crate::process::ExecRequest;
use crate::session::{BuildSession, Interrupt, StepResult};

pub(crate) fn exec(session: &mut BuildSession, node: &Instruction, wd: &Path) -> StepResult {
    let argv = node.list_args();
    let Some((command, args)) = argv.split_first() else {
        return Err(Interrupt::Config(format!(
            "exec command is missing: {node:?}"
        )));
    };

    if !wd.is_dir() {
        session.println_prefixed(&format!(
            "Working directory \"{}\" is not a directory!",
            wd.display()
        ));
        return Ok(false);
    }

    let request = ExecRequest {
        command: command.to_string(),
        args: args.iter().map(|a| a.to_string()).collect(),
        working_dir: wd.to_path_buf(),
        env: session
            .envs
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        poll_interval: session.poll_interval,
    };

    let on_line = session.sink();
    match session.runner.run(&request, &*on_line, &session.coordinator) {
        Ok(code) => Ok(code == 0),
        Err(_) => {
            let cmdline = argv.join(" ");
            session.println_prefixed(&format!(
                "Error happened while attempting to execute '{cmdline}'. \
                 Please make sure [{command}] can be executed on this agent."
            ));
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::instruction::Instruction;
    use crate::ports::BuildResult;
    use crate::test_support::SessionHarness;

    #[test]
    fn exec_streams_process_output_to_the_console() {
        let mut harness = SessionHarness::new();
        let result = harness.execute(&Instruction::exec("sh", &["-c", "echo one; echo two"]));
        assert_eq!(result, BuildResult::Passed);
        let lines = harness.console.lines();
        assert!(lines.contains(&"one".to_string()));
        assert!(lines.contains(&"two".to_string()));
    }

    #[test]
    fn nonzero_exit_fails_the_node() {
        let mut harness = SessionHarness::new();
        let result = harness.execute(&Instruction::exec("sh", &["-c", "exit 3"]));
        assert_eq!(result, BuildResult::Failed);
    }

    #[test]
    fn unrunnable_command_explains_itself() {
        let mut harness = SessionHarness::new();
        let result = harness.execute(&Instruction::exec("agent-no-such-command", &["-v"]));
        assert_eq!(result, BuildResult::Failed);
        assert!(harness.console.output().contains(
            "Please make sure [agent-no-such-command] can be executed on this agent."
        ));
    }

    #[test]
    fn session_env_reaches_the_process() {
        let mut harness = SessionHarness::new();
        let result = harness.execute(&Instruction::compose(vec![
            Instruction::export("BUILD_LABEL", "1.2.3", false),
            Instruction::exec("sh", &["-c", "echo label=$BUILD_LABEL"]),
        ]));
        assert_eq!(result, BuildResult::Passed);
        assert!(harness.console.output().contains("label=1.2.3"));
    }
}
