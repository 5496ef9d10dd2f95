//! Status reporting opcodes and the session-terminating `end`.

use tracing::warn;

use crate::instruction::Instruction;
use crate::ports::{BuildResult, JobState};
use crate::session::{BuildPass, BuildSession, Interrupt, StepResult};

pub(crate) fn report_current_status(session: &mut BuildSession, node: &Instruction) -> StepResult {
    let Some(status) = node.arg("status") else {
        return Err(Interrupt::Config(format!(
            "reportCurrentStatus status is missing: {node:?}"
        )));
    };
    let state: JobState = status
        .parse()
        .map_err(|e| Interrupt::Config(format!("{e:#}")))?;
    if let Err(error) = session.reporter.report_state(state) {
        warn!(%error, %state, "could not report job state");
        session.println_prefixed(&format!("Failed to report status {state}: {error:#}"));
    }
    Ok(true)
}

pub(crate) fn report_completing(session: &mut BuildSession) -> StepResult {
    report_with_result(session, JobState::Completing)
}

pub(crate) fn report_completed(session: &mut BuildSession) -> StepResult {
    report_with_result(session, JobState::Completed)
}

/// Completion reports carry the result derived from the pass/fail state so
/// far; an undecided build counts as passed.
fn report_with_result(session: &mut BuildSession, state: JobState) -> StepResult {
    let result = if session.build_pass == BuildPass::Failing {
        BuildResult::Failed
    } else {
        BuildResult::Passed
    };
    if let Err(error) = session.reporter.report_state(state) {
        warn!(%error, %state, "could not report job state");
        session.println_prefixed(&format!("Failed to report status {state}: {error:#}"));
    }
    if let Err(error) = session.reporter.report_result(result) {
        warn!(%error, %result, "could not report job result");
        session.println_prefixed(&format!("Failed to report result {result}: {error:#}"));
    }
    Ok(true)
}

/// Resets per-build state and releases the console.
pub(crate) fn end(session: &mut BuildSession) -> StepResult {
    session.console.close();
    session.envs.clear();
    session.secrets.clear();
    session.build_pass = BuildPass::Unknown;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use crate::instruction::Instruction;
    use crate::ports::{BuildResult, JobState};
    use crate::test_support::SessionHarness;

    #[test]
    fn completion_reports_derive_passed_from_an_undecided_build() {
        let mut harness = SessionHarness::new();
        harness.execute(&Instruction::report_completed());
        assert_eq!(harness.reporter.states(), vec![JobState::Completed]);
        // One result from the report itself, one from session teardown.
        assert_eq!(
            harness.reporter.results(),
            vec![BuildResult::Passed, BuildResult::Passed]
        );
    }

    #[test]
    fn completion_reports_carry_a_failure() {
        let mut harness = SessionHarness::new();
        harness.execute(&Instruction::compose(vec![
            Instruction::fail("boom"),
            Instruction::report_completing().run_if(crate::instruction::RunCondition::Any),
        ]));
        assert_eq!(harness.reporter.states(), vec![JobState::Completing]);
        assert_eq!(harness.reporter.results()[0], BuildResult::Failed);
    }

    #[test]
    fn noop_has_no_observable_effect() {
        let mut harness = SessionHarness::new();
        let result = harness.execute(&Instruction::noop());
        assert_eq!(result, BuildResult::Passed);
        assert!(harness.console.lines().is_empty());
    }
}
