//! The build session: walks an instruction tree, tracking the pass/fail state
//! of the build and honoring run conditions, test predicates, and
//! cancellation unwinding.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::cancel::CancellationCoordinator;
use crate::console::{CaptureSink, ConsoleSink, PRODUCT_NAME, SecretStore, substitute_variables};
use crate::executors;
use crate::instruction::Instruction;
use crate::ports::{ArtifactRepository, BuildResult, HttpClient, StatusReporter};
use crate::process::ProcessRunner;

/// Aggregate pass/fail state of the build so far.
///
/// `Unknown` means no node has produced an outcome yet; run conditions treat
/// it like `Passing`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildPass {
    Unknown,
    Passing,
    Failing,
}

/// Non-local exits of instruction processing.
#[derive(Debug)]
pub(crate) enum Interrupt {
    /// Cancellation observed; unwind to the root.
    Cancelled,
    /// The tree itself is malformed; abort the build with a message.
    Config(String),
}

/// Outcome of processing one node: `Ok(true)` passed or skipped, `Ok(false)`
/// failed, `Err` unwinding.
pub(crate) type StepResult = Result<bool, Interrupt>;

/// Everything a session needs from the outside world.
pub struct SessionContext {
    pub console: Arc<dyn ConsoleSink>,
    pub repository: Arc<dyn ArtifactRepository>,
    pub reporter: Arc<dyn StatusReporter>,
    pub http: Arc<dyn HttpClient>,
    pub runner: Arc<dyn ProcessRunner>,
    pub sandbox: PathBuf,
    pub envs: BTreeMap<String, String>,
    pub poll_interval: Duration,
}

pub struct BuildSession {
    pub(crate) console: Arc<dyn ConsoleSink>,
    pub(crate) repository: Arc<dyn ArtifactRepository>,
    pub(crate) reporter: Arc<dyn StatusReporter>,
    pub(crate) http: Arc<dyn HttpClient>,
    pub(crate) runner: Arc<dyn ProcessRunner>,
    pub(crate) coordinator: CancellationCoordinator,
    pub(crate) sandbox: PathBuf,
    pub(crate) poll_interval: Duration,
    pub(crate) envs: BTreeMap<String, String>,
    pub(crate) secrets: SecretStore,
    pub(crate) build_pass: BuildPass,
    unwinding: bool,
}

impl BuildSession {
    pub fn new(ctx: SessionContext) -> Self {
        BuildSession {
            console: ctx.console,
            repository: ctx.repository,
            reporter: ctx.reporter,
            http: ctx.http,
            runner: ctx.runner,
            coordinator: CancellationCoordinator::new(),
            sandbox: ctx.sandbox,
            poll_interval: ctx.poll_interval,
            envs: ctx.envs,
            secrets: SecretStore::default(),
            build_pass: BuildPass::Unknown,
            unwinding: false,
        }
    }

    /// Handle for requesting cancellation from another thread.
    pub fn coordinator(&self) -> CancellationCoordinator {
        self.coordinator.clone()
    }

    /// Runs one instruction tree to completion and reports the result.
    pub fn execute(&mut self, root: &Instruction) -> BuildResult {
        self.coordinator.start();
        self.build_pass = BuildPass::Unknown;
        self.unwinding = false;

        let sandbox = self.sandbox.clone();
        let result = match self.process(root, &sandbox) {
            Ok(_) => {
                if self.build_pass == BuildPass::Failing {
                    BuildResult::Failed
                } else {
                    BuildResult::Passed
                }
            }
            Err(Interrupt::Cancelled) => BuildResult::Cancelled,
            Err(Interrupt::Config(message)) => {
                self.println(&format!("Build aborted: {message}"));
                BuildResult::Failed
            }
        };

        if let Err(error) = self.reporter.report_result(result) {
            warn!(%error, "could not report build result");
        }
        self.coordinator.finish(result == BuildResult::Cancelled);
        result
    }

    /// Processes one node against the working directory inherited from its
    /// nearest ancestor.
    pub(crate) fn process(&mut self, node: &Instruction, inherited_wd: &Path) -> StepResult {
        if !self.unwinding && self.coordinator.requested() {
            // Cancellation noticed on entry: this node never started, so its
            // own cancel handler does not run.
            self.begin_unwind();
            return Err(Interrupt::Cancelled);
        }

        let wd = self.resolve_working_directory(node, inherited_wd);
        if !self.should_run(node) {
            debug!(opcode = %node.opcode, "skipped by run condition");
            return Ok(true);
        }

        match self.process_active(node, &wd) {
            Err(Interrupt::Cancelled) => {
                if !self.unwinding {
                    self.begin_unwind();
                }
                if let Some(handler) = &node.on_cancel {
                    // Handlers run innermost-first as the unwinding
                    // propagates; their outcomes are ignored.
                    let _ = self.process(handler, &wd);
                }
                Err(Interrupt::Cancelled)
            }
            Ok(false) => {
                if !self.unwinding {
                    self.build_pass = BuildPass::Failing;
                }
                Ok(false)
            }
            other => other,
        }
    }

    fn process_active(&mut self, node: &Instruction, wd: &Path) -> StepResult {
        if let Some(test) = &node.test {
            let outcome = self.run_captured(&test.command, wd)?.0;
            if outcome != test.expectation {
                debug!(opcode = %node.opcode, "skipped by test predicate");
                return Ok(true);
            }
        }

        let result = executors::dispatch(self, node, wd)?;
        if !self.unwinding && self.coordinator.requested() {
            return Err(Interrupt::Cancelled);
        }
        Ok(result)
    }

    /// Runs `node` with console output captured and the pass/fail state
    /// restored afterwards. Environment changes made by `node` are kept.
    pub(crate) fn run_captured(
        &mut self,
        node: &Instruction,
        wd: &Path,
    ) -> Result<(bool, String), Interrupt> {
        let capture = Arc::new(CaptureSink::new());
        let saved_console =
            std::mem::replace(&mut self.console, capture.clone() as Arc<dyn ConsoleSink>);
        let saved_pass = self.build_pass;

        let result = self.process(node, wd);

        self.console = saved_console;
        self.build_pass = saved_pass;
        Ok((result?, capture.captured()))
    }

    fn should_run(&self, node: &Instruction) -> bool {
        use crate::instruction::RunCondition;
        match node.run_if {
            RunCondition::Any => true,
            RunCondition::Passed => self.build_pass != BuildPass::Failing,
            RunCondition::Failed => self.build_pass == BuildPass::Failing,
        }
    }

    fn resolve_working_directory(&self, node: &Instruction, inherited: &Path) -> PathBuf {
        match &node.working_directory {
            Some(dir) if Path::new(dir).is_absolute() => PathBuf::from(dir),
            Some(dir) => self.sandbox.join(dir),
            None => inherited.to_path_buf(),
        }
    }

    fn begin_unwind(&mut self) {
        self.unwinding = true;
        self.coordinator.begin_unwinding();
    }

    // -- console helpers ------------------------------------------------

    /// Writes one console line after variable substitution and secret
    /// redaction.
    pub(crate) fn println(&self, line: &str) {
        let line = substitute_variables(line, &self.envs);
        self.console.write_line(&self.secrets.redact(&line));
    }

    /// Like [`println`](Self::println) with the product-name prefix used for
    /// agent-generated (as opposed to process-generated) lines.
    pub(crate) fn println_prefixed(&self, line: &str) {
        self.println(&format!("[{PRODUCT_NAME}] {line}"));
    }

    /// A standalone line writer for callbacks that outlive the borrow of
    /// `self`, such as process output streaming. Secrets and variables are
    /// snapshotted at creation time.
    pub(crate) fn sink(&self) -> Box<dyn Fn(&str) + Send + Sync> {
        let console = Arc::clone(&self.console);
        let secrets = self.secrets.clone();
        let envs = self.envs.clone();
        Box::new(move |line: &str| {
            let line = substitute_variables(line, &envs);
            console.write_line(&secrets.redact(&line));
        })
    }
}
