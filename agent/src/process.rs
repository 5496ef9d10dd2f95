//! Cancellable external-process execution with streamed output.
//!
//! Output is read on dedicated threads and fed line-by-line through a channel
//! so the caller can stream it to the build console without risking pipe
//! deadlocks. The child is parked in the cancellation coordinator's process
//! slot; a control thread's `cancel()` kills it there, which the polling loop
//! observes as process exit.

use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::cancel::CancellationCoordinator;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(20);

// How long to wait for trailing output after the child has been reaped. A
// forked payload can keep the pipe write-ends open past the child's death,
// so the drain must not wait for EOF unconditionally.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Parameters for one external command invocation.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Program to run.
    pub command: String,
    /// Remaining argv entries.
    pub args: Vec<String>,
    /// Resolved working directory; must exist.
    pub working_dir: PathBuf,
    /// Session env table, overlaid on the agent's own environment.
    pub env: Vec<(String, String)>,
    /// How often to poll the child for exit while draining output.
    pub poll_interval: Duration,
}

/// Abstraction over external process execution.
pub trait ProcessRunner: Send + Sync {
    /// Runs the command, streaming each output line through `on_line`.
    /// Returns the exit code (-1 when terminated by a signal).
    fn run(
        &self,
        request: &ExecRequest,
        on_line: &(dyn Fn(&str) + Send + Sync),
        coordinator: &CancellationCoordinator,
    ) -> Result<i32>;
}

/// [`ProcessRunner`] backed by `std::process`.
pub struct SystemProcessRunner;

impl ProcessRunner for SystemProcessRunner {
    #[instrument(skip_all, fields(command = %request.command))]
    fn run(
        &self,
        request: &ExecRequest,
        on_line: &(dyn Fn(&str) + Send + Sync),
        coordinator: &CancellationCoordinator,
    ) -> Result<i32> {
        let mut cmd = Command::new(&request.command);
        cmd.args(&request.args)
            .current_dir(&request.working_dir)
            .envs(request.env.iter().cloned())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Lead a fresh process group so cancellation can signal the command
        // together with anything it forked.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        debug!("spawning build process");
        let mut child = cmd.spawn().context("spawn command")?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr was not piped"))?;

        let (tx, rx) = mpsc::channel::<String>();
        let stdout_handle = spawn_line_reader(stdout, tx.clone());
        let stderr_handle = spawn_line_reader(stderr, tx);

        coordinator.register_process(child);

        let status = loop {
            drain_pending(&rx, on_line);
            match coordinator.poll_process()? {
                Some(status) => break status,
                None => thread::sleep(request.poll_interval),
            }
        };
        coordinator.clear_process();

        drain_remaining(&rx, on_line);
        drop(rx);
        finish_reader(stdout_handle)?;
        finish_reader(stderr_handle)?;

        let code = status.code().unwrap_or(-1);
        debug!(exit_code = code, "build process finished");
        Ok(code)
    }
}

fn spawn_line_reader<R: Read + Send + 'static>(
    reader: R,
    tx: Sender<String>,
) -> thread::JoinHandle<Result<()>> {
    thread::spawn(move || {
        let mut buffered = BufReader::new(reader);
        let mut raw = Vec::new();
        loop {
            raw.clear();
            let n = buffered.read_until(b'\n', &mut raw).context("read output")?;
            if n == 0 {
                return Ok(());
            }
            let line = String::from_utf8_lossy(&raw);
            // Send fails only when the consumer is gone; stop reading then.
            if tx.send(line.trim_end_matches(['\n', '\r']).to_string()).is_err() {
                return Ok(());
            }
        }
    })
}

fn drain_pending(rx: &Receiver<String>, on_line: &(dyn Fn(&str) + Send + Sync)) {
    while let Ok(line) = rx.try_recv() {
        on_line(&line);
    }
}

// Collects trailing output until both readers disconnect or the deadline
// passes, whichever comes first.
fn drain_remaining(rx: &Receiver<String>, on_line: &(dyn Fn(&str) + Send + Sync)) {
    let deadline = Instant::now() + OUTPUT_DRAIN_TIMEOUT;
    loop {
        let remaining = match deadline.checked_duration_since(Instant::now()) {
            Some(remaining) if !remaining.is_zero() => remaining,
            _ => return,
        };
        match rx.recv_timeout(remaining) {
            Ok(line) => on_line(&line),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => return,
        }
    }
}

fn finish_reader(handle: thread::JoinHandle<Result<()>>) -> Result<()> {
    if !handle.is_finished() {
        // A reader still blocked here holds a pipe kept open by an escaped
        // descendant. Its send will fail once a line arrives, so the thread
        // exits on its own; do not block the build on it.
        warn!("output pipe still open after process exit, detaching reader");
        return Ok(());
    }
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}
