//! Fakes and a session harness for tests. Compiled under the `test-support`
//! feature, which the crate's own dev-dependency turns on.

use std::collections::HashMap;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};

use crate::console::ConsoleSink;
use crate::instruction::Instruction;
use crate::ports::{
    ArtifactRepository, BuildResult, HttpClient, HttpResponse, JobState, StatusReporter,
};
use crate::process::SystemProcessRunner;
use crate::session::{BuildSession, SessionContext};

/// Console sink that records every line.
#[derive(Default)]
pub struct InMemoryConsole {
    lines: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl InMemoryConsole {
    pub fn new() -> Self {
        InMemoryConsole::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().expect("console lock").clone()
    }

    /// Full output joined with newlines.
    pub fn output(&self) -> String {
        self.lines().join("\n")
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl ConsoleSink for InMemoryConsole {
    fn write_line(&self, line: &str) {
        self.lines.lock().expect("console lock").push(line.to_string());
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Reporter that records states and results instead of sending them.
#[derive(Default)]
pub struct RecordingReporter {
    states: Mutex<Vec<JobState>>,
    results: Mutex<Vec<BuildResult>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        RecordingReporter::default()
    }

    pub fn states(&self) -> Vec<JobState> {
        self.states.lock().expect("reporter lock").clone()
    }

    pub fn results(&self) -> Vec<BuildResult> {
        self.results.lock().expect("reporter lock").clone()
    }
}

impl StatusReporter for RecordingReporter {
    fn report_state(&self, state: JobState) -> Result<()> {
        self.states.lock().expect("reporter lock").push(state);
        Ok(())
    }

    fn report_result(&self, result: BuildResult) -> Result<()> {
        self.results.lock().expect("reporter lock").push(result);
        Ok(())
    }
}

/// Repository that records uploads and properties.
#[derive(Default)]
pub struct RecordingRepository {
    uploads: Mutex<Vec<(PathBuf, String)>>,
    properties: Mutex<Vec<(String, String)>>,
}

impl RecordingRepository {
    pub fn new() -> Self {
        RecordingRepository::default()
    }

    pub fn uploads(&self) -> Vec<(PathBuf, String)> {
        self.uploads.lock().expect("repository lock").clone()
    }

    pub fn properties(&self) -> Vec<(String, String)> {
        self.properties.lock().expect("repository lock").clone()
    }
}

impl ArtifactRepository for RecordingRepository {
    fn upload(&self, file: &std::path::Path, dest: &str) -> Result<()> {
        self.uploads
            .lock()
            .expect("repository lock")
            .push((file.to_path_buf(), dest.to_string()));
        Ok(())
    }

    fn set_property(&self, name: &str, value: &str) -> Result<()> {
        self.properties
            .lock()
            .expect("repository lock")
            .push((name.to_string(), value.to_string()));
        Ok(())
    }
}

/// HTTP client answering from a scripted url-to-response table. An
/// unscripted url behaves like a transport failure.
#[derive(Default)]
pub struct ScriptedHttp {
    responses: Mutex<HashMap<String, (u16, Vec<u8>)>>,
    requests: Mutex<Vec<String>>,
}

impl ScriptedHttp {
    pub fn new() -> Self {
        ScriptedHttp::default()
    }

    pub fn respond(&self, url: &str, status: u16, body: &[u8]) {
        self.responses
            .lock()
            .expect("http lock")
            .insert(url.to_string(), (status, body.to_vec()));
    }

    /// Every url requested so far, in order.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().expect("http lock").clone()
    }
}

impl HttpClient for ScriptedHttp {
    fn get(&self, url: &str) -> Result<HttpResponse> {
        self.requests.lock().expect("http lock").push(url.to_string());
        let responses = self.responses.lock().expect("http lock");
        let (status, body) = responses
            .get(url)
            .ok_or_else(|| anyhow!("no scripted response for {url}"))?;
        Ok(HttpResponse {
            status: *status,
            body: Box::new(Cursor::new(body.clone())),
        })
    }
}

/// A ready-to-run session wired to fakes, with a throwaway sandbox.
pub struct SessionHarness {
    pub console: Arc<InMemoryConsole>,
    pub reporter: Arc<RecordingReporter>,
    pub repository: Arc<RecordingRepository>,
    pub http: Arc<ScriptedHttp>,
    pub sandbox: tempfile::TempDir,
    pub session: BuildSession,
}

impl SessionHarness {
    pub fn new() -> Self {
        let console = Arc::new(InMemoryConsole::new());
        let reporter = Arc::new(RecordingReporter::new());
        let repository = Arc::new(RecordingRepository::new());
        let http = Arc::new(ScriptedHttp::new());
        let sandbox = tempfile::tempdir().expect("sandbox tempdir");

        let session = BuildSession::new(SessionContext {
            console: console.clone(),
            repository: repository.clone(),
            reporter: reporter.clone(),
            http: http.clone(),
            runner: Arc::new(SystemProcessRunner),
            sandbox: sandbox.path().to_path_buf(),
            envs: std::collections::BTreeMap::new(),
            poll_interval: crate::process::DEFAULT_POLL_INTERVAL,
        });

        SessionHarness {
            console,
            reporter,
            repository,
            http,
            sandbox,
            session,
        }
    }

    pub fn execute(&mut self, root: &Instruction) -> BuildResult {
        self.session.execute(root)
    }
}

impl Default for SessionHarness {
    fn default() -> Self {
        SessionHarness::new()
    }
}
