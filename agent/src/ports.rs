//! Collaborator interfaces consumed by the session, with the local/default
//! implementations used by the CLI. Tests substitute the fakes from
//! [`crate::test_support`].

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result, anyhow};
use tracing::info;

/// Terminal outcome of one build execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildResult {
    Passed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for BuildResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildResult::Passed => f.write_str("Passed"),
            BuildResult::Failed => f.write_str("Failed"),
            BuildResult::Cancelled => f.write_str("Cancelled"),
        }
    }
}

/// Job phase forwarded by `reportCurrentStatus`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    Preparing,
    Building,
    Completing,
    Completed,
}

impl FromStr for JobState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Preparing" => Ok(JobState::Preparing),
            "Building" => Ok(JobState::Building),
            "Completing" => Ok(JobState::Completing),
            "Completed" => Ok(JobState::Completed),
            other => Err(anyhow!("unknown job state '{other}'")),
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Preparing => f.write_str("Preparing"),
            JobState::Building => f.write_str("Building"),
            JobState::Completing => f.write_str("Completing"),
            JobState::Completed => f.write_str("Completed"),
        }
    }
}

/// Server-side artifact store.
pub trait ArtifactRepository: Send + Sync {
    fn upload(&self, file: &Path, dest: &str) -> Result<()>;
    fn set_property(&self, name: &str, value: &str) -> Result<()>;
}

/// Phase/result reporting back to the coordinator.
pub trait StatusReporter: Send + Sync {
    fn report_state(&self, state: JobState) -> Result<()>;
    fn report_result(&self, result: BuildResult) -> Result<()>;
}

/// Body of a fetched resource. Statuses >= 400 carry whatever error body the
/// server returned.
pub struct HttpResponse {
    pub status: u16,
    pub body: Box<dyn Read + Send>,
}

/// Blocking HTTP fetch used by the transfer layer.
pub trait HttpClient: Send + Sync {
    fn get(&self, url: &str) -> Result<HttpResponse>;
}

/// Default [`HttpClient`] backed by ureq.
pub struct UreqHttpClient;

impl HttpClient for UreqHttpClient {
    fn get(&self, url: &str) -> Result<HttpResponse> {
        match ureq::get(url).call() {
            Ok(response) => Ok(HttpResponse {
                status: response.status(),
                body: Box::new(response.into_reader()),
            }),
            Err(ureq::Error::Status(status, response)) => Ok(HttpResponse {
                status,
                body: Box::new(response.into_reader()),
            }),
            Err(err) => Err(err).with_context(|| format!("fetch {url}")),
        }
    }
}

/// Repository that stores artifacts and properties under a local directory.
/// Stands in for the remote store when the CLI runs a tree without a server.
pub struct LocalArtifactRepository {
    root: PathBuf,
}

impl LocalArtifactRepository {
    pub fn new(root: PathBuf) -> Self {
        LocalArtifactRepository { root }
    }

    fn copy_recursively(src: &Path, dest: &Path) -> Result<()> {
        if src.is_dir() {
            fs::create_dir_all(dest).with_context(|| format!("create {}", dest.display()))?;
            for entry in fs::read_dir(src).with_context(|| format!("read {}", src.display()))? {
                let entry = entry.with_context(|| format!("read {}", src.display()))?;
                Self::copy_recursively(&entry.path(), &dest.join(entry.file_name()))?;
            }
            return Ok(());
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::copy(src, dest)
            .with_context(|| format!("copy {} to {}", src.display(), dest.display()))?;
        Ok(())
    }
}

impl ArtifactRepository for LocalArtifactRepository {
    fn upload(&self, file: &Path, dest: &str) -> Result<()> {
        let name = file
            .file_name()
            .ok_or_else(|| anyhow!("artifact {} has no file name", file.display()))?;
        let target = self.root.join(dest).join(name);
        Self::copy_recursively(file, &target)
    }

    fn set_property(&self, name: &str, value: &str) -> Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("create {}", self.root.display()))?;
        let path = self.root.join("build.properties");
        let mut contents = fs::read_to_string(&path).unwrap_or_default();
        contents.push_str(&format!("{name}={value}\n"));
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }
}

/// Reporter that logs transitions instead of talking to a coordinator.
pub struct LogStatusReporter;

impl StatusReporter for LogStatusReporter {
    fn report_state(&self, state: JobState) -> Result<()> {
        info!(state = %state, "job state");
        Ok(())
    }

    fn report_result(&self, result: BuildResult) -> Result<()> {
        info!(result = %result, "job result");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_state_parses_known_values_only() {
        assert_eq!(
            "Preparing".parse::<JobState>().expect("parse"),
            JobState::Preparing
        );
        assert!("Sleeping".parse::<JobState>().is_err());
    }

    #[test]
    fn local_repository_uploads_under_dest_path() {
        let temp = tempfile::tempdir().expect("tempdir");
        let file = temp.path().join("report.txt");
        fs::write(&file, "totals").expect("write artifact");

        let repository = LocalArtifactRepository::new(temp.path().join("store"));
        repository.upload(&file, "testoutput").expect("upload");

        let stored = temp.path().join("store/testoutput/report.txt");
        assert_eq!(fs::read_to_string(stored).expect("read"), "totals");
    }

    #[test]
    fn local_repository_appends_properties() {
        let temp = tempfile::tempdir().expect("tempdir");
        let repository = LocalArtifactRepository::new(temp.path().to_path_buf());
        repository.set_property("coverage", "81").expect("set");
        repository.set_property("branch", "main").expect("set");

        let contents =
            fs::read_to_string(temp.path().join("build.properties")).expect("read properties");
        assert_eq!(contents, "coverage=81\nbranch=main\n");
    }
}
