//! Fetch opcodes: `downloadFile` and `downloadDir`.

use std::io::Read;
use std::path::Path;

use tracing::warn;

use super::resolve_path;
use crate::instruction::Instruction;
use crate::session::{BuildSession, Interrupt, StepResult};
use crate::transfer::checksum::ChecksumManifest;
use crate::transfer::handler::{DirHandler, FetchHandler, FileHandler};
use crate::transfer::{self, TransferResult};

pub(crate) fn download_file(
    session: &mut BuildSession,
    node: &Instruction,
    wd: &Path,
) -> StepResult {
    let (url, src, dest) = required_args(node)?;
    let mut handler = FileHandler::new(resolve_path(wd, &dest), Some(src));
    run_download(session, node, &url, &mut handler)
}

pub(crate) fn download_dir(session: &mut BuildSession, node: &Instruction, wd: &Path) -> StepResult {
    let (url, src, dest) = required_args(node)?;
    let mut handler = DirHandler::new(src, resolve_path(wd, &dest));
    run_download(session, node, &url, &mut handler)
}

fn run_download(
    session: &mut BuildSession,
    node: &Instruction,
    url: &str,
    handler: &mut dyn FetchHandler,
) -> StepResult {
    let manifest = node
        .arg("checksumUrl")
        .and_then(|checksum_url| fetch_manifest(session, checksum_url));

    let on_line = session.sink();
    let console = |line: &str| on_line(line);
    let coordinator = session.coordinator();
    match transfer::download(
        &*session.http,
        url,
        handler,
        manifest.as_ref(),
        &coordinator,
        &console,
    ) {
        Ok(TransferResult { success: true, .. }) => Ok(true),
        Ok(_) => {
            session.println_prefixed(&format!("Could not fetch artifact {url}."));
            Ok(false)
        }
        Err(error) => {
            warn!(%error, url, "artifact download failed");
            session.println_prefixed(&format!("Could not fetch artifact {url}."));
            Ok(false)
        }
    }
}

/// Best effort: a missing or unreadable manifest downgrades the transfer to
/// unverified rather than failing it.
fn fetch_manifest(session: &BuildSession, checksum_url: &str) -> Option<ChecksumManifest> {
    let failure = |detail: String| {
        warn!(url = checksum_url, detail, "could not fetch checksum manifest");
        session.println_prefixed(&format!(
            "[WARN] Could not fetch artifact checksums from {checksum_url}. Artifact integrity will not be verified."
        ));
        None
    };

    let mut response = match session.http.get(checksum_url) {
        Ok(response) => response,
        Err(error) => return failure(format!("{error:#}")),
    };
    if response.status >= 400 {
        return failure(format!("status {}", response.status));
    }
    let mut body = String::new();
    if let Err(error) = response.body.read_to_string(&mut body) {
        return failure(format!("{error:#}"));
    }
    Some(ChecksumManifest::parse(&body))
}

fn required_args(node: &Instruction) -> Result<(String, String, String), Interrupt> {
    let Some(url) = node.arg("url") else {
        return Err(Interrupt::Config(format!(
            "download url is missing: {node:?}"
        )));
    };
    let Some(src) = node.arg("src") else {
        return Err(Interrupt::Config(format!(
            "download src is missing: {node:?}"
        )));
    };
    let dest = node
        .arg("dest")
        .map(str::to_string)
        .or_else(|| {
            Path::new(src)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
        })
        .ok_or_else(|| Interrupt::Config(format!("download dest is missing: {node:?}")))?;
    Ok((url.to_string(), src.to_string(), dest))
}
