//! Fetch handlers: where downloaded bytes go and how they are verified.
//!
//! A [`FileHandler`] streams a single artifact to its destination file; a
//! [`DirHandler`] consumes a zip stream, extracting and hashing each entry in
//! one pass. Both verify against the checksum manifest when one is present
//! and degrade to an unverified download with a console warning otherwise.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use md5::{Digest, Md5};
use tracing::debug;

use super::checksum::ChecksumManifest;

/// What a handler did with the body.
pub struct HandlerOutcome {
    pub success: bool,
    pub bytes_written: u64,
    pub verified: bool,
}

/// Consumes the HTTP body of an artifact download.
pub trait FetchHandler {
    /// Existing destination file, if any; its content hash keys the
    /// alternate-URL attempt.
    fn existing_file(&self) -> Option<PathBuf>;

    fn handle(
        &mut self,
        body: &mut dyn Read,
        manifest: Option<&ChecksumManifest>,
        console: &dyn Fn(&str),
    ) -> Result<HandlerOutcome>;
}

/// Streams a single file to `dest`, hashing it in the same pass.
pub struct FileHandler {
    dest: PathBuf,
    /// Repository-relative source path; keys the manifest lookup.
    src: Option<String>,
}

impl FileHandler {
    pub fn new(dest: PathBuf, src: Option<String>) -> Self {
        FileHandler { dest, src }
    }
}

impl FetchHandler for FileHandler {
    fn existing_file(&self) -> Option<PathBuf> {
        self.dest.is_file().then(|| self.dest.clone())
    }

    fn handle(
        &mut self,
        body: &mut dyn Read,
        manifest: Option<&ChecksumManifest>,
        console: &dyn Fn(&str),
    ) -> Result<HandlerOutcome> {
        if let Some(parent) = self.dest.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let mut out = File::create(&self.dest)
            .with_context(|| format!("create {}", self.dest.display()))?;
        let (bytes_written, actual_md5) = copy_hashed(body, &mut out)
            .with_context(|| format!("write {}", self.dest.display()))?;
        debug!(bytes = bytes_written, dest = %self.dest.display(), "artifact written");

        let lookup_key = self.src.as_deref().unwrap_or_default();
        let verified = match manifest.and_then(|m| m.md5_for(lookup_key)) {
            Some(expected) if expected == actual_md5 => true,
            Some(expected) => {
                console(&format!(
                    "[ERROR] Verification of the integrity of the artifact [{lookup_key}] failed. Expected md5 [{expected}] but was [{actual_md5}]."
                ));
                return Ok(HandlerOutcome {
                    success: false,
                    bytes_written,
                    verified: false,
                });
            }
            None => {
                warn_unverified(console, lookup_key, manifest);
                false
            }
        };

        console(&saved_message(&self.dest, verified));
        Ok(HandlerOutcome {
            success: true,
            bytes_written,
            verified,
        })
    }
}

/// Streams a zip of a directory artifact, extracting under `dest` and
/// verifying each entry against `<parent-of-src>/<entry-path>`.
pub struct DirHandler {
    src: String,
    dest: PathBuf,
}

impl DirHandler {
    pub fn new(src: String, dest: PathBuf) -> Self {
        DirHandler { src, dest }
    }

    fn manifest_key(&self, entry_name: &str) -> String {
        match Path::new(&self.src).parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                format!("{}/{entry_name}", parent.display())
            }
            _ => entry_name.to_string(),
        }
    }
}

impl FetchHandler for DirHandler {
    fn existing_file(&self) -> Option<PathBuf> {
        // Directory artifacts are always re-fetched whole.
        None
    }

    fn handle(
        &mut self,
        body: &mut dyn Read,
        manifest: Option<&ChecksumManifest>,
        console: &dyn Fn(&str),
    ) -> Result<HandlerOutcome> {
        fs::create_dir_all(&self.dest)
            .with_context(|| format!("create {}", self.dest.display()))?;

        let mut bytes_written = 0u64;
        let mut unverified_entries = 0usize;
        let mut saw_entry = false;
        let mut stream = body;

        while let Some(mut entry) =
            zip::read::read_zipfile_from_stream(&mut stream).context("read zip stream")?
        {
            let entry_name = entry.name().to_string();
            let relative = entry
                .enclosed_name()
                .map(Path::to_path_buf)
                .ok_or_else(|| anyhow!("zip entry '{entry_name}' escapes the destination"))?;
            if entry.is_dir() {
                fs::create_dir_all(self.dest.join(&relative))
                    .with_context(|| format!("create {}", relative.display()))?;
                continue;
            }
            saw_entry = true;

            let target = self.dest.join(&relative);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create {}", parent.display()))?;
            }
            let mut out =
                File::create(&target).with_context(|| format!("create {}", target.display()))?;
            let (entry_bytes, actual_md5) = copy_hashed(&mut entry, &mut out)
                .with_context(|| format!("write {}", target.display()))?;
            bytes_written += entry_bytes;

            let key = self.manifest_key(&entry_name);
            match manifest.and_then(|m| m.md5_for(&key)) {
                Some(expected) if expected == actual_md5 => {}
                Some(expected) => {
                    console(&format!(
                        "[ERROR] Verification of the integrity of the artifact [{key}] failed. Expected md5 [{expected}] but was [{actual_md5}]."
                    ));
                    return Ok(HandlerOutcome {
                        success: false,
                        bytes_written,
                        verified: false,
                    });
                }
                None => {
                    warn_unverified(console, &key, manifest);
                    unverified_entries += 1;
                }
            }
        }

        if !saw_entry {
            console(&format!(
                "[WARN] The artifact zip for [{}] contained no files.",
                self.src
            ));
        }
        let verified = manifest.is_some() && unverified_entries == 0 && saw_entry;
        console(&saved_message(&self.dest, verified));
        Ok(HandlerOutcome {
            success: true,
            bytes_written,
            verified,
        })
    }
}

fn saved_message(dest: &Path, verified: bool) -> String {
    if verified {
        format!(
            "Saved artifact to [{}] after verifying the integrity of its contents.",
            dest.display()
        )
    } else {
        format!(
            "Saved artifact to [{}] without verifying the integrity of its contents.",
            dest.display()
        )
    }
}

fn warn_unverified(console: &dyn Fn(&str), path: &str, manifest: Option<&ChecksumManifest>) {
    if manifest.is_some() {
        console(&format!(
            "[WARN] The md5checksum value of the artifact [{path}] was not found on the server. The agent could not verify the integrity of its contents."
        ));
    }
}

/// Copies `reader` to `writer`, returning bytes copied and the MD5 hex digest
/// computed in the same pass.
fn copy_hashed(reader: &mut dyn Read, writer: &mut dyn Write) -> std::io::Result<(u64, String)> {
    let mut hasher = Md5::new();
    let mut total = 0u64;
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        hasher.update(&chunk[..n]);
        writer.write_all(&chunk[..n])?;
        total += n as u64;
    }
    Ok((total, format!("{:x}", hasher.finalize())))
}
