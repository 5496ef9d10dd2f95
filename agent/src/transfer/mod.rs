//! Artifact transfer: checksum manifests, fetch handlers, and the download
//! protocol that ties them to an [`HttpClient`](crate::ports::HttpClient).

pub mod checksum;
pub mod handler;

use std::fs::File;
use std::io::Read;

use anyhow::{Context, Result};
use sha1::{Digest, Sha1};
use tracing::debug;

use crate::cancel::CancellationCoordinator;
use crate::ports::HttpClient;
use checksum::ChecksumManifest;
use handler::FetchHandler;

/// Result of a completed download attempt.
#[derive(Debug)]
pub struct TransferResult {
    pub success: bool,
    pub bytes_written: u64,
    pub verified_checksum: bool,
}

/// Downloads `url` into `handler`.
///
/// When the handler already has a destination file, the first attempt carries
/// a `sha1` query parameter with the hex digest of the existing content so the
/// server can skip an unchanged artifact. If that attempt fails at the HTTP
/// level, the plain URL is retried once. A response status of 400 or above
/// fails the download.
///
/// The body is read through a cancellation check so a pending cancel aborts
/// the transfer between chunks instead of waiting for it to finish.
pub fn download(
    http: &dyn HttpClient,
    url: &str,
    handler: &mut dyn FetchHandler,
    manifest: Option<&ChecksumManifest>,
    coordinator: &CancellationCoordinator,
    console: &dyn Fn(&str),
) -> Result<TransferResult> {
    let alternate = handler
        .existing_file()
        .and_then(|path| sha1_of_file(&path).ok())
        .map(|digest| append_query(url, "sha1", &digest));

    let mut response = match alternate {
        Some(ref first) => match http.get(first) {
            Ok(response) => response,
            Err(error) => {
                debug!(url = %first, %error, "alternate fetch failed, retrying plain url");
                http.get(url).with_context(|| format!("fetch {url}"))?
            }
        },
        None => http.get(url).with_context(|| format!("fetch {url}"))?,
    };

    if response.status >= 400 {
        console(&format!(
            "Artifact download from {url} failed with status {}.",
            response.status
        ));
        return Ok(TransferResult {
            success: false,
            bytes_written: 0,
            verified_checksum: false,
        });
    }

    let mut body = CancelAwareBody {
        inner: response.body,
        coordinator,
    };
    let outcome = handler.handle(&mut body, manifest, console)?;
    Ok(TransferResult {
        success: outcome.success,
        bytes_written: outcome.bytes_written,
        verified_checksum: outcome.verified,
    })
}

// Checks for a pending cancel before every chunk of the response body.
struct CancelAwareBody<'a> {
    inner: Box<dyn Read + Send>,
    coordinator: &'a CancellationCoordinator,
}

impl Read for CancelAwareBody<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.coordinator.interrupt_pending() {
            return Err(std::io::Error::other("download cancelled"));
        }
        self.inner.read(buf)
    }
}

fn append_query(url: &str, key: &str, value: &str) -> String {
    if url.contains('?') {
        format!("{url}&{key}={value}")
    } else {
        format!("{url}?{key}={value}")
    }
}

fn sha1_of_file(path: &std::path::Path) -> Result<String> {
    let mut file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut hasher = Sha1::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = file.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        hasher.update(&chunk[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::HttpResponse;
    use crate::test_support::ScriptedHttp;
    use handler::FileHandler;
    use std::fs;
    use std::time::Duration;

    fn idle_coordinator() -> CancellationCoordinator {
        CancellationCoordinator::new()
    }

    #[test]
    fn plain_download_writes_destination() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dest = temp.path().join("a.txt");
        let http = ScriptedHttp::new();
        http.respond("http://server/files/a.txt", 200, b"content for a");

        let mut handler = FileHandler::new(dest.clone(), Some("a.txt".to_string()));
        let result = download(
            &http,
            "http://server/files/a.txt",
            &mut handler,
            None,
            &idle_coordinator(),
            &|_| {},
        )
        .expect("download");

        assert!(result.success);
        assert_eq!(result.bytes_written, 13);
        assert_eq!(fs::read_to_string(dest).expect("read"), "content for a");
    }

    #[test]
    fn existing_destination_sends_sha1_alternate_first() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dest = temp.path().join("a.txt");
        fs::write(&dest, "old content").expect("seed");
        let sha1 = sha1_of_file(&dest).expect("sha1");

        let http = ScriptedHttp::new();
        let alternate = format!("http://server/files/a.txt?sha1={sha1}");
        http.respond(&alternate, 200, b"content for a");

        let mut handler = FileHandler::new(dest, Some("a.txt".to_string()));
        let result = download(
            &http,
            "http://server/files/a.txt",
            &mut handler,
            None,
            &idle_coordinator(),
            &|_| {},
        )
        .expect("download");

        assert!(result.success);
        assert_eq!(http.requests(), vec![alternate]);
    }

    #[test]
    fn alternate_failure_falls_back_to_plain_url_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dest = temp.path().join("a.txt");
        fs::write(&dest, "old content").expect("seed");

        let http = ScriptedHttp::new();
        http.respond("http://server/files/a.txt", 200, b"content for a");

        let mut handler = FileHandler::new(dest.clone(), Some("a.txt".to_string()));
        let result = download(
            &http,
            "http://server/files/a.txt",
            &mut handler,
            None,
            &idle_coordinator(),
            &|_| {},
        )
        .expect("download");

        assert!(result.success);
        assert_eq!(fs::read_to_string(dest).expect("read"), "content for a");
        assert_eq!(http.requests().len(), 2);
    }

    #[test]
    fn http_error_status_fails_the_download() {
        let temp = tempfile::tempdir().expect("tempdir");
        let http = ScriptedHttp::new();
        http.respond("http://server/files/missing.txt", 404, b"not found");

        let lines = std::sync::Mutex::new(Vec::new());
        let mut handler =
            FileHandler::new(temp.path().join("missing.txt"), Some("missing.txt".to_string()));
        let result = download(
            &http,
            "http://server/files/missing.txt",
            &mut handler,
            None,
            &idle_coordinator(),
            &|l| lines.lock().expect("lines").push(l.to_string()),
        )
        .expect("download");

        assert!(!result.success);
        assert!(lines.lock().expect("lines").join("\n").contains("status 404"));
    }

    // Body that never ends, standing in for a stalled or huge transfer.
    struct EndlessBody;

    impl Read for EndlessBody {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            buf.fill(0);
            Ok(buf.len())
        }
    }

    struct EndlessHttp;

    impl HttpClient for EndlessHttp {
        fn get(&self, _url: &str) -> Result<HttpResponse> {
            Ok(HttpResponse {
                status: 200,
                body: Box::new(EndlessBody),
            })
        }
    }

    #[test]
    fn pending_cancel_aborts_a_streaming_download() {
        let temp = tempfile::tempdir().expect("tempdir");
        let coordinator = CancellationCoordinator::new();
        coordinator.start();
        assert!(!coordinator.cancel(Duration::from_millis(10)));

        let mut handler =
            FileHandler::new(temp.path().join("big.bin"), Some("big.bin".to_string()));
        let err = download(
            &EndlessHttp,
            "http://server/files/big.bin",
            &mut handler,
            None,
            &coordinator,
            &|_| {},
        )
        .expect_err("download should abort");
        assert!(format!("{err:#}").contains("download cancelled"));
    }
}
