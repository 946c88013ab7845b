//! Append-only capture of inbound deliveries for offline debugging.
//!
//! Files land at `<dir>/<namespace>/<session>/<category>-<seq>.json`, where
//! the session is the process start time and the sequence is shared by all
//! namespaces. Every write is temp-file, fsync, rename, fsync-dir, so a
//! crash never leaves a half-written capture behind.
//!
//! Capture is best effort: failures are logged and swallowed.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};

/// How the main path handled a captured delivery.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CaptureOutcome {
    Accepted {
        event_type: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        canonical: Option<serde_json::Value>,
    },
    Ignored {
        event_type: String,
    },
    Rejected {
        reason: String,
    },
}

#[derive(Serialize)]
struct CaptureRecord<'a> {
    namespace: &'a str,
    category: &'a str,
    captured_at: String,
    headers: &'a BTreeMap<String, String>,
    body: serde_json::Value,
    outcome: &'a CaptureOutcome,
}

struct CaptureInner {
    dir: PathBuf,
    session: String,
    seq: AtomicU64,
}

/// Cloneable handle to the capture directory; a disabled sink is a no-op.
#[derive(Clone, Default)]
pub struct CaptureSink {
    inner: Option<Arc<CaptureInner>>,
}

impl CaptureSink {
    /// A sink writing under `dir`, with the session named after now.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        CaptureSink {
            inner: Some(Arc::new(CaptureInner {
                dir: dir.into(),
                session: Utc::now().format("%Y%m%d-%H%M%S").to_string(),
                seq: AtomicU64::new(0),
            })),
        }
    }

    pub fn disabled() -> Self {
        CaptureSink { inner: None }
    }

    /// Builds a sink from an optional directory.
    pub fn from_option(dir: Option<PathBuf>) -> Self {
        dir.map(CaptureSink::new).unwrap_or_default()
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Writes one capture file. Returns the path written, or `None` when
    /// disabled or the write failed.
    pub fn record(
        &self,
        namespace: &str,
        category: &str,
        headers: &BTreeMap<String, String>,
        body: &[u8],
        outcome: &CaptureOutcome,
    ) -> Option<PathBuf> {
        let inner = self.inner.as_ref()?;
        let seq = inner.seq.fetch_add(1, Ordering::Relaxed) + 1;

        let session_dir = inner.dir.join(sanitize(namespace)).join(&inner.session);
        let path = session_dir.join(format!("{}-{seq:04}.json", sanitize(category)));

        // Bodies that are not JSON are kept as text so the capture still parses.
        let body = serde_json::from_slice(body)
            .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(body).into()));
        let record = CaptureRecord {
            namespace,
            category,
            captured_at: Utc::now().to_rfc3339(),
            headers,
            body,
            outcome,
        };

        let result = serde_json::to_vec_pretty(&record)
            .map_err(io::Error::other)
            .and_then(|bytes| write_atomic(&session_dir, &path, &bytes));

        match result {
            Ok(()) => {
                debug!(path = %path.display(), "Captured webhook");
                Some(path)
            }
            Err(e) => {
                warn!(namespace, category, error = %e, "Failed to write webhook capture");
                None
            }
        }
    }

    /// Records on the blocking pool without waiting for the write.
    pub fn record_detached(
        &self,
        namespace: String,
        category: String,
        headers: BTreeMap<String, String>,
        body: Vec<u8>,
        outcome: CaptureOutcome,
    ) {
        if !self.is_enabled() {
            return;
        }
        let sink = self.clone();
        tokio::task::spawn_blocking(move || {
            sink.record(&namespace, &category, &headers, &body, &outcome);
        });
    }
}

/// Keeps path components to a safe character set.
fn sanitize(component: &str) -> String {
    let cleaned: String = component
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

fn write_atomic(dir: &Path, path: &Path, bytes: &[u8]) -> io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let temp_path = path.with_extension("json.tmp");
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&temp_path, path)?;
    // The rename is only durable once the directory entry is synced.
    File::open(dir)?.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn writes_sequenced_files_per_namespace() {
        let dir = tempdir().unwrap();
        let sink = CaptureSink::new(dir.path());
        let headers = BTreeMap::from([("x-gitlab-event".to_string(), "Note Hook".to_string())]);
        let outcome = CaptureOutcome::Ignored {
            event_type: "Push Hook".into(),
        };

        let first = sink
            .record("gitlab", "webhook", &headers, b"{\"a\":1}", &outcome)
            .unwrap();
        let second = sink
            .record("github", "webhook", &headers, b"not json", &outcome)
            .unwrap();

        assert!(first.ends_with("webhook-0001.json"));
        assert!(second.ends_with("webhook-0002.json"));
        assert!(first.starts_with(dir.path().join("gitlab")));
        assert!(second.starts_with(dir.path().join("github")));

        let saved: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&first).unwrap()).unwrap();
        assert_eq!(saved["body"]["a"], 1);
        assert_eq!(saved["outcome"]["status"], "ignored");

        let saved: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&second).unwrap()).unwrap();
        assert_eq!(saved["body"], "not json");
    }

    #[test]
    fn disabled_sink_writes_nothing() {
        let sink = CaptureSink::disabled();
        let outcome = CaptureOutcome::Rejected {
            reason: "x".into(),
        };
        assert!(
            sink.record("github", "webhook", &BTreeMap::new(), b"{}", &outcome)
                .is_none()
        );
    }

    #[test]
    fn unwritable_directory_is_swallowed() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();

        let sink = CaptureSink::new(&blocker);
        let outcome = CaptureOutcome::Rejected {
            reason: "x".into(),
        };
        assert!(
            sink.record("github", "webhook", &BTreeMap::new(), b"{}", &outcome)
                .is_none()
        );
    }

    #[test]
    fn namespace_is_sanitized() {
        assert_eq!(sanitize("../etc"), "___etc");
        assert_eq!(sanitize(""), "unknown");
    }
}
