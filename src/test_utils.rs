//! Shared test builders, a scripted model client, and proptest strategies.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use proptest::prelude::*;

use crate::batch::{CodeDiff, DiffHunk};
use crate::llm::LlmClient;
use crate::types::{Comment, Commit, ReviewComment, Severity, User};

pub fn comment(id: &str, username: &str, body: &str, created_at: &str) -> Comment {
    Comment {
        id: id.to_string(),
        body: body.to_string(),
        author: User::new(format!("u-{username}"), username),
        created_at: created_at.to_string(),
        ..Default::default()
    }
}

pub fn commit(sha: &str, message: &str, timestamp: &str) -> Commit {
    Commit {
        sha: sha.to_string(),
        message: message.to_string(),
        timestamp: timestamp.to_string(),
        ..Default::default()
    }
}

/// A single-hunk diff of `path` with `content` as the hunk body.
pub fn code_diff(path: &str, content: &str) -> CodeDiff {
    CodeDiff {
        file_path: path.to_string(),
        hunks: vec![DiffHunk {
            old_start: 1,
            old_lines: 1,
            new_start: 1,
            new_lines: content.lines().count() as u64,
            content: content.to_string(),
        }],
        ..Default::default()
    }
}

/// Model client that plays back a fixed script, one entry per call.
///
/// Calls past the end of the script fail.
pub struct ScriptedClient {
    script: Mutex<VecDeque<Result<String, String>>>,
    calls: AtomicUsize,
}

impl ScriptedClient {
    pub fn new(script: Vec<Result<&str, &str>>) -> Self {
        ScriptedClient {
            script: Mutex::new(
                script
                    .into_iter()
                    .map(|r| r.map(str::to_string).map_err(str::to_string))
                    .collect(),
            ),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl LlmClient for ScriptedClient {
    type Error = String;

    fn generate_response(
        &self,
        _prompt: &str,
    ) -> impl Future<Output = Result<String, Self::Error>> + Send {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err("script exhausted".to_string()));
        async move { next }
    }
}

pub fn arb_severity() -> impl Strategy<Value = Severity> {
    prop_oneof![
        Just(Severity::Critical),
        Just(Severity::Warning),
        Just(Severity::Info),
    ]
}

/// Comments over a small set of locations, so collisions are common.
pub fn arb_review_comment() -> impl Strategy<Value = ReviewComment> {
    (
        prop_oneof![Just(""), Just("src/a.rs"), Just("src/b.rs")],
        0u64..4,
        "[a-z ]{1,20}",
        arb_severity(),
        any::<bool>(),
    )
        .prop_map(|(file, line, content, severity, is_internal)| ReviewComment {
            file_path: file.to_string(),
            line,
            content,
            severity,
            category: String::new(),
            is_internal,
        })
}
