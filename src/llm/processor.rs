//! Turns raw model output into a typed value: extract, repair, parse.

use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, warn};

use super::extract::extract_json;
use super::repair::{RepairError, RepairStats, repair_json};

const LOG_EXCERPT: usize = 200;

/// A parsed response and the JSON it was parsed from.
#[derive(Debug, Clone)]
pub struct Processed<T> {
    pub value: T,
    pub repaired_json: String,
    pub stats: RepairStats,
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("no JSON found in response")]
    NoJson,
    #[error(transparent)]
    Repair(#[from] RepairError),
    #[error("JSON parsing failed after repair: {source}")]
    Parse {
        source: serde_json::Error,
        stats: RepairStats,
    },
}

impl ProcessError {
    /// Repair statistics, when the response got as far as repair.
    pub fn stats(&self) -> Option<&RepairStats> {
        match self {
            ProcessError::NoJson => None,
            ProcessError::Repair(e) => Some(&e.stats),
            ProcessError::Parse { stats, .. } => Some(stats),
        }
    }
}

fn excerpt(text: &str) -> &str {
    match text.char_indices().nth(LOG_EXCERPT) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

/// Extracts the JSON payload from `raw`, repairs it if needed and parses it
/// into `T`.
pub fn process_llm_response<T: DeserializeOwned>(raw: &str) -> Result<Processed<T>, ProcessError> {
    debug!(bytes = raw.len(), "Processing model response");

    let Some(json) = extract_json(raw) else {
        warn!(response = excerpt(raw), "No JSON found in model response");
        return Err(ProcessError::NoJson);
    };

    let repaired = repair_json(json).inspect_err(|e| {
        warn!(error = %e, json = excerpt(&e.partial), "JSON repair failed");
    })?;
    let stats = repaired.stats;
    if stats.was_repaired {
        debug!(
            strategies = %stats.strategies.join(", "),
            errors_fixed = stats.errors_fixed,
            comments_lost = stats.comments_lost,
            original_bytes = stats.original_bytes,
            repaired_bytes = stats.repaired_bytes,
            "JSON repair applied"
        );
    }

    match serde_json::from_str(&repaired.json) {
        Ok(value) => Ok(Processed {
            value,
            repaired_json: repaired.json,
            stats,
        }),
        Err(source) => {
            warn!(error = %source, json = excerpt(&repaired.json), "Repaired JSON does not fit the target type");
            Err(ProcessError::Parse { source, stats })
        }
    }
}
