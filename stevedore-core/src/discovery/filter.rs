//! Regex filtering of remote version names with a bounded evaluation time.

use crate::error::{Result, ServiceError};
use regex::{Regex, RegexBuilder};
use std::time::Duration;
use tracing::warn;

/// Per-entry match budget. An entry whose evaluation exceeds it is skipped.
pub const MATCH_TIMEOUT: Duration = Duration::from_millis(250);
/// Compiled program size cap for caller-supplied patterns.
const REGEX_SIZE_LIMIT: usize = 1 << 20;

pub fn compile(pattern: &str) -> Result<Regex> {
    RegexBuilder::new(pattern)
        .size_limit(REGEX_SIZE_LIMIT)
        .dfa_size_limit(REGEX_SIZE_LIMIT)
        .build()
        .map_err(|e| ServiceError::Discovery(format!("invalid filter {pattern:?}: {e}")))
}

/// Names matching `regex`, in input order. Each match runs off the async
/// runtime under [`MATCH_TIMEOUT`]; a timed-out entry counts as "did not match".
pub async fn select_bounded(regex: &Regex, names: Vec<String>) -> Vec<String> {
    let mut selected = Vec::with_capacity(names.len());
    for name in names {
        if matches_bounded(regex, &name, MATCH_TIMEOUT).await {
            selected.push(name);
        }
    }
    selected
}

pub async fn matches_bounded(regex: &Regex, text: &str, budget: Duration) -> bool {
    let regex = regex.clone();
    let owned = text.to_string();
    let task = tokio::task::spawn_blocking(move || regex.is_match(&owned));
    match tokio::time::timeout(budget, task).await {
        Ok(Ok(matched)) => matched,
        Ok(Err(e)) => {
            warn!(entry = %text, error = %e, "filter evaluation failed");
            false
        }
        Err(_) => {
            warn!(entry = %text, "filter evaluation timed out; skipping entry");
            false
        }
    }
}
