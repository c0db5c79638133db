use indexmap::IndexMap;

use super::PipelineError;
use crate::source::Frame;

/// One decoded upstream message: emoji code to count, in payload order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Event {
    counts: IndexMap<String, i64>,
}

impl Event {
    /// Decode the JSON object carried in a frame's data.
    pub fn from_frame(frame: &Frame) -> Result<Self, PipelineError> {
        Self::parse(&frame.data)
    }

    /// Decode a JSON object mapping codes to non-negative integers.
    pub fn parse(payload: &str) -> Result<Self, PipelineError> {
        let counts: IndexMap<String, i64> =
            serde_json::from_str(payload).map_err(|e| PipelineError::MalformedPayload {
                reason: format!("expected object of code to integer: {e}"),
            })?;

        if let Some((code, count)) = counts.iter().find(|(_, count)| **count < 0) {
            return Err(PipelineError::MalformedPayload {
                reason: format!("negative count {count} for code {code:?}"),
            });
        }

        Ok(Self { counts })
    }

    /// Iterate `(code, count)` pairs in payload order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.counts.iter().map(|(code, count)| (code.as_str(), *count))
    }

    /// Sum of all counts, saturating at `i64::MAX`.
    pub fn total(&self) -> i64 {
        self.counts
            .values()
            .fold(0i64, |acc, count| acc.saturating_add(*count))
    }

}
