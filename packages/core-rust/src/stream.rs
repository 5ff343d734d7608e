//! Chunks emitted by streamed function calls.
//!
//! A stream is a finite sequence of `progress` and `data` chunks closed by
//! exactly one terminal chunk: `done` on success or `error` on failure.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorInfo;
use crate::operation::normalize_progress;

/// One unit of a streamed result, tagged by `type` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamChunk {
    Progress {
        progress: f64,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        message: Option<String>,
    },
    Data {
        data: Value,
    },
    Error {
        errors: Vec<ErrorInfo>,
    },
    Done {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        result: Option<Value>,
    },
}

impl StreamChunk {
    /// Progress chunk with the ratio clamped to `0.0..=1.0`.
    #[must_use]
    pub fn progress(progress: f64, message: Option<String>) -> Self {
        Self::Progress {
            progress: normalize_progress(progress),
            message,
        }
    }

    #[must_use]
    pub fn error(error: ErrorInfo) -> Self {
        Self::Error {
            errors: vec![error],
        }
    }

    /// `done` and `error` close the stream.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::Done { .. })
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Progress { .. } => "progress",
            Self::Data { .. } => "data",
            Self::Error { .. } => "error",
            Self::Done { .. } => "done",
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn chunks_are_tagged_by_type() {
        let chunk = StreamChunk::Data { data: json!([1, 2]) };
        assert_eq!(
            serde_json::to_value(&chunk).unwrap(),
            json!({"type": "data", "data": [1, 2]})
        );

        let done = StreamChunk::Done { result: None };
        assert_eq!(serde_json::to_value(&done).unwrap(), json!({"type": "done"}));
    }

    #[test]
    fn only_done_and_error_are_terminal() {
        assert!(!StreamChunk::progress(0.5, None).is_terminal());
        assert!(!StreamChunk::Data { data: Value::Null }.is_terminal());
        assert!(StreamChunk::Done { result: None }.is_terminal());
        assert!(StreamChunk::error(ErrorInfo::internal()).is_terminal());
    }

    #[test]
    fn progress_is_clamped() {
        let StreamChunk::Progress { progress, .. } = StreamChunk::progress(3.0, None) else {
            panic!("expected progress chunk");
        };
        assert!((progress - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn error_chunk_parses_back() {
        let chunk = StreamChunk::error(ErrorInfo::new(ErrorCode::DependencyError, "upstream"));
        let json = serde_json::to_string(&chunk).unwrap();
        let back: StreamChunk = serde_json::from_str(&json).unwrap();
        assert_eq!(back, chunk);
        assert_eq!(back.kind(), "error");
    }
}
