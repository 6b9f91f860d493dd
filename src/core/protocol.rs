//! Result side-channel carried in a runner's output stream.
//!
//! The runner prints ordinary log text and, as its last meaningful line, a
//! single marker line such as
//!
//! ```text
//! __RESULT__:{"status": "success", "output_dir": "/workspace/out/model-AWQ"}
//! ```
//!
//! Everything else in the stream is plain log output.

use serde::{Deserialize, Serialize};

/// Prefix that marks a machine-readable result line
pub const RESULT_MARKER: &str = "__RESULT__:";

const UNKNOWN_ERROR: &str = "Unknown error";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RunResult {
    Success {
        output_dir: String,
    },
    Error {
        #[serde(default = "unknown_error")]
        message: String,
    },
}

fn unknown_error() -> String {
    UNKNOWN_ERROR.to_string()
}

/// How the log pump should treat one line of runner output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    /// A well-formed result payload
    Result(RunResult),
    /// Marker present but payload unusable; the line is dropped
    Malformed,
    /// Ordinary log text
    Plain,
}

/// Classify a single line (without its trailing newline).
pub fn classify_line(line: &str) -> Line {
    match line.strip_prefix(RESULT_MARKER) {
        None => Line::Plain,
        Some(payload) => match serde_json::from_str::<RunResult>(payload) {
            Ok(result) => Line::Result(result),
            Err(e) => {
                tracing::debug!("Dropping malformed result line: {}", e);
                Line::Malformed
            }
        },
    }
}

/// Decode a result line, `None` for anything that is not a valid result.
pub fn decode_line(line: &str) -> Option<RunResult> {
    match classify_line(line) {
        Line::Result(result) => Some(result),
        Line::Malformed | Line::Plain => None,
    }
}

/// Render the single marker line a runner prints when it finishes.
pub fn encode(result: &RunResult) -> String {
    // A two-variant enum of strings always serializes.
    let payload = serde_json::to_string(result).unwrap_or_else(|_| {
        r#"{"status":"error","message":"Unknown error"}"#.to_string()
    });
    format!("{RESULT_MARKER}{payload}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_success() {
        let line = r#"__RESULT__:{"status": "success", "output_dir": "/out/x"}"#;
        assert_eq!(
            decode_line(line),
            Some(RunResult::Success {
                output_dir: "/out/x".to_string()
            })
        );
    }

    #[test]
    fn test_decode_error() {
        let line = r#"__RESULT__:{"status": "error", "message": "CUDA out of memory"}"#;
        assert_eq!(
            decode_line(line),
            Some(RunResult::Error {
                message: "CUDA out of memory".to_string()
            })
        );
    }

    #[test]
    fn test_error_without_message() {
        let line = r#"__RESULT__:{"status": "error"}"#;
        assert_eq!(
            decode_line(line),
            Some(RunResult::Error {
                message: "Unknown error".to_string()
            })
        );
    }

    #[test]
    fn test_plain_lines() {
        assert_eq!(classify_line("Loading model..."), Line::Plain);
        assert_eq!(classify_line(""), Line::Plain);
        // Marker must be a prefix
        assert_eq!(
            classify_line(r#"  __RESULT__:{"status":"success","output_dir":"x"}"#),
            Line::Plain
        );
    }

    #[test]
    fn test_malformed_payloads() {
        assert_eq!(classify_line("__RESULT__:{not json"), Line::Malformed);
        assert_eq!(classify_line("__RESULT__:"), Line::Malformed);
        assert_eq!(classify_line(r#"__RESULT__:{"status":"pending"}"#), Line::Malformed);
        assert_eq!(classify_line(r#"__RESULT__:{"status":"success"}"#), Line::Malformed);
        assert_eq!(classify_line(r#"__RESULT__:["success"]"#), Line::Malformed);
        assert_eq!(decode_line("__RESULT__:{not json"), None);
    }

    #[test]
    fn test_encode_emits_marker_line() {
        let result = RunResult::Success {
            output_dir: "/workspace/out/llama-AWQ".to_string(),
        };
        let line = encode(&result);
        assert!(line.starts_with(RESULT_MARKER));
        assert!(!line.contains('\n'));
        assert_eq!(decode_line(&line), Some(result));
    }
}
