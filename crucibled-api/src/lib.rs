//! Wire contract for the in-guest agent.
//!
//! The host talks to the agent over plain HTTP on port 8080: `GET /health`
//! to probe readiness, `POST /run` to execute a job. Both sides of the
//! connection depend on this crate so the JSON field names can't drift.

use serde::{Deserialize, Serialize};

/// Body of `POST /run`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub id: String,
    pub language: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// Outcome of one execution. Also embedded verbatim in the job status
/// messages the host publishes, so intermediate states reuse it with
/// everything left empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecResponse {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    /// Wall-clock run time in milliseconds.
    #[serde(default)]
    pub exec_duration: u64,
    /// Peak resident set of the executed program, in bytes.
    #[serde(default)]
    pub mem_usage: i64,
}

impl ExecResponse {
    pub fn from_error(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_request_accepts_payload_without_variant() {
        let req: RunRequest =
            serde_json::from_str(r#"{"id":"j1","language":"python","code":"print('hi')"}"#)
                .unwrap();
        assert_eq!(req.id, "j1");
        assert_eq!(req.language, "python");
        assert!(req.variant.is_none());
    }

    #[test]
    fn exec_response_uses_the_agreed_field_names() {
        let res = ExecResponse {
            message: "Done".into(),
            exec_duration: 12,
            mem_usage: 4096,
            ..Default::default()
        };
        let value = serde_json::to_value(&res).unwrap();
        for key in ["message", "error", "stdout", "stderr", "exec_duration", "mem_usage"] {
            assert!(value.get(key).is_some(), "missing field {key}");
        }
        assert_eq!(value["exec_duration"], 12);
    }

    #[test]
    fn from_error_leaves_everything_else_empty() {
        let res = ExecResponse::from_error("boom");
        assert_eq!(res.error, "boom");
        assert!(res.message.is_empty());
        assert_eq!(res.exec_duration, 0);
    }
}
