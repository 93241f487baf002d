use serde::{Deserialize, Serialize};

use super::types::RelayError;

/// Close reason for connections missing the `room` or `type` parameter.
/// Sent with close code 1008 (policy violation), no payload.
pub const MISSING_PARAMS_REASON: &str = "Missing room or client type.";

/// Structured error payload sent to a rejected client before closing:
/// `{"error": "<message>"}`
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorNotice {
    pub error: String,
}

impl ErrorNotice {
    pub fn invalid_client_type() -> Self {
        Self {
            error: "Invalid client type. Use ?type=teacher or ?type=student.".to_string(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("ErrorNotice serialization should never fail")
    }
}

impl From<&RelayError> for ErrorNotice {
    fn from(err: &RelayError) -> Self {
        Self {
            error: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_duplicate_teacher() {
        let notice = ErrorNotice::from(&RelayError::TeacherSeatTaken);
        assert_eq!(
            notice.to_json(),
            r#"{"error":"Teacher is already connected in this room."}"#
        );
    }

    #[test]
    fn serialize_invalid_client_type() {
        let notice = ErrorNotice::invalid_client_type();
        assert_eq!(
            notice.to_json(),
            r#"{"error":"Invalid client type. Use ?type=teacher or ?type=student."}"#
        );
    }

    #[test]
    fn parse_error_notice() {
        let json = r#"{"error": "Teacher is already connected in this room."}"#;
        let notice: ErrorNotice = serde_json::from_str(json).unwrap();
        assert_eq!(notice.error, "Teacher is already connected in this room.");
    }
}
