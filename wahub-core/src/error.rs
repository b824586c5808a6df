use thiserror::Error;

use crate::protocol::ProtocolError;

#[derive(Error, Debug)]
pub enum HubError {
    #[error("Device not found: {0}")]
    NotFound(String),

    #[error("Missing credentials: {0}")]
    Unauthorized(String),

    #[error("Invalid API key")]
    Forbidden,

    #[error("Device {0} is not ready")]
    NotReady(String),

    #[error("Invalid media format: {0}")]
    InvalidMediaFormat(String),

    #[error("Device {0} has been deleted")]
    Deleted(String),

    #[error("Upstream failure: {0}")]
    Upstream(String),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HubError {
    /// HTTP status code the control surface reports for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            HubError::NotFound(_) => 404,
            HubError::Unauthorized(_) => 401,
            HubError::Forbidden => 403,
            HubError::NotReady(_) => 503,
            HubError::InvalidMediaFormat(_) => 400,
            HubError::Deleted(_) => 410,
            HubError::Upstream(_)
            | HubError::Config(_)
            | HubError::Io(_)
            | HubError::Json(_) => 500,
        }
    }
}

impl From<ProtocolError> for HubError {
    fn from(err: ProtocolError) -> Self {
        HubError::Upstream(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_follow_taxonomy() {
        assert_eq!(HubError::NotFound("x".into()).status_code(), 404);
        assert_eq!(HubError::Unauthorized("apikey".into()).status_code(), 401);
        assert_eq!(HubError::Forbidden.status_code(), 403);
        assert_eq!(HubError::NotReady("x".into()).status_code(), 503);
        assert_eq!(HubError::InvalidMediaFormat("x".into()).status_code(), 400);
        assert_eq!(HubError::Deleted("x".into()).status_code(), 410);
        assert_eq!(HubError::Upstream("boom".into()).status_code(), 500);
    }

    #[test]
    fn test_protocol_error_becomes_upstream() {
        let err: HubError = ProtocolError::Client("page crashed".into()).into();
        assert!(matches!(err, HubError::Upstream(ref m) if m.contains("page crashed")));
    }
}
