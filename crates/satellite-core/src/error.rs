use thiserror::Error;

#[derive(Debug, Error)]
pub enum SatelliteError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not ready: {0}")]
    NotReady(String),

    #[error("Cancel failed: {0}")]
    CancelFailed(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SatelliteError {
    /// Stable error code sent to clients in `{code, message}` error shapes.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::NotReady(_) => "not_ready",
            Self::CancelFailed(_) => "cancel_failed",
            Self::InvalidParams(_) => "invalid_params",
            Self::Config(_) => "config_error",
            Self::Io(_) => "io_error",
            Self::Json(_) => "invalid_format",
            Self::Other(_) => "unknown_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, SatelliteError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(SatelliteError::NotFound("x".into()).code(), "not_found");
        assert_eq!(SatelliteError::NotReady("timers".into()).code(), "not_ready");
        assert_eq!(
            SatelliteError::CancelFailed("gone".into()).code(),
            "cancel_failed"
        );
    }

    #[test]
    fn test_error_display_keeps_detail() {
        let err = SatelliteError::CancelFailed("timer abc not running".into());
        assert_eq!(err.to_string(), "Cancel failed: timer abc not running");
    }
}
