//! Bridge error taxonomy. Callers match on the variant to decide between
//! retrying, surfacing a "service unavailable" reply, or disabling the bridge.

use std::time::Duration;

/// Errors surfaced by the bridge to its host.
#[derive(thiserror::Error, Debug)]
pub enum BridgeError {
    #[error("Unsupported platform: os='{os}', arch='{arch}'")]
    UnsupportedPlatform { os: String, arch: String },

    #[error("Failed to extract '{resource}': {reason}")]
    ExtractionFailed { resource: String, reason: String },

    #[error("Backend unavailable after {attempts} restart attempts")]
    BackendUnavailable { attempts: u32 },

    #[error("Not connected to backend")]
    NotConnected,

    #[error("Request '{event_type}' timed out after {}ms", .timeout.as_millis())]
    RequestTimeout { event_type: String, timeout: Duration },

    #[error("Connection to backend lost")]
    ConnectionLost,

    #[error("Request cancelled")]
    Cancelled,

    #[error("Outbound queue is full")]
    SendQueueFull,

    #[error("Backend rejected '{event_type}': {message}")]
    Remote { event_type: String, message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl BridgeError {
    /// 머신 리더블 에러 코드
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::UnsupportedPlatform { .. } => "UNSUPPORTED_PLATFORM",
            Self::ExtractionFailed { .. } => "EXTRACTION_FAILED",
            Self::BackendUnavailable { .. } => "BACKEND_UNAVAILABLE",
            Self::NotConnected => "NOT_CONNECTED",
            Self::RequestTimeout { .. } => "REQUEST_TIMEOUT",
            Self::ConnectionLost => "CONNECTION_LOST",
            Self::Cancelled => "CANCELLED",
            Self::SendQueueFull => "SEND_QUEUE_FULL",
            Self::Remote { .. } => "REMOTE_ERROR",
            Self::Protocol(_) => "PROTOCOL_ERROR",
            Self::Config(_) => "INVALID_CONFIG",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Fatal errors disable the bridge; retrying will not help until the
    /// deployment or the environment is fixed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedPlatform { .. }
                | Self::ExtractionFailed { .. }
                | Self::BackendUnavailable { .. }
                | Self::Config(_)
        )
    }

    /// Message suitable for a player or operator facing command reply.
    pub fn user_message(&self) -> String {
        match self {
            Self::NotConnected | Self::ConnectionLost | Self::SendQueueFull => {
                "Beacon service is temporarily unavailable, please try again shortly.".to_string()
            }
            Self::BackendUnavailable { .. }
            | Self::UnsupportedPlatform { .. }
            | Self::ExtractionFailed { .. } => {
                "Beacon service is unavailable. Check the server log for details.".to_string()
            }
            Self::RequestTimeout { .. } => "Beacon service did not respond in time.".to_string(),
            Self::Cancelled => "Request was cancelled.".to_string(),
            Self::Remote { message, .. } => format!("Beacon service error: {}", message),
            Self::Protocol(_) | Self::Config(_) | Self::Internal(_) => {
                "Beacon service encountered an internal error.".to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(BridgeError::BackendUnavailable { attempts: 5 }.is_fatal());
        assert!(BridgeError::UnsupportedPlatform {
            os: "plan9".into(),
            arch: "mips".into()
        }
        .is_fatal());
        assert!(!BridgeError::NotConnected.is_fatal());
        assert!(!BridgeError::ConnectionLost.is_fatal());
        assert!(!BridgeError::RequestTimeout {
            event_type: "x".into(),
            timeout: Duration::from_secs(1)
        }
        .is_fatal());
    }

    #[test]
    fn test_error_codes_and_display() {
        let err = BridgeError::RequestTimeout {
            event_type: "file_manager_request".into(),
            timeout: Duration::from_millis(1500),
        };
        assert_eq!(err.error_code(), "REQUEST_TIMEOUT");
        assert_eq!(
            err.to_string(),
            "Request 'file_manager_request' timed out after 1500ms"
        );

        let err = BridgeError::UnsupportedPlatform {
            os: "freebsd".into(),
            arch: "riscv64".into(),
        };
        assert!(err.to_string().contains("freebsd"));
        assert!(err.to_string().contains("riscv64"));
    }

    #[test]
    fn test_user_message_for_unavailable() {
        let msg = BridgeError::BackendUnavailable { attempts: 5 }.user_message();
        assert!(msg.contains("unavailable"));
    }
}
