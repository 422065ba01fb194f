use thiserror::Error;

/// Every failure the presence poller can run into.
///
/// Controller errors never escape a single device's poll; only the
/// configuration variants reach the operator as notices.
#[derive(Debug, Error)]
pub enum Error {
    // Configuration
    #[error("required parameter \"{0}\" is not set")]
    MissingParam(&'static str),

    #[error("parameter \"{key}\" is invalid: {reason}")]
    InvalidParam { key: String, reason: String },

    #[error("could not read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Controller
    #[error("controller rejected credentials (HTTP {status})")]
    Authentication { status: u16 },

    #[error("controller session expired")]
    SessionExpired,

    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("controller request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("controller returned unexpected HTTP {status}")]
    UnexpectedStatus { status: u16 },

    #[error("controller API error: {0}")]
    Api(String),

    #[error("could not decode controller response: {0}")]
    Deserialization(#[from] serde_json::Error),

    #[error("invalid controller URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("invalid filter pattern: {0}")]
    Pattern(#[from] regex::Error),

    // Reporting
    #[error("could not encode report: {0}")]
    Encode(serde_json::Error),

    #[error("could not publish report: {0}")]
    Publish(#[from] rumqttc::ClientError),
}

impl Error {
    /// Credentials were refused; retrying without new configuration is pointless.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::Authentication { .. })
    }

    pub fn is_session_expired(&self) -> bool {
        matches!(self, Self::SessionExpired)
    }

    /// Failures that are expected to clear up by the next scheduled poll.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport(_)
                | Self::Timeout { .. }
                | Self::UnexpectedStatus { .. }
                | Self::Api(_)
                | Self::Deserialization(_)
                | Self::SessionExpired
        )
    }
}
