//! Application error model
//!
//! Defines one typed error per pipeline stage using `thiserror`, and a
//! top-level [`AppError`] for the failures that are fatal to a collaborator
//! call. Recoverable kinds ([`FetchError`], [`DecodeError`],
//! [`AnalysisError`]) are handled inside the pipeline and never reach the
//! collaborator as `Err`; [`AnalysisError`] only escapes from direct model
//! operations such as listing models.

use thiserror::Error;

/// Failure to open an authenticated mailbox session
///
/// Keeps credential problems apart from network problems so the collaborator
/// can tell the user what to fix.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Server rejected the account identifier or secret
    #[error("authentication rejected: {0}")]
    AuthRejected(String),
    /// Host could not be reached (DNS, refused, reset)
    #[error("host unreachable: {0}")]
    Unreachable(String),
    /// TLS handshake or certificate failure
    #[error("TLS failure: {0}")]
    Tls(String),
    /// A connection phase exceeded its bound
    #[error("connection timed out: {0}")]
    Timeout(String),
    /// Server spoke something other than the expected protocol
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Settings that can never connect (insecure mode, bad SNI name)
    #[error("invalid connection settings: {0}")]
    InvalidSettings(String),
}

/// Failure to select a folder or run a search
#[derive(Debug, Error)]
pub enum SearchError {
    /// Criteria contain characters that cannot be sent to the server
    #[error("invalid search criteria: {0}")]
    InvalidCriteria(String),
    /// Folder does not exist or cannot be opened
    #[error("folder unavailable: {0}")]
    FolderUnavailable(String),
    /// Server refused the search command
    #[error("search rejected: {0}")]
    Rejected(String),
    /// Select or search exceeded its bound
    #[error("search timed out: {0}")]
    Timeout(String),
}

/// Failure to fetch one message; recovered by skipping that message
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("message uid {0} not found")]
    NotFound(u32),
    #[error("fetch of uid {0} timed out")]
    Timeout(u32),
    #[error("fetch of uid {uid} failed: {detail}")]
    Protocol { uid: u32, detail: String },
}

/// Failure to parse raw message bytes; recovered with fallback text
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed message: {0}")]
    Malformed(String),
}

/// Failure to obtain model output for one message
///
/// Carries the upstream detail; surfaced per message as an
/// `AnalysisFailed` state rather than as an error.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("no API key was provided")]
    MissingApiKey,
    #[error("model API rejected the key: {0}")]
    AuthRejected(String),
    #[error("model API quota or rate limit reached: {0}")]
    RateLimited(String),
    #[error("model API transport failure: {0}")]
    Transport(String),
    #[error("model call timed out: {0}")]
    Timeout(String),
    #[error("model API returned status {status}: {detail}")]
    Upstream { status: u16, detail: String },
    #[error("model API returned no text")]
    EmptyResponse,
    #[error("analysis unavailable: {0}")]
    Unavailable(String),
}

/// Application error type
///
/// Covers every failure that aborts a collaborator-facing call.
#[derive(Debug, Error)]
pub enum AppError {
    /// Invalid configuration or caller input
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Search(#[from] SearchError),
    /// Only surfaced by operations that talk to the model directly, such as
    /// the model listing
    #[error(transparent)]
    Analysis(#[from] AnalysisError),
    /// The caller cancelled the operation; the session was still released
    #[error("operation cancelled")]
    Cancelled,
}

impl AppError {
    /// Convenience constructor for `InvalidInput`
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::Connection(ConnectionError::AuthRejected(_)) => "auth_rejected",
            Self::Connection(ConnectionError::Timeout(_)) | Self::Search(SearchError::Timeout(_)) => {
                "timeout"
            }
            Self::Connection(ConnectionError::InvalidSettings(_)) => "invalid_settings",
            Self::Connection(_) => "network",
            Self::Search(SearchError::FolderUnavailable(_)) => "folder_unavailable",
            Self::Search(_) => "search_failed",
            Self::Analysis(AnalysisError::MissingApiKey | AnalysisError::AuthRejected(_)) => {
                "analysis_auth"
            }
            Self::Analysis(AnalysisError::RateLimited(_)) => "rate_limited",
            Self::Analysis(_) => "analysis_failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Actionable message for the person at the keyboard
    ///
    /// Credential problems point at the account identifier and app password;
    /// network problems point at host, port and connectivity.
    pub fn user_message(&self) -> String {
        match self {
            Self::Connection(ConnectionError::AuthRejected(_)) => {
                "Login failed. Check the email address and use an app password, and make sure IMAP access is enabled for the account.".to_owned()
            }
            Self::Connection(ConnectionError::InvalidSettings(detail)) => {
                format!("The connection settings are invalid: {detail}.")
            }
            Self::Connection(ConnectionError::Timeout(_)) => {
                "The mail server did not answer in time. Check your network connection and try again.".to_owned()
            }
            Self::Connection(_) => {
                "Could not reach the mail server. Check the server address, port and your network connection.".to_owned()
            }
            Self::Search(SearchError::InvalidCriteria(detail)) => {
                format!("The search text cannot be used: {detail}.")
            }
            Self::Search(SearchError::FolderUnavailable(_)) => {
                "The selected folder could not be opened.".to_owned()
            }
            Self::Search(_) => "The mail server could not run the search.".to_owned(),
            Self::Analysis(AnalysisError::MissingApiKey | AnalysisError::AuthRejected(_)) => {
                "The model API key is missing or was rejected.".to_owned()
            }
            Self::Analysis(AnalysisError::RateLimited(_)) => {
                "The model API quota is exhausted. Wait a moment and try again.".to_owned()
            }
            Self::Analysis(e) => format!("The model service failed: {e}."),
            Self::InvalidInput(detail) => detail.clone(),
            Self::Cancelled => "The operation was cancelled.".to_owned(),
        }
    }
}

/// Type alias for fallible collaborator-facing return values
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::{AnalysisError, AppError, ConnectionError, SearchError};

    #[test]
    fn credential_and_network_failures_have_distinct_codes_and_messages() {
        let auth = AppError::from(ConnectionError::AuthRejected("NO LOGIN failed".to_owned()));
        let net = AppError::from(ConnectionError::Unreachable("connection refused".to_owned()));

        assert_eq!(auth.code(), "auth_rejected");
        assert_eq!(net.code(), "network");
        assert!(auth.user_message().contains("app password"));
        assert!(net.user_message().contains("network"));
        assert_ne!(auth.user_message(), net.user_message());
    }

    #[test]
    fn timeouts_share_a_code_across_kinds() {
        let connect = AppError::from(ConnectionError::Timeout("tcp connect".to_owned()));
        let search = AppError::from(SearchError::Timeout("UID SEARCH".to_owned()));
        assert_eq!(connect.code(), "timeout");
        assert_eq!(search.code(), "timeout");
    }

    #[test]
    fn wrapped_errors_display_their_source_text() {
        let err = AppError::from(SearchError::Rejected("BAD criteria".to_owned()));
        assert_eq!(err.to_string(), "search rejected: BAD criteria");
    }

    #[test]
    fn model_key_and_quota_failures_are_told_apart() {
        let key = AppError::from(AnalysisError::MissingApiKey);
        let quota = AppError::from(AnalysisError::RateLimited("Quota exceeded".to_owned()));
        assert_eq!(key.code(), "analysis_auth");
        assert_eq!(quota.code(), "rate_limited");
        assert!(quota.user_message().contains("quota"));
    }
}
