//! Configuration for the mailbox session and the analysis client
//!
//! All configuration is loaded from environment variables following the
//! pattern `MAIL_TRIAGE_<KEY>`. Credentials are optional at load time so that
//! a collaborator can supply them per call; [`TriageConfig::credentials`]
//! enforces their presence when a mailbox operation needs them.

use std::env;
use std::env::VarError;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::errors::{AppError, AppResult};

/// Well-known IMAP hosts
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ServerPreset {
    Gmail,
    Outlook,
}

impl ServerPreset {
    pub fn host(self) -> &'static str {
        match self {
            Self::Gmail => "imap.gmail.com",
            Self::Outlook => "outlook.office365.com",
        }
    }
}

impl FromStr for ServerPreset {
    type Err = AppError;

    fn from_str(value: &str) -> AppResult<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "gmail" => Ok(Self::Gmail),
            "outlook" | "office365" => Ok(Self::Outlook),
            other => Err(AppError::invalid(format!(
                "unknown server preset '{other}'; expected gmail or outlook"
            ))),
        }
    }
}

impl fmt::Display for ServerPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gmail => f.write_str("gmail"),
            Self::Outlook => f.write_str("outlook"),
        }
    }
}

/// Mailbox login details
///
/// The secret is an application-specific password stored as `SecretString`
/// so it never shows up in `Debug` output or logs.
#[derive(Debug, Clone)]
pub struct MailboxCredentials {
    /// IMAP server hostname
    pub host: String,
    /// IMAP server port (993 for implicit TLS)
    pub port: u16,
    /// Whether to use TLS (plaintext is rejected at connect time)
    pub secure: bool,
    /// Account identifier used for LOGIN
    pub user: String,
    /// Application-specific secret
    pub pass: SecretString,
}

/// Timeouts and folder for one mailbox session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Folder to open for search and fetch
    pub folder: String,
    /// TCP connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// TLS handshake, greeting and LOGIN timeout in milliseconds
    pub greeting_timeout_ms: u64,
    /// Per-command timeout in milliseconds
    pub socket_timeout_ms: u64,
    /// Preview truncation budget in characters
    pub preview_max_chars: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            folder: "INBOX".to_owned(),
            connect_timeout_ms: 30_000,
            greeting_timeout_ms: 15_000,
            socket_timeout_ms: 120_000,
            preview_max_chars: 500,
        }
    }
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn greeting_timeout(&self) -> Duration {
        Duration::from_millis(self.greeting_timeout_ms)
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms)
    }
}

/// Settings for the generative analysis client
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    /// Model identifier (e.g. `gemini-1.5-flash`)
    pub model: String,
    /// API base URL without trailing slash
    pub api_base: String,
    /// Maximum body characters placed into the prompt
    pub body_max_chars: usize,
    /// Per-call timeout in milliseconds
    pub timeout_ms: u64,
    /// Maximum model calls in flight at once
    pub max_concurrency: usize,
    /// Minimal spacing between call starts in milliseconds
    pub min_interval_ms: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            model: "gemini-1.5-flash".to_owned(),
            api_base: "https://generativelanguage.googleapis.com".to_owned(),
            body_max_chars: 3_000,
            timeout_ms: 60_000,
            max_concurrency: 2,
            min_interval_ms: 1_000,
        }
    }
}

impl AnalysisConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }
}

/// Process-level configuration
///
/// Built once at startup and passed explicitly into the pipeline.
#[derive(Debug, Clone)]
pub struct TriageConfig {
    /// Host preset used when no explicit host is configured
    pub preset: ServerPreset,
    /// Explicit host override
    pub host: Option<String>,
    /// IMAP port
    pub port: u16,
    /// TLS flag (must stay `true`)
    pub secure: bool,
    /// Account identifier, if configured
    pub user: Option<String>,
    /// Account secret, if configured
    pub pass: Option<SecretString>,
    /// Model API key, if configured
    pub api_key: Option<SecretString>,
    pub session: SessionConfig,
    pub analysis: AnalysisConfig,
}

impl TriageConfig {
    /// Load all configuration from environment variables
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if a variable is set to a malformed value.
    ///
    /// # Example Environment
    ///
    /// ```text
    /// MAIL_TRIAGE_PRESET=outlook
    /// MAIL_TRIAGE_USER=user@example.com
    /// MAIL_TRIAGE_PASS=app-password
    /// MAIL_TRIAGE_API_KEY=...
    /// MAIL_TRIAGE_ANALYSIS_CONCURRENCY=2
    /// ```
    pub fn load_from_env() -> AppResult<Self> {
        let preset = match optional_env("MAIL_TRIAGE_PRESET")? {
            Some(v) => v.parse()?,
            None => ServerPreset::Gmail,
        };
        let session_defaults = SessionConfig::default();
        let analysis_defaults = AnalysisConfig::default();

        let api_key = match optional_env("MAIL_TRIAGE_API_KEY")? {
            Some(v) => Some(v),
            None => optional_env("GEMINI_API_KEY")?,
        };

        Ok(Self {
            preset,
            host: optional_env("MAIL_TRIAGE_HOST")?,
            port: parse_u16_env("MAIL_TRIAGE_PORT", 993)?,
            secure: parse_bool_env("MAIL_TRIAGE_SECURE", true)?,
            user: optional_env("MAIL_TRIAGE_USER")?,
            pass: secret_env("MAIL_TRIAGE_PASS")?,
            api_key: api_key.map(|k| SecretString::new(k.into())),
            session: SessionConfig {
                folder: optional_env("MAIL_TRIAGE_FOLDER")?.unwrap_or(session_defaults.folder),
                connect_timeout_ms: parse_u64_env(
                    "MAIL_TRIAGE_CONNECT_TIMEOUT_MS",
                    session_defaults.connect_timeout_ms,
                )?,
                greeting_timeout_ms: parse_u64_env(
                    "MAIL_TRIAGE_GREETING_TIMEOUT_MS",
                    session_defaults.greeting_timeout_ms,
                )?,
                socket_timeout_ms: parse_u64_env(
                    "MAIL_TRIAGE_SOCKET_TIMEOUT_MS",
                    session_defaults.socket_timeout_ms,
                )?,
                preview_max_chars: parse_usize_env(
                    "MAIL_TRIAGE_PREVIEW_MAX_CHARS",
                    session_defaults.preview_max_chars,
                )?,
            },
            analysis: AnalysisConfig {
                model: optional_env("MAIL_TRIAGE_MODEL")?.unwrap_or(analysis_defaults.model),
                api_base: optional_env("MAIL_TRIAGE_API_BASE")?
                    .map(|b| b.trim_end_matches('/').to_owned())
                    .unwrap_or(analysis_defaults.api_base),
                body_max_chars: parse_usize_env(
                    "MAIL_TRIAGE_ANALYSIS_MAX_CHARS",
                    analysis_defaults.body_max_chars,
                )?,
                timeout_ms: parse_u64_env(
                    "MAIL_TRIAGE_ANALYSIS_TIMEOUT_MS",
                    analysis_defaults.timeout_ms,
                )?,
                max_concurrency: parse_usize_env(
                    "MAIL_TRIAGE_ANALYSIS_CONCURRENCY",
                    analysis_defaults.max_concurrency,
                )?
                .max(1),
                min_interval_ms: parse_u64_env(
                    "MAIL_TRIAGE_ANALYSIS_INTERVAL_MS",
                    analysis_defaults.min_interval_ms,
                )?,
            },
        })
    }

    /// Host to connect to: explicit override, else the preset's host
    pub fn resolved_host(&self) -> String {
        self.host
            .clone()
            .unwrap_or_else(|| self.preset.host().to_owned())
    }

    /// Build mailbox credentials from the configured values
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the account identifier or secret is missing.
    pub fn credentials(&self) -> AppResult<MailboxCredentials> {
        let user = self
            .user
            .clone()
            .ok_or_else(|| AppError::invalid("missing required environment variable MAIL_TRIAGE_USER"))?;
        let pass = self
            .pass
            .clone()
            .ok_or_else(|| AppError::invalid("missing required environment variable MAIL_TRIAGE_PASS"))?;
        Ok(MailboxCredentials {
            host: self.resolved_host(),
            port: self.port,
            secure: self.secure,
            user,
            pass,
        })
    }

    /// Model API key, required for analysis
    pub fn api_key(&self) -> AppResult<SecretString> {
        self.api_key.clone().ok_or_else(|| {
            AppError::invalid("missing model API key; set MAIL_TRIAGE_API_KEY or GEMINI_API_KEY")
        })
    }
}

/// Read an optional environment variable; empty values count as unset
fn optional_env(key: &str) -> AppResult<Option<String>> {
    match env::var(key) {
        Ok(v) if v.trim().is_empty() => Ok(None),
        Ok(v) => Ok(Some(v.trim().to_owned())),
        Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(_)) => Err(AppError::InvalidInput(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

/// Read a secret exactly as set; only an empty value counts as unset
fn secret_env(key: &str) -> AppResult<Option<SecretString>> {
    match env::var(key) {
        Ok(v) => Ok(secret_value(v)),
        Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(_)) => Err(AppError::InvalidInput(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

fn secret_value(raw: String) -> Option<SecretString> {
    (!raw.is_empty()).then(|| SecretString::new(raw.into()))
}

/// Parse a boolean environment variable with flexible values
///
/// Accepts: `1`, `true`, `yes`, `y`, `on` (truthy) or `0`, `false`, `no`,
/// `n`, `off` (falsy). Case-insensitive. Returns `default` if unset.
fn parse_bool_env(key: &str, default: bool) -> AppResult<bool> {
    match optional_env(key)? {
        Some(v) => parse_bool_value(&v).ok_or_else(|| {
            AppError::InvalidInput(format!("invalid boolean environment variable {key}: '{v}'"))
        }),
        None => Ok(default),
    }
}

fn parse_bool_value(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a numeric environment variable with default fallback
///
/// # Errors
///
/// Returns `InvalidInput` if the variable is set but does not parse as `T`.
fn parse_number_env<T: FromStr>(key: &str, default: T, type_name: &str) -> AppResult<T> {
    match optional_env(key)? {
        Some(v) => v.parse::<T>().map_err(|_| {
            AppError::InvalidInput(format!(
                "invalid {type_name} environment variable {key}: '{v}'"
            ))
        }),
        None => Ok(default),
    }
}

fn parse_u16_env(key: &str, default: u16) -> AppResult<u16> {
    parse_number_env(key, default, "u16")
}

fn parse_u64_env(key: &str, default: u64) -> AppResult<u64> {
    parse_number_env(key, default, "u64")
}

fn parse_usize_env(key: &str, default: usize) -> AppResult<usize> {
    parse_number_env(key, default, "usize")
}
