//! Mailbox session over IMAP
//!
//! Provides timeout-bounded wrappers around `async-imap` operations. All
//! network calls are enforced to use TLS, and timeouts are derived from
//! [`SessionConfig`]. The session is not safe for concurrent use: it is owned
//! by exactly one operation from open to [`MailboxSession::close`].

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use async_imap::error::Error as ImapError;
use async_imap::types::Fetch;
use async_imap::{Client, Session};
use futures::TryStreamExt;
use rustls::ClientConfig;
use rustls::RootCertStore;
use rustls_pki_types::ServerName;
use secrecy::ExposeSecret;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::config::{MailboxCredentials, SessionConfig};
use crate::errors::{ConnectionError, FetchError, SearchError};
use crate::models::SearchFilter;

/// Type alias for authenticated IMAP session over TLS
pub type ImapSession = Session<tokio_rustls::client::TlsStream<TcpStream>>;

/// Byte-exact RFC822 payload for one message
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub uid: u32,
    pub bytes: Vec<u8>,
}

/// The mailbox operations the pipeline needs
///
/// Implemented by [`MailboxSession`]; tests substitute an in-memory mailbox.
pub trait MailSource {
    /// Select `folder` and return every matching UID in ascending order
    fn search(
        &mut self,
        folder: &str,
        filter: &SearchFilter,
    ) -> impl Future<Output = Result<Vec<u32>, SearchError>> + Send;

    /// Fetch the full original message for one UID
    fn fetch_raw(
        &mut self,
        uid: u32,
    ) -> impl Future<Output = Result<RawMessage, FetchError>> + Send;

    /// Release the session; never fails outward
    fn close(self) -> impl Future<Output = ()> + Send
    where
        Self: Sized;
}

/// Authenticated session bound to one mailbox login
pub struct MailboxSession {
    inner: ImapSession,
    config: SessionConfig,
    host: String,
}

impl MailboxSession {
    /// Connect to the IMAP server and authenticate
    ///
    /// Performs the full connection sequence with timeouts:
    /// 1. TCP connect (`connect_timeout_ms`)
    /// 2. TLS handshake with webpki roots (`greeting_timeout_ms`)
    /// 3. Read IMAP greeting (`greeting_timeout_ms`)
    /// 4. LOGIN (`greeting_timeout_ms`)
    ///
    /// # Errors
    ///
    /// - `InvalidSettings` if `secure` is false or the host is not a valid SNI name
    /// - `Timeout` if any phase times out
    /// - `Unreachable` for TCP failures
    /// - `Tls` for handshake failures
    /// - `AuthRejected` if the server refuses the login
    /// - `Protocol` for greeting failures
    pub async fn open(
        credentials: &MailboxCredentials,
        config: &SessionConfig,
    ) -> Result<Self, ConnectionError> {
        if !credentials.secure {
            return Err(ConnectionError::InvalidSettings(
                "insecure IMAP is not supported; set MAIL_TRIAGE_SECURE=true".to_owned(),
            ));
        }

        let started = Instant::now();
        let host = credentials.host.as_str();

        let tcp = timeout(
            config.connect_timeout(),
            TcpStream::connect((host, credentials.port)),
        )
        .await
        .map_err(|_| ConnectionError::Timeout("tcp connect timeout".to_owned()))
        .and_then(|r| r.map_err(|e| ConnectionError::Unreachable(format!("tcp connect failed: {e}"))))?;

        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config =
            ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
                .with_safe_default_protocol_versions()
                .map_err(|e| ConnectionError::Tls(format!("TLS configuration failed: {e}")))?
                .with_root_certificates(roots)
                .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(tls_config));

        let server_name = ServerName::try_from(credentials.host.clone()).map_err(|_| {
            ConnectionError::InvalidSettings("invalid IMAP host for TLS SNI".to_owned())
        })?;
        let tls_stream = timeout(config.greeting_timeout(), connector.connect(server_name, tcp))
            .await
            .map_err(|_| ConnectionError::Timeout("TLS handshake timeout".to_owned()))
            .and_then(|r| r.map_err(|e| ConnectionError::Tls(format!("TLS handshake failed: {e}"))))?;

        let mut client = Client::new(tls_stream);
        let greeting = timeout(config.greeting_timeout(), client.read_response())
            .await
            .map_err(|_| ConnectionError::Timeout("IMAP greeting timeout".to_owned()))
            .and_then(|r| {
                r.map_err(|e| ConnectionError::Protocol(format!("IMAP greeting failed: {e}")))
            })?;

        if greeting.is_none() {
            return Err(ConnectionError::Unreachable(
                "IMAP server closed connection before greeting".to_owned(),
            ));
        }

        let pass = credentials.pass.expose_secret();
        let session = timeout(
            config.greeting_timeout(),
            client.login(credentials.user.as_str(), pass),
        )
        .await
        .map_err(|_| ConnectionError::Timeout("IMAP login timeout".to_owned()))
        .and_then(|r| r.map_err(|(e, _)| classify_login_error(e)))?;

        info!(
            host,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "mailbox session opened"
        );
        Ok(Self {
            inner: session,
            config: config.clone(),
            host: credentials.host.clone(),
        })
    }

    /// Send NOOP to test connection liveness
    pub async fn noop(&mut self) -> Result<(), ConnectionError> {
        timeout(self.config.socket_timeout(), self.inner.noop())
            .await
            .map_err(|_| ConnectionError::Timeout("NOOP timed out".to_owned()))
            .and_then(|r| r.map_err(|e| ConnectionError::Protocol(format!("NOOP failed: {e}"))))
    }

    /// Query server capabilities as sorted strings
    pub async fn capabilities(&mut self) -> Result<Vec<String>, ConnectionError> {
        let caps = timeout(self.config.socket_timeout(), self.inner.capabilities())
            .await
            .map_err(|_| ConnectionError::Timeout("CAPABILITY timed out".to_owned()))
            .and_then(|r| {
                r.map_err(|e| ConnectionError::Protocol(format!("CAPABILITY failed: {e}")))
            })?;
        let mut out = caps.iter().map(|c| format!("{c:?}")).collect::<Vec<_>>();
        out.sort();
        Ok(out)
    }

    /// Open `folder` read-only
    ///
    /// Uses `EXAMINE` so fetching never marks messages as read. The folder
    /// name is sent in modified UTF-7. Returns the message count.
    pub async fn select_folder(&mut self, folder: &str) -> Result<u32, SearchError> {
        if folder.is_empty() || folder.chars().any(|ch| ch.is_ascii_control()) {
            return Err(SearchError::FolderUnavailable(format!(
                "invalid folder name '{folder}'"
            )));
        }
        let encoded = utf7_imap::encode_utf7_imap(folder.to_owned());
        let selected = timeout(self.config.socket_timeout(), self.inner.examine(&encoded))
            .await
            .map_err(|_| SearchError::Timeout(format!("EXAMINE timed out for folder '{folder}'")))
            .and_then(|r| {
                r.map_err(|e| {
                    SearchError::FolderUnavailable(format!("cannot open folder '{folder}': {e}"))
                })
            })?;
        debug!(folder, exists = selected.exists, "folder opened");
        Ok(selected.exists)
    }

    /// Whether the server accepts non-synchronizing literals
    ///
    /// `LITERAL-` only covers literals up to 4096 bytes, which is more than a
    /// subject filter may hold.
    async fn supports_literal_plus(&mut self) -> Result<bool, SearchError> {
        let caps = timeout(self.config.socket_timeout(), self.inner.capabilities())
            .await
            .map_err(|_| SearchError::Timeout("CAPABILITY timed out".to_owned()))
            .and_then(|r| r.map_err(|e| SearchError::Rejected(format!("CAPABILITY failed: {e}"))))?;
        Ok(caps.has_str("LITERAL+") || caps.has_str("LITERAL-"))
    }

    async fn uid_fetch_one(&mut self, uid: u32, query: &str) -> Result<Fetch, FetchError> {
        let stream = timeout(
            self.config.socket_timeout(),
            self.inner.uid_fetch(uid.to_string(), query),
        )
        .await
        .map_err(|_| FetchError::Timeout(uid))
        .and_then(|r| {
            r.map_err(|e| FetchError::Protocol {
                uid,
                detail: e.to_string(),
            })
        })?;
        let fetches: Vec<Fetch> = timeout(self.config.socket_timeout(), stream.try_collect())
            .await
            .map_err(|_| FetchError::Timeout(uid))
            .and_then(|r| {
                r.map_err(|e| FetchError::Protocol {
                    uid,
                    detail: e.to_string(),
                })
            })?;

        fetches.into_iter().next().ok_or(FetchError::NotFound(uid))
    }
}

impl MailSource for MailboxSession {
    /// Runs `UID SEARCH` after opening the folder
    async fn search(
        &mut self,
        folder: &str,
        filter: &SearchFilter,
    ) -> Result<Vec<u32>, SearchError> {
        let literal_plus = if needs_literal(filter) {
            self.supports_literal_plus().await?
        } else {
            false
        };
        let query = build_search_query(filter, literal_plus)?;
        self.select_folder(folder).await?;
        let set = timeout(self.config.socket_timeout(), self.inner.uid_search(&query))
            .await
            .map_err(|_| SearchError::Timeout("UID SEARCH timed out".to_owned()))
            .and_then(|r| r.map_err(|e| SearchError::Rejected(format!("uid search failed: {e}"))))?;
        let mut uids: Vec<u32> = set.into_iter().collect();
        uids.sort_unstable();
        debug!(folder, matched = uids.len(), "search finished");
        Ok(uids)
    }

    /// Fetches `RFC822`; the folder is read-only so `\Seen` is not set
    async fn fetch_raw(&mut self, uid: u32) -> Result<RawMessage, FetchError> {
        let fetch = self.uid_fetch_one(uid, "UID RFC822").await?;
        let body = fetch.body().ok_or_else(|| FetchError::Protocol {
            uid,
            detail: "message has no RFC822 body".to_owned(),
        })?;
        Ok(RawMessage {
            uid,
            bytes: body.to_vec(),
        })
    }

    /// Logs out; a logout that errors or times out is only logged, and the
    /// socket is closed when `self` drops
    async fn close(mut self) {
        match timeout(self.config.socket_timeout(), self.inner.logout()).await {
            Ok(Ok(())) => debug!(host = %self.host, "mailbox session closed"),
            Ok(Err(e)) => warn!(host = %self.host, error = %e, "IMAP logout failed"),
            Err(_) => warn!(host = %self.host, "IMAP logout timed out"),
        }
    }
}

/// Map a LOGIN failure to a connection error
///
/// `NO`/`BAD` replies are credential problems; I/O failures are network
/// problems.
fn classify_login_error(err: ImapError) -> ConnectionError {
    match err {
        ImapError::No(msg) | ImapError::Bad(msg) => ConnectionError::AuthRejected(msg),
        ImapError::Io(e) => ConnectionError::Unreachable(format!("login I/O failed: {e}")),
        other => {
            let msg = other.to_string();
            if msg.to_ascii_lowercase().contains("auth") || msg.contains("LOGIN") {
                ConnectionError::AuthRejected(msg)
            } else {
                ConnectionError::Protocol(msg)
            }
        }
    }
}

/// Build the IMAP SEARCH criteria for a filter
///
/// `All` maps to the unconditional `ALL`. An ASCII subject filter becomes a
/// quoted `SUBJECT` criterion. Quoted strings are 7-bit only, so non-ASCII
/// text is sent as a non-synchronizing literal under `CHARSET UTF-8`, which
/// needs `literal_plus` (server advertises `LITERAL+` or `LITERAL-`).
///
/// # Errors
///
/// - `InvalidCriteria` for empty, oversized or control-character text, or
///   for non-ASCII text when the server cannot take a literal
pub fn build_search_query(filter: &SearchFilter, literal_plus: bool) -> Result<String, SearchError> {
    match filter {
        SearchFilter::All => Ok("ALL".to_owned()),
        SearchFilter::SubjectContains(text) => {
            let quoted = escape_imap_quoted(text)?;
            if text.is_ascii() {
                Ok(format!("SUBJECT \"{quoted}\""))
            } else if literal_plus {
                Ok(format!("CHARSET UTF-8 SUBJECT {{{}+}}\r\n{text}", text.len()))
            } else {
                Err(SearchError::InvalidCriteria(
                    "the server does not accept non-ASCII search text".to_owned(),
                ))
            }
        }
    }
}

fn needs_literal(filter: &SearchFilter) -> bool {
    matches!(filter, SearchFilter::SubjectContains(text) if !text.is_ascii())
}

/// Escape backslashes and quotes for IMAP quoted strings
fn escape_imap_quoted(input: &str) -> Result<String, SearchError> {
    if input.is_empty() || input.len() > 256 {
        return Err(SearchError::InvalidCriteria(
            "subject filter must be 1..256 bytes".to_owned(),
        ));
    }
    if input.chars().any(|ch| ch.is_control()) {
        return Err(SearchError::InvalidCriteria(
            "subject filter must not contain control characters".to_owned(),
        ));
    }
    Ok(input.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Pick the newest `limit` ids, newest first
///
/// Ids are sorted ascending and deduplicated, the last `limit` kept, then
/// reversed. Returns every id when fewer than `limit` exist.
pub fn select_recent(mut ids: Vec<u32>, limit: usize) -> Vec<u32> {
    ids.sort_unstable();
    ids.dedup();
    let start = ids.len().saturating_sub(limit);
    let mut recent = ids.split_off(start);
    recent.reverse();
    recent
}
