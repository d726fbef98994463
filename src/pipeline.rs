//! Pipeline orchestration
//!
//! Composes session, decoder, analysis client and normalizer into the two
//! collaborator-facing operations: [`Pipeline::list_messages`] and
//! [`Pipeline::analyze_one`]. Configuration and credentials are passed in
//! explicitly; nothing here is process-global.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use secrecy::SecretString;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::analysis::{Analyzer, GenerativeModel};
use crate::config::{MailboxCredentials, SessionConfig};
use crate::errors::{AppError, AppResult, ConnectionError};
use crate::filter::RecordFilter;
use crate::imap::{MailSource, MailboxSession, select_recent};
use crate::mime;
use crate::models::{AnalysisState, EmailRecord, SearchFilter};
use crate::normalize::{fallback_result, try_normalize};

/// Whether `analyze_one` may reuse a finished analysis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalyzeMode {
    /// Return the existing result if the record was already analyzed
    UseCached,
    /// Run the model again even if a result exists
    Refresh,
}

/// One fetched message plus its analysis lifecycle
///
/// The `gate` serializes analyses of this message so at most one model call
/// is in flight for it; `completed` counts finished analyses so a waiter can
/// tell that the call it queued behind already produced a result.
#[derive(Debug)]
pub struct TrackedMessage {
    record: Mutex<EmailRecord>,
    gate: tokio::sync::Mutex<()>,
    completed: AtomicU64,
}

impl TrackedMessage {
    fn new(record: EmailRecord) -> Self {
        Self {
            record: Mutex::new(record),
            gate: tokio::sync::Mutex::new(()),
            completed: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> u32 {
        self.lock().id
    }

    /// Current copy of the record, including its analysis state
    pub fn snapshot(&self) -> EmailRecord {
        self.lock().clone()
    }

    fn set_analysis(&self, state: AnalysisState) {
        self.lock().analysis = state;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EmailRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Marks a message `Analyzing` and restores the prior state if dropped early
struct InFlight<'a> {
    message: &'a TrackedMessage,
    previous: Option<AnalysisState>,
}

impl<'a> InFlight<'a> {
    fn begin(message: &'a TrackedMessage, previous: AnalysisState) -> Self {
        message.set_analysis(AnalysisState::Analyzing);
        Self {
            message,
            previous: Some(previous),
        }
    }

    fn finish(mut self, state: AnalysisState) {
        self.previous = None;
        self.message.set_analysis(state);
        self.message.completed.fetch_add(1, Ordering::AcqRel);
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            self.message.set_analysis(previous);
        }
    }
}

/// Records from one fetch, newest first
///
/// Held by the collaborator for as long as it displays them. A new fetch
/// produces a new list, so every record starts `Unanalyzed` again.
#[derive(Debug, Default)]
pub struct MessageList {
    messages: Vec<Arc<TrackedMessage>>,
}

impl MessageList {
    pub fn new(records: Vec<EmailRecord>) -> Self {
        Self {
            messages: records
                .into_iter()
                .map(|r| Arc::new(TrackedMessage::new(r)))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<TrackedMessage>> {
        self.messages.iter()
    }

    /// Message by UID
    pub fn get(&self, id: u32) -> Option<Arc<TrackedMessage>> {
        self.messages.iter().find(|m| m.id() == id).cloned()
    }

    /// Snapshots of every record, in list order
    pub fn records(&self) -> Vec<EmailRecord> {
        self.messages.iter().map(|m| m.snapshot()).collect()
    }

    /// Snapshots narrowed by `filter`
    pub fn filtered(&self, filter: &RecordFilter) -> Vec<EmailRecord> {
        filter.apply(&self.records())
    }
}

/// Outcome of an account check
#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub host: String,
    pub user: String,
    pub latency_ms: u64,
    pub capabilities: Vec<String>,
}

/// Mailbox listing plus on-demand analysis
pub struct Pipeline<M> {
    session: SessionConfig,
    analyzer: Analyzer<M>,
}

impl<M: GenerativeModel> Pipeline<M> {
    pub fn new(session: SessionConfig, analyzer: Analyzer<M>) -> Self {
        Self { session, analyzer }
    }

    /// Fetch the newest `limit` messages matching `filter`
    ///
    /// Opens a session, searches the configured folder, fetches and decodes
    /// each selected message, and logs out. Logout runs on every path that
    /// reached an open session, including search failure and cancellation.
    ///
    /// # Errors
    ///
    /// - `Connection` if the session cannot be opened
    /// - `Search` if the folder cannot be opened or the search fails
    /// - `Cancelled` if `cancel` fires first
    pub async fn list_messages(
        &self,
        credentials: &MailboxCredentials,
        filter: &SearchFilter,
        limit: usize,
        cancel: &CancellationToken,
    ) -> AppResult<MessageList> {
        let started = Instant::now();
        let session = tokio::select! {
            _ = cancel.cancelled() => return Err(AppError::Cancelled),
            opened = MailboxSession::open(credentials, &self.session) => opened?,
        };

        let records = collect_then_close(
            session,
            &self.session.folder,
            filter,
            limit,
            self.session.preview_max_chars,
            cancel,
        )
        .await?;
        info!(
            folder = %self.session.folder,
            count = records.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "messages listed"
        );
        Ok(MessageList::new(records))
    }

    /// Check that the account can log in; reports capabilities and latency
    pub async fn verify(&self, credentials: &MailboxCredentials) -> AppResult<VerifyReport> {
        let started = Instant::now();
        let mut session = MailboxSession::open(credentials, &self.session).await?;
        let checked = check_session(&mut session).await;
        session.close().await;

        let mut capabilities = checked?;
        capabilities.truncate(256);
        Ok(VerifyReport {
            host: credentials.host.clone(),
            user: credentials.user.clone(),
            latency_ms: started.elapsed().as_millis() as u64,
            capabilities,
        })
    }

    /// Analyze one message, at most one model call in flight per message
    ///
    /// Moves the record `Unanalyzed -> Analyzing -> Analyzed | AnalysisFailed`
    /// and returns the updated snapshot. A call that queues behind an
    /// in-flight analysis of the same message reuses its result. With
    /// [`AnalyzeMode::UseCached`] an already-analyzed record is returned as
    /// is. Failures never escape: they become `AnalysisFailed` with the
    /// fallback result.
    pub async fn analyze_one(
        &self,
        api_key: &SecretString,
        message: &TrackedMessage,
        mode: AnalyzeMode,
    ) -> EmailRecord {
        let seen = message.completed.load(Ordering::Acquire);
        let _gate = message.gate.lock().await;

        let EmailRecord {
            id, body, analysis, ..
        } = message.snapshot();
        if analysis.is_terminal() {
            let finished_while_waiting = message.completed.load(Ordering::Acquire) != seen;
            if mode == AnalyzeMode::UseCached || finished_while_waiting {
                return message.snapshot();
            }
        }

        let in_flight = InFlight::begin(message, analysis);
        let state = match self.analyzer.analyze(api_key, &body).await {
            Ok(reply) => match try_normalize(&reply) {
                Ok(result) => AnalysisState::Analyzed(result),
                Err(e) => {
                    warn!(uid = id, error = %e, "model reply unreadable; using fallback result");
                    AnalysisState::AnalysisFailed(fallback_result())
                }
            },
            Err(e) => {
                warn!(uid = id, error = %e, "analysis failed; using fallback result");
                AnalysisState::AnalysisFailed(fallback_result())
            }
        };
        in_flight.finish(state);
        message.snapshot()
    }

    /// Analyze every message in `list`
    ///
    /// Calls run concurrently; the analyzer's limiter bounds how many reach
    /// the model at once. Results come back in list order.
    pub async fn analyze_all(
        &self,
        api_key: &SecretString,
        list: &MessageList,
        mode: AnalyzeMode,
    ) -> Vec<EmailRecord> {
        futures::future::join_all(list.iter().map(|m| self.analyze_one(api_key, m, mode))).await
    }
}

async fn check_session(session: &mut MailboxSession) -> Result<Vec<String>, ConnectionError> {
    session.noop().await?;
    session.capabilities().await
}

/// Run [`collect_batch`] and then close `source`, whatever the outcome
pub async fn collect_then_close<S: MailSource>(
    mut source: S,
    folder: &str,
    filter: &SearchFilter,
    limit: usize,
    preview_max_chars: usize,
    cancel: &CancellationToken,
) -> AppResult<Vec<EmailRecord>> {
    let outcome = collect_batch(&mut source, folder, filter, limit, preview_max_chars, cancel).await;
    source.close().await;
    outcome
}

/// Search, select the newest `limit` ids, then fetch and decode each
///
/// A message that fails to fetch is logged and skipped; one that fails to
/// decode is replaced with best-effort text.
pub async fn collect_batch<S: MailSource>(
    source: &mut S,
    folder: &str,
    filter: &SearchFilter,
    limit: usize,
    preview_max_chars: usize,
    cancel: &CancellationToken,
) -> AppResult<Vec<EmailRecord>> {
    let ids = tokio::select! {
        _ = cancel.cancelled() => return Err(AppError::Cancelled),
        found = source.search(folder, filter) => found?,
    };

    let selected = select_recent(ids, limit);
    let mut records = Vec::with_capacity(selected.len());
    for uid in selected {
        let fetched = tokio::select! {
            _ = cancel.cancelled() => return Err(AppError::Cancelled),
            fetched = source.fetch_raw(uid) => fetched,
        };
        match fetched {
            Ok(raw) => records.push(mime::decode_or_fallback(&raw, preview_max_chars)),
            Err(e) => warn!(uid, error = %e, "fetch failed; skipping message"),
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use secrecy::SecretString;
    use tokio_util::sync::CancellationToken;

    use super::{AnalyzeMode, MessageList, Pipeline, collect_batch, collect_then_close};
    use crate::analysis::{Analyzer, GenerativeModel};
    use crate::config::{AnalysisConfig, SessionConfig};
    use crate::errors::{AnalysisError, AppError, FetchError, SearchError};
    use crate::filter::RecordFilter;
    use crate::imap::{MailSource, RawMessage};
    use crate::models::{AnalysisState, EmailRecord, Priority, SearchFilter};

    /// In-memory mailbox keyed by UID
    struct FakeMailbox {
        messages: BTreeMap<u32, Vec<u8>>,
        failing: Vec<u32>,
        search_error: bool,
        searched: Vec<(String, SearchFilter)>,
        logged_out: Arc<AtomicBool>,
    }

    impl FakeMailbox {
        fn with_ids(ids: &[u32]) -> Self {
            let messages = ids
                .iter()
                .map(|id| {
                    let raw = format!("Subject: message {id}\r\nFrom: a@example.com\r\n\r\nbody {id}");
                    (*id, raw.into_bytes())
                })
                .collect();
            Self {
                messages,
                failing: Vec::new(),
                search_error: false,
                searched: Vec::new(),
                logged_out: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    impl MailSource for FakeMailbox {
        async fn search(
            &mut self,
            folder: &str,
            filter: &SearchFilter,
        ) -> Result<Vec<u32>, SearchError> {
            self.searched.push((folder.to_owned(), filter.clone()));
            if self.search_error {
                return Err(SearchError::Rejected("BAD".to_owned()));
            }
            Ok(self.messages.keys().copied().collect())
        }

        async fn fetch_raw(&mut self, uid: u32) -> Result<RawMessage, FetchError> {
            if self.failing.contains(&uid) {
                return Err(FetchError::Timeout(uid));
            }
            self.messages
                .get(&uid)
                .map(|bytes| RawMessage {
                    uid,
                    bytes: bytes.clone(),
                })
                .ok_or(FetchError::NotFound(uid))
        }

        async fn close(self) {
            self.logged_out.store(true, Ordering::SeqCst);
        }
    }

    /// Counts calls and replies with a fixed text after a delay
    struct ScriptedModel {
        calls: AtomicUsize,
        reply: Result<String, String>,
        delay: Duration,
    }

    impl ScriptedModel {
        fn replying(reply: &str) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                reply: Ok(reply.to_owned()),
                delay: Duration::from_millis(20),
            }
        }

        fn failing(detail: &str) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                reply: Err(detail.to_owned()),
                delay: Duration::ZERO,
            }
        }
    }

    impl GenerativeModel for ScriptedModel {
        async fn generate(
            &self,
            _api_key: &SecretString,
            _prompt: &str,
        ) -> Result<String, AnalysisError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.reply
                .clone()
                .map_err(AnalysisError::RateLimited)
        }
    }

    const GOOD_REPLY: &str = "```json\n{\"summary\":\"x\",\"category\":\"Work\",\"priority\":\"High\",\"todos\":[\"reply\"]}\n```";

    fn pipeline(model: ScriptedModel) -> Pipeline<ScriptedModel> {
        let config = AnalysisConfig {
            min_interval_ms: 0,
            max_concurrency: 4,
            ..AnalysisConfig::default()
        };
        Pipeline::new(SessionConfig::default(), Analyzer::new(model, &config))
    }

    fn key() -> SecretString {
        SecretString::new("test-key".into())
    }

    fn list_of(ids: &[u32]) -> MessageList {
        MessageList::new(
            ids.iter()
                .map(|id| EmailRecord {
                    id: *id,
                    subject: format!("subject {id}"),
                    sender: "a@example.com".to_owned(),
                    timestamp: String::new(),
                    body: format!("body {id}"),
                    preview: format!("body {id}"),
                    analysis: AnalysisState::Unanalyzed,
                })
                .collect(),
        )
    }

    fn calls(pipeline: &Pipeline<ScriptedModel>) -> usize {
        pipeline.analyzer.model().calls.load(Ordering::SeqCst)
    }

    #[tokio::test]
    async fn lists_newest_first_within_limit() {
        let mut mailbox = FakeMailbox::with_ids(&[1, 2, 3, 4, 5]);
        let records = collect_batch(
            &mut mailbox,
            "INBOX",
            &SearchFilter::All,
            2,
            500,
            &CancellationToken::new(),
        )
        .await
        .expect("batch succeeds");

        let ids: Vec<u32> = records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![5, 4]);
        assert_eq!(records[0].subject, "message 5");
        assert_eq!(records[1].body, "body 4");
        assert!(records.iter().all(|r| r.analysis == AnalysisState::Unanalyzed));
        assert_eq!(mailbox.searched, vec![("INBOX".to_owned(), SearchFilter::All)]);
    }

    #[tokio::test]
    async fn failed_fetch_is_skipped_and_batch_continues() {
        let mut mailbox = FakeMailbox::with_ids(&[1, 2, 3]);
        mailbox.failing.push(2);
        let records = collect_batch(
            &mut mailbox,
            "INBOX",
            &SearchFilter::SubjectContains("message".to_owned()),
            10,
            500,
            &CancellationToken::new(),
        )
        .await
        .expect("batch succeeds");

        let ids: Vec<u32> = records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![3, 1]);
    }

    #[tokio::test]
    async fn search_failure_is_fatal() {
        let mut mailbox = FakeMailbox::with_ids(&[1]);
        mailbox.search_error = true;
        let err = collect_batch(
            &mut mailbox,
            "INBOX",
            &SearchFilter::All,
            10,
            500,
            &CancellationToken::new(),
        )
        .await
        .expect_err("must fail");
        assert!(matches!(err, AppError::Search(SearchError::Rejected(_))));
    }

    #[tokio::test]
    async fn cancelled_batch_reports_cancellation() {
        let mut mailbox = FakeMailbox::with_ids(&[1, 2]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = collect_batch(&mut mailbox, "INBOX", &SearchFilter::All, 10, 500, &cancel)
            .await
            .expect_err("must be cancelled");
        assert!(matches!(err, AppError::Cancelled));
    }

    #[tokio::test]
    async fn session_is_closed_after_search_failure() {
        let mut mailbox = FakeMailbox::with_ids(&[1]);
        mailbox.search_error = true;
        let logged_out = mailbox.logged_out.clone();
        let err = collect_then_close(
            mailbox,
            "INBOX",
            &SearchFilter::All,
            10,
            500,
            &CancellationToken::new(),
        )
        .await
        .expect_err("must fail");
        assert!(matches!(err, AppError::Search(_)));
        assert!(logged_out.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn session_is_closed_after_cancellation() {
        let mailbox = FakeMailbox::with_ids(&[1, 2]);
        let logged_out = mailbox.logged_out.clone();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = collect_then_close(mailbox, "INBOX", &SearchFilter::All, 10, 500, &cancel)
            .await
            .expect_err("must be cancelled");
        assert!(matches!(err, AppError::Cancelled));
        assert!(logged_out.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn session_is_closed_after_partial_fetch_failure() {
        let mut mailbox = FakeMailbox::with_ids(&[1, 2, 3]);
        mailbox.failing.push(3);
        let logged_out = mailbox.logged_out.clone();
        let records = collect_then_close(
            mailbox,
            "INBOX",
            &SearchFilter::All,
            10,
            500,
            &CancellationToken::new(),
        )
        .await
        .expect("batch succeeds");
        let ids: Vec<u32> = records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![2, 1]);
        assert!(logged_out.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn analyze_one_moves_to_analyzed() {
        let key = key();
        let pipeline = pipeline(ScriptedModel::replying(GOOD_REPLY));
        let list = list_of(&[1]);
        let message = list.get(1).expect("present");

        let record = pipeline.analyze_one(&key, &message, AnalyzeMode::UseCached).await;
        match &record.analysis {
            AnalysisState::Analyzed(result) => {
                assert_eq!(result.summary, "x");
                assert_eq!(result.category, "Work");
                assert_eq!(result.priority, Priority::High);
                assert_eq!(result.todos, vec!["reply".to_owned()]);
            }
            other => panic!("unexpected state {other:?}"),
        }
        assert_eq!(message.snapshot(), record);
    }

    #[tokio::test]
    async fn cached_result_is_reused_unless_refresh_requested() {
        let key = key();
        let pipeline = pipeline(ScriptedModel::replying(GOOD_REPLY));
        let list = list_of(&[1]);
        let message = list.get(1).expect("present");

        let first = pipeline.analyze_one(&key, &message, AnalyzeMode::UseCached).await;
        let second = pipeline.analyze_one(&key, &message, AnalyzeMode::UseCached).await;
        assert_eq!(first, second);
        assert_eq!(calls(&pipeline), 1);

        pipeline.analyze_one(&key, &message, AnalyzeMode::Refresh).await;
        assert_eq!(calls(&pipeline), 2);
    }

    #[tokio::test]
    async fn concurrent_requests_for_one_message_call_model_once() {
        let key = key();
        let pipeline = pipeline(ScriptedModel::replying(GOOD_REPLY));
        let list = list_of(&[1]);
        let message = list.get(1).expect("present");

        let (a, b, c) = tokio::join!(
            pipeline.analyze_one(&key, &message, AnalyzeMode::UseCached),
            pipeline.analyze_one(&key, &message, AnalyzeMode::Refresh),
            pipeline.analyze_one(&key, &message, AnalyzeMode::UseCached),
        );
        assert_eq!(calls(&pipeline), 1);
        assert_eq!(a, b);
        assert_eq!(b, c);
    }

    #[tokio::test]
    async fn upstream_failure_becomes_failed_state_with_fallback() {
        let key = key();
        let pipeline = pipeline(ScriptedModel::failing("quota"));
        let list = list_of(&[1, 2]);

        let records = pipeline.analyze_all(&key, &list, AnalyzeMode::UseCached).await;
        assert_eq!(records.len(), 2);
        for record in records {
            match record.analysis {
                AnalysisState::AnalysisFailed(result) => {
                    assert_eq!(result.priority, Priority::Unknown);
                    assert_eq!(result.summary, "analysis failed");
                }
                other => panic!("unexpected state {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn unreadable_reply_becomes_failed_state() {
        let key = key();
        let pipeline = pipeline(ScriptedModel::replying("oops not json"));
        let list = list_of(&[1]);
        let message = list.get(1).expect("present");
        let record = pipeline.analyze_one(&key, &message, AnalyzeMode::UseCached).await;
        assert!(matches!(record.analysis, AnalysisState::AnalysisFailed(_)));
    }

    #[tokio::test]
    async fn dropped_analysis_restores_previous_state() {
        let key = key();
        let mut model = ScriptedModel::replying(GOOD_REPLY);
        model.delay = Duration::from_secs(60);
        let pipeline = pipeline(model);
        let list = list_of(&[1]);
        let message = list.get(1).expect("present");

        let analysis = pipeline.analyze_one(&key, &message, AnalyzeMode::UseCached);
        let timed_out = tokio::time::timeout(Duration::from_millis(10), analysis).await;
        assert!(timed_out.is_err());
        assert_eq!(message.snapshot().analysis, AnalysisState::Unanalyzed);
    }

    #[tokio::test]
    async fn analyze_all_keeps_list_order_and_filters_afterwards() {
        let key = key();
        let pipeline = pipeline(ScriptedModel::replying(GOOD_REPLY));
        let list = list_of(&[3, 2, 1]);

        let records = pipeline.analyze_all(&key, &list, AnalyzeMode::UseCached).await;
        let ids: Vec<u32> = records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![3, 2, 1]);
        assert_eq!(calls(&pipeline), 3);

        let high = list.filtered(&RecordFilter {
            priority: Some(Priority::High),
            ..RecordFilter::default()
        });
        assert_eq!(high.len(), 3);
        assert_eq!(calls(&pipeline), 3);
    }
}
