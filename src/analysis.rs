//! Analysis client
//!
//! Builds the fixed triage prompt from message text and invokes a
//! [`GenerativeModel`], returning the model's raw reply. Every call passes
//! through the shared [`RateLimiter`] and is bounded by the configured
//! timeout. Parsing the reply is left to [`crate::normalize`].

use std::future::Future;
use std::time::{Duration, Instant};

use secrecy::{ExposeSecret, SecretString};
use tokio::time::timeout;
use tracing::debug;

use crate::config::AnalysisConfig;
use crate::errors::AnalysisError;
use crate::limiter::RateLimiter;
use crate::mime::truncate_chars;

/// Prompt sent for every message; `{body}` is replaced with the message text
pub const PROMPT_TEMPLATE: &str = "You are an email triage assistant. Analyze the email below.
Return ONLY a JSON object with exactly these four fields and nothing else.
Do not wrap the JSON in markdown code fences and do not write the word json.

{
  \"summary\": \"one or two sentence summary\",
  \"category\": \"one of Work, Personal, Finance, Newsletter, Ad, Security, Social, Other\",
  \"priority\": \"one of High, Medium, Low\",
  \"todos\": [\"action item\", \"action item\"]
}

Email Body:
{body}";

/// A stateless text-generation backend
///
/// One call, one prompt, one free-form text reply. Implemented over HTTP by
/// [`crate::gemini::GeminiClient`].
pub trait GenerativeModel: Send + Sync {
    fn generate(
        &self,
        api_key: &SecretString,
        prompt: &str,
    ) -> impl Future<Output = Result<String, AnalysisError>> + Send;
}

/// Substitute the capped body text into [`PROMPT_TEMPLATE`]
pub fn build_prompt(body: &str, body_max_chars: usize) -> String {
    PROMPT_TEMPLATE.replace("{body}", &truncate_chars(body, body_max_chars))
}

/// Throttled, timeout-bounded access to a model
pub struct Analyzer<M> {
    model: M,
    limiter: RateLimiter,
    body_max_chars: usize,
    call_timeout: Duration,
}

impl<M: GenerativeModel> Analyzer<M> {
    pub fn new(model: M, config: &AnalysisConfig) -> Self {
        Self {
            model,
            limiter: RateLimiter::new(config.max_concurrency, config.min_interval()),
            body_max_chars: config.body_max_chars,
            call_timeout: config.timeout(),
        }
    }

    #[cfg(test)]
    pub(crate) fn model(&self) -> &M {
        &self.model
    }

    /// Ask the model to triage `body`; returns the reply text unmodified
    ///
    /// # Errors
    ///
    /// - `MissingApiKey` if the key is blank
    /// - `Timeout` if the call exceeds the configured bound
    /// - any error the model backend reports
    pub async fn analyze(&self, api_key: &SecretString, body: &str) -> Result<String, AnalysisError> {
        if api_key.expose_secret().trim().is_empty() {
            return Err(AnalysisError::MissingApiKey);
        }
        let prompt = build_prompt(body, self.body_max_chars);

        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|e| AnalysisError::Unavailable(format!("limiter closed: {e}")))?;

        let started = Instant::now();
        let reply = timeout(self.call_timeout, self.model.generate(api_key, &prompt))
            .await
            .map_err(|_| {
                AnalysisError::Timeout(format!(
                    "no reply within {} ms",
                    self.call_timeout.as_millis()
                ))
            })??;
        debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            reply_chars = reply.chars().count(),
            "model replied"
        );
        Ok(reply)
    }
}
