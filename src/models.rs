//! Records exchanged with the collaborator layer
//!
//! Plain data: message records, analysis state and results, search filters,
//! and the JSON envelope used by the command-line front end.

use std::fmt;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;

/// Metadata included in every CLI response
#[derive(Debug, Clone, Serialize)]
pub struct Meta {
    /// Current UTC timestamp in RFC 3339 format with milliseconds
    pub now_utc: String,
    /// Command execution duration in milliseconds
    pub duration_ms: u64,
}

impl Meta {
    /// Create metadata populated with current time and elapsed duration
    pub fn now(duration_ms: u64) -> Self {
        Self {
            now_utc: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            duration_ms,
        }
    }
}

/// Standard response envelope
///
/// Wraps command-specific data with a human-readable summary and execution
/// metadata.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope<T> {
    pub summary: String,
    pub data: T,
    pub meta: Meta,
}

/// Which messages a search should return
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchFilter {
    /// Unconditional search
    All,
    /// Server-side subject containment; matching rules are the server's
    SubjectContains(String),
}

impl SearchFilter {
    /// Build a filter from optional user text; blank text means `All`
    pub fn from_query(query: Option<&str>) -> Self {
        match query.map(str::trim) {
            Some(q) if !q.is_empty() => Self::SubjectContains(q.to_owned()),
            _ => Self::All,
        }
    }
}

/// Message urgency as judged by the model
///
/// Declaration order is the sort order: `High` first, `Unknown` last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Priority {
    High,
    Medium,
    Low,
    /// Marks a result that could not be produced
    #[serde(rename = "unknown")]
    Unknown,
}

impl Priority {
    /// Case-insensitive parse; anything unrecognized is `Unknown`
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "high" => Self::High,
            "medium" => Self::Medium,
            "low" => Self::Low,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::High => "High",
            Self::Medium => "Medium",
            Self::Low => "Low",
            Self::Unknown => "unknown",
        })
    }
}

/// Structured reading of one message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnalysisResult {
    pub summary: String,
    /// Free-text label such as `Work` or `Newsletter`
    pub category: String,
    pub priority: Priority,
    /// Action items in the order the model listed them
    pub todos: Vec<String>,
}

/// Where a record is in its analysis lifecycle
///
/// Moves forward only: `Unanalyzed -> Analyzing -> Analyzed | AnalysisFailed`.
/// A fresh fetch produces new records, all `Unanalyzed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "result", rename_all = "snake_case")]
pub enum AnalysisState {
    Unanalyzed,
    Analyzing,
    Analyzed(AnalysisResult),
    /// Carries the fallback result so the record still renders
    AnalysisFailed(AnalysisResult),
}

impl AnalysisState {
    /// `true` once the model has been consulted for this record
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Analyzed(_) | Self::AnalysisFailed(_))
    }

    /// The attached result, whether real or fallback
    pub fn result(&self) -> Option<&AnalysisResult> {
        match self {
            Self::Analyzed(r) | Self::AnalysisFailed(r) => Some(r),
            Self::Unanalyzed | Self::Analyzing => None,
        }
    }
}

/// One decoded message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmailRecord {
    /// Server-assigned message UID
    pub id: u32,
    /// Decoded Subject header
    pub subject: String,
    /// Decoded From header
    pub sender: String,
    /// Date header exactly as sent
    pub timestamp: String,
    /// Plain-text body, decoded
    pub body: String,
    /// Body cut to the preview budget
    pub preview: String,
    pub analysis: AnalysisState,
}
