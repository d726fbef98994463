//! Client-side projection over fetched records
//!
//! Narrows an already-fetched list by keyword, priority or category. Never
//! touches the network or the model, and never mutates the records.

use regex::{Regex, RegexBuilder};

use crate::models::{EmailRecord, Priority};

/// Criteria for narrowing a fetched list; `None` fields match everything
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    /// Case-insensitive text searched in subject, sender and body
    pub keyword: Option<String>,
    /// Only records whose analysis has this priority
    pub priority: Option<Priority>,
    /// Only records whose analysis has this category (case-insensitive)
    pub category: Option<String>,
}

enum KeywordMatcher {
    Pattern(Regex),
    Lowercase(String),
}

impl KeywordMatcher {
    fn new(keyword: &str) -> Self {
        RegexBuilder::new(&regex::escape(keyword))
            .case_insensitive(true)
            .build()
            .map(Self::Pattern)
            .unwrap_or_else(|_| Self::Lowercase(keyword.to_lowercase()))
    }

    fn is_match(&self, text: &str) -> bool {
        match self {
            Self::Pattern(re) => re.is_match(text),
            Self::Lowercase(kw) => text.to_lowercase().contains(kw.as_str()),
        }
    }
}

impl RecordFilter {
    /// Records that satisfy every set criterion, in input order
    pub fn apply<'r>(&self, records: impl IntoIterator<Item = &'r EmailRecord>) -> Vec<EmailRecord> {
        let keyword = self
            .keyword
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(KeywordMatcher::new);

        records
            .into_iter()
            .filter(|record| self.matches_with(record, keyword.as_ref()))
            .cloned()
            .collect()
    }

    fn matches_with(&self, record: &EmailRecord, keyword: Option<&KeywordMatcher>) -> bool {
        if let Some(matcher) = keyword
            && !(matcher.is_match(&record.subject)
                || matcher.is_match(&record.sender)
                || matcher.is_match(&record.body))
        {
            return false;
        }

        let result = record.analysis.result();
        if let Some(priority) = self.priority
            && result.is_none_or(|r| r.priority != priority)
        {
            return false;
        }
        if let Some(category) = self.category.as_deref().map(str::trim)
            && result.is_none_or(|r| !r.category.trim().eq_ignore_ascii_case(category))
        {
            return false;
        }
        true
    }
}
