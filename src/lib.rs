//! mail-triage: fetch recent IMAP mail and triage it with a generative model
//!
//! Retrieves the newest messages of one folder over TLS-only IMAP, decodes
//! them into plain-text records, and on demand asks a generative model for a
//! summary, category, priority and action items. Model replies are normalized
//! into a fixed shape; a failed analysis never aborts the batch.
//!
//! # Architecture
//!
//! - [`config`]: Environment-driven configuration for mailbox and model
//! - [`errors`]: Per-stage error kinds and the collaborator-facing [`errors::AppError`]
//! - [`imap`]: IMAP transport/session operations with timeout wrappers
//! - [`mime`]: Message parsing and plain-text body extraction
//! - [`analysis`]: Prompt construction and throttled model invocation
//! - [`gemini`]: HTTP backend for the model API
//! - [`limiter`]: Shared concurrency cap and call spacing
//! - [`normalize`]: Total conversion of model replies into analysis results
//! - [`models`]: Records, analysis state and output envelope
//! - [`filter`]: Client-side projection over fetched records
//! - [`pipeline`]: Orchestration of listing and per-message analysis

pub mod analysis;
pub mod config;
pub mod errors;
pub mod filter;
pub mod gemini;
pub mod imap;
pub mod limiter;
pub mod mime;
pub mod models;
pub mod normalize;
pub mod pipeline;
