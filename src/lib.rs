//! Review Relay - normalizes code-review webhooks from several forges and
//! drives token-budgeted, retry-hardened LLM review dispatch.
//!
//! This library provides the canonical event model, the provider adapters,
//! context reconstruction, batching, resilient dispatch, aggregation and the
//! durable job queue used by the `review-relay` binary.

pub mod aggregate;
pub mod batch;
pub mod cache;
pub mod config;
pub mod context;
pub mod jobqueue;
pub mod llm;
pub mod pipeline;
pub mod providers;
pub mod retry;
pub mod server;
pub mod types;

#[cfg(test)]
pub mod test_utils;
