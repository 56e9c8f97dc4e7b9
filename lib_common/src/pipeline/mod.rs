//! # Pipeline Module
//!
//! The write side of ingestion. Every HTTP ingest request hands its readings
//! to a [`WriteBufferHandle`]; a single worker task batches them and writes
//! them to the [`TimeSeriesStore`](crate::storage::TimeSeriesStore).
//!
//! ## Delivery guarantees:
//! - **Backpressure**: the queue between handlers and the worker is bounded.
//!   When the store is slow the queue fills, `submit` waits up to the enqueue
//!   timeout and then reports `Overloaded`, which the API maps to 503 so the
//!   reader retries later.
//! - **At-least-once**: a batch that fails with a transient error stays
//!   pending and is retried on the next flush. Points carry their capture
//!   timestamp, so writing a batch twice leaves one copy in the store.
//! - **Duplicate suppression**: resent lines carrying the idempotency key of
//!   a queued reading are acknowledged without being queued again. A key is
//!   remembered only once its reading is in the queue; a resend that races a
//!   still-waiting original gets a retryable refusal instead.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Counters exposed on the health route.
pub mod stats;
/// The bounded, batching writer.
pub mod write_buffer;

pub use stats::{WriteBufferSnapshot, WriteBufferStats};
pub use write_buffer::{SubmitError, SubmitOutcome, WriteBuffer, WriteBufferConfig, WriteBufferHandle};
