//! # Core Module
//!
//! Small building blocks shared by the ingestion side (`ingestors`) and the
//! write side (`pipeline`):
//!
//! - **`backoff`**: doubling delays and a cancellable retry loop for
//!   transient failures.
//! - **`port_registry`**: bookkeeping of which serial port is held by which
//!   device, with a linger window so a device that briefly drops its port gets
//!   it back instead of a neighbour grabbing it.
//! - **`dedupe`**: a bounded FIFO set of recently queued idempotency keys,
//!   plus the keys whose readings are still waiting to be queued.
//! - **`shutdown`**: CTRL+C / SIGTERM wiring onto a `CancellationToken`.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Exponential backoff and retry helpers.
pub mod backoff;
/// Bounded set of recently seen keys.
pub mod dedupe;
/// Serial port ownership with a linger window.
pub mod port_registry;
/// Process signal handling.
pub mod shutdown;

pub use backoff::{retry_transient, Backoff, RetryError, RetryPolicy};
pub use dedupe::{DuplicateFilter, KeyState};
pub use port_registry::PortRegistry;
pub use shutdown::{cancel_on_shutdown, shutdown_signal};
