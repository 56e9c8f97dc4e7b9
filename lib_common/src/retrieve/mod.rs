//! # Data Retrieval Module
//!
//! Generic HTTP plumbing shared by the parts of the system that talk to other
//! services over HTTP, so they can focus on payloads instead of request
//! building and retry policy.
//!
//! ## Contained Modules:
//!
//! - **`http_client`**: an `ApiClient` built on `reqwest` and `reqwest-middleware`
//!   with automatic retries of transient failures. The serial reader's
//!   forwarder uses it to post reading lines to the ingest server.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// HTTP client with retry middleware.
pub mod http_client;

pub use http_client::{ApiClient, ApiResponse};
