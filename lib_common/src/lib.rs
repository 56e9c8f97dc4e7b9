//! # lib_common
//!
//! Shared library for the `sensorhub` workspace. Serial sensor nodes write
//! newline-delimited readings; the `serial_reader` binary picks them up and
//! forwards them to `server_ingest`, which buffers them into the time-series
//! store and answers the dashboard's queries.
//!
//! Modules are gated behind cargo features of the same name (all enabled by
//! default through `full`).

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Reading-line parsing and the sensor catalogue.
#[cfg(feature = "readings")]
pub mod readings;

/// Backoff, port bookkeeping and duplicate suppression shared by the pipeline.
#[cfg(feature = "core")]
pub mod core;

/// HTTP client with retry middleware.
#[cfg(feature = "retrieve")]
pub mod retrieve;

/// Time-series store abstraction and its InfluxDB / in-memory implementations.
#[cfg(feature = "storage")]
pub mod storage;

/// Buffered, backpressure-aware writer in front of a store.
#[cfg(feature = "pipeline")]
pub mod pipeline;

/// Serial device discovery, reconnect loop and forwarding.
#[cfg(feature = "ingestors")]
pub mod ingestors;

/// The ingest and query HTTP contract.
#[cfg(feature = "api")]
pub mod api;

/// Layered configuration for the binaries.
#[cfg(feature = "configs")]
pub mod configs;

/// Logging setup.
#[cfg(feature = "loggers")]
pub mod loggers;

#[cfg(feature = "readings")]
pub use readings::{parse_line, SensorKind, SensorReading};
