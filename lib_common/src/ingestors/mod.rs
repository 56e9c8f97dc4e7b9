//! # Serial Ingestors Module
//!
//! The reader side of `sensorhub`: everything between a USB serial adapter and
//! the ingest server's `/write` route.
//!
//! ## Data flow:
//! ```text
//! SerialDevice (one per port) --try_send--> shared queue --> run_forwarder --> HttpForwarder
//! ```
//!
//! ## Contained Modules:
//! - **`serial`**: port enumeration and opening behind the `SerialBackend` seam.
//! - **`device`**: the per-device connect / read / reconnect loop.
//! - **`forwarder`**: delivery of queued lines with bounded retry.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Per-device connect and reconnect loop.
pub mod device;
/// Queue draining and HTTP delivery.
pub mod forwarder;
/// Port discovery and the serial library seam.
pub mod serial;

// --- Public API Re-exports ---
pub use device::{LineEnvelope, LinkState, SerialDevice, SerialDeviceConfig};
pub use forwarder::{run_forwarder, ForwardError, ForwardStats, HttpForwarder, LineSink};
pub use serial::{partition_ports, PortInfo, SerialBackend, SerialError, SerialStream, TokioSerialBackend};
