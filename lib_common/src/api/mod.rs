//! # API Module
//!
//! The HTTP contract of `server_ingest`, as an axum [`Router`](axum::Router):
//!
//! | Route | Purpose |
//! |-------|---------|
//! | `POST /write` | reading lines from the serial reader |
//! | `POST /notify` | free-form gateway notifications, logged |
//! | `GET /health` | liveness plus write buffer counters |
//! | `GET /api/series/{device_id}/{sensor}` | one sensor over a window |
//! | `GET /api/dashboard[/{device_id}]` | all sensors, grouped by tab |
//!
//! Errors are JSON bodies built by [`ApiError`].

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

pub mod error;
pub mod routes;
pub mod state;
/// Mapping of requests to users.
pub mod users;

pub use error::ApiError;
pub use routes::{router, Dashboard};
pub use state::AppState;
pub use users::{StaticUserDirectory, UserDirectory};
