use std::sync::Arc;
use std::time::Duration;

use super::users::UserDirectory;
use crate::pipeline::WriteBufferHandle;
use crate::storage::TimeSeriesStore;

/// Shared state of every route.
#[derive(Clone)]
pub struct AppState {
    /// Submit side of the write buffer.
    pub writer: WriteBufferHandle,
    /// Read side; queries bypass the buffer.
    pub store: Arc<dyn TimeSeriesStore>,
    pub users: Arc<dyn UserDirectory>,
    /// Device shown by `/api/dashboard` without a device id.
    pub default_device: String,
    /// Query window when the request names none.
    pub default_window: Duration,
}
