use std::future::Future;
use std::time::Duration;

use adhikari_backend::{StorageError, StorageResult};
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SyncError {
    #[snafu(display("cannot {operation} without a signed-in user"))]
    NotAuthenticated {
        stage: &'static str,
        operation: &'static str,
    },
    #[snafu(display("message store failed to {operation}: {source}"))]
    Store {
        stage: &'static str,
        operation: &'static str,
        source: StorageError,
    },
    #[snafu(display("message store did not {operation} within {timeout_ms}ms"))]
    StoreTimeout {
        stage: &'static str,
        operation: &'static str,
        timeout_ms: u64,
    },
}

pub type SyncResult<T> = Result<T, SyncError>;

/// Awaits a store call, bounding it by `timeout`.
pub(crate) async fn bounded_store_call<T>(
    timeout: Duration,
    stage: &'static str,
    operation: &'static str,
    call: impl Future<Output = StorageResult<T>>,
) -> SyncResult<T> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result.context(StoreSnafu { stage, operation }),
        Err(_) => StoreTimeoutSnafu {
            stage,
            operation,
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
        .fail(),
    }
}
