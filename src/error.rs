use std::future::Future;
use std::time::Duration;

use thiserror::Error;

/// Error taxonomy for the indexing engine.
///
/// Recoverable kinds (`FileUnreadable`, `EmbeddingFailure`,
/// `GeneratorFailure`) are handled per-file during sync and never abort a
/// whole pass. `VectorStore` and `ConfigInvalid` surface to the caller of
/// the enclosing operation.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("File unreadable: {path}: {reason}")]
    FileUnreadable { path: String, reason: String },

    #[error("Embedding failed: {0}")]
    EmbeddingFailure(String),

    #[error("Context generation failed: {0}")]
    GeneratorFailure(String),

    #[error("Vector store error: {0}")]
    VectorStore(String),

    #[error("Operation '{operation}' exceeded its {budget_ms}ms deadline")]
    OperationTimeout {
        operation: &'static str,
        budget_ms: u64,
    },

    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type AppResult<T> = Result<T, AppError>;

/// Run a future under an explicit deadline, mapping expiry to
/// [`AppError::OperationTimeout`]. Every external port call and store
/// operation goes through this.
pub async fn with_deadline<T, F>(
    operation: &'static str,
    budget: Duration,
    fut: F,
) -> AppResult<T>
where
    F: Future<Output = AppResult<T>>,
{
    match tokio::time::timeout(budget, fut).await {
        Ok(result) => result,
        Err(_) => Err(AppError::OperationTimeout {
            operation,
            budget_ms: budget.as_millis() as u64,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deadline_expiry_maps_to_timeout() {
        let result: AppResult<()> = with_deadline("sleep", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        match result {
            Err(AppError::OperationTimeout { operation, .. }) => assert_eq!(operation, "sleep"),
            other => panic!("expected timeout, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn deadline_passes_through_inner_result() {
        let result = with_deadline("noop", Duration::from_secs(1), async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }
}
