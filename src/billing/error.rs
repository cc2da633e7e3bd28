use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use super::catalog::CatalogError;
use super::processor::ProcessorError;
use crate::config::{BILLING_PROCESSOR_TIMEOUT, BILLING_STORE_TIMEOUT};

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Precondition(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("payment processor error: {0}")]
    Processor(#[from] ProcessorError),
    #[error("database error: {0}")]
    Store(#[from] sqlx::Error),
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

impl BillingError {
    pub fn validation(message: impl Into<String>) -> Self {
        BillingError::Validation(message.into())
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        BillingError::Precondition(message.into())
    }

    /// Failures the caller may retry unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BillingError::Processor(_) | BillingError::Store(_) | BillingError::Timeout(_)
        )
    }
}

/// key: billing-timeouts -> per-call upper bounds for processor and store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BillingTimeouts {
    pub processor: Duration,
    pub store: Duration,
}

impl BillingTimeouts {
    pub fn from_config() -> Self {
        Self {
            processor: *BILLING_PROCESSOR_TIMEOUT,
            store: *BILLING_STORE_TIMEOUT,
        }
    }
}

impl Default for BillingTimeouts {
    fn default() -> Self {
        Self {
            processor: Duration::from_secs(8),
            store: Duration::from_secs(5),
        }
    }
}

/// Runs `future` under `limit`, mapping an elapsed deadline to [`BillingError::Timeout`].
pub async fn bounded<T, E, F>(
    limit: Duration,
    operation: &'static str,
    future: F,
) -> Result<T, BillingError>
where
    F: Future<Output = Result<T, E>>,
    BillingError: From<E>,
{
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result.map_err(BillingError::from),
        Err(_) => {
            tracing::warn!(
                operation,
                limit_ms = limit.as_millis() as u64,
                "billing call timed out"
            );
            Err(BillingError::Timeout(operation))
        }
    }
}
