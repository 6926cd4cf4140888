//! Caller-side timeouts for operations wrapped by the resilience primitives.
//!
//! None of the primitives time out on their own. A caller that needs a bound
//! wraps the operation with [`with_timeout`]; the resulting
//! [`CadenceError::Timeout`] is counted like any other failure by retry and
//! the circuit breaker.

use std::future::Future;
use std::time::Duration;

use cadence_errors::{CadenceError, CadenceResult};
use tokio::time::timeout;
use tracing::{instrument, warn};

#[instrument(skip(operation))]
pub async fn with_timeout<F, T>(
    limit: Duration,
    operation_name: &str,
    operation: F,
) -> CadenceResult<T>
where
    F: Future<Output = CadenceResult<T>>,
{
    match timeout(limit, operation).await {
        Ok(result) => result,
        Err(_) => {
            let message = format!("操作 '{operation_name}' 超时 (超时时间: {limit:?})");
            warn!("{}", message);
            Err(CadenceError::timeout_error(message))
        }
    }
}
