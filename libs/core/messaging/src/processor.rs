//! Processor trait for handling consumed messages.

use crate::error::ProcessingError;
use async_trait::async_trait;

/// Message processor.
///
/// The worker deserializes each delivery into `M` and hands it here. The
/// returned result decides how the delivery is settled:
///
/// - `Ok(())`: ack
/// - `Err` with a transient category: nack with requeue, the broker redelivers
/// - `Err` with a fatal category: ack, the message is dropped
///
/// Processors must tolerate seeing the same message more than once.
#[async_trait]
pub trait Processor<M>: Send + Sync + 'static
where
    M: Send + Sync + 'static,
{
    async fn process(&self, message: &M) -> Result<(), ProcessingError>;

    /// Used for logging and metrics labels.
    fn name(&self) -> &'static str;

    /// Downstream availability, used by readiness.
    async fn health_check(&self) -> Result<bool, ProcessingError> {
        Ok(true)
    }
}
