//! Queue module - broker consumption and delivery dispatch
//!
//! - `consumer`: AMQP connection lifecycle, fair dispatch, reconnect loop
//! - `state`: the consumer's connection state machine
//! - `dispatch`: decode a delivery, run it through a [`JobHandler`], and
//!   decide whether to acknowledge or requeue it

pub mod consumer;
pub mod state;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::core::{Disposition, JobError};
use crate::jobs::JobMessage;

pub use consumer::QueueConsumer;

/// Processes one decoded job message
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, message: JobMessage) -> Result<(), JobError>;
}

/// Decode and process a single delivery payload.
///
/// Malformed payloads are dropped. The handler runs on its own task so a
/// panic surfaces as an unexpected failure instead of tearing down the
/// consumer.
pub async fn dispatch(handler: Arc<dyn JobHandler>, payload: &[u8]) -> Disposition {
    let message = match JobMessage::decode(payload) {
        Ok(message) => message,
        Err(e) => {
            error!("Invalid JSON message, dropping: {}", e);
            return Disposition::Ack;
        }
    };

    let result = match tokio::spawn(async move { handler.handle(message).await }).await {
        Ok(result) => result,
        Err(e) => Err(JobError::Unexpected(format!("job task failed: {}", e))),
    };

    match &result {
        Ok(()) => info!("[✓] Job completed successfully"),
        Err(e) if e.is_handled() => warn!("[✗] Job failed ({}): {}", e.kind(), e),
        Err(e) => error!("Error processing job: {}", e),
    }

    Disposition::for_result(&result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::RunError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn handle(&self, message: JobMessage) -> Result<(), JobError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            message.validate().map(|_| ())
        }
    }

    struct TimingOutHandler;

    #[async_trait]
    impl JobHandler for TimingOutHandler {
        async fn handle(&self, _message: JobMessage) -> Result<(), JobError> {
            Err(RunError::TimedOut(std::time::Duration::from_secs(300)).into())
        }
    }

    struct UnexpectedHandler;

    #[async_trait]
    impl JobHandler for UnexpectedHandler {
        async fn handle(&self, _message: JobMessage) -> Result<(), JobError> {
            Err(JobError::Unexpected("cache directory vanished".into()))
        }
    }

    struct PanickingHandler;

    #[async_trait]
    impl JobHandler for PanickingHandler {
        async fn handle(&self, _message: JobMessage) -> Result<(), JobError> {
            panic!("handler bug");
        }
    }

    const VALID: &[u8] =
        br#"{"assignmentId":10,"participantId":7,"filePath":"/tmp/sub.py","s3EvalBinaryKey":"k1"}"#;

    #[tokio::test]
    async fn test_malformed_payload_is_dropped_without_processing() {
        let handler = Arc::new(CountingHandler::default());

        let disposition = dispatch(handler.clone(), b"{not json").await;

        assert_eq!(disposition, Disposition::Ack);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_success_and_handled_failure_are_acked() {
        let handler = Arc::new(CountingHandler::default());

        assert_eq!(dispatch(handler.clone(), VALID).await, Disposition::Ack);
        assert_eq!(
            dispatch(handler.clone(), br#"{"assignmentId":10}"#).await,
            Disposition::Ack
        );
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_timeout_is_acked() {
        assert_eq!(
            dispatch(Arc::new(TimingOutHandler), VALID).await,
            Disposition::Ack
        );
    }

    #[tokio::test]
    async fn test_unexpected_failure_is_requeued() {
        assert_eq!(
            dispatch(Arc::new(UnexpectedHandler), VALID).await,
            Disposition::Requeue
        );
    }

    #[tokio::test]
    async fn test_panic_is_requeued() {
        assert_eq!(
            dispatch(Arc::new(PanickingHandler), VALID).await,
            Disposition::Requeue
        );
    }
}
