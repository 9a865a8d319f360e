//! Fire-and-forget delayed tasks.
//!
//! Each task is an independent sleep-then-run unit parameterized by (target,
//! delay). Failures never propagate to the flow that scheduled them; handlers
//! needing exactly-once semantics guard with their own check-and-set.

use std::sync::Arc;
use std::time::Duration;

use gatehouse_common::MessageRef;

use crate::gateway::{PlatformGateway, is_message_missing};

/// Delete `message` after `delay`. Missing-message errors are expected (the
/// user or another task got there first) and are suppressed.
pub fn delete_after(gateway: Arc<dyn PlatformGateway>, message: MessageRef, delay: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if let Err(e) = gateway.delete_message(message).await {
            if !is_message_missing(&e) {
                tracing::warn!(
                    chat_id = message.chat_id,
                    message_id = message.message_id,
                    error = %e,
                    "Delayed message deletion failed"
                );
            }
        }
    });
}

/// Run an arbitrary future after `delay`.
pub fn run_after<F>(delay: Duration, task: F)
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        task.await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::RecordingGateway;

    #[tokio::test]
    async fn delayed_deletion_fires_once() {
        let gateway = Arc::new(RecordingGateway::new());
        let message = MessageRef {
            chat_id: 1,
            message_id: 99,
        };

        delete_after(gateway.clone(), message, Duration::from_millis(10));
        assert_eq!(gateway.deletions(), 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(gateway.deletions(), 1);
    }

    #[tokio::test]
    async fn missing_message_failures_are_swallowed() {
        let gateway = Arc::new(RecordingGateway::new());
        *gateway.fail_delete_with.lock().unwrap() =
            Some("delete_message: 400: message not found".into());

        delete_after(
            gateway.clone(),
            MessageRef {
                chat_id: 1,
                message_id: 5,
            },
            Duration::from_millis(5),
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
        // Nothing recorded, nothing panicked.
        assert_eq!(gateway.deletions(), 0);
    }
}
