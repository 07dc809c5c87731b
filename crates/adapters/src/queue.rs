//! Pull-stream message queue.
//!
//! Single-producer single-consumer unbounded FIFO: adapters push normalized
//! messages from their I/O tasks, the bridge pulls them as a stream.  Closing
//! the push side terminates the stream after the remaining messages drain.

use parking_lot::Mutex;
use tokio::sync::mpsc;

use bc_domain::message::UnifiedMessage;
use bc_domain::stream::MessageStream;

/// The push side of an adapter's message stream.
pub struct MessageQueue {
    tx: Mutex<Option<mpsc::UnboundedSender<UnifiedMessage>>>,
}

impl MessageQueue {
    /// Create a queue and its pull stream.
    pub fn channel() -> (Self, MessageStream) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let stream = Box::pin(async_stream::stream! {
            while let Some(msg) = rx.recv().await {
                yield msg;
            }
        });
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            stream,
        )
    }

    /// Enqueue a message.  Returns false when the queue is closed or the
    /// stream side was dropped.
    pub fn push(&self, msg: UnifiedMessage) -> bool {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.send(msg).is_ok(),
            None => false,
        }
    }

    /// Close the queue.  The stream yields any already-enqueued messages and
    /// then terminates.  Idempotent.
    pub fn close(&self) {
        self.tx.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn push_then_pull_in_order() {
        let (queue, mut stream) = MessageQueue::channel();
        assert!(queue.push(UnifiedMessage::user_text("a")));
        assert!(queue.push(UnifiedMessage::user_text("b")));

        let first = stream.next().await.unwrap();
        let second = stream.next().await.unwrap();
        assert_eq!(first.text_content(), "a");
        assert_eq!(second.text_content(), "b");
    }

    #[tokio::test]
    async fn close_drains_then_terminates() {
        let (queue, mut stream) = MessageQueue::channel();
        queue.push(UnifiedMessage::user_text("last"));
        queue.close();
        assert!(queue.is_closed());
        assert!(!queue.push(UnifiedMessage::user_text("late")));

        assert_eq!(stream.next().await.unwrap().text_content(), "last");
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (queue, mut stream) = MessageQueue::channel();
        queue.close();
        queue.close();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn push_after_receiver_dropped_returns_false() {
        let (queue, stream) = MessageQueue::channel();
        drop(stream);
        assert!(!queue.push(UnifiedMessage::user_text("x")));
    }
}
