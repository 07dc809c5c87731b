//! Per-consumer delivery channel.
//!
//! A bounded queue between the bridge and one consumer's socket writer.
//! Above the high water mark, non-critical messages are silently dropped
//! (the enqueue still reports success); critical types keep flowing until
//! the hard ceiling, where everything is refused and the bridge disconnects
//! the consumer.

use std::collections::VecDeque;

use bc_domain::config::DeliveryConfig;
use bc_domain::consumer::SequencedMessage;

pub struct DeliveryChannel {
    high_water_mark: usize,
    max_queue_size: usize,
    critical_types: Vec<String>,
    queue: VecDeque<SequencedMessage>,
}

impl DeliveryChannel {
    pub fn new(config: &DeliveryConfig) -> Self {
        Self {
            high_water_mark: config.high_water_mark,
            max_queue_size: config.max_queue_size,
            critical_types: config.critical_types.clone(),
            queue: VecDeque::new(),
        }
    }

    /// Offer a message.
    ///
    /// - At or above `max_queue_size`: refused (`false`), even for critical
    ///   types.
    /// - At or above `high_water_mark`: non-critical messages are silently
    ///   dropped; the call reports `true` but nothing is enqueued.
    /// - Otherwise appended.
    pub fn enqueue(&mut self, msg: SequencedMessage) -> bool {
        if self.queue.len() >= self.max_queue_size {
            return false;
        }
        if self.queue.len() >= self.high_water_mark && !self.is_critical(&msg) {
            tracing::debug!(
                msg_type = %msg.payload.type_name(),
                queue_size = self.queue.len(),
                "delivery channel over high water mark, dropping non-critical message"
            );
            return true;
        }
        self.queue.push_back(msg);
        true
    }

    /// All enqueued messages in FIFO order; the queue is emptied.
    pub fn drain(&mut self) -> Vec<SequencedMessage> {
        self.queue.drain(..).collect()
    }

    pub fn queue_size(&self) -> usize {
        self.queue.len()
    }

    pub fn is_overflowing(&self) -> bool {
        self.queue.len() >= self.high_water_mark
    }

    fn is_critical(&self, msg: &SequencedMessage) -> bool {
        let name = msg.payload.type_name();
        self.critical_types.iter().any(|t| t == name)
    }
}
