//! Bounded replay history.
//!
//! A ring of the most recent broadcast consumer messages per session.  A
//! reconnecting consumer passes `last_seen_seq` and receives everything
//! newer, in order; if eviction already claimed part of that range the
//! replay is flagged as gapped so the bridge can send `error { code: "gap" }`
//! first.

use std::collections::VecDeque;

use bc_domain::consumer::SequencedMessage;

pub struct MessageHistory {
    limit: usize,
    entries: VecDeque<SequencedMessage>,
    /// Highest seq ever pushed, surviving eviction.
    last_seq: u64,
}

/// The result of a replay request.
pub struct Replay {
    pub messages: Vec<SequencedMessage>,
    /// Some requested messages were evicted before they could be replayed.
    pub gapped: bool,
}

impl MessageHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            entries: VecDeque::new(),
            last_seq: 0,
        }
    }

    /// Record a broadcast message, evicting the oldest when full.
    pub fn push(&mut self, msg: SequencedMessage) {
        self.last_seq = self.last_seq.max(msg.seq);
        if self.entries.len() >= self.limit {
            self.entries.pop_front();
        }
        self.entries.push_back(msg);
    }

    /// Everything with `seq > last_seen`, oldest first.
    pub fn replay_after(&self, last_seen: u64) -> Replay {
        let messages: Vec<SequencedMessage> = self
            .entries
            .iter()
            .filter(|m| m.seq > last_seen)
            .cloned()
            .collect();

        // A gap exists when messages newer than last_seen were evicted: the
        // oldest retained entry does not directly follow the cursor.
        let gapped = match self.entries.front() {
            Some(front) => last_seen + 1 < front.seq,
            None => self.last_seq > last_seen,
        };

        Replay { messages, gapped }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bc_domain::consumer::ConsumerMessage;

    fn seq_msg(seq: u64) -> SequencedMessage {
        SequencedMessage::new(seq, ConsumerMessage::error(format!("m{seq}")))
    }

    #[test]
    fn replay_returns_newer_in_order() {
        let mut history = MessageHistory::new(10);
        for seq in 1..=5 {
            history.push(seq_msg(seq));
        }
        let replay = history.replay_after(2);
        assert!(!replay.gapped);
        let seqs: Vec<u64> = replay.messages.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
    }

    #[test]
    fn eviction_is_oldest_first() {
        let mut history = MessageHistory::new(3);
        for seq in 1..=5 {
            history.push(seq_msg(seq));
        }
        assert_eq!(history.len(), 3);
        let replay = history.replay_after(0);
        let seqs: Vec<u64> = replay.messages.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
        assert!(replay.gapped);
    }

    #[test]
    fn no_gap_when_cursor_at_edge() {
        let mut history = MessageHistory::new(3);
        for seq in 1..=5 {
            history.push(seq_msg(seq));
        }
        // Oldest retained is 3; a cursor of 2 has lost nothing.
        assert!(!history.replay_after(2).gapped);
        assert!(history.replay_after(1).gapped);
    }

    #[test]
    fn empty_history_with_traffic_is_gapped() {
        let mut history = MessageHistory::new(1);
        history.push(seq_msg(1));
        history.push(seq_msg(2)); // evicts 1
        let replay = history.replay_after(0);
        assert_eq!(replay.messages.len(), 1);
        assert!(replay.gapped);
    }

    #[test]
    fn fresh_history_is_not_gapped() {
        let history = MessageHistory::new(10);
        let replay = history.replay_after(0);
        assert!(replay.messages.is_empty());
        assert!(!replay.gapped);
    }

    #[test]
    fn up_to_date_cursor_gets_nothing() {
        let mut history = MessageHistory::new(10);
        history.push(seq_msg(1));
        let replay = history.replay_after(1);
        assert!(replay.messages.is_empty());
        assert!(!replay.gapped);
    }
}
