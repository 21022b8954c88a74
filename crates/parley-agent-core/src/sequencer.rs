use std::collections::VecDeque;

use parley_ai::Message;
use tracing::debug;

use crate::types::SessionEpoch;

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedInput {
    pub epoch: SessionEpoch,
    pub messages: Vec<Message>,
}

/// FIFO of input that arrived while a turn was in flight.
#[derive(Debug, Default)]
pub struct MessageSequencer {
    queue: VecDeque<QueuedInput>,
}

impl MessageSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, epoch: SessionEpoch, messages: Vec<Message>) {
        debug!(epoch = %epoch, queued = self.queue.len() + 1, "input queued");
        self.queue.push_back(QueuedInput { epoch, messages });
    }

    /// Releases the oldest item stamped with `current`. Older items from other
    /// epochs are discarded on the way.
    pub fn release_next(&mut self, current: Option<&SessionEpoch>) -> Option<QueuedInput> {
        while let Some(item) = self.queue.pop_front() {
            if current == Some(&item.epoch) {
                return Some(item);
            }
            debug!(
                epoch = %item.epoch,
                messages = item.messages.len(),
                "discarded queued input from stale session"
            );
        }
        None
    }

    pub fn clear(&mut self) {
        if !self.queue.is_empty() {
            debug!(dropped = self.queue.len(), "input queue cleared");
        }
        self.queue.clear();
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn releases_one_item_at_a_time_in_order() {
        let s1 = SessionEpoch::new("S1");
        let mut sequencer = MessageSequencer::new();
        sequencer.enqueue(s1.clone(), vec![Message::user_text("first")]);
        sequencer.enqueue(s1.clone(), vec![Message::user_text("second")]);

        let first = sequencer.release_next(Some(&s1)).expect("first item");
        assert_eq!(first.messages[0].text(), "first");
        assert_eq!(sequencer.len(), 1);
        let second = sequencer.release_next(Some(&s1)).expect("second item");
        assert_eq!(second.messages[0].text(), "second");
        assert!(sequencer.release_next(Some(&s1)).is_none());
    }

    #[test]
    fn stale_items_are_discarded() {
        let s1 = SessionEpoch::new("S1");
        let s2 = SessionEpoch::new("S2");
        let mut sequencer = MessageSequencer::new();
        sequencer.enqueue(s1.clone(), vec![Message::user_text("old")]);
        sequencer.enqueue(s2.clone(), vec![Message::user_text("new")]);

        let released = sequencer.release_next(Some(&s2)).expect("current item");
        assert_eq!(released.messages[0].text(), "new");
        assert!(sequencer.is_empty());

        sequencer.enqueue(s1, vec![Message::user_text("orphan")]);
        assert!(sequencer.release_next(None).is_none());
        assert!(sequencer.is_empty());
    }
}
