use tokio::sync::mpsc::{self, error::TrySendError, Receiver, Sender};

use crate::dedup::KeyedEvent;
use crate::pipeline::Rejected;

/// Producer side of the bounded intake buffer.
///
/// Enqueueing never waits: a full buffer rejects the event immediately so
/// overload is visible to the caller instead of turning into latency.
#[derive(Clone, Debug)]
pub struct IntakeQueue {
    sender: Sender<KeyedEvent>,
    capacity: usize,
}

/// Builds the queue and the receiver owned by the batch assembler.
/// Capacity is fixed for the lifetime of the queue, with a floor of one slot.
pub fn intake_queue(capacity: usize) -> (IntakeQueue, Receiver<KeyedEvent>) {
    let capacity = capacity.max(1);
    let (sender, receiver) = mpsc::channel(capacity);
    (IntakeQueue { sender, capacity }, receiver)
}

impl IntakeQueue {
    /// Hands the event over to the assembler, or gives it back to the
    /// caller's responsibility as a rejection.
    pub fn enqueue(&self, event: KeyedEvent) -> Result<(), Rejected> {
        match self.sender.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(Rejected::QueueFull),
            Err(TrySendError::Closed(_)) => Err(Rejected::ShuttingDown),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Events currently waiting for the assembler.
    pub fn queued(&self) -> usize {
        self.capacity - self.sender.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;

    fn keyed(user_id: &str) -> KeyedEvent {
        Event {
            name: "open".to_string(),
            user_id: user_id.to_string(),
            timestamp: 1_700_000_000,
            ..Default::default()
        }
        .into()
    }

    #[tokio::test]
    async fn rejects_when_full_without_touching_queued_events() {
        let (queue, mut receiver) = intake_queue(2);

        assert_eq!(queue.enqueue(keyed("a")), Ok(()));
        assert_eq!(queue.enqueue(keyed("b")), Ok(()));
        assert_eq!(queue.enqueue(keyed("c")), Err(Rejected::QueueFull));
        assert_eq!(queue.queued(), 2);

        assert_eq!(receiver.recv().await.unwrap().event.user_id, "a");
        assert_eq!(receiver.recv().await.unwrap().event.user_id, "b");
        assert!(receiver.try_recv().is_err());

        // Draining frees capacity again
        assert_eq!(queue.enqueue(keyed("d")), Ok(()));
    }

    #[tokio::test]
    async fn rejects_once_the_receiver_is_closed() {
        let (queue, mut receiver) = intake_queue(4);
        receiver.close();

        assert_eq!(queue.enqueue(keyed("a")), Err(Rejected::ShuttingDown));
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let (queue, _receiver) = intake_queue(0);
        assert_eq!(queue.capacity(), 1);
        assert_eq!(queue.queued(), 0);
    }
}
