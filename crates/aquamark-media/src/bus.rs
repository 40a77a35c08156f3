// crates/aquamark-media/src/bus.rs
//
// Per-job publish/subscribe of progress events.
//
// Delivery contract: intermediate events are lossy — a subscriber whose
// mailbox is full simply misses that update (a newer one supersedes it).
// The terminal event is attempted for every subscriber, after which the
// job's subscriber list is dropped; receivers observe the disconnect as
// end-of-stream. Publishing never blocks and never holds the job-table lock
// (the bus has its own).

use std::collections::HashMap;
use std::sync::Mutex;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use uuid::Uuid;

use aquamark_core::progress::ProgressEvent;

/// Per-subscriber mailbox depth. Slow subscribers lose intermediate events
/// once this fills; they never block a worker.
const SUBSCRIBER_MAILBOX: usize = 64;

#[derive(Default)]
pub struct ProgressBus {
    subscribers: Mutex<HashMap<Uuid, Vec<Sender<ProgressEvent>>>>,
}

impl ProgressBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a stream of events for `job_id`. The stream ends (disconnects)
    /// after the job's terminal event.
    pub fn subscribe(&self, job_id: Uuid) -> Receiver<ProgressEvent> {
        let (tx, rx) = bounded(SUBSCRIBER_MAILBOX);
        self.subscribers.lock().unwrap().entry(job_id).or_default().push(tx);
        rx
    }

    /// Deliver an intermediate event, dropping it for any subscriber whose
    /// mailbox is full and pruning disconnected subscribers.
    pub fn publish(&self, event: &ProgressEvent) {
        let mut subs = self.subscribers.lock().unwrap();
        let Some(senders) = subs.get_mut(&event.job_id) else { return };
        senders.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        });
        if senders.is_empty() {
            subs.remove(&event.job_id);
        }
    }

    /// Deliver a terminal event and tear the subscription down. Dropping the
    /// senders is what signals end-of-stream to receivers.
    pub fn publish_terminal(&self, event: &ProgressEvent) {
        let senders = self.subscribers.lock().unwrap().remove(&event.job_id);
        for tx in senders.into_iter().flatten() {
            let _ = tx.try_send(event.clone());
        }
    }

    /// Drop every subscription. Called on engine shutdown after the final
    /// terminal events have gone out.
    pub fn clear(&self) {
        self.subscribers.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aquamark_core::job::JobStatus;

    fn event(id: Uuid, status: JobStatus, progress: f32) -> ProgressEvent {
        ProgressEvent::new(id, status, progress, "test")
    }

    #[test]
    fn subscriber_receives_published_events() {
        let bus = ProgressBus::new();
        let id = Uuid::new_v4();
        let rx = bus.subscribe(id);

        bus.publish(&event(id, JobStatus::Processing, 10.0));
        bus.publish(&event(id, JobStatus::Processing, 20.0));

        assert_eq!(rx.recv().unwrap().progress, 10.0);
        assert_eq!(rx.recv().unwrap().progress, 20.0);
    }

    #[test]
    fn events_are_scoped_to_their_job() {
        let bus = ProgressBus::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let rx_a = bus.subscribe(a);
        let _rx_b = bus.subscribe(b);

        bus.publish(&event(b, JobStatus::Processing, 50.0));
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn terminal_event_ends_the_stream() {
        let bus = ProgressBus::new();
        let id = Uuid::new_v4();
        let rx = bus.subscribe(id);

        bus.publish(&event(id, JobStatus::Processing, 40.0));
        bus.publish_terminal(&event(id, JobStatus::Completed, 100.0));

        let mut seen = Vec::new();
        while let Ok(ev) = rx.recv() {
            seen.push(ev);
        }
        // Disconnect reached — the last event is the terminal one.
        assert_eq!(seen.last().unwrap().status, JobStatus::Completed);
        assert_eq!(seen.last().unwrap().progress, 100.0);
    }

    #[test]
    fn full_mailbox_never_blocks_the_publisher() {
        let bus = ProgressBus::new();
        let id = Uuid::new_v4();
        let rx = bus.subscribe(id);

        // Nobody drains rx; publish far past the mailbox depth.
        for i in 0..(SUBSCRIBER_MAILBOX * 4) {
            bus.publish(&event(id, JobStatus::Processing, i as f32));
        }
        bus.publish_terminal(&event(id, JobStatus::Error, 0.0));

        // The subscriber still sees a bounded number of events and then
        // end-of-stream.
        let drained = rx.iter().count();
        assert!(drained <= SUBSCRIBER_MAILBOX + 1);
    }

    #[test]
    fn publishing_to_a_dropped_subscriber_prunes_it() {
        let bus = ProgressBus::new();
        let id = Uuid::new_v4();
        drop(bus.subscribe(id));
        bus.publish(&event(id, JobStatus::Processing, 1.0));
        assert!(bus.subscribers.lock().unwrap().get(&id).is_none());
    }
}
