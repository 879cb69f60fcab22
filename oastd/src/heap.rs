use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::event::Event;

/// Min-heap of events keyed by timestamp.
///
/// Eviction (capacity and TTL alike) always removes the event with the
/// earliest `time`. Events arrive in near-monotonic order, but receivers run
/// on separate tasks with slight clock skew, so out-of-order inserts must be
/// tolerated. Ordering between events with the same timestamp is unspecified.
#[derive(Debug, Default)]
pub struct EventHeap(BinaryHeap<OldestFirst>);

impl EventHeap {
    pub fn new() -> Self {
        Self(BinaryHeap::new())
    }

    pub fn push(&mut self, event: Event) {
        self.0.push(OldestFirst(event));
    }

    /// Removes and returns the event with the earliest `time`.
    pub fn pop(&mut self) -> Option<Event> {
        self.0.pop().map(|entry| entry.0)
    }

    pub fn peek(&self) -> Option<&Event> {
        self.0.peek().map(|entry| &entry.0)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Copies the events out in the heap's current internal order.
    pub fn to_vec(&self) -> Vec<Event> {
        self.0.iter().map(|entry| entry.0.clone()).collect()
    }
}

#[derive(Debug)]
struct OldestFirst(Event);

impl PartialEq for OldestFirst {
    fn eq(&self, other: &Self) -> bool {
        self.0.time == other.0.time
    }
}

impl Eq for OldestFirst {}

impl PartialOrd for OldestFirst {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OldestFirst {
    // BinaryHeap is a max-heap; reverse the comparison so the earliest event
    // sits on top.
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.time.cmp(&self.0.time)
    }
}

#[cfg(test)]
mod tests {
    use time::OffsetDateTime;
    use time::macros::datetime;

    use super::*;
    use crate::event::Receiver;

    fn event_at(time: OffsetDateTime) -> Event {
        Event {
            id: "eventid".to_owned(),
            time,
            test_id: "testid".to_owned(),
            receiver: Receiver::Http,
            remote_addr: String::new(),
            dump: String::new(),
            query_type: String::new(),
        }
    }

    #[test]
    fn pops_in_time_order_regardless_of_insertion_order() {
        let mut heap = EventHeap::new();
        heap.push(event_at(datetime!(2024-05-01 12:00:03 UTC)));
        heap.push(event_at(datetime!(2024-05-01 12:00:01 UTC)));
        heap.push(event_at(datetime!(2024-05-01 12:00:02 UTC)));

        assert_eq!(heap.len(), 3);
        assert_eq!(
            heap.peek().map(|event| event.time),
            Some(datetime!(2024-05-01 12:00:01 UTC))
        );

        let mut popped = Vec::new();
        while let Some(event) = heap.pop() {
            popped.push(event.time);
        }

        assert_eq!(
            popped,
            vec![
                datetime!(2024-05-01 12:00:01 UTC),
                datetime!(2024-05-01 12:00:02 UTC),
                datetime!(2024-05-01 12:00:03 UTC),
            ]
        );
        assert!(heap.is_empty());
        assert!(heap.pop().is_none());
    }

    #[test]
    fn snapshot_contains_every_event() {
        let mut heap = EventHeap::new();
        heap.push(event_at(datetime!(2024-05-01 12:00:02 UTC)));
        heap.push(event_at(datetime!(2024-05-01 12:00:01 UTC)));

        let snapshot = heap.to_vec();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(heap.len(), 2);
    }
}
