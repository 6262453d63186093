//! Payloads and registrar rollups
//!
//! A payload is one spooled batch tracked until every event is
//! acknowledged. Acknowledgements arrive relative to the transmitted tail,
//! so a payload resent after a partial ack only carries the events the
//! previous endpoint did not confirm.

use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use courier_protocol::{Event, Nonce};
use courier_transport::TransportPayload;

/// Key of a payload in submission order
pub type PayloadKey = u64;

/// Highest offset committed for one source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceOffset {
    pub source: String,
    pub offset: u64,
}

/// Commit record for the registrar: the events newly covered by the
/// acknowledged prefix of one payload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rollup {
    pub lines: usize,
    /// Sources in first-seen order; events without an offset count as lines only
    pub offsets: Vec<SourceOffset>,
}

impl Rollup {
    fn add(&mut self, event: &Event) {
        self.lines += 1;
        let Some(offset) = event.offset() else {
            return;
        };
        match self.offsets.iter_mut().find(|o| o.source == event.source()) {
            Some(entry) => entry.offset = entry.offset.max(offset),
            None => self.offsets.push(SourceOffset {
                source: event.source().to_string(),
                offset,
            }),
        }
    }
}

/// A batch of events awaiting acknowledgement
#[derive(Debug)]
pub struct Payload {
    key: PayloadKey,
    events: Arc<[Event]>,
    ack_sequence: usize,
    rolled_up: usize,
    sent_offset: usize,
    resending: bool,
    nonce: Option<Nonce>,
    compressed: Arc<OnceLock<Bytes>>,
}

impl Payload {
    pub fn new(key: PayloadKey, events: Vec<Event>) -> Self {
        Self {
            key,
            events: events.into(),
            ack_sequence: 0,
            rolled_up: 0,
            sent_offset: 0,
            resending: false,
            nonce: None,
            compressed: Arc::default(),
        }
    }

    #[inline]
    pub fn key(&self) -> PayloadKey {
        self.key
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    #[inline]
    pub fn ack_sequence(&self) -> usize {
        self.ack_sequence
    }

    /// Events not yet acknowledged
    #[inline]
    pub fn remaining(&self) -> usize {
        self.events.len() - self.ack_sequence
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.ack_sequence == self.events.len()
    }

    /// Acknowledged events not yet handed to the registrar
    #[inline]
    pub fn has_ack(&self) -> bool {
        self.ack_sequence > self.rolled_up
    }

    #[inline]
    pub fn is_resending(&self) -> bool {
        self.resending
    }

    pub fn set_resending(&mut self, resending: bool) {
        self.resending = resending;
    }

    /// Nonce of the current transmission
    #[inline]
    pub fn nonce(&self) -> Option<Nonce> {
        self.nonce
    }

    /// Where the current transmission starts in the event list
    #[inline]
    pub fn sent_offset(&self) -> usize {
        self.sent_offset
    }

    /// The unacknowledged tail, as a transmission under `nonce`
    ///
    /// The compressed form is kept while the tail is unchanged and dropped
    /// once acknowledgements have moved the start.
    pub fn transmission(&mut self, nonce: Nonce) -> TransportPayload {
        if self.sent_offset != self.ack_sequence {
            self.sent_offset = self.ack_sequence;
            self.compressed = Arc::default();
        }
        self.nonce = Some(nonce);
        TransportPayload::new(
            nonce,
            Arc::clone(&self.events),
            self.sent_offset,
            Arc::clone(&self.compressed),
        )
    }

    /// Record `lines` more acknowledged events
    ///
    /// Returns true when these are the first events of the payload to be
    /// acknowledged.
    pub fn acknowledge(&mut self, lines: usize) -> bool {
        let first = self.ack_sequence == 0 && lines > 0;
        self.ack_sequence = (self.ack_sequence + lines).min(self.events.len());
        first
    }

    /// Take the acknowledged events not yet committed
    pub fn rollup(&mut self) -> Rollup {
        let mut rollup = Rollup::default();
        for event in &self.events[self.rolled_up..self.ack_sequence] {
            rollup.add(event);
        }
        self.rolled_up = self.ack_sequence;
        rollup
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events(source: &str, offsets: &[u64]) -> Vec<Event> {
        offsets
            .iter()
            .map(|&o| Event::builder("line").source(source).offset(o).build())
            .collect()
    }

    #[test]
    fn test_partial_ack_rollups() {
        let mut events = events("/a.log", &[10, 20, 30]);
        events.push(Event::builder("x").source("/b.log").offset(5).build());
        let mut payload = Payload::new(1, events);

        assert!(!payload.has_ack());
        assert!(payload.acknowledge(2));
        assert!(payload.has_ack());
        let first = payload.rollup();
        assert_eq!(first.lines, 2);
        assert_eq!(
            first.offsets,
            [SourceOffset {
                source: "/a.log".into(),
                offset: 20
            }]
        );
        assert!(!payload.has_ack());

        assert!(!payload.acknowledge(2));
        assert!(payload.is_complete());
        let second = payload.rollup();
        assert_eq!(second.lines, 2);
        assert_eq!(second.offsets.len(), 2);
        assert_eq!(second.offsets[1].offset, 5);
    }

    #[test]
    fn test_acknowledge_is_clamped() {
        let mut payload = Payload::new(1, events("/a.log", &[1, 2]));
        payload.acknowledge(9);
        assert_eq!(payload.ack_sequence(), 2);
        assert_eq!(payload.remaining(), 0);
    }

    #[test]
    fn test_retransmission_carries_tail() {
        let mut payload = Payload::new(1, events("/a.log", &[1, 2, 3]));
        let first = payload.transmission(Nonce::random());
        assert_eq!(first.len(), 3);
        let compressed = first.compressed().unwrap();

        // Unchanged tail reuses the compressed stream
        let again = payload.transmission(Nonce::random());
        assert_eq!(again.compressed().unwrap(), compressed);

        payload.acknowledge(1);
        let nonce = Nonce::random();
        let resent = payload.transmission(nonce);
        assert_eq!(payload.sent_offset(), 1);
        assert_eq!(payload.nonce(), Some(nonce));
        assert_eq!(resent.len(), 2);
        assert_eq!(resent.events()[0].offset(), Some(2));
        assert_ne!(resent.compressed().unwrap(), compressed);
    }
}
