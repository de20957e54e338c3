//! Stream registry shared by both read-loop directions
//!
//! Maps stream ids to application connections. Every entry records which
//! side allocated the id ([`Origin`]) and where it is in its lifecycle:
//!
//! ```text
//!              insert / dial ok                 CLOSE or local failure
//!   Absent ─────────────────────────▶ Active ─────────────────────────▶ Closing
//!     ▲                                  │                                 │
//!     └──────────────────────────────────┴─────────────────────────────────┘
//!                 removed by the side entitled to finalize teardown
//! ```
//!
//! A `Closing` entry is a tombstone: the id is known, it is no longer routed,
//! and it must not be re-dialed while the two directions finish tearing down.
//!
//! The lock is held only for individual map operations. Dialing a new
//! application connection happens in its own task behind a `Dialing`
//! placeholder; payloads arriving for the id meanwhile are parked in the
//! placeholder and flushed in order before the stream becomes `Active`.

use bytes::Bytes;
use nodemux_proto::StreamId;
use std::collections::HashMap;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

use crate::app_conn::AppConnection;
use crate::config::DEFAULT_DIAL_BACKLOG_BYTES;

/// Which side allocated a stream id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Assigned by our acceptor; we own the id and free it
    Local,
    /// Learned from the peer's first frame; we dialed the application
    Peer,
}

/// Lifecycle state of a stream id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Absent,
    Dialing,
    Active,
    Closing,
}

/// Identifies one dial, so a dial that outlived its placeholder cannot
/// claim a newer one for the same id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialTicket(u64);

struct PendingDial {
    ticket: u64,
    parked: Vec<Bytes>,
    parked_bytes: usize,
    overflowed: bool,
}

impl PendingDial {
    fn new(ticket: u64) -> Self {
        Self {
            ticket,
            parked: Vec::new(),
            parked_bytes: 0,
            overflowed: false,
        }
    }

    fn park(&mut self, payload: Bytes, limit: usize) {
        if payload.is_empty() || self.overflowed {
            return;
        }
        if self.parked_bytes + payload.len() > limit {
            // The stream is closed once the dial lands
            self.overflowed = true;
            self.parked.clear();
            self.parked_bytes = 0;
            return;
        }
        self.parked_bytes += payload.len();
        self.parked.push(payload);
    }
}

enum Slot {
    Dialing(PendingDial),
    Active(Arc<AppConnection>),
    Closing(Arc<AppConnection>),
}

struct Entry {
    origin: Origin,
    slot: Slot,
}

impl Entry {
    fn holds(&self, conn: &Arc<AppConnection>) -> bool {
        match &self.slot {
            Slot::Active(c) | Slot::Closing(c) => Arc::ptr_eq(c, conn),
            Slot::Dialing(_) => false,
        }
    }

    fn is_dial(&self, ticket: DialTicket) -> bool {
        matches!(&self.slot, Slot::Dialing(pending) if pending.ticket == ticket.0)
    }
}

/// Where an inbound payload for a stream id goes
#[derive(Debug)]
pub enum Route {
    /// Write it to this active connection
    Deliver(Arc<AppConnection>, Bytes),
    /// Parked behind a dial already in progress
    Parked,
    /// Unknown id, now `Dialing` with the payload parked; the caller must
    /// dial and report back with the ticket
    Dial(DialTicket),
    /// Closing, or the registry is shut down; drop the frame
    Drop,
}

/// Next step for a task whose dial succeeded
#[derive(Debug)]
pub enum DialProgress {
    /// Write these parked payloads, then settle again
    Flush(Vec<Bytes>),
    /// Stream is now active; `overflowed` means parked data was discarded
    /// and the stream must be closed
    Ready { overflowed: bool },
    /// Placeholder is gone (CLOSE, shutdown or a reused id); discard the
    /// connection
    Abandoned,
}

/// What a CLOSE frame from the peer did
#[derive(Debug)]
pub enum PeerClose {
    /// An active stream was closed and must be torn down locally
    Closed(Arc<AppConnection>),
    /// A tombstone left by our own earlier CLOSE was cleared
    Finalized,
    /// Nothing to do
    Ignored,
}

/// What an app read loop must do when it exits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// Stream was still active: tell the peer with a CLOSE frame
    Announce,
    /// Peer closed first and still holds a tombstone: send a CLOSE back so
    /// it can clear it
    Acknowledge,
    /// Already handled
    Silent,
}

impl Teardown {
    pub fn sends_close(self) -> bool {
        self != Teardown::Silent
    }
}

#[derive(Default)]
struct Streams {
    entries: HashMap<StreamId, Entry>,
    next_ticket: u64,
    shut_down: bool,
}

/// Concurrency-safe stream id → application connection map
pub struct StreamRegistry {
    streams: Mutex<Streams>,
    dial_backlog_bytes: usize,
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::with_dial_backlog(DEFAULT_DIAL_BACKLOG_BYTES)
    }

    /// Registry parking at most `dial_backlog_bytes` of payload per pending
    /// dial
    pub fn with_dial_backlog(dial_backlog_bytes: usize) -> Self {
        Self {
            streams: Mutex::new(Streams::default()),
            dial_backlog_bytes,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Streams> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Active connection for `id`, without dialing
    pub fn lookup(&self, id: StreamId) -> Option<Arc<AppConnection>> {
        match self.lock().entries.get(&id) {
            Some(Entry {
                slot: Slot::Active(conn),
                ..
            }) => Some(conn.clone()),
            _ => None,
        }
    }

    /// Route `payload` for `id`, starting a dial if the id is unknown
    ///
    /// At most one dial runs per absent id. While it is pending, later
    /// payloads for the id are parked rather than returned. Tombstoned ids
    /// are never re-dialed.
    pub fn get_or_dial(&self, id: StreamId, payload: Bytes) -> Route {
        let limit = self.dial_backlog_bytes;
        let mut guard = self.lock();
        let streams = &mut *guard;
        if streams.shut_down {
            return Route::Drop;
        }

        if let Some(entry) = streams.entries.get_mut(&id) {
            return match &mut entry.slot {
                Slot::Active(conn) => Route::Deliver(conn.clone(), payload),
                Slot::Closing(_) => Route::Drop,
                Slot::Dialing(pending) => {
                    pending.park(payload, limit);
                    Route::Parked
                }
            };
        }

        streams.next_ticket += 1;
        let mut pending = PendingDial::new(streams.next_ticket);
        pending.park(payload, limit);
        let ticket = DialTicket(pending.ticket);
        streams.entries.insert(
            id,
            Entry {
                origin: Origin::Peer,
                slot: Slot::Dialing(pending),
            },
        );
        Route::Dial(ticket)
    }

    /// Report a successful dial for `id`
    ///
    /// Hands out parked payloads until none are left, then registers `conn`
    /// as active. The caller writes each batch before settling again, so
    /// parked bytes always reach the application ahead of anything routed
    /// to the active connection.
    pub fn settle_dial(
        &self,
        id: StreamId,
        ticket: DialTicket,
        conn: &Arc<AppConnection>,
    ) -> DialProgress {
        let mut guard = self.lock();
        let streams = &mut *guard;
        let owned = streams
            .entries
            .get(&id)
            .is_some_and(|entry| entry.is_dial(ticket));
        if !owned {
            return DialProgress::Abandoned;
        }
        if streams.shut_down {
            streams.entries.remove(&id);
            return DialProgress::Abandoned;
        }

        let Some(entry) = streams.entries.get_mut(&id) else {
            return DialProgress::Abandoned;
        };
        let Slot::Dialing(pending) = &mut entry.slot else {
            return DialProgress::Abandoned;
        };
        if !pending.parked.is_empty() {
            pending.parked_bytes = 0;
            return DialProgress::Flush(mem::take(&mut pending.parked));
        }

        let overflowed = pending.overflowed;
        entry.slot = Slot::Active(conn.clone());
        DialProgress::Ready { overflowed }
    }

    /// Report a failed dial for `id`
    ///
    /// Removes the placeholder if it is still this dial's, dropping whatever
    /// was parked. Returns the number of payloads dropped.
    pub fn abandon_dial(&self, id: StreamId, ticket: DialTicket) -> usize {
        let mut streams = self.lock();
        if !streams
            .entries
            .get(&id)
            .is_some_and(|entry| entry.is_dial(ticket))
        {
            return 0;
        }
        match streams.entries.remove(&id) {
            Some(Entry {
                slot: Slot::Dialing(pending),
                ..
            }) => pending.parked.len(),
            _ => 0,
        }
    }

    /// Register a locally accepted connection under a freshly allocated id
    ///
    /// Returns `false` once the registry has been shut down; the caller
    /// must close the connection.
    pub fn insert(&self, id: StreamId, conn: Arc<AppConnection>) -> bool {
        let mut streams = self.lock();
        if streams.shut_down {
            return false;
        }

        let previous = streams.entries.insert(
            id,
            Entry {
                origin: Origin::Local,
                slot: Slot::Active(conn),
            },
        );
        if previous.is_some() {
            // Stream ids wrap after 2^32 allocations without a liveness check
            warn!(stream_id = id, "Stream id reused while still registered");
        }
        true
    }

    /// Apply a CLOSE frame received from the peer
    ///
    /// Peer-originated streams are removed outright. Locally originated
    /// streams are tombstoned so their app read loop, which owns the id,
    /// removes them once it has stopped. A tombstone we left after sending
    /// our own CLOSE is cleared by the peer's answering CLOSE.
    pub fn close_from_peer(&self, id: StreamId) -> PeerClose {
        let mut streams = self.lock();
        let Some(entry) = streams.entries.get_mut(&id) else {
            return PeerClose::Ignored;
        };

        match (entry.origin, &entry.slot) {
            (Origin::Peer, Slot::Active(conn)) => {
                let conn = conn.clone();
                streams.entries.remove(&id);
                PeerClose::Closed(conn)
            }
            (Origin::Local, Slot::Active(conn)) => {
                let conn = conn.clone();
                entry.slot = Slot::Closing(conn.clone());
                PeerClose::Closed(conn)
            }
            (Origin::Peer, Slot::Closing(_)) => {
                streams.entries.remove(&id);
                PeerClose::Finalized
            }
            (Origin::Local, Slot::Closing(_)) => PeerClose::Ignored,
            (_, Slot::Dialing(_)) => {
                // The dial task finds the placeholder gone and discards its
                // connection; parked payloads go with it
                streams.entries.remove(&id);
                debug!(stream_id = id, "Stream closed while dialing");
                PeerClose::Ignored
            }
        }
    }

    /// Settle the registry entry when an app read loop stops
    ///
    /// `conn` guards against acting on an entry that no longer belongs to
    /// the exiting loop.
    pub fn finish_local(&self, id: StreamId, conn: &Arc<AppConnection>) -> Teardown {
        let mut streams = self.lock();
        let Some(entry) = streams.entries.get_mut(&id) else {
            return Teardown::Silent;
        };
        if !entry.holds(conn) {
            return Teardown::Silent;
        }

        match (entry.origin, &entry.slot) {
            (Origin::Local, Slot::Active(_)) => {
                streams.entries.remove(&id);
                Teardown::Announce
            }
            (Origin::Peer, Slot::Active(active)) => {
                let active = active.clone();
                entry.slot = Slot::Closing(active);
                Teardown::Announce
            }
            (Origin::Local, Slot::Closing(_)) => {
                streams.entries.remove(&id);
                Teardown::Acknowledge
            }
            (Origin::Peer, Slot::Closing(_)) | (_, Slot::Dialing(_)) => Teardown::Silent,
        }
    }

    /// Mark the registry shut down and return every active connection
    ///
    /// Later inserts and dials are refused so nothing registered during
    /// teardown escapes it.
    pub fn snapshot_for_close(&self) -> Vec<Arc<AppConnection>> {
        let mut streams = self.lock();
        streams.shut_down = true;
        streams
            .entries
            .values()
            .filter_map(|entry| match &entry.slot {
                Slot::Active(conn) => Some(conn.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn state(&self, id: StreamId) -> StreamState {
        match self.lock().entries.get(&id).map(|entry| &entry.slot) {
            None => StreamState::Absent,
            Some(Slot::Dialing(_)) => StreamState::Dialing,
            Some(Slot::Active(_)) => StreamState::Active,
            Some(Slot::Closing(_)) => StreamState::Closing,
        }
    }

    pub fn origin(&self, id: StreamId) -> Option<Origin> {
        self.lock().entries.get(&id).map(|entry| entry.origin)
    }

    /// Number of registered ids, tombstones included
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of ids with a live connection
    pub fn active_streams(&self) -> usize {
        self.lock()
            .entries
            .values()
            .filter(|entry| matches!(entry.slot, Slot::Active(_)))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app_conn() -> Arc<AppConnection> {
        let (local, remote) = tokio::io::duplex(64);
        // Keep the remote end alive for the duration of the test
        std::mem::forget(remote);
        AppConnection::split(local, "test").0
    }

    /// Take `id` from absent to an active, peer-originated stream
    fn dialed(registry: &StreamRegistry, id: StreamId) -> Arc<AppConnection> {
        let Route::Dial(ticket) = registry.get_or_dial(id, Bytes::new()) else {
            panic!("expected a dial");
        };
        let conn = app_conn();
        assert!(matches!(
            registry.settle_dial(id, ticket, &conn),
            DialProgress::Ready { overflowed: false }
        ));
        conn
    }

    #[test]
    fn test_insert_and_lookup() {
        let registry = StreamRegistry::new();
        let conn = app_conn();

        assert!(registry.insert(1, conn.clone()));
        assert_eq!(registry.state(1), StreamState::Active);
        assert_eq!(registry.origin(1), Some(Origin::Local));
        assert!(Arc::ptr_eq(&registry.lookup(1).unwrap(), &conn));
        assert!(registry.lookup(2).is_none());
        assert_eq!(registry.state(2), StreamState::Absent);
    }

    #[test]
    fn test_get_or_dial_dials_once() {
        let registry = StreamRegistry::new();

        let Route::Dial(ticket) = registry.get_or_dial(7, Bytes::from_static(b"a")) else {
            panic!("expected a dial");
        };
        assert_eq!(registry.state(7), StreamState::Dialing);
        assert_eq!(registry.origin(7), Some(Origin::Peer));

        // Later payloads wait behind the pending dial
        assert!(matches!(
            registry.get_or_dial(7, Bytes::from_static(b"b")),
            Route::Parked
        ));

        let conn = app_conn();
        match registry.settle_dial(7, ticket, &conn) {
            DialProgress::Flush(parked) => assert_eq!(parked, vec![&b"a"[..], &b"b"[..]]),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(registry.state(7), StreamState::Dialing);

        // Anything parked while the first batch was written comes next
        registry.get_or_dial(7, Bytes::from_static(b"c"));
        match registry.settle_dial(7, ticket, &conn) {
            DialProgress::Flush(parked) => assert_eq!(parked, vec![&b"c"[..]]),
            other => panic!("unexpected {:?}", other),
        }

        assert!(matches!(
            registry.settle_dial(7, ticket, &conn),
            DialProgress::Ready { overflowed: false }
        ));
        match registry.get_or_dial(7, Bytes::from_static(b"d")) {
            Route::Deliver(active, payload) => {
                assert!(Arc::ptr_eq(&active, &conn));
                assert_eq!(payload, &b"d"[..]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_pending_dials_are_independent() {
        let registry = StreamRegistry::new();

        let Route::Dial(slow) = registry.get_or_dial(1, Bytes::from_static(b"x")) else {
            panic!("expected a dial");
        };
        let fast_conn = dialed(&registry, 2);

        // Stream 2 is routed while stream 1 is still dialing
        assert!(matches!(
            registry.get_or_dial(2, Bytes::from_static(b"y")),
            Route::Deliver(conn, _) if Arc::ptr_eq(&conn, &fast_conn)
        ));
        assert_eq!(registry.state(1), StreamState::Dialing);

        // A ticket only settles its own placeholder
        assert!(matches!(
            registry.settle_dial(2, slow, &app_conn()),
            DialProgress::Abandoned
        ));
        assert_eq!(registry.state(2), StreamState::Active);
    }

    #[test]
    fn test_dial_failure_leaves_absent() {
        let registry = StreamRegistry::new();

        let Route::Dial(ticket) = registry.get_or_dial(4, Bytes::from_static(b"one")) else {
            panic!("expected a dial");
        };
        registry.get_or_dial(4, Bytes::from_static(b"two"));

        assert_eq!(registry.abandon_dial(4, ticket), 2);
        assert_eq!(registry.state(4), StreamState::Absent);
        assert!(registry.is_empty());

        // A later frame starts over with a fresh dial
        assert!(matches!(registry.get_or_dial(4, Bytes::new()), Route::Dial(t) if t != ticket));
    }

    #[test]
    fn test_close_while_dialing_discards_dial() {
        let registry = StreamRegistry::new();

        let Route::Dial(stale) = registry.get_or_dial(6, Bytes::from_static(b"lost")) else {
            panic!("expected a dial");
        };
        assert!(matches!(registry.close_from_peer(6), PeerClose::Ignored));
        assert_eq!(registry.state(6), StreamState::Absent);

        // The id is reopened before the first dial lands
        let Route::Dial(fresh) = registry.get_or_dial(6, Bytes::new()) else {
            panic!("expected a dial");
        };

        let conn = app_conn();
        assert!(matches!(
            registry.settle_dial(6, stale, &conn),
            DialProgress::Abandoned
        ));
        assert_eq!(registry.abandon_dial(6, stale), 0);
        assert_eq!(registry.state(6), StreamState::Dialing);

        assert!(matches!(
            registry.settle_dial(6, fresh, &conn),
            DialProgress::Ready { overflowed: false }
        ));
    }

    #[test]
    fn test_backlog_overflow_closes_stream() {
        let registry = StreamRegistry::with_dial_backlog(8);

        let Route::Dial(ticket) = registry.get_or_dial(3, Bytes::from_static(b"12345")) else {
            panic!("expected a dial");
        };
        registry.get_or_dial(3, Bytes::from_static(b"6789"));
        registry.get_or_dial(3, Bytes::from_static(b"0"));

        // Nothing partial is flushed once data had to be discarded
        let conn = app_conn();
        assert!(matches!(
            registry.settle_dial(3, ticket, &conn),
            DialProgress::Ready { overflowed: true }
        ));
        assert_eq!(registry.state(3), StreamState::Active);
    }

    #[test]
    fn test_tombstone_is_not_redialed() {
        let registry = StreamRegistry::new();
        let conn = dialed(&registry, 5);

        // Local failure on a peer-originated stream leaves a tombstone
        assert_eq!(registry.finish_local(5, &conn), Teardown::Announce);
        assert_eq!(registry.state(5), StreamState::Closing);

        assert!(matches!(
            registry.get_or_dial(5, Bytes::from_static(b"late")),
            Route::Drop
        ));

        // The peer's answering CLOSE clears it
        assert!(matches!(registry.close_from_peer(5), PeerClose::Finalized));
        assert_eq!(registry.state(5), StreamState::Absent);
    }

    #[test]
    fn test_peer_close_removes_peer_stream() {
        let registry = StreamRegistry::new();
        let conn = dialed(&registry, 9);

        match registry.close_from_peer(9) {
            PeerClose::Closed(closed) => assert!(Arc::ptr_eq(&closed, &conn)),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(registry.state(9), StreamState::Absent);

        // The app loop then finds nothing to do
        assert_eq!(registry.finish_local(9, &conn), Teardown::Silent);
    }

    #[test]
    fn test_peer_close_tombstones_local_stream() {
        let registry = StreamRegistry::new();
        let conn = app_conn();
        registry.insert(1, conn.clone());

        assert!(matches!(registry.close_from_peer(1), PeerClose::Closed(_)));
        assert_eq!(registry.state(1), StreamState::Closing);

        // A repeated CLOSE does not resurrect or double-close
        assert!(matches!(registry.close_from_peer(1), PeerClose::Ignored));

        assert_eq!(registry.finish_local(1, &conn), Teardown::Acknowledge);
        assert_eq!(registry.state(1), StreamState::Absent);
    }

    #[test]
    fn test_local_failure_removes_local_stream() {
        let registry = StreamRegistry::new();
        let conn = app_conn();
        registry.insert(1, conn.clone());

        assert_eq!(registry.finish_local(1, &conn), Teardown::Announce);
        assert_eq!(registry.state(1), StreamState::Absent);

        // The peer's CLOSE crossing ours is ignored
        assert!(matches!(registry.close_from_peer(1), PeerClose::Ignored));
        assert_eq!(registry.state(1), StreamState::Absent);
    }

    #[test]
    fn test_close_unknown_id() {
        let registry = StreamRegistry::new();
        assert!(matches!(registry.close_from_peer(42), PeerClose::Ignored));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_finish_ignores_stale_connection() {
        let registry = StreamRegistry::new();
        let old = app_conn();
        let new = app_conn();
        registry.insert(1, new.clone());

        assert_eq!(registry.finish_local(1, &old), Teardown::Silent);
        assert_eq!(registry.state(1), StreamState::Active);
    }

    #[test]
    fn test_double_close_race_both_orders() {
        // Local failure first, then the peer's CLOSE
        let registry = StreamRegistry::new();
        let conn = app_conn();
        registry.insert(1, conn.clone());
        assert!(registry.finish_local(1, &conn).sends_close());
        assert!(matches!(registry.close_from_peer(1), PeerClose::Ignored));
        assert_eq!(registry.state(1), StreamState::Absent);

        // Peer's CLOSE first, then the local failure
        let registry = StreamRegistry::new();
        let conn = app_conn();
        registry.insert(1, conn.clone());
        assert!(matches!(registry.close_from_peer(1), PeerClose::Closed(_)));
        assert!(registry.finish_local(1, &conn).sends_close());
        assert_eq!(registry.state(1), StreamState::Absent);
        assert!(registry.lookup(1).is_none());
    }

    #[test]
    fn test_snapshot_for_close_shuts_registry() {
        let registry = StreamRegistry::new();
        let a = app_conn();
        let b = app_conn();
        registry.insert(1, a.clone());
        registry.insert(2, b.clone());
        registry.close_from_peer(2);

        let snapshot = registry.snapshot_for_close();
        assert_eq!(snapshot.len(), 1);
        assert!(Arc::ptr_eq(&snapshot[0], &a));

        let late = app_conn();
        assert!(!registry.insert(3, late));

        assert!(matches!(
            registry.get_or_dial(4, Bytes::from_static(b"late")),
            Route::Drop
        ));
    }

    #[test]
    fn test_active_streams_excludes_tombstones() {
        let registry = StreamRegistry::new();
        let a = app_conn();
        let b = app_conn();
        registry.insert(1, a);
        registry.insert(2, b);
        registry.close_from_peer(1);

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.active_streams(), 1);
    }
}
