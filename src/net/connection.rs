//! Per-connection handle shared between the reader task, the writer task,
//! and the dispatcher.
//!
//! # Responsibilities
//! - Generate unique connection ids for map keys and tracing
//! - Queue outbound envelopes for the connection's writer task
//! - Carry the close signal and the combined read/write deadline
//!
//! # Design Decisions
//! - Connection id is a process-wide u64 counter; ids are never reused
//! - Outbound writes go through an unbounded queue so the dispatcher never
//!   blocks on a slow peer; the peer's own deadline drops it eventually
//! - The deadline is shared state: the reader enforces it, both reader and
//!   writer extend it after a successful frame

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

use crate::proto::{Packets, Signed};

/// Deadline applied after every successfully received or sent frame.
pub const DEADLINE: Duration = Duration::from_secs(180);

/// Initial deadline right after accept, before the first frame arrives.
pub const CONNECT_DEADLINE: Duration = Duration::from_secs(15);

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(u64);

impl ConnId {
    fn next() -> Self {
        ConnId(NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Combined read/write deadline for one connection.
///
/// Stored as an absolute instant so the reader can `timeout_at` it while the
/// writer task pushes it forward concurrently.
#[derive(Clone)]
pub struct Deadline(Arc<Mutex<Instant>>);

impl Deadline {
    pub fn starting_at(dur: Duration) -> Self {
        Deadline(Arc::new(Mutex::new(Instant::now() + dur)))
    }

    /// Push the deadline to now + `dur`.
    pub fn extend(&self, dur: Duration) {
        *self.0.lock().expect("deadline lock poisoned") = Instant::now() + dur;
    }

    pub fn instant(&self) -> Instant {
        *self.0.lock().expect("deadline lock poisoned")
    }

    pub fn expired(&self) -> bool {
        self.instant() <= Instant::now()
    }
}

/// Handle to one live client connection.
///
/// The reader task owns the socket's read half and the writer task drains
/// `outbound` into the write half; everything else (tracker, dispatcher)
/// holds this handle.
pub struct Connection {
    id: ConnId,
    peer: SocketAddr,
    ip: String,
    outbound: mpsc::UnboundedSender<Packets>,
    closed: AtomicBool,
    close_notify: Notify,
    deadline: Deadline,
}

impl Connection {
    /// Create the handle plus the receiving end for the writer task.
    pub fn new(peer: SocketAddr) -> (Arc<Self>, mpsc::UnboundedReceiver<Packets>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Connection {
            id: ConnId::next(),
            peer,
            ip: peer.ip().to_string(),
            outbound: tx,
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
            deadline: Deadline::starting_at(CONNECT_DEADLINE),
        });
        (conn, rx)
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Remote host with the port stripped; ban accounting is per-IP.
    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn deadline(&self) -> &Deadline {
        &self.deadline
    }

    /// Queue one envelope for the writer task. Returns false if the writer
    /// has already gone away; callers treat that like any other write error.
    pub fn send(&self, msgs: Vec<Signed>) -> bool {
        self.send_packets(Packets { packet: msgs })
    }

    pub fn send_packets(&self, packets: Packets) -> bool {
        self.outbound.send(packets).is_ok()
    }

    /// Ask the reader task to drop the connection.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.close_notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once `close` has been called.
    pub async fn wait_closed(&self) {
        loop {
            let notified = self.close_notify.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_peer() -> SocketAddr {
        "10.1.2.3:4567".parse().unwrap()
    }

    #[test]
    fn ids_are_unique() {
        let (a, _rx_a) = Connection::new(test_peer());
        let (b, _rx_b) = Connection::new(test_peer());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn ip_strips_port() {
        let (conn, _rx) = Connection::new(test_peer());
        assert_eq!(conn.ip(), "10.1.2.3");
    }

    #[tokio::test]
    async fn send_queues_until_receiver_drops() {
        let (conn, mut rx) = Connection::new(test_peer());
        assert!(conn.send(vec![Signed::default()]));
        assert_eq!(rx.recv().await.unwrap().packet.len(), 1);

        drop(rx);
        assert!(!conn.send(vec![Signed::default()]));
    }

    #[tokio::test]
    async fn close_wakes_waiter_even_if_signalled_first() {
        let (conn, _rx) = Connection::new(test_peer());
        conn.close();
        // No waiter was parked when close fired; the flag still resolves it.
        tokio::time::timeout(Duration::from_secs(1), conn.wait_closed())
            .await
            .expect("wait_closed should resolve after close");
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn deadline_extension_moves_forward() {
        let deadline = Deadline::starting_at(Duration::from_millis(1));
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(deadline.expired());
        deadline.extend(DEADLINE);
        assert!(!deadline.expired());
    }
}
