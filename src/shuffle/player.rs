//! Per-connection player state.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::net::connection::Connection;
use crate::shuffle::pool::Pool;

/// Mutable state the server keeps for one registered client.
///
/// Owned by the [`Tracker`](crate::shuffle::tracker::Tracker) while the
/// connection is alive, and by a pool's frozen snapshot for as long as the
/// pool needs it to resolve blame accusations. The blame set carries its own
/// lock so it can be updated while tracker locks are held elsewhere.
pub struct PlayerData {
    session_id: Vec<u8>,
    verification_key: String,
    conn: Arc<Connection>,
    amount: u64,
    version: u64,
    shuffle_type: i32,
    number: AtomicU32,
    pool: Mutex<Weak<Pool>>,
    blamed_by: Mutex<HashSet<String>>,
    is_passive: AtomicBool,
}

impl PlayerData {
    pub fn new(
        conn: Arc<Connection>,
        verification_key: String,
        session_id: Vec<u8>,
        amount: u64,
        version: u64,
        shuffle_type: i32,
    ) -> Arc<Self> {
        Arc::new(PlayerData {
            session_id,
            verification_key,
            conn,
            amount,
            version,
            shuffle_type,
            number: AtomicU32::new(0),
            pool: Mutex::new(Weak::new()),
            blamed_by: Mutex::new(HashSet::new()),
            is_passive: AtomicBool::new(false),
        })
    }

    pub fn session_id(&self) -> &[u8] {
        &self.session_id
    }

    pub fn verification_key(&self) -> &str {
        &self.verification_key
    }

    pub fn conn(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn amount(&self) -> u64 {
        self.amount
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn shuffle_type(&self) -> i32 {
        self.shuffle_type
    }

    pub fn number(&self) -> u32 {
        self.number.load(Ordering::SeqCst)
    }

    pub(crate) fn set_number(&self, number: u32) {
        self.number.store(number, Ordering::SeqCst);
    }

    /// The pool this player currently belongs to, if it is still alive.
    pub fn pool(&self) -> Option<Arc<Pool>> {
        self.pool.lock().expect("pool ref lock poisoned").upgrade()
    }

    pub(crate) fn set_pool(&self, pool: &Arc<Pool>) {
        *self.pool.lock().expect("pool ref lock poisoned") = Arc::downgrade(pool);
    }

    /// Record that `verification_key` has blamed this player. Returns true
    /// iff the accuser was not already present; duplicate accusations from
    /// the same key never count twice.
    pub fn add_blame(&self, verification_key: &str) -> bool {
        self.blamed_by
            .lock()
            .expect("blame lock poisoned")
            .insert(verification_key.to_string())
    }

    pub fn blame_count(&self) -> usize {
        self.blamed_by.lock().expect("blame lock poisoned").len()
    }

    pub fn is_passive(&self) -> bool {
        self.is_passive.load(Ordering::SeqCst)
    }

    pub fn set_passive(&self, passive: bool) {
        self.is_passive.store(passive, Ordering::SeqCst);
    }
}

impl std::fmt::Display for PlayerData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "vk:{} ip:{} pool:{} num:{} blames:{} amount:{} version:{} passive:{}",
            self.verification_key,
            self.conn.ip(),
            self.pool().map(|p| p.num()).unwrap_or(0),
            self.number(),
            self.blame_count(),
            self.amount,
            self.version,
            self.is_passive(),
        )
    }
}
