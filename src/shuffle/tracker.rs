//! Process-wide registry of connections, players, pools, and bans.
//!
//! # Responsibilities
//! - Index players by connection id and by verification key
//! - Assign registering players to pools (first fit, smallest unused id)
//! - Account per-IP ban scores with deferred decay
//! - Track time-limited IP-pair denials that steer pool assignment
//!
//! # Design Decisions
//! - One RW-lock guards all registry state; lookups take the read side so
//!   the stats endpoint and cleanup ticker never contend with each other
//! - Pool and PlayerData carry their own locks and are always acquired
//!   after the tracker lock, never the other way around
//! - Ban decay runs as one sleeping task per increment, holding only a weak
//!   tracker handle so teardown is not kept alive by timers

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::net::connection::{ConnId, Connection};
use crate::shuffle::player::PlayerData;
use crate::shuffle::pool::Pool;
use crate::shuffle::session::SessionIdGenerator;

/// How long one ban-score increment lasts.
pub const BAN_TIME: Duration = Duration::from_secs(15 * 60);

/// How long two IPs are kept out of each other's pools.
pub const DENY_IP_TIME: Duration = Duration::from_secs(2 * 60 * 60);

/// Ban score added per offense.
pub const BAN_SCORE_TICK: u32 = 1;

/// Score at which an IP is refused at accept time.
pub const MAX_BAN_SCORE: u32 = 5;

/// Starting number for pools.
pub const FIRST_POOL_NUM: u32 = 1;

/// Starting number for players within a pool.
pub const FIRST_PLAYER_NUM: u32 = 1;

/// Per-IP ban accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BanData {
    pub score: u32,
}

/// A canonically sorted pair of IPs; construction keeps the map symmetric.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IpPair {
    left: String,
    right: String,
}

impl IpPair {
    pub fn new(a: &str, b: &str) -> Self {
        if a < b {
            IpPair {
                left: a.to_string(),
                right: b.to_string(),
            }
        } else {
            IpPair {
                left: b.to_string(),
                right: a.to_string(),
            }
        }
    }
}

/// Listener ports surfaced through the stats endpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListenerPorts {
    pub shuffle: u16,
    pub websocket: u16,
    pub tor_shuffle: u16,
    pub tor_websocket: u16,
}

struct TrackerInner {
    connections: HashMap<ConnId, Arc<PlayerData>>,
    verification_keys: HashMap<String, ConnId>,
    pools: BTreeMap<u32, Arc<Pool>>,
    ban_data: HashMap<String, BanData>,
    deny_ip_match: HashMap<IpPair, Instant>,
}

pub struct Tracker {
    pool_size: usize,
    ports: ListenerPorts,
    session_ids: Mutex<SessionIdGenerator>,
    inner: RwLock<TrackerInner>,
}

impl Tracker {
    pub fn new(pool_size: usize, ports: ListenerPorts) -> Arc<Self> {
        Arc::new(Tracker {
            pool_size,
            ports,
            session_ids: Mutex::new(SessionIdGenerator::new()),
            inner: RwLock::new(TrackerInner {
                connections: HashMap::new(),
                verification_keys: HashMap::new(),
                pools: BTreeMap::new(),
                ban_data: HashMap::new(),
                deny_ip_match: HashMap::new(),
            }),
        })
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn ports(&self) -> ListenerPorts {
        self.ports
    }

    /// Register a new player: index it, assign a session id, and place it
    /// in a pool. Fails iff the verification key is already in use.
    pub fn register(
        &self,
        conn: &Arc<Connection>,
        verification_key: &str,
        amount: u64,
        version: u64,
        shuffle_type: i32,
    ) -> Option<Arc<PlayerData>> {
        let mut inner = self.inner.write().expect("tracker lock poisoned");

        if inner.verification_keys.contains_key(verification_key) {
            return None;
        }

        let session_id = self
            .session_ids
            .lock()
            .expect("session generator lock poisoned")
            .next_id();

        let player = PlayerData::new(
            Arc::clone(conn),
            verification_key.to_string(),
            session_id,
            amount,
            version,
            shuffle_type,
        );

        inner
            .verification_keys
            .insert(verification_key.to_string(), conn.id());
        inner.connections.insert(conn.id(), Arc::clone(&player));

        Self::assign_pool(&mut inner, self.pool_size, &player);

        Some(player)
    }

    /// Unregister whatever player the connection maps to. Applies the
    /// passive-player penalty, removes the player from its pool, and drops
    /// the pool once empty. Reader tasks call this unconditionally on exit.
    pub fn remove(self: &Arc<Self>, conn: &Connection) {
        let mut penalized_ip = None;

        {
            let mut inner = self.inner.write().expect("tracker lock poisoned");

            let Some(player) = inner.connections.remove(&conn.id()) else {
                return;
            };
            inner.verification_keys.remove(player.verification_key());

            if let Some(pool) = player.pool() {
                if player.is_passive() {
                    // Silent after the announcement: peers never learned the
                    // key binding, so this cannot be blamed in-protocol.
                    debug!(player = %player, "passive player penalized at disconnect");
                    Self::bump_ban_score(&mut inner.ban_data, player.conn().ip());
                    penalized_ip = Some(player.conn().ip().to_string());
                    Self::record_ip_denials(
                        &mut inner.deny_ip_match,
                        player.conn().ip(),
                        &pool.players(),
                    );
                }

                pool.remove_player(&player);
                if pool.player_count() == 0 {
                    inner.pools.remove(&pool.num());
                }
            }
        }

        if let Some(ip) = penalized_ip {
            self.spawn_ban_cleanup(ip);
        }
    }

    /// First-fit scan over existing pools; falls back to a fresh pool with
    /// the smallest unused number. Caller holds the write lock.
    fn assign_pool(inner: &mut TrackerInner, pool_size: usize, player: &Arc<PlayerData>) {
        for pool in inner.pools.values() {
            if Self::denied_by_ip_match(&inner.deny_ip_match, player.conn().ip(), pool) {
                continue;
            }
            // add_player enforces parameter compatibility and freeze state.
            if pool.add_player(player) {
                return;
            }
        }

        let mut num = FIRST_POOL_NUM;
        while inner.pools.contains_key(&num) {
            num += 1;
        }
        let pool = Pool::new(num, pool_size, player);
        inner.pools.insert(num, pool);
    }

    fn denied_by_ip_match(deny: &HashMap<IpPair, Instant>, ip: &str, pool: &Pool) -> bool {
        pool.players()
            .iter()
            .any(|other| deny.contains_key(&IpPair::new(ip, other.conn().ip())))
    }

    pub fn player_by_connection(&self, id: ConnId) -> Option<Arc<PlayerData>> {
        self.inner
            .read()
            .expect("tracker lock poisoned")
            .connections
            .get(&id)
            .cloned()
    }

    pub fn player_by_verification_key(&self, key: &str) -> Option<Arc<PlayerData>> {
        let inner = self.inner.read().expect("tracker lock poisoned");
        let id = inner.verification_keys.get(key)?;
        inner.connections.get(id).cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.inner
            .read()
            .expect("tracker lock poisoned")
            .connections
            .len()
    }

    /// Pools in id order, for the stats endpoint and tests.
    pub fn pools(&self) -> Vec<Arc<Pool>> {
        self.inner
            .read()
            .expect("tracker lock poisoned")
            .pools
            .values()
            .cloned()
            .collect()
    }

    /// True iff the IP has accumulated the maximum ban score; checked at
    /// accept time before the connection gets a reader.
    pub fn banned_by_server(&self, ip: &str) -> bool {
        self.inner
            .read()
            .expect("tracker lock poisoned")
            .ban_data
            .get(ip)
            .is_some_and(|ban| ban.score >= MAX_BAN_SCORE)
    }

    pub fn ban_score(&self, ip: &str) -> u32 {
        self.inner
            .read()
            .expect("tracker lock poisoned")
            .ban_data
            .get(ip)
            .map(|ban| ban.score)
            .unwrap_or(0)
    }

    /// Bump the IP's ban score and schedule the matching decay.
    pub fn increase_ban_score(self: &Arc<Self>, ip: &str) -> u32 {
        let score = {
            let mut inner = self.inner.write().expect("tracker lock poisoned");
            Self::bump_ban_score(&mut inner.ban_data, ip)
        };
        self.spawn_ban_cleanup(ip.to_string());
        score
    }

    fn bump_ban_score(ban_data: &mut HashMap<String, BanData>, ip: &str) -> u32 {
        let entry = ban_data
            .entry(ip.to_string())
            .or_insert(BanData { score: 0 });
        entry.score += BAN_SCORE_TICK;
        entry.score
    }

    /// One decrement per increment, `BAN_TIME` later. Entries are deleted
    /// when they reach zero so the map only holds active offenders.
    fn spawn_ban_cleanup(self: &Arc<Self>, ip: String) {
        let tracker: Weak<Tracker> = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(BAN_TIME).await;
            let Some(tracker) = tracker.upgrade() else {
                return;
            };
            let mut inner = tracker.inner.write().expect("tracker lock poisoned");
            if let Some(ban) = inner.ban_data.get_mut(&ip) {
                ban.score = ban.score.saturating_sub(BAN_SCORE_TICK);
                if ban.score == 0 {
                    inner.ban_data.remove(&ip);
                }
            }
        });
    }

    /// Deny `ip` from sharing a future pool with each distinct member IP.
    /// Self-pairs are skipped; an existing denial is refreshed.
    pub fn add_deny_ip_match(&self, ip: &str, members: &[Arc<PlayerData>]) {
        let mut inner = self.inner.write().expect("tracker lock poisoned");
        Self::record_ip_denials(&mut inner.deny_ip_match, ip, members);
    }

    fn record_ip_denials(
        deny: &mut HashMap<IpPair, Instant>,
        ip: &str,
        members: &[Arc<PlayerData>],
    ) {
        for other in members {
            let other_ip = other.conn().ip();
            if ip == other_ip {
                continue;
            }
            debug!(ip, other_ip, "recording ip pair denial");
            deny.insert(IpPair::new(ip, other_ip), Instant::now());
        }
    }

    pub fn is_denied(&self, a: &str, b: &str) -> bool {
        self.inner
            .read()
            .expect("tracker lock poisoned")
            .deny_ip_match
            .contains_key(&IpPair::new(a, b))
    }

    /// Drop denial entries older than [`DENY_IP_TIME`]. Driven by a
    /// one-minute ticker.
    pub fn cleanup_denied_by_ip_match(&self) {
        self.cleanup_denials_older_than(DENY_IP_TIME);
    }

    fn cleanup_denials_older_than(&self, max_age: Duration) {
        let mut inner = self.inner.write().expect("tracker lock poisoned");
        inner
            .deny_ip_match
            .retain(|_, denied_at| denied_at.elapsed() < max_age);
    }
}
