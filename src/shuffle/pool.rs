//! Pools group players that share identical mix parameters.
//!
//! A pool freezes the moment it reaches its target size: a snapshot of the
//! membership is taken for blame resolution and no further players are
//! accepted, even if members depart afterwards. Pools only exist with at
//! least one player; the tracker discards a pool when its last member
//! leaves.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::shuffle::player::PlayerData;
use crate::shuffle::tracker::FIRST_PLAYER_NUM;

pub struct Pool {
    num: u32,
    size: usize,
    amount: u64,
    version: u64,
    shuffle_type: i32,
    inner: Mutex<PoolInner>,
}

#[derive(Default)]
struct PoolInner {
    players: BTreeMap<u32, Arc<PlayerData>>,
    /// Verification key -> member at freeze time. Non-empty iff frozen.
    frozen_snapshot: HashMap<String, Arc<PlayerData>>,
    first_ban: Option<Arc<PlayerData>>,
}

impl Pool {
    /// Create a pool seeded with its first player. The seed always fits
    /// because the pool's parameters are taken from it.
    pub fn new(num: u32, size: usize, seed: &Arc<PlayerData>) -> Arc<Self> {
        let pool = Arc::new(Pool {
            num,
            size,
            amount: seed.amount(),
            version: seed.version(),
            shuffle_type: seed.shuffle_type(),
            inner: Mutex::new(PoolInner::default()),
        });
        pool.add_player(seed);
        pool
    }

    pub fn num(&self) -> u32 {
        self.num
    }

    /// Target size N; also the electorate for the ban vote.
    pub fn size(&self) -> usize {
        self.size
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

    /// Attempt to place a player. Fails on parameter mismatch or if the
    /// pool is frozen. On success the player is assigned the smallest free
    /// number and back-linked to this pool; filling the last slot freezes
    /// the pool.
    pub fn add_player(self: &Arc<Self>, player: &Arc<PlayerData>) -> bool {
        if self.amount != player.amount()
            || self.version != player.version()
            || self.shuffle_type != player.shuffle_type()
        {
            return false;
        }

        let mut inner = self.inner.lock().expect("pool lock poisoned");

        if !inner.frozen_snapshot.is_empty() {
            return false;
        }

        let mut number = FIRST_PLAYER_NUM;
        while inner.players.contains_key(&number) {
            number += 1;
        }

        player.set_number(number);
        player.set_pool(self);
        inner.players.insert(number, Arc::clone(player));

        if inner.players.len() == self.size {
            inner.frozen_snapshot = inner
                .players
                .values()
                .map(|p| (p.verification_key().to_string(), Arc::clone(p)))
                .collect();
        }

        true
    }

    /// Drop a player from the member map. The frozen snapshot is untouched;
    /// the caller discards the pool once it is empty.
    pub fn remove_player(&self, player: &PlayerData) {
        let mut inner = self.inner.lock().expect("pool lock poisoned");
        inner.players.remove(&player.number());
    }

    pub fn is_frozen(&self) -> bool {
        !self
            .inner
            .lock()
            .expect("pool lock poisoned")
            .frozen_snapshot
            .is_empty()
    }

    /// True once every other original member has blamed the player. The
    /// vote is measured against the frozen size N, so a departure can never
    /// complete a ban by shrinking the electorate.
    pub fn is_banned(&self, player: &PlayerData) -> bool {
        player.blame_count() >= self.size.saturating_sub(1)
    }

    pub fn player_count(&self) -> usize {
        self.inner.lock().expect("pool lock poisoned").players.len()
    }

    /// Current members in player-number order.
    pub fn players(&self) -> Vec<Arc<PlayerData>> {
        self.inner
            .lock()
            .expect("pool lock poisoned")
            .players
            .values()
            .cloned()
            .collect()
    }

    /// Resolve a verification key against the frozen snapshot; `None`
    /// before freeze or for keys never in this pool.
    pub fn player_from_snapshot(&self, verification_key: &str) -> Option<Arc<PlayerData>> {
        self.inner
            .lock()
            .expect("pool lock poisoned")
            .frozen_snapshot
            .get(verification_key)
            .cloned()
    }

    /// Everyone recorded at freeze time, departed members included.
    pub fn snapshot_players(&self) -> Vec<Arc<PlayerData>> {
        self.inner
            .lock()
            .expect("pool lock poisoned")
            .frozen_snapshot
            .values()
            .cloned()
            .collect()
    }

    pub fn first_ban(&self) -> Option<Arc<PlayerData>> {
        self.inner
            .lock()
            .expect("pool lock poisoned")
            .first_ban
            .clone()
    }

    /// Record the single ban this pool will ever hand out. Returns false if
    /// one was already recorded.
    pub fn set_first_ban(&self, player: &Arc<PlayerData>) -> bool {
        let mut inner = self.inner.lock().expect("pool lock poisoned");
        if inner.first_ban.is_some() {
            return false;
        }
        inner.first_ban = Some(Arc::clone(player));
        true
    }
}
