//! Single serialization point for inbound envelopes.
//!
//! One task consumes decoded [`Packets`] envelopes from every reader and
//! executes each to completion before the next, so all tracker and pool
//! mutations triggered by client traffic happen in arrival order without
//! extra locking. Outbound replies are queue pushes, never awaits, which is
//! what keeps the loop single-threaded and non-blocking.
//!
//! Per envelope: registration gate, then verification, then passive-flag
//! clearing, then blame adjudication, then relay.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::net::connection::Connection;
use crate::proto::{Blame, Message, Packet, Packets, Phase, Reason, Signed};
use crate::shuffle::pool::Pool;
use crate::shuffle::player::PlayerData;
use crate::shuffle::tracker::Tracker;

/// Depth of the shared envelope channel; readers block (and stop reading)
/// when the dispatcher falls this far behind.
pub const DISPATCH_QUEUE_DEPTH: usize = 64;

/// A decoded envelope plus the connection it arrived on.
pub struct PacketInfo {
    pub packets: Packets,
    pub conn: Arc<Connection>,
}

/// Why an envelope was fatal to its connection.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("registration failed: {0}")]
    Registration(&'static str),
    #[error("invalid session")]
    InvalidSession,
    #[error("invalid verification key")]
    InvalidVerificationKey,
    #[error("invalid player number")]
    InvalidNumber,
    #[error("invalid destination")]
    InvalidDestination,
    #[error("unknown blame reason: {0}")]
    UnknownBlameReason(i32),
    #[error("invalid blame: accused not in pool snapshot")]
    AccusedNotInPool,
}

const VALID_BLAME_REASONS: [Reason; 9] = [
    Reason::Liar,
    Reason::Insufficientfunds,
    Reason::Doublespend,
    Reason::Equivocationfailure,
    Reason::Shufflefailure,
    Reason::Shuffleandequivocationfailure,
    Reason::Missingoutput,
    Reason::Invalidsignature,
    Reason::Invalidformat,
];

/// Spawn the dispatcher task; returns the sender side of the envelope
/// channel for readers to feed.
pub fn start(tracker: Arc<Tracker>) -> mpsc::Sender<PacketInfo> {
    let (tx, rx) = mpsc::channel(DISPATCH_QUEUE_DEPTH);
    tokio::spawn(run(tracker, rx));
    tx
}

pub async fn run(tracker: Arc<Tracker>, mut rx: mpsc::Receiver<PacketInfo>) {
    while let Some(pi) = rx.recv().await {
        if let Err(err) = process_envelope(&tracker, &pi) {
            warn!(conn = %pi.conn.id(), error = %err, "message processor");
            pi.conn.close();
        }
    }
}

/// Handle one envelope to completion. An error means the connection must be
/// closed; the caller does that so tests can observe the state in between.
pub fn process_envelope(tracker: &Arc<Tracker>, pi: &PacketInfo) -> Result<(), DispatchError> {
    debug!(conn = %pi.conn.id(), envelope = ?pi.packets, "received");

    // Until the connection is tracked, the only acceptable message is a
    // registration.
    let Some(player) = tracker.player_by_connection(pi.conn.id()) else {
        return register_client(tracker, pi);
    };

    verify_message(tracker, pi, &player)?;

    // The player broadcast something valid under their own key, so they are
    // no longer passive. This must land before blame handling so that a
    // blame and its sender's first message in one envelope cannot penalize
    // the sender.
    if let Some(player) = tracker.player_by_connection(pi.conn.id()) {
        player.set_passive(false);
    }

    check_blame_message(tracker, pi)?;

    broadcast_message(tracker, pi, &player);
    Ok(())
}

// ---- registration ----

fn register_client(tracker: &Arc<Tracker>, pi: &PacketInfo) -> Result<(), DispatchError> {
    match try_register(tracker, pi) {
        Ok(()) => Ok(()),
        Err(err) => {
            // The one failure clients get told about; everything later in
            // the session fails silently with a close.
            pi.conn.send(vec![Signed {
                packet: Some(Packet {
                    message: Some(Message {
                        blame: Some(Blame {
                            reason: Reason::Invalidformat as i32,
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                signature: None,
            }]);
            Err(err)
        }
    }
}

fn try_register(tracker: &Arc<Tracker>, pi: &PacketInfo) -> Result<(), DispatchError> {
    let [signed] = pi.packets.packet.as_slice() else {
        return Err(DispatchError::Registration("expected a single packet"));
    };

    if signed.signature.is_some() {
        return Err(DispatchError::Registration(
            "registration must not be signed",
        ));
    }

    let packet = signed
        .packet
        .as_ref()
        .ok_or(DispatchError::Registration("missing packet"))?;
    let registration = packet
        .registration
        .as_ref()
        .ok_or(DispatchError::Registration("missing registration"))?;
    let verification_key = packet
        .from_key
        .as_ref()
        .map(|k| k.key.as_str())
        .filter(|k| !k.is_empty())
        .ok_or(DispatchError::Registration("missing verification key"))?;

    let player = tracker
        .register(
            &pi.conn,
            verification_key,
            registration.amount,
            registration.version,
            registration.r#type,
        )
        .ok_or(DispatchError::Registration(
            "verification key already in use",
        ))?;

    let delivered = pi.conn.send(vec![Signed {
        packet: Some(Packet {
            session: player.session_id().to_vec(),
            number: player.number(),
            ..Default::default()
        }),
        signature: None,
    }]);
    if !delivered {
        tracker.remove(&pi.conn);
        return Ok(());
    }

    debug!(player = %player, "registered");

    // A client that disconnects mid-registration can race the reader's
    // cleanup; the pool backlink going away just means there is nobody left
    // to notify.
    let Some(pool) = player.pool() else {
        return Ok(());
    };

    if pool.is_frozen() {
        announce_start(&pool);
    } else {
        broadcast_joined_pool(&pool, player.number());
    }

    Ok(())
}

/// The pool just filled: tell every member the round begins. Everyone is
/// marked passive until their first keyed message; a player silent from
/// here to disconnect takes the passive penalty.
fn announce_start(pool: &Arc<Pool>) {
    let announcement = Signed {
        packet: Some(Packet {
            phase: Phase::Announcement as i32,
            number: pool.size() as u32,
            ..Default::default()
        }),
        signature: None,
    };

    for member in pool.players() {
        member.set_passive(true);
        if !member.conn().send(vec![announcement.clone()]) {
            debug!(player = %member, "announcement write failed");
        }
    }
}

/// Tell the pool (the joiner included) which player number just joined.
fn broadcast_joined_pool(pool: &Arc<Pool>, number: u32) {
    let joined = Signed {
        packet: Some(Packet {
            number,
            ..Default::default()
        }),
        signature: None,
    };

    for member in pool.players() {
        if !member.conn().send(vec![joined.clone()]) {
            debug!(player = %member, "join notification write failed");
        }
    }
}

// ---- verification ----

/// Every signed packet in the envelope must carry the connection's session
/// id, verification key, and player number, and any destination key must
/// resolve to a currently registered player.
fn verify_message(
    tracker: &Arc<Tracker>,
    pi: &PacketInfo,
    player: &Arc<PlayerData>,
) -> Result<(), DispatchError> {
    for signed in &pi.packets.packet {
        let packet = signed
            .packet
            .as_ref()
            .ok_or(DispatchError::InvalidSession)?;

        if packet.session != player.session_id() {
            return Err(DispatchError::InvalidSession);
        }

        if packet.from_key.as_ref().map(|k| k.key.as_str()) != Some(player.verification_key()) {
            return Err(DispatchError::InvalidVerificationKey);
        }

        if packet.number != player.number() {
            return Err(DispatchError::InvalidNumber);
        }

        if let Some(to) = &packet.to_key {
            if tracker.player_by_verification_key(&to.key).is_none() {
                return Err(DispatchError::InvalidDestination);
            }
        }
    }

    Ok(())
}

// ---- blame ----

/// Adjudicate a blame envelope: exactly one signed packet whose message
/// carries a blame. The accused is resolved against the blamer's pool's
/// frozen snapshot, so departed players stay accusable and players from
/// other pools never are.
fn check_blame_message(tracker: &Arc<Tracker>, pi: &PacketInfo) -> Result<(), DispatchError> {
    let [signed] = pi.packets.packet.as_slice() else {
        return Ok(());
    };

    let Some(blame) = signed
        .packet
        .as_ref()
        .and_then(|p| p.message.as_ref())
        .and_then(|m| m.blame.as_ref())
    else {
        return Ok(());
    };

    let reason_valid = Reason::try_from(blame.reason)
        .is_ok_and(|reason| VALID_BLAME_REASONS.contains(&reason));
    if !reason_valid {
        return Err(DispatchError::UnknownBlameReason(blame.reason));
    }

    let Some(blamer) = tracker.player_by_connection(pi.conn.id()) else {
        debug!(ip = pi.conn.ip(), "ignoring blame from disconnected player");
        return Ok(());
    };

    let accused_key = blame
        .accused
        .as_ref()
        .map(|k| k.key.as_str())
        .unwrap_or_default();
    let accused = blamer
        .pool()
        .and_then(|pool| pool.player_from_snapshot(accused_key))
        .ok_or(DispatchError::AccusedNotInPool)?;

    let pool = blamer.pool().ok_or(DispatchError::AccusedNotInPool)?;

    // One ban per pool per round; later blames are valid but moot.
    if pool.first_ban().is_some() {
        debug!(pool = pool.num(), "ignoring blame, pool already banned a player");
        return Ok(());
    }

    if !accused.add_blame(blamer.verification_key()) {
        debug!(from = %blamer, to = %accused, "duplicate blame ignored");
        return Ok(());
    }

    debug!(from = %blamer, to = %accused, reason = blame.reason, "blame applied");

    if pool.is_banned(&accused) {
        pool.set_first_ban(&accused);
        tracker.increase_ban_score(accused.conn().ip());
        tracker.add_deny_ip_match(accused.conn().ip(), &pool.snapshot_players());
        debug!(player = %accused, "player blamed out of round");
    }

    Ok(())
}

// ---- relay ----

/// Partition the envelope by destination and deliver. Unaddressed packets
/// go to every current member of the sender's pool, the sender included;
/// addressed packets are grouped per recipient. Write failures are logged
/// and otherwise ignored; the stalled peer's own deadline will reap it.
fn broadcast_message(tracker: &Arc<Tracker>, pi: &PacketInfo, sender: &Arc<PlayerData>) {
    let mut unaddressed: Vec<Signed> = Vec::new();
    let mut direct: Vec<(String, Vec<Signed>)> = Vec::new();

    for signed in &pi.packets.packet {
        let to = signed
            .packet
            .as_ref()
            .and_then(|p| p.to_key.as_ref())
            .map(|k| k.key.clone());
        match to {
            None => unaddressed.push(signed.clone()),
            Some(key) => match direct.iter_mut().find(|(k, _)| *k == key) {
                Some((_, group)) => group.push(signed.clone()),
                None => direct.push((key, vec![signed.clone()])),
            },
        }
    }

    if !unaddressed.is_empty() {
        if let Some(pool) = sender.pool() {
            for member in pool.players() {
                if !member.conn().send(unaddressed.clone()) {
                    debug!(player = %member, "broadcast write failed");
                }
            }
        }
    }

    for (key, group) in direct {
        let Some(recipient) = tracker.player_by_verification_key(&key) else {
            debug!(to = %key, "direct message recipient disconnected");
            continue;
        };
        if recipient.conn().id() == sender.conn().id() {
            continue;
        }
        if !recipient.conn().send(group) {
            debug!(player = %recipient, "direct write failed");
        }
    }
}
