//! Read-only JSON stats endpoint.
//!
//! `GET /stats` reports the tracker's current shape plus the requesting
//! IP's ban status. Served over plain HTTP; the payload is world-readable
//! by design and the handler only ever takes the tracker's read side.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::proto::ShuffleType;
use crate::shuffle::tracker::{Tracker, MAX_BAN_SCORE};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerStats {
    pub connections: usize,
    pub pool_size: usize,
    pub pools: Vec<PoolStats>,
    pub shuffle_port: u16,
    pub shuffle_web_socket_port: u16,
    pub ban_score: u32,
    pub banned: bool,
}

#[derive(Debug, Serialize)]
pub struct PoolStats {
    pub members: usize,
    pub amount: u64,
    #[serde(rename = "type")]
    pub shuffle_type: String,
    pub full: bool,
    pub version: u64,
}

/// Snapshot the tracker for one requester. `tor` selects which listener
/// ports to advertise.
pub fn snapshot(tracker: &Tracker, requester_ip: &str, tor: bool) -> TrackerStats {
    let ports = tracker.ports();
    let (shuffle_port, websocket_port) = if tor {
        (ports.tor_shuffle, ports.tor_websocket)
    } else {
        (ports.shuffle, ports.websocket)
    };

    let ban_score = tracker.ban_score(requester_ip);

    TrackerStats {
        connections: tracker.connection_count(),
        pool_size: tracker.pool_size(),
        pools: tracker
            .pools()
            .iter()
            .map(|pool| PoolStats {
                members: pool.player_count(),
                amount: pool.amount(),
                shuffle_type: ShuffleType::try_from(pool.shuffle_type())
                    .map(|t| t.label().to_string())
                    .unwrap_or_else(|_| pool.shuffle_type().to_string()),
                full: pool.is_frozen(),
                version: pool.version(),
            })
            .collect(),
        shuffle_port,
        shuffle_web_socket_port: websocket_port,
        ban_score,
        banned: ban_score >= MAX_BAN_SCORE,
    }
}

#[derive(Clone)]
struct StatsState {
    tracker: Arc<Tracker>,
    tor: bool,
}

/// Serve `GET /stats` on the given listener until the process exits.
pub async fn serve(
    listener: tokio::net::TcpListener,
    tracker: Arc<Tracker>,
    tor: bool,
    label: &'static str,
) -> std::io::Result<()> {
    info!(addr = %listener.local_addr()?, "{label} listener bound");

    let app = Router::new()
        .route("/stats", get(stats_handler))
        .layer(CorsLayer::permissive())
        .with_state(StatsState { tracker, tor });

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}

async fn stats_handler(
    State(state): State<StatsState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Json<TrackerStats> {
    Json(snapshot(
        &state.tracker,
        &addr.ip().to_string(),
        state.tor,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::connection::Connection;
    use crate::shuffle::tracker::ListenerPorts;

    fn tracker_with_ports() -> Arc<Tracker> {
        Tracker::new(
            5,
            ListenerPorts {
                shuffle: 1337,
                websocket: 1338,
                tor_shuffle: 1339,
                tor_websocket: 1340,
            },
        )
    }

    fn register(t: &Arc<Tracker>, ip: &str, port: u16, vk: &str, amount: u64) {
        let (conn, _rx) = Connection::new(format!("{ip}:{port}").parse().unwrap());
        t.register(&conn, vk, amount, 999, ShuffleType::Default as i32)
            .unwrap();
    }

    #[tokio::test]
    async fn snapshot_reflects_pools_and_ports() {
        let t = tracker_with_ports();
        register(&t, "127.0.0.1", 1, "a", 10_000);
        register(&t, "127.0.0.1", 2, "b", 10_000);
        register(&t, "127.0.0.1", 3, "c", 50_000);

        let stats = snapshot(&t, "127.0.0.1", false);
        assert_eq!(stats.connections, 3);
        assert_eq!(stats.pool_size, 5);
        assert_eq!(stats.pools.len(), 2);
        assert_eq!(stats.shuffle_port, 1337);
        assert_eq!(stats.shuffle_web_socket_port, 1338);
        assert_eq!(stats.ban_score, 0);
        assert!(!stats.banned);

        let small = stats.pools.iter().find(|p| p.amount == 10_000).unwrap();
        assert_eq!(small.members, 2);
        assert!(!small.full);
        assert_eq!(small.shuffle_type, "DEFAULT");
        assert_eq!(small.version, 999);
    }

    #[tokio::test]
    async fn tor_snapshot_reports_tor_ports() {
        let t = tracker_with_ports();
        let stats = snapshot(&t, "127.0.0.1", true);
        assert_eq!(stats.shuffle_port, 1339);
        assert_eq!(stats.shuffle_web_socket_port, 1340);
    }

    #[tokio::test]
    async fn requester_ban_state_is_reported() {
        let t = tracker_with_ports();
        for _ in 0..MAX_BAN_SCORE {
            t.increase_ban_score("9.9.9.9");
        }

        let stats = snapshot(&t, "9.9.9.9", false);
        assert_eq!(stats.ban_score, MAX_BAN_SCORE);
        assert!(stats.banned);

        let clean = snapshot(&t, "8.8.8.8", false);
        assert_eq!(clean.ban_score, 0);
        assert!(!clean.banned);
    }

    #[test]
    fn payload_uses_wire_field_names() {
        let stats = TrackerStats {
            connections: 1,
            pool_size: 5,
            pools: vec![PoolStats {
                members: 1,
                amount: 10,
                shuffle_type: "DEFAULT".into(),
                full: false,
                version: 999,
            }],
            shuffle_port: 1337,
            shuffle_web_socket_port: 1338,
            ban_score: 0,
            banned: false,
        };

        let json = serde_json::to_value(&stats).unwrap();
        assert!(json.get("poolSize").is_some());
        assert!(json.get("shuffleWebSocketPort").is_some());
        assert!(json.get("banScore").is_some());
        assert!(json["pools"][0].get("type").is_some());
    }
}
