//! Shared harness for end-to-end tests: a real server on an ephemeral port
//! and clients speaking the framed protocol over TCP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio_util::codec::Framed;

use cashshuffle::net::framing::ShuffleCodec;
use cashshuffle::net::listener::{self, ServerContext};
use cashshuffle::net::websocket;
use cashshuffle::proto::{
    Blame, Message, Packet, Packets, Reason, Registration, ShuffleType, Signed, VerificationKey,
};
use cashshuffle::security::AcceptLimiter;
use cashshuffle::shuffle::dispatcher;
use cashshuffle::shuffle::tracker::{ListenerPorts, Tracker};

pub const TEST_AMOUNT: u64 = 100_000_000;
pub const TEST_VERSION: u64 = 999;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestServer {
    pub tracker: Arc<Tracker>,
    pub addr: SocketAddr,
    pub ws_addr: SocketAddr,
}

/// Start a full server (TCP + WebSocket listeners sharing one dispatcher)
/// on ephemeral loopback ports.
pub async fn start_server(pool_size: usize) -> TestServer {
    let tracker = Tracker::new(pool_size, ListenerPorts::default());
    let dispatcher = dispatcher::start(Arc::clone(&tracker));
    let ctx = ServerContext {
        tracker: Arc::clone(&tracker),
        dispatcher,
        // generous limit so rapid test reconnects are never throttled
        limiter: Arc::new(AcceptLimiter::new(100_000)),
    };

    let tcp = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = tcp.local_addr().unwrap();
    tokio::spawn(listener::serve(tcp, ctx.clone(), None, "test shuffle"));

    let ws = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ws_addr = ws.local_addr().unwrap();
    tokio::spawn(websocket::serve(ws, ctx, None, "test websocket"));

    TestServer {
        tracker,
        addr,
        ws_addr,
    }
}

/// One actor connected to the server.
pub struct TestClient {
    pub vk: String,
    pub session: Vec<u8>,
    pub number: u32,
    pub local_ip: String,
    framed: Framed<TcpStream, ShuffleCodec>,
}

impl TestClient {
    pub async fn connect(server: &TestServer, vk: &str) -> Self {
        Self::connect_from(server, vk, "127.0.0.1").await
    }

    /// Connect with the socket bound to a specific loopback address, so
    /// tests can exercise per-IP behavior.
    pub async fn connect_from(server: &TestServer, vk: &str, local_ip: &str) -> Self {
        let socket = TcpSocket::new_v4().unwrap();
        socket
            .bind(format!("{local_ip}:0").parse().unwrap())
            .unwrap();
        let stream = socket.connect(server.addr).await.unwrap();

        TestClient {
            vk: vk.to_string(),
            session: Vec::new(),
            number: 0,
            local_ip: local_ip.to_string(),
            framed: Framed::new(stream, ShuffleCodec),
        }
    }

    pub async fn send(&mut self, msgs: Vec<Signed>) {
        self.framed
            .send(&Packets { packet: msgs })
            .await
            .expect("send failed");
    }

    pub async fn recv(&mut self) -> Packets {
        tokio::time::timeout(RECV_TIMEOUT, self.framed.next())
            .await
            .expect("timed out waiting for a message")
            .expect("connection closed while waiting for a message")
            .expect("decode failed")
    }

    /// The server must close this connection without sending anything else.
    pub async fn expect_close(&mut self) {
        let next = tokio::time::timeout(RECV_TIMEOUT, self.framed.next())
            .await
            .expect("timed out waiting for close");
        assert!(
            next.is_none() || next.unwrap().is_err(),
            "expected close, got a message"
        );
    }

    /// No message should be pending.
    pub async fn expect_silence(&mut self) {
        let result = tokio::time::timeout(Duration::from_millis(200), self.framed.next()).await;
        if let Ok(Some(Ok(msg))) = result {
            panic!("unexpected message for {}: {msg:?}", self.vk);
        }
    }

    fn registration_signed(&self) -> Signed {
        Signed {
            packet: Some(Packet {
                from_key: Some(VerificationKey {
                    key: self.vk.clone(),
                }),
                registration: Some(Registration {
                    amount: TEST_AMOUNT,
                    r#type: ShuffleType::Default as i32,
                    version: TEST_VERSION,
                }),
                ..Default::default()
            }),
            signature: None,
        }
    }

    pub fn keyed_signed(&self) -> Signed {
        Signed {
            packet: Some(Packet {
                session: self.session.clone(),
                number: self.number,
                from_key: Some(VerificationKey {
                    key: self.vk.clone(),
                }),
                ..Default::default()
            }),
            signature: None,
        }
    }

    pub fn blame_signed(&self, accused_vk: &str) -> Signed {
        let mut signed = self.keyed_signed();
        signed.packet.as_mut().unwrap().message = Some(Message {
            blame: Some(Blame {
                reason: Reason::Liar as i32,
                accused: Some(VerificationKey {
                    key: accused_vk.to_string(),
                }),
                ..Default::default()
            }),
            ..Default::default()
        });
        signed
    }

    /// Register and consume the reply, recording session and number.
    pub async fn register(&mut self) {
        let registration = self.registration_signed();
        self.send(vec![registration]).await;

        let reply = self.recv().await;
        assert_eq!(reply.packet.len(), 1);
        let packet = reply.packet[0].packet.as_ref().expect("empty reply");
        assert!(!packet.session.is_empty(), "expected a session id");
        assert_ne!(packet.number, 0, "expected a player number");

        self.session = packet.session.clone();
        self.number = packet.number;
    }

    /// Register while expecting the INVALIDFORMAT refusal and a close.
    pub async fn register_expect_refusal(&mut self) {
        let registration = self.registration_signed();
        self.send(vec![registration]).await;

        let reply = self.recv().await;
        let blame = reply.packet[0]
            .packet
            .as_ref()
            .and_then(|p| p.message.as_ref())
            .and_then(|m| m.blame.as_ref())
            .expect("expected a blame reply");
        assert_eq!(blame.reason, Reason::Invalidformat as i32);
        self.expect_close().await;
    }

}

/// Have `clients[sender]` broadcast a minimal keyed message and consume it
/// from every client in the slice (the sender included; broadcasts echo
/// back to their origin).
pub async fn broadcast_verification_key(clients: &mut [TestClient], sender: usize) {
    let msg = clients[sender].keyed_signed();
    let vk = clients[sender].vk.clone();
    clients[sender].send(vec![msg]).await;

    for client in clients.iter_mut() {
        let relayed = client.recv().await;
        assert_eq!(relayed.packet.len(), 1);
        let from = relayed.packet[0]
            .packet
            .as_ref()
            .and_then(|p| p.from_key.as_ref())
            .expect("relayed packet missing from_key");
        assert_eq!(from.key, vk);
    }
}

/// Have `clients[accuser]` blame `accused_vk` and consume the broadcast
/// from every client in the slice.
pub async fn blame(clients: &mut [TestClient], accuser: usize, accused_vk: &str) {
    let msg = clients[accuser].blame_signed(accused_vk);
    clients[accuser].send(vec![msg]).await;

    for client in clients.iter_mut() {
        let relayed = client.recv().await;
        let blame = relayed.packet[0]
            .packet
            .as_ref()
            .and_then(|p| p.message.as_ref())
            .and_then(|m| m.blame.as_ref())
            .expect("expected a blame broadcast");
        let accused = blame.accused.as_ref().expect("blame missing accused");
        assert_eq!(accused.key, accused_vk);
    }
}

/// Poll until `cond` holds; panics after ~2 seconds.
pub async fn wait_for(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Connect and register one more client, consuming the join notification
/// (or, when the pool fills, the announcement) on every member.
pub async fn join_and_notify(
    server: &TestServer,
    clients: &mut Vec<TestClient>,
    vk: &str,
    local_ip: &str,
    pool_size: usize,
) {
    let mut client = TestClient::connect_from(server, vk, local_ip).await;
    client.register().await;
    let joined_number = client.number;
    clients.push(client);

    let is_full = clients.len() == pool_size;
    for client in clients.iter_mut() {
        let notification = client.recv().await;
        let packet = notification.packet[0].packet.as_ref().unwrap();
        if is_full {
            assert_eq!(packet.phase, cashshuffle::proto::Phase::Announcement as i32);
            assert_eq!(packet.number as usize, pool_size);
        } else {
            assert_eq!(packet.number, joined_number);
        }
    }
}

/// Fill a fresh pool with sequentially registering clients, consuming all
/// join notifications and the final announcement.
pub async fn fill_pool(server: &TestServer, pool_size: usize, vk_prefix: &str) -> Vec<TestClient> {
    let mut clients: Vec<TestClient> = Vec::new();
    for i in 0..pool_size {
        join_and_notify(
            server,
            &mut clients,
            &format!("{vk_prefix}{i}"),
            "127.0.0.1",
            pool_size,
        )
        .await;
    }
    clients
}

/// Start a stats listener for the server's tracker on an ephemeral port.
pub async fn start_stats(server: &TestServer) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(cashshuffle::stats::serve(
        listener,
        Arc::clone(&server.tracker),
        false,
        "test stats",
    ));
    addr
}
