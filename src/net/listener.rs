//! TCP shuffle listener and the per-connection reader/writer tasks.
//!
//! # Responsibilities
//! - Accept connections, enforcing the per-IP rate limit and the IP ban
//! - Optionally terminate TLS before the protocol starts
//! - Run one reader task per connection feeding the dispatcher channel
//! - Run one writer task per connection draining its outbound queue
//!
//! # Design Decisions
//! - Reader and writer are generic over the stream so plain TCP and TLS
//!   share one code path
//! - The reader enforces the combined deadline with `timeout_at`; a timeout
//!   is re-checked against the shared deadline because the writer may have
//!   extended it mid-wait
//! - Reader exit unconditionally unregisters the player from the tracker

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::net::connection::{Connection, DEADLINE};
use crate::net::framing::ShuffleCodec;
use crate::net::tls::TlsMode;
use crate::proto::Packets;
use crate::security::rate_limit::AcceptLimiter;
use crate::shuffle::dispatcher::PacketInfo;
use crate::shuffle::tracker::Tracker;
use tokio_util::codec::{FramedRead, FramedWrite};

/// Everything a listener needs to hand connections to the core.
#[derive(Clone)]
pub struct ServerContext {
    pub tracker: Arc<Tracker>,
    pub dispatcher: mpsc::Sender<PacketInfo>,
    pub limiter: Arc<AcceptLimiter>,
}

/// Accept loop for the framed TCP protocol, with optional TLS termination.
pub async fn serve(
    listener: TcpListener,
    ctx: ServerContext,
    tls: Option<TlsMode>,
    label: &'static str,
) -> std::io::Result<()> {
    info!(
        addr = %listener.local_addr()?,
        pool_size = ctx.tracker.pool_size(),
        tls = tls.is_some(),
        "{label} listener bound"
    );

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                debug!(error = %err, "accept failed");
                continue;
            }
        };

        let ip = peer.ip().to_string();

        if !ctx.limiter.allow(&ip) {
            debug!(%ip, "rate limit exceeded");
            continue;
        }

        if ctx.tracker.banned_by_server(&ip) {
            debug!(%ip, "rejected banned ip");
            continue;
        }

        let ctx = ctx.clone();
        match tls.clone() {
            None => {
                tokio::spawn(handle_connection(stream, peer, ctx));
            }
            Some(mode) => {
                tokio::spawn(async move {
                    match mode.accept(stream).await {
                        Ok(Some(tls_stream)) => handle_connection(tls_stream, peer, ctx).await,
                        // TLS-ALPN challenge connections carry no protocol
                        Ok(None) => {}
                        Err(err) => debug!(%ip, error = %err, "tls handshake failed"),
                    }
                });
            }
        }
    }
}

/// Drive one connection to completion: spawn its writer, run its reader
/// inline, then unregister and tear down.
pub async fn handle_connection<S>(stream: S, peer: std::net::SocketAddr, ctx: ServerContext)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (conn, outbound) = Connection::new(peer);
    let (read_half, write_half) = tokio::io::split(stream);

    let writer = tokio::spawn(write_loop(write_half, outbound, Arc::clone(&conn)));

    read_loop(FramedRead::new(read_half, ShuffleCodec), &conn, &ctx).await;

    ctx.tracker.remove(&conn);
    conn.close();
    let _ = writer.await;
    debug!(conn = %conn.id(), peer = %peer, "connection closed");
}

async fn read_loop<R>(mut frames: FramedRead<R, ShuffleCodec>, conn: &Arc<Connection>, ctx: &ServerContext)
where
    R: AsyncRead + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = conn.wait_closed() => break,
            next = tokio::time::timeout_at(conn.deadline().instant(), frames.next()) => next,
        };

        let packets = match next {
            Err(_elapsed) => {
                if conn.deadline().expired() {
                    debug!(conn = %conn.id(), "connection deadline expired");
                    break;
                }
                // the writer extended the deadline while we waited
                continue;
            }
            Ok(None) => break,
            Ok(Some(Err(err))) => {
                debug!(conn = %conn.id(), error = %err, "frame decode failed");
                break;
            }
            Ok(Some(Ok(packets))) => packets,
        };

        conn.deadline().extend(DEADLINE);

        let envelope = PacketInfo {
            packets,
            conn: Arc::clone(conn),
        };
        if ctx.dispatcher.send(envelope).await.is_err() {
            break;
        }
    }
}

async fn write_loop<W>(
    write_half: W,
    mut outbound: mpsc::UnboundedReceiver<Packets>,
    conn: Arc<Connection>,
) where
    W: AsyncWrite + Unpin,
{
    let mut frames = FramedWrite::new(write_half, ShuffleCodec);

    loop {
        tokio::select! {
            queued = outbound.recv() => match queued {
                Some(packets) => {
                    if !write_frame(&mut frames, &packets, &conn).await {
                        break;
                    }
                }
                None => break,
            },
            _ = conn.wait_closed() => {
                // flush whatever was queued before the close, then stop
                while let Ok(packets) = outbound.try_recv() {
                    if !write_frame(&mut frames, &packets, &conn).await {
                        break;
                    }
                }
                break;
            }
        }
    }
}

async fn write_frame<W>(
    frames: &mut FramedWrite<W, ShuffleCodec>,
    packets: &Packets,
    conn: &Arc<Connection>,
) -> bool
where
    W: AsyncWrite + Unpin,
{
    debug!(conn = %conn.id(), envelope = ?packets, "sent");
    match frames.send(packets).await {
        Ok(()) => {
            conn.deadline().extend(DEADLINE);
            true
        }
        Err(err) => {
            debug!(conn = %conn.id(), error = %err, "frame write failed");
            false
        }
    }
}
