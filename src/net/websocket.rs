//! WebSocket shuffle listener.
//!
//! The wire protocol is byte-identical to the TCP path: binary WebSocket
//! frames carry the same magic-prefixed records, accumulated into a buffer
//! and decoded by the shared codec. Text frames are a protocol error; the
//! framing cannot be expressed in text and clients must use binary framing.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tokio_util::codec::Decoder;
use tracing::{debug, info};

use crate::net::connection::{Connection, DEADLINE};
use crate::net::framing::{encode_frame, ShuffleCodec};
use crate::net::listener::ServerContext;
use crate::net::tls::TlsMode;
use crate::proto::Packets;
use crate::shuffle::dispatcher::PacketInfo;

/// Accept loop for WebSocket clients, with optional TLS termination.
pub async fn serve(
    listener: TcpListener,
    ctx: ServerContext,
    tls: Option<TlsMode>,
    label: &'static str,
) -> std::io::Result<()> {
    info!(
        addr = %listener.local_addr()?,
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
                        Ok(None) => {}
                        Err(err) => debug!(%ip, error = %err, "tls handshake failed"),
                    }
                });
            }
        }
    }
}

async fn handle_connection<S>(stream: S, peer: SocketAddr, ctx: ServerContext)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(err) => {
            debug!(peer = %peer, error = %err, "websocket handshake failed");
            return;
        }
    };

    let (sink, source) = ws.split();
    let (conn, outbound) = Connection::new(peer);

    let writer = tokio::spawn(write_loop(sink, outbound, Arc::clone(&conn)));

    read_loop(source, &conn, &ctx).await;

    ctx.tracker.remove(&conn);
    conn.close();
    let _ = writer.await;
    debug!(conn = %conn.id(), peer = %peer, "websocket connection closed");
}

async fn read_loop<S>(
    mut source: SplitStream<WebSocketStream<S>>,
    conn: &Arc<Connection>,
    ctx: &ServerContext,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut codec = ShuffleCodec;
    let mut buf = BytesMut::new();

    'conn: loop {
        let next = tokio::select! {
            _ = conn.wait_closed() => break,
            next = tokio::time::timeout_at(conn.deadline().instant(), source.next()) => next,
        };

        let message = match next {
            Err(_elapsed) => {
                if conn.deadline().expired() {
                    debug!(conn = %conn.id(), "connection deadline expired");
                    break;
                }
                continue;
            }
            Ok(None) => break,
            Ok(Some(Err(err))) => {
                debug!(conn = %conn.id(), error = %err, "websocket read failed");
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Binary(data) => {
                buf.extend_from_slice(&data);
                // one websocket frame may carry any number of records
                loop {
                    match codec.decode(&mut buf) {
                        Ok(Some(packets)) => {
                            conn.deadline().extend(DEADLINE);
                            let envelope = PacketInfo {
                                packets,
                                conn: Arc::clone(conn),
                            };
                            if ctx.dispatcher.send(envelope).await.is_err() {
                                break 'conn;
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            debug!(conn = %conn.id(), error = %err, "frame decode failed");
                            break 'conn;
                        }
                    }
                }
            }
            // tungstenite answers pings internally
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => break,
            other => {
                debug!(conn = %conn.id(), kind = ?other, "non-binary websocket frame");
                break;
            }
        }
    }
}

async fn write_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut outbound: mpsc::UnboundedReceiver<Packets>,
    conn: Arc<Connection>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            queued = outbound.recv() => match queued {
                Some(packets) => {
                    if !write_frame(&mut sink, &packets, &conn).await {
                        break;
                    }
                }
                None => break,
            },
            _ = conn.wait_closed() => {
                while let Ok(packets) = outbound.try_recv() {
                    if !write_frame(&mut sink, &packets, &conn).await {
                        break;
                    }
                }
                break;
            }
        }
    }
}

async fn write_frame<S>(
    sink: &mut SplitSink<WebSocketStream<S>, Message>,
    packets: &Packets,
    conn: &Arc<Connection>,
) -> bool
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = match encode_frame(packets) {
        Ok(frame) => frame,
        Err(err) => {
            debug!(conn = %conn.id(), error = %err, "frame encode failed");
            return false;
        }
    };

    debug!(conn = %conn.id(), envelope = ?packets, "sent");
    match sink.send(Message::Binary(frame)).await {
        Ok(()) => {
            conn.deadline().extend(DEADLINE);
            true
        }
        Err(err) => {
            debug!(conn = %conn.id(), error = %err, "websocket write failed");
            false
        }
    }
}
