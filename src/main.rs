//! Binary entry point: merge config and flags, then bring up the tracker,
//! dispatcher, and every enabled listener.

use std::fmt::Display;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cashshuffle::cli::Cli;
use cashshuffle::config;
use cashshuffle::net::listener::ServerContext;
use cashshuffle::net::{listener, tls, websocket};
use cashshuffle::security::AcceptLimiter;
use cashshuffle::shuffle::dispatcher;
use cashshuffle::shuffle::tracker::{ListenerPorts, Tracker};
use cashshuffle::stats;

/// Accepts allowed per IP per minute on the public listeners.
const IP_RATE_LIMIT: u32 = 180;

/// Tor exits aggregate many users behind one IP, so the limit is higher.
const TOR_IP_RATE_LIMIT: u32 = 500;

fn bail(err: impl Display) -> ! {
    eprintln!("[Error] {err}");
    process::exit(1);
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            process::exit(1);
        }
    };

    if cli.version {
        println!("cashshuffle {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    let mut config = match config::load() {
        Ok(config) => config,
        Err(err) => bail(format!("Failed to load configuration: {err}")),
    };
    cli.apply(&mut config);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                if config.debug {
                    "cashshuffle=debug".into()
                } else {
                    "cashshuffle=info".into()
                }
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pool_size = config.pool_size,
        "cashshuffle starting"
    );

    // SIGINT exits cleanly; connections are dropped by the OS.
    tokio::spawn(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            process::exit(0);
        }
    });

    let tracker = Tracker::new(
        config.pool_size,
        ListenerPorts {
            shuffle: config.port,
            websocket: config.websocket_port,
            tor_shuffle: config.tor_port,
            tor_websocket: config.tor_websocket_port,
        },
    );

    {
        let tracker = Arc::clone(&tracker);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                tracker.cleanup_denied_by_ip_match();
            }
        });
    }

    let dispatcher = dispatcher::start(Arc::clone(&tracker));

    // pin the rustls crypto provider before any TLS config is built
    let _ = rustls::crypto::ring::default_provider().install_default();

    let tls_mode = if !config.auto_cert.is_empty() {
        let Some(cache_dir) = config::config_dir().map(|dir| dir.join("certs")) else {
            bail("cannot resolve a home directory for the certificate cache");
        };
        if let Err(err) = std::fs::create_dir_all(&cache_dir) {
            bail(format!("cannot create certificate cache: {err}"));
        }
        Some(tls::acme_acceptor(&config.auto_cert, cache_dir))
    } else if !config.cert.is_empty() && !config.key.is_empty() {
        match tls::static_acceptor(&config.cert, &config.key) {
            Ok(mode) => Some(mode),
            Err(err) => bail(err),
        }
    } else {
        None
    };

    let ctx = ServerContext {
        tracker: Arc::clone(&tracker),
        dispatcher: dispatcher.clone(),
        limiter: Arc::new(AcceptLimiter::new(IP_RATE_LIMIT)),
    };
    let tor_ctx = ServerContext {
        tracker: Arc::clone(&tracker),
        dispatcher,
        limiter: Arc::new(AcceptLimiter::new(TOR_IP_RATE_LIMIT)),
    };

    let (err_tx, mut err_rx) = tokio::sync::mpsc::channel::<std::io::Error>(1);

    macro_rules! spawn_server {
        ($server:expr) => {{
            let err_tx = err_tx.clone();
            let server = $server;
            tokio::spawn(async move {
                if let Err(err) = server.await {
                    let _ = err_tx.send(err).await;
                }
            });
        }};
    }

    let bind = |ip: String, port: u16| async move {
        TcpListener::bind((ip.as_str(), port))
            .await
            .unwrap_or_else(|err| bail(format!("unable to bind {ip}:{port}: {err}")))
    };

    let shuffle_listener = bind(config.bind_ip.clone(), config.port).await;
    spawn_server!(listener::serve(
        shuffle_listener,
        ctx.clone(),
        tls_mode.clone(),
        "shuffle"
    ));

    if config.websocket_port > 0 {
        let ws_listener = bind(config.bind_ip.clone(), config.websocket_port).await;
        spawn_server!(websocket::serve(
            ws_listener,
            ctx.clone(),
            tls_mode.clone(),
            "websocket"
        ));
    }

    if config.stats_port > 0 {
        let stats_listener = bind(config.bind_ip.clone(), config.stats_port).await;
        spawn_server!(stats::serve(
            stats_listener,
            Arc::clone(&tracker),
            false,
            "stats"
        ));
    }

    // The tor listener set speaks the identical protocol on dedicated
    // ports, without TLS; tor provides the transport security.
    if config.tor {
        let tor_listener = bind(config.tor_bind_ip.clone(), config.tor_port).await;
        spawn_server!(listener::serve(
            tor_listener,
            tor_ctx.clone(),
            None,
            "tor shuffle"
        ));

        if config.tor_websocket_port > 0 {
            let tor_ws = bind(config.tor_bind_ip.clone(), config.tor_websocket_port).await;
            spawn_server!(websocket::serve(
                tor_ws,
                tor_ctx.clone(),
                None,
                "tor websocket"
            ));
        }

        if config.tor_stats_port > 0 {
            let tor_stats = bind(config.tor_bind_ip.clone(), config.tor_stats_port).await;
            spawn_server!(stats::serve(
                tor_stats,
                Arc::clone(&tracker),
                true,
                "tor stats"
            ));
        }
    }

    if let Some(err) = err_rx.recv().await {
        error!(error = %err, "server error");
        process::exit(1);
    }
}
