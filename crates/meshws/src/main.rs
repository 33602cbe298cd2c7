//! The `meshws` CLI.
//!
//! - `meshws serve` - Run an echo server (optionally re-broadcasting to every peer)
//! - `meshws connect <host>` - Connect, send messages, print replies, close
//!
//! Logging is controlled with `RUST_LOG` (default `info`).

use std::cell::RefCell;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process;
use std::rc::Rc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use mesh_ws::{
    ClientOptions, Event, Message, PeerId, ReadyState, SendOptions, ServerEvent, ServerOptions,
    Transport, WebSocketClient, WebSocketServer, WsCloseCode, WsError,
};

#[derive(Parser)]
#[command(name = "meshws", version, about = "WebSocket echo server and client")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept WebSocket connections and echo every message
    Serve {
        /// Port to listen on (0 picks a free port)
        #[arg(short, long, default_value = "8080")]
        port: u16,

        /// Address to bind
        #[arg(long, default_value = "0.0.0.0")]
        bind: IpAddr,

        /// PEM certificate chain; serves wss:// together with --key
        #[arg(long, requires = "key")]
        cert: Option<PathBuf>,

        /// PEM private key
        #[arg(long, requires = "cert")]
        key: Option<PathBuf>,

        /// Send each message to every open peer instead of only the sender
        #[arg(long)]
        broadcast: bool,
    },
    /// Connect to a server, send messages and print what comes back
    Connect {
        /// Host, optionally prefixed with ws:// or wss://
        host: String,

        /// Port (defaults to 80, or 443 for wss://)
        #[arg(short, long)]
        port: Option<u16>,

        /// Request path
        #[arg(long, default_value = "/")]
        path: String,

        /// Text message to send; may be repeated
        #[arg(short, long = "message")]
        messages: Vec<String>,

        /// Send a ping and wait for its pong
        #[arg(long)]
        ping: bool,

        /// Seconds to wait for the handshake and for replies
        #[arg(long, default_value = "10")]
        timeout: u64,
    },
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Serve {
            port,
            bind,
            cert,
            key,
            broadcast,
        } => serve(port, bind, cert.zip(key), broadcast),
        Commands::Connect {
            host,
            port,
            path,
            messages,
            ping,
            timeout,
        } => connect(&host, port, &path, &messages, ping, Duration::from_secs(timeout)),
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
        process::exit(1);
    }
}

fn serve(
    port: u16,
    bind: IpAddr,
    pem: Option<(PathBuf, PathBuf)>,
    broadcast: bool,
) -> mesh_ws::Result<()> {
    let mut opts = match &pem {
        Some((cert, key)) => ServerOptions::with_pem_files(cert, key)?,
        None => ServerOptions::default(),
    };
    opts.bind_addr = bind;

    let mut server = WebSocketServer::listen(port, &opts)?;
    tracing::info!(addr = %server.local_addr(), broadcast, "serving");

    // Listeners cannot reach the server; queue messages and answer between turns.
    let inbox: Rc<RefCell<Vec<(PeerId, Message)>>> = Rc::default();
    let sink = inbox.clone();
    server.on(move |event| match event {
        ServerEvent::Open(peer) => tracing::info!(%peer, "peer open"),
        ServerEvent::Message(peer, msg) => sink.borrow_mut().push((*peer, msg.clone())),
        ServerEvent::Close(peer, info) => {
            tracing::info!(%peer, code = info.code, reason = %info.reason, "peer closed")
        }
        ServerEvent::Error(peer, err) => tracing::warn!(?peer, error = %err, "peer error"),
        ServerEvent::Ping(..) | ServerEvent::Pong(..) => {}
    });

    loop {
        server.turn(mesh_ws::net::POLL_INTERVAL);
        let pending = std::mem::take(&mut *inbox.borrow_mut());
        for (peer, msg) in pending {
            let opts = if msg.is_binary() { SendOptions::binary() } else { SendOptions::text() };
            let sent = if broadcast {
                server.broadcast(msg.as_bytes(), opts).map(|_| ())
            } else {
                server.send_to(peer, msg.as_bytes(), opts)
            };
            if let Err(e) = sent {
                tracing::warn!(%peer, error = %e, "reply failed");
            }
        }
    }
}

fn connect(
    host: &str,
    port: Option<u16>,
    path: &str,
    messages: &[String],
    ping: bool,
    timeout: Duration,
) -> mesh_ws::Result<()> {
    let opts = if host.starts_with("wss://") {
        ClientOptions::with_webpki_roots()
    } else {
        ClientOptions::default()
    };
    let mut client = WebSocketClient::connect(host, port, path, &opts)?;

    let replies = Rc::new(RefCell::new(0usize));
    let counter = replies.clone();
    client.on(move |event| match event {
        Event::Open => println!("connected"),
        Event::Message(Message::Text(text)) => {
            println!("< {}", text);
            *counter.borrow_mut() += 1;
        }
        Event::Message(Message::Binary(data)) => {
            println!("< [{} bytes]", data.len());
            *counter.borrow_mut() += 1;
        }
        Event::Pong(payload) => println!("< pong ({} bytes)", payload.len()),
        Event::Close(info) => println!("closed: {} {}", info.code, info.reason),
        Event::Error(err) => eprintln!("error: {}", err),
        Event::Ping(_) => {}
    });

    let settled = client.run_until(timeout, |conn| conn.ready_state() != ReadyState::Connecting);
    if !settled || client.is_closed() {
        return Err(WsError::Protocol("handshake did not complete".to_string()));
    }

    for message in messages {
        println!("> {}", message);
        client.connection_mut().send_text(message)?;
    }
    if ping {
        client.connection_mut().ping(b"meshws")?;
    }

    let expected = messages.len();
    client.run_until(timeout, |conn| {
        let answered = *replies.borrow() >= expected && conn.pending_pings() == 0;
        answered || conn.ready_state().is_closed()
    });

    client.connection_mut().close(Some(WsCloseCode::NORMAL), "")?;
    if !client.run_until(timeout, |conn| conn.ready_state().is_closed()) {
        client.connection_mut().transport_mut().destroy();
    }
    Ok(())
}
