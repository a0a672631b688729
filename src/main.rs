//! duplexrpc echo server: main entry point.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │  TcpListener ──accept──▶ RpcServer ──one RpcChannel per client │
//! │                              │                                 │
//! │                              ▼                                 │
//! │                     MethodTable "Echo"                         │
//! │                     · Echo  (unary: reply with the same bytes) │
//! │                     · Log   (streaming: print, never answered) │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Usage: `duplexrpc-echo [config.json]`. Set `RUST_LOG` to adjust logging.
#![deny(unused_must_use)]

use std::net::TcpListener;
use std::rc::Rc;

use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};

use duplexrpc::config::ServerConfig;
use duplexrpc::rpc::{
    EventLoop, MethodTable, RpcServer, RpcSession, ServerCall, SessionListener, TcpTransport,
    io_task,
};

// ── Payloads ──────────────────────────────────────────────────

#[derive(Debug, Default, Serialize, Deserialize)]
struct EchoRequest {
    data: Vec<u8>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct EchoReply {
    data: Vec<u8>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LogLine {
    text: String,
}

/// Per-client state kept on the session.
#[derive(Debug, Default)]
struct ClientStats {
    echoes: u64,
}

fn echo(mut call: ServerCall) {
    let data = call
        .request::<EchoRequest>()
        .map(|r| r.data.clone())
        .unwrap_or_default();
    if let Some(session) = call.controller.session() {
        session.with_data(|stats: &mut ClientStats| stats.echoes += 1);
    }
    if let Some(reply) = call.response_mut::<EchoReply>() {
        reply.data = data;
    }
    call.finish();
}

fn echo_service() -> MethodTable {
    MethodTable::new("Echo")
        .unary::<EchoRequest, EchoReply, _>("Echo", echo)
        .streaming::<LogLine, _>("Log", |line| info!("client says: {}", line.text))
}

// ── Session listener ──────────────────────────────────────────

struct LogListener;

impl SessionListener for LogListener {
    fn new_client(&self, session: &Rc<RpcSession>) {
        session.set_data(ClientStats::default());
        info!("RPC[{}]: session opened", session.id());
    }

    fn client_removed(&self, session: &Rc<RpcSession>) {
        let echoes = session.take_data::<ClientStats>().map_or(0, |s| s.echoes);
        info!("RPC[{}]: session closed after {} echoes", session.id(), echoes);
    }
}

// ── Entry ─────────────────────────────────────────────────────

fn load_config() -> Result<ServerConfig> {
    let Some(path) = std::env::args().nth(1) else {
        return Ok(ServerConfig::default());
    };
    let text = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    ServerConfig::from_json(&text).with_context(|| format!("parsing {path}"))
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = load_config()?;
    let listener = TcpListener::bind(&config.bind_addr)
        .with_context(|| format!("binding {}", config.bind_addr))?;

    let event_loop = Rc::new(EventLoop::new());
    let server = RpcServer::<TcpTransport>::new(Rc::new(echo_service()), event_loop.clone(), config)?;
    server.set_session_listener(Some(Rc::new(LogListener)));

    io_task::serve(listener, server, &event_loop)?;
    Ok(())
}
