//! Transport-agnostic RPC subsystem.
//!
//! Length-prefixed, full-duplex request/response RPC over one byte stream.
//! Either side of a connection can call and serve at the same time.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                      RPC Stack                             │
//! │                                                            │
//! │  ┌───────────┐   ┌──────────┐   ┌───────────────────────┐  │
//! │  │ Transport │──▶│  Codec   │──▶│  Channel (dispatch)   │  │
//! │  │ (trait)   │   │ (framing)│   │  → Service            │  │
//! │  └───────────┘   └──────────┘   └───────────────────────┘  │
//! │       ▲                                    │               │
//! │       │              ┌─────────────────────┘               │
//! │       │              ▼                                     │
//! │  ┌───────────┐   ┌──────────────┐   ┌─────────────────┐    │
//! │  │ Transport │◀──│ Envelope     │   │ Server + Session│    │
//! │  │ (write)   │   │ (responses)  │   │ (per client)    │    │
//! │  └───────────┘   └──────────────┘   └─────────────────┘    │
//! └────────────────────────────────────────────────────────────┘
//! ```

pub mod channel;
pub mod codec;
pub mod controller;
pub mod envelope;
pub mod event_loop;
pub mod io_task;
pub mod sequence;
pub mod server;
pub mod service;
pub mod session;
pub mod transport;

pub use channel::RpcChannel;
pub use controller::RpcController;
pub use event_loop::{EventLoop, TaskQueue};
pub use server::{RpcServer, SessionListener};
pub use service::{
    ClientCall, Invocation, Message, MethodDescriptor, MethodKind, MethodTable, ServerCall,
    Service, ServiceDescriptor,
};
pub use session::{RpcSession, SessionId};
pub use transport::{LoopbackTransport, TcpTransport, Transport};
