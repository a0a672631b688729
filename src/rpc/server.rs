//! Server wrapper: one [`RpcChannel`] per accepted connection.
//!
//! ```text
//!  add_client(transport)
//!      │  new session id, bind service, install close handler
//!      ▼
//!  clients[id] = channel ──▶ SessionListener::new_client
//!      │
//!      │  transport fails / peer closes
//!      ▼
//!  close handler ──defer──▶ (next loop turn) remove_client(id)
//!                                │  drop channel + transport
//!                                ▼
//!                          SessionListener::client_removed
//! ```
//!
//! The close handler runs on the channel's own call stack, so it only
//! schedules removal; the channel is dropped later from the task queue.

use core::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use log::{info, warn};

use super::channel::RpcChannel;
use super::event_loop::TaskQueue;
use super::service::Service;
use super::session::{RpcSession, SessionId};
use super::transport::Transport;
use crate::config::ServerConfig;
use crate::error::Result;

/// Connect/disconnect notifications.
pub trait SessionListener {
    fn new_client(&self, session: &Rc<RpcSession>);
    fn client_removed(&self, session: &Rc<RpcSession>);
}

pub struct RpcServer<T: Transport + 'static> {
    self_ref: Weak<Self>,
    config: ServerConfig,
    service: Rc<dyn Service>,
    tasks: Rc<dyn TaskQueue>,
    listener: RefCell<Option<Rc<dyn SessionListener>>>,
    clients: RefCell<BTreeMap<SessionId, Rc<RpcChannel<T>>>>,
    next_session: Cell<SessionId>,
}

impl<T: Transport + 'static> RpcServer<T> {
    pub fn new(
        service: Rc<dyn Service>,
        tasks: Rc<dyn TaskQueue>,
        config: ServerConfig,
    ) -> Result<Rc<Self>> {
        config.validate()?;
        Ok(Rc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            config,
            service,
            tasks,
            listener: RefCell::new(None),
            clients: RefCell::new(BTreeMap::new()),
            next_session: Cell::new(1),
        }))
    }

    pub fn set_session_listener(&self, listener: Option<Rc<dyn SessionListener>>) {
        *self.listener.borrow_mut() = listener;
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Take ownership of a freshly connected transport.
    ///
    /// Returns `None` (and closes the transport) when the server is full.
    pub fn add_client(&self, mut transport: T) -> Option<Rc<RpcSession>> {
        if self.client_count() >= self.config.max_clients {
            warn!(
                "RPC: refusing client, {} of {} slots in use",
                self.client_count(),
                self.config.max_clients
            );
            transport.close();
            return None;
        }

        let id = self.next_session.get();
        self.next_session.set(id.wrapping_add(1));
        let session = Rc::new(RpcSession::new(id));

        let channel =
            RpcChannel::with_session(transport, Rc::clone(&session), self.config.channel.clone());
        channel.set_service(Some(Rc::clone(&self.service)));

        let server = self.self_ref.clone();
        channel.set_close_handler(move |session| {
            if let Some(server) = server.upgrade() {
                server.schedule_removal(session.id());
            }
        });

        self.clients.borrow_mut().insert(id, channel);
        info!("RPC[{}]: client added", id);

        let listener = self.listener.borrow().clone();
        if let Some(listener) = listener {
            listener.new_client(&session);
        }
        Some(session)
    }

    fn schedule_removal(&self, id: SessionId) {
        let server = self.self_ref.clone();
        self.tasks.defer(Box::new(move || {
            if let Some(server) = server.upgrade() {
                server.remove_client(id);
            }
        }));
    }

    fn remove_client(&self, id: SessionId) {
        let channel = self.clients.borrow_mut().remove(&id);
        let Some(channel) = channel else {
            return;
        };
        channel.close();
        let session = Rc::clone(channel.session());
        drop(channel);
        info!("RPC[{}]: client removed", id);

        let listener = self.listener.borrow().clone();
        if let Some(listener) = listener {
            listener.client_removed(&session);
        }
    }

    fn snapshot(&self) -> Vec<Rc<RpcChannel<T>>> {
        self.clients.borrow().values().cloned().collect()
    }

    /// Deliver a readable notification to every client.
    pub fn poll(&self) {
        for channel in self.snapshot() {
            channel.descriptor_ready();
        }
    }

    /// Close every client. Removal still happens on the task queue.
    pub fn close_all(&self) {
        for channel in self.snapshot() {
            channel.close();
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.borrow().len()
    }

    pub fn channel(&self, id: SessionId) -> Option<Rc<RpcChannel<T>>> {
        self.clients.borrow().get(&id).cloned()
    }
}
