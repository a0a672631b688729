//! Per-connection session handle.
//!
//! Each channel carries one [`RpcSession`]. Layers above the channel use it
//! to identify the peer and to stash arbitrary per-client state; the server
//! wrapper hands it to its [`SessionListener`](super::server::SessionListener)
//! on connect and disconnect.

use core::any::Any;
use core::cell::RefCell;
use core::fmt;

/// Session identifier, unique within one server.
pub type SessionId = u64;

pub struct RpcSession {
    id: SessionId,
    data: RefCell<Option<Box<dyn Any>>>,
}

impl RpcSession {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            data: RefCell::new(None),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Attach application state, replacing anything stored before.
    pub fn set_data<D: Any>(&self, data: D) {
        *self.data.borrow_mut() = Some(Box::new(data));
    }

    /// Remove and return the attached state if it has type `D`.
    pub fn take_data<D: Any>(&self) -> Option<D> {
        let mut slot = self.data.borrow_mut();
        if !slot.as_ref().is_some_and(|d| d.is::<D>()) {
            return None;
        }
        slot.take()
            .and_then(|d| d.downcast::<D>().ok())
            .map(|d| *d)
    }

    /// Run `f` against the attached state if it has type `D`.
    pub fn with_data<D: Any, R>(&self, f: impl FnOnce(&mut D) -> R) -> Option<R> {
        let mut slot = self.data.borrow_mut();
        slot.as_mut().and_then(|d| d.downcast_mut::<D>()).map(f)
    }

    pub fn has_data(&self) -> bool {
        self.data.borrow().is_some()
    }
}

impl fmt::Debug for RpcSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcSession")
            .field("id", &self.id)
            .field("has_data", &self.has_data())
            .finish()
    }
}
