//! Per-call status object.
//!
//! Every unary call carries an [`RpcController`]. The callee marks it failed
//! to report an application-level error; the channel marks it failed for
//! transport and protocol problems. Either way the caller inspects it in its
//! completion callback.

use std::rc::Rc;

use super::session::RpcSession;

#[derive(Debug, Default)]
pub struct RpcController {
    failed: bool,
    error_text: String,
    session: Option<Rc<RpcSession>>,
}

impl RpcController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Controller for a request that arrived on `session`.
    pub(crate) fn for_session(session: Rc<RpcSession>) -> Self {
        Self {
            session: Some(session),
            ..Self::default()
        }
    }

    /// Clear the status so the controller can be reused for another call.
    pub fn reset(&mut self) {
        self.failed = false;
        self.error_text.clear();
    }

    pub fn failed(&self) -> bool {
        self.failed
    }

    pub fn error_text(&self) -> &str {
        &self.error_text
    }

    pub fn set_failed(&mut self, reason: impl Into<String>) {
        self.failed = true;
        self.error_text = reason.into();
    }

    /// The session the request arrived on (server side only).
    pub fn session(&self) -> Option<&Rc<RpcSession>> {
        self.session.as_ref()
    }
}
