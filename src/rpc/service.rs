//! Dispatch-target contract.
//!
//! A [`Service`] describes its methods with a [`ServiceDescriptor`], hands
//! the channel fresh request/response payloads for a method, and runs
//! invocations. Payloads are [`Message`]s: any serde type, encoded with
//! postcard.
//!
//! ```text
//!  channel ──find_method_by_name──▶ MethodDescriptor
//!     │                                  │
//!     ├──new_request / new_response──────┤
//!     ▼                                  ▼
//!  Invocation::Unary(ServerCall) ──▶ handler ──finish()──▶ RESPONSE / RESPONSE_FAILED
//!  Invocation::Stream(request)   ──▶ handler                (no reply)
//! ```

use core::any::Any;
use core::fmt;
use std::collections::HashMap;

use log::warn;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::controller::RpcController;
use crate::error::CodecError;

// ── Payload messages ─────────────────────────────────────────

/// A request or response payload.
///
/// Blanket-implemented for every serde type; postcard is the wire form.
pub trait Message: Any {
    fn encode(&self) -> Result<Vec<u8>, CodecError>;

    /// Replace `self` with the value decoded from `bytes`.
    fn decode_from(&mut self, bytes: &[u8]) -> Result<(), CodecError>;

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<T> Message for T
where
    T: Serialize + DeserializeOwned + Any,
{
    fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(postcard::to_allocvec(self)?)
    }

    fn decode_from(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        *self = postcard::from_bytes(bytes)?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

impl dyn Message {
    pub fn downcast_ref<M: Any>(&self) -> Option<&M> {
        self.as_any().downcast_ref()
    }

    pub fn downcast_mut<M: Any>(&mut self) -> Option<&mut M> {
        self.as_any_mut().downcast_mut()
    }

    pub fn downcast<M: Any>(self: Box<Self>) -> Option<Box<M>> {
        self.into_any().downcast().ok()
    }
}

impl fmt::Debug for dyn Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dyn Message")
    }
}

// ── Descriptors ──────────────────────────────────────────────

/// Whether a method answers.
///
/// `Streaming` is the "no response" marker: the caller sends a
/// STREAM_REQUEST and never hears back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    Unary,
    Streaming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub name: &'static str,
    pub kind: MethodKind,
}

impl MethodDescriptor {
    pub const fn unary(name: &'static str) -> Self {
        Self {
            name,
            kind: MethodKind::Unary,
        }
    }

    pub const fn streaming(name: &'static str) -> Self {
        Self {
            name,
            kind: MethodKind::Streaming,
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.kind == MethodKind::Streaming
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServiceDescriptor {
    pub name: &'static str,
    pub methods: Vec<MethodDescriptor>,
}

impl ServiceDescriptor {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            methods: Vec::new(),
        }
    }

    pub fn find_method_by_name(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.iter().find(|m| m.name == name)
    }
}

// ── Invocations ──────────────────────────────────────────────

/// Completion callback: receives the call's controller and response back.
pub type Completion = Box<dyn FnOnce(RpcController, Box<dyn Message>)>;

/// A unary call handed to a service.
///
/// The handler fills `response` (or fails `controller`) and then calls
/// [`finish`](Self::finish), immediately or later from another event.
/// Dropping a `ServerCall` without finishing leaves the peer waiting.
pub struct ServerCall {
    pub controller: RpcController,
    pub request: Box<dyn Message>,
    pub response: Box<dyn Message>,
    done: Completion,
}

impl ServerCall {
    pub(crate) fn new(
        controller: RpcController,
        request: Box<dyn Message>,
        response: Box<dyn Message>,
        done: Completion,
    ) -> Self {
        Self {
            controller,
            request,
            response,
            done,
        }
    }

    pub fn request<M: Any>(&self) -> Option<&M> {
        self.request.downcast_ref()
    }

    pub fn response_mut<M: Any>(&mut self) -> Option<&mut M> {
        self.response.downcast_mut()
    }

    /// Send the response (or the controller's failure) back to the caller.
    pub fn finish(self) {
        (self.done)(self.controller, self.response);
    }

    /// Fail the call with `reason` and finish it.
    pub fn fail(mut self, reason: impl Into<String>) {
        self.controller.set_failed(reason);
        self.finish();
    }
}

impl fmt::Debug for ServerCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerCall")
            .field("controller", &self.controller)
            .finish_non_exhaustive()
    }
}

/// What the channel hands to [`Service::call_method`].
#[derive(Debug)]
pub enum Invocation {
    Unary(ServerCall),
    /// Streaming calls carry only the request: no controller, no response,
    /// no completion.
    Stream(Box<dyn Message>),
}

/// Caller-side reply slot for a unary call.
///
/// The channel keeps it until the matching response arrives, fills
/// `response`/`controller`, then runs `done` with both.
pub struct ClientCall {
    pub controller: RpcController,
    pub response: Box<dyn Message>,
    pub done: Completion,
}

impl ClientCall {
    pub fn new(
        response: Box<dyn Message>,
        done: impl FnOnce(RpcController, Box<dyn Message>) + 'static,
    ) -> Self {
        Self {
            controller: RpcController::new(),
            response,
            done: Box::new(done),
        }
    }

    pub(crate) fn complete(self) {
        (self.done)(self.controller, self.response);
    }

    pub(crate) fn fail(mut self, reason: &str) {
        self.controller.set_failed(reason);
        self.complete();
    }
}

impl fmt::Debug for ClientCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCall")
            .field("controller", &self.controller)
            .finish_non_exhaustive()
    }
}

// ── Service trait ────────────────────────────────────────────

pub trait Service {
    fn descriptor(&self) -> &ServiceDescriptor;

    /// Fresh, empty request payload for `method`.
    fn new_request(&self, method: &MethodDescriptor) -> Box<dyn Message>;

    /// Fresh, empty response payload for `method`. Not called for
    /// streaming methods.
    fn new_response(&self, method: &MethodDescriptor) -> Box<dyn Message>;

    fn call_method(&self, method: &MethodDescriptor, invocation: Invocation);
}

// ── Closure-backed service ───────────────────────────────────

fn make<M: Message + Default>() -> Box<dyn Message> {
    Box::new(M::default())
}

enum Handler {
    Unary(Box<dyn Fn(ServerCall)>),
    Stream(Box<dyn Fn(Box<dyn Message>)>),
}

struct MethodEntry {
    new_request: fn() -> Box<dyn Message>,
    new_response: fn() -> Box<dyn Message>,
    handler: Handler,
}

/// A [`Service`] assembled from typed closures.
///
/// ```ignore
/// let svc = MethodTable::new("Echo")
///     .unary::<EchoRequest, EchoReply, _>("Echo", |mut call| {
///         let data = call.request::<EchoRequest>().map(|r| r.data.clone());
///         if let Some(reply) = call.response_mut::<EchoReply>() {
///             reply.data = data.unwrap_or_default();
///         }
///         call.finish();
///     });
/// ```
pub struct MethodTable {
    descriptor: ServiceDescriptor,
    entries: HashMap<&'static str, MethodEntry>,
}

impl MethodTable {
    pub fn new(name: &'static str) -> Self {
        Self {
            descriptor: ServiceDescriptor::new(name),
            entries: HashMap::new(),
        }
    }

    /// Register a unary method. Re-registering a name replaces it.
    #[must_use]
    pub fn unary<Req, Resp, F>(self, name: &'static str, handler: F) -> Self
    where
        Req: Message + Default,
        Resp: Message + Default,
        F: Fn(ServerCall) + 'static,
    {
        self.insert(
            MethodDescriptor::unary(name),
            MethodEntry {
                new_request: make::<Req>,
                new_response: make::<Resp>,
                handler: Handler::Unary(Box::new(handler)),
            },
        )
    }

    /// Register a streaming (no response) method.
    #[must_use]
    pub fn streaming<Req, F>(self, name: &'static str, handler: F) -> Self
    where
        Req: Message + Default,
        F: Fn(Req) + 'static,
    {
        let handler = move |request: Box<dyn Message>| match request.downcast::<Req>() {
            Some(request) => handler(*request),
            None => warn!("RPC: {} received a request of the wrong type", name),
        };
        self.insert(
            MethodDescriptor::streaming(name),
            MethodEntry {
                new_request: make::<Req>,
                new_response: make::<()>,
                handler: Handler::Stream(Box::new(handler)),
            },
        )
    }

    fn insert(mut self, method: MethodDescriptor, entry: MethodEntry) -> Self {
        self.descriptor.methods.retain(|m| m.name != method.name);
        self.descriptor.methods.push(method);
        self.entries.insert(method.name, entry);
        self
    }
}

impl Service for MethodTable {
    fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    fn new_request(&self, method: &MethodDescriptor) -> Box<dyn Message> {
        self.entries
            .get(method.name)
            .map_or_else(make::<()>, |e| (e.new_request)())
    }

    fn new_response(&self, method: &MethodDescriptor) -> Box<dyn Message> {
        self.entries
            .get(method.name)
            .map_or_else(make::<()>, |e| (e.new_response)())
    }

    fn call_method(&self, method: &MethodDescriptor, invocation: Invocation) {
        let Some(entry) = self.entries.get(method.name) else {
            warn!("RPC: {} has no method {}", self.descriptor.name, method.name);
            return;
        };
        match (&entry.handler, invocation) {
            (Handler::Unary(h), Invocation::Unary(call)) => h(call),
            (Handler::Stream(h), Invocation::Stream(request)) => h(request),
            (Handler::Unary(_), Invocation::Stream(_)) => {
                warn!("RPC: {} invoked as streaming but is unary", method.name);
            }
            (Handler::Stream(_), Invocation::Unary(call)) => {
                warn!("RPC: {} invoked as unary but is streaming", method.name);
                call.fail("Method is streaming");
            }
        }
    }
}
