//! RPC channel: one framed, full-duplex connection.
//!
//! ```text
//!            descriptor_ready()
//!                  │
//!  ┌───────────────▼────────────────┐  4 bytes   ┌──────────────────────┐
//!  │ WaitingForHeader { collected } │──────────▶│ WaitingForBody       │
//!  └───────────────▲────────────────┘            │ { expected, current }│
//!                  │     envelope decoded         └──────────┬───────────┘
//!                  └─────────── dispatch ◀───────────────────┘
//!
//!  REQUEST ─────────▶ Service::call_method ──finish()──▶ RESPONSE | RESPONSE_FAILED
//!  STREAM_REQUEST ──▶ Service::call_method                (never answered)
//!  RESPONSE* ───────▶ outstanding response by id ──▶ caller's done
//! ```
//!
//! The channel is single-threaded and reentrant: no `RefCell` borrow is held
//! while user code (service handlers, completion callbacks, the close
//! handler) runs, so any of them may call back into the channel.
//!
//! On a fatal transport problem the transport is detached *before* the close
//! handler runs. Anything reentering the channel from the handler then sees
//! "not connected" and no-ops.

use core::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use log::{debug, error, info, warn};

use super::codec::{FrameHeader, HEADER_SIZE, encode_frame};
use super::controller::RpcController;
use super::envelope::Envelope;
use super::sequence::SequenceGenerator;
use super::service::{ClientCall, Invocation, Message, MethodDescriptor, ServerCall, Service};
use super::session::RpcSession;
use super::transport::Transport;
use crate::config::ChannelConfig;
use crate::error::{Error, Result};

pub const DUPLICATE_REQUEST: &str = "Duplicate request found";
pub const NOT_IMPLEMENTED: &str = "Not Implemented";
pub const FAILED_TO_SEND: &str = "Failed to send request";
pub const FAILED_TO_PARSE: &str = "Failed to parse response";

/// Runs once, with the channel's session, when the connection goes away.
pub type CloseHandler = Box<dyn FnOnce(Rc<RpcSession>)>;

// ── Receive state ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecvState {
    WaitingForHeader {
        bytes: [u8; HEADER_SIZE],
        collected: usize,
    },
    WaitingForBody {
        expected: usize,
        current: usize,
    },
}

impl RecvState {
    const fn header() -> Self {
        Self::WaitingForHeader {
            bytes: [0; HEADER_SIZE],
            collected: 0,
        }
    }
}

/// Result of one read attempt.
enum ReadStep {
    /// Bytes were consumed; more may be available.
    Progress,
    /// A whole frame arrived.
    Frame(Envelope),
    /// Nothing more to do until the next notification.
    Idle,
    /// The connection is unusable.
    Fatal,
}

// ── Outstanding calls ────────────────────────────────────────

/// Server side: a request whose handler has not finished yet.
///
/// The ticket distinguishes this request from a later one reusing the same
/// id; only the matching completion may answer.
#[derive(Debug)]
struct OutstandingRequest {
    ticket: u64,
}

// ── Channel ──────────────────────────────────────────────────

pub struct RpcChannel<T: Transport> {
    self_ref: Weak<Self>,
    config: ChannelConfig,
    session: Rc<RpcSession>,
    transport: RefCell<Option<T>>,
    service: RefCell<Option<Rc<dyn Service>>>,
    close_handler: RefCell<Option<CloseHandler>>,
    requests: RefCell<HashMap<u32, OutstandingRequest>>,
    responses: RefCell<HashMap<u32, ClientCall>>,
    sequence: RefCell<SequenceGenerator>,
    recv: Cell<RecvState>,
    buffer: RefCell<Vec<u8>>,
    next_ticket: Cell<u64>,
    errors: Cell<u32>,
}

impl<T: Transport + 'static> RpcChannel<T> {
    /// Channel with a stand-alone session (id 0).
    pub fn new(transport: T, config: ChannelConfig) -> Rc<Self> {
        Self::with_session(transport, Rc::new(RpcSession::new(0)), config)
    }

    pub fn with_session(transport: T, session: Rc<RpcSession>, config: ChannelConfig) -> Rc<Self> {
        let initial = config.initial_buffer_size;
        Rc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            config,
            session,
            transport: RefCell::new(Some(transport)),
            service: RefCell::new(None),
            close_handler: RefCell::new(None),
            requests: RefCell::new(HashMap::new()),
            responses: RefCell::new(HashMap::new()),
            sequence: RefCell::new(SequenceGenerator::new()),
            recv: Cell::new(RecvState::header()),
            buffer: RefCell::new(vec![0; initial]),
            next_ticket: Cell::new(0),
            errors: Cell::new(0),
        })
    }

    pub fn session(&self) -> &Rc<RpcSession> {
        &self.session
    }

    /// Bind (or unbind) the service that answers inbound requests.
    pub fn set_service(&self, service: Option<Rc<dyn Service>>) {
        *self.service.borrow_mut() = service;
    }

    /// Register the single-use close handler, replacing any previous one.
    pub fn set_close_handler(&self, handler: impl FnOnce(Rc<RpcSession>) + 'static) {
        *self.close_handler.borrow_mut() = Some(Box::new(handler));
    }

    /// True while at least one outbound unary call is unanswered.
    pub fn pending_rpcs(&self) -> bool {
        !self.responses.borrow().is_empty()
    }

    /// Inbound requests whose handlers have not finished.
    pub fn outstanding_requests(&self) -> usize {
        self.requests.borrow().len()
    }

    /// Number of failed sends.
    pub fn error_count(&self) -> u32 {
        self.errors.get()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.borrow().is_some()
    }

    /// Close the connection locally. Idempotent.
    pub fn close(&self) {
        self.shutdown();
    }

    /// The reactor saw the peer go away.
    pub fn transport_closed(&self) {
        if self.is_connected() {
            info!("RPC[{}]: transport closed by peer", self.session.id());
        }
        self.shutdown();
    }

    fn shutdown(&self) {
        let transport = self.transport.borrow_mut().take();
        let Some(mut transport) = transport else {
            return;
        };
        transport.close();
        drop(transport);

        let handler = self.close_handler.borrow_mut().take();
        if let Some(handler) = handler {
            handler(Rc::clone(&self.session));
        }
    }

    // ── Receive path ─────────────────────────────────────────

    /// Readable notification: consume everything currently available and
    /// dispatch every complete frame.
    pub fn descriptor_ready(&self) {
        loop {
            match self.read_step() {
                ReadStep::Progress => {}
                ReadStep::Frame(envelope) => self.dispatch(envelope),
                ReadStep::Idle => return,
                ReadStep::Fatal => {
                    self.shutdown();
                    return;
                }
            }
        }
    }

    fn read_step(&self) -> ReadStep {
        let mut slot = self.transport.borrow_mut();
        let Some(transport) = slot.as_mut() else {
            return ReadStep::Idle;
        };
        if !transport.is_readable() {
            return ReadStep::Idle;
        }
        let sid = self.session.id();

        match self.recv.get() {
            RecvState::WaitingForHeader {
                mut bytes,
                collected,
            } => {
                let n = match transport.read(&mut bytes[collected..]) {
                    Ok(0) => return ReadStep::Idle,
                    Ok(n) => n,
                    Err(e) => {
                        debug!("RPC[{}]: read failed: {:?}", sid, e);
                        return ReadStep::Fatal;
                    }
                };
                let collected = collected + n;
                if collected < HEADER_SIZE {
                    self.recv.set(RecvState::WaitingForHeader { bytes, collected });
                    return ReadStep::Progress;
                }

                self.recv.set(RecvState::header());
                let header = FrameHeader::from_bytes(bytes);
                if !header.is_current_version() {
                    warn!(
                        "RPC[{}]: protocol version mismatch, got {}",
                        sid, header.version
                    );
                    return if self.config.close_on_version_mismatch {
                        ReadStep::Fatal
                    } else {
                        ReadStep::Idle
                    };
                }

                let expected = header.length as usize;
                if expected == 0 {
                    debug!("RPC[{}]: ignoring empty frame", sid);
                    return ReadStep::Progress;
                }
                if expected > self.config.max_buffer_size {
                    warn!(
                        "RPC[{}]: frame of {} bytes exceeds max {}",
                        sid, expected, self.config.max_buffer_size
                    );
                    return ReadStep::Fatal;
                }

                let mut buffer = self.buffer.borrow_mut();
                let have = buffer.len();
                if have < expected {
                    if buffer.try_reserve(expected - have).is_err() {
                        warn!("RPC[{}]: cannot grow receive buffer to {}", sid, expected);
                        return ReadStep::Idle;
                    }
                    buffer.resize(expected, 0);
                }
                self.recv.set(RecvState::WaitingForBody {
                    expected,
                    current: 0,
                });
                ReadStep::Progress
            }

            RecvState::WaitingForBody { expected, current } => {
                let mut buffer = self.buffer.borrow_mut();
                let n = match transport.read(&mut buffer[current..expected]) {
                    Ok(0) => return ReadStep::Idle,
                    Ok(n) => n,
                    Err(e) => {
                        debug!("RPC[{}]: read failed: {:?}", sid, e);
                        return ReadStep::Fatal;
                    }
                };
                let current = current + n;
                if current < expected {
                    self.recv.set(RecvState::WaitingForBody { expected, current });
                    return ReadStep::Progress;
                }

                self.recv.set(RecvState::header());
                match Envelope::decode(&buffer[..expected]) {
                    Ok(envelope) => ReadStep::Frame(envelope),
                    Err(e) => {
                        warn!("RPC[{}]: bad envelope: {}", sid, e);
                        ReadStep::Fatal
                    }
                }
            }
        }
    }

    fn dispatch(&self, envelope: Envelope) {
        match envelope {
            Envelope::Request { id, name, payload } => self.handle_request(id, &name, &payload),
            Envelope::StreamRequest { id, name, payload } => {
                self.handle_stream_request(id, &name, &payload);
            }
            Envelope::Response { id, payload } => self.handle_response(id, Ok(payload)),
            Envelope::ResponseCancel { id, reason } => self.handle_response(id, Err(reason)),
            Envelope::ResponseFailed { id, error } => self.handle_response(id, Err(error)),
            Envelope::ResponseNotImplemented { id } => {
                self.handle_response(id, Err(NOT_IMPLEMENTED.to_owned()));
            }
        }
    }

    /// Resolve `name` against the bound service.
    fn lookup(&self, name: &str) -> Option<(Rc<dyn Service>, MethodDescriptor)> {
        let service = self.service.borrow().clone();
        let Some(service) = service else {
            warn!("RPC[{}]: no service bound for {:?}", self.session.id(), name);
            return None;
        };
        let method = service.descriptor().find_method_by_name(name).copied();
        match method {
            Some(method) => Some((service, method)),
            None => {
                info!("RPC[{}]: unknown method {:?}", self.session.id(), name);
                None
            }
        }
    }

    fn handle_request(&self, id: u32, name: &str, payload: &[u8]) {
        let sid = self.session.id();
        let Some((service, method)) = self.lookup(name) else {
            self.send_envelope(&Envelope::ResponseNotImplemented { id });
            return;
        };
        if method.is_streaming() {
            warn!("RPC[{}]: REQUEST for streaming method {}", sid, method.name);
            return;
        }

        let mut request = service.new_request(&method);
        if let Err(e) = request.decode_from(payload) {
            warn!("RPC[{}]: cannot decode {} request: {}", sid, method.name, e);
            return;
        }
        let response = service.new_response(&method);

        let stale = self.requests.borrow_mut().remove(&id);
        if stale.is_some() {
            warn!("RPC[{}]: duplicate request id {}", sid, id);
            self.send_envelope(&Envelope::ResponseFailed {
                id,
                error: DUPLICATE_REQUEST.to_owned(),
            });
        }
        let ticket = self.next_ticket.get();
        self.next_ticket.set(ticket.wrapping_add(1));
        self.requests
            .borrow_mut()
            .insert(id, OutstandingRequest { ticket });

        let channel = self.self_ref.clone();
        let call = ServerCall::new(
            RpcController::for_session(Rc::clone(&self.session)),
            request,
            response,
            Box::new(move |controller: RpcController, response: Box<dyn Message>| {
                if let Some(channel) = channel.upgrade() {
                    channel.request_done(id, ticket, &controller, &*response);
                }
            }),
        );
        service.call_method(&method, Invocation::Unary(call));
    }

    fn request_done(&self, id: u32, ticket: u64, controller: &RpcController, response: &dyn Message) {
        let current = self.requests.borrow().get(&id).map(|r| r.ticket);
        if current != Some(ticket) {
            debug!("RPC[{}]: dropping stale completion for {}", self.session.id(), id);
            return;
        }
        self.requests.borrow_mut().remove(&id);

        let envelope = if controller.failed() {
            Envelope::ResponseFailed {
                id,
                error: controller.error_text().to_owned(),
            }
        } else {
            match response.encode() {
                Ok(payload) => Envelope::Response { id, payload },
                Err(e) => {
                    warn!("RPC[{}]: cannot encode response {}: {}", self.session.id(), id, e);
                    Envelope::ResponseFailed {
                        id,
                        error: e.to_string(),
                    }
                }
            }
        };
        self.send_envelope(&envelope);
    }

    fn handle_stream_request(&self, id: u32, name: &str, payload: &[u8]) {
        let sid = self.session.id();
        let Some((service, method)) = self.lookup(name) else {
            return;
        };
        if !method.is_streaming() {
            warn!("RPC[{}]: STREAM_REQUEST {} for unary method {}", sid, id, method.name);
            return;
        }
        let mut request = service.new_request(&method);
        if let Err(e) = request.decode_from(payload) {
            warn!("RPC[{}]: cannot decode {} request: {}", sid, method.name, e);
            return;
        }
        service.call_method(&method, Invocation::Stream(request));
    }

    /// `outcome` is the response payload, or the failure text.
    fn handle_response(&self, id: u32, outcome: core::result::Result<Vec<u8>, String>) {
        let call = self.responses.borrow_mut().remove(&id);
        let Some(mut call) = call else {
            debug!("RPC[{}]: response for unknown id {}", self.session.id(), id);
            return;
        };
        match outcome {
            Ok(payload) => {
                if let Err(e) = call.response.decode_from(&payload) {
                    warn!("RPC[{}]: cannot decode response {}: {}", self.session.id(), id, e);
                    call.controller.set_failed(FAILED_TO_PARSE);
                }
            }
            Err(text) => call.controller.set_failed(text),
        }
        call.complete();
    }

    // ── Outbound ─────────────────────────────────────────────

    /// Start an outbound call.
    ///
    /// Unary methods need a [`ClientCall`]; streaming methods must not have
    /// one. Breaking that rule is logged and reported as
    /// [`Error::Misuse`] without sending anything. Every other failure is
    /// delivered through the call's `done`.
    pub fn call_method(
        &self,
        method: &MethodDescriptor,
        request: &dyn Message,
        call: Option<ClientCall>,
    ) -> Result<()> {
        let sid = self.session.id();
        match (method.is_streaming(), call) {
            (true, Some(_)) => {
                error!("RPC[{}]: streaming method {} given a reply slot", sid, method.name);
                Err(Error::Misuse("streaming calls take no controller, response or done"))
            }
            (false, None) => {
                error!("RPC[{}]: unary method {} called without a reply slot", sid, method.name);
                Err(Error::Misuse("unary calls need a controller, response and done"))
            }
            (true, None) => {
                let id = self.sequence.borrow_mut().next_id();
                match request.encode() {
                    Ok(payload) => {
                        self.send_envelope(&Envelope::StreamRequest {
                            id,
                            name: method.name.to_owned(),
                            payload,
                        });
                    }
                    Err(e) => warn!("RPC[{}]: cannot encode {} request: {}", sid, method.name, e),
                }
                Ok(())
            }
            (false, Some(call)) => {
                let id = self.sequence.borrow_mut().next_id();
                let sent = match request.encode() {
                    Ok(payload) => self.send_envelope(&Envelope::Request {
                        id,
                        name: method.name.to_owned(),
                        payload,
                    }),
                    Err(e) => {
                        warn!("RPC[{}]: cannot encode {} request: {}", sid, method.name, e);
                        false
                    }
                };
                if !sent {
                    call.fail(FAILED_TO_SEND);
                    return Ok(());
                }

                let evicted = self.responses.borrow_mut().remove(&id);
                if let Some(evicted) = evicted {
                    warn!("RPC[{}]: id {} reused while still pending", sid, id);
                    evicted.fail(DUPLICATE_REQUEST);
                }
                self.responses.borrow_mut().insert(id, call);
                Ok(())
            }
        }
    }

    /// Typed unary call: `done` receives the decoded `R`.
    pub fn call<R, F>(&self, method: &MethodDescriptor, request: &dyn Message, done: F) -> Result<()>
    where
        R: Message + Default,
        F: FnOnce(RpcController, R) + 'static,
    {
        let call = ClientCall::new(Box::new(R::default()), move |controller, response| {
            let response = response.downcast::<R>().map(|r| *r).unwrap_or_default();
            done(controller, response);
        });
        self.call_method(method, request, Some(call))
    }

    /// Fire-and-forget call of a streaming method.
    pub fn stream(&self, method: &MethodDescriptor, request: &dyn Message) -> Result<()> {
        self.call_method(method, request, None)
    }

    /// Frame and write one envelope. Returns whether it was fully written.
    fn send_envelope(&self, envelope: &Envelope) -> bool {
        let sid = self.session.id();
        let frame = match envelope
            .encode()
            .map_err(Error::from)
            .and_then(|body| encode_frame(&body, self.config.max_buffer_size))
        {
            Ok(frame) => frame,
            Err(e) => {
                warn!("RPC[{}]: not sending {:?} {}: {}", sid, envelope.kind(), envelope.id(), e);
                return false;
            }
        };

        let written = {
            let mut slot = self.transport.borrow_mut();
            let Some(transport) = slot.as_mut() else {
                debug!("RPC[{}]: send on closed channel", sid);
                return false;
            };
            transport.write(&frame)
        };
        match written {
            Ok(n) if n == frame.len() => true,
            Ok(n) => {
                warn!("RPC[{}]: short write, {} of {} bytes", sid, n, frame.len());
                self.send_failed();
                false
            }
            Err(e) => {
                warn!("RPC[{}]: write failed: {:?}", sid, e);
                self.send_failed();
                false
            }
        }
    }

    fn send_failed(&self) {
        self.errors.set(self.errors.get().saturating_add(1));
        self.shutdown();
    }
}

impl<T: Transport> Drop for RpcChannel<T> {
    fn drop(&mut self) {
        if let Some(mut transport) = self.transport.get_mut().take() {
            transport.close();
        }
    }
}
