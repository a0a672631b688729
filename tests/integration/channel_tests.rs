//! Channel behaviour over a loopback pair: correlation, failures,
//! streaming, fragmentation and teardown.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use duplexrpc::config::{ChannelConfig, MAX_BUFFER_SIZE};
use duplexrpc::rpc::channel::{DUPLICATE_REQUEST, FAILED_TO_SEND, NOT_IMPLEMENTED};
use duplexrpc::rpc::codec::{FrameHeader, encode_header};
use duplexrpc::rpc::envelope::Envelope;
use duplexrpc::rpc::{
    LoopbackTransport, Message, MethodDescriptor, MethodTable, RpcChannel, RpcSession, Transport,
};

use crate::support::{
    ECHO, EchoReply, EchoRequest, FAIL, HOLD, Link, NOTE, Note, Outcomes, Recorder, WHOAMI, capture,
    frame, read_frames, test_service,
};

fn echo(data: &[u8]) -> EchoRequest {
    EchoRequest {
        data: data.to_vec(),
    }
}

// ── Unary calls ───────────────────────────────────────────────

#[test]
fn echo_response_matches_request() {
    let link = Link::new();
    let out: Outcomes<EchoReply> = Outcomes::default();

    link.client
        .call(&ECHO, &echo(b"hello, world"), capture(&out))
        .unwrap();
    assert!(link.client.pending_rpcs());
    link.pump();

    let out = out.borrow();
    assert_eq!(out.len(), 1);
    assert!(!out[0].failed);
    assert_eq!(out[0].reply.data, b"hello, world");
    assert!(!link.client.pending_rpcs());
    assert_eq!(link.server.outstanding_requests(), 0);
}

#[test]
fn handler_failure_reaches_caller() {
    let link = Link::new();
    let out: Outcomes<EchoReply> = Outcomes::default();

    link.client.call(&FAIL, &echo(b"x"), capture(&out)).unwrap();
    link.pump();

    let out = out.borrow();
    assert_eq!(out.len(), 1);
    assert!(out[0].failed);
    assert_eq!(out[0].error, "boom");
    assert!(link.server.is_connected(), "application failure keeps the link");
}

#[test]
fn unknown_method_is_not_implemented() {
    let link = Link::new();
    let out: Outcomes<EchoReply> = Outcomes::default();

    link.client
        .call(&MethodDescriptor::unary("Missing"), &echo(b""), capture(&out))
        .unwrap();
    link.pump();

    let out = out.borrow();
    assert_eq!(out.len(), 1);
    assert!(out[0].failed);
    assert_eq!(out[0].error, NOT_IMPLEMENTED);
}

#[test]
fn no_bound_service_is_not_implemented() {
    let link = Link::new();
    link.server.set_service(None);
    let out: Outcomes<EchoReply> = Outcomes::default();

    link.client.call(&ECHO, &echo(b"x"), capture(&out)).unwrap();
    link.pump();
    assert_eq!(out.borrow()[0].error, NOT_IMPLEMENTED);
}

#[test]
fn responses_complete_in_any_order() {
    let link = Link::new();
    let out: Outcomes<EchoReply> = Outcomes::default();

    for payload in [b"first".as_slice(), b"second", b"third"] {
        link.client.call(&HOLD, &echo(payload), capture(&out)).unwrap();
    }
    link.pump();
    assert_eq!(link.recorder.parked.borrow().len(), 3);
    assert_eq!(link.server.outstanding_requests(), 3);

    link.recorder.finish_parked(2);
    link.recorder.finish_parked(0);
    link.recorder.finish_parked(0);
    link.pump();

    let replies: Vec<_> = out.borrow().iter().map(|o| o.reply.data.clone()).collect();
    assert_eq!(replies, vec![b"third".to_vec(), b"first".to_vec(), b"second".to_vec()]);
    assert!(!link.client.pending_rpcs());
}

#[test]
fn server_controller_carries_session() {
    let (c, s) = LoopbackTransport::pair();
    let recorder = Rc::default();
    let server = RpcChannel::with_session(s, Rc::new(RpcSession::new(42)), ChannelConfig::default());
    server.set_service(Some(Rc::new(test_service(&recorder))));
    let client = RpcChannel::new(c, ChannelConfig::default());

    let out: Outcomes<u64> = Outcomes::default();
    client.call(&WHOAMI, &(), capture(&out)).unwrap();
    server.descriptor_ready();
    client.descriptor_ready();

    assert_eq!(out.borrow()[0].reply, 42);
}

#[test]
fn both_sides_call_and_serve_at_once() {
    let link = Link::new();
    let client_side = Rc::new(crate::support::Recorder::default());
    link.client
        .set_service(Some(Rc::new(test_service(&client_side))));

    let to_server: Outcomes<EchoReply> = Outcomes::default();
    let to_client: Outcomes<EchoReply> = Outcomes::default();
    link.client
        .call(&ECHO, &echo(b"c->s"), capture(&to_server))
        .unwrap();
    link.server
        .call(&ECHO, &echo(b"s->c"), capture(&to_client))
        .unwrap();
    link.pump();

    assert_eq!(to_server.borrow()[0].reply.data, b"c->s");
    assert_eq!(to_client.borrow()[0].reply.data, b"s->c");
}

// ── Streaming ─────────────────────────────────────────────────

#[test]
fn streaming_call_runs_handler_without_reply() {
    let link = Link::new();
    link.client
        .stream(
            &NOTE,
            &Note {
                text: "fire and forget".into(),
            },
        )
        .unwrap();
    assert!(!link.client.pending_rpcs());
    link.pump();

    assert_eq!(*link.recorder.notes.borrow(), vec!["fire and forget"]);
    assert_eq!(link.server.outstanding_requests(), 0);
}

#[test]
fn stream_request_for_unary_method_is_dropped() {
    let (mut peer, s) = LoopbackTransport::pair();
    let link_rec = Rc::default();
    let server = RpcChannel::new(s, ChannelConfig::default());
    server.set_service(Some(Rc::new(test_service(&link_rec))));

    peer.write(&frame(&Envelope::StreamRequest {
        id: 1,
        name: "Echo".into(),
        payload: echo(b"x").encode().unwrap(),
    }))
    .unwrap();
    server.descriptor_ready();

    assert_eq!(*link_rec.dispatched.borrow(), 0);
    assert!(read_frames(&mut peer).is_empty());
    assert!(server.is_connected());
}

#[test]
fn stream_request_for_unknown_method_is_dropped() {
    let (mut peer, s) = LoopbackTransport::pair();
    let link_rec: Rc<Recorder> = Rc::default();
    let server = RpcChannel::new(s, ChannelConfig::default());
    server.set_service(Some(Rc::new(test_service(&link_rec))));

    peer.write(&frame(&Envelope::StreamRequest {
        id: 1,
        name: "Nope".into(),
        payload: Note { text: "lost".into() }.encode().unwrap(),
    }))
    .unwrap();
    server.descriptor_ready();

    assert_eq!(peer.pending(), 0);
    assert!(link_rec.notes.borrow().is_empty());
    assert!(server.is_connected());
}

// ── Receive path ──────────────────────────────────────────────

#[test]
fn one_byte_reads_reassemble_frames() {
    let link = Link::with(
        |client, server| {
            client.set_read_limit(1);
            server.set_read_limit(1);
        },
        ChannelConfig::default(),
    );
    let out: Outcomes<EchoReply> = Outcomes::default();

    link.client
        .call(&ECHO, &echo(&[7; 300]), capture(&out))
        .unwrap();
    link.pump();

    assert_eq!(*link.recorder.dispatched.borrow(), 1);
    assert_eq!(out.borrow().len(), 1);
    assert_eq!(out.borrow()[0].reply.data, vec![7; 300]);
}

#[test]
fn frames_split_across_notifications() {
    let (mut peer, s) = LoopbackTransport::pair();
    let recorder = Rc::default();
    let server = RpcChannel::new(s, ChannelConfig::default());
    server.set_service(Some(Rc::new(test_service(&recorder))));

    let bytes = frame(&Envelope::StreamRequest {
        id: 0,
        name: "Note".into(),
        payload: Note { text: "split".into() }.encode().unwrap(),
    });
    for chunk in bytes.chunks(3) {
        assert!(recorder.notes.borrow().is_empty());
        peer.write(chunk).unwrap();
        server.descriptor_ready();
    }
    assert_eq!(*recorder.notes.borrow(), vec!["split"]);
}

#[test]
fn oversized_frame_closes_the_connection() {
    let (mut peer, s) = LoopbackTransport::pair();
    let recorder: Rc<crate::support::Recorder> = Rc::default();
    let server = RpcChannel::new(s, ChannelConfig::default());
    server.set_service(Some(Rc::new(test_service(&recorder))));
    let closed = Rc::new(Cell::new(false));
    let c = closed.clone();
    server.set_close_handler(move |_| c.set(true));

    let header = FrameHeader::new(MAX_BUFFER_SIZE as u32 + 1).to_bytes();
    peer.write(&header).unwrap();
    peer.write(&[0; 64]).unwrap();
    server.descriptor_ready();

    assert!(closed.get());
    assert!(!server.is_connected());
    assert!(peer.is_link_closed());
    assert_eq!(*recorder.dispatched.borrow(), 0);
}

#[test]
fn undecodable_envelope_closes_the_connection() {
    let (mut peer, s) = LoopbackTransport::pair();
    let server = RpcChannel::new(s, ChannelConfig::default());
    let closed = Rc::new(Cell::new(0));
    let c = closed.clone();
    server.set_close_handler(move |_| c.set(c.get() + 1));

    peer.write(&FrameHeader::new(3).to_bytes()).unwrap();
    peer.write(&[0xFF, 0xFF, 0xFF]).unwrap();
    server.descriptor_ready();
    server.descriptor_ready();

    assert_eq!(closed.get(), 1);
    assert!(!server.is_connected());
}

#[test]
fn empty_frames_are_skipped() {
    let (mut peer, s) = LoopbackTransport::pair();
    let recorder = Rc::default();
    let server = RpcChannel::new(s, ChannelConfig::default());
    server.set_service(Some(Rc::new(test_service(&recorder))));

    peer.write(&FrameHeader::new(0).to_bytes()).unwrap();
    peer.write(&frame(&Envelope::StreamRequest {
        id: 0,
        name: "Note".into(),
        payload: Note { text: "after".into() }.encode().unwrap(),
    }))
    .unwrap();
    server.descriptor_ready();

    assert_eq!(*recorder.notes.borrow(), vec!["after"]);
    assert!(server.is_connected());
}

#[test]
fn version_mismatch_is_tolerated_by_default() {
    let (mut peer, s) = LoopbackTransport::pair();
    let server = RpcChannel::new(s, ChannelConfig::default());

    peer.write(&encode_header(2, 5).to_be_bytes()).unwrap();
    server.descriptor_ready();
    assert!(server.is_connected());
}

#[test]
fn version_mismatch_can_close() {
    let (mut peer, s) = LoopbackTransport::pair();
    let config = ChannelConfig {
        close_on_version_mismatch: true,
        ..ChannelConfig::default()
    };
    let server = RpcChannel::new(s, config);

    peer.write(&encode_header(2, 5).to_be_bytes()).unwrap();
    server.descriptor_ready();
    assert!(!server.is_connected());
}

#[test]
fn undecodable_request_payload_is_dropped() {
    let (mut peer, s) = LoopbackTransport::pair();
    let recorder = Rc::default();
    let server = RpcChannel::new(s, ChannelConfig::default());
    server.set_service(Some(Rc::new(test_service(&recorder))));

    // Length prefix promises more bytes than follow.
    peer.write(&frame(&Envelope::Request {
        id: 9,
        name: "Echo".into(),
        payload: vec![0x7F],
    }))
    .unwrap();
    server.descriptor_ready();

    assert_eq!(*recorder.dispatched.borrow(), 0);
    assert!(read_frames(&mut peer).is_empty(), "no reply is sent");
    assert!(server.is_connected());
    assert_eq!(server.outstanding_requests(), 0);
}

#[test]
fn response_for_unknown_id_is_ignored() {
    let (mut peer, c) = LoopbackTransport::pair();
    let client = RpcChannel::new(c, ChannelConfig::default());

    peer.write(&frame(&Envelope::ResponseFailed {
        id: 77,
        error: "late".into(),
    }))
    .unwrap();
    client.descriptor_ready();
    assert!(client.is_connected());
}

#[test]
fn cancel_surfaces_as_failure() {
    let (mut peer, c) = LoopbackTransport::pair();
    let client = RpcChannel::new(c, ChannelConfig::default());
    let out: Outcomes<EchoReply> = Outcomes::default();

    client.call(&ECHO, &echo(b"x"), capture(&out)).unwrap();
    let sent = read_frames(&mut peer);
    let id = sent[0].id();
    peer.write(&frame(&Envelope::ResponseCancel {
        id,
        reason: "shutting down".into(),
    }))
    .unwrap();
    client.descriptor_ready();

    assert!(out.borrow()[0].failed);
    assert_eq!(out.borrow()[0].error, "shutting down");
}

#[test]
fn duplicate_inbound_id_notifies_the_older_request() {
    let (mut peer, s) = LoopbackTransport::pair();
    let recorder: Rc<crate::support::Recorder> = Rc::default();
    let server = RpcChannel::new(s, ChannelConfig::default());
    server.set_service(Some(Rc::new(test_service(&recorder))));

    for data in [b"old".as_slice(), b"new"] {
        peer.write(&frame(&Envelope::Request {
            id: 5,
            name: "Hold".into(),
            payload: echo(data).encode().unwrap(),
        }))
        .unwrap();
    }
    server.descriptor_ready();

    assert_eq!(
        read_frames(&mut peer),
        vec![Envelope::ResponseFailed {
            id: 5,
            error: DUPLICATE_REQUEST.into()
        }]
    );
    assert_eq!(server.outstanding_requests(), 1);
}

// ── Send path and teardown ────────────────────────────────────

#[test]
fn short_write_fails_call_and_closes() {
    let link = Link::with(|client, _| client.set_write_limit(3), ChannelConfig::default());
    let closed = Rc::new(Cell::new(0));
    let c = closed.clone();
    link.client.set_close_handler(move |_| c.set(c.get() + 1));
    let out: Outcomes<EchoReply> = Outcomes::default();

    link.client.call(&ECHO, &echo(b"too long"), capture(&out)).unwrap();

    assert_eq!(out.borrow().len(), 1, "done runs synchronously");
    assert_eq!(out.borrow()[0].error, FAILED_TO_SEND);
    assert_eq!(link.client.error_count(), 1);
    assert_eq!(closed.get(), 1);
    assert!(!link.client.pending_rpcs());
    assert!(!link.client.is_connected());

    link.client.call(&ECHO, &echo(b"again"), capture(&out)).unwrap();
    assert_eq!(out.borrow()[1].error, FAILED_TO_SEND);
    assert_eq!(closed.get(), 1, "close handler fires once");
}

#[test]
fn oversized_request_is_not_sent() {
    let config = ChannelConfig {
        initial_buffer_size: 16,
        max_buffer_size: 32,
        close_on_version_mismatch: false,
    };
    let link = Link::with(|_, _| {}, config);
    let out: Outcomes<EchoReply> = Outcomes::default();

    link.client.call(&ECHO, &echo(&[0; 64]), capture(&out)).unwrap();
    assert_eq!(out.borrow()[0].error, FAILED_TO_SEND);
    assert!(link.client.is_connected(), "refusing to send is not fatal");
    assert_eq!(link.client.error_count(), 0);
}

#[test]
fn pending_calls_are_dropped_on_close() {
    let link = Link::new();
    let out: Outcomes<EchoReply> = Outcomes::default();

    link.client.call(&HOLD, &echo(b"x"), capture(&out)).unwrap();
    link.pump();
    link.client.close();
    link.recorder.finish_parked(0);
    link.pump();

    assert!(out.borrow().is_empty(), "done never runs after close");
    assert!(link.client.pending_rpcs());
}

#[test]
fn peer_close_fires_close_handler_with_session() {
    let (c, mut s) = LoopbackTransport::pair();
    let client = RpcChannel::with_session(c, Rc::new(RpcSession::new(3)), ChannelConfig::default());
    let seen = Rc::new(RefCell::new(None));
    let s2 = seen.clone();
    client.set_close_handler(move |session| *s2.borrow_mut() = Some(session.id()));

    s.close();
    client.descriptor_ready();
    assert_eq!(*seen.borrow(), Some(3));
}

#[test]
fn reentrant_call_from_close_handler_is_harmless() {
    let link = Link::with(|client, _| client.set_write_limit(1), ChannelConfig::default());
    let out: Outcomes<EchoReply> = Outcomes::default();

    let weak = Rc::downgrade(&link.client);
    let inner = out.clone();
    link.client.set_close_handler(move |_| {
        if let Some(channel) = weak.upgrade() {
            channel
                .call(&ECHO, &echo(b"from handler"), crate::support::capture(&inner))
                .unwrap();
        }
    });
    link.client.call(&ECHO, &echo(b"trigger"), capture(&out)).unwrap();

    let errors: Vec<_> = out.borrow().iter().map(|o| o.error.clone()).collect();
    assert_eq!(errors, vec![FAILED_TO_SEND, FAILED_TO_SEND]);
}

#[test]
fn done_may_issue_another_call() {
    let link = Link::new();
    let out: Outcomes<EchoReply> = Outcomes::default();

    let weak = Rc::downgrade(&link.client);
    let chained = out.clone();
    link.client
        .call(&ECHO, &echo(b"one"), move |_, reply: EchoReply| {
            assert_eq!(reply.data, b"one");
            if let Some(channel) = weak.upgrade() {
                channel
                    .call(&ECHO, &echo(b"two"), crate::support::capture(&chained))
                    .unwrap();
            }
        })
        .unwrap();
    link.pump();

    assert_eq!(out.borrow()[0].reply.data, b"two");
}

#[test]
fn custom_service_table() {
    let (c, s) = LoopbackTransport::pair();
    let server = RpcChannel::new(s, ChannelConfig::default());
    let table = MethodTable::new("Math").unary::<(u32, u32), u32, _>("Add", |mut call| {
        let sum = call.request::<(u32, u32)>().map_or(0, |(a, b)| a + b);
        if let Some(reply) = call.response_mut::<u32>() {
            *reply = sum;
        }
        call.finish();
    });
    server.set_service(Some(Rc::new(table)));
    let client = RpcChannel::new(c, ChannelConfig::default());

    let out: Outcomes<u32> = Outcomes::default();
    client
        .call(&MethodDescriptor::unary("Add"), &(2u32, 40u32), capture(&out))
        .unwrap();
    server.descriptor_ready();
    client.descriptor_ready();
    assert_eq!(out.borrow()[0].reply, 42);
}
