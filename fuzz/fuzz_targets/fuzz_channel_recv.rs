//! Fuzz target: `RpcChannel::descriptor_ready`
//!
//! Drives arbitrary byte sequences through a channel's receive path, split
//! into reads of a fuzzer-chosen size, with a small service bound so that
//! decoded requests reach dispatch. The channel must never panic, and once
//! it has closed itself it must stay closed.
//!
//! cargo fuzz run fuzz_channel_recv

#![no_main]

use std::rc::Rc;

use duplexrpc::config::ChannelConfig;
use duplexrpc::rpc::{LoopbackTransport, MethodTable, RpcChannel, ServerCall, Transport};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Some((&chunk, data)) = data.split_first() else {
        return;
    };

    let (mut peer, mut end) = LoopbackTransport::pair();
    end.set_read_limit(usize::from(chunk).max(1));

    let service = MethodTable::new("Fuzz")
        .unary::<Vec<u8>, Vec<u8>, _>("Echo", ServerCall::finish)
        .streaming::<String, _>("Note", |_| {});
    let config = ChannelConfig {
        initial_buffer_size: 64,
        max_buffer_size: 4096,
        close_on_version_mismatch: false,
    };
    let channel = RpcChannel::new(end, config);
    channel.set_service(Some(Rc::new(service)));

    for piece in data.chunks(usize::from(chunk).max(1)) {
        if peer.write(piece).is_err() {
            break;
        }
        channel.descriptor_ready();
    }

    let was_open = channel.is_connected();
    channel.descriptor_ready();
    assert!(was_open || !channel.is_connected(), "closed channel reopened");
});
