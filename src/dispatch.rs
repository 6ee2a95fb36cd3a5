// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The completion-dispatch loop.
//!
//! Runs on its own thread, draining incoming messages from the transport and
//! classifying them. It runs concurrently with submitting threads and never
//! takes the channel's submission lock: it only touches the pending-call
//! slot and the port table, each of which carries its own narrower lock. A
//! malformed or unexpected message is logged and dropped; nothing the peer
//! sends may take this loop down.

use log::debug;
use log::error;
use log::warn;

use crate::buffer::BufferStatus;
use crate::channel::ChannelInner;
use crate::port::FrameGeometry;
use crate::port::PortId;
use crate::protocol::decode_peer_message;
use crate::protocol::BufferReturnMsg;
use crate::protocol::CompleteMsg;
use crate::protocol::FormatChangedMsg;
use crate::protocol::PeerMessage;

pub(crate) fn run(inner: &ChannelInner) {
    loop {
        let bytes = match inner.transport.recv_message() {
            Ok(Some(bytes)) => bytes,
            Ok(None) => break,
            Err(e) => {
                error!("receive failed, stopping dispatch: {}", e);
                break;
            }
        };
        match decode_peer_message(&bytes) {
            Ok(message) => handle_message(inner, message),
            Err(e) => warn!("dropping bad message from peer: {}", e),
        }
    }
    debug!("dispatch loop exiting");
}

fn handle_message(inner: &ChannelInner, message: PeerMessage) {
    match message {
        PeerMessage::Result(m) => inner.pending.resolve(m.status.get()),
        PeerMessage::Complete(m) => handle_complete(inner, m),
        PeerMessage::BufferReturn(m) => handle_buffer_return(inner, m),
        PeerMessage::FormatChanged(m) => handle_format_changed(inner, m),
    }
}

fn handle_complete(inner: &ChannelInner, m: CompleteMsg) {
    if !m.cookies_valid() {
        // The peer acknowledged a write we cannot attribute. Letting this
        // stand would leave that write unacknowledged forever, so the whole
        // channel is declared broken.
        error!(
            "COMPLETE with invalid cookies {:#010x}/{:#010x}, faulting channel",
            m.cookie1.get(),
            m.cookie2.get()
        );
        inner.fault();
        return;
    }
    inner.events.on_playback_advance(m.count.get());
}

fn handle_buffer_return(inner: &ChannelInner, m: BufferReturnMsg) {
    let port = PortId(m.port.get());
    let handle = m.handle.get();
    let status = if m.status.get() == 0 {
        BufferStatus::Done
    } else {
        BufferStatus::Error
    };
    match inner.ports.complete(port, handle, m.length.get(), m.flags.get()) {
        Some((listener, buffer)) => listener.on_buffer_done(port, status, buffer),
        None => warn!(
            "buffer return for unknown handle {} on {:?}",
            handle, port
        ),
    }
}

fn handle_format_changed(inner: &ChannelInner, m: FormatChangedMsg) {
    let port = PortId(m.port.get());
    let geometry = FrameGeometry {
        width: m.width.get(),
        height: m.height.get(),
        stride: m.stride.get(),
        buffer_size: m.buffer_size.get(),
    };
    match inner.ports.listener(port) {
        Some(listener) => listener.on_format_changed(port, geometry),
        None => warn!("format change on unknown {:?}", port),
    }
}
