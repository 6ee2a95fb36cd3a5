// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! An in-process stand-in for the VPU side of a channel.
//!
//! [`FakeTransport`] records everything the host sends and plays a
//! cooperative peer: requests that normally elicit a RESULT get one
//! automatically (unless a test withholds it), SUBMIT records are tracked so
//! tests can return their buffers, and arbitrary peer messages can be
//! injected with [`FakeTransport::push_incoming`].

use std::io;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use zerocopy::little_endian::U32;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

use crate::buffer::BufferStatus;
use crate::buffer::TransferBuffer;
use crate::channel::Channel;
use crate::channel::ChannelEvents;
use crate::channel::ChannelOptions;
use crate::port::FrameGeometry;
use crate::port::PortEventListener;
use crate::port::PortId;
use crate::protocol::BufferReturnMsg;
use crate::protocol::CompleteMsg;
use crate::protocol::PortMsg;
use crate::protocol::ResultMsg;
use crate::protocol::SubmitMsg;
use crate::protocol::WriteMsg;
use crate::protocol::AUDIO_MAX_PACKET;
use crate::protocol::MIN_CHUNKED_PEER_VERSION;
use crate::protocol::MSG_TYPE_CLOSE;
use crate::protocol::MSG_TYPE_CONFIG;
use crate::protocol::MSG_TYPE_CONTROL;
use crate::protocol::MSG_TYPE_PORT_DISABLE;
use crate::protocol::MSG_TYPE_PORT_ENABLE;
use crate::protocol::MSG_TYPE_SUBMIT;
use crate::protocol::MSG_TYPE_WRITE;
use crate::protocol::WRITE_COOKIE1;
use crate::protocol::WRITE_COOKIE2;
use crate::sync::Condvar;
use crate::sync::Mutex;
use crate::transport::ServiceConnector;
use crate::transport::ServiceId;
use crate::transport::Transport;
use crate::transport::AUDIO_SERVICE;

/// Routes log output to the test harness; repeat calls are no-ops.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Polls `pred` until it holds or `timeout` elapses.
pub fn wait_until<F: Fn() -> bool>(timeout: Duration, pred: F) -> bool {
    let deadline = Instant::now() + timeout;
    while !pred() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
    true
}

/// One observable transport operation, in issue order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SentOp {
    Message(Vec<u8>),
    Bulk(Vec<u8>),
}

enum Incoming {
    Msg(Vec<u8>),
    Eof,
}

#[derive(Default)]
struct SendState {
    sent: Vec<SentOp>,
    outstanding: Vec<(u32, u64)>,
    /// Raw payload chunks still owed after a chunked-path announcement;
    /// these must not be parsed as records.
    chunks_expected: usize,
}

struct Inner {
    peer_version: u16,
    state: Mutex<SendState>,
    incoming_tx: Mutex<mpsc::Sender<Incoming>>,
    incoming_rx: Mutex<mpsc::Receiver<Incoming>>,
    /// Messages handed to the host but not yet fully processed by its
    /// dispatch loop. A message counts as processed once the loop comes back
    /// for the next one.
    pending: AtomicUsize,
    unacked: AtomicUsize,
    use_depth: AtomicI32,
    withhold_results: AtomicBool,
    flush_on_disable: AtomicBool,
    refuse_connections: AtomicBool,
    result_status: AtomicU32,
}

#[derive(Clone)]
pub struct FakeTransport {
    inner: Arc<Inner>,
}

impl FakeTransport {
    pub fn new(peer_version: u16) -> FakeTransport {
        init_logging();
        let (tx, rx) = mpsc::channel();
        FakeTransport {
            inner: Arc::new(Inner {
                peer_version,
                state: Mutex::new(SendState::default()),
                incoming_tx: Mutex::new(tx),
                incoming_rx: Mutex::new(rx),
                pending: AtomicUsize::new(0),
                unacked: AtomicUsize::new(0),
                use_depth: AtomicI32::new(0),
                withhold_results: AtomicBool::new(false),
                flush_on_disable: AtomicBool::new(false),
                refuse_connections: AtomicBool::new(false),
                result_status: AtomicU32::new(0),
            }),
        }
    }

    pub fn connector(&self) -> FakeConnector {
        FakeConnector(self.clone())
    }

    pub fn refuse_connections(&self) {
        self.inner.refuse_connections.store(true, Ordering::SeqCst);
    }

    /// Status the auto-generated RESULT replies carry.
    pub fn set_result_status(&self, status: u32) {
        self.inner.result_status.store(status, Ordering::SeqCst);
    }

    /// Stops answering requests; waiting calls will time out.
    pub fn withhold_results(&self, withhold: bool) {
        self.inner.withhold_results.store(withhold, Ordering::SeqCst);
    }

    /// Return every outstanding buffer when a PORT_DISABLE arrives, before
    /// acknowledging the disable itself.
    pub fn flush_on_disable(&self, flush: bool) {
        self.inner.flush_on_disable.store(flush, Ordering::SeqCst);
    }

    pub fn sent_ops(&self) -> Vec<SentOp> {
        self.inner.state.lock().sent.clone()
    }

    /// `(port, handle)` of every SUBMIT not yet answered by a BUFFER_RETURN.
    pub fn outstanding(&self) -> Vec<(u32, u64)> {
        self.inner.state.lock().outstanding.clone()
    }

    pub fn use_depth_balanced(&self) -> bool {
        self.inner.use_depth.load(Ordering::SeqCst) == 0
    }

    /// Queues raw bytes for the host's dispatch loop.
    pub fn push_incoming(&self, bytes: Vec<u8>) {
        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        self.inner
            .incoming_tx
            .lock()
            .send(Incoming::Msg(bytes))
            .expect("incoming queue closed");
    }

    /// Blocks until the host's dispatch loop has fully processed every
    /// message queued so far.
    pub fn wait_incoming_drained(&self) {
        let drained = wait_until(Duration::from_secs(5), || {
            self.inner.pending.load(Ordering::SeqCst) == 0
        });
        assert!(drained, "dispatch did not drain the incoming queue");
    }

    /// Acknowledges `count` bytes of a prior WRITE with valid cookies.
    pub fn complete_write(&self, count: u32) {
        self.push_incoming(
            CompleteMsg::new(count, WRITE_COOKIE1, WRITE_COOKIE2)
                .as_bytes()
                .to_vec(),
        );
    }

    /// Returns one submitted buffer to the host.
    pub fn return_buffer(&self, port: u32, handle: u64, status: u32, length: u32, flags: u32) {
        self.inner
            .state
            .lock()
            .outstanding
            .retain(|&(p, h)| (p, h) != (port, handle));
        self.push_incoming(
            BufferReturnMsg::new(port, handle, status, length, flags)
                .as_bytes()
                .to_vec(),
        );
    }

    fn auto_reply(&self) {
        if !self.inner.withhold_results.load(Ordering::SeqCst) {
            let status = self.inner.result_status.load(Ordering::SeqCst);
            self.push_incoming(ResultMsg::new(status).as_bytes().to_vec());
        }
    }

    fn handle_record(&self, bytes: &[u8]) {
        let mut state = self.inner.state.lock();
        state.sent.push(SentOp::Message(bytes.to_vec()));
        if state.chunks_expected > 0 {
            state.chunks_expected -= 1;
            return;
        }
        let Ok((tag, _)) = U32::read_from_prefix(bytes) else {
            return;
        };
        match tag.get() {
            MSG_TYPE_WRITE => {
                if let Ok(msg) = WriteMsg::read_from_bytes(bytes) {
                    let max_packet = msg.max_packet.get();
                    if max_packet != 0 {
                        state.chunks_expected =
                            (msg.count.get() as usize).div_ceil(max_packet as usize);
                    }
                }
            }
            MSG_TYPE_SUBMIT => {
                if let Ok(msg) = SubmitMsg::read_from_bytes(bytes) {
                    state.outstanding.push((msg.port.get(), msg.handle.get()));
                    // An input submission's payload follows as chunks when
                    // chunked transfer was negotiated; a bulk transfer
                    // instead clears the expectation (see bulk_transmit).
                    let length = msg.length.get();
                    if length > 0 && self.inner.peer_version >= MIN_CHUNKED_PEER_VERSION {
                        state.chunks_expected =
                            (length as usize).div_ceil(AUDIO_MAX_PACKET as usize);
                    }
                }
            }
            MSG_TYPE_PORT_DISABLE => {
                if self.inner.flush_on_disable.load(Ordering::SeqCst) {
                    if let Ok(msg) = PortMsg::read_from_bytes(bytes) {
                        let port = msg.port.get();
                        let flushed: Vec<(u32, u64)> = state
                            .outstanding
                            .iter()
                            .copied()
                            .filter(|&(p, _)| p == port)
                            .collect();
                        state.outstanding.retain(|&(p, _)| p != port);
                        drop(state);
                        for (p, h) in flushed {
                            self.push_incoming(
                                BufferReturnMsg::new(p, h, 0, 0, 0).as_bytes().to_vec(),
                            );
                        }
                        self.auto_reply();
                        return;
                    }
                }
                drop(state);
                self.auto_reply();
                return;
            }
            MSG_TYPE_CONFIG | MSG_TYPE_CONTROL | MSG_TYPE_CLOSE | MSG_TYPE_PORT_ENABLE => {
                drop(state);
                self.auto_reply();
                return;
            }
            _ => {}
        }
    }
}

impl Transport for FakeTransport {
    fn send_message(&self, bytes: &[u8]) -> io::Result<()> {
        self.handle_record(bytes);
        Ok(())
    }

    fn bulk_transmit(&self, data: &[u8]) -> io::Result<()> {
        let mut state = self.inner.state.lock();
        state.sent.push(SentOp::Bulk(data.to_vec()));
        // The payload arrived in one transfer after all; no chunks follow.
        state.chunks_expected = 0;
        Ok(())
    }

    fn recv_message(&self) -> io::Result<Option<Vec<u8>>> {
        // The previous message is done with once the loop comes back here.
        let acked = self.inner.unacked.swap(0, Ordering::SeqCst);
        if acked > 0 {
            self.inner.pending.fetch_sub(acked, Ordering::SeqCst);
        }
        match self.inner.incoming_rx.lock().recv() {
            Ok(Incoming::Msg(bytes)) => {
                self.inner.unacked.fetch_add(1, Ordering::SeqCst);
                Ok(Some(bytes))
            }
            Ok(Incoming::Eof) | Err(mpsc::RecvError) => Ok(None),
        }
    }

    fn peer_version(&self) -> u16 {
        self.inner.peer_version
    }

    fn service_use(&self) {
        self.inner.use_depth.fetch_add(1, Ordering::SeqCst);
    }

    fn service_release(&self) {
        self.inner.use_depth.fetch_sub(1, Ordering::SeqCst);
    }

    fn close(&self) -> io::Result<()> {
        self.inner
            .incoming_tx
            .lock()
            .send(Incoming::Eof)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "already closed"))
    }
}

pub struct FakeConnector(FakeTransport);

impl ServiceConnector for FakeConnector {
    fn connect(&self, service: ServiceId) -> io::Result<Box<dyn Transport>> {
        if self.0.inner.refuse_connections.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("service {} unavailable", service),
            ));
        }
        Ok(Box::new(self.0.clone()))
    }
}

pub struct NullEvents;

impl ChannelEvents for NullEvents {}

/// An open channel to the fake peer, with default events.
pub fn fake_channel(peer_version: u16, options: ChannelOptions) -> (Channel, FakeTransport) {
    let fake = FakeTransport::new(peer_version);
    let channel = Channel::open(&fake.connector(), AUDIO_SERVICE, options, Arc::new(NullEvents))
        .expect("open against fake transport failed");
    (channel, fake)
}

#[derive(Default)]
struct ListenerState {
    buffers: Vec<(PortId, BufferStatus, TransferBuffer)>,
    geometry: Option<FrameGeometry>,
}

/// Records every port event it receives; tests wait on it.
pub struct RecordingListener {
    state: Mutex<ListenerState>,
    updated: Condvar,
}

impl RecordingListener {
    pub fn new() -> RecordingListener {
        RecordingListener {
            state: Mutex::new(ListenerState::default()),
            updated: Condvar::new(),
        }
    }

    /// Waits until at least `n` buffers have come back, then takes them.
    pub fn wait_for_buffers(
        &self,
        n: usize,
        timeout: Duration,
    ) -> Vec<(PortId, BufferStatus, TransferBuffer)> {
        let (mut state, _) = self
            .updated
            .wait_timeout_while(self.state.lock(), timeout, |s| s.buffers.len() < n);
        std::mem::take(&mut state.buffers)
    }

    /// Takes whatever buffers have come back so far, without waiting.
    pub fn buffers(&self) -> Vec<(PortId, BufferStatus, TransferBuffer)> {
        std::mem::take(&mut self.state.lock().buffers)
    }

    pub fn wait_for_geometry(&self, timeout: Duration) -> Option<FrameGeometry> {
        let (mut state, _) = self
            .updated
            .wait_timeout_while(self.state.lock(), timeout, |s| s.geometry.is_none());
        state.geometry.take()
    }
}

impl PortEventListener for RecordingListener {
    fn on_buffer_done(&self, port: PortId, status: BufferStatus, buffer: TransferBuffer) {
        self.state.lock().buffers.push((port, status, buffer));
        self.updated.notify_all();
    }

    fn on_format_changed(&self, port: PortId, geometry: FrameGeometry) {
        let _ = port;
        self.state.lock().geometry = Some(geometry);
        self.updated.notify_all();
    }
}
