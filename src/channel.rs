// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! One logical RPC and bulk-transfer channel to a remote VPU service.
//!
//! All request issuance serializes through a single submission lock, so
//! requests and their payloads reach the peer in issue order and at most one
//! synchronous call is ever outstanding. The dispatch thread (see
//! [`crate::dispatch`]) resolves pending calls and buffer completions without
//! ever taking the submission lock, so it cannot deadlock against
//! submitters.

use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::error;
use log::warn;
use serde::Deserialize;
use serde::Serialize;
use zerocopy::Immutable;
use zerocopy::IntoBytes;

use crate::dispatch;
use crate::error::Error;
use crate::error::Result;
use crate::port::PortTable;
use crate::protocol::SimpleMsg;
use crate::protocol::AUDIO_MAX_PACKET;
use crate::protocol::MIN_CHUNKED_PEER_VERSION;
use crate::protocol::MSG_TYPE_OPEN;
use crate::sync::Condvar;
use crate::sync::Mutex;
use crate::transport::ServiceConnector;
use crate::transport::ServiceId;
use crate::transport::Transport;

/// How long a synchronous call waits for its RESULT before giving up.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-channel tuning, fixed at open time.
#[derive(Copy, Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChannelOptions {
    /// Always use the zero-copy bulk path, even when the peer is new enough
    /// to reassemble inline chunks.
    pub force_bulk: bool,
}

/// Callbacks a channel owner receives from the dispatch thread.
///
/// Implementations must not issue synchronous calls on the same channel from
/// within a callback; the dispatch thread would be waiting on itself.
pub trait ChannelEvents: Send + Sync {
    /// Audio fast path: the remote side consumed `count` more bytes of
    /// playback data announced by an earlier WRITE.
    fn on_playback_advance(&self, count: u32) {
        let _ = count;
    }
}

/// The at-most-one outstanding synchronous call per channel.
///
/// Only the thread holding the submission lock arms the slot; the dispatch
/// thread resolves it. The `armed` flag makes a RESULT that arrives after
/// its waiter timed out ignorable instead of leaking into the next call.
pub(crate) struct PendingCall {
    state: Mutex<PendingState>,
    resolved: Condvar,
}

#[derive(Default)]
struct PendingState {
    armed: bool,
    result: Option<u32>,
}

impl PendingCall {
    fn new() -> PendingCall {
        PendingCall {
            state: Mutex::new(PendingState::default()),
            resolved: Condvar::new(),
        }
    }

    fn arm(&self) {
        let mut state = self.state.lock();
        state.armed = true;
        state.result = None;
    }

    fn wait(&self, timeout: Duration) -> Result<()> {
        let (mut state, _) = self
            .resolved
            .wait_timeout_while(self.state.lock(), timeout, |s| s.result.is_none());
        match state.result.take() {
            None => {
                // Timed out. Disarm so a late RESULT is discarded instead of
                // being attributed to a later call.
                state.armed = false;
                Err(Error::CallTimeout(timeout))
            }
            Some(0) => Ok(()),
            Some(status) => Err(Error::RemoteStatus(status)),
        }
    }

    /// Called from the dispatch thread for every incoming RESULT.
    pub(crate) fn resolve(&self, status: u32) {
        let mut state = self.state.lock();
        if !state.armed {
            warn!("discarding RESULT (status {}) with no call waiting", status);
            return;
        }
        state.armed = false;
        state.result = Some(status);
        self.resolved.notify_all();
    }
}

/// State shared between the channel owner and the dispatch thread.
pub(crate) struct ChannelInner {
    pub(crate) transport: Box<dyn Transport>,
    /// Serializes every transport-touching operation issued by producers.
    submission: Mutex<()>,
    pub(crate) pending: PendingCall,
    pub(crate) ports: PortTable,
    pub(crate) events: Arc<dyn ChannelEvents>,
    /// Sticky protocol-violation flag; set by dispatch, checked by
    /// submitters.
    faulted: AtomicBool,
    /// Negotiated inline chunk bound; zero selects the bulk path. Written
    /// once during open.
    max_packet: AtomicU32,
    next_handle: AtomicU64,
}

/// Keeps the service marked in use for the duration of a transport-touching
/// section, releasing on every exit path.
struct ServiceUseGuard<'a>(&'a dyn Transport);

impl<'a> ServiceUseGuard<'a> {
    fn acquire(transport: &'a dyn Transport) -> ServiceUseGuard<'a> {
        transport.service_use();
        ServiceUseGuard(transport)
    }
}

impl Drop for ServiceUseGuard<'_> {
    fn drop(&mut self) {
        self.0.service_release();
    }
}

impl ChannelInner {
    fn check_faulted(&self) -> Result<()> {
        if self.faulted.load(Ordering::Acquire) {
            return Err(Error::ChannelFaulted);
        }
        Ok(())
    }

    pub(crate) fn fault(&self) {
        self.faulted.store(true, Ordering::Release);
    }

    pub(crate) fn max_packet(&self) -> u32 {
        self.max_packet.load(Ordering::Relaxed)
    }

    pub(crate) fn next_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn call<M: IntoBytes + Immutable>(
        &self,
        msg: &M,
        wait: bool,
        timeout: Duration,
    ) -> Result<()> {
        self.check_faulted()?;
        let _submission = self.submission.lock();
        let _in_use = ServiceUseGuard::acquire(&*self.transport);
        if wait {
            self.pending.arm();
        }
        self.transport
            .send_message(msg.as_bytes())
            .map_err(Error::TransportSend)?;
        if wait {
            self.pending.wait(timeout)
        } else {
            Ok(())
        }
    }

    /// Sends a request record immediately followed by its payload, both
    /// under the one submission lock so the peer sees them back to back and
    /// attributes the payload to the announcement.
    pub(crate) fn send_with_payload<M: IntoBytes + Immutable>(
        &self,
        msg: &M,
        payload: &[u8],
    ) -> Result<()> {
        self.check_faulted()?;
        let _submission = self.submission.lock();
        let _in_use = ServiceUseGuard::acquire(&*self.transport);
        self.transport
            .send_message(msg.as_bytes())
            .map_err(Error::TransportSend)?;
        let max_packet = self.max_packet();
        if max_packet == 0 {
            self.transport
                .bulk_transmit(payload)
                .map_err(Error::BulkTransfer)
        } else {
            // In-order delivery lets the peer reassemble by byte count
            // alone. A failed middle chunk is not rolled back; the peer
            // already has the byte-count announcement and reports the
            // missing tail itself.
            for chunk in payload.chunks(max_packet as usize) {
                self.transport
                    .send_message(chunk)
                    .map_err(Error::TransportSend)?;
            }
            Ok(())
        }
    }

    /// Sends a bare request record under the lock, without arming a wait.
    pub(crate) fn send_message<M: IntoBytes + Immutable>(&self, msg: &M) -> Result<()> {
        self.check_faulted()?;
        let _submission = self.submission.lock();
        let _in_use = ServiceUseGuard::acquire(&*self.transport);
        self.transport
            .send_message(msg.as_bytes())
            .map_err(Error::TransportSend)
    }
}

/// One open channel to a remote service. Dropping the channel tears the
/// connection down; quiesce in-flight work first (see
/// [`Channel::disable_port`]).
pub struct Channel {
    pub(crate) inner: Arc<ChannelInner>,
    dispatch: Option<thread::JoinHandle<()>>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel").finish_non_exhaustive()
    }
}

impl Channel {
    /// Connects to `service`, spawns the completion-dispatch thread, sends
    /// the protocol OPEN, and fixes the transfer policy from the negotiated
    /// peer version.
    ///
    /// A connect failure is terminal; there is no retry.
    pub fn open(
        connector: &dyn ServiceConnector,
        service: ServiceId,
        options: ChannelOptions,
        events: Arc<dyn ChannelEvents>,
    ) -> Result<Channel> {
        let transport = connector
            .connect(service)
            .map_err(|e| Error::Connect(service, e))?;
        let inner = Arc::new(ChannelInner {
            transport,
            submission: Mutex::new(()),
            pending: PendingCall::new(),
            ports: PortTable::new(),
            events,
            faulted: AtomicBool::new(false),
            max_packet: AtomicU32::new(0),
            next_handle: AtomicU64::new(1),
        });
        let dispatch_inner = inner.clone();
        let dispatch = thread::Builder::new()
            .name("vpu_dispatch".to_string())
            .spawn(move || dispatch::run(&dispatch_inner))
            .map_err(Error::SpawnDispatch)?;
        let mut channel = Channel {
            inner,
            dispatch: Some(dispatch),
        };

        if let Err(e) = channel
            .inner
            .call(&SimpleMsg::new(MSG_TYPE_OPEN), false, CALL_TIMEOUT)
        {
            let _ = channel.shutdown();
            return Err(e);
        }

        let peer_version = {
            let _submission = channel.inner.submission.lock();
            let _in_use = ServiceUseGuard::acquire(&*channel.inner.transport);
            channel.inner.transport.peer_version()
        };
        let max_packet = if peer_version < MIN_CHUNKED_PEER_VERSION || options.force_bulk {
            0
        } else {
            AUDIO_MAX_PACKET
        };
        channel
            .inner
            .max_packet
            .store(max_packet, Ordering::Relaxed);

        Ok(channel)
    }

    /// Sends `msg`, optionally blocking until the correlated RESULT arrives
    /// or [`CALL_TIMEOUT`] elapses. A timeout fails this call only; it does
    /// not tear the channel down.
    pub fn call<M: IntoBytes + Immutable>(&self, msg: &M, wait: bool) -> Result<()> {
        self.inner.call(msg, wait, CALL_TIMEOUT)
    }

    /// Sends `msg` and its payload back to back on the negotiated bulk or
    /// chunked path. Completion of the payload is reported asynchronously
    /// (COMPLETE for audio writes, BUFFER_RETURN for port submissions).
    pub fn send_with_payload<M: IntoBytes + Immutable>(
        &self,
        msg: &M,
        payload: &[u8],
    ) -> Result<()> {
        self.inner.send_with_payload(msg, payload)
    }

    pub(crate) fn max_packet(&self) -> u32 {
        self.inner.max_packet()
    }

    /// Closes the transport and joins the dispatch thread. Safe only once
    /// outstanding work has been quiesced.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        let mut result = Ok(());
        if let Some(handle) = self.dispatch.take() {
            if let Err(e) = self.inner.transport.close() {
                result = Err(Error::TransportClose(e));
            }
            if handle.join().is_err() {
                error!("dispatch thread panicked during shutdown");
            }
        }
        result
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if self.dispatch.is_some() {
            if let Err(e) = self.shutdown() {
                warn!("channel teardown failed: {:#}", e);
            }
        }
    }
}
