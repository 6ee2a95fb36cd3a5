// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Directional buffer queues ("ports") on one processing stage of the remote
//! peer.
//!
//! The port table is the side table mapping host-assigned buffer handles
//! back to the in-flight [`TransferBuffer`] and its owner's listener, so the
//! dispatch thread never has to derive an owning object from an embedded
//! field. `buffers_with_remote` accounting is implicit in the table: entries
//! are inserted at submit time and removed only by the dispatch thread (or
//! by the force-complete path when a drain times out).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use log::error;
use log::warn;

use crate::buffer::BufferStatus;
use crate::buffer::TransferBuffer;
use crate::channel::Channel;
use crate::channel::CALL_TIMEOUT;
use crate::error::Error;
use crate::error::Result;
use crate::protocol::PortMsg;
use crate::protocol::SubmitMsg;
use crate::sync::Condvar;
use crate::sync::Mutex;

/// Bound on the wait for in-flight buffers to come back during
/// [`Channel::disable_port`]. Teardown is best effort: when the bound
/// expires the remaining buffers are force-completed with an error state.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Identifies one port of the remote component.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortId(pub u32);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PortDirection {
    /// Host feeds data to the remote side; submissions carry a payload.
    Input,
    /// Remote side fills host buffers; submissions hand over capacity only.
    Output,
}

/// Geometry reported by a FORMAT_CHANGED event.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub buffer_size: u32,
}

/// Capability object handed over at port-enable time; owned by the port for
/// its enabled lifetime and dropped when the port is disabled.
///
/// Callbacks run on the dispatch thread. They must not issue synchronous
/// calls on the owning channel.
pub trait PortEventListener: Send + Sync {
    /// The remote side is done with `buffer`; ownership returns to the
    /// producer here.
    fn on_buffer_done(&self, port: PortId, status: BufferStatus, buffer: TransferBuffer);

    /// The remote side changed the stream geometry on `port`. Completes no
    /// buffer.
    fn on_format_changed(&self, port: PortId, geometry: FrameGeometry) {
        let _ = (port, geometry);
    }
}

/// Error from [`Channel::submit_buffer`]. `buffer` hands the rejected buffer
/// back to the caller; it is `None` only when the buffer was already
/// returned through the listener by a concurrent force-drain.
#[derive(Debug)]
pub struct SubmitError {
    pub error: Error,
    pub buffer: Option<TransferBuffer>,
}

struct PortState {
    direction: PortDirection,
    disabling: bool,
    in_flight: BTreeMap<u64, TransferBuffer>,
    listener: Arc<dyn PortEventListener>,
}

pub(crate) struct PortTable {
    ports: Mutex<BTreeMap<PortId, PortState>>,
    drained: Condvar,
}

impl PortTable {
    pub(crate) fn new() -> PortTable {
        PortTable {
            ports: Mutex::new(BTreeMap::new()),
            drained: Condvar::new(),
        }
    }

    fn register(
        &self,
        port: PortId,
        direction: PortDirection,
        listener: Arc<dyn PortEventListener>,
    ) -> Result<()> {
        let mut ports = self.ports.lock();
        if ports.contains_key(&port) {
            return Err(Error::PortAlreadyEnabled(port));
        }
        ports.insert(
            port,
            PortState {
                direction,
                disabling: false,
                in_flight: BTreeMap::new(),
                listener,
            },
        );
        Ok(())
    }

    fn remove(&self, port: PortId) {
        self.ports.lock().remove(&port);
    }

    fn direction(&self, port: PortId) -> Option<PortDirection> {
        let ports = self.ports.lock();
        let state = ports.get(&port)?;
        if state.disabling {
            return None;
        }
        Some(state.direction)
    }

    fn track(&self, port: PortId, handle: u64, buffer: TransferBuffer) -> Result<()> {
        let mut ports = self.ports.lock();
        match ports.get_mut(&port) {
            Some(state) if !state.disabling => {
                state.in_flight.insert(handle, buffer);
                Ok(())
            }
            _ => Err(Error::PortNotEnabled(port)),
        }
    }

    fn untrack(&self, port: PortId, handle: u64) -> Option<TransferBuffer> {
        self.ports.lock().get_mut(&port)?.in_flight.remove(&handle)
    }

    /// Takes the buffer a completion event refers to, applying the reported
    /// byte count and flags. Runs on the dispatch thread.
    pub(crate) fn complete(
        &self,
        port: PortId,
        handle: u64,
        length: u32,
        flags: u32,
    ) -> Option<(Arc<dyn PortEventListener>, TransferBuffer)> {
        let mut ports = self.ports.lock();
        let state = ports.get_mut(&port)?;
        let mut buffer = state.in_flight.remove(&handle)?;
        buffer.complete(length, flags);
        if state.in_flight.is_empty() {
            self.drained.notify_all();
        }
        Some((state.listener.clone(), buffer))
    }

    pub(crate) fn listener(&self, port: PortId) -> Option<Arc<dyn PortEventListener>> {
        self.ports.lock().get(&port).map(|s| s.listener.clone())
    }

    fn begin_disable(&self, port: PortId) -> Result<()> {
        let mut ports = self.ports.lock();
        match ports.get_mut(&port) {
            Some(state) => {
                state.disabling = true;
                Ok(())
            }
            None => Err(Error::PortNotEnabled(port)),
        }
    }

    /// One bounded wait for all in-flight buffers on `port` to come back.
    /// Returns false on timeout.
    fn wait_drained(&self, port: PortId, timeout: Duration) -> bool {
        let guard = self.ports.lock();
        let (_guard, result) = self.drained.wait_timeout_while(guard, timeout, |ports| {
            ports
                .get(&port)
                .is_some_and(|state| !state.in_flight.is_empty())
        });
        !result.timed_out()
    }

    fn drain_remaining(
        &self,
        port: PortId,
    ) -> Vec<(Arc<dyn PortEventListener>, TransferBuffer)> {
        let mut ports = self.ports.lock();
        let Some(state) = ports.get_mut(&port) else {
            return Vec::new();
        };
        let leftovers = std::mem::take(&mut state.in_flight);
        leftovers
            .into_values()
            .map(|buffer| (state.listener.clone(), buffer))
            .collect()
    }

    pub(crate) fn in_flight_count(&self, port: PortId) -> usize {
        self.ports
            .lock()
            .get(&port)
            .map_or(0, |state| state.in_flight.len())
    }
}

impl Channel {
    /// Enables `port` and installs `listener` for its completion events.
    pub fn enable_port(
        &self,
        port: PortId,
        direction: PortDirection,
        listener: Arc<dyn PortEventListener>,
    ) -> Result<()> {
        self.inner.ports.register(port, direction, listener)?;
        if let Err(e) = self.inner.call(&PortMsg::enable(port.0), true, CALL_TIMEOUT) {
            self.inner.ports.remove(port);
            return Err(e);
        }
        Ok(())
    }

    /// Hands `buffer` to the remote side on `port`. Completion is always
    /// reported later through the port's listener, never inline.
    pub fn submit_buffer(
        &self,
        port: PortId,
        buffer: TransferBuffer,
    ) -> std::result::Result<(), SubmitError> {
        let Some(direction) = self.inner.ports.direction(port) else {
            return Err(SubmitError {
                error: Error::PortNotEnabled(port),
                buffer: Some(buffer),
            });
        };
        let handle = self.inner.next_handle();
        let msg = SubmitMsg::new(port.0, handle, buffer.bytes_used() as u32, buffer.flags());
        // Input payloads are staged for transmission so the buffer itself
        // can enter the in-flight table before the peer learns the handle.
        let payload = match direction {
            PortDirection::Input => Some(buffer.payload().to_vec()),
            PortDirection::Output => None,
        };
        if let Err(error) = self.inner.ports.track(port, handle, buffer) {
            // Raced with a concurrent disable; the buffer never left us, but
            // track() consumed it, so there is nothing to give back.
            return Err(SubmitError {
                error,
                buffer: None,
            });
        }
        let sent = match payload {
            Some(payload) => self.inner.send_with_payload(&msg, &payload),
            None => self.inner.send_message(&msg),
        };
        if let Err(error) = sent {
            let buffer = self.inner.ports.untrack(port, handle);
            return Err(SubmitError { error, buffer });
        }
        Ok(())
    }

    /// Disables `port`: tells the remote side to flush, then waits (once,
    /// bounded) for every in-flight buffer to come back. Buffers still
    /// outstanding when the bound expires are force-completed with
    /// [`BufferStatus::Error`]; a wedged peer cannot hold teardown hostage.
    pub fn disable_port(&self, port: PortId) -> Result<()> {
        self.disable_port_with_timeout(port, DRAIN_TIMEOUT)
    }

    pub(crate) fn disable_port_with_timeout(
        &self,
        port: PortId,
        timeout: Duration,
    ) -> Result<()> {
        self.inner.ports.begin_disable(port)?;
        let call_result = self.inner.call(&PortMsg::disable(port.0), true, CALL_TIMEOUT);
        if let Err(e) = &call_result {
            warn!("PORT_DISABLE on {:?} failed ({}), draining anyway", port, e);
        }
        if !self.inner.ports.wait_drained(port, timeout) {
            error!(
                "drain of {:?} timed out with {} buffers outstanding",
                port,
                self.inner.ports.in_flight_count(port)
            );
            for (listener, buffer) in self.inner.ports.drain_remaining(port) {
                listener.on_buffer_done(port, BufferStatus::Error, buffer);
            }
        }
        self.inner.ports.remove(port);
        call_result
    }

    /// Number of buffers currently held by the remote side on `port`.
    pub fn buffers_with_remote(&self, port: PortId) -> usize {
        self.inner.ports.in_flight_count(port)
    }
}
