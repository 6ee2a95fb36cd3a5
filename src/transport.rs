// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The seam between the channel core and the underlying interconnect.
//!
//! The channel layer never talks to hardware. It drives one remote service
//! through the [`Transport`] trait and obtains connected transports from a
//! [`ServiceConnector`]. Production implementations sit over the shared-slot
//! interconnect driver; tests use an in-memory fake.

use std::fmt;
use std::io;

use serde::Deserialize;
use serde::Serialize;

/// Four-character code naming a remote service instance.
#[derive(Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceId(pub [u8; 4]);

/// The audio playback service.
pub const AUDIO_SERVICE: ServiceId = ServiceId(*b"AUDS");
/// The video encode/decode/ISP service.
pub const VIDEO_SERVICE: ServiceId = ServiceId(*b"VIDS");

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "{}", s),
            Err(_) => write!(f, "{:02x?}", self.0),
        }
    }
}

impl fmt::Debug for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ServiceId({})", self)
    }
}

/// One open connection to a remote service.
///
/// All methods may be hit concurrently: submitting threads call the send side
/// (serialized by the channel's lock) while the dispatch thread sits in
/// [`Transport::recv_message`].
pub trait Transport: Send + Sync {
    /// Enqueues one bounded inline message for in-order delivery.
    fn send_message(&self, msg: &[u8]) -> io::Result<()>;

    /// Hands `data` to the zero-copy bulk engine, blocking until the
    /// transport has accepted the transfer for delivery (not until the peer
    /// has consumed it).
    fn bulk_transmit(&self, data: &[u8]) -> io::Result<()>;

    /// Blocks until the peer sends a message. Returns `None` once the
    /// connection has been closed and all queued messages were drained.
    fn recv_message(&self) -> io::Result<Option<Vec<u8>>>;

    /// Protocol version negotiated with the peer at connect time.
    fn peer_version(&self) -> u16;

    /// Marks the service in use, keeping the interconnect powered.
    fn service_use(&self);

    /// Releases a prior [`Transport::service_use`] mark.
    fn service_release(&self);

    /// Closes the connection, unblocking [`Transport::recv_message`].
    fn close(&self) -> io::Result<()>;
}

/// Factory resolving service names to connected transports.
pub trait ServiceConnector: Send + Sync {
    fn connect(&self, service: ServiceId) -> io::Result<Box<dyn Transport>>;
}
