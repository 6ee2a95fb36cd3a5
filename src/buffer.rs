// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Transfer buffers exchanged with the remote side.
//!
//! Ownership of a buffer strictly alternates: the producer owns it until
//! [`crate::channel::Channel::submit_buffer`] consumes it, the port's
//! in-flight table owns it while the remote side holds it, and the producer
//! gets it back by value through its
//! [`crate::port::PortEventListener::on_buffer_done`] callback. No two
//! parties ever hold the same buffer at once.

use crate::protocol::BUFFER_FLAG_EOS;
use crate::protocol::BUFFER_FLAG_FRAME_END;
use crate::protocol::BUFFER_FLAG_KEYFRAME;

/// One unit of payload: an audio fragment or a video frame plane.
#[derive(Debug, PartialEq, Eq)]
pub struct TransferBuffer {
    data: Vec<u8>,
    bytes_used: usize,
    flags: u32,
}

impl TransferBuffer {
    /// An empty buffer of `capacity` bytes, for output-port submissions the
    /// remote side fills in.
    pub fn new(capacity: usize) -> TransferBuffer {
        TransferBuffer {
            data: vec![0; capacity],
            bytes_used: 0,
            flags: 0,
        }
    }

    /// A buffer carrying `data` to the remote side.
    pub fn with_payload(data: Vec<u8>, flags: u32) -> TransferBuffer {
        let bytes_used = data.len();
        TransferBuffer {
            data,
            bytes_used,
            flags,
        }
    }

    /// The valid bytes: the submitted payload, or whatever the remote side
    /// reported back on completion.
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.bytes_used]
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn is_eos(&self) -> bool {
        self.flags & BUFFER_FLAG_EOS != 0
    }

    pub fn is_keyframe(&self) -> bool {
        self.flags & BUFFER_FLAG_KEYFRAME != 0
    }

    pub fn is_frame_end(&self) -> bool {
        self.flags & BUFFER_FLAG_FRAME_END != 0
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// Applies the byte count and flags reported by a completion event. A
    /// length beyond the backing capacity is clamped; the remote side cannot
    /// have written more than it was given.
    pub(crate) fn complete(&mut self, length: u32, flags: u32) {
        self.bytes_used = (length as usize).min(self.data.len());
        self.flags = flags;
    }
}

/// Final state of a completed transfer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BufferStatus {
    Done,
    Error,
}
