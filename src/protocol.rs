// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Wire format of the control channel to the VPU services.
//!
//! Every record is a fixed-size, little-endian struct whose first field is a
//! `u32` message-type tag. Requests travel host to VPU; `RESULT`, `COMPLETE`,
//! `BUFFER_RETURN` and `FORMAT_CHANGED` travel VPU to host and are decoded by
//! the dispatch thread with [`decode_peer_message`]. Audio payloads are not
//! messages at all: they follow their `WRITE` record on the bulk path, or as
//! a run of raw inline chunks when chunked transfer was negotiated.

use enumn::N;
use remain::sorted;
use thiserror::Error as ThisError;
use zerocopy::little_endian::U32;
use zerocopy::little_endian::U64;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

pub const MSG_TYPE_RESULT: u32 = 0;
pub const MSG_TYPE_COMPLETE: u32 = 1;
pub const MSG_TYPE_CONFIG: u32 = 2;
pub const MSG_TYPE_CONTROL: u32 = 3;
pub const MSG_TYPE_OPEN: u32 = 4;
pub const MSG_TYPE_CLOSE: u32 = 5;
pub const MSG_TYPE_START: u32 = 6;
pub const MSG_TYPE_STOP: u32 = 7;
pub const MSG_TYPE_WRITE: u32 = 8;
pub const MSG_TYPE_PORT_ENABLE: u32 = 9;
pub const MSG_TYPE_PORT_DISABLE: u32 = 10;
pub const MSG_TYPE_SUBMIT: u32 = 11;
pub const MSG_TYPE_BUFFER_RETURN: u32 = 12;
pub const MSG_TYPE_FORMAT_CHANGED: u32 = 13;

/// Integrity cookies pairing a `WRITE` with its `COMPLETE`.
pub const WRITE_COOKIE1: u32 = u32::from_be_bytes(*b"VPUA");
pub const WRITE_COOKIE2: u32 = u32::from_be_bytes(*b"DATA");

/// Largest inline chunk the audio service accepts on the chunked path.
pub const AUDIO_MAX_PACKET: u32 = 4000;

/// Oldest peer protocol version that can reassemble chunked writes.
pub const MIN_CHUNKED_PEER_VERSION: u16 = 2;

/* transfer-buffer flags */
pub const BUFFER_FLAG_EOS: u32 = 1 << 0;
pub const BUFFER_FLAG_KEYFRAME: u32 = 1 << 1;
pub const BUFFER_FLAG_FRAME_END: u32 = 1 << 2;

#[derive(Copy, Clone, Debug, PartialEq, Eq, N)]
#[repr(u32)]
pub enum MessageType {
    Result = MSG_TYPE_RESULT,
    Complete = MSG_TYPE_COMPLETE,
    Config = MSG_TYPE_CONFIG,
    Control = MSG_TYPE_CONTROL,
    Open = MSG_TYPE_OPEN,
    Close = MSG_TYPE_CLOSE,
    Start = MSG_TYPE_START,
    Stop = MSG_TYPE_STOP,
    Write = MSG_TYPE_WRITE,
    PortEnable = MSG_TYPE_PORT_ENABLE,
    PortDisable = MSG_TYPE_PORT_DISABLE,
    Submit = MSG_TYPE_SUBMIT,
    BufferReturn = MSG_TYPE_BUFFER_RETURN,
    FormatChanged = MSG_TYPE_FORMAT_CHANGED,
}

#[derive(Copy, Clone, Default, Debug, PartialEq, Eq, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct MsgHeader {
    pub msg_type: U32,
}

impl MsgHeader {
    fn new(msg_type: u32) -> MsgHeader {
        MsgHeader {
            msg_type: U32::from(msg_type),
        }
    }
}

/// Tag-only request (`OPEN`, `CLOSE`, `START`, and plain `STOP`).
#[derive(Copy, Clone, Default, Debug, PartialEq, Eq, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct SimpleMsg {
    pub hdr: MsgHeader,
}

impl SimpleMsg {
    pub fn new(msg_type: u32) -> SimpleMsg {
        SimpleMsg {
            hdr: MsgHeader::new(msg_type),
        }
    }
}

#[derive(Copy, Clone, Default, Debug, PartialEq, Eq, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct ConfigMsg {
    pub hdr: MsgHeader,
    pub channels: U32,
    pub samplerate: U32,
    pub bps: U32,
}

impl ConfigMsg {
    pub fn new(channels: u32, samplerate: u32, bps: u32) -> ConfigMsg {
        ConfigMsg {
            hdr: MsgHeader::new(MSG_TYPE_CONFIG),
            channels: U32::from(channels),
            samplerate: U32::from(samplerate),
            bps: U32::from(bps),
        }
    }
}

#[derive(Copy, Clone, Default, Debug, PartialEq, Eq, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct ControlMsg {
    pub hdr: MsgHeader,
    pub dest: U32,
    pub volume: U32,
}

impl ControlMsg {
    pub fn new(dest: u32, volume: u32) -> ControlMsg {
        ControlMsg {
            hdr: MsgHeader::new(MSG_TYPE_CONTROL),
            dest: U32::from(dest),
            volume: U32::from(volume),
        }
    }
}

#[derive(Copy, Clone, Default, Debug, PartialEq, Eq, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct StopMsg {
    pub hdr: MsgHeader,
    /// Non-zero means "stop after the remote has flushed", zero "stop now".
    pub draining: U32,
}

impl StopMsg {
    pub fn new(draining: bool) -> StopMsg {
        StopMsg {
            hdr: MsgHeader::new(MSG_TYPE_STOP),
            draining: U32::from(draining as u32),
        }
    }
}

/// Announces an audio payload of `count` bytes about to follow on the bulk or
/// chunked path.
#[derive(Copy, Clone, Default, Debug, PartialEq, Eq, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct WriteMsg {
    pub hdr: MsgHeader,
    pub count: U32,
    /// Negotiated chunk bound; zero tells the peer to expect one bulk
    /// transfer instead of inline chunks.
    pub max_packet: U32,
    pub cookie1: U32,
    pub cookie2: U32,
}

impl WriteMsg {
    pub fn new(count: u32, max_packet: u32) -> WriteMsg {
        WriteMsg {
            hdr: MsgHeader::new(MSG_TYPE_WRITE),
            count: U32::from(count),
            max_packet: U32::from(max_packet),
            cookie1: U32::from(WRITE_COOKIE1),
            cookie2: U32::from(WRITE_COOKIE2),
        }
    }
}

/// Reply to any request; non-zero `status` is a remote-side failure.
#[derive(Copy, Clone, Default, Debug, PartialEq, Eq, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct ResultMsg {
    pub hdr: MsgHeader,
    pub status: U32,
}

impl ResultMsg {
    pub fn new(status: u32) -> ResultMsg {
        ResultMsg {
            hdr: MsgHeader::new(MSG_TYPE_RESULT),
            status: U32::from(status),
        }
    }
}

/// Asynchronous notice that `count` bytes of a prior `WRITE` were consumed.
#[derive(Copy, Clone, Default, Debug, PartialEq, Eq, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct CompleteMsg {
    pub hdr: MsgHeader,
    pub count: U32,
    pub cookie1: U32,
    pub cookie2: U32,
}

impl CompleteMsg {
    pub fn new(count: u32, cookie1: u32, cookie2: u32) -> CompleteMsg {
        CompleteMsg {
            hdr: MsgHeader::new(MSG_TYPE_COMPLETE),
            count: U32::from(count),
            cookie1: U32::from(cookie1),
            cookie2: U32::from(cookie2),
        }
    }

    pub fn cookies_valid(&self) -> bool {
        self.cookie1.get() == WRITE_COOKIE1 && self.cookie2.get() == WRITE_COOKIE2
    }
}

#[derive(Copy, Clone, Default, Debug, PartialEq, Eq, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct PortMsg {
    pub hdr: MsgHeader,
    pub port: U32,
}

impl PortMsg {
    pub fn enable(port: u32) -> PortMsg {
        PortMsg {
            hdr: MsgHeader::new(MSG_TYPE_PORT_ENABLE),
            port: U32::from(port),
        }
    }

    pub fn disable(port: u32) -> PortMsg {
        PortMsg {
            hdr: MsgHeader::new(MSG_TYPE_PORT_DISABLE),
            port: U32::from(port),
        }
    }
}

/// Hands one transfer buffer to the remote side. The `handle` is a
/// host-assigned correlation token echoed back in `BUFFER_RETURN`; the peer
/// never interprets it.
#[derive(Copy, Clone, Default, Debug, PartialEq, Eq, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct SubmitMsg {
    pub hdr: MsgHeader,
    pub port: U32,
    pub handle: U64,
    pub length: U32,
    pub flags: U32,
}

impl SubmitMsg {
    pub fn new(port: u32, handle: u64, length: u32, flags: u32) -> SubmitMsg {
        SubmitMsg {
            hdr: MsgHeader::new(MSG_TYPE_SUBMIT),
            port: U32::from(port),
            handle: U64::from(handle),
            length: U32::from(length),
            flags: U32::from(flags),
        }
    }
}

/// Completion event for one `SUBMIT`.
#[derive(Copy, Clone, Default, Debug, PartialEq, Eq, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct BufferReturnMsg {
    pub hdr: MsgHeader,
    pub port: U32,
    pub handle: U64,
    pub status: U32,
    pub length: U32,
    pub flags: U32,
}

impl BufferReturnMsg {
    pub fn new(port: u32, handle: u64, status: u32, length: u32, flags: u32) -> BufferReturnMsg {
        BufferReturnMsg {
            hdr: MsgHeader::new(MSG_TYPE_BUFFER_RETURN),
            port: U32::from(port),
            handle: U64::from(handle),
            status: U32::from(status),
            length: U32::from(length),
            flags: U32::from(flags),
        }
    }
}

/// Out-of-band geometry update for a port; does not complete any buffer.
#[derive(Copy, Clone, Default, Debug, PartialEq, Eq, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct FormatChangedMsg {
    pub hdr: MsgHeader,
    pub port: U32,
    pub width: U32,
    pub height: U32,
    pub stride: U32,
    pub buffer_size: U32,
}

impl FormatChangedMsg {
    pub fn new(port: u32, width: u32, height: u32, stride: u32, buffer_size: u32) -> Self {
        FormatChangedMsg {
            hdr: MsgHeader::new(MSG_TYPE_FORMAT_CHANGED),
            port: U32::from(port),
            width: U32::from(width),
            height: U32::from(height),
            stride: U32::from(stride),
            buffer_size: U32::from(buffer_size),
        }
    }
}

/// A decoded VPU-to-host message.
#[derive(Debug, PartialEq, Eq)]
pub enum PeerMessage {
    Result(ResultMsg),
    Complete(CompleteMsg),
    BufferReturn(BufferReturnMsg),
    FormatChanged(FormatChangedMsg),
}

#[sorted]
#[derive(ThisError, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("message too short for a type tag: {0} bytes")]
    TooShort(usize),
    #[error("truncated {0:?} message: {1} bytes")]
    Truncated(MessageType, usize),
    #[error("host-to-peer message type {0:?} received from peer")]
    UnexpectedDirection(MessageType),
    #[error("unknown message type {0}")]
    UnknownType(u32),
}

/// Decodes one incoming record. The caller (the dispatch thread) logs and
/// drops anything this rejects; a bad message must never tear the loop down.
pub fn decode_peer_message(bytes: &[u8]) -> std::result::Result<PeerMessage, DecodeError> {
    let (tag, _) = U32::read_from_prefix(bytes).map_err(|_| DecodeError::TooShort(bytes.len()))?;
    let msg_type = MessageType::n(tag.get()).ok_or(DecodeError::UnknownType(tag.get()))?;
    match msg_type {
        MessageType::Result => ResultMsg::read_from_bytes(bytes)
            .map(PeerMessage::Result)
            .map_err(|_| DecodeError::Truncated(msg_type, bytes.len())),
        MessageType::Complete => CompleteMsg::read_from_bytes(bytes)
            .map(PeerMessage::Complete)
            .map_err(|_| DecodeError::Truncated(msg_type, bytes.len())),
        MessageType::BufferReturn => BufferReturnMsg::read_from_bytes(bytes)
            .map(PeerMessage::BufferReturn)
            .map_err(|_| DecodeError::Truncated(msg_type, bytes.len())),
        MessageType::FormatChanged => FormatChangedMsg::read_from_bytes(bytes)
            .map(PeerMessage::FormatChanged)
            .map_err(|_| DecodeError::Truncated(msg_type, bytes.len())),
        _ => Err(DecodeError::UnexpectedDirection(msg_type)),
    }
}
