// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host-side control and data transport to VPU co-processor services.
//!
//! The VPU exposes named services (audio playback, video processing) over a
//! message-based transport. This crate layers on top of such a transport:
//!
//! * [`channel::Channel`]: one connection to one service, with synchronous
//!   calls, ordered bulk/chunked payload transfer, and a dedicated
//!   completion-dispatch thread.
//! * [`audio::AudioStream`]: the audio playback service client, with
//!   FIFO-advance accounting driven by cookie-checked completion events.
//! * Port-level buffer exchange (see [`port`]): directional queues of
//!   [`buffer::TransferBuffer`]s whose ownership strictly alternates between
//!   the host and the VPU, with bounded drain on disable.
//!
//! The transport itself is abstracted behind [`transport::Transport`]; tests
//! substitute an in-process fake.

pub mod audio;
pub mod buffer;
pub mod channel;
mod dispatch;
pub mod error;
pub mod port;
pub mod protocol;
mod sync;
#[cfg(test)]
mod test_utils;
pub mod transport;

pub use audio::AudioControl;
pub use audio::AudioParams;
pub use audio::AudioStream;
pub use audio::PlaybackObserver;
pub use buffer::BufferStatus;
pub use buffer::TransferBuffer;
pub use channel::Channel;
pub use channel::ChannelEvents;
pub use channel::ChannelOptions;
pub use error::Error;
pub use error::Result;
pub use port::FrameGeometry;
pub use port::PortDirection;
pub use port::PortEventListener;
pub use port::PortId;
pub use port::SubmitError;
pub use transport::ServiceConnector;
pub use transport::ServiceId;
pub use transport::Transport;
