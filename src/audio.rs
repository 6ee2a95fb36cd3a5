// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Client for the VPU audio playback service.
//!
//! One [`AudioStream`] wraps one channel to the `AUDS` service and mirrors
//! the service's command set: configure, set controls, start, stop, drain,
//! and write sample data. Writes announce their byte count and integrity
//! cookies in a WRITE record, then push the samples on the negotiated bulk
//! or chunked path; the service acknowledges consumption asynchronously
//! through the [`PlaybackObserver`].

use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;

use crate::channel::Channel;
use crate::channel::ChannelEvents;
use crate::channel::ChannelOptions;
use crate::error::Result;
use crate::protocol::ConfigMsg;
use crate::protocol::ControlMsg;
use crate::protocol::SimpleMsg;
use crate::protocol::StopMsg;
use crate::protocol::WriteMsg;
use crate::protocol::MSG_TYPE_CLOSE;
use crate::protocol::MSG_TYPE_START;
use crate::transport::ServiceConnector;
use crate::transport::AUDIO_SERVICE;

/// Gain step the remote mixer treats as silence; sent in place of the real
/// volume while the stream is muted.
pub const MIN_VOLUME: u32 = 26214;

/// Destination and gain for the playback path.
#[derive(Copy, Clone, Debug, Default, Serialize, Deserialize)]
pub struct AudioControl {
    /// Output routing (headphone jack, HDMI, ...), as understood by the
    /// remote mixer.
    pub dest: u32,
    pub volume: u32,
    pub mute: bool,
}

impl AudioControl {
    fn effective_volume(&self) -> u32 {
        if self.mute {
            MIN_VOLUME
        } else {
            self.volume
        }
    }
}

/// PCM geometry of the stream.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct AudioParams {
    pub channels: u32,
    pub samplerate: u32,
    pub bps: u32,
}

/// Receives playback progress from the dispatch thread.
pub trait PlaybackObserver: Send + Sync {
    /// The service consumed `count` more bytes of sample data; the producer
    /// may refill that much of its FIFO.
    fn on_fifo_advance(&self, count: u32);
}

struct ObserverEvents(Arc<dyn PlaybackObserver>);

impl ChannelEvents for ObserverEvents {
    fn on_playback_advance(&self, count: u32) {
        self.0.on_fifo_advance(count);
    }
}

/// One open playback stream on the audio service.
pub struct AudioStream {
    channel: Channel,
}

impl AudioStream {
    /// Connects to the audio service and opens a stream on it. Failure to
    /// connect is terminal; the stream cannot be used and there is no retry.
    pub fn open(
        connector: &dyn ServiceConnector,
        options: ChannelOptions,
        observer: Arc<dyn PlaybackObserver>,
    ) -> Result<AudioStream> {
        let channel = Channel::open(
            connector,
            AUDIO_SERVICE,
            options,
            Arc::new(ObserverEvents(observer)),
        )?;
        Ok(AudioStream { channel })
    }

    /// Applies output routing and gain.
    pub fn set_ctls(&self, control: &AudioControl) -> Result<()> {
        self.channel
            .call(&ControlMsg::new(control.dest, control.effective_volume()), true)
    }

    /// Applies the PCM geometry. Controls are re-sent first: the stream may
    /// not have been open yet when they were last pushed.
    pub fn set_params(&self, control: &AudioControl, params: &AudioParams) -> Result<()> {
        self.set_ctls(control)?;
        self.channel.call(
            &ConfigMsg::new(params.channels, params.samplerate, params.bps),
            true,
        )
    }

    pub fn start(&self) -> Result<()> {
        self.channel.call(&SimpleMsg::new(MSG_TYPE_START), false)
    }

    /// Stops playback immediately, discarding queued samples.
    pub fn stop(&self) -> Result<()> {
        self.channel.call(&StopMsg::new(false), false)
    }

    /// Stops once the service has played out everything queued. Does not
    /// block; the tail of the stream is acknowledged through the observer
    /// like any other data.
    pub fn drain(&self) -> Result<()> {
        self.channel.call(&StopMsg::new(true), false)
    }

    /// Queues `data` for playback. The WRITE record and the payload go out
    /// back to back under the channel lock so the service attributes them
    /// to one another; consumption is reported later via
    /// [`PlaybackObserver::on_fifo_advance`].
    pub fn write(&self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let msg = WriteMsg::new(data.len() as u32, self.channel.max_packet());
        self.channel.send_with_payload(&msg, data)
    }

    /// Closes the stream on the service, then tears the channel down.
    pub fn close(self) -> Result<()> {
        let result = self.channel.call(&SimpleMsg::new(MSG_TYPE_CLOSE), true);
        let teardown = self.channel.close();
        result.and(teardown)
    }
}
