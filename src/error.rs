// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io;
use std::time::Duration;

use remain::sorted;
use thiserror::Error as ThisError;

use crate::port::PortId;
use crate::transport::ServiceId;

#[sorted]
#[derive(ThisError, Debug)]
pub enum Error {
    #[error("bulk transfer failed: {0}")]
    BulkTransfer(io::Error),
    #[error("synchronous call timed out after {0:?}")]
    CallTimeout(Duration),
    #[error("channel is faulted and no longer usable")]
    ChannelFaulted,
    #[error("failed to connect to service {0}: {1}")]
    Connect(ServiceId, io::Error),
    #[error("port {0:?} is already enabled")]
    PortAlreadyEnabled(PortId),
    #[error("port {0:?} is not enabled")]
    PortNotEnabled(PortId),
    #[error("remote rejected request with status {0}")]
    RemoteStatus(u32),
    #[error("failed to spawn dispatch thread: {0}")]
    SpawnDispatch(io::Error),
    #[error("failed to close transport: {0}")]
    TransportClose(io::Error),
    #[error("failed to send message on transport: {0}")]
    TransportSend(io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
