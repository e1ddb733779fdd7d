//! Control channel to the KernelToy device.
//!
//! Platform-specific implementations:
//! - **LoopbackOpener**: in-process device served over a duplex pipe (any OS)
//! - **DeviceOpener**: `DeviceIoControl` on the real device object (Windows)

use std::io;

use async_trait::async_trait;
use bytes::Bytes;

use crate::bridge::protocol::{FILE_READ_ACCESS, FILE_WRITE_ACCESS, required_access};
use crate::status::NtStatus;

mod loopback;
#[cfg(windows)]
mod windows;

pub use loopback::{LoopbackChannel, LoopbackOpener};
#[cfg(windows)]
pub use windows::{DeviceChannel, DeviceOpener};

/// Access requested when opening the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelAccess {
    Read,
    ReadWrite,
}

impl ChannelAccess {
    pub const fn bits(self) -> u32 {
        match self {
            Self::Read => FILE_READ_ACCESS,
            Self::ReadWrite => FILE_READ_ACCESS | FILE_WRITE_ACCESS,
        }
    }

    /// Whether a handle opened with this access may issue `code`.
    pub const fn permits(self, code: u32) -> bool {
        required_access(code) & !self.bits() == 0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("handle lacks the access required by control code {code:#x}")]
    AccessDenied { code: u32 },
    #[error("device failed the request: {0}")]
    Device(NtStatus),
    #[error("control channel I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("control channel closed")]
    Closed,
}

/// An open handle to the device.
#[async_trait]
pub trait ControlChannel: Send {
    /// Send one control request and return the bytes the device produced.
    async fn device_io_control(
        &mut self,
        code: u32,
        input: &[u8],
        output_capacity: usize,
    ) -> Result<Bytes, ChannelError>;
}

/// Opens the device by its well-known path.
#[async_trait]
pub trait ChannelOpener: Send + Sync {
    async fn open(&self, access: ChannelAccess) -> Result<Box<dyn ControlChannel>, ChannelError>;
}
