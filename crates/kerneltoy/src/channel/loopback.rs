//! In-process control channel.
//!
//! Each open spawns a device queue ([`run_device`]) on one end of a duplex pipe
//! and hands back the other end, framed with [`FrameCodec`]. Dropping the
//! channel closes the pipe, which ends the device task.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};

use super::{ChannelAccess, ChannelError, ChannelOpener, ControlChannel};
use crate::bridge::codec::{FrameCodec, IoCompletion, IoRequest};
use crate::bridge::protocol::DEVICE_PATH;
use crate::device::run_device;
use crate::platform::HalPlatform;

const PIPE_CAPACITY: usize = 4096;

type PresenceCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// Opens in-process channels backed by a [`HalPlatform`].
#[derive(Clone)]
pub struct LoopbackOpener {
    platform: Arc<dyn HalPlatform>,
    presence: Option<PresenceCheck>,
}

impl LoopbackOpener {
    pub fn new(platform: Arc<dyn HalPlatform>) -> Self {
        Self {
            platform,
            presence: None,
        }
    }

    /// Only allow opens while `check` reports the device object as present.
    ///
    /// Mirrors the device path disappearing when the driver is not running.
    pub fn with_presence(mut self, check: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.presence = Some(Arc::new(check));
        self
    }
}

#[async_trait]
impl ChannelOpener for LoopbackOpener {
    async fn open(&self, access: ChannelAccess) -> Result<Box<dyn ControlChannel>, ChannelError> {
        if let Some(check) = &self.presence
            && !check()
        {
            return Err(ChannelError::Open {
                path: DEVICE_PATH.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "device object does not exist",
                ),
            });
        }

        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        let platform = Arc::clone(&self.platform);
        tokio::spawn(async move {
            if let Err(e) = run_device(platform, server).await {
                tracing::warn!(error = %e, "Loopback device queue failed");
            }
        });

        tracing::debug!(?access, path = DEVICE_PATH, "Opened loopback control channel");
        let (read_half, write_half) = tokio::io::split(client);
        Ok(Box::new(LoopbackChannel {
            access,
            writer: FramedWrite::new(write_half, FrameCodec::new()),
            reader: FramedRead::new(read_half, FrameCodec::new()),
        }))
    }
}

pub struct LoopbackChannel {
    access: ChannelAccess,
    writer: FramedWrite<WriteHalf<DuplexStream>, FrameCodec<IoRequest>>,
    reader: FramedRead<ReadHalf<DuplexStream>, FrameCodec<IoCompletion>>,
}

#[async_trait]
impl ControlChannel for LoopbackChannel {
    async fn device_io_control(
        &mut self,
        code: u32,
        input: &[u8],
        output_capacity: usize,
    ) -> Result<Bytes, ChannelError> {
        if !self.access.permits(code) {
            return Err(ChannelError::AccessDenied { code });
        }

        self.writer
            .send(IoRequest::new(code, Bytes::copy_from_slice(input), output_capacity))
            .await?;

        let completion = match self.reader.next().await {
            Some(completion) => completion?,
            None => return Err(ChannelError::Closed),
        };

        if !completion.status.is_success() {
            return Err(ChannelError::Device(completion.status));
        }
        Ok(completion.output)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::bridge::protocol::{
        HalInformationRequest, IOCTL_KERNELTOY_QUERY_DATA_PROBE,
        IOCTL_KERNELTOY_QUERY_HAL_INFORMATION, PlatformTimerInfo, WireStruct,
    };
    use crate::platform::SimulatedPlatform;
    use crate::status::NtStatus;

    fn opener() -> LoopbackOpener {
        LoopbackOpener::new(Arc::new(SimulatedPlatform::new(Ok(PlatformTimerInfo::v1(
            2, 9,
        )))))
    }

    #[tokio::test]
    async fn round_trip_through_device_queue() {
        let mut channel = opener().open(ChannelAccess::Read).await.unwrap();
        let input = HalInformationRequest {
            information_class: 1,
        }
        .to_bytes();

        let output = channel
            .device_io_control(IOCTL_KERNELTOY_QUERY_HAL_INFORMATION, &input, 8)
            .await
            .unwrap();
        assert_eq!(output.as_ref(), &[2, 0, 0, 0, 9, 0, 0, 0]);
    }

    #[tokio::test]
    async fn device_failure_surfaces_status() {
        let mut channel = opener().open(ChannelAccess::Read).await.unwrap();
        let input = HalInformationRequest {
            information_class: 99,
        }
        .to_bytes();

        let err = channel
            .device_io_control(IOCTL_KERNELTOY_QUERY_HAL_INFORMATION, &input, 8)
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Device(NtStatus::INVALID_PARAMETER)));
    }

    #[tokio::test]
    async fn read_handle_cannot_issue_read_write_code() {
        let mut channel = opener().open(ChannelAccess::Read).await.unwrap();
        let err = channel
            .device_io_control(IOCTL_KERNELTOY_QUERY_DATA_PROBE, &[], 64)
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::AccessDenied { .. }));
    }

    #[tokio::test]
    async fn open_fails_while_device_absent() {
        let present = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&present);
        let opener = opener().with_presence(move || flag.load(Ordering::SeqCst));

        let err = opener.open(ChannelAccess::Read).await.err().unwrap();
        assert!(matches!(err, ChannelError::Open { .. }));

        present.store(true, Ordering::SeqCst);
        assert!(opener.open(ChannelAccess::Read).await.is_ok());
    }
}
