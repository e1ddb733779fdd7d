//! KernelToy control device - the privileged side of the control channel.
//!
//! `dispatch` handles one device control request against a [`HalPlatform`].
//! It keeps no state between requests, so it is safe to call concurrently.
//! `run_device` hosts it behind a sequential request queue: requests are read
//! from a framed stream and completed one at a time, in arrival order.
//!
//! Failure statuses distinguish an unknown control code
//! (`STATUS_INVALID_DEVICE_REQUEST`) from a known code with a bad information
//! class (`STATUS_INVALID_PARAMETER`) and from a stale platform result
//! (`STATUS_UNSUCCESSFUL`).

use std::io;
use std::sync::Arc;

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::{FrameCodec, IoCompletion, IoRequest};
use crate::bridge::protocol::{
    DataProbe, HalInformationClass, HalInformationRequest, HalPlatformTimerResponse,
    IOCTL_KERNELTOY_QUERY_DATA_PROBE, IOCTL_KERNELTOY_QUERY_HAL_INFORMATION,
    PLATFORM_TIMER_INFORMATION_VERSION, PlatformTimerInfo, WireStruct,
};
use crate::platform::HalPlatform;
use crate::status::NtStatus;

impl IoRequest {
    /// Input buffer of at least `min_len` bytes.
    pub fn retrieve_input_buffer(&self, min_len: usize) -> Result<&[u8], NtStatus> {
        if self.input.len() < min_len {
            return Err(NtStatus::BUFFER_TOO_SMALL);
        }
        Ok(&self.input)
    }

    /// Output buffer of at least `min_len` bytes, sized to the caller's capacity.
    pub fn retrieve_output_buffer(&self, min_len: usize) -> Result<BytesMut, NtStatus> {
        if self.output_capacity < min_len {
            return Err(NtStatus::BUFFER_TOO_SMALL);
        }
        Ok(BytesMut::with_capacity(self.output_capacity))
    }
}

/// Handle one device control request.
pub fn dispatch<P: HalPlatform + ?Sized>(platform: &P, request: &IoRequest) -> IoCompletion {
    tracing::debug!(ioctl = format_args!("{:#x}", request.code), "IoControlCode");

    let result = match request.code {
        IOCTL_KERNELTOY_QUERY_HAL_INFORMATION => query_hal_information(platform, request),
        IOCTL_KERNELTOY_QUERY_DATA_PROBE => query_data_probe(platform, request),
        _ => Err(NtStatus::INVALID_DEVICE_REQUEST),
    };

    match result {
        Ok(output) => IoCompletion::success(output.freeze()),
        Err(status) => {
            tracing::debug!(ioctl = format_args!("{:#x}", request.code), %status, "Request failed");
            IoCompletion::failed(status)
        }
    }
}

fn query_hal_information<P: HalPlatform + ?Sized>(
    platform: &P,
    request: &IoRequest,
) -> Result<BytesMut, NtStatus> {
    let input = request.retrieve_input_buffer(HalInformationRequest::SIZE)?;
    let hal_request =
        HalInformationRequest::decode(input).map_err(|_| NtStatus::BUFFER_TOO_SMALL)?;

    tracing::debug!(
        information_class = hal_request.information_class,
        "HalInformationClass"
    );

    match hal_request.class() {
        Some(HalInformationClass::PlatformTimerInformationV1) => {
            let info = query_platform_timer_information(platform)?;

            let mut out = request.retrieve_output_buffer(HalPlatformTimerResponse::SIZE)?;
            HalPlatformTimerResponse {
                clock_interrupt_source: info.clock_interrupt_source,
                performance_counter_source: info.performance_counter_source,
            }
            .encode(&mut out);
            Ok(out)
        }
        None => Err(NtStatus::INVALID_PARAMETER),
    }
}

/// Platform timer query with the version check applied.
///
/// Query failures pass through untouched; a result with an unknown version is
/// normalized to `STATUS_UNSUCCESSFUL`.
pub fn query_platform_timer_information<P: HalPlatform + ?Sized>(
    platform: &P,
) -> Result<PlatformTimerInfo, NtStatus> {
    let info = platform.query_platform_timer_information()?;
    if info.version != PLATFORM_TIMER_INFORMATION_VERSION {
        tracing::warn!(
            version = info.version,
            expected = PLATFORM_TIMER_INFORMATION_VERSION,
            "Unsupported platform timer information version"
        );
        return Err(NtStatus::UNSUCCESSFUL);
    }
    Ok(info)
}

fn query_data_probe<P: HalPlatform + ?Sized>(
    platform: &P,
    request: &IoRequest,
) -> Result<BytesMut, NtStatus> {
    let probe = platform.query_data_probe()?;
    let mut out = request.retrieve_output_buffer(DataProbe::SIZE)?;
    probe.encode(&mut out);
    Ok(out)
}

/// Serve framed requests sequentially until the peer closes the stream.
pub async fn run_device<P, S>(platform: Arc<P>, stream: S) -> io::Result<()>
where
    P: HalPlatform + ?Sized,
    S: AsyncRead + AsyncWrite,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut requests = FramedRead::new(read_half, FrameCodec::<IoRequest>::new());
    let mut completions = FramedWrite::new(write_half, FrameCodec::<IoCompletion>::new());

    tracing::debug!("Device queue started");
    while let Some(request) = requests.next().await {
        let request = request?;
        let completion = dispatch(&*platform, &request);
        completions.send(completion).await?;
    }
    tracing::debug!("Device queue drained, peer closed");
    Ok(())
}
