//! Framed codec for the in-process control channel.
//!
//! Uses LengthDelimitedCodec for framing and a fixed little-endian header per
//! frame. Works over any AsyncRead/AsyncWrite (duplex pipes, sockets, etc).

use std::io;
use std::marker::PhantomData;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::status::NtStatus;

/// Upper bound on a single frame; control payloads are tiny.
const MAX_FRAME_LENGTH: usize = 64 * 1024;

/// A device control request as queued for the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoRequest {
    pub code: u32,
    pub input: Bytes,
    /// Capacity of the caller's output buffer.
    pub output_capacity: usize,
}

impl IoRequest {
    pub fn new(code: u32, input: impl Into<Bytes>, output_capacity: usize) -> Self {
        Self {
            code,
            input: input.into(),
            output_capacity,
        }
    }
}

/// Completion of a device control request.
///
/// `output.len()` is the byte count reported to the caller; it is always zero
/// when `status` is a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoCompletion {
    pub status: NtStatus,
    pub output: Bytes,
}

impl IoCompletion {
    pub fn success(output: impl Into<Bytes>) -> Self {
        Self {
            status: NtStatus::SUCCESS,
            output: output.into(),
        }
    }

    pub fn failed(status: NtStatus) -> Self {
        Self {
            status,
            output: Bytes::new(),
        }
    }

    pub fn information(&self) -> usize {
        self.output.len()
    }
}

/// A message that can travel inside one length-delimited frame.
pub trait Frame: Sized {
    fn write_frame(&self, dst: &mut BytesMut);
    fn read_frame(src: Bytes) -> io::Result<Self>;
}

fn truncated(what: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("truncated {what} frame"),
    )
}

impl Frame for IoRequest {
    fn write_frame(&self, dst: &mut BytesMut) {
        dst.reserve(8 + self.input.len());
        dst.put_u32_le(self.code);
        // Capacities beyond the wire field saturate instead of wrapping.
        dst.put_u32_le(u32::try_from(self.output_capacity).unwrap_or(u32::MAX));
        dst.put_slice(&self.input);
    }

    fn read_frame(mut src: Bytes) -> io::Result<Self> {
        if src.len() < 8 {
            return Err(truncated("request"));
        }
        let code = src.get_u32_le();
        let output_capacity = src.get_u32_le() as usize;
        Ok(Self {
            code,
            input: src,
            output_capacity,
        })
    }
}

impl Frame for IoCompletion {
    fn write_frame(&self, dst: &mut BytesMut) {
        dst.reserve(4 + self.output.len());
        dst.put_u32_le(self.status.as_raw());
        dst.put_slice(&self.output);
    }

    fn read_frame(mut src: Bytes) -> io::Result<Self> {
        if src.len() < 4 {
            return Err(truncated("completion"));
        }
        let status = NtStatus::from_raw(src.get_u32_le());
        if !status.is_success() && !src.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("failed completion ({status}) carries {} output bytes", src.len()),
            ));
        }
        Ok(Self {
            status,
            output: src,
        })
    }
}

/// Codec that frames messages with a length prefix.
///
/// Wraps LengthDelimitedCodec and adds the [`Frame`] layout.
pub struct FrameCodec<T> {
    inner: LengthDelimitedCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for FrameCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FrameCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(MAX_FRAME_LENGTH)
                .new_codec(),
            _phantom: PhantomData,
        }
    }
}

impl<T: Frame> Decoder for FrameCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => T::read_frame(bytes.freeze()).map(Some),
            None => Ok(None),
        }
    }
}

impl<T: Frame> Encoder<T> for FrameCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut body = BytesMut::new();
        item.write_frame(&mut body);
        tracing::trace!(frame_size_bytes = body.len(), "Encoding frame");
        self.inner.encode(body.freeze(), dst)
    }
}
