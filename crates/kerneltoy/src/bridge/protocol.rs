//! Fixed-layout wire types for the KernelToy control device.
//!
//! Every payload is a packed little-endian struct of `u32` fields. Requests are
//! input-only, responses output-only; a response is only valid when its length
//! is exactly the struct size.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

/// Well-known device path opened by the harness.
pub const DEVICE_PATH: &str = r"\\.\GLOBALROOT\Device\KernelToy";

pub const FILE_DEVICE_UNKNOWN: u32 = 0x0000_0022;
pub const METHOD_BUFFERED: u32 = 0;
pub const FILE_READ_ACCESS: u32 = 0x0001;
pub const FILE_WRITE_ACCESS: u32 = 0x0002;

/// Builds a device control code with the same bit layout as `CTL_CODE`.
pub const fn ctl_code(device_type: u32, function: u32, method: u32, access: u32) -> u32 {
    (device_type << 16) | (access << 14) | (function << 2) | method
}

/// Access bits a caller's handle must hold to issue `code`.
pub const fn required_access(code: u32) -> u32 {
    (code >> 14) & 0x3
}

pub const IOCTL_KERNELTOY_QUERY_HAL_INFORMATION: u32 =
    ctl_code(FILE_DEVICE_UNKNOWN, 0x800, METHOD_BUFFERED, FILE_READ_ACCESS);

pub const IOCTL_KERNELTOY_QUERY_DATA_PROBE: u32 = ctl_code(
    FILE_DEVICE_UNKNOWN,
    0x801,
    METHOD_BUFFERED,
    FILE_READ_ACCESS | FILE_WRITE_ACCESS,
);

/// The only platform timer information version this protocol understands.
pub const PLATFORM_TIMER_INFORMATION_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("buffer too short: need {expected} bytes, got {actual}")]
    ShortBuffer { expected: usize, actual: usize },
    #[error("size mismatch: expected exactly {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },
}

/// A fixed-size struct with a packed little-endian layout.
pub trait WireStruct: Sized {
    const SIZE: usize;

    fn put(&self, dst: &mut BytesMut);

    /// Reads `SIZE` bytes from the front of `src`. Trailing bytes are ignored.
    fn get(src: &mut &[u8]) -> Self;

    fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(Self::SIZE);
        self.put(dst);
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        self.put(&mut buf);
        buf.to_vec()
    }

    /// Decode from a buffer holding at least `SIZE` bytes.
    fn decode(src: &[u8]) -> Result<Self, ProtocolError> {
        if src.len() < Self::SIZE {
            return Err(ProtocolError::ShortBuffer {
                expected: Self::SIZE,
                actual: src.len(),
            });
        }
        let mut cursor = src;
        Ok(Self::get(&mut cursor))
    }

    /// Decode from a buffer holding exactly `SIZE` bytes.
    fn decode_exact(src: &[u8]) -> Result<Self, ProtocolError> {
        if src.len() != Self::SIZE {
            return Err(ProtocolError::SizeMismatch {
                expected: Self::SIZE,
                actual: src.len(),
            });
        }
        Self::decode(src)
    }
}

/// Sub-query selector carried in [`HalInformationRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HalInformationClass {
    PlatformTimerInformationV1,
}

impl HalInformationClass {
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::PlatformTimerInformationV1),
            _ => None,
        }
    }

    pub const fn as_raw(self) -> u32 {
        match self {
            Self::PlatformTimerInformationV1 => 1,
        }
    }
}

/// Input payload of `IOCTL_KERNELTOY_QUERY_HAL_INFORMATION`.
///
/// The class stays a raw `u32` so unknown selectors survive the wire and can be
/// rejected by the device rather than by the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HalInformationRequest {
    pub information_class: u32,
}

impl HalInformationRequest {
    pub fn new(class: HalInformationClass) -> Self {
        Self {
            information_class: class.as_raw(),
        }
    }

    pub fn class(&self) -> Option<HalInformationClass> {
        HalInformationClass::from_raw(self.information_class)
    }
}

impl WireStruct for HalInformationRequest {
    const SIZE: usize = 4;

    fn put(&self, dst: &mut BytesMut) {
        dst.put_u32_le(self.information_class);
    }

    fn get(src: &mut &[u8]) -> Self {
        Self {
            information_class: src.get_u32_le(),
        }
    }
}

/// Output payload for [`HalInformationClass::PlatformTimerInformationV1`].
///
/// Both fields are opaque source codes and are passed through unvalidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HalPlatformTimerResponse {
    pub clock_interrupt_source: u32,
    pub performance_counter_source: u32,
}

impl WireStruct for HalPlatformTimerResponse {
    const SIZE: usize = 8;

    fn put(&self, dst: &mut BytesMut) {
        dst.put_u32_le(self.clock_interrupt_source);
        dst.put_u32_le(self.performance_counter_source);
    }

    fn get(src: &mut &[u8]) -> Self {
        Self {
            clock_interrupt_source: src.get_u32_le(),
            performance_counter_source: src.get_u32_le(),
        }
    }
}

/// Result of the platform timer query, as reported by the HAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformTimerInfo {
    pub version: u32,
    pub clock_interrupt_source: u32,
    pub performance_counter_source: u32,
}

impl PlatformTimerInfo {
    pub fn v1(clock_interrupt_source: u32, performance_counter_source: u32) -> Self {
        Self {
            version: PLATFORM_TIMER_INFORMATION_VERSION,
            clock_interrupt_source,
            performance_counter_source,
        }
    }
}

impl WireStruct for PlatformTimerInfo {
    const SIZE: usize = 12;

    fn put(&self, dst: &mut BytesMut) {
        dst.put_u32_le(self.version);
        dst.put_u32_le(self.clock_interrupt_source);
        dst.put_u32_le(self.performance_counter_source);
    }

    fn get(src: &mut &[u8]) -> Self {
        Self {
            version: src.get_u32_le(),
            clock_interrupt_source: src.get_u32_le(),
            performance_counter_source: src.get_u32_le(),
        }
    }
}

pub const DATA_PROBE_WORDS: usize = 16;

/// Output payload of `IOCTL_KERNELTOY_QUERY_DATA_PROBE`: sixteen opaque counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataProbe {
    pub data: [u32; DATA_PROBE_WORDS],
}

impl WireStruct for DataProbe {
    const SIZE: usize = DATA_PROBE_WORDS * 4;

    fn put(&self, dst: &mut BytesMut) {
        for word in self.data {
            dst.put_u32_le(word);
        }
    }

    fn get(src: &mut &[u8]) -> Self {
        let mut data = [0u32; DATA_PROBE_WORDS];
        for word in &mut data {
            *word = src.get_u32_le();
        }
        Self { data }
    }
}

// Names from Geoff Chappell's HAL_PLATFORM_TIMER_SOURCE notes:
// https://www.geoffchappell.com/studies/windows/km/ntoskrnl/inc/ntos/hal/
const PLATFORM_TIMER_SOURCES: [&str; 14] = [
    "HalPlatformTimerNotSpecified",
    "HalPlatformTimer8254",
    "HalPlatformTimerRtc",
    "HalPlatformTimerAcpi",
    "HalPlatformTimerAcpiBroken",
    "HalPlatformTimerHpet",
    "HalPlatformTimerProcessorCounter",
    "HalPlatformTimerHvReferenceTime",
    "HalPlatformTimerSfi",
    "HalPlatformTimerApic",
    "HalPlatformTimerHvSynthetic",
    "HalPlatformTimerCustom",
    "HalPlatformTimerCycleCounter",
    "HalPlatformTimerGit",
];

/// Name of a HAL platform timer source, or `None` for codes outside the table.
pub fn timer_source_name(code: u32) -> Option<&'static str> {
    PLATFORM_TIMER_SOURCES.get(code as usize).copied()
}

/// Human-readable rendering: the table name, or the raw integer when unknown.
pub fn describe_timer_source(code: u32) -> String {
    match timer_source_name(code) {
        Some(name) => name.to_string(),
        None => code.to_string(),
    }
}
