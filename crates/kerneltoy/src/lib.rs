//! kerneltoy: HAL platform timer query device and its driver lifecycle.

pub mod bridge;
pub mod channel;
pub mod clock;
pub mod device;
pub mod harness;
pub mod platform;
pub mod service;
pub mod status;

pub use bridge::protocol::{
    DataProbe, HalInformationClass, HalInformationRequest, HalPlatformTimerResponse,
    PlatformTimerInfo, ProtocolError, WireStruct,
};
pub use channel::{ChannelAccess, ChannelError, ChannelOpener, ControlChannel, LoopbackOpener};
pub use clock::{Clock, ManualClock, TokioClock};
pub use device::{dispatch, run_device};
pub use harness::{Command, Harness, HarnessError, HarnessOutcome, Report, UnknownCommand};
pub use platform::{HalPlatform, SimulatedPlatform};
pub use service::{
    DriverDescriptor, DriverLifecycle, DriverSession, LifecycleConfig, LifecycleError,
    LoadOutcome, ServiceControlManager, ServiceState, SimulatedScm, UnloadOutcome,
};
pub use status::{NtStatus, Win32Error};

/// Crate version, reported by the harness at startup.
pub const KERNELTOY_VERSION: &str = env!("CARGO_PKG_VERSION");
