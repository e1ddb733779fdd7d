//! Control-channel bridge between the harness and the KernelToy device.
//!
//! This module provides the wire layouts and framing for device control
//! requests.
//!
//! # Architecture
//!
//! - **protocol**: Fixed-layout payloads (HalInformationRequest,
//!   HalPlatformTimerResponse, DataProbe) and control codes
//! - **codec**: Length-delimited framing of IoRequest/IoCompletion for in-process channels

pub mod codec;
pub mod protocol;
