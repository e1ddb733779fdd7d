//! Status codes shared by the device and the registration authority.
//!
//! - **NtStatus**: completion status of a device control request
//! - **Win32Error**: error code returned by the service control manager

use serde::{Deserialize, Serialize};

/// Completion status of a device control request.
///
/// Severity lives in the top two bits: `0xC...` is an error, `0x0...` success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NtStatus(u32);

impl NtStatus {
    pub const SUCCESS: Self = Self(0x0000_0000);
    pub const UNSUCCESSFUL: Self = Self(0xC000_0001);
    pub const INVALID_PARAMETER: Self = Self(0xC000_000D);
    pub const INVALID_DEVICE_REQUEST: Self = Self(0xC000_0010);
    pub const BUFFER_TOO_SMALL: Self = Self(0xC000_0023);
    pub const NOT_SUPPORTED: Self = Self(0xC000_00BB);

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> u32 {
        self.0
    }

    /// Success and informational codes both count as success.
    pub const fn is_success(self) -> bool {
        self.0 >> 30 <= 1
    }

    pub fn name(self) -> Option<&'static str> {
        Some(match self {
            Self::SUCCESS => "STATUS_SUCCESS",
            Self::UNSUCCESSFUL => "STATUS_UNSUCCESSFUL",
            Self::INVALID_PARAMETER => "STATUS_INVALID_PARAMETER",
            Self::INVALID_DEVICE_REQUEST => "STATUS_INVALID_DEVICE_REQUEST",
            Self::BUFFER_TOO_SMALL => "STATUS_BUFFER_TOO_SMALL",
            Self::NOT_SUPPORTED => "STATUS_NOT_SUPPORTED",
            _ => return None,
        })
    }
}

impl std::fmt::Display for NtStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({:#010x})", name, self.0),
            None => write!(f, "NTSTATUS {:#010x}", self.0),
        }
    }
}

/// Win32 error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Win32Error(u32);

impl Win32Error {
    pub const ACCESS_DENIED: Self = Self(5);
    pub const INVALID_HANDLE: Self = Self(6);
    pub const INVALID_DATA: Self = Self(13);
    pub const SERVICE_ALREADY_RUNNING: Self = Self(1056);
    pub const SERVICE_DOES_NOT_EXIST: Self = Self(1060);
    pub const SERVICE_CANNOT_ACCEPT_CTRL: Self = Self(1061);
    pub const SERVICE_NOT_ACTIVE: Self = Self(1062);
    pub const SERVICE_MARKED_FOR_DELETE: Self = Self(1072);
    pub const SERVICE_EXISTS: Self = Self(1073);
    pub const TIMEOUT: Self = Self(1460);

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> u32 {
        self.0
    }

    pub fn name(self) -> Option<&'static str> {
        Some(match self {
            Self::ACCESS_DENIED => "ERROR_ACCESS_DENIED",
            Self::INVALID_HANDLE => "ERROR_INVALID_HANDLE",
            Self::INVALID_DATA => "ERROR_INVALID_DATA",
            Self::SERVICE_ALREADY_RUNNING => "ERROR_SERVICE_ALREADY_RUNNING",
            Self::SERVICE_DOES_NOT_EXIST => "ERROR_SERVICE_DOES_NOT_EXIST",
            Self::SERVICE_CANNOT_ACCEPT_CTRL => "ERROR_SERVICE_CANNOT_ACCEPT_CTRL",
            Self::SERVICE_NOT_ACTIVE => "ERROR_SERVICE_NOT_ACTIVE",
            Self::SERVICE_MARKED_FOR_DELETE => "ERROR_SERVICE_MARKED_FOR_DELETE",
            Self::SERVICE_EXISTS => "ERROR_SERVICE_EXISTS",
            Self::TIMEOUT => "ERROR_TIMEOUT",
            _ => return None,
        })
    }
}

impl std::fmt::Display for Win32Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({})", name, self.0),
            None => write!(f, "Win32 error {}", self.0),
        }
    }
}

impl std::error::Error for Win32Error {}
