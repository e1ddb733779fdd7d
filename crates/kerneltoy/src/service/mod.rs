//! Driver service lifecycle.
//!
//! The registration authority (the Windows service control manager) is
//! abstracted by [`ServiceControlManager`] so the lifecycle state machine can
//! run against an in-memory registry in tests and on non-Windows hosts.
//!
//! - **descriptor**: per-session registration name and driver path
//! - **lifecycle**: `ensure_loaded` / `ensure_unloaded` state machine
//! - **simulated**: in-memory registration authority with scripted transitions
//! - **windows**: the real service control manager

use std::ops::BitOr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::status::Win32Error;

mod descriptor;
mod lifecycle;
mod simulated;
#[cfg(windows)]
mod windows;

pub use descriptor::{DRIVER_FILE_NAME, DriverDescriptor, SERVICE_NAME_PREFIX};
pub use lifecycle::{
    DriverLifecycle, DriverSession, LifecycleConfig, LifecycleError, LoadOutcome, UnloadOutcome,
};
pub use simulated::{
    SimulatedBehavior, SimulatedManager, SimulatedScm, SimulatedService, StartBehavior,
    StopBehavior,
};
#[cfg(windows)]
pub use windows::{WindowsScm, WindowsService, WindowsServiceManager};

/// Current state of a registration, as observed by polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    NotRegistered,
    Stopped,
    StartPending,
    StopPending,
    Running,
    ContinuePending,
    PausePending,
    Paused,
}

impl ServiceState {
    /// Map a `SERVICE_*` state code.
    pub const fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => Self::Stopped,
            2 => Self::StartPending,
            3 => Self::StopPending,
            4 => Self::Running,
            5 => Self::ContinuePending,
            6 => Self::PausePending,
            7 => Self::Paused,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotRegistered => "not_registered",
            Self::Stopped => "stopped",
            Self::StartPending => "start_pending",
            Self::StopPending => "stop_pending",
            Self::Running => "running",
            Self::ContinuePending => "continue_pending",
            Self::PausePending => "pause_pending",
            Self::Paused => "paused",
        }
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status snapshot returned by a query or a control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceStatus {
    pub state: ServiceState,
    /// Estimated time until the next state change or checkpoint.
    pub wait_hint: Duration,
    /// Incremented by the service while a pending operation progresses.
    pub checkpoint: u32,
}

impl ServiceStatus {
    pub fn new(state: ServiceState) -> Self {
        Self {
            state,
            wait_hint: Duration::ZERO,
            checkpoint: 0,
        }
    }

    pub fn with_wait_hint(mut self, wait_hint: Duration) -> Self {
        self.wait_hint = wait_hint;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceType {
    KernelDriver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartType {
    /// Started on request (`StartService`), never at boot.
    Demand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorControl {
    Normal,
}

/// Parameters of a new registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub name: String,
    pub display_name: String,
    pub binary_path: PathBuf,
    pub service_type: ServiceType,
    pub start_type: StartType,
    pub error_control: ErrorControl,
}

/// Access requested when connecting to the registration authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerAccess {
    Connect,
    /// Connect plus permission to create registrations.
    CreateService,
}

/// Access rights on a single registration (`SERVICE_*` / `DELETE` bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceAccess(u32);

impl ServiceAccess {
    pub const QUERY_STATUS: Self = Self(0x0004);
    pub const START: Self = Self(0x0010);
    pub const STOP: Self = Self(0x0020);
    pub const DELETE: Self = Self(0x0001_0000);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ServiceAccess {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Entry point to the registration authority.
pub trait ServiceControlManager: Send + Sync {
    type Manager: ServiceManager;

    fn connect(&self, access: ManagerAccess) -> Result<Self::Manager, Win32Error>;
}

/// Open connection to the registration authority.
pub trait ServiceManager: Send {
    type Service: ServiceHandle;

    fn create_service(
        &self,
        config: &ServiceConfig,
        access: ServiceAccess,
    ) -> Result<Self::Service, Win32Error>;

    fn open_service(&self, name: &str, access: ServiceAccess) -> Result<Self::Service, Win32Error>;
}

/// Open handle to one registration.
pub trait ServiceHandle: Send {
    fn query_status(&self) -> Result<ServiceStatus, Win32Error>;

    fn start(&self) -> Result<(), Win32Error>;

    /// Send the stop control; returns the status reported with it.
    fn stop(&self) -> Result<ServiceStatus, Win32Error>;

    fn delete(&self) -> Result<(), Win32Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_codes_map_to_states() {
        assert_eq!(ServiceState::from_raw(1), Some(ServiceState::Stopped));
        assert_eq!(ServiceState::from_raw(4), Some(ServiceState::Running));
        assert_eq!(ServiceState::from_raw(7), Some(ServiceState::Paused));
        assert_eq!(ServiceState::from_raw(0), None);
        assert_eq!(ServiceState::from_raw(8), None);
    }

    #[test]
    fn access_bits_combine() {
        let access = ServiceAccess::QUERY_STATUS | ServiceAccess::STOP | ServiceAccess::DELETE;
        assert_eq!(access.bits(), 0x0001_0024);
        assert!(access.contains(ServiceAccess::STOP));
        assert!(!access.contains(ServiceAccess::START));
    }
}
