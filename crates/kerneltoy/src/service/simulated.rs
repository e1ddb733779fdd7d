//! In-memory registration authority.
//!
//! Behaves like the service control manager closely enough to drive the
//! lifecycle: names are unique, handles carry access rights, and state
//! transitions advance only when polled. Faults and slow transitions are
//! scripted through [`SimulatedBehavior`] and the `fail_*` setters.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{
    ManagerAccess, ServiceAccess, ServiceConfig, ServiceControlManager, ServiceHandle,
    ServiceManager, ServiceState, ServiceStatus,
};
use crate::status::Win32Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartBehavior {
    /// Running as soon as the start request returns.
    Immediate,
    /// Start pending until polled `polls` times.
    Pending { polls: u32 },
    /// Someone else starts the service first; the start reports it as already running.
    RacedByOtherActor,
    Fail(Win32Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBehavior {
    /// Stopped as soon as the stop control returns.
    Immediate,
    /// Stop pending until polled `polls` times.
    Pending { polls: u32, wait_hint: Duration },
    /// Stop pending forever; the checkpoint still advances.
    Stuck { wait_hint: Duration },
    Fail(Win32Error),
}

/// How new registrations behave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulatedBehavior {
    /// Status of a registration right after creation.
    pub initial: ServiceStatus,
    pub start: StartBehavior,
    pub stop: StopBehavior,
}

impl Default for SimulatedBehavior {
    fn default() -> Self {
        Self {
            initial: ServiceStatus::new(ServiceState::Stopped),
            start: StartBehavior::Immediate,
            stop: StopBehavior::Immediate,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Transition {
    target: ServiceState,
    /// Queries left before the target is reached; `None` never completes.
    remaining: Option<u32>,
}

#[derive(Debug)]
struct Entry {
    config: ServiceConfig,
    status: ServiceStatus,
    transition: Option<Transition>,
}

impl Entry {
    fn poll(&mut self) -> ServiceStatus {
        match self.transition {
            Some(Transition {
                target,
                remaining: Some(remaining),
            }) if remaining <= 1 => self.settle(target),
            Some(Transition {
                remaining: Some(ref mut remaining),
                ..
            }) => {
                *remaining -= 1;
                self.status.checkpoint += 1;
            }
            Some(Transition { remaining: None, .. }) => self.status.checkpoint += 1,
            None => {}
        }
        self.status
    }

    fn begin(
        &mut self,
        pending: ServiceState,
        target: ServiceState,
        wait_hint: Duration,
        remaining: Option<u32>,
    ) {
        self.status = ServiceStatus::new(pending).with_wait_hint(wait_hint);
        self.transition = Some(Transition { target, remaining });
    }

    fn settle(&mut self, state: ServiceState) {
        self.status = ServiceStatus::new(state);
        self.transition = None;
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Counts {
    start: usize,
    stop: usize,
}

#[derive(Debug, Default)]
struct Faults {
    connect: Option<Win32Error>,
    create: Option<Win32Error>,
    open: Option<Win32Error>,
    query: Option<Win32Error>,
    delete: Option<Win32Error>,
}

#[derive(Debug, Default)]
struct Registry {
    behavior: SimulatedBehavior,
    faults: Faults,
    entries: HashMap<String, Entry>,
    counts: HashMap<String, Counts>,
    deletions: Vec<(String, ServiceState)>,
    connects: usize,
}

/// Shared in-memory registry; clones see the same registrations.
#[derive(Debug, Clone, Default)]
pub struct SimulatedScm {
    registry: Arc<Mutex<Registry>>,
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    match registry.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl SimulatedScm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(behavior: SimulatedBehavior) -> Self {
        let scm = Self::new();
        lock(&scm.registry).behavior = behavior;
        scm
    }

    pub fn fail_connect(&self, error: Option<Win32Error>) {
        lock(&self.registry).faults.connect = error;
    }

    pub fn fail_create(&self, error: Option<Win32Error>) {
        lock(&self.registry).faults.create = error;
    }

    pub fn fail_open(&self, error: Option<Win32Error>) {
        lock(&self.registry).faults.open = error;
    }

    pub fn fail_query(&self, error: Option<Win32Error>) {
        lock(&self.registry).faults.query = error;
    }

    pub fn fail_delete(&self, error: Option<Win32Error>) {
        lock(&self.registry).faults.delete = error;
    }

    pub fn exists(&self, name: &str) -> bool {
        lock(&self.registry).entries.contains_key(name)
    }

    /// Current state without advancing any transition.
    pub fn state(&self, name: &str) -> ServiceState {
        lock(&self.registry)
            .entries
            .get(name)
            .map_or(ServiceState::NotRegistered, |entry| entry.status.state)
    }

    /// Force a registration into `status`, dropping any transition in flight.
    pub fn set_status(&self, name: &str, status: ServiceStatus) {
        if let Some(entry) = lock(&self.registry).entries.get_mut(name) {
            entry.status = status;
            entry.transition = None;
        }
    }

    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.registry).entries.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether any running registration points at a driver image named `file_name`.
    pub fn is_driver_running(&self, file_name: &str) -> bool {
        lock(&self.registry).entries.values().any(|entry| {
            entry.status.state == ServiceState::Running
                && entry.config.binary_path.file_name() == Some(OsStr::new(file_name))
        })
    }

    /// Deleted registrations with the state each had when deleted.
    pub fn deletions(&self) -> Vec<(String, ServiceState)> {
        lock(&self.registry).deletions.clone()
    }

    /// Delete a registration behind the lifecycle's back.
    pub fn remove_externally(&self, name: &str) {
        lock(&self.registry).entries.remove(name);
    }

    pub fn connect_count(&self) -> usize {
        lock(&self.registry).connects
    }

    pub fn start_count(&self, name: &str) -> usize {
        lock(&self.registry)
            .counts
            .get(name)
            .map_or(0, |counts| counts.start)
    }

    pub fn stop_count(&self, name: &str) -> usize {
        lock(&self.registry)
            .counts
            .get(name)
            .map_or(0, |counts| counts.stop)
    }
}

impl ServiceControlManager for SimulatedScm {
    type Manager = SimulatedManager;

    fn connect(&self, access: ManagerAccess) -> Result<SimulatedManager, Win32Error> {
        let mut registry = lock(&self.registry);
        registry.connects += 1;
        if let Some(error) = registry.faults.connect {
            return Err(error);
        }
        Ok(SimulatedManager {
            registry: Arc::clone(&self.registry),
            access,
        })
    }
}

pub struct SimulatedManager {
    registry: Arc<Mutex<Registry>>,
    access: ManagerAccess,
}

impl ServiceManager for SimulatedManager {
    type Service = SimulatedService;

    fn create_service(
        &self,
        config: &ServiceConfig,
        access: ServiceAccess,
    ) -> Result<SimulatedService, Win32Error> {
        if self.access != ManagerAccess::CreateService {
            return Err(Win32Error::ACCESS_DENIED);
        }
        let mut registry = lock(&self.registry);
        if let Some(error) = registry.faults.create {
            return Err(error);
        }
        if registry.entries.contains_key(&config.name) {
            return Err(Win32Error::SERVICE_EXISTS);
        }

        let status = registry.behavior.initial;
        registry.entries.insert(
            config.name.clone(),
            Entry {
                config: config.clone(),
                status,
                transition: None,
            },
        );
        tracing::trace!(
            service = %config.name,
            state = %status.state,
            "Simulated registration created"
        );

        Ok(SimulatedService {
            registry: Arc::clone(&self.registry),
            name: config.name.clone(),
            access,
        })
    }

    fn open_service(
        &self,
        name: &str,
        access: ServiceAccess,
    ) -> Result<SimulatedService, Win32Error> {
        let registry = lock(&self.registry);
        if let Some(error) = registry.faults.open {
            return Err(error);
        }
        if !registry.entries.contains_key(name) {
            return Err(Win32Error::SERVICE_DOES_NOT_EXIST);
        }
        Ok(SimulatedService {
            registry: Arc::clone(&self.registry),
            name: name.to_string(),
            access,
        })
    }
}

pub struct SimulatedService {
    registry: Arc<Mutex<Registry>>,
    name: String,
    access: ServiceAccess,
}

impl SimulatedService {
    fn with_entry<T>(
        &self,
        required: ServiceAccess,
        f: impl FnOnce(&mut Registry, &str) -> Result<T, Win32Error>,
    ) -> Result<T, Win32Error> {
        if !self.access.contains(required) {
            return Err(Win32Error::ACCESS_DENIED);
        }
        let mut registry = lock(&self.registry);
        if !registry.entries.contains_key(&self.name) {
            return Err(Win32Error::INVALID_HANDLE);
        }
        f(&mut registry, &self.name)
    }
}

impl ServiceHandle for SimulatedService {
    fn query_status(&self) -> Result<ServiceStatus, Win32Error> {
        self.with_entry(ServiceAccess::QUERY_STATUS, |registry, name| {
            if let Some(error) = registry.faults.query {
                return Err(error);
            }
            registry
                .entries
                .get_mut(name)
                .map(Entry::poll)
                .ok_or(Win32Error::INVALID_HANDLE)
        })
    }

    fn start(&self) -> Result<(), Win32Error> {
        self.with_entry(ServiceAccess::START, |registry, name| {
            registry.counts.entry(name.to_string()).or_default().start += 1;
            let behavior = registry.behavior.start;
            let entry = registry
                .entries
                .get_mut(name)
                .ok_or(Win32Error::INVALID_HANDLE)?;

            if entry.status.state != ServiceState::Stopped {
                return Err(Win32Error::SERVICE_ALREADY_RUNNING);
            }
            match behavior {
                StartBehavior::Immediate => {
                    entry.settle(ServiceState::Running);
                    Ok(())
                }
                StartBehavior::Pending { polls } => {
                    entry.begin(
                        ServiceState::StartPending,
                        ServiceState::Running,
                        Duration::ZERO,
                        Some(polls),
                    );
                    Ok(())
                }
                StartBehavior::RacedByOtherActor => {
                    entry.settle(ServiceState::Running);
                    Err(Win32Error::SERVICE_ALREADY_RUNNING)
                }
                StartBehavior::Fail(error) => Err(error),
            }
        })
    }

    fn stop(&self) -> Result<ServiceStatus, Win32Error> {
        self.with_entry(ServiceAccess::STOP, |registry, name| {
            registry.counts.entry(name.to_string()).or_default().stop += 1;
            let behavior = registry.behavior.stop;
            let entry = registry
                .entries
                .get_mut(name)
                .ok_or(Win32Error::INVALID_HANDLE)?;

            if entry.status.state == ServiceState::Stopped {
                return Err(Win32Error::SERVICE_NOT_ACTIVE);
            }
            match behavior {
                StopBehavior::Immediate => entry.settle(ServiceState::Stopped),
                StopBehavior::Pending { polls, wait_hint } => entry.begin(
                    ServiceState::StopPending,
                    ServiceState::Stopped,
                    wait_hint,
                    Some(polls),
                ),
                StopBehavior::Stuck { wait_hint } => entry.begin(
                    ServiceState::StopPending,
                    ServiceState::Stopped,
                    wait_hint,
                    None,
                ),
                StopBehavior::Fail(error) => return Err(error),
            }
            Ok(entry.status)
        })
    }

    fn delete(&self) -> Result<(), Win32Error> {
        self.with_entry(ServiceAccess::DELETE, |registry, name| {
            if let Some(error) = registry.faults.delete {
                return Err(error);
            }
            let entry = registry
                .entries
                .remove(name)
                .ok_or(Win32Error::INVALID_HANDLE)?;
            registry.deletions.push((name.to_string(), entry.status.state));
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::service::{ErrorControl, ServiceType, StartType};

    fn config(name: &str) -> ServiceConfig {
        ServiceConfig {
            name: name.to_string(),
            display_name: format!("Kernel Toy Driver Service ({name})"),
            binary_path: PathBuf::from("/opt/kerneltoy/KernelToy.sys"),
            service_type: ServiceType::KernelDriver,
            start_type: StartType::Demand,
            error_control: ErrorControl::Normal,
        }
    }

    fn full_access() -> ServiceAccess {
        ServiceAccess::QUERY_STATUS
            | ServiceAccess::START
            | ServiceAccess::STOP
            | ServiceAccess::DELETE
    }

    #[test]
    fn names_are_unique() {
        let scm = SimulatedScm::new();
        let manager = scm.connect(ManagerAccess::CreateService).unwrap();
        manager.create_service(&config("KernelToy_a"), full_access()).unwrap();
        let err = manager
            .create_service(&config("KernelToy_a"), full_access())
            .err()
            .unwrap();
        assert_eq!(err, Win32Error::SERVICE_EXISTS);
    }

    #[test]
    fn plain_connect_cannot_create() {
        let scm = SimulatedScm::new();
        let manager = scm.connect(ManagerAccess::Connect).unwrap();
        let err = manager
            .create_service(&config("KernelToy_a"), full_access())
            .err()
            .unwrap();
        assert_eq!(err, Win32Error::ACCESS_DENIED);
    }

    #[test]
    fn handle_access_is_enforced() {
        let scm = SimulatedScm::new();
        let manager = scm.connect(ManagerAccess::CreateService).unwrap();
        let service = manager
            .create_service(&config("KernelToy_a"), ServiceAccess::QUERY_STATUS)
            .unwrap();
        assert_eq!(service.start(), Err(Win32Error::ACCESS_DENIED));
        assert_eq!(service.delete(), Err(Win32Error::ACCESS_DENIED));
        assert_eq!(scm.state("KernelToy_a"), ServiceState::Stopped);
    }

    #[test]
    fn pending_start_completes_after_polls() {
        let scm = SimulatedScm::with_behavior(SimulatedBehavior {
            start: StartBehavior::Pending { polls: 2 },
            ..SimulatedBehavior::default()
        });
        let manager = scm.connect(ManagerAccess::CreateService).unwrap();
        let service = manager
            .create_service(&config("KernelToy_a"), full_access())
            .unwrap();

        service.start().unwrap();
        let first = service.query_status().unwrap();
        assert_eq!(first.state, ServiceState::StartPending);
        assert_eq!(first.checkpoint, 1);
        assert_eq!(service.query_status().unwrap().state, ServiceState::Running);
        assert!(scm.is_driver_running("KernelToy.sys"));
        assert!(!scm.is_driver_running("Other.sys"));
    }

    #[test]
    fn start_and_stop_reject_wrong_state() {
        let scm = SimulatedScm::new();
        let manager = scm.connect(ManagerAccess::CreateService).unwrap();
        let service = manager
            .create_service(&config("KernelToy_a"), full_access())
            .unwrap();

        assert_eq!(service.stop(), Err(Win32Error::SERVICE_NOT_ACTIVE));
        service.start().unwrap();
        assert_eq!(service.start(), Err(Win32Error::SERVICE_ALREADY_RUNNING));
        assert_eq!(service.stop().unwrap().state, ServiceState::Stopped);
        assert_eq!(scm.start_count("KernelToy_a"), 2);
        assert_eq!(scm.stop_count("KernelToy_a"), 2);
    }

    #[test]
    fn deleted_registration_cannot_be_opened() {
        let scm = SimulatedScm::new();
        let manager = scm.connect(ManagerAccess::CreateService).unwrap();
        let service = manager
            .create_service(&config("KernelToy_a"), full_access())
            .unwrap();
        service.delete().unwrap();

        assert_eq!(service.query_status(), Err(Win32Error::INVALID_HANDLE));
        let err = manager
            .open_service("KernelToy_a", full_access())
            .err()
            .unwrap();
        assert_eq!(err, Win32Error::SERVICE_DOES_NOT_EXIST);
        assert_eq!(
            scm.deletions(),
            vec![("KernelToy_a".to_string(), ServiceState::Stopped)]
        );
    }

    #[test]
    fn query_fault_leaves_transition_untouched() {
        let scm = SimulatedScm::with_behavior(SimulatedBehavior {
            start: StartBehavior::Pending { polls: 1 },
            ..SimulatedBehavior::default()
        });
        let manager = scm.connect(ManagerAccess::CreateService).unwrap();
        let service = manager
            .create_service(&config("KernelToy_a"), full_access())
            .unwrap();
        service.start().unwrap();

        scm.fail_query(Some(Win32Error::ACCESS_DENIED));
        assert_eq!(service.query_status(), Err(Win32Error::ACCESS_DENIED));
        assert_eq!(scm.state("KernelToy_a"), ServiceState::StartPending);

        scm.fail_query(None);
        assert_eq!(service.query_status().unwrap().state, ServiceState::Running);
    }
}
