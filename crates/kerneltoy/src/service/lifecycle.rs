//! Load/unload state machine for the driver service.
//!
//! Flow:
//! 1. `ensure_loaded`: create a uniquely named registration, let any pending
//!    transition settle, start it (an already-running race counts as success)
//! 2. `ensure_unloaded`: stop with bounded polling, then delete the registration
//!
//! Both run under the session lock, so concurrent callers in one process
//! serialize on the shared descriptor and loaded flag.

use std::io;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use tokio::sync::Mutex;

use super::descriptor::DriverDescriptor;
use super::{
    ManagerAccess, ServiceAccess, ServiceControlManager, ServiceHandle, ServiceManager,
    ServiceState,
};
use crate::clock::{Clock, TokioClock};
use crate::status::Win32Error;

const STOP_TIMEOUT_ENV: &str = "KERNELTOY_STOP_TIMEOUT_SECS";

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Overall budget for a stop, measured from the stop control.
    pub stop_timeout: Duration,
    /// Wait before starting when a pending transition reports no hint.
    pub default_start_wait: Duration,
    pub min_poll_interval: Duration,
    pub max_poll_interval: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(30),
            default_start_wait: Duration::from_secs(1),
            min_poll_interval: Duration::from_millis(100),
            max_poll_interval: Duration::from_millis(3000),
        }
    }
}

impl LifecycleConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults, with the stop timeout overridable via `KERNELTOY_STOP_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let config = Self::default();
        match std::env::var(STOP_TIMEOUT_ENV) {
            Ok(raw) => match raw.trim().parse::<u64>() {
                Ok(secs) => config.with_stop_timeout(Duration::from_secs(secs)),
                Err(e) => {
                    tracing::warn!(
                        value = %raw,
                        error = %e,
                        "Ignoring invalid {}",
                        STOP_TIMEOUT_ENV
                    );
                    config
                }
            },
            Err(_) => config,
        }
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn with_default_start_wait(mut self, wait: Duration) -> Self {
        self.default_start_wait = wait;
        self
    }

    pub fn with_poll_bounds(mut self, min: Duration, max: Duration) -> Self {
        self.min_poll_interval = min;
        self.max_poll_interval = max.max(min);
        self
    }

    /// Poll a tenth of the hint, bounded on both sides.
    ///
    /// The fields are public, so the bounds are ordered here rather than trusted.
    pub fn poll_interval(&self, wait_hint: Duration) -> Duration {
        let lo = self.min_poll_interval.min(self.max_poll_interval);
        let hi = self.min_poll_interval.max(self.max_poll_interval);
        (wait_hint / 10).clamp(lo, hi)
    }

    pub fn start_wait(&self, wait_hint: Duration) -> Duration {
        if wait_hint.is_zero() {
            self.default_start_wait
        } else {
            wait_hint
        }
    }
}

/// Per-run context: the memoized descriptor and the loaded flag.
///
/// Owned by the harness and passed into every lifecycle call.
pub struct DriverSession {
    driver_dir: Option<PathBuf>,
    descriptor: OnceLock<DriverDescriptor>,
    loaded: Mutex<bool>,
}

impl Default for DriverSession {
    fn default() -> Self {
        Self::new()
    }
}

impl DriverSession {
    /// Session whose driver lives next to the running executable.
    pub fn new() -> Self {
        Self {
            driver_dir: None,
            descriptor: OnceLock::new(),
            loaded: Mutex::new(false),
        }
    }

    pub fn with_driver_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            driver_dir: Some(dir.into()),
            ..Self::new()
        }
    }

    /// Session with a fixed descriptor instead of a generated one.
    pub fn with_descriptor(descriptor: DriverDescriptor) -> Self {
        let session = Self::new();
        let _ = session.descriptor.set(descriptor);
        session
    }

    /// The descriptor, generated on first use and fixed afterwards.
    pub fn descriptor(&self) -> io::Result<&DriverDescriptor> {
        if let Some(descriptor) = self.descriptor.get() {
            return Ok(descriptor);
        }
        let dir = match &self.driver_dir {
            Some(dir) => dir.clone(),
            None => executable_dir()?,
        };
        // A racing initializer may win; its value is kept and ours dropped.
        Ok(self
            .descriptor
            .get_or_init(|| DriverDescriptor::generate(&dir)))
    }

    pub async fn is_loaded(&self) -> bool {
        *self.loaded.lock().await
    }
}

fn executable_dir() -> io::Result<PathBuf> {
    let exe = std::env::current_exe()?;
    exe.parent().map(|dir| dir.to_path_buf()).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("executable path {} has no parent", exe.display()),
        )
    })
}

/// How `ensure_loaded` reached its goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// The session already completed a load.
    AlreadyLoaded,
    /// The fresh registration was already running.
    AlreadyRunning,
    Started,
    /// Start lost a race with another actor that started it first.
    StartRaced,
    /// A start was already in flight; no start was issued.
    StartPending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnloadOutcome {
    /// Nothing to do: the session never completed a load.
    NotLoaded,
    /// The registration was already gone.
    AlreadyRemoved,
    Deleted {
        /// Whether a stop had to be issued first.
        stopped: bool,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("failed to resolve driver path: {0}")]
    Descriptor(#[source] io::Error),
    #[error("failed to open service control manager: {0}")]
    Connect(#[source] Win32Error),
    #[error("failed to create service {name}: {source}")]
    Create { name: String, source: Win32Error },
    #[error("failed to open service {name}: {source}")]
    Open { name: String, source: Win32Error },
    #[error("failed to query service {name}: {source}")]
    Query { name: String, source: Win32Error },
    #[error("failed to start service {name}: {source}")]
    Start { name: String, source: Win32Error },
    #[error("service {name} is in unexpected state {state}")]
    UnexpectedState { name: String, state: ServiceState },
    #[error("failed to stop service {name}: {source}")]
    Stop { name: String, source: Win32Error },
    #[error("service {name} did not stop within {timeout:?} (last state {last_state})")]
    StopTimeout {
        name: String,
        timeout: Duration,
        last_state: ServiceState,
    },
    #[error("failed to delete service {name}: {source}")]
    Delete { name: String, source: Win32Error },
}

impl LifecycleError {
    /// The authoritative Win32 code behind this failure, if any.
    pub fn win32_code(&self) -> Option<Win32Error> {
        match self {
            Self::Connect(source)
            | Self::Create { source, .. }
            | Self::Open { source, .. }
            | Self::Query { source, .. }
            | Self::Start { source, .. }
            | Self::Stop { source, .. }
            | Self::Delete { source, .. } => Some(*source),
            Self::StopTimeout { .. } => Some(Win32Error::TIMEOUT),
            Self::Descriptor(_) | Self::UnexpectedState { .. } => None,
        }
    }
}

/// Installs, starts, stops and removes the driver service.
pub struct DriverLifecycle<S, C = TokioClock> {
    scm: S,
    clock: C,
    config: LifecycleConfig,
}

impl<S: ServiceControlManager> DriverLifecycle<S> {
    pub fn new(scm: S) -> Self {
        Self {
            scm,
            clock: TokioClock,
            config: LifecycleConfig::default(),
        }
    }
}

impl<S: ServiceControlManager, C: Clock> DriverLifecycle<S, C> {
    pub fn with_clock<C2: Clock>(self, clock: C2) -> DriverLifecycle<S, C2> {
        DriverLifecycle {
            scm: self.scm,
            clock,
            config: self.config,
        }
    }

    pub fn with_config(mut self, config: LifecycleConfig) -> Self {
        self.config = config;
        self
    }

    /// Make sure the session's driver service exists and is running.
    pub async fn ensure_loaded(
        &self,
        session: &DriverSession,
    ) -> Result<LoadOutcome, LifecycleError> {
        let mut loaded = session.loaded.lock().await;
        if *loaded {
            return Ok(LoadOutcome::AlreadyLoaded);
        }

        let descriptor = session.descriptor().map_err(LifecycleError::Descriptor)?;
        let name = descriptor.service_name.as_str();
        tracing::info!(
            service = %name,
            driver = %descriptor.driver_path.display(),
            "Starting driver service"
        );

        let manager = self
            .scm
            .connect(ManagerAccess::CreateService)
            .map_err(LifecycleError::Connect)?;

        let service = manager
            .create_service(
                &descriptor.service_config(),
                ServiceAccess::START | ServiceAccess::QUERY_STATUS | ServiceAccess::DELETE,
            )
            .map_err(|source| LifecycleError::Create {
                name: name.to_string(),
                source,
            })?;

        let outcome = match self.start_service(name, &service).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // The load never completes, so ensure_unloaded would skip this
                // registration; remove it here instead.
                if let Err(delete_err) = service.delete() {
                    tracing::warn!(
                        service = %name,
                        error = %delete_err,
                        "Failed to remove registration after failed start"
                    );
                }
                return Err(e);
            }
        };

        tracing::debug!(service = %name, ?outcome, "Driver service loaded");
        *loaded = true;
        Ok(outcome)
    }

    async fn start_service<H: ServiceHandle>(
        &self,
        name: &str,
        service: &H,
    ) -> Result<LoadOutcome, LifecycleError> {
        let status = service
            .query_status()
            .map_err(|source| LifecycleError::Query {
                name: name.to_string(),
                source,
            })?;

        match status.state {
            ServiceState::Running => Ok(LoadOutcome::AlreadyRunning),
            ServiceState::Stopped | ServiceState::StopPending | ServiceState::StartPending => {
                if status.state != ServiceState::Stopped {
                    let wait = self.config.start_wait(status.wait_hint);
                    tracing::info!(
                        service = %name,
                        state = %status.state,
                        wait_ms = wait.as_millis() as u64,
                        "Waiting briefly for pending transition to settle"
                    );
                    self.clock.sleep(wait).await;
                }

                if status.state == ServiceState::StartPending {
                    return Ok(LoadOutcome::StartPending);
                }

                match service.start() {
                    Ok(()) => Ok(LoadOutcome::Started),
                    Err(Win32Error::SERVICE_ALREADY_RUNNING) => {
                        tracing::info!(
                            service = %name,
                            "Service started between status check and start, treating as running"
                        );
                        Ok(LoadOutcome::StartRaced)
                    }
                    Err(source) => Err(LifecycleError::Start {
                        name: name.to_string(),
                        source,
                    }),
                }
            }
            state => Err(LifecycleError::UnexpectedState {
                name: name.to_string(),
                state,
            }),
        }
    }

    /// Stop and delete the session's driver service, if the session loaded one.
    pub async fn ensure_unloaded(
        &self,
        session: &DriverSession,
    ) -> Result<UnloadOutcome, LifecycleError> {
        let mut loaded = session.loaded.lock().await;
        if !*loaded {
            tracing::debug!("Driver service was never loaded, nothing to unload");
            return Ok(UnloadOutcome::NotLoaded);
        }

        let descriptor = session.descriptor().map_err(LifecycleError::Descriptor)?;
        let name = descriptor.service_name.as_str();
        tracing::info!(service = %name, "Deleting driver service");

        let manager = self
            .scm
            .connect(ManagerAccess::Connect)
            .map_err(LifecycleError::Connect)?;

        let service = match manager.open_service(
            name,
            ServiceAccess::QUERY_STATUS | ServiceAccess::STOP | ServiceAccess::DELETE,
        ) {
            Ok(service) => service,
            Err(Win32Error::SERVICE_DOES_NOT_EXIST) => {
                tracing::info!(service = %name, "Service already removed");
                *loaded = false;
                return Ok(UnloadOutcome::AlreadyRemoved);
            }
            Err(source) => {
                return Err(LifecycleError::Open {
                    name: name.to_string(),
                    source,
                });
            }
        };

        let status = service
            .query_status()
            .map_err(|source| LifecycleError::Query {
                name: name.to_string(),
                source,
            })?;

        let stopped = match status.state {
            ServiceState::Stopped => false,
            ServiceState::Running | ServiceState::Paused | ServiceState::StartPending => {
                self.stop_and_wait(name, &service).await?;
                true
            }
            state => {
                tracing::warn!(
                    service = %name,
                    %state,
                    "Service in unexpected state, not attempting stop"
                );
                false
            }
        };

        service
            .delete()
            .map_err(|source| LifecycleError::Delete {
                name: name.to_string(),
                source,
            })?;

        *loaded = false;
        tracing::debug!(service = %name, stopped, "Driver service deleted");
        Ok(UnloadOutcome::Deleted { stopped })
    }

    /// Send the stop control and poll until the service reports stopped.
    ///
    /// The deadline runs from the stop control; checkpoint progress does not
    /// extend it.
    async fn stop_and_wait<H: ServiceHandle>(
        &self,
        name: &str,
        service: &H,
    ) -> Result<(), LifecycleError> {
        let mut status = service.stop().map_err(|source| LifecycleError::Stop {
            name: name.to_string(),
            source,
        })?;

        let started = self.clock.now();
        let mut last_checkpoint = status.checkpoint;

        while status.state != ServiceState::Stopped {
            let elapsed = self.clock.now().saturating_duration_since(started);
            if elapsed > self.config.stop_timeout {
                tracing::error!(
                    service = %name,
                    state = %status.state,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Timed out waiting for service to stop"
                );
                return Err(LifecycleError::StopTimeout {
                    name: name.to_string(),
                    timeout: self.config.stop_timeout,
                    last_state: status.state,
                });
            }

            self.clock
                .sleep(self.config.poll_interval(status.wait_hint))
                .await;

            status = service
                .query_status()
                .map_err(|source| LifecycleError::Query {
                    name: name.to_string(),
                    source,
                })?;

            if status.state == ServiceState::StopPending && status.checkpoint > last_checkpoint {
                tracing::trace!(
                    service = %name,
                    checkpoint = status.checkpoint,
                    "Stop in progress"
                );
                last_checkpoint = status.checkpoint;
            }
        }

        Ok(())
    }
}
