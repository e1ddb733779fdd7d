//! UserToy harness: one load, one query, one unload per run.
//!
//! The unload is attempted whatever happened before it, so a failed query
//! never leaves a registration behind. Both results are kept and mapped to an
//! exit code, with an unload failure taking precedence.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;

use crate::bridge::protocol::{
    DATA_PROBE_WORDS, DataProbe, HalInformationClass, HalInformationRequest,
    HalPlatformTimerResponse, IOCTL_KERNELTOY_QUERY_DATA_PROBE,
    IOCTL_KERNELTOY_QUERY_HAL_INFORMATION, ProtocolError, WireStruct, describe_timer_source,
};
use crate::channel::{ChannelAccess, ChannelError, ChannelOpener};
use crate::clock::{Clock, TokioClock};
use crate::service::{
    DriverLifecycle, DriverSession, LifecycleError, ServiceControlManager, UnloadOutcome,
};

/// Query selected on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Platform timer sources (read access).
    HalTimer,
    /// Data probe counters (read/write access).
    DataProbe,
}

impl Command {
    pub const ALL: [Command; 2] = [Command::HalTimer, Command::DataProbe];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HalTimer => "hal-timer",
            Self::DataProbe => "data-probe",
        }
    }

    pub fn access(&self) -> ChannelAccess {
        match self {
            Self::HalTimer => ChannelAccess::Read,
            Self::DataProbe => ChannelAccess::ReadWrite,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown command: {0}")]
pub struct UnknownCommand(pub String);

impl FromStr for Command {
    type Err = UnknownCommand;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|command| command.as_str() == s)
            .ok_or_else(|| UnknownCommand(s.to_string()))
    }
}

/// Decoded answer to one query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Report {
    HalTimer {
        clock_interrupt_source: u32,
        performance_counter_source: u32,
    },
    DataProbe {
        data: [u32; DATA_PROBE_WORDS],
    },
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HalTimer {
                clock_interrupt_source,
                performance_counter_source,
            } => {
                writeln!(
                    f,
                    "ClockInterruptSource = {}",
                    describe_timer_source(*clock_interrupt_source)
                )?;
                writeln!(
                    f,
                    "PerformanceCounterSource = {}",
                    describe_timer_source(*performance_counter_source)
                )
            }
            Self::DataProbe { data } => {
                for (i, value) in data.iter().enumerate() {
                    writeln!(f, "Data[{i}] = {value}")?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("failed to load driver: {0}")]
    Load(#[from] LifecycleError),
    #[error("{0}")]
    Channel(#[from] ChannelError),
    #[error("malformed response: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Result of one harness run.
#[derive(Debug)]
pub struct HarnessOutcome {
    pub query: Result<Report, HarnessError>,
    pub unload: Result<UnloadOutcome, LifecycleError>,
}

impl HarnessOutcome {
    pub const EXIT_SUCCESS: i32 = 0;
    pub const EXIT_QUERY_FAILED: i32 = 1;
    pub const EXIT_UNLOAD_FAILED: i32 = 2;

    pub fn exit_code(&self) -> i32 {
        if self.unload.is_err() {
            Self::EXIT_UNLOAD_FAILED
        } else if self.query.is_err() {
            Self::EXIT_QUERY_FAILED
        } else {
            Self::EXIT_SUCCESS
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code() == Self::EXIT_SUCCESS
    }
}

pub struct Harness<S, C = TokioClock> {
    lifecycle: DriverLifecycle<S, C>,
    opener: Arc<dyn ChannelOpener>,
}

impl<S: ServiceControlManager, C: Clock> Harness<S, C> {
    pub fn new(lifecycle: DriverLifecycle<S, C>, opener: impl ChannelOpener + 'static) -> Self {
        Self {
            lifecycle,
            opener: Arc::new(opener),
        }
    }

    /// Load, query once, then unload regardless of the query result.
    pub async fn run(&self, session: &DriverSession, command: Command) -> HarnessOutcome {
        let query = self.query(session, command).await;
        match &query {
            Ok(_) => tracing::info!(%command, "Query succeeded"),
            Err(e) => tracing::error!(%command, error = %e, "Query failed"),
        }

        let unload = self.lifecycle.ensure_unloaded(session).await;
        if let Err(e) = &unload {
            tracing::error!(error = %e, "Failed to unload driver");
        }

        HarnessOutcome { query, unload }
    }

    async fn query(
        &self,
        session: &DriverSession,
        command: Command,
    ) -> Result<Report, HarnessError> {
        let loaded = self.lifecycle.ensure_loaded(session).await?;
        tracing::debug!(?loaded, "Driver ready");

        let mut channel = self.opener.open(command.access()).await?;

        match command {
            Command::HalTimer => {
                let request =
                    HalInformationRequest::new(HalInformationClass::PlatformTimerInformationV1);
                let output = channel
                    .device_io_control(
                        IOCTL_KERNELTOY_QUERY_HAL_INFORMATION,
                        &request.to_bytes(),
                        HalPlatformTimerResponse::SIZE,
                    )
                    .await?;
                let response = HalPlatformTimerResponse::decode_exact(&output)?;
                Ok(Report::HalTimer {
                    clock_interrupt_source: response.clock_interrupt_source,
                    performance_counter_source: response.performance_counter_source,
                })
            }
            Command::DataProbe => {
                let output = channel
                    .device_io_control(IOCTL_KERNELTOY_QUERY_DATA_PROBE, &[], DataProbe::SIZE)
                    .await?;
                let probe = DataProbe::decode_exact(&output)?;
                Ok(Report::DataProbe { data: probe.data })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use bytes::Bytes;

    use super::*;
    use crate::bridge::protocol::PlatformTimerInfo;
    use crate::channel::{ControlChannel, LoopbackOpener};
    use crate::clock::ManualClock;
    use crate::platform::SimulatedPlatform;
    use crate::service::{SimulatedBehavior, SimulatedScm, StopBehavior};
    use crate::status::{NtStatus, Win32Error};

    fn harness(
        scm: &SimulatedScm,
        timer: Result<PlatformTimerInfo, NtStatus>,
    ) -> Harness<SimulatedScm, ManualClock> {
        let lifecycle = DriverLifecycle::new(scm.clone()).with_clock(ManualClock::new());
        Harness::new(
            lifecycle,
            LoopbackOpener::new(Arc::new(SimulatedPlatform::new(timer))),
        )
    }

    fn session() -> DriverSession {
        DriverSession::with_driver_dir("/opt/kerneltoy")
    }

    /// Answers every request with a fixed payload.
    struct FixedOpener(Bytes);

    struct FixedChannel(Bytes);

    #[async_trait]
    impl ChannelOpener for FixedOpener {
        async fn open(&self, _: ChannelAccess) -> Result<Box<dyn ControlChannel>, ChannelError> {
            Ok(Box::new(FixedChannel(self.0.clone())))
        }
    }

    #[async_trait]
    impl ControlChannel for FixedChannel {
        async fn device_io_control(
            &mut self,
            _: u32,
            _: &[u8],
            _: usize,
        ) -> Result<Bytes, ChannelError> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn commands_parse() {
        assert_eq!("hal-timer".parse::<Command>(), Ok(Command::HalTimer));
        assert_eq!("data-probe".parse::<Command>(), Ok(Command::DataProbe));
        assert_eq!(
            "timer".parse::<Command>(),
            Err(UnknownCommand("timer".to_string()))
        );
    }

    #[test]
    fn report_renders_names_and_raw_codes() {
        let report = Report::HalTimer {
            clock_interrupt_source: 5,
            performance_counter_source: 42,
        };
        assert_eq!(
            report.to_string(),
            "ClockInterruptSource = HalPlatformTimerHpet\nPerformanceCounterSource = 42\n"
        );
    }

    #[test]
    fn report_serializes() {
        let report = Report::HalTimer {
            clock_interrupt_source: 2,
            performance_counter_source: 9,
        };
        insta::assert_json_snapshot!(report, @r#"
        {
          "kind": "hal_timer",
          "clock_interrupt_source": 2,
          "performance_counter_source": 9
        }
        "#);
    }

    #[test]
    fn probe_report_lists_every_word() {
        let report = Report::DataProbe {
            data: std::array::from_fn(|i| (i * 10) as u32),
        };
        let rendered = report.to_string();
        assert_eq!(rendered.lines().count(), DATA_PROBE_WORDS);
        assert!(rendered.starts_with("Data[0] = 0\n"));
        assert!(rendered.ends_with("Data[15] = 150\n"));
    }

    #[tokio::test]
    async fn hal_timer_run_succeeds_and_cleans_up() {
        let scm = SimulatedScm::new();
        let harness = harness(&scm, Ok(PlatformTimerInfo::v1(1, 2)));

        let outcome = harness.run(&session(), Command::HalTimer).await;
        assert_eq!(outcome.exit_code(), 0);
        assert!(outcome.is_success());
        assert_eq!(
            outcome.query.unwrap(),
            Report::HalTimer {
                clock_interrupt_source: 1,
                performance_counter_source: 2,
            }
        );
        assert_eq!(outcome.unload.unwrap(), UnloadOutcome::Deleted { stopped: true });
        assert!(scm.service_names().is_empty());
    }

    #[tokio::test]
    async fn data_probe_run_uses_read_write_channel() {
        let scm = SimulatedScm::new();
        let harness = harness(&scm, Ok(PlatformTimerInfo::v1(1, 2)));

        let outcome = harness.run(&session(), Command::DataProbe).await;
        match outcome.query.unwrap() {
            Report::DataProbe { data } => assert_eq!(data[7], 7),
            other => panic!("unexpected report {other:?}"),
        }
    }

    #[tokio::test]
    async fn query_failure_still_unloads() {
        let scm = SimulatedScm::new();
        let harness = harness(&scm, Ok(PlatformTimerInfo {
            version: 2,
            clock_interrupt_source: 1,
            performance_counter_source: 2,
        }));

        let outcome = harness.run(&session(), Command::HalTimer).await;
        assert!(matches!(
            outcome.query,
            Err(HarnessError::Channel(ChannelError::Device(NtStatus::UNSUCCESSFUL)))
        ));
        assert!(outcome.unload.is_ok());
        assert_eq!(outcome.exit_code(), 1);
        assert!(scm.service_names().is_empty());
    }

    #[tokio::test]
    async fn load_failure_skips_unload_work() {
        let scm = SimulatedScm::new();
        scm.fail_create(Some(Win32Error::ACCESS_DENIED));
        let harness = harness(&scm, Ok(PlatformTimerInfo::v1(1, 2)));

        let outcome = harness.run(&session(), Command::HalTimer).await;
        assert!(matches!(outcome.query, Err(HarnessError::Load(_))));
        assert_eq!(outcome.exit_code(), 1);
        assert_eq!(outcome.unload.as_ref().unwrap(), &UnloadOutcome::NotLoaded);
    }

    #[tokio::test]
    async fn unload_failure_takes_precedence() {
        let scm = SimulatedScm::with_behavior(SimulatedBehavior {
            stop: StopBehavior::Stuck {
                wait_hint: std::time::Duration::ZERO,
            },
            ..SimulatedBehavior::default()
        });
        let harness = harness(&scm, Err(NtStatus::NOT_SUPPORTED));

        let outcome = harness.run(&session(), Command::HalTimer).await;
        assert!(outcome.query.is_err());
        assert!(matches!(outcome.unload, Err(LifecycleError::StopTimeout { .. })));
        assert_eq!(outcome.exit_code(), 2);
        assert!(!outcome.is_success());
    }

    #[tokio::test]
    async fn short_response_is_protocol_error() {
        let scm = SimulatedScm::new();
        let lifecycle = DriverLifecycle::new(scm.clone()).with_clock(ManualClock::new());
        let harness = Harness::new(lifecycle, FixedOpener(Bytes::from_static(&[1, 0, 0, 0])));

        let outcome = harness.run(&session(), Command::HalTimer).await;
        assert!(matches!(
            outcome.query,
            Err(HarnessError::Protocol(ProtocolError::SizeMismatch {
                expected: 8,
                actual: 4
            }))
        ));
        assert_eq!(outcome.exit_code(), 1);
    }
}
