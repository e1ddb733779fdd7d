//! Opaque platform queries answered by the HAL.

use std::sync::Mutex;

use crate::bridge::protocol::{DataProbe, PlatformTimerInfo};
use crate::status::NtStatus;

/// Low-level hardware queries used by the device.
///
/// Implementations return the platform's answer verbatim. Version checks and
/// status normalization belong to the caller.
pub trait HalPlatform: Send + Sync + 'static {
    fn query_platform_timer_information(&self) -> Result<PlatformTimerInfo, NtStatus>;

    fn query_data_probe(&self) -> Result<DataProbe, NtStatus> {
        Err(NtStatus::NOT_SUPPORTED)
    }
}

/// Platform with fixed, configurable answers.
///
/// Stands in for the HAL on hosts without the driver and in tests. Counts how
/// often each query ran.
pub struct SimulatedPlatform {
    timer: Result<PlatformTimerInfo, NtStatus>,
    probe: Result<DataProbe, NtStatus>,
    calls: Mutex<QueryCounts>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryCounts {
    pub timer: usize,
    pub probe: usize,
}

impl Default for SimulatedPlatform {
    fn default() -> Self {
        // HPET clock interrupt with the TSC as performance counter.
        Self::new(Ok(PlatformTimerInfo::v1(5, 12)))
    }
}

impl SimulatedPlatform {
    pub fn new(timer: Result<PlatformTimerInfo, NtStatus>) -> Self {
        Self {
            timer,
            probe: Ok(DataProbe {
                data: std::array::from_fn(|i| i as u32),
            }),
            calls: Mutex::new(QueryCounts::default()),
        }
    }

    pub fn with_probe(mut self, probe: Result<DataProbe, NtStatus>) -> Self {
        self.probe = probe;
        self
    }

    pub fn calls(&self) -> QueryCounts {
        match self.calls.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn record(&self, f: impl FnOnce(&mut QueryCounts)) {
        match self.calls.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

impl HalPlatform for SimulatedPlatform {
    fn query_platform_timer_information(&self) -> Result<PlatformTimerInfo, NtStatus> {
        self.record(|c| c.timer += 1);
        self.timer
    }

    fn query_data_probe(&self) -> Result<DataProbe, NtStatus> {
        self.record(|c| c.probe += 1);
        self.probe
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_platform_counts_queries() {
        let platform = SimulatedPlatform::new(Err(NtStatus::NOT_SUPPORTED));
        assert_eq!(
            platform.query_platform_timer_information(),
            Err(NtStatus::NOT_SUPPORTED)
        );
        let probe = platform.query_data_probe().unwrap();
        assert_eq!(probe.data[3], 3);
        assert_eq!(platform.calls(), QueryCounts { timer: 1, probe: 1 });
    }
}
