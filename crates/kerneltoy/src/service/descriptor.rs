//! Registration descriptor for one harness run.

use std::path::{Path, PathBuf};

use super::{ErrorControl, ServiceConfig, ServiceType, StartType};

/// Driver image expected next to the harness executable.
pub const DRIVER_FILE_NAME: &str = "KernelToy.sys";

pub const SERVICE_NAME_PREFIX: &str = "KernelToy_";

const SUFFIX_CHARSET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";
const SUFFIX_LEN: usize = 8;

/// Where the driver lives and what its registration is called.
///
/// The random suffix ties a registration to exactly one run, so a leftover
/// registration from an earlier run, or a concurrent run, never collides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverDescriptor {
    pub driver_path: PathBuf,
    pub service_name: String,
    pub display_name: String,
}

impl DriverDescriptor {
    /// New descriptor with a fresh random name for the driver in `driver_dir`.
    pub fn generate(driver_dir: &Path) -> Self {
        let suffix = random_suffix();
        Self {
            driver_path: driver_dir.join(DRIVER_FILE_NAME),
            service_name: format!("{SERVICE_NAME_PREFIX}{suffix}"),
            display_name: format!("Kernel Toy Driver Service ({suffix})"),
        }
    }

    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            name: self.service_name.clone(),
            display_name: self.display_name.clone(),
            binary_path: self.driver_path.clone(),
            service_type: ServiceType::KernelDriver,
            start_type: StartType::Demand,
            error_control: ErrorControl::Normal,
        }
    }
}

/// Eight base32 characters drawn from the low 40 bits of a v4 UUID.
///
/// The low bits of a v4 UUID carry no version or variant markers.
fn random_suffix() -> String {
    let mut bits = uuid::Uuid::new_v4().as_u128();
    let mut suffix = String::with_capacity(SUFFIX_LEN);
    for _ in 0..SUFFIX_LEN {
        suffix.push(SUFFIX_CHARSET[(bits & 0x1f) as usize] as char);
        bits >>= 5;
    }
    suffix
}
