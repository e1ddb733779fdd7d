//! Service control manager backend over the Win32 services API.

use std::ffi::OsStr;
use std::os::windows::ffi::OsStrExt;
use std::ptr;
use std::time::Duration;

use windows_sys::Win32::Foundation::GetLastError;
use windows_sys::Win32::System::Services::{
    CloseServiceHandle, ControlService, CreateServiceW, DeleteService, OpenSCManagerW,
    OpenServiceW, QueryServiceStatusEx, SC_HANDLE, SC_MANAGER_CONNECT, SC_MANAGER_CREATE_SERVICE,
    SC_STATUS_PROCESS_INFO, SERVICE_CONTROL_STOP, SERVICE_DEMAND_START, SERVICE_ERROR_NORMAL,
    SERVICE_KERNEL_DRIVER, SERVICE_STATUS, SERVICE_STATUS_PROCESS, StartServiceW,
};

use super::{
    ErrorControl, ManagerAccess, ServiceAccess, ServiceConfig, ServiceControlManager,
    ServiceHandle, ServiceManager, ServiceState, ServiceStatus, ServiceType, StartType,
};
use crate::status::Win32Error;

fn wide(s: &OsStr) -> Vec<u16> {
    s.encode_wide().chain(std::iter::once(0)).collect()
}

fn last_error() -> Win32Error {
    // SAFETY: reads the calling thread's last-error value.
    Win32Error::from_raw(unsafe { GetLastError() })
}

/// Owned `SC_HANDLE`, closed on drop.
struct ScHandle(SC_HANDLE);

// SAFETY: service handles are not tied to the creating thread.
unsafe impl Send for ScHandle {}
unsafe impl Sync for ScHandle {}

impl ScHandle {
    fn from_raw(handle: SC_HANDLE) -> Result<Self, Win32Error> {
        if handle.is_null() {
            Err(last_error())
        } else {
            Ok(Self(handle))
        }
    }
}

impl Drop for ScHandle {
    fn drop(&mut self) {
        // SAFETY: the handle is valid and owned; it is closed exactly once.
        if unsafe { CloseServiceHandle(self.0) } == 0 {
            tracing::debug!(error = %last_error(), "CloseServiceHandle failed");
        }
    }
}

fn status_from(
    state: u32,
    checkpoint: u32,
    wait_hint_ms: u32,
) -> Result<ServiceStatus, Win32Error> {
    let state = ServiceState::from_raw(state).ok_or(Win32Error::INVALID_DATA)?;
    Ok(ServiceStatus {
        state,
        wait_hint: Duration::from_millis(u64::from(wait_hint_ms)),
        checkpoint,
    })
}

/// The local machine's service control manager.
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowsScm;

impl ServiceControlManager for WindowsScm {
    type Manager = WindowsServiceManager;

    fn connect(&self, access: ManagerAccess) -> Result<WindowsServiceManager, Win32Error> {
        let rights = match access {
            ManagerAccess::Connect => SC_MANAGER_CONNECT,
            ManagerAccess::CreateService => SC_MANAGER_CONNECT | SC_MANAGER_CREATE_SERVICE,
        };
        // SAFETY: null machine and database names select the local active database.
        let handle = unsafe { OpenSCManagerW(ptr::null(), ptr::null(), rights) };
        Ok(WindowsServiceManager {
            handle: ScHandle::from_raw(handle)?,
        })
    }
}

pub struct WindowsServiceManager {
    handle: ScHandle,
}

impl ServiceManager for WindowsServiceManager {
    type Service = WindowsService;

    fn create_service(
        &self,
        config: &ServiceConfig,
        access: ServiceAccess,
    ) -> Result<WindowsService, Win32Error> {
        let name = wide(OsStr::new(&config.name));
        let display_name = wide(OsStr::new(&config.display_name));
        let binary_path = wide(config.binary_path.as_os_str());

        let service_type = match config.service_type {
            ServiceType::KernelDriver => SERVICE_KERNEL_DRIVER,
        };
        let start_type = match config.start_type {
            StartType::Demand => SERVICE_DEMAND_START,
        };
        let error_control = match config.error_control {
            ErrorControl::Normal => SERVICE_ERROR_NORMAL,
        };

        // SAFETY: every string is NUL-terminated and outlives the call; optional
        // parameters are null.
        let handle = unsafe {
            CreateServiceW(
                self.handle.0,
                name.as_ptr(),
                display_name.as_ptr(),
                access.bits(),
                service_type,
                start_type,
                error_control,
                binary_path.as_ptr(),
                ptr::null(),
                ptr::null_mut(),
                ptr::null(),
                ptr::null(),
                ptr::null(),
            )
        };
        Ok(WindowsService {
            handle: ScHandle::from_raw(handle)?,
        })
    }

    fn open_service(
        &self,
        name: &str,
        access: ServiceAccess,
    ) -> Result<WindowsService, Win32Error> {
        let name = wide(OsStr::new(name));
        // SAFETY: `name` is NUL-terminated and outlives the call.
        let handle = unsafe { OpenServiceW(self.handle.0, name.as_ptr(), access.bits()) };
        Ok(WindowsService {
            handle: ScHandle::from_raw(handle)?,
        })
    }
}

pub struct WindowsService {
    handle: ScHandle,
}

impl ServiceHandle for WindowsService {
    fn query_status(&self) -> Result<ServiceStatus, Win32Error> {
        // SAFETY: SERVICE_STATUS_PROCESS is plain data; all-zero is valid.
        let mut status: SERVICE_STATUS_PROCESS = unsafe { std::mem::zeroed() };
        let mut needed: u32 = 0;
        // SAFETY: the buffer is a SERVICE_STATUS_PROCESS of the size passed.
        let ok = unsafe {
            QueryServiceStatusEx(
                self.handle.0,
                SC_STATUS_PROCESS_INFO,
                (&mut status as *mut SERVICE_STATUS_PROCESS).cast::<u8>(),
                std::mem::size_of::<SERVICE_STATUS_PROCESS>() as u32,
                &mut needed,
            )
        };
        if ok == 0 {
            return Err(last_error());
        }
        status_from(status.dwCurrentState, status.dwCheckPoint, status.dwWaitHint)
    }

    fn start(&self) -> Result<(), Win32Error> {
        // SAFETY: no arguments are passed.
        if unsafe { StartServiceW(self.handle.0, 0, ptr::null()) } == 0 {
            return Err(last_error());
        }
        Ok(())
    }

    fn stop(&self) -> Result<ServiceStatus, Win32Error> {
        // SAFETY: SERVICE_STATUS is plain data; all-zero is valid.
        let mut status: SERVICE_STATUS = unsafe { std::mem::zeroed() };
        // SAFETY: `status` is a valid out pointer for the duration of the call.
        if unsafe { ControlService(self.handle.0, SERVICE_CONTROL_STOP, &mut status) } == 0 {
            return Err(last_error());
        }
        status_from(status.dwCurrentState, status.dwCheckPoint, status.dwWaitHint)
    }

    fn delete(&self) -> Result<(), Win32Error> {
        // SAFETY: the handle was opened with DELETE access.
        if unsafe { DeleteService(self.handle.0) } == 0 {
            return Err(last_error());
        }
        Ok(())
    }
}
