//! `DeviceIoControl` transport to the real KernelToy device object.

use std::ffi::c_void;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::windows::fs::OpenOptionsExt;
use std::os::windows::io::AsRawHandle;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use windows_sys::Win32::Storage::FileSystem::FILE_SHARE_DELETE;
use windows_sys::Win32::System::IO::DeviceIoControl;

use super::{ChannelAccess, ChannelError, ChannelOpener, ControlChannel};
use crate::bridge::protocol::DEVICE_PATH;

pub struct DeviceOpener {
    path: String,
}

impl Default for DeviceOpener {
    fn default() -> Self {
        Self::new(DEVICE_PATH)
    }
}

impl DeviceOpener {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ChannelOpener for DeviceOpener {
    async fn open(&self, access: ChannelAccess) -> Result<Box<dyn ControlChannel>, ChannelError> {
        let mut options = OpenOptions::new();
        options.read(true);
        if access == ChannelAccess::ReadWrite {
            options.write(true);
        }
        options.share_mode(FILE_SHARE_DELETE);

        let file = options.open(&self.path).map_err(|source| ChannelError::Open {
            path: self.path.clone(),
            source,
        })?;

        tracing::debug!(?access, path = %self.path, "Opened device");
        Ok(Box::new(DeviceChannel {
            file: Arc::new(file),
        }))
    }
}

pub struct DeviceChannel {
    file: Arc<File>,
}

#[async_trait]
impl ControlChannel for DeviceChannel {
    async fn device_io_control(
        &mut self,
        code: u32,
        input: &[u8],
        output_capacity: usize,
    ) -> Result<Bytes, ChannelError> {
        let file = Arc::clone(&self.file);
        let input = input.to_vec();

        let output = tokio::task::spawn_blocking(move || -> io::Result<Bytes> {
            let mut output = vec![0u8; output_capacity];
            let mut returned: u32 = 0;
            // SAFETY: both buffers outlive the synchronous call and their lengths
            // are passed alongside; no OVERLAPPED, so the call completes before
            // returning.
            let ok = unsafe {
                DeviceIoControl(
                    file.as_raw_handle(),
                    code,
                    input.as_ptr() as *const c_void,
                    input.len() as u32,
                    output.as_mut_ptr() as *mut c_void,
                    output_capacity as u32,
                    &mut returned,
                    std::ptr::null_mut(),
                )
            };
            if ok == 0 {
                return Err(io::Error::last_os_error());
            }
            output.truncate(returned as usize);
            Ok(Bytes::from(output))
        })
        .await
        .map_err(io::Error::other)??;

        Ok(output)
    }
}
