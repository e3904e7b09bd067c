//! Monitor channel backed by the kernel driver's device file.
//!
//! Each captured device is opened read/write; ioctls are issued with
//! `DeviceIoControl` on tokio's blocking pool so that any number of URBs can
//! be in flight per device while the async session engine keeps running.
//! Closing the handle faults every URB still outstanding in the driver,
//! which is what session teardown relies on.

use std::fs::{File, OpenOptions};
use std::os::windows::io::AsRawHandle;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use windows_sys::Win32::System::IO::DeviceIoControl;

use crate::{check_output, ChannelError, DeviceChannel, OutputMode};

pub struct MonitorChannel {
    file: Arc<File>,
}

impl MonitorChannel {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self {
            file: Arc::new(file),
        })
    }
}

#[async_trait]
impl DeviceChannel for MonitorChannel {
    async fn submit_ioctl(
        &self,
        code: u32,
        buf: &mut [u8],
        output: OutputMode,
    ) -> Result<usize, ChannelError> {
        let file = self.file.clone();
        // The in/out block is copied onto the blocking pool and back; the
        // transfer buffer itself is referenced by address inside the record
        // and is written by the driver directly.
        let mut scratch = buf.to_vec();
        let want_output = output != OutputMode::None;
        let (scratch, produced) = tokio::task::spawn_blocking(move || {
            let mut returned: u32 = 0;
            let ok = unsafe {
                DeviceIoControl(
                    file.as_raw_handle() as _,
                    code,
                    scratch.as_ptr().cast(),
                    scratch.len() as u32,
                    if want_output {
                        scratch.as_mut_ptr().cast()
                    } else {
                        std::ptr::null_mut()
                    },
                    if want_output { scratch.len() as u32 } else { 0 },
                    &mut returned,
                    std::ptr::null_mut(),
                )
            };
            if ok == 0 {
                Err(std::io::Error::last_os_error())
            } else {
                Ok((scratch, returned as usize))
            }
        })
        .await
        .map_err(|join| ChannelError::Io(std::io::Error::other(join)))??;

        buf.copy_from_slice(&scratch);
        check_output(output, produced, buf.len())
    }
}
