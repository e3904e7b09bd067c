//! Interface to the USB monitor kernel driver.
//!
//! The monitor driver exposes each captured device as a device file that
//! accepts ioctls: one to submit an URB (the driver writes completion fields
//! back into the same record) and a handful of configuration requests that
//! must be observed by the driver to keep its device state consistent.
//!
//! The [`DeviceChannel`] trait is the crate's seam: the production
//! implementation ([`windows::MonitorChannel`]) calls `DeviceIoControl` on
//! the blocking pool, while [`sim::SimChannel`] is a scripted in-memory
//! double used by every behaviour test.

pub mod endpoints;
pub mod ioctl;
pub mod probe;
pub mod sim;
pub mod urb;
#[cfg(windows)]
pub mod windows;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("monitor ioctl failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("monitor produced {produced} bytes, expected exactly {expected}")]
    ShortOutput { produced: usize, expected: usize },
}

/// How much of the in/out block the driver is expected to write back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputMode {
    /// Input-only request; the driver produces no output block.
    None,
    /// The driver may produce up to the block's length.
    UpTo,
    /// The driver must produce exactly the block's length; anything else is
    /// a [`ChannelError::ShortOutput`].
    Exact,
}

/// Asynchronous ioctl primitive of one monitor device handle.
///
/// `buf` is handed to the driver as both the input and the output block;
/// on success the driver's write-back is visible in `buf` and the returned
/// value is the number of bytes it produced. Multiple submissions may be
/// outstanding on the same channel; completions arrive in driver order, not
/// submission order.
#[async_trait]
pub trait DeviceChannel: Send + Sync {
    async fn submit_ioctl(
        &self,
        code: u32,
        buf: &mut [u8],
        output: OutputMode,
    ) -> Result<usize, ChannelError>;
}

/// Applies [`OutputMode`] to a completed ioctl's produced byte count.
pub(crate) fn check_output(
    output: OutputMode,
    produced: usize,
    expected: usize,
) -> Result<usize, ChannelError> {
    match output {
        OutputMode::Exact if produced != expected => {
            Err(ChannelError::ShortOutput { produced, expected })
        }
        _ => Ok(produced),
    }
}
