#![forbid(unsafe_code)]

//! USB/IP server daemon.
//!
//! Devices captured by the USB monitor driver are exported over TCP to
//! remote USB/IP clients (typically the Linux `vhci-hcd` driver). Each
//! accepted connection runs the handshake (device list / import) and, once a
//! device is claimed, hands the stream to the session engine which
//! multiplexes URBs between the socket and the driver.

mod config;
mod handshake;
mod metrics;
mod registry;
mod server;
mod session;
mod submit;

pub use config::Config;
pub use handshake::{serve_connection, ConnectionError};
pub use metrics::Metrics;
pub use registry::{
    export_probed_device, ClaimedDevice, DeviceRegistry, ExportError, ExportedDevice,
    RegistryError,
};
pub use server::{start_server, ServerHandle};
pub use session::{run_session, SessionError};
