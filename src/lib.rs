//! Gatemap (lib.rs)
//!
//! UPnP gateway discovery and port-mapping coordination for user-space
//! tunnels: find Internet Gateway Devices on the local network, keep their
//! advertisements fresh, and drive their WAN connection services.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod device;
pub mod error;
pub mod mapper;
pub mod transport;
pub mod xml;

// Re-export the main types
pub use device::{UpnpDevice, UpnpService};
pub use error::{UpnpError, UpnpResult};
pub use mapper::{MapperConfig, PortMapper};
pub use mapper::{
    INTERNET_GATEWAY_DEVICE, WAN_DEVICE, WAN_IP_CONNECTION, WAN_PPP_CONNECTION,
};
pub use transport::{
    ControlPoint, DiscoveryEvent, DiscoveryEventKind, EventSink, SsdpControlPoint,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging system with custom configuration
///
/// # Arguments
/// * `level` - Log level (trace/debug/info/warn/error)
///
/// # Example
/// ```
/// gatemap::init_logging("info");
/// ```
///
pub fn init_logging(level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
        // Reduce verbosity of some dependencies
        .add_directive("tokio=warn".parse().unwrap())
        .add_directive("runtime=warn".parse().unwrap())
        .add_directive("hyper=warn".parse().unwrap())
        .add_directive("reqwest=warn".parse().unwrap());

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(true),
        )
        .with(filter)
        .init();
}
