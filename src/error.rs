//! Error types for the gateway discovery and mapping subsystem.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Errors produced while discovering gateways or driving their services.
#[derive(Debug, Error)]
pub enum UpnpError {
    /// Malformed device description. Missing a UDN is the only hard parse
    /// validation; everything else degrades to empty strings.
    #[error("invalid UPnP device: {0}")]
    InvalidDevice(String),

    /// A SOAP action failed at the transport level.
    #[error("UPnP action '{action}' failed: {code} {reason}")]
    ActionFailed {
        /// Action name, e.g. `GetStatusInfo`.
        action: String,
        /// HTTP status or UPnP fault code.
        code: u16,
        /// Human-readable failure reason.
        reason: String,
    },

    /// Well-formed transport response missing an expected element.
    #[error("malformed UPnP response: missing {0}")]
    MalformedResponse(String),

    /// A discovery event carried a non-success error code.
    #[error("discovery error (code {0})")]
    Discovery(i32),

    /// The discovery transport could not be initialized. Fatal: without it
    /// the subsystem can never see a gateway.
    #[error("failed to register with discovery transport: {0}")]
    Registration(String),

    /// Network I/O failure in the transport.
    #[error("network I/O error: {0}")]
    Io(#[from] io::Error),

    /// HTTP failure while fetching a description or posting an action.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A fetched document or SOAP response was not parseable XML.
    #[error("XML parse error: {0}")]
    Xml(#[from] xmltree::ParseError),

    /// An operation exceeded its deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Result alias used throughout the crate.
pub type UpnpResult<T> = Result<T, UpnpError>;
