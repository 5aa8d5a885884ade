// src/protocols/mod.rs - Register source interface
//
// A register source performs raw reads for one connection. The poll worker
// owns exactly one source at a time and replaces it when the connection's
// transport changes.

use crate::config::{ConnectionConfig, Transport};
use crate::error::Result;
use crate::register::FunctionCode;
use async_trait::async_trait;
use thiserror::Error;

pub mod simulated;

#[cfg(feature = "modbus-support")]
pub mod modbus;

pub use simulated::SimulatedSource;

#[cfg(feature = "modbus-support")]
pub use modbus::TcpSource;

/// Transport-level read failure; the affected registers are "not fresh"
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("read timed out after {0} ms")]
    Timeout(u64),

    #[error("not connected: {0}")]
    Disconnected(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("expected {expected} words, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    #[error("source closed")]
    Closed,
}

/// Raw word access to one device
///
/// Coil and discrete-input reads return one word per bit (0 or 1).
///
/// # Examples
///
/// ```rust
/// use async_trait::async_trait;
/// use gcs_engine::protocols::{RegisterSource, SourceError};
/// use gcs_engine::register::FunctionCode;
///
/// struct Constant(u16);
///
/// #[async_trait]
/// impl RegisterSource for Constant {
///     async fn read(&mut self, _fc: FunctionCode, _address: u16, count: u16) -> Result<Vec<u16>, SourceError> {
///         Ok(vec![self.0; count as usize])
///     }
///
///     async fn close(&mut self) {}
///
///     fn describe(&self) -> String {
///         "constant".into()
///     }
/// }
/// ```
#[async_trait]
pub trait RegisterSource: Send {
    /// Read `count` words starting at `address`
    async fn read(
        &mut self,
        function_code: FunctionCode,
        address: u16,
        count: u16,
    ) -> std::result::Result<Vec<u16>, SourceError>;

    /// Release the transport; later reads may reconnect or fail
    async fn close(&mut self);

    /// Short label for logs
    fn describe(&self) -> String;
}

/// Build the source a connection's transport asks for
pub fn open_source(config: &ConnectionConfig) -> Result<Box<dyn RegisterSource>> {
    match &config.transport {
        Transport::Simulated { seed, step_fraction } => Ok(Box::new(SimulatedSource::new(
            &config.registers,
            *seed,
            *step_fraction,
        ))),
        #[cfg(feature = "modbus-support")]
        Transport::Tcp { host, port } => Ok(Box::new(TcpSource::new(host.clone(), *port, config.slave_id))),
        #[cfg(not(feature = "modbus-support"))]
        Transport::Tcp { .. } => Err(crate::error::EngineError::Config(format!(
            "connection '{}': tcp transport requires the modbus-support feature",
            config.name
        ))),
    }
}
