//! Modbus TCP register source
//!
//! Connects lazily on the first read and drops the connection after any
//! transport error so the next poll reconnects.

use super::{RegisterSource, SourceError};
use crate::register::FunctionCode;
use async_trait::async_trait;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tracing::{debug, info, warn};

pub struct TcpSource {
    host: String,
    port: u16,
    slave_id: u8,
    ctx: Option<Context>,
}

impl TcpSource {
    pub fn new(host: String, port: u16, slave_id: u8) -> Self {
        Self {
            host,
            port,
            slave_id,
            ctx: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.ctx.is_some()
    }

    async fn connect(&mut self) -> Result<&mut Context, SourceError> {
        if self.ctx.is_none() {
            let addr = tokio::net::lookup_host((self.host.as_str(), self.port))
                .await?
                .next()
                .ok_or_else(|| SourceError::Disconnected(format!("cannot resolve {}", self.host)))?;
            let ctx = tcp::connect_slave(addr, Slave(self.slave_id)).await?;
            info!("Connected to Modbus device at {} (slave {})", addr, self.slave_id);
            self.ctx = Some(ctx);
        }
        self.ctx
            .as_mut()
            .ok_or_else(|| SourceError::Disconnected(self.host.clone()))
    }
}

fn bits_to_words(bits: Vec<bool>) -> Vec<u16> {
    bits.into_iter().map(u16::from).collect()
}

#[async_trait]
impl RegisterSource for TcpSource {
    async fn read(
        &mut self,
        function_code: FunctionCode,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, SourceError> {
        let ctx = self.connect().await?;

        let result = match function_code {
            FunctionCode::HoldingRegisters => ctx.read_holding_registers(address, count).await,
            FunctionCode::InputRegisters => ctx.read_input_registers(address, count).await,
            FunctionCode::Coils => ctx.read_coils(address, count).await.map(bits_to_words),
            FunctionCode::DiscreteInputs => ctx.read_discrete_inputs(address, count).await.map(bits_to_words),
        };

        match result {
            Ok(mut words) => {
                // Bit reads are padded to whole bytes
                if words.len() < count as usize {
                    return Err(SourceError::ShortRead {
                        expected: count as usize,
                        actual: words.len(),
                    });
                }
                words.truncate(count as usize);
                debug!("{}:{} fc={} @{} x{} ok", self.host, self.port, function_code.code(), address, count);
                Ok(words)
            }
            Err(e) => {
                warn!("Modbus read from {}:{} failed: {}", self.host, self.port, e);
                self.ctx = None;
                Err(SourceError::Io(e))
            }
        }
    }

    async fn close(&mut self) {
        if self.ctx.take().is_some() {
            info!("Closed Modbus connection to {}:{}", self.host, self.port);
        }
    }

    fn describe(&self) -> String {
        format!("modbus-tcp://{}:{}/{}", self.host, self.port, self.slave_id)
    }
}
