// src/protocols/simulated.rs - Random-walk register emulator
use super::{RegisterSource, SourceError};
use crate::register::{encode, DataType, FunctionCode, RegisterDefinition};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use tracing::trace;

/// Span used when a register has no valid range configured
const DEFAULT_SPAN: f64 = 100.0;

#[derive(Debug, Clone)]
struct SimulatedRegister {
    def: RegisterDefinition,
    value: f64,
    low: f64,
    high: f64,
}

impl SimulatedRegister {
    fn new(def: &RegisterDefinition) -> Self {
        let (low, high) = match (def.min_valid, def.max_valid) {
            (Some(lo), Some(hi)) => (lo, hi),
            (Some(lo), None) => (lo, lo + DEFAULT_SPAN),
            (None, Some(hi)) => (hi - DEFAULT_SPAN, hi),
            (None, None) => (0.0, DEFAULT_SPAN),
        };
        // Keep clear of the limits so float rounding never leaves the range
        let margin = (high - low) * 0.01;
        let (low, high) = (low + margin, high - margin);
        Self {
            def: def.clone(),
            value: if def.data_type == DataType::Bool { 0.0 } else { (low + high) / 2.0 },
            low,
            high,
        }
    }

    fn step(&mut self, rng: &mut StdRng, step_fraction: f64) {
        if self.def.data_type == DataType::Bool {
            if step_fraction > 0.0 && rng.gen_bool(step_fraction.min(1.0)) {
                self.value = if self.value == 0.0 { 1.0 } else { 0.0 };
            }
            return;
        }
        let span = self.high - self.low;
        if span <= 0.0 || step_fraction <= 0.0 {
            return;
        }
        let delta = rng.gen_range(-1.0..=1.0) * span * step_fraction;
        self.value = (self.value + delta).clamp(self.low, self.high);
    }
}

/// Emulates a device whose registers drift inside their valid ranges
///
/// Every read advances the registers it covers by one random step. Words
/// not backed by a configured register read as zero.
pub struct SimulatedSource {
    registers: BTreeMap<(FunctionCode, u16), SimulatedRegister>,
    rng: StdRng,
    step_fraction: f64,
    closed: bool,
}

impl SimulatedSource {
    pub fn new(registers: &[RegisterDefinition], seed: u64, step_fraction: f64) -> Self {
        Self {
            registers: registers
                .iter()
                .map(|def| ((def.function_code, def.address), SimulatedRegister::new(def)))
                .collect(),
            rng: StdRng::seed_from_u64(seed),
            step_fraction,
            closed: false,
        }
    }

    /// Pin a register to an engineering value
    pub fn set_value(&mut self, name: &str, value: f64) -> bool {
        match self.registers.values_mut().find(|r| r.def.name == name) {
            Some(reg) => {
                reg.value = value;
                true
            }
            None => false,
        }
    }

    pub fn value(&self, name: &str) -> Option<f64> {
        self.registers
            .values()
            .find(|r| r.def.name == name)
            .map(|r| r.value)
    }
}

#[async_trait]
impl RegisterSource for SimulatedSource {
    async fn read(
        &mut self,
        function_code: FunctionCode,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, SourceError> {
        if self.closed {
            return Err(SourceError::Closed);
        }

        let mut words = vec![0u16; count as usize];
        let start = address as usize;
        let end = start + count as usize;

        for ((fc, addr), reg) in self.registers.iter_mut() {
            let first = *addr as usize;
            if *fc != function_code || first < start || first >= end {
                continue;
            }
            reg.step(&mut self.rng, self.step_fraction);
            for (i, word) in encode(reg.value, &reg.def).into_iter().enumerate() {
                if let Some(slot) = words.get_mut(first - start + i) {
                    *slot = word;
                }
            }
        }

        trace!("simulated read fc={} @{} x{}", function_code.code(), address, count);
        Ok(words)
    }

    async fn close(&mut self) {
        self.closed = true;
    }

    fn describe(&self) -> String {
        format!("simulated({} registers)", self.registers.len())
    }
}
