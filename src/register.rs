// src/register.rs - Register definitions and the raw word decoder
//
// Decode order: raw words -> byte-order reassembly -> type reinterpretation
// -> value * scale + offset -> range check. Byte orders are a permutation
// table over big-endian byte positions, shared by decode and encode.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ============================================================================
// DEFINITION TYPES
// ============================================================================

/// Modbus read function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum FunctionCode {
    /// 0x01 - one word (0/1) per coil
    Coils,
    /// 0x02 - one word (0/1) per input
    DiscreteInputs,
    /// 0x03
    HoldingRegisters,
    /// 0x04
    InputRegisters,
}

impl FunctionCode {
    pub fn code(&self) -> u8 {
        match self {
            FunctionCode::Coils => 1,
            FunctionCode::DiscreteInputs => 2,
            FunctionCode::HoldingRegisters => 3,
            FunctionCode::InputRegisters => 4,
        }
    }

    /// Bit-addressed functions deliver booleans rather than words
    pub fn is_bit_access(&self) -> bool {
        matches!(self, FunctionCode::Coils | FunctionCode::DiscreteInputs)
    }
}

impl TryFrom<u8> for FunctionCode {
    type Error = String;

    fn try_from(code: u8) -> std::result::Result<Self, Self::Error> {
        match code {
            1 => Ok(FunctionCode::Coils),
            2 => Ok(FunctionCode::DiscreteInputs),
            3 => Ok(FunctionCode::HoldingRegisters),
            4 => Ok(FunctionCode::InputRegisters),
            other => Err(format!("unsupported Modbus function code {}", other)),
        }
    }
}

impl From<FunctionCode> for u8 {
    fn from(fc: FunctionCode) -> u8 {
        fc.code()
    }
}

impl Default for FunctionCode {
    fn default() -> Self {
        FunctionCode::HoldingRegisters
    }
}

/// Engineering data type carried by a register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    #[serde(alias = "UINT16")]
    Uint16,
    #[serde(alias = "INT16")]
    Int16,
    #[serde(alias = "UINT32")]
    Uint32,
    #[serde(alias = "INT32")]
    Int32,
    #[serde(alias = "FLOAT32")]
    Float32,
    #[serde(alias = "BOOL")]
    Bool,
}

impl DataType {
    /// Number of 16-bit words the type occupies
    pub fn word_count(&self) -> usize {
        match self {
            DataType::Uint16 | DataType::Int16 | DataType::Bool => 1,
            DataType::Uint32 | DataType::Int32 | DataType::Float32 => 2,
        }
    }

    pub fn width_bits(&self) -> u8 {
        (self.word_count() * 16) as u8
    }
}

impl Default for DataType {
    fn default() -> Self {
        DataType::Uint16
    }
}

/// Byte order of a register value on the wire
///
/// Letters name big-endian value bytes (A = most significant) in the order
/// they arrive. `AB`/`BA` apply to one word, the other four to two words.
///
/// # Examples
///
/// ```rust
/// use gcs_engine::register::ByteOrder;
///
/// let order: ByteOrder = "CDAB".parse()?;
/// assert_eq!(order.word_count(), 2);
/// assert!("ACBD".parse::<ByteOrder>().is_err());
/// # Ok::<(), gcs_engine::EngineError>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ByteOrder {
    AB,
    BA,
    ABCD,
    DCBA,
    CDAB,
    BADC,
}

impl ByteOrder {
    pub const ALL: [ByteOrder; 6] = [
        ByteOrder::AB,
        ByteOrder::BA,
        ByteOrder::ABCD,
        ByteOrder::DCBA,
        ByteOrder::CDAB,
        ByteOrder::BADC,
    ];

    /// Value byte position carried by each wire byte
    fn wire_layout(&self) -> &'static [usize] {
        match self {
            ByteOrder::AB => &[0, 1],
            ByteOrder::BA => &[1, 0],
            ByteOrder::ABCD => &[0, 1, 2, 3],
            ByteOrder::DCBA => &[3, 2, 1, 0],
            ByteOrder::CDAB => &[2, 3, 0, 1],
            ByteOrder::BADC => &[1, 0, 3, 2],
        }
    }

    pub fn word_count(&self) -> usize {
        self.wire_layout().len() / 2
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ByteOrder::AB => "AB",
            ByteOrder::BA => "BA",
            ByteOrder::ABCD => "ABCD",
            ByteOrder::DCBA => "DCBA",
            ByteOrder::CDAB => "CDAB",
            ByteOrder::BADC => "BADC",
        }
    }

    /// Natural (big-endian) order for a word count
    pub fn natural(word_count: usize) -> ByteOrder {
        if word_count == 2 {
            ByteOrder::ABCD
        } else {
            ByteOrder::AB
        }
    }
}

impl FromStr for ByteOrder {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        ByteOrder::ALL
            .iter()
            .copied()
            .find(|order| order.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| EngineError::Config(format!("unknown byte order '{}'", s)))
    }
}

impl TryFrom<String> for ByteOrder {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        s.parse::<ByteOrder>().map_err(|e| e.to_string())
    }
}

impl From<ByteOrder> for String {
    fn from(order: ByteOrder) -> String {
        order.as_str().to_string()
    }
}

impl fmt::Display for ByteOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable description of one field register
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterDefinition {
    /// Unique name within the unit, referenced by Modbus source candidates
    pub name: String,

    pub address: u16,

    #[serde(default)]
    pub function_code: FunctionCode,

    #[serde(default)]
    pub data_type: DataType,

    /// Defaults to the natural order of the data type width
    #[serde(default)]
    pub byte_order: Option<ByteOrder>,

    /// Bit to extract for `bool` registers; whole word non-zero otherwise
    #[serde(default)]
    pub bit_position: Option<u8>,

    #[serde(default = "default_scale", alias = "scale_factor")]
    pub scale: f64,

    #[serde(default)]
    pub offset: f64,

    #[serde(default)]
    pub min_valid: Option<f64>,

    #[serde(default)]
    pub max_valid: Option<f64>,

    /// Engineering unit (PSI, F, RPM)
    #[serde(default)]
    pub unit: Option<String>,

    #[serde(default)]
    pub description: Option<String>,
}

fn default_scale() -> f64 {
    1.0
}

impl RegisterDefinition {
    /// Minimal holding-register definition with natural byte order
    pub fn new(name: impl Into<String>, address: u16, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            address,
            function_code: FunctionCode::default(),
            data_type,
            byte_order: None,
            bit_position: None,
            scale: 1.0,
            offset: 0.0,
            min_valid: None,
            max_valid: None,
            unit: None,
            description: None,
        }
    }

    pub fn word_count(&self) -> usize {
        self.data_type.word_count()
    }

    pub fn effective_byte_order(&self) -> ByteOrder {
        self.byte_order
            .unwrap_or_else(|| ByteOrder::natural(self.word_count()))
    }

    /// Last address covered by the register
    pub fn end_address(&self) -> u32 {
        self.address as u32 + self.word_count() as u32 - 1
    }

    /// Reject definitions that could never decode correctly
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(EngineError::Config(format!("register '{}': {}", self.name, msg)));

        if self.name.trim().is_empty() {
            return Err(EngineError::Config(format!(
                "register at address {} has an empty name",
                self.address
            )));
        }
        if self.end_address() > u16::MAX as u32 {
            return fail(format!("{} words at address {} overrun the address space", self.word_count(), self.address));
        }
        let order = self.effective_byte_order();
        if order.word_count() != self.word_count() {
            return fail(format!(
                "byte order {} does not fit {}-bit type {:?}",
                order,
                self.data_type.width_bits(),
                self.data_type
            ));
        }
        if let Some(bit) = self.bit_position {
            if self.data_type != DataType::Bool {
                return fail(format!("bit_position set on non-bool type {:?}", self.data_type));
            }
            if bit > 15 {
                return fail(format!("bit_position {} outside 0..=15", bit));
            }
        }
        if self.function_code.is_bit_access() && self.data_type != DataType::Bool {
            return fail(format!(
                "function code {} delivers bits, data type must be bool",
                self.function_code.code()
            ));
        }
        if !self.scale.is_finite() || self.scale == 0.0 {
            return fail(format!("scale {} must be finite and non-zero", self.scale));
        }
        if !self.offset.is_finite() {
            return fail(format!("offset {} must be finite", self.offset));
        }
        if let (Some(min), Some(max)) = (self.min_valid, self.max_valid) {
            if min > max {
                return fail(format!("min_valid {} exceeds max_valid {}", min, max));
            }
        }
        Ok(())
    }
}

// ============================================================================
// DECODING
// ============================================================================

/// Per-sample decode failure; the sample is treated as not fresh
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("expected {expected} words, got {actual}")]
    WordCount { expected: usize, actual: usize },

    #[error("value {value} outside valid range [{min:?}, {max:?}]")]
    OutOfRange {
        value: f64,
        min: Option<f64>,
        max: Option<f64>,
    },

    #[error("decoded float is not finite")]
    NotFinite,
}

/// Reorder wire words into a big-endian integer according to `order`
fn reassemble(words: &[u16], order: ByteOrder) -> u32 {
    let layout = order.wire_layout();
    let mut value_bytes = [0u8; 4];
    for (i, word) in words.iter().enumerate() {
        let [hi, lo] = word.to_be_bytes();
        value_bytes[layout[2 * i]] = hi;
        value_bytes[layout[2 * i + 1]] = lo;
    }
    match layout.len() {
        2 => u16::from_be_bytes([value_bytes[0], value_bytes[1]]) as u32,
        _ => u32::from_be_bytes(value_bytes),
    }
}

/// Split a big-endian integer into wire words according to `order`
fn disassemble(raw: u32, order: ByteOrder) -> Vec<u16> {
    let layout = order.wire_layout();
    let value_bytes: Vec<u8> = match layout.len() {
        2 => (raw as u16).to_be_bytes().to_vec(),
        _ => raw.to_be_bytes().to_vec(),
    };
    layout
        .chunks(2)
        .map(|pair| u16::from_be_bytes([value_bytes[pair[0]], value_bytes[pair[1]]]))
        .collect()
}

/// Decode a raw word block into an engineering value
///
/// Pure function over its inputs. Out-of-range results are failures, not
/// clamped values, so the resolver can fall back to the next source.
///
/// # Examples
///
/// ```rust
/// use gcs_engine::register::{decode, ByteOrder, DataType, RegisterDefinition};
///
/// let mut def = RegisterDefinition::new("stg1_discharge_temp", 100, DataType::Float32);
/// def.byte_order = Some(ByteOrder::CDAB);
///
/// let value = decode(&[0xE979, 0x42F6], &def).unwrap();
/// assert!((value - 123.456).abs() < 1e-4);
/// ```
pub fn decode(raw: &[u16], def: &RegisterDefinition) -> std::result::Result<f64, DecodeError> {
    let expected = def.word_count();
    if raw.len() != expected {
        return Err(DecodeError::WordCount {
            expected,
            actual: raw.len(),
        });
    }

    let bits = reassemble(raw, def.effective_byte_order());

    let value = match def.data_type {
        DataType::Bool => {
            let set = match def.bit_position {
                Some(bit) => (bits >> bit) & 1 == 1,
                None => bits != 0,
            };
            if set { 1.0 } else { 0.0 }
        }
        DataType::Uint16 => (bits as u16) as f64 * def.scale + def.offset,
        DataType::Int16 => (bits as u16 as i16) as f64 * def.scale + def.offset,
        DataType::Uint32 => bits as f64 * def.scale + def.offset,
        DataType::Int32 => (bits as i32) as f64 * def.scale + def.offset,
        DataType::Float32 => {
            let f = f32::from_bits(bits);
            if !f.is_finite() {
                return Err(DecodeError::NotFinite);
            }
            f as f64 * def.scale + def.offset
        }
    };

    let below = def.min_valid.map_or(false, |min| value < min);
    let above = def.max_valid.map_or(false, |max| value > max);
    if below || above {
        return Err(DecodeError::OutOfRange {
            value,
            min: def.min_valid,
            max: def.max_valid,
        });
    }

    Ok(value)
}

/// Encode an engineering value into the words a device would present
///
/// Inverse of [`decode`]. Integer types round to the nearest raw count and
/// saturate at the type bounds.
pub fn encode(value: f64, def: &RegisterDefinition) -> Vec<u16> {
    let raw_f = (value - def.offset) / def.scale;
    let bits: u32 = match def.data_type {
        DataType::Bool => {
            if value != 0.0 {
                1u32 << def.bit_position.unwrap_or(0)
            } else {
                0
            }
        }
        DataType::Uint16 => raw_f.round().clamp(0.0, u16::MAX as f64) as u16 as u32,
        DataType::Int16 => raw_f.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16 as u16 as u32,
        DataType::Uint32 => raw_f.round().clamp(0.0, u32::MAX as f64) as u32,
        DataType::Int32 => raw_f.round().clamp(i32::MIN as f64, i32::MAX as f64) as i32 as u32,
        DataType::Float32 => (raw_f as f32).to_bits(),
    };
    disassemble(bits, def.effective_byte_order())
}
