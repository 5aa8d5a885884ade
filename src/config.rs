// src/config.rs - Station configuration: YAML documents and load-time validation
//
// A station file is parsed into raw serde structures, then validated into an
// immutable `ValidatedStation`. Validation either succeeds completely or the
// load fails; a failed reload never replaces the active configuration.

use crate::alarms::AlarmSetpoint;
use crate::error::{EngineError, Result};
use crate::formula::Formula;
use crate::register::RegisterDefinition;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

// ============================================================================
// STATION DOCUMENT
// ============================================================================

/// Station configuration as written in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationConfig {
    /// Orchestrator settings shared by every unit
    #[serde(default)]
    pub engine: EngineSettings,

    pub units: Vec<UnitDocument>,
}

/// Orchestrator runtime settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Resolution cycle period
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    /// Snapshots buffered per subscriber before the slowest one lags
    #[serde(default = "default_snapshot_buffer")]
    pub snapshot_buffer: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval(),
            snapshot_buffer: default_snapshot_buffer(),
        }
    }
}

/// One compressor unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitDocument {
    pub unit_id: String,

    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,

    #[serde(default)]
    pub parameters: Vec<ParameterDocument>,

    #[serde(default)]
    pub setpoints: Vec<AlarmSetpoint>,
}

/// A polled Modbus device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub name: String,

    pub transport: Transport,

    #[serde(default = "default_slave_id")]
    pub slave_id: u8,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,

    #[serde(default)]
    pub registers: Vec<RegisterDefinition>,
}

/// How a connection reaches its registers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transport {
    /// Modbus TCP (requires the `modbus-support` feature)
    Tcp {
        host: String,
        #[serde(default = "default_modbus_port")]
        port: u16,
    },
    /// Random-walk emulator producing values inside each register's valid range
    Simulated {
        #[serde(default)]
        seed: u64,
        /// Largest step per poll as a fraction of the valid span
        #[serde(default = "default_step_fraction")]
        step_fraction: f64,
    },
}

/// Parameter with its fallback chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterDocument {
    pub name: String,

    /// Engineering unit reported with the resolved value
    #[serde(default)]
    pub unit: Option<String>,

    pub sources: Vec<SourceDocument>,
}

/// One candidate of a fallback chain
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceDocument {
    Modbus {
        priority: u32,
        register: String,
        #[serde(default = "default_stale_timeout")]
        stale_timeout_seconds: f64,
    },
    Calculated {
        priority: u32,
        formula: String,
    },
    Manual {
        priority: u32,
        /// Age limit of an entry in addition to its `effective_until`
        #[serde(default)]
        stale_timeout_seconds: Option<f64>,
    },
    Default {
        priority: u32,
        value: f64,
    },
}

impl SourceDocument {
    pub fn priority(&self) -> u32 {
        match self {
            SourceDocument::Modbus { priority, .. }
            | SourceDocument::Calculated { priority, .. }
            | SourceDocument::Manual { priority, .. }
            | SourceDocument::Default { priority, .. } => *priority,
        }
    }
}

fn default_tick_interval() -> u64 { 1000 }
fn default_snapshot_buffer() -> usize { 64 }
fn default_slave_id() -> u8 { 1 }
fn default_poll_interval() -> u64 { 1000 }
fn default_timeout() -> u64 { 1000 }
fn default_modbus_port() -> u16 { 502 }
fn default_step_fraction() -> f64 { 0.02 }
fn default_stale_timeout() -> f64 { 30.0 }

// ============================================================================
// VALIDATED CONFIGURATION
// ============================================================================

/// Candidate source after validation
#[derive(Debug, Clone, PartialEq)]
pub enum SourceCandidate {
    Modbus {
        register: String,
        stale_timeout: Duration,
    },
    Calculated {
        formula: Formula,
    },
    Manual {
        stale_timeout: Option<Duration>,
    },
    Default {
        value: f64,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrioritizedSource {
    pub priority: u32,
    pub candidate: SourceCandidate,
}

/// Fallback chain of one parameter, sorted by ascending priority
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterChain {
    pub parameter: String,
    pub unit: Option<String>,
    pub sources: Vec<PrioritizedSource>,
}

impl ParameterChain {
    /// Parameters read by calculated candidates of this chain
    pub fn dependencies(&self) -> impl Iterator<Item = &str> {
        self.sources.iter().flat_map(|s| match &s.candidate {
            SourceCandidate::Calculated { formula } => formula
                .dependencies()
                .iter()
                .map(String::as_str)
                .collect::<Vec<&str>>(),
            _ => Vec::new(),
        })
    }
}

/// Immutable configuration of one unit, shared read-only for a reload cycle
#[derive(Debug, Clone)]
pub struct UnitConfig {
    pub unit_id: String,
    pub connections: Vec<ConnectionConfig>,
    /// Chains in dependency order: every calculated dependency precedes its reader
    pub parameters: Vec<ParameterChain>,
    pub setpoints: Vec<AlarmSetpoint>,
}

impl UnitConfig {
    pub fn parameter(&self, name: &str) -> Option<&ParameterChain> {
        self.parameters.iter().find(|p| p.parameter == name)
    }

    pub fn setpoint(&self, parameter: &str) -> Option<&AlarmSetpoint> {
        self.setpoints.iter().find(|s| s.parameter == parameter)
    }

    pub fn connection(&self, name: &str) -> Option<&ConnectionConfig> {
        self.connections.iter().find(|c| c.name == name)
    }

    /// Register and the connection that polls it
    pub fn register(&self, name: &str) -> Option<(&ConnectionConfig, &RegisterDefinition)> {
        self.connections.iter().find_map(|c| {
            c.registers
                .iter()
                .find(|r| r.name == name)
                .map(|r| (c, r))
        })
    }
}

/// Fully validated station
#[derive(Debug, Clone)]
pub struct ValidatedStation {
    pub engine: EngineSettings,
    pub units: Vec<Arc<UnitConfig>>,
}

impl ValidatedStation {
    pub fn unit(&self, unit_id: &str) -> Result<Arc<UnitConfig>> {
        self.units
            .iter()
            .find(|u| u.unit_id == unit_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownUnit(unit_id.to_string()))
    }
}

// ============================================================================
// LOADING
// ============================================================================

impl StationConfig {
    /// Parse and validate a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<ValidatedStation> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let station = Self::from_yaml(&text)?;
        info!(
            "Loaded station configuration from {} ({} units)",
            path.display(),
            station.units.len()
        );
        Ok(station)
    }

    pub fn from_yaml(text: &str) -> Result<ValidatedStation> {
        let doc: StationConfig = serde_yaml::from_str(text)?;
        doc.validate()
    }

    pub fn validate(&self) -> Result<ValidatedStation> {
        if self.engine.tick_interval_ms == 0 {
            return Err(EngineError::Config("engine.tick_interval_ms must be positive".into()));
        }
        if self.engine.snapshot_buffer == 0 {
            return Err(EngineError::Config("engine.snapshot_buffer must be positive".into()));
        }
        if self.units.is_empty() {
            return Err(EngineError::Config("station defines no units".into()));
        }

        let mut seen = HashSet::new();
        let mut units = Vec::with_capacity(self.units.len());
        for unit in &self.units {
            if !seen.insert(unit.unit_id.as_str()) {
                return Err(EngineError::Config(format!("duplicate unit '{}'", unit.unit_id)));
            }
            units.push(Arc::new(unit.validate()?));
        }

        Ok(ValidatedStation {
            engine: self.engine.clone(),
            units,
        })
    }
}

impl UnitDocument {
    pub fn validate(&self) -> Result<UnitConfig> {
        let unit_id = self.unit_id.trim();
        if unit_id.is_empty() {
            return Err(EngineError::Config("unit with empty unit_id".into()));
        }
        let fail = |msg: String| EngineError::Config(format!("unit '{}': {}", unit_id, msg));

        validate_connections(&self.connections).map_err(fail)?;

        let register_names: HashSet<&str> = self
            .connections
            .iter()
            .flat_map(|c| c.registers.iter().map(|r| r.name.as_str()))
            .collect();

        let mut chains = Vec::with_capacity(self.parameters.len());
        let mut names = HashSet::new();
        for param in &self.parameters {
            if param.name.trim().is_empty() {
                return Err(fail("parameter with empty name".into()));
            }
            if !names.insert(param.name.as_str()) {
                return Err(fail(format!("duplicate parameter '{}'", param.name)));
            }
            chains.push(build_chain(param, &register_names).map_err(fail)?);
        }

        for chain in &chains {
            for dep in chain.dependencies() {
                if dep == chain.parameter {
                    return Err(fail(format!("parameter '{}' reads itself", dep)));
                }
                if !names.contains(dep) {
                    return Err(fail(format!(
                        "parameter '{}' reads unknown parameter '{}'",
                        chain.parameter, dep
                    )));
                }
            }
        }

        let parameters = dependency_order(chains).map_err(fail)?;

        let mut setpoint_params = HashSet::new();
        for sp in &self.setpoints {
            if !setpoint_params.insert(sp.parameter.as_str()) {
                return Err(fail(format!("duplicate setpoint for '{}'", sp.parameter)));
            }
            if !names.contains(sp.parameter.as_str()) {
                return Err(fail(format!("setpoint for unknown parameter '{}'", sp.parameter)));
            }
            sp.validate().map_err(fail)?;
            if sp.has_overlapping_sides() {
                warn!(
                    "unit '{}': setpoint '{}' has overlapping low and high thresholds",
                    unit_id, sp.parameter
                );
            }
        }

        debug!(
            "unit '{}': {} connections, {} parameters, {} setpoints",
            unit_id,
            self.connections.len(),
            parameters.len(),
            self.setpoints.len()
        );

        Ok(UnitConfig {
            unit_id: unit_id.to_string(),
            connections: self.connections.clone(),
            parameters,
            setpoints: self.setpoints.clone(),
        })
    }
}

fn validate_connections(connections: &[ConnectionConfig]) -> std::result::Result<(), String> {
    let mut conn_names = HashSet::new();
    let mut register_names = HashSet::new();

    for conn in connections {
        if !conn_names.insert(conn.name.as_str()) {
            return Err(format!("duplicate connection '{}'", conn.name));
        }
        if conn.poll_interval_ms == 0 || conn.timeout_ms == 0 {
            return Err(format!(
                "connection '{}': poll_interval_ms and timeout_ms must be positive",
                conn.name
            ));
        }
        match &conn.transport {
            Transport::Tcp { host, .. } => {
                if host.trim().is_empty() {
                    return Err(format!("connection '{}': empty host", conn.name));
                }
                if !cfg!(feature = "modbus-support") {
                    return Err(format!(
                        "connection '{}': tcp transport requires the modbus-support feature",
                        conn.name
                    ));
                }
            }
            Transport::Simulated { step_fraction, .. } => {
                if !(0.0..=1.0).contains(step_fraction) {
                    return Err(format!(
                        "connection '{}': step_fraction {} outside 0..=1",
                        conn.name, step_fraction
                    ));
                }
            }
        }

        // Address ranges may not overlap within one function code
        let mut claimed: HashMap<(u8, u16), &str> = HashMap::new();
        for reg in &conn.registers {
            reg.validate().map_err(|e| e.to_string())?;
            if !register_names.insert(reg.name.as_str()) {
                return Err(format!("duplicate register '{}'", reg.name));
            }
            for addr in reg.address as u32..=reg.end_address() {
                let key = (reg.function_code.code(), addr as u16);
                if let Some(other) = claimed.insert(key, reg.name.as_str()) {
                    return Err(format!(
                        "connection '{}': registers '{}' and '{}' overlap at address {}",
                        conn.name, other, reg.name, addr
                    ));
                }
            }
        }
    }
    Ok(())
}

fn seconds(value: f64, what: &str) -> std::result::Result<Duration, String> {
    if !value.is_finite() || value < 0.0 {
        return Err(format!("{} {} must be a non-negative number of seconds", what, value));
    }
    Ok(Duration::milliseconds((value * 1000.0).round() as i64))
}

fn build_chain(
    param: &ParameterDocument,
    registers: &HashSet<&str>,
) -> std::result::Result<ParameterChain, String> {
    if param.sources.is_empty() {
        return Err(format!("parameter '{}' has no sources", param.name));
    }

    let mut sorted: Vec<&SourceDocument> = param.sources.iter().collect();
    sorted.sort_by_key(|s| s.priority());

    let mut sources = Vec::with_capacity(sorted.len());
    for (index, doc) in sorted.into_iter().enumerate() {
        let expected = index as u32 + 1;
        if doc.priority() != expected {
            return Err(format!(
                "parameter '{}': priorities must be unique and dense from 1 (expected {}, found {})",
                param.name,
                expected,
                doc.priority()
            ));
        }

        let candidate = match doc {
            SourceDocument::Modbus {
                register,
                stale_timeout_seconds,
                ..
            } => {
                if !registers.contains(register.as_str()) {
                    return Err(format!(
                        "parameter '{}' references unknown register '{}'",
                        param.name, register
                    ));
                }
                SourceCandidate::Modbus {
                    register: register.clone(),
                    stale_timeout: seconds(*stale_timeout_seconds, "stale_timeout_seconds")?,
                }
            }
            SourceDocument::Calculated { formula, .. } => SourceCandidate::Calculated {
                formula: Formula::parse(formula)
                    .map_err(|e| format!("parameter '{}': {}", param.name, e))?,
            },
            SourceDocument::Manual {
                stale_timeout_seconds,
                ..
            } => SourceCandidate::Manual {
                stale_timeout: stale_timeout_seconds
                    .map(|s| seconds(s, "stale_timeout_seconds"))
                    .transpose()?,
            },
            SourceDocument::Default { value, .. } => {
                if !value.is_finite() {
                    return Err(format!("parameter '{}': default value must be finite", param.name));
                }
                SourceCandidate::Default { value: *value }
            }
        };

        sources.push(PrioritizedSource {
            priority: expected,
            candidate,
        });
    }

    Ok(ParameterChain {
        parameter: param.name.clone(),
        unit: param.unit.clone(),
        sources,
    })
}

/// Order chains so that dependencies come first, keeping configuration
/// order among independent parameters. Fails on a dependency cycle.
fn dependency_order(mut pending: Vec<ParameterChain>) -> std::result::Result<Vec<ParameterChain>, String> {
    let mut ordered: Vec<ParameterChain> = Vec::with_capacity(pending.len());
    let mut placed: HashSet<String> = HashSet::new();

    while !pending.is_empty() {
        let ready = pending
            .iter()
            .position(|chain| chain.dependencies().all(|d| placed.contains(d)));

        match ready {
            Some(index) => {
                let chain = pending.remove(index);
                placed.insert(chain.parameter.clone());
                ordered.push(chain);
            }
            None => {
                let names: Vec<&str> = pending.iter().map(|c| c.parameter.as_str()).collect();
                return Err(format!(
                    "calculated parameters form a dependency cycle: {}",
                    names.join(", ")
                ));
            }
        }
    }

    Ok(ordered)
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATION: &str = r#"
engine:
  tick_interval_ms: 500
units:
  - unit_id: GCS-001
    connections:
      - name: panel
        transport:
          type: simulated
          seed: 7
        registers:
          - name: suction_raw
            address: 40001
            data_type: uint16
            scale: 0.1
            min_valid: 0
            max_valid: 500
          - name: discharge_raw
            address: 40002
            data_type: float32
            byte_order: CDAB
    parameters:
      - name: discharge_pressure
        unit: psig
        sources:
          - { type: modbus, priority: 1, register: discharge_raw }
          - { type: manual, priority: 2 }
          - { type: default, priority: 3, value: 0.0 }
      - name: ratio
        sources:
          - { type: calculated, priority: 1, formula: "(discharge_pressure + 14.696) / (suction_pressure + 14.696)" }
      - name: suction_pressure
        unit: psig
        sources:
          - { type: modbus, priority: 1, register: suction_raw, stale_timeout_seconds: 10 }
    setpoints:
      - parameter: discharge_pressure
        h: 1100
        hh: 1200
"#;

    #[test]
    fn test_load_orders_dependencies_first() {
        let station = StationConfig::from_yaml(STATION).unwrap();
        assert_eq!(station.engine.tick_interval_ms, 500);
        assert_eq!(station.engine.snapshot_buffer, 64);

        let unit = station.unit("GCS-001").unwrap();
        let order: Vec<&str> = unit.parameters.iter().map(|p| p.parameter.as_str()).collect();
        assert_eq!(order, vec!["discharge_pressure", "suction_pressure", "ratio"]);

        let suction = unit.parameter("suction_pressure").unwrap();
        assert_eq!(
            suction.sources[0].candidate,
            SourceCandidate::Modbus {
                register: "suction_raw".into(),
                stale_timeout: Duration::seconds(10),
            }
        );
        assert!(unit.register("discharge_raw").is_some());
        assert!(matches!(station.unit("GCS-404"), Err(EngineError::UnknownUnit(_))));
    }

    #[test]
    fn test_connection_defaults() {
        let station = StationConfig::from_yaml(STATION).unwrap();
        let conn = &station.units[0].connections[0];
        assert_eq!(conn.slave_id, 1);
        assert_eq!(conn.poll_interval_ms, 1000);
        assert_eq!(conn.timeout_ms, 1000);
        assert_eq!(conn.transport, Transport::Simulated { seed: 7, step_fraction: 0.02 });
    }

    #[test]
    fn test_duplicate_priority_rejected() {
        let yaml = STATION.replace("{ type: manual, priority: 2 }", "{ type: manual, priority: 1 }");
        let err = StationConfig::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("priorities must be unique"), "{}", err);
    }

    #[test]
    fn test_priority_gap_rejected() {
        let yaml = STATION.replace("{ type: default, priority: 3, value: 0.0 }", "{ type: default, priority: 4, value: 0.0 }");
        assert!(StationConfig::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_dependency_cycle_rejected() {
        let yaml = STATION.replace(
            "{ type: modbus, priority: 1, register: suction_raw, stale_timeout_seconds: 10 }",
            "{ type: calculated, priority: 1, formula: \"ratio * 2.0\" }",
        );
        let err = StationConfig::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("dependency cycle"), "{}", err);
    }

    #[test]
    fn test_unknown_register_and_byte_order_rejected() {
        let yaml = STATION.replace("register: discharge_raw }", "register: nope }");
        assert!(StationConfig::from_yaml(&yaml).is_err());

        let yaml = STATION.replace("byte_order: CDAB", "byte_order: ACBD");
        assert!(StationConfig::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_overlapping_registers_rejected() {
        // float32 at 40002 covers 40003
        let yaml = STATION.replace("address: 40001", "address: 40003");
        let err = StationConfig::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("overlap"), "{}", err);
    }

    #[test]
    fn test_duplicate_parameter_and_setpoint_rejected() {
        let yaml = STATION.replace("- name: ratio", "- name: suction_pressure");
        assert!(StationConfig::from_yaml(&yaml).is_err());

        let yaml = format!("{}      - parameter: discharge_pressure\n        h: 1000\n", STATION);
        let err = StationConfig::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate setpoint"), "{}", err);
    }

    #[test]
    fn test_inverted_thresholds_rejected() {
        let yaml = STATION.replace("h: 1100", "h: 1300");
        assert!(StationConfig::from_yaml(&yaml).is_err());
    }

    #[cfg(not(feature = "modbus-support"))]
    #[test]
    fn test_tcp_requires_feature() {
        let yaml = STATION.replace(
            "type: simulated\n          seed: 7",
            "type: tcp\n          host: 10.0.0.5",
        );
        let err = StationConfig::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("modbus-support"), "{}", err);
    }
}
