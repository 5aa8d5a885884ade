// src/engine.rs - Per-unit resolution cycle
//
// One `UnitEngine` per compressor unit. Each tick:
//   1. apply queued operator commands and configuration reloads
//   2. purge expired manual entries, take one view of every register cache
//   3. decode registers whose samples are new since the last tick
//   4. resolve parameters in dependency order
//   5. evaluate alarms against this tick's values
//   6. publish one immutable snapshot
// A tick is synchronous and never interrupted; stopping waits for it.

use crate::alarms::{AlarmEvaluator, AlarmEvent, AlarmState, ShutdownLatch};
use crate::cache::{ManualEntry, ManualEntryBook, RegisterCache, RegisterKey};
use crate::config::UnitConfig;
use crate::error::{EngineError, Result};
use crate::register::decode;
use crate::resolver::{RegisterReading, ResolveContext, SourceResolver};
use crate::value::ResolvedValue;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

#[cfg(feature = "metrics")]
use metrics::{counter, gauge, histogram};

/// Queued operator commands per unit
const COMMAND_BUFFER: usize = 256;

// ============================================================================
// SNAPSHOT AND STATS
// ============================================================================

/// Everything a subscriber sees for one tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitSnapshot {
    pub unit_id: String,
    /// 1 for the first tick of the engine
    pub sequence: u64,
    /// Configuration generation the tick ran under
    pub generation: u64,
    /// Strictly increasing per unit
    pub timestamp: DateTime<Utc>,
    pub values: BTreeMap<String, ResolvedValue>,
    pub alarms: BTreeMap<String, AlarmState>,
    /// Transitions confirmed during this tick
    pub events: Vec<AlarmEvent>,
    pub shutdown: ShutdownLatch,
}

impl UnitSnapshot {
    pub fn value(&self, parameter: &str) -> Option<&ResolvedValue> {
        self.values.get(parameter)
    }

    pub fn alarm(&self, parameter: &str) -> Option<&AlarmState> {
        self.alarms.get(parameter)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct EngineStats {
    pub running: bool,
    pub ticks: u64,
    pub last_tick: Option<DateTime<Utc>>,
    pub last_tick_us: u64,
    pub max_tick_us: u64,
    pub bad_parameters: usize,
    pub active_alarms: usize,
    pub events_emitted: u64,
    pub config_generation: u64,
    pub shutdown: bool,
}

// ============================================================================
// COMMANDS AND HANDLE
// ============================================================================

enum EngineCommand {
    Reload {
        config: Arc<UnitConfig>,
        caches: HashMap<String, RegisterCache>,
    },
    Acknowledge {
        parameter: String,
        user: String,
    },
    SetEnabled {
        parameter: String,
        enabled: bool,
    },
    ResetShutdown {
        user: String,
    },
}

/// Clonable access to a unit engine for external collaborators
///
/// Commands are queued and take effect at the next tick boundary. Manual
/// entries are visible from the next tick on.
#[derive(Clone)]
pub struct EngineHandle {
    unit_id: String,
    config: Arc<RwLock<Arc<UnitConfig>>>,
    commands: mpsc::Sender<EngineCommand>,
    snapshots: broadcast::Sender<Arc<UnitSnapshot>>,
    latest: Arc<RwLock<Option<Arc<UnitSnapshot>>>>,
    manual: ManualEntryBook,
    stats: Arc<RwLock<EngineStats>>,
    stop_tx: Arc<watch::Sender<bool>>,
}

impl EngineHandle {
    pub fn unit_id(&self) -> &str {
        &self.unit_id
    }

    /// Snapshots published after this call
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<UnitSnapshot>> {
        self.snapshots.subscribe()
    }

    pub fn latest(&self) -> Option<Arc<UnitSnapshot>> {
        self.latest.read().clone()
    }

    pub fn stats(&self) -> EngineStats {
        self.stats.read().clone()
    }

    /// Configuration the engine is currently running
    pub fn config(&self) -> Arc<UnitConfig> {
        self.config.read().clone()
    }

    pub fn set_manual(&self, parameter: &str, entry: ManualEntry) -> Result<()> {
        self.require_parameter(parameter)?;
        self.manual.set(parameter, entry)
    }

    pub fn clear_manual(&self, parameter: &str) -> Result<Option<ManualEntry>> {
        self.require_parameter(parameter)?;
        Ok(self.manual.clear(parameter))
    }

    pub async fn acknowledge(&self, parameter: &str, user: &str) -> Result<()> {
        self.require_setpoint(parameter)?;
        self.send(EngineCommand::Acknowledge {
            parameter: parameter.to_string(),
            user: user.to_string(),
        })
        .await
    }

    pub async fn set_enabled(&self, parameter: &str, enabled: bool) -> Result<()> {
        self.require_setpoint(parameter)?;
        self.send(EngineCommand::SetEnabled {
            parameter: parameter.to_string(),
            enabled,
        })
        .await
    }

    pub async fn reset_shutdown(&self, user: &str) -> Result<()> {
        self.send(EngineCommand::ResetShutdown {
            user: user.to_string(),
        })
        .await
    }

    /// Swap configuration and register caches at the next tick boundary
    pub async fn reload(&self, config: Arc<UnitConfig>, caches: HashMap<String, RegisterCache>) -> Result<()> {
        if config.unit_id != self.unit_id {
            return Err(EngineError::UnknownUnit(config.unit_id.clone()));
        }
        for conn in &config.connections {
            if !caches.contains_key(&conn.name) {
                return Err(EngineError::Config(format!(
                    "unit '{}': no register cache for connection '{}'",
                    self.unit_id, conn.name
                )));
            }
        }
        self.send(EngineCommand::Reload { config, caches }).await
    }

    /// Ask the engine to stop after its current tick
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    async fn send(&self, command: EngineCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| EngineError::Channel(format!("engine for unit '{}' has stopped", self.unit_id)))
    }

    fn require_parameter(&self, parameter: &str) -> Result<()> {
        match self.config.read().parameter(parameter) {
            Some(_) => Ok(()),
            None => Err(EngineError::UnknownParameter(parameter.to_string())),
        }
    }

    fn require_setpoint(&self, parameter: &str) -> Result<()> {
        match self.config.read().setpoint(parameter) {
            Some(_) => Ok(()),
            None => Err(EngineError::UnknownParameter(parameter.to_string())),
        }
    }
}

// ============================================================================
// ENGINE
// ============================================================================

/// Resolution cycle of one unit; owns all mutable engine state
pub struct UnitEngine {
    config: Arc<UnitConfig>,
    shared_config: Arc<RwLock<Arc<UnitConfig>>>,
    generation: u64,
    caches: HashMap<String, RegisterCache>,
    manual: ManualEntryBook,
    resolver: SourceResolver,
    alarms: AlarmEvaluator,
    /// Register name to last good decode
    readings: HashMap<String, RegisterReading>,
    /// Register name to read time of the last sample processed
    seen: HashMap<String, DateTime<Utc>>,
    sequence: u64,
    last_timestamp: Option<DateTime<Utc>>,
    commands: mpsc::Receiver<EngineCommand>,
    snapshots: broadcast::Sender<Arc<UnitSnapshot>>,
    latest: Arc<RwLock<Option<Arc<UnitSnapshot>>>>,
    stats: Arc<RwLock<EngineStats>>,
    stop_rx: watch::Receiver<bool>,
}

impl UnitEngine {
    /// Build an engine reading the given per-connection caches
    ///
    /// `caches` is keyed by connection name and must cover every connection
    /// of `config`.
    pub fn new(
        config: Arc<UnitConfig>,
        caches: HashMap<String, RegisterCache>,
        snapshot_buffer: usize,
    ) -> Result<(Self, EngineHandle)> {
        for conn in &config.connections {
            if !caches.contains_key(&conn.name) {
                return Err(EngineError::Config(format!(
                    "unit '{}': no register cache for connection '{}'",
                    config.unit_id, conn.name
                )));
            }
        }

        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (snapshot_tx, _) = broadcast::channel(snapshot_buffer.max(1));
        let (stop_tx, stop_rx) = watch::channel(false);
        let shared_config = Arc::new(RwLock::new(config.clone()));
        let latest = Arc::new(RwLock::new(None));
        let manual = ManualEntryBook::new();
        let stats = Arc::new(RwLock::new(EngineStats {
            config_generation: 1,
            ..Default::default()
        }));

        let handle = EngineHandle {
            unit_id: config.unit_id.clone(),
            config: shared_config.clone(),
            commands: command_tx,
            snapshots: snapshot_tx.clone(),
            latest: latest.clone(),
            manual: manual.clone(),
            stats: stats.clone(),
            stop_tx: Arc::new(stop_tx),
        };

        let engine = Self {
            alarms: AlarmEvaluator::new(config.unit_id.clone(), &config.setpoints),
            config,
            shared_config,
            generation: 1,
            caches,
            manual,
            resolver: SourceResolver::new(),
            readings: HashMap::new(),
            seen: HashMap::new(),
            sequence: 0,
            last_timestamp: None,
            commands: command_rx,
            snapshots: snapshot_tx,
            latest,
            stats,
            stop_rx,
        };

        Ok((engine, handle))
    }

    pub fn unit_id(&self) -> &str {
        &self.config.unit_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Run one resolution cycle at wall-clock time `now`
    pub fn tick(&mut self, now: DateTime<Utc>) -> Arc<UnitSnapshot> {
        let started = Instant::now();

        while let Ok(command) = self.commands.try_recv() {
            self.apply(command, now);
        }

        let timestamp = match self.last_timestamp {
            Some(last) if now <= last => {
                debug!("[{}] clock did not advance, nudging tick timestamp", self.config.unit_id);
                last + Duration::milliseconds(1)
            }
            _ => now,
        };
        self.last_timestamp = Some(timestamp);

        self.manual.purge_expired(timestamp);
        let manual = self.manual.snapshot();

        self.ingest_registers();

        let mut resolved: HashMap<String, ResolvedValue> = HashMap::with_capacity(self.config.parameters.len());
        for chain in &self.config.parameters {
            let ctx = ResolveContext {
                registers: &self.readings,
                resolved: &resolved,
                manual: &manual,
            };
            let value = self.resolver.resolve(chain, timestamp, &ctx);
            resolved.insert(chain.parameter.clone(), value);
        }
        let values: BTreeMap<String, ResolvedValue> = resolved.into_iter().collect();

        let events = self.alarms.evaluate(&values, timestamp);

        self.sequence += 1;
        let snapshot = Arc::new(UnitSnapshot {
            unit_id: self.config.unit_id.clone(),
            sequence: self.sequence,
            generation: self.generation,
            timestamp,
            values,
            alarms: self.alarms.states(),
            events,
            shutdown: self.alarms.shutdown().clone(),
        });

        // No subscribers is not an error
        let _ = self.snapshots.send(snapshot.clone());
        *self.latest.write() = Some(snapshot.clone());

        self.record(&snapshot, started);
        snapshot
    }

    /// Decode registers whose cached sample is newer than the last one seen
    fn ingest_registers(&mut self) {
        for conn in &self.config.connections {
            let Some(cache) = self.caches.get(&conn.name) else {
                continue;
            };
            let view = cache.snapshot();

            for def in &conn.registers {
                let Some(sample) = view.get(&RegisterKey::new(def.function_code, def.address)) else {
                    continue;
                };
                if self.seen.get(&def.name) == Some(&sample.read_at) {
                    continue;
                }
                self.seen.insert(def.name.clone(), sample.read_at);

                if !sample.success {
                    // Transport failure: last good reading ages out on its own
                    trace!("[{}] {} read failed at {}", self.config.unit_id, def.name, sample.read_at);
                    continue;
                }

                match decode(&sample.words, def) {
                    Ok(value) => {
                        self.readings.insert(
                            def.name.clone(),
                            RegisterReading {
                                value,
                                read_at: sample.read_at,
                            },
                        );
                    }
                    Err(e) => {
                        debug!("[{}] {} decode failed: {}", self.config.unit_id, def.name, e);
                        self.readings.remove(&def.name);
                    }
                }
            }
        }
    }

    fn apply(&mut self, command: EngineCommand, now: DateTime<Utc>) {
        let result = match command {
            EngineCommand::Reload { config, caches } => {
                self.reload(config, caches);
                Ok(())
            }
            EngineCommand::Acknowledge { parameter, user } => self.alarms.acknowledge(&parameter, &user, now),
            EngineCommand::SetEnabled { parameter, enabled } => self.alarms.set_enabled(&parameter, enabled),
            EngineCommand::ResetShutdown { user } => {
                self.alarms.reset_shutdown(&user);
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!("[{}] command rejected: {}", self.config.unit_id, e);
        }
    }

    fn reload(&mut self, config: Arc<UnitConfig>, caches: HashMap<String, RegisterCache>) {
        // Keep readings only for registers whose definition is unchanged
        let old = self.config.clone();
        let unchanged = |name: &str| match (old.register(name), config.register(name)) {
            (Some((old_conn, old_def)), Some((new_conn, new_def))) => {
                old_conn.name == new_conn.name && old_def == new_def
            }
            _ => false,
        };
        self.readings.retain(|name, _| unchanged(name.as_str()));
        self.seen.retain(|name, _| unchanged(name.as_str()));
        self.resolver.retain(|name| config.parameter(name).is_some());
        self.alarms.reconfigure(&config.setpoints);

        self.caches = caches;
        self.generation += 1;
        *self.shared_config.write() = config.clone();
        self.config = config;

        info!(
            "[{}] configuration generation {} active ({} parameters, {} setpoints)",
            self.config.unit_id,
            self.generation,
            self.config.parameters.len(),
            self.config.setpoints.len()
        );
    }

    fn record(&self, snapshot: &UnitSnapshot, started: Instant) {
        let elapsed_us = started.elapsed().as_micros() as u64;
        let bad = snapshot.values.values().filter(|v| v.quality.is_bad()).count();
        let active = snapshot.alarms.values().filter(|a| a.is_active()).count();

        {
            let mut stats = self.stats.write();
            stats.ticks += 1;
            stats.last_tick = Some(snapshot.timestamp);
            stats.last_tick_us = elapsed_us;
            stats.max_tick_us = stats.max_tick_us.max(elapsed_us);
            stats.bad_parameters = bad;
            stats.active_alarms = active;
            stats.events_emitted += snapshot.events.len() as u64;
            stats.config_generation = self.generation;
            stats.shutdown = snapshot.shutdown.is_tripped();
        }

        #[cfg(feature = "metrics")]
        {
            counter!("gcs_engine_ticks_total").increment(1);
            histogram!("gcs_engine_tick_duration_seconds").record(elapsed_us as f64 / 1_000_000.0);
            gauge!("gcs_engine_bad_parameters").set(bad as f64);
            gauge!("gcs_engine_active_alarms").set(active as f64);
        }

        trace!(
            "[{}] tick {} in {}us: {} values, {} bad, {} events",
            snapshot.unit_id,
            snapshot.sequence,
            elapsed_us,
            snapshot.values.len(),
            bad,
            snapshot.events.len()
        );
    }

    /// Tick every `tick_interval` until stopped through the handle
    pub async fn run(mut self, tick_interval: std::time::Duration) {
        info!(
            "[{}] engine started, tick every {} ms",
            self.config.unit_id,
            tick_interval.as_millis()
        );
        self.stats.write().running = true;

        let mut ticker = interval(tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stop_rx = self.stop_rx.clone();

        if !*stop_rx.borrow_and_update() {
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.tick(Utc::now());
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        }

        self.stats.write().running = false;
        info!("[{}] engine stopped after {} ticks", self.config.unit_id, self.sequence);
    }

    pub fn spawn(self, tick_interval: std::time::Duration) -> JoinHandle<()> {
        tokio::spawn(self.run(tick_interval))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::RegisterSample;
    use crate::config::StationConfig;
    use crate::register::{encode, FunctionCode};
    use crate::value::Quality;

    const UNIT: &str = r#"
units:
  - unit_id: U1
    connections:
      - name: panel
        transport: { type: simulated }
        registers:
          - { name: suction_raw, address: 0, data_type: uint16, scale: 0.1, max_valid: 500 }
    parameters:
      - name: suction
        sources:
          - { type: modbus, priority: 1, register: suction_raw, stale_timeout_seconds: 5 }
          - { type: manual, priority: 2 }
      - name: doubled
        sources:
          - { type: calculated, priority: 1, formula: "suction * 2.0" }
    setpoints:
      - { parameter: suction, h: 100, deadband: 1, delay_seconds: 0 }
"#;

    fn setup() -> (UnitEngine, EngineHandle, RegisterCache) {
        let station = StationConfig::from_yaml(UNIT).unwrap();
        let config = station.unit("U1").unwrap();
        let cache = RegisterCache::new();
        let caches = HashMap::from([("panel".to_string(), cache.clone())]);
        let (engine, handle) = UnitEngine::new(config, caches, 8).unwrap();
        (engine, handle, cache)
    }

    fn feed(cache: &RegisterCache, engine: &UnitEngine, value: f64, at: DateTime<Utc>) {
        let (_, def) = engine.config.register("suction_raw").unwrap();
        cache.publish(vec![(
            RegisterKey::new(FunctionCode::HoldingRegisters, 0),
            RegisterSample::ok(encode(value, def), at),
        )]);
    }

    #[test]
    fn test_tick_resolves_in_dependency_order() {
        let (mut engine, _handle, cache) = setup();
        let t0 = Utc::now();
        feed(&cache, &engine, 42.0, t0);

        let snap = engine.tick(t0);
        assert_eq!(snap.sequence, 1);
        assert_eq!(snap.value("suction").unwrap().quality, Quality::Live);
        let doubled = snap.value("doubled").unwrap();
        assert_eq!(doubled.quality, Quality::Calculated);
        assert!((doubled.value - 84.0).abs() < 1e-9);
    }

    #[test]
    fn test_decode_failure_invalidates_reading_immediately() {
        let (mut engine, _handle, cache) = setup();
        let t0 = Utc::now();
        feed(&cache, &engine, 42.0, t0);
        engine.tick(t0);

        // 600.0 is above max_valid
        let t1 = t0 + Duration::seconds(1);
        cache.publish(vec![(
            RegisterKey::new(FunctionCode::HoldingRegisters, 0),
            RegisterSample::ok(vec![6000], t1),
        )]);
        let snap = engine.tick(t1);
        let suction = snap.value("suction").unwrap();
        assert_eq!(suction.quality, Quality::Bad);
        assert_eq!(suction.value, 42.0);
        assert_eq!(snap.value("doubled").unwrap().quality, Quality::Bad);
    }

    #[test]
    fn test_transport_failure_keeps_reading_until_stale() {
        let (mut engine, _handle, cache) = setup();
        let t0 = Utc::now();
        feed(&cache, &engine, 42.0, t0);
        engine.tick(t0);

        let key = RegisterKey::new(FunctionCode::HoldingRegisters, 0);
        cache.publish(vec![(key, RegisterSample::failed(t0 + Duration::seconds(1)))]);
        let snap = engine.tick(t0 + Duration::seconds(2));
        assert_eq!(snap.value("suction").unwrap().quality, Quality::Live);

        let snap = engine.tick(t0 + Duration::seconds(6));
        assert_eq!(snap.value("suction").unwrap().quality, Quality::Bad);
    }

    #[test]
    fn test_timestamps_strictly_increase() {
        let (mut engine, _handle, _cache) = setup();
        let t0 = Utc::now();
        let a = engine.tick(t0);
        let b = engine.tick(t0 - Duration::seconds(5));
        let c = engine.tick(t0);
        assert!(b.timestamp > a.timestamp);
        assert!(c.timestamp > b.timestamp);
        assert_eq!(c.sequence, 3);
    }

    #[tokio::test]
    async fn test_commands_apply_at_next_tick() {
        let (mut engine, handle, cache) = setup();
        let t0 = Utc::now();
        feed(&cache, &engine, 150.0, t0);
        let snap = engine.tick(t0);
        assert!(snap.alarm("suction").unwrap().is_active());

        handle.acknowledge("suction", "op").await.unwrap();
        assert!(!engine.alarms.state("suction").unwrap().acknowledged);
        let snap = engine.tick(t0 + Duration::seconds(1));
        assert!(snap.alarm("suction").unwrap().acknowledged);

        assert!(matches!(
            handle.acknowledge("doubled", "op").await,
            Err(EngineError::UnknownParameter(_))
        ));
    }

    #[tokio::test]
    async fn test_manual_entry_through_handle() {
        let (mut engine, handle, _cache) = setup();
        let t0 = Utc::now();
        handle
            .set_manual("suction", ManualEntry::new(12.0, t0).by("op"))
            .unwrap();
        let snap = engine.tick(t0);
        assert_eq!(snap.value("suction").unwrap().quality, Quality::Manual);
        assert!(matches!(
            handle.set_manual("nope", ManualEntry::new(1.0, t0)),
            Err(EngineError::UnknownParameter(_))
        ));
    }

    #[tokio::test]
    async fn test_subscribers_and_stats() {
        let (mut engine, handle, _cache) = setup();
        let mut rx = handle.subscribe();
        engine.tick(Utc::now());

        let snap = rx.recv().await.unwrap();
        assert_eq!(snap.unit_id, "U1");
        assert_eq!(handle.latest().unwrap().sequence, 1);

        let stats = handle.stats();
        assert_eq!(stats.ticks, 1);
        assert_eq!(stats.bad_parameters, 2);
        assert_eq!(stats.config_generation, 1);
    }
}
