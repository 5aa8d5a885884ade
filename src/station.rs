// src/station.rs - Pollers and engines for every unit of a station
use crate::config::{EngineSettings, UnitConfig, ValidatedStation};
use crate::engine::{EngineHandle, UnitEngine};
use crate::error::{EngineError, Result};
use crate::poller::{PollWorker, PollerHandle, PollerStatus};
use crate::protocols::open_source;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[cfg(feature = "metrics")]
use metrics::{counter, histogram};

struct RunningUnit {
    handle: EngineHandle,
    pollers: HashMap<String, PollerHandle>,
    task: JoinHandle<()>,
}

impl RunningUnit {
    async fn start(config: Arc<UnitConfig>, settings: &EngineSettings) -> Result<Self> {
        let mut pollers = HashMap::new();
        for conn in &config.connections {
            match PollWorker::spawn(config.unit_id.clone(), conn.clone()) {
                Ok(poller) => {
                    pollers.insert(conn.name.clone(), poller);
                }
                Err(e) => {
                    stop_pollers(pollers).await;
                    return Err(e);
                }
            }
        }

        let caches = pollers
            .iter()
            .map(|(name, poller)| (name.clone(), poller.cache()))
            .collect();
        let (engine, handle) = match UnitEngine::new(config, caches, settings.snapshot_buffer) {
            Ok(built) => built,
            Err(e) => {
                stop_pollers(pollers).await;
                return Err(e);
            }
        };
        let task = engine.spawn(Duration::from_millis(settings.tick_interval_ms));

        Ok(Self {
            handle,
            pollers,
            task,
        })
    }

    async fn stop(self) {
        let unit_id = self.handle.unit_id().to_string();
        self.handle.stop();
        if let Err(e) = self.task.await {
            error!("[{}] engine task ended abnormally: {}", unit_id, e);
        }
        stop_pollers(self.pollers).await;
    }
}

async fn stop_pollers(pollers: HashMap<String, PollerHandle>) {
    futures::future::join_all(pollers.into_values().map(PollerHandle::stop)).await;
}

/// Every running unit of one station
pub struct Station {
    settings: EngineSettings,
    units: BTreeMap<String, RunningUnit>,
}

impl Station {
    /// Spawn pollers and an engine per unit; requires a Tokio runtime
    pub async fn start(station: ValidatedStation) -> Result<Self> {
        let mut running = Self {
            settings: station.engine.clone(),
            units: BTreeMap::new(),
        };

        for unit in station.units {
            match RunningUnit::start(unit.clone(), &running.settings).await {
                Ok(started) => {
                    info!(
                        "[{}] started with {} connections and {} parameters",
                        unit.unit_id,
                        unit.connections.len(),
                        unit.parameters.len()
                    );
                    running.units.insert(unit.unit_id.clone(), started);
                }
                Err(e) => {
                    running.stop().await;
                    return Err(e);
                }
            }
        }

        Ok(running)
    }

    pub fn handle(&self, unit_id: &str) -> Result<EngineHandle> {
        self.units
            .get(unit_id)
            .map(|u| u.handle.clone())
            .ok_or_else(|| EngineError::UnknownUnit(unit_id.to_string()))
    }

    pub fn handles(&self) -> Vec<EngineHandle> {
        self.units.values().map(|u| u.handle.clone()).collect()
    }

    pub fn unit_ids(&self) -> Vec<String> {
        self.units.keys().cloned().collect()
    }

    pub fn poller_status(&self, unit_id: &str) -> Result<Vec<PollerStatus>> {
        let unit = self
            .units
            .get(unit_id)
            .ok_or_else(|| EngineError::UnknownUnit(unit_id.to_string()))?;
        let mut statuses: Vec<PollerStatus> = unit.pollers.values().map(|p| p.status()).collect();
        statuses.sort_by(|a, b| a.connection.cmp(&b.connection));
        Ok(statuses)
    }

    /// Apply an already validated station configuration
    ///
    /// New units and new pollers of surviving units are all started before
    /// the running station is touched. If any of them fails, everything
    /// started for this reload is stopped again and the station keeps its
    /// previous configuration. Surviving units keep their engines and alarm
    /// state. Engine settings apply to units started from now on.
    pub async fn reload(&mut self, station: ValidatedStation) -> Result<()> {
        let started = Instant::now();
        let settings = station.engine.clone();

        let mut added = BTreeMap::new();
        let mut staged = Vec::new();
        let mut failure = None;
        for config in station.units {
            match self.units.get(&config.unit_id) {
                Some(unit) => match stage_unit(unit, &config).await {
                    Ok(spawned) => staged.push((config, spawned)),
                    Err(e) => failure = Some(e),
                },
                None => match RunningUnit::start(config.clone(), &settings).await {
                    Ok(fresh) => {
                        added.insert(config.unit_id.clone(), fresh);
                    }
                    Err(e) => failure = Some(e),
                },
            }
            if failure.is_some() {
                break;
            }
        }

        if let Some(e) = failure {
            futures::future::join_all(added.into_values().map(RunningUnit::stop)).await;
            futures::future::join_all(staged.into_iter().map(|(_, spawned)| stop_pollers(spawned))).await;
            warn!("reload abandoned, station keeps its previous configuration: {}", e);
            return Err(e);
        }

        if settings.tick_interval_ms != self.settings.tick_interval_ms {
            warn!(
                "tick_interval_ms changed {} -> {}; running units keep their period",
                self.settings.tick_interval_ms, settings.tick_interval_ms
            );
        }
        self.settings = settings;

        let removed: Vec<String> = self
            .units
            .keys()
            .filter(|id| !staged.iter().any(|(config, _)| config.unit_id == **id))
            .cloned()
            .collect();
        for unit_id in removed {
            if let Some(unit) = self.units.remove(&unit_id) {
                info!("[{}] removed from configuration", unit_id);
                unit.stop().await;
            }
        }

        let mut failure = None;
        for (config, spawned) in staged {
            let Some(unit) = self.units.get_mut(&config.unit_id) else {
                continue;
            };
            if let Err(e) = commit_unit(unit, config, spawned).await {
                error!("[{}] reload not applied: {}", unit.handle.unit_id(), e);
                failure.get_or_insert(e);
            }
        }
        for (unit_id, fresh) in added {
            info!("[{}] added to configuration", unit_id);
            self.units.insert(unit_id, fresh);
        }

        #[cfg(feature = "metrics")]
        {
            counter!("gcs_config_reloads_total").increment(1);
            histogram!("gcs_config_reload_duration_seconds").record(started.elapsed().as_secs_f64());
        }

        match failure {
            Some(e) => Err(e),
            None => {
                info!("station configuration reloaded in {:?}", started.elapsed());
                Ok(())
            }
        }
    }

    /// Stop every engine, then every poller
    pub async fn stop(self) {
        let count = self.units.len();
        futures::future::join_all(self.units.into_values().map(RunningUnit::stop)).await;
        info!("station stopped ({} units)", count);
    }
}

/// Spawn the pollers a surviving unit gains and check changed transports
///
/// Nothing running is touched; on failure the pollers spawned so far are
/// stopped.
async fn stage_unit(unit: &RunningUnit, config: &UnitConfig) -> Result<HashMap<String, PollerHandle>> {
    let mut spawned = HashMap::new();
    for conn in &config.connections {
        let outcome = match unit.pollers.get(&conn.name) {
            Some(existing) if existing.connection() == *conn => continue,
            Some(_) => open_source(conn).map(drop),
            None => PollWorker::spawn(config.unit_id.clone(), conn.clone()).map(|poller| {
                spawned.insert(conn.name.clone(), poller);
            }),
        };
        if let Err(e) = outcome {
            stop_pollers(spawned).await;
            return Err(e);
        }
    }
    Ok(spawned)
}

/// Reconfigure a surviving unit's pollers, queue its engine reload and
/// retire the pollers it no longer uses
///
/// Transports were checked by `stage_unit`, so only a stopped engine fails
/// here.
async fn commit_unit(
    unit: &mut RunningUnit,
    config: Arc<UnitConfig>,
    spawned: HashMap<String, PollerHandle>,
) -> Result<()> {
    for conn in &config.connections {
        if let Some(existing) = unit.pollers.get(&conn.name) {
            if existing.connection() != *conn {
                existing.reconfigure(conn.clone())?;
            }
        }
    }
    unit.pollers.extend(spawned);

    let caches = config
        .connections
        .iter()
        .filter_map(|conn| unit.pollers.get(&conn.name).map(|p| (conn.name.clone(), p.cache())))
        .collect();
    unit.handle.reload(config.clone(), caches).await?;

    let stale: Vec<String> = unit
        .pollers
        .keys()
        .filter(|name| config.connection(name).is_none())
        .cloned()
        .collect();
    let retired = stale
        .iter()
        .filter_map(|name| unit.pollers.remove(name).map(|p| (name.clone(), p)))
        .collect();
    stop_pollers(retired).await;
    Ok(())
}
