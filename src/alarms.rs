// src/alarms.rs - Multi-level alarm evaluation
//
// Each parameter with a setpoint gets two independent one-sided watchers:
// low (NORMAL, L, LL) and high (NORMAL, H, HH). A crossing becomes a
// candidate immediately and is confirmed after `delay_seconds` of continuous
// presence. Confirmed levels clear through the deadband with the same delay.

use crate::error::{EngineError, Result};
use crate::value::ResolvedValue;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::{error, info, warn};
use uuid::Uuid;

// ==========================================
// SECTION 1: SETPOINTS AND LEVELS
// ==========================================

/// Alarm limits of one parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmSetpoint {
    pub parameter: String,

    #[serde(default)]
    pub ll: Option<f64>,

    #[serde(default)]
    pub l: Option<f64>,

    #[serde(default)]
    pub h: Option<f64>,

    #[serde(default)]
    pub hh: Option<f64>,

    /// Margin a value must recross before a confirmed level clears
    #[serde(default = "default_deadband")]
    pub deadband: f64,

    /// Time a candidate level must persist before it is confirmed
    #[serde(default = "default_delay")]
    pub delay_seconds: f64,

    /// Critical confirmation trips the unit shutdown latch
    #[serde(default)]
    pub is_shutdown: bool,

    /// Confirmed levels hold until acknowledged
    #[serde(default)]
    pub is_latching: bool,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub description: Option<String>,
}

fn default_deadband() -> f64 { 1.0 }
fn default_delay() -> f64 { 5.0 }
fn default_true() -> bool { true }

impl AlarmSetpoint {
    pub fn new(parameter: impl Into<String>) -> Self {
        Self {
            parameter: parameter.into(),
            ll: None,
            l: None,
            h: None,
            hh: None,
            deadband: default_deadband(),
            delay_seconds: default_delay(),
            is_shutdown: false,
            is_latching: false,
            enabled: true,
            description: None,
        }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        let name = &self.parameter;
        for (label, value) in [("ll", self.ll), ("l", self.l), ("h", self.h), ("hh", self.hh)] {
            if let Some(v) = value {
                if !v.is_finite() {
                    return Err(format!("setpoint '{}': {} must be finite", name, label));
                }
            }
        }
        if !self.deadband.is_finite() || self.deadband < 0.0 {
            return Err(format!("setpoint '{}': deadband {} must be >= 0", name, self.deadband));
        }
        if !self.delay_seconds.is_finite() || self.delay_seconds < 0.0 {
            return Err(format!(
                "setpoint '{}': delay_seconds {} must be >= 0",
                name, self.delay_seconds
            ));
        }
        if let (Some(ll), Some(l)) = (self.ll, self.l) {
            if ll > l {
                return Err(format!("setpoint '{}': ll {} above l {}", name, ll, l));
            }
        }
        if let (Some(h), Some(hh)) = (self.h, self.hh) {
            if h > hh {
                return Err(format!("setpoint '{}': h {} above hh {}", name, h, hh));
            }
        }
        Ok(())
    }

    /// A value could sit in both a low and a high alarm band
    pub fn has_overlapping_sides(&self) -> bool {
        let low = [self.l, self.ll].into_iter().flatten().fold(None, |acc: Option<f64>, v| {
            Some(acc.map_or(v, |a| a.max(v)))
        });
        let high = [self.h, self.hh].into_iter().flatten().fold(None, |acc: Option<f64>, v| {
            Some(acc.map_or(v, |a| a.min(v)))
        });
        matches!((low, high), (Some(lo), Some(hi)) if lo >= hi)
    }

    pub fn delay(&self) -> Duration {
        Duration::milliseconds((self.delay_seconds * 1000.0).round() as i64)
    }

    fn limits(&self, side: Side) -> Limits {
        let thresholds = match side {
            Side::Low => [self.l, self.ll],
            Side::High => [self.h, self.hh],
        };
        Limits {
            thresholds,
            deadband: self.deadband,
            delay: self.delay(),
        }
    }
}

/// Reported alarm level of a parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlarmLevel {
    #[serde(rename = "NORMAL")]
    Normal,
    #[serde(rename = "L")]
    Low,
    #[serde(rename = "LL")]
    LowLow,
    #[serde(rename = "H")]
    High,
    #[serde(rename = "HH")]
    HighHigh,
}

impl AlarmLevel {
    /// 0 normal, 1 warning, 2 critical
    pub fn severity(&self) -> u8 {
        match self {
            AlarmLevel::Normal => 0,
            AlarmLevel::Low | AlarmLevel::High => 1,
            AlarmLevel::LowLow | AlarmLevel::HighHigh => 2,
        }
    }

    pub fn is_critical(&self) -> bool {
        self.severity() == 2
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmLevel::Normal => "NORMAL",
            AlarmLevel::Low => "L",
            AlarmLevel::LowLow => "LL",
            AlarmLevel::High => "H",
            AlarmLevel::HighHigh => "HH",
        }
    }
}

impl fmt::Display for AlarmLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ==========================================
// SECTION 2: ONE-SIDED WATCHER
// ==========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Severity {
    Normal,
    Warning,
    Critical,
}

impl Severity {
    const RAISABLE: [Severity; 2] = [Severity::Warning, Severity::Critical];
    const DESCENDING: [Severity; 2] = [Severity::Critical, Severity::Warning];

    fn index(self) -> usize {
        match self {
            Severity::Critical => 1,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Low,
    High,
}

impl Side {
    fn crosses(self, value: f64, threshold: f64) -> bool {
        match self {
            Side::High => value > threshold,
            Side::Low => value < threshold,
        }
    }

    /// Still inside the band of a confirmed level, deadband included
    fn holds(self, value: f64, threshold: f64, deadband: f64) -> bool {
        match self {
            Side::High => value > threshold - deadband,
            Side::Low => value < threshold + deadband,
        }
    }

    fn level(self, severity: Severity) -> AlarmLevel {
        match (self, severity) {
            (_, Severity::Normal) => AlarmLevel::Normal,
            (Side::Low, Severity::Warning) => AlarmLevel::Low,
            (Side::Low, Severity::Critical) => AlarmLevel::LowLow,
            (Side::High, Severity::Warning) => AlarmLevel::High,
            (Side::High, Severity::Critical) => AlarmLevel::HighHigh,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Limits {
    /// Warning, critical
    thresholds: [Option<f64>; 2],
    deadband: f64,
    delay: Duration,
}

impl Limits {
    fn threshold(&self, severity: Severity) -> Option<f64> {
        match severity {
            Severity::Normal => None,
            s => self.thresholds[s.index()],
        }
    }
}

#[derive(Debug, Clone)]
struct SideWatcher {
    side: Side,
    confirmed: Severity,
    /// Per raisable level: first tick of the current continuous crossing
    raise_since: [Option<DateTime<Utc>>; 2],
    /// Per level at or below `confirmed`: first tick of the current
    /// continuous stretch outside that level's band (deadband included)
    clear_since: [Option<DateTime<Utc>>; 2],
}

impl SideWatcher {
    fn new(side: Side) -> Self {
        Self {
            side,
            confirmed: Severity::Normal,
            raise_since: [None; 2],
            clear_since: [None; 2],
        }
    }

    fn reset_timers(&mut self) {
        self.raise_since = [None; 2];
        self.clear_since = [None; 2];
    }

    fn force_normal(&mut self) {
        self.confirmed = Severity::Normal;
        self.reset_timers();
    }

    /// Advance one tick; returns a confirmed (old, new) transition
    fn step(
        &mut self,
        value: f64,
        limits: &Limits,
        can_drop: bool,
        now: DateTime<Utc>,
    ) -> Option<(Severity, Severity)> {
        let side = self.side;
        let crossed = |s: Severity| limits.threshold(s).map_or(false, |t| side.crosses(value, t));
        let held = |s: Severity| {
            limits
                .threshold(s)
                .map_or(false, |t| side.holds(value, t, limits.deadband))
        };

        for s in Severity::RAISABLE {
            let raise = &mut self.raise_since[s.index()];
            if s > self.confirmed && crossed(s) {
                raise.get_or_insert(now);
            } else {
                *raise = None;
            }

            let clear = &mut self.clear_since[s.index()];
            if s <= self.confirmed && !held(s) {
                clear.get_or_insert(now);
            } else {
                *clear = None;
            }
        }

        let due = Severity::DESCENDING.into_iter().find(|s| {
            self.raise_since[s.index()].map_or(false, |since| now - since >= limits.delay)
        });
        if let Some(new) = due {
            let old = self.confirmed;
            self.confirmed = new;
            self.clear_since = [None; 2];
            for s in Severity::RAISABLE {
                if s <= new {
                    self.raise_since[s.index()] = None;
                }
            }
            return Some((old, new));
        }

        let settled = self.settled(limits, now);
        if settled < self.confirmed && can_drop {
            let old = self.confirmed;
            self.confirmed = settled;
            for s in Severity::RAISABLE {
                if s > settled {
                    self.clear_since[s.index()] = None;
                }
            }
            return Some((old, settled));
        }

        None
    }

    /// Highest level at or below `confirmed` whose clearing delay has not run out
    fn settled(&self, limits: &Limits, now: DateTime<Utc>) -> Severity {
        Severity::DESCENDING
            .into_iter()
            .filter(|s| *s <= self.confirmed && limits.threshold(*s).is_some())
            .find(|s| {
                self.clear_since[s.index()].map_or(true, |since| now - since < limits.delay)
            })
            .unwrap_or(Severity::Normal)
    }

    fn pending(&self) -> Option<PendingAlarm> {
        let raising = Severity::DESCENDING.into_iter().find_map(|s| {
            self.raise_since[s.index()].map(|since| PendingAlarm {
                level: self.side.level(s),
                since,
            })
        });
        raising.or_else(|| {
            if self.confirmed == Severity::Normal {
                return None;
            }
            let since = self.clear_since[self.confirmed.index()]?;
            let target = Severity::DESCENDING
                .into_iter()
                .filter(|s| *s < self.confirmed)
                .find(|s| self.clear_since[s.index()].is_none())
                .unwrap_or(Severity::Normal);
            Some(PendingAlarm {
                level: self.side.level(target),
                since,
            })
        })
    }

    fn level(&self) -> AlarmLevel {
        self.side.level(self.confirmed)
    }
}

// ==========================================
// SECTION 3: STATE, EVENTS, SHUTDOWN LATCH
// ==========================================

/// Candidate level awaiting its delay
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PendingAlarm {
    pub level: AlarmLevel,
    pub since: DateTime<Utc>,
}

/// Published alarm state of one parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmState {
    pub parameter: String,
    /// More severe of the two sides, high side on a tie
    pub level: AlarmLevel,
    pub high_level: AlarmLevel,
    pub low_level: AlarmLevel,
    pub pending: Option<PendingAlarm>,
    pub acknowledged: bool,
    pub acknowledged_by: Option<String>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub last_transition: Option<DateTime<Utc>>,
    pub enabled: bool,
    /// Value of the last good evaluation
    pub last_value: Option<f64>,
}

impl AlarmState {
    fn new(parameter: &str, enabled: bool) -> Self {
        Self {
            parameter: parameter.to_string(),
            level: AlarmLevel::Normal,
            high_level: AlarmLevel::Normal,
            low_level: AlarmLevel::Normal,
            pending: None,
            acknowledged: false,
            acknowledged_by: None,
            acknowledged_at: None,
            last_transition: None,
            enabled,
            last_value: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.level != AlarmLevel::Normal
    }
}

/// Confirmed level transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmEvent {
    pub id: Uuid,
    pub unit_id: String,
    pub parameter: String,
    pub old_level: AlarmLevel,
    pub new_level: AlarmLevel,
    pub value: f64,
    /// Threshold of the raised level, or of the cleared one
    pub setpoint: Option<f64>,
    pub timestamp: DateTime<Utc>,
    pub is_shutdown: bool,
}

impl AlarmEvent {
    pub fn is_raise(&self) -> bool {
        self.new_level.severity() > self.old_level.severity()
    }
}

/// One shutdown trip
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShutdownTrip {
    pub parameter: String,
    pub level: AlarmLevel,
    pub value: f64,
    pub at: DateTime<Utc>,
}

/// Unit shutdown flag; never clears on its own
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShutdownLatch {
    trips: Vec<ShutdownTrip>,
}

impl ShutdownLatch {
    pub fn is_tripped(&self) -> bool {
        !self.trips.is_empty()
    }

    pub fn trips(&self) -> &[ShutdownTrip] {
        &self.trips
    }

    fn trip(&mut self, trip: ShutdownTrip) {
        self.trips.push(trip);
    }

    fn reset(&mut self) -> Vec<ShutdownTrip> {
        std::mem::take(&mut self.trips)
    }
}

// ==========================================
// SECTION 4: EVALUATOR
// ==========================================

#[derive(Debug, Clone)]
struct ParameterAlarm {
    setpoint: AlarmSetpoint,
    high: SideWatcher,
    low: SideWatcher,
    state: AlarmState,
    both_sides_logged: bool,
}

impl ParameterAlarm {
    fn new(setpoint: AlarmSetpoint) -> Self {
        let state = AlarmState::new(&setpoint.parameter, setpoint.enabled);
        Self {
            setpoint,
            high: SideWatcher::new(Side::High),
            low: SideWatcher::new(Side::Low),
            state,
            both_sides_logged: false,
        }
    }

    fn refresh_state(&mut self) {
        let high = self.high.level();
        let low = self.low.level();
        self.state.high_level = high;
        self.state.low_level = low;
        self.state.level = if low.severity() > high.severity() { low } else { high };

        let pending = match (self.high.pending(), self.low.pending()) {
            (Some(h), Some(l)) if l.level.severity() > h.level.severity() => Some(l),
            (Some(h), _) => Some(h),
            (None, l) => l,
        };
        self.state.pending = pending;
    }
}

/// Alarm state machines of one unit
///
/// Owned by the unit engine and driven once per tick with that tick's
/// resolved values.
#[derive(Debug)]
pub struct AlarmEvaluator {
    unit_id: String,
    /// Configuration order, which is also event order within a tick
    alarms: Vec<ParameterAlarm>,
    index: HashMap<String, usize>,
    shutdown: ShutdownLatch,
}

impl AlarmEvaluator {
    pub fn new(unit_id: impl Into<String>, setpoints: &[AlarmSetpoint]) -> Self {
        let mut evaluator = Self {
            unit_id: unit_id.into(),
            alarms: Vec::new(),
            index: HashMap::new(),
            shutdown: ShutdownLatch::default(),
        };
        evaluator.reconfigure(setpoints);
        evaluator
    }

    /// Swap in new setpoints between ticks
    ///
    /// Parameters that stay configured keep their alarm state; enable flags
    /// return to their configured values.
    pub fn reconfigure(&mut self, setpoints: &[AlarmSetpoint]) {
        let mut previous: HashMap<String, ParameterAlarm> = self
            .alarms
            .drain(..)
            .map(|a| (a.setpoint.parameter.clone(), a))
            .collect();

        for sp in setpoints {
            let alarm = match previous.remove(&sp.parameter) {
                Some(mut existing) => {
                    existing.setpoint = sp.clone();
                    existing.state.enabled = sp.enabled;
                    if !sp.enabled {
                        existing.high.force_normal();
                        existing.low.force_normal();
                        existing.refresh_state();
                    }
                    existing
                }
                None => ParameterAlarm::new(sp.clone()),
            };
            self.alarms.push(alarm);
        }

        self.index = self
            .alarms
            .iter()
            .enumerate()
            .map(|(i, a)| (a.setpoint.parameter.clone(), i))
            .collect();
    }

    /// Evaluate every setpoint against this tick's values
    pub fn evaluate(
        &mut self,
        values: &BTreeMap<String, ResolvedValue>,
        now: DateTime<Utc>,
    ) -> Vec<AlarmEvent> {
        let mut events = Vec::new();

        for alarm in &mut self.alarms {
            let parameter = alarm.setpoint.parameter.clone();

            if !alarm.state.enabled {
                continue;
            }

            let value = match values.get(&parameter) {
                Some(v) if v.quality.is_good() => v.value,
                _ => {
                    // Hold confirmed levels, restart candidates
                    alarm.high.reset_timers();
                    alarm.low.reset_timers();
                    alarm.refresh_state();
                    continue;
                }
            };
            alarm.state.last_value = Some(value);

            let can_drop = !alarm.setpoint.is_latching || alarm.state.acknowledged;

            for side in [Side::High, Side::Low] {
                let limits = alarm.setpoint.limits(side);
                let watcher = match side {
                    Side::High => &mut alarm.high,
                    Side::Low => &mut alarm.low,
                };
                let Some((old, new)) = watcher.step(value, &limits, can_drop, now) else {
                    continue;
                };

                let old_level = side.level(old);
                let new_level = side.level(new);
                let raising = new > old;
                let setpoint = if raising {
                    limits.threshold(new)
                } else {
                    limits.threshold(old)
                };

                alarm.state.last_transition = Some(now);
                if raising {
                    alarm.state.acknowledged = false;
                    alarm.state.acknowledged_by = None;
                    alarm.state.acknowledged_at = None;
                }

                if raising {
                    warn!(
                        "[{}] {} {} -> {} at {} (limit {:?})",
                        self.unit_id, parameter, old_level, new_level, value, setpoint
                    );
                } else {
                    info!(
                        "[{}] {} {} -> {} at {}",
                        self.unit_id, parameter, old_level, new_level, value
                    );
                }

                if raising && new == Severity::Critical && alarm.setpoint.is_shutdown {
                    error!(
                        "[{}] SHUTDOWN tripped by {} {} at {}",
                        self.unit_id, parameter, new_level, value
                    );
                    self.shutdown.trip(ShutdownTrip {
                        parameter: parameter.clone(),
                        level: new_level,
                        value,
                        at: now,
                    });
                }

                #[cfg(feature = "metrics")]
                metrics::counter!("gcs_alarm_transitions_total").increment(1);

                events.push(AlarmEvent {
                    id: Uuid::new_v4(),
                    unit_id: self.unit_id.clone(),
                    parameter: parameter.clone(),
                    old_level,
                    new_level,
                    value,
                    setpoint,
                    timestamp: now,
                    is_shutdown: alarm.setpoint.is_shutdown,
                });
            }

            alarm.refresh_state();

            let both = alarm.state.high_level != AlarmLevel::Normal
                && alarm.state.low_level != AlarmLevel::Normal;
            if both && !alarm.both_sides_logged {
                warn!(
                    "[{}] {} is in alarm on both sides ({} and {}); check setpoint configuration",
                    self.unit_id, parameter, alarm.state.high_level, alarm.state.low_level
                );
            }
            alarm.both_sides_logged = both;
        }

        events
    }

    /// Enable or disable a setpoint; disabling forces NORMAL without events
    pub fn set_enabled(&mut self, parameter: &str, enabled: bool) -> Result<()> {
        let alarm = self.alarm_mut(parameter)?;
        if alarm.state.enabled == enabled {
            return Ok(());
        }
        alarm.state.enabled = enabled;
        if !enabled {
            alarm.high.force_normal();
            alarm.low.force_normal();
            alarm.refresh_state();
        }
        info!(
            "[{}] alarm for {} {}",
            self.unit_id,
            parameter,
            if enabled { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    /// Record an operator acknowledgement
    pub fn acknowledge(&mut self, parameter: &str, user: &str, now: DateTime<Utc>) -> Result<()> {
        let unit_id = self.unit_id.clone();
        let alarm = self.alarm_mut(parameter)?;
        alarm.state.acknowledged = true;
        alarm.state.acknowledged_by = Some(user.to_string());
        alarm.state.acknowledged_at = Some(now);
        info!("[{}] {} acknowledged by {}", unit_id, parameter, user);
        Ok(())
    }

    /// Clear the shutdown latch, returning the trips it held
    pub fn reset_shutdown(&mut self, user: &str) -> Vec<ShutdownTrip> {
        let trips = self.shutdown.reset();
        if !trips.is_empty() {
            warn!(
                "[{}] shutdown latch reset by {} ({} trips)",
                self.unit_id,
                user,
                trips.len()
            );
        }
        trips
    }

    pub fn shutdown(&self) -> &ShutdownLatch {
        &self.shutdown
    }

    pub fn state(&self, parameter: &str) -> Option<&AlarmState> {
        self.index.get(parameter).map(|&i| &self.alarms[i].state)
    }

    /// Copy of every alarm state for publication
    pub fn states(&self) -> BTreeMap<String, AlarmState> {
        self.alarms
            .iter()
            .map(|a| (a.setpoint.parameter.clone(), a.state.clone()))
            .collect()
    }

    fn alarm_mut(&mut self, parameter: &str) -> Result<&mut ParameterAlarm> {
        let index = *self
            .index
            .get(parameter)
            .ok_or_else(|| EngineError::UnknownParameter(parameter.to_string()))?;
        Ok(&mut self.alarms[index])
    }
}
