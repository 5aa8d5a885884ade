// src/cache.rs - Shared inputs of the resolution cycle
//
// `RegisterCache`: one per connection, written by its poll worker only and
// read by the unit engine at tick start. Publishing swaps a whole map so a
// reader never sees half of a poll cycle.
//
// `ManualEntryBook`: operator overrides, written through the engine handle
// and read once per tick.

use crate::error::{EngineError, Result};
use crate::register::FunctionCode;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

// ============================================================================
// REGISTER CACHE
// ============================================================================

/// Location of a register's first word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegisterKey {
    pub function_code: FunctionCode,
    pub address: u16,
}

impl RegisterKey {
    pub fn new(function_code: FunctionCode, address: u16) -> Self {
        Self {
            function_code,
            address,
        }
    }
}

/// Latest poll result for one register
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterSample {
    /// All words of the register; empty when the read failed
    pub words: Vec<u16>,
    pub read_at: DateTime<Utc>,
    pub success: bool,
}

impl RegisterSample {
    pub fn ok(words: Vec<u16>, read_at: DateTime<Utc>) -> Self {
        Self {
            words,
            read_at,
            success: true,
        }
    }

    pub fn failed(read_at: DateTime<Utc>) -> Self {
        Self {
            words: Vec::new(),
            read_at,
            success: false,
        }
    }
}

pub type RegisterMap = HashMap<RegisterKey, RegisterSample>;

/// Single-writer, multi-reader double buffer of register samples
#[derive(Debug, Clone, Default)]
pub struct RegisterCache {
    current: Arc<RwLock<Arc<RegisterMap>>>,
}

impl RegisterCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one poll cycle's samples and swap the published map
    pub fn publish<I>(&self, batch: I)
    where
        I: IntoIterator<Item = (RegisterKey, RegisterSample)>,
    {
        let mut next: RegisterMap = (**self.current.read()).clone();
        let mut count = 0usize;
        for (key, sample) in batch {
            next.insert(key, sample);
            count += 1;
        }
        *self.current.write() = Arc::new(next);
        trace!("Published {} register samples", count);
    }

    /// Consistent view of every register; never waits on the writer for long
    pub fn snapshot(&self) -> Arc<RegisterMap> {
        self.current.read().clone()
    }

    /// Drop samples of registers no longer configured
    pub fn retain<F>(&self, keep: F)
    where
        F: Fn(&RegisterKey) -> bool,
    {
        let mut next: RegisterMap = (**self.current.read()).clone();
        next.retain(|key, _| keep(key));
        *self.current.write() = Arc::new(next);
    }

    pub fn len(&self) -> usize {
        self.current.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// MANUAL ENTRIES
// ============================================================================

/// Operator-entered value for a parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualEntry {
    pub value: f64,
    pub entered_at: DateTime<Utc>,
    /// Entry stops qualifying at this instant
    #[serde(default)]
    pub effective_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub entered_by: Option<String>,
}

impl ManualEntry {
    pub fn new(value: f64, entered_at: DateTime<Utc>) -> Self {
        Self {
            value,
            entered_at,
            effective_until: None,
            entered_by: None,
        }
    }

    pub fn until(mut self, effective_until: DateTime<Utc>) -> Self {
        self.effective_until = Some(effective_until);
        self
    }

    pub fn by(mut self, user: impl Into<String>) -> Self {
        self.entered_by = Some(user.into());
        self
    }

    pub fn is_effective(&self, now: DateTime<Utc>) -> bool {
        self.effective_until.map_or(true, |until| now < until)
    }
}

/// Latest manual entry per parameter
///
/// # Examples
///
/// ```rust
/// use chrono::{Duration, Utc};
/// use gcs_engine::cache::{ManualEntry, ManualEntryBook};
///
/// let book = ManualEntryBook::new();
/// let now = Utc::now();
/// book.set("stg1_suction_pressure", ManualEntry::new(42.0, now).until(now + Duration::minutes(30)))?;
///
/// assert_eq!(book.get("stg1_suction_pressure").map(|e| e.value), Some(42.0));
/// assert_eq!(book.purge_expired(now + Duration::hours(1)), 1);
/// assert!(book.get("stg1_suction_pressure").is_none());
/// # Ok::<(), gcs_engine::EngineError>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct ManualEntryBook {
    entries: Arc<DashMap<String, ManualEntry>>,
}

impl ManualEntryBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the entry for `parameter`
    pub fn set(&self, parameter: impl AsRef<str>, entry: ManualEntry) -> Result<()> {
        let parameter = parameter.as_ref();
        if !entry.value.is_finite() {
            return Err(EngineError::InvalidValue(format!(
                "manual value {} for '{}' is not finite",
                entry.value, parameter
            )));
        }
        debug!(
            "Manual entry {} = {} by {}",
            parameter,
            entry.value,
            entry.entered_by.as_deref().unwrap_or("unknown")
        );
        self.entries.insert(parameter.to_string(), entry);
        Ok(())
    }

    pub fn clear(&self, parameter: impl AsRef<str>) -> Option<ManualEntry> {
        self.entries.remove(parameter.as_ref()).map(|(_, entry)| entry)
    }

    pub fn get(&self, parameter: impl AsRef<str>) -> Option<ManualEntry> {
        self.entries
            .get(parameter.as_ref())
            .map(|entry| entry.value().clone())
    }

    /// Copy of all entries for one tick
    pub fn snapshot(&self) -> HashMap<String, ManualEntry> {
        self.entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Remove entries whose `effective_until` has passed
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_effective(now));
        let purged = before.saturating_sub(self.entries.len());
        if purged > 0 {
            debug!("Purged {} expired manual entries", purged);
        }
        purged
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn key(address: u16) -> RegisterKey {
        RegisterKey::new(FunctionCode::HoldingRegisters, address)
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_publish() {
        let cache = RegisterCache::new();
        let t0 = Utc::now();
        cache.publish(vec![(key(1), RegisterSample::ok(vec![10], t0))]);

        let view = cache.snapshot();
        cache.publish(vec![(key(1), RegisterSample::ok(vec![20], t0 + Duration::seconds(1)))]);

        assert_eq!(view[&key(1)].words, vec![10]);
        assert_eq!(cache.snapshot()[&key(1)].words, vec![20]);
    }

    #[test]
    fn test_publish_merges_batches() {
        let cache = RegisterCache::new();
        let t0 = Utc::now();
        cache.publish(vec![(key(1), RegisterSample::ok(vec![1], t0))]);
        cache.publish(vec![(key(2), RegisterSample::failed(t0))]);

        let view = cache.snapshot();
        assert_eq!(view.len(), 2);
        assert!(view[&key(1)].success);
        assert!(!view[&key(2)].success);

        cache.retain(|k| k.address == 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_manual_entry_expiry() {
        let book = ManualEntryBook::new();
        let now = Utc::now();
        book.set("a", ManualEntry::new(1.0, now).until(now + Duration::seconds(10)))
            .unwrap();
        book.set("b", ManualEntry::new(2.0, now).by("operator")).unwrap();

        assert_eq!(book.purge_expired(now + Duration::seconds(5)), 0);
        assert_eq!(book.purge_expired(now + Duration::seconds(10)), 1);
        assert!(book.get("a").is_none());
        assert_eq!(book.get("b").unwrap().entered_by.as_deref(), Some("operator"));
    }

    #[test]
    fn test_manual_entry_rejects_nan() {
        let book = ManualEntryBook::new();
        let err = book.set("a", ManualEntry::new(f64::NAN, Utc::now())).unwrap_err();
        assert!(matches!(err, EngineError::InvalidValue(_)));
        assert!(book.is_empty());
    }

    #[test]
    fn test_clear_returns_previous_entry() {
        let book = ManualEntryBook::new();
        let now = Utc::now();
        book.set("a", ManualEntry::new(3.0, now)).unwrap();
        assert_eq!(book.clear("a").map(|e| e.value), Some(3.0));
        assert!(book.clear("a").is_none());
    }
}
