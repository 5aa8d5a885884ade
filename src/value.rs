// src/value.rs - Resolved values and quality tags
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Provenance of a resolved value
///
/// Every parameter in a published snapshot carries exactly one quality tag.
/// `Bad` means no candidate in the fallback chain qualified this tick; the
/// numeric value is then the last known good one.
///
/// # Examples
///
/// ```rust
/// use gcs_engine::Quality;
///
/// assert!(Quality::Live.is_good());
/// assert!(Quality::Manual.is_good());
/// assert!(!Quality::Bad.is_good());
/// assert_eq!(Quality::Calculated.to_string(), "CALCULATED");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Quality {
    /// Fresh decode from a field register
    Live,
    /// Derived from other parameters resolved this tick
    Calculated,
    /// Operator-entered override
    Manual,
    /// Static configured constant
    Default,
    /// No candidate qualified
    Bad,
}

impl Quality {
    /// Anything except `Bad`
    pub fn is_good(&self) -> bool {
        !matches!(self, Quality::Bad)
    }

    pub fn is_bad(&self) -> bool {
        matches!(self, Quality::Bad)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Live => "LIVE",
            Quality::Calculated => "CALCULATED",
            Quality::Manual => "MANUAL",
            Quality::Default => "DEFAULT",
            Quality::Bad => "BAD",
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of source candidate that produced a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Modbus,
    Calculated,
    Manual,
    Default,
}

impl SourceKind {
    /// Quality a winning candidate of this kind reports
    pub fn quality(&self) -> Quality {
        match self {
            SourceKind::Modbus => Quality::Live,
            SourceKind::Calculated => Quality::Calculated,
            SourceKind::Manual => Quality::Manual,
            SourceKind::Default => Quality::Default,
        }
    }
}

/// One entry of a published snapshot
///
/// Built fresh every tick and never mutated after publication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedValue {
    pub parameter: String,
    pub value: f64,
    pub quality: Quality,
    /// Tick timestamp shared by every value of the snapshot
    pub timestamp: DateTime<Utc>,
    /// Priority of the winning candidate; `None` when `Bad`
    pub source_priority: Option<u32>,
    pub source: Option<SourceKind>,
    /// Time the winning source produced its value (read time, entry time)
    pub sampled_at: Option<DateTime<Utc>>,
    /// Set when the value is a retained last-known-good
    pub stale: bool,
    /// Engineering unit, if configured
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl ResolvedValue {
    pub fn is_good(&self) -> bool {
        self.quality.is_good()
    }
}

impl fmt::Display for ResolvedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.parameter, self.value)?;
        if let Some(unit) = &self.unit {
            write!(f, " {}", unit)?;
        }
        write!(f, " [{}]", self.quality)?;
        if self.stale {
            f.write_str(" (stale)")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_serializes_upper_case() {
        assert_eq!(serde_json::to_string(&Quality::Live).unwrap(), "\"LIVE\"");
        assert_eq!(serde_json::to_string(&Quality::Bad).unwrap(), "\"BAD\"");
        let q: Quality = serde_json::from_str("\"MANUAL\"").unwrap();
        assert_eq!(q, Quality::Manual);
    }

    #[test]
    fn test_source_kind_quality_mapping() {
        assert_eq!(SourceKind::Modbus.quality(), Quality::Live);
        assert_eq!(SourceKind::Calculated.quality(), Quality::Calculated);
        assert_eq!(SourceKind::Manual.quality(), Quality::Manual);
        assert_eq!(SourceKind::Default.quality(), Quality::Default);
    }

    #[test]
    fn test_display_marks_stale() {
        let v = ResolvedValue {
            parameter: "stg1_suction_pressure".into(),
            value: 42.5,
            quality: Quality::Bad,
            timestamp: Utc::now(),
            source_priority: None,
            source: None,
            sampled_at: None,
            stale: true,
            unit: Some("psig".into()),
        };
        assert_eq!(v.to_string(), "stg1_suction_pressure = 42.5 psig [BAD] (stale)");
    }
}
