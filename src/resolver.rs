// src/resolver.rs - Per-parameter fallback chain resolution
use crate::cache::ManualEntry;
use crate::config::{ParameterChain, SourceCandidate};
use crate::value::{Quality, ResolvedValue, SourceKind};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::debug;

/// Last successful decode of a register
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegisterReading {
    pub value: f64,
    pub read_at: DateTime<Utc>,
}

/// Inputs visible to one tick's resolution
///
/// All maps are views taken at tick start, except `resolved`, which grows as
/// parameters are resolved in dependency order.
#[derive(Debug, Clone, Copy)]
pub struct ResolveContext<'a> {
    /// Register name to last good reading
    pub registers: &'a HashMap<String, RegisterReading>,
    /// Parameters already resolved this tick
    pub resolved: &'a HashMap<String, ResolvedValue>,
    pub manual: &'a HashMap<String, ManualEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct LastGood {
    value: f64,
    at: DateTime<Utc>,
}

/// Walks fallback chains and owns the last-known-good values
///
/// One instance per unit engine; never shared.
#[derive(Debug, Default)]
pub struct SourceResolver {
    last_good: HashMap<String, LastGood>,
}

impl SourceResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve one parameter
    ///
    /// The first candidate in priority order that is present and fresh wins.
    /// With no winner the value is BAD, keeps the last good number (0.0 if
    /// there never was one) and is flagged stale.
    pub fn resolve(
        &mut self,
        chain: &ParameterChain,
        now: DateTime<Utc>,
        ctx: &ResolveContext<'_>,
    ) -> ResolvedValue {
        let parameter = chain.parameter.as_str();

        for source in &chain.sources {
            if let Some((value, sampled_at)) = self.try_candidate(parameter, &source.candidate, now, ctx) {
                self.last_good.insert(
                    parameter.to_string(),
                    LastGood { value, at: now },
                );
                let kind = kind_of(&source.candidate);
                return ResolvedValue {
                    parameter: parameter.to_string(),
                    value,
                    quality: kind.quality(),
                    timestamp: now,
                    source_priority: Some(source.priority),
                    source: Some(kind),
                    sampled_at,
                    stale: false,
                    unit: chain.unit.clone(),
                };
            }
        }

        let last = self.last_good.get(parameter).copied();
        debug!(
            "{} resolved BAD, holding {:?}",
            parameter,
            last.map(|l| l.value)
        );
        ResolvedValue {
            parameter: parameter.to_string(),
            value: last.map_or(0.0, |l| l.value),
            quality: Quality::Bad,
            timestamp: now,
            source_priority: None,
            source: None,
            sampled_at: last.map(|l| l.at),
            stale: true,
            unit: chain.unit.clone(),
        }
    }

    fn try_candidate(
        &self,
        parameter: &str,
        candidate: &SourceCandidate,
        now: DateTime<Utc>,
        ctx: &ResolveContext<'_>,
    ) -> Option<(f64, Option<DateTime<Utc>>)> {
        match candidate {
            SourceCandidate::Modbus {
                register,
                stale_timeout,
            } => {
                let reading = ctx.registers.get(register)?;
                if now - reading.read_at > *stale_timeout {
                    debug!("{}: register {} stale since {}", parameter, register, reading.read_at);
                    return None;
                }
                Some((reading.value, Some(reading.read_at)))
            }
            SourceCandidate::Calculated { formula } => {
                let lookup = |name: &str| {
                    ctx.resolved
                        .get(name)
                        .filter(|v| v.quality.is_good())
                        .map(|v| v.value)
                };
                match formula.evaluate(lookup) {
                    Ok(value) => Some((value, Some(now))),
                    Err(e) => {
                        debug!("{}: {}", parameter, e);
                        None
                    }
                }
            }
            SourceCandidate::Manual { stale_timeout } => {
                let entry = ctx.manual.get(parameter)?;
                if !entry.is_effective(now) {
                    return None;
                }
                if let Some(limit) = stale_timeout {
                    if now - entry.entered_at > *limit {
                        return None;
                    }
                }
                Some((entry.value, Some(entry.entered_at)))
            }
            SourceCandidate::Default { value } => Some((*value, None)),
        }
    }

    pub fn last_known_good(&self, parameter: &str) -> Option<f64> {
        self.last_good.get(parameter).map(|l| l.value)
    }

    /// Forget parameters that are no longer configured
    pub fn retain<F>(&mut self, keep: F)
    where
        F: Fn(&str) -> bool,
    {
        self.last_good.retain(|name, _| keep(name));
    }
}

fn kind_of(candidate: &SourceCandidate) -> SourceKind {
    match candidate {
        SourceCandidate::Modbus { .. } => SourceKind::Modbus,
        SourceCandidate::Calculated { .. } => SourceKind::Calculated,
        SourceCandidate::Manual { .. } => SourceKind::Manual,
        SourceCandidate::Default { .. } => SourceKind::Default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PrioritizedSource;
    use crate::formula::Formula;
    use chrono::Duration;

    fn chain(parameter: &str, candidates: Vec<SourceCandidate>) -> ParameterChain {
        ParameterChain {
            parameter: parameter.to_string(),
            unit: Some("psig".into()),
            sources: candidates
                .into_iter()
                .enumerate()
                .map(|(i, candidate)| PrioritizedSource {
                    priority: i as u32 + 1,
                    candidate,
                })
                .collect(),
        }
    }

    fn modbus(register: &str, secs: i64) -> SourceCandidate {
        SourceCandidate::Modbus {
            register: register.into(),
            stale_timeout: Duration::seconds(secs),
        }
    }

    struct Inputs {
        registers: HashMap<String, RegisterReading>,
        resolved: HashMap<String, ResolvedValue>,
        manual: HashMap<String, ManualEntry>,
    }

    impl Inputs {
        fn new() -> Self {
            Self {
                registers: HashMap::new(),
                resolved: HashMap::new(),
                manual: HashMap::new(),
            }
        }

        fn ctx(&self) -> ResolveContext<'_> {
            ResolveContext {
                registers: &self.registers,
                resolved: &self.resolved,
                manual: &self.manual,
            }
        }
    }

    #[test]
    fn test_fresh_modbus_wins() {
        let now = Utc::now();
        let mut inputs = Inputs::new();
        inputs.registers.insert(
            "r1".into(),
            RegisterReading { value: 55.0, read_at: now - Duration::seconds(2) },
        );
        let c = chain("suction", vec![modbus("r1", 30), SourceCandidate::Default { value: 1.0 }]);

        let mut resolver = SourceResolver::new();
        let v = resolver.resolve(&c, now, &inputs.ctx());
        assert_eq!(v.quality, Quality::Live);
        assert_eq!(v.value, 55.0);
        assert_eq!(v.source_priority, Some(1));
        assert_eq!(v.sampled_at, Some(now - Duration::seconds(2)));
        assert!(!v.stale);
    }

    #[test]
    fn test_stale_modbus_falls_back_to_manual() {
        let now = Utc::now();
        let mut inputs = Inputs::new();
        inputs.registers.insert(
            "r1".into(),
            RegisterReading { value: 55.0, read_at: now - Duration::seconds(31) },
        );
        inputs.manual.insert("suction".into(), ManualEntry::new(48.0, now - Duration::minutes(5)));
        let c = chain(
            "suction",
            vec![
                modbus("r1", 30),
                SourceCandidate::Manual { stale_timeout: None },
                SourceCandidate::Default { value: 0.0 },
            ],
        );

        let v = SourceResolver::new().resolve(&c, now, &inputs.ctx());
        assert_eq!(v.quality, Quality::Manual);
        assert_eq!(v.value, 48.0);
        assert_eq!(v.source_priority, Some(2));
    }

    #[test]
    fn test_expired_manual_entry_skipped() {
        let now = Utc::now();
        let mut inputs = Inputs::new();
        inputs.manual.insert(
            "p".into(),
            ManualEntry::new(9.0, now - Duration::hours(2)).until(now - Duration::hours(1)),
        );
        let c = chain(
            "p",
            vec![SourceCandidate::Manual { stale_timeout: None }, SourceCandidate::Default { value: 3.0 }],
        );
        let v = SourceResolver::new().resolve(&c, now, &inputs.ctx());
        assert_eq!(v.quality, Quality::Default);
        assert_eq!(v.value, 3.0);
        assert_eq!(v.sampled_at, None);
    }

    #[test]
    fn test_manual_stale_timeout() {
        let now = Utc::now();
        let mut inputs = Inputs::new();
        inputs.manual.insert("p".into(), ManualEntry::new(9.0, now - Duration::seconds(120)));
        let c = chain(
            "p",
            vec![SourceCandidate::Manual { stale_timeout: Some(Duration::seconds(60)) }],
        );
        assert_eq!(SourceResolver::new().resolve(&c, now, &inputs.ctx()).quality, Quality::Bad);
    }

    #[test]
    fn test_bad_retains_last_known_good() {
        let t0 = Utc::now();
        let mut resolver = SourceResolver::new();
        let c = chain("p", vec![modbus("r1", 5)]);

        let mut inputs = Inputs::new();
        let first = resolver.resolve(&c, t0, &inputs.ctx());
        assert_eq!(first.quality, Quality::Bad);
        assert_eq!(first.value, 0.0);
        assert!(first.stale);

        inputs.registers.insert("r1".into(), RegisterReading { value: 12.5, read_at: t0 });
        let good = resolver.resolve(&c, t0 + Duration::seconds(1), &inputs.ctx());
        assert_eq!(good.quality, Quality::Live);

        let later = resolver.resolve(&c, t0 + Duration::seconds(10), &inputs.ctx());
        assert_eq!(later.quality, Quality::Bad);
        assert_eq!(later.value, 12.5);
        assert!(later.stale);
        assert_eq!(resolver.last_known_good("p"), Some(12.5));
    }

    #[test]
    fn test_calculated_requires_good_dependencies() {
        let now = Utc::now();
        let mut inputs = Inputs::new();
        let dep = |name: &str, value: f64, quality: Quality| ResolvedValue {
            parameter: name.into(),
            value,
            quality,
            timestamp: now,
            source_priority: None,
            source: None,
            sampled_at: None,
            stale: false,
            unit: None,
        };
        inputs.resolved.insert("a".into(), dep("a", 4.0, Quality::Live));
        inputs.resolved.insert("b".into(), dep("b", 2.0, Quality::Manual));

        let formula = Formula::parse("a / b").unwrap();
        let c = chain(
            "ratio",
            vec![
                SourceCandidate::Calculated { formula },
                SourceCandidate::Default { value: -1.0 },
            ],
        );

        let mut resolver = SourceResolver::new();
        let v = resolver.resolve(&c, now, &inputs.ctx());
        assert_eq!(v.quality, Quality::Calculated);
        assert_eq!(v.value, 2.0);

        inputs.resolved.insert("b".into(), dep("b", 2.0, Quality::Bad));
        let v = resolver.resolve(&c, now, &inputs.ctx());
        assert_eq!(v.quality, Quality::Default);

        inputs.resolved.insert("b".into(), dep("b", 0.0, Quality::Live));
        let v = resolver.resolve(&c, now, &inputs.ctx());
        assert_eq!(v.quality, Quality::Default, "division by zero demotes the candidate");
    }
}
