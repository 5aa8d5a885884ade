// src/formula.rs - Pre-parsed expressions for calculated sources
//
// Formulas are parsed once at configuration load into an evalexpr operator
// tree. The tree yields the parameter names it reads, which the loader uses
// for dependency ordering and cycle detection.

use evalexpr::{
    build_operator_tree, Context, ContextWithMutableVariables, DefaultNumericTypes,
    HashMapContext, Node, Value,
};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FormulaError {
    /// Rejected at configuration load
    #[error("cannot parse formula '{formula}': {reason}")]
    Parse { formula: String, reason: String },

    /// Dependency missing or resolved BAD this tick
    #[error("dependency '{0}' has no good value")]
    MissingDependency(String),

    #[error("formula evaluation failed: {0}")]
    Evaluation(String),

    /// Division by zero and other operations that leave the reals
    #[error("formula produced non-finite result {0}")]
    NonFinite(f64),
}

/// Parsed formula with its read dependencies
///
/// Arithmetic follows evalexpr: `+ - * / % ^`, parentheses, and builtins such
/// as `min`, `max`, `math::sqrt`. Parameter values are always passed as
/// floats; write constants with a decimal point to avoid integer division.
///
/// # Examples
///
/// ```rust
/// use gcs_engine::formula::Formula;
///
/// let ratio = Formula::parse("(discharge + 14.696) / (suction + 14.696)")?;
/// assert_eq!(ratio.dependencies(), &["discharge".to_string(), "suction".to_string()]);
///
/// let value = ratio.evaluate(|name| match name {
///     "discharge" => Some(285.304),
///     "suction" => Some(35.304),
///     _ => None,
/// })?;
/// assert!((value - 6.0).abs() < 1e-9);
/// # Ok::<(), gcs_engine::formula::FormulaError>(())
/// ```
#[derive(Clone)]
pub struct Formula {
    source: String,
    tree: Node<DefaultNumericTypes>,
    dependencies: Vec<String>,
}

impl Formula {
    pub fn parse(source: &str) -> Result<Self, FormulaError> {
        let parse_error = |reason: String| FormulaError::Parse {
            formula: source.to_string(),
            reason,
        };

        if source.trim().is_empty() {
            return Err(parse_error("empty formula".into()));
        }

        let tree = build_operator_tree::<DefaultNumericTypes>(source)
            .map_err(|e| parse_error(e.to_string()))?;

        // First-appearance order, duplicates removed
        let mut dependencies: Vec<String> = Vec::new();
        for ident in tree.iter_variable_identifiers() {
            if !dependencies.iter().any(|d| d == ident) {
                dependencies.push(ident.to_string());
            }
        }

        Ok(Self {
            source: source.to_string(),
            tree,
            dependencies,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Parameter names the formula reads
    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    /// Evaluate against already-resolved values
    ///
    /// `lookup` returns `None` for a dependency without a good value this
    /// tick, which fails the evaluation before the tree is walked.
    pub fn evaluate<F>(&self, lookup: F) -> Result<f64, FormulaError>
    where
        F: Fn(&str) -> Option<f64>,
    {
        let mut context = HashMapContext::<DefaultNumericTypes>::new();
        context
            .set_builtin_functions_disabled(false)
            .map_err(|e| FormulaError::Evaluation(e.to_string()))?;

        for name in &self.dependencies {
            let value = lookup(name).ok_or_else(|| FormulaError::MissingDependency(name.clone()))?;
            context
                .set_value(name.clone(), Value::Float(value))
                .map_err(|e| FormulaError::Evaluation(e.to_string()))?;
        }

        let result = self
            .tree
            .eval_number_with_context(&context)
            .map_err(|e| FormulaError::Evaluation(e.to_string()))?;

        if !result.is_finite() {
            return Err(FormulaError::NonFinite(result));
        }
        Ok(result)
    }
}

impl fmt::Debug for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Formula")
            .field("source", &self.source)
            .field("dependencies", &self.dependencies)
            .finish()
    }
}

impl PartialEq for Formula {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn values(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_dependencies_in_first_appearance_order() {
        let f = Formula::parse("max(t1, t2, t3) - min(t1, t2, t3)").unwrap();
        assert_eq!(f.dependencies(), &["t1", "t2", "t3"]);
    }

    #[test]
    fn test_exhaust_spread() {
        let f = Formula::parse("max(t1, t2, t3) - min(t1, t2, t3)").unwrap();
        let v = values(&[("t1", 910.0), ("t2", 955.0), ("t3", 930.0)]);
        assert_eq!(f.evaluate(|n| v.get(n).copied()).unwrap(), 45.0);
    }

    #[test]
    fn test_isentropic_efficiency() {
        // k = 1.28, temperatures in F, pressures in psig
        let f = Formula::parse(
            "100.0 * (ts + 459.67) * (((pd + 14.696) / (ps + 14.696)) ^ (0.28 / 1.28) - 1.0) / (td - ts)",
        )
        .unwrap();
        let v = values(&[("ts", 80.0), ("td", 280.0), ("ps", 50.0), ("pd", 250.0)]);
        let eff = f.evaluate(|n| v.get(n).copied()).unwrap();
        assert!(eff > 50.0 && eff < 100.0, "efficiency {}", eff);
    }

    #[test]
    fn test_missing_dependency() {
        let f = Formula::parse("a + b").unwrap();
        let err = f.evaluate(|n| if n == "a" { Some(1.0) } else { None }).unwrap_err();
        assert_eq!(err, FormulaError::MissingDependency("b".into()));
    }

    #[test]
    fn test_division_by_zero_is_non_finite() {
        let f = Formula::parse("a / b").unwrap();
        let v = values(&[("a", 1.0), ("b", 0.0)]);
        assert!(matches!(
            f.evaluate(|n| v.get(n).copied()),
            Err(FormulaError::NonFinite(_))
        ));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(Formula::parse("a )"), Err(FormulaError::Parse { .. })));
        assert!(matches!(Formula::parse("(a"), Err(FormulaError::Parse { .. })));
        assert!(matches!(Formula::parse("  "), Err(FormulaError::Parse { .. })));
    }

    #[test]
    fn test_constant_formula_has_no_dependencies() {
        let f = Formula::parse("2.5 * 4").unwrap();
        assert!(f.dependencies().is_empty());
        assert_eq!(f.evaluate(|_| None).unwrap(), 10.0);
    }
}
