//! Batch strategies: expansion of a sweep declaration into named tasks.
//!
//! A declaration is the `variation` mapping of a batch file. It holds exactly
//! one strategy entry keyed by kind (optionally suffixed, e.g. `sequence-2`
//! when several alternatives are kept side by side) plus naming options:
//!
//! ```yaml
//! variation:
//!   matrix:
//!     initial.T: [300, 400]
//!     initial.P: [1, 2, 5]
//!   prefix: case        # ordinal names case_00, case_01, ...
//!   naming: ordinal     # or `value` for names like T_300_P_1
//!   names: [a, b, ...]  # explicit names, one per task
//! ```
//!
//! The deprecated single-axis shorthand `variation: {entry: key, values: [...]}`
//! is converted into an equivalent sequence on load.

use std::fmt::Write as _;

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::{Configuration, value_kind};
use crate::error::ConfigurationError;
use crate::space::{Axis, Grid, MAX_SOBOL_DIMENSIONS, Range, SobolSequence};

/// Declaration keys that configure naming rather than select a strategy
const OPTION_KEYS: [&str; 3] = ["prefix", "naming", "names"];

const DEFAULT_PREFIX: &str = "task";

/// How a sweep varies the base configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariationSpec {
    /// Cartesian product of all axes, first axis varying slowest
    Matrix { axes: Vec<Axis> },

    /// One task per listed value
    Sequence { axis: Axis },

    /// Quasi-random samples of one or more intervals
    Sobol {
        ranges: Vec<Range>,
        samples: usize,
        seed: u64,
    },

    /// Deprecated single-axis shorthand, converted to `Sequence` on load
    Legacy { entry: String, values: Vec<Value> },
}

impl VariationSpec {
    /// Parse a strategy entry such as `matrix: {...}` or `sequence-2: {...}`.
    pub fn from_entry(key: &str, value: &Value) -> Result<Self, ConfigurationError> {
        match strategy_kind(key) {
            "matrix" => {
                let axes = parse_axes(key, value)?;
                if axes.is_empty() {
                    return Err(ConfigurationError::InvalidAxisCount {
                        kind: "matrix",
                        expected: "at least one axis",
                        got: 0,
                    });
                }
                Ok(VariationSpec::Matrix { axes })
            }
            "sequence" => {
                let mut axes = parse_axes(key, value)?;
                if axes.len() != 1 {
                    return Err(ConfigurationError::InvalidAxisCount {
                        kind: "sequence",
                        expected: "exactly one axis",
                        got: axes.len(),
                    });
                }
                Ok(VariationSpec::Sequence {
                    axis: axes.remove(0),
                })
            }
            "sobol" => parse_sobol(key, value),
            "legacy" => match value {
                Value::Object(map) => Self::legacy_from_map(map),
                other => Err(ConfigurationError::invalid(
                    key,
                    format!("expected a mapping, found {}", value_kind(other)),
                )),
            },
            _ => Err(ConfigurationError::UnknownStrategy(key.to_string())),
        }
    }

    /// Parse the deprecated `{entry, values}` shorthand.
    ///
    /// `entry` may be a dotted key or a list of key segments.
    pub fn legacy_from_map(map: &Map<String, Value>) -> Result<Self, ConfigurationError> {
        let entry = match map.get("entry") {
            Some(Value::String(entry)) => entry.clone(),
            Some(Value::Array(parts)) => parts
                .iter()
                .map(|p| match p {
                    Value::String(s) => Ok(s.as_str()),
                    other => Err(ConfigurationError::invalid(
                        "entry",
                        format!("expected key segments, found {}", value_kind(other)),
                    )),
                })
                .collect::<Result<Vec<_>, _>>()?
                .join("."),
            _ => return Err(ConfigurationError::invalid("entry", "missing or not a key")),
        };
        let values = match map.get("values") {
            Some(Value::Array(values)) => values.clone(),
            _ => return Err(ConfigurationError::invalid("values", "missing or not a list")),
        };
        Ok(VariationSpec::Legacy { entry, values })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            VariationSpec::Matrix { .. } => "matrix",
            VariationSpec::Sequence { .. } => "sequence",
            VariationSpec::Sobol { .. } => "sobol",
            VariationSpec::Legacy { .. } => "legacy",
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        match self {
            VariationSpec::Matrix { axes } => {
                if axes.is_empty() {
                    return Err(ConfigurationError::InvalidAxisCount {
                        kind: "matrix",
                        expected: "at least one axis",
                        got: 0,
                    });
                }
                axes.iter().try_for_each(validate_axis)
            }
            VariationSpec::Sequence { axis } => validate_axis(axis),
            VariationSpec::Sobol {
                ranges, samples, ..
            } => {
                if ranges.len() > MAX_SOBOL_DIMENSIONS {
                    return Err(ConfigurationError::TooManyDimensions {
                        max: MAX_SOBOL_DIMENSIONS,
                        got: ranges.len(),
                    });
                }
                if ranges.is_empty() {
                    return Err(ConfigurationError::InvalidAxisCount {
                        kind: "sobol",
                        expected: "at least one range",
                        got: 0,
                    });
                }
                if *samples == 0 {
                    return Err(ConfigurationError::InvalidSampleCount(0));
                }
                ranges.iter().try_for_each(Range::validate)
            }
            VariationSpec::Legacy { entry, values } => {
                validate_axis(&Axis::new(entry.clone(), values.clone()))
            }
        }
    }

    /// Keys varied by this spec, in axis order
    pub fn keys(&self) -> Vec<&str> {
        match self {
            VariationSpec::Matrix { axes } => axes.iter().map(|a| a.key.as_str()).collect(),
            VariationSpec::Sequence { axis } => vec![axis.key.as_str()],
            VariationSpec::Sobol { ranges, .. } => ranges.iter().map(|r| r.key.as_str()).collect(),
            VariationSpec::Legacy { entry, .. } => vec![entry.as_str()],
        }
    }

    /// Number of tasks this spec expands to
    pub fn task_count(&self) -> usize {
        match self {
            VariationSpec::Matrix { axes } => axes.iter().map(Axis::len).product(),
            VariationSpec::Sequence { axis } => axis.len(),
            VariationSpec::Sobol { samples, .. } => *samples,
            VariationSpec::Legacy { values, .. } => values.len(),
        }
    }

    /// Per-task `(key, value)` assignments in generation order.
    pub fn assignments(&self) -> Result<Vec<Vec<(String, Value)>>, ConfigurationError> {
        match self {
            VariationSpec::Matrix { axes } => {
                let shape: Vec<usize> = axes.iter().map(Axis::len).collect();
                Ok(Grid::new(&shape)
                    .positions()
                    .map(|position| {
                        axes.iter()
                            .zip(position)
                            .map(|(axis, idx)| (axis.key.clone(), axis.values[idx].clone()))
                            .collect()
                    })
                    .collect())
            }
            VariationSpec::Sequence { axis } => Ok(axis
                .values
                .iter()
                .map(|value| vec![(axis.key.clone(), value.clone())])
                .collect()),
            VariationSpec::Sobol {
                ranges,
                samples,
                seed,
            } => {
                let sequence = SobolSequence::with_skip(ranges.len(), *seed)?;
                Ok(sequence
                    .take(*samples)
                    .map(|point| {
                        ranges
                            .iter()
                            .zip(point)
                            .map(|(range, unit)| (range.key.clone(), Value::from(range.scale(unit))))
                            .collect()
                    })
                    .collect())
            }
            VariationSpec::Legacy { .. } => convert_legacy(self.clone()).assignments(),
        }
    }
}

/// Rewrite the legacy shorthand into an equivalent `Sequence`.
///
/// Total and idempotent: non-legacy specs are returned unchanged.
pub fn convert_legacy(spec: VariationSpec) -> VariationSpec {
    match spec {
        VariationSpec::Legacy { entry, values } => VariationSpec::Sequence {
            axis: Axis::new(entry, values),
        },
        other => other,
    }
}

/// Scheme used to derive task names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskNaming {
    /// `<prefix>_00`, `<prefix>_01`, ...
    #[default]
    Ordinal,
    /// Derived from the varied values, e.g. `eggs_2` or `spam_0.5_eggs_1`
    Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamingOptions {
    pub prefix: String,
    pub scheme: TaskNaming,
    /// Explicit names, one per task; take precedence over `scheme`
    pub names: Option<Vec<String>>,
}

impl Default for NamingOptions {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            scheme: TaskNaming::Ordinal,
            names: None,
        }
    }
}

impl NamingOptions {
    fn from_declaration(declaration: &Map<String, Value>) -> Result<Self, ConfigurationError> {
        let mut options = NamingOptions::default();

        if let Some(prefix) = declaration.get("prefix") {
            options.prefix = match prefix {
                Value::String(s) if !s.is_empty() => s.clone(),
                _ => return Err(ConfigurationError::invalid("prefix", "expected a non-empty string")),
            };
        }

        if let Some(naming) = declaration.get("naming") {
            options.scheme = match naming.as_str() {
                Some("ordinal") => TaskNaming::Ordinal,
                Some("value") => TaskNaming::Value,
                _ => {
                    return Err(ConfigurationError::invalid(
                        "naming",
                        "expected 'ordinal' or 'value'",
                    ));
                }
            };
        }

        if let Some(names) = declaration.get("names") {
            let Value::Array(items) = names else {
                return Err(ConfigurationError::invalid("names", "expected a list"));
            };
            let names = items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s.clone()),
                    Value::Number(n) => Ok(n.to_string()),
                    other => Err(ConfigurationError::invalid(
                        "names",
                        format!("expected strings, found {}", value_kind(other)),
                    )),
                })
                .collect::<Result<Vec<_>, _>>()?;
            options.names = Some(names);
        }

        Ok(options)
    }

    /// Names for `assignments`, checked for uniqueness.
    pub fn generate(
        &self,
        assignments: &[Vec<(String, Value)>],
    ) -> Result<Vec<String>, ConfigurationError> {
        let count = assignments.len();
        let names = match (&self.names, self.scheme) {
            (Some(names), _) => {
                if names.len() != count {
                    return Err(ConfigurationError::NameCountMismatch {
                        expected: count,
                        got: names.len(),
                    });
                }
                names.clone()
            }
            (None, TaskNaming::Ordinal) => {
                let width = ordinal_width(count);
                (0..count)
                    .map(|i| format!("{}_{i:0width$}", self.prefix))
                    .collect()
            }
            (None, TaskNaming::Value) => assignments.iter().map(|a| value_name(a)).collect(),
        };

        if self.names.is_none() && self.scheme == TaskNaming::Ordinal {
            check_name(&self.prefix)?;
        }

        let mut seen = FxHashSet::with_capacity_and_hasher(names.len(), Default::default());
        for name in &names {
            if name.is_empty() {
                return Err(ConfigurationError::invalid("names", "task names cannot be empty"));
            }
            check_name(name)?;
            if !seen.insert(name.as_str()) {
                return Err(ConfigurationError::DuplicateTaskName(name.clone()));
            }
        }
        Ok(names)
    }
}

fn ordinal_width(count: usize) -> usize {
    let largest = count.saturating_sub(1);
    largest.to_string().len().max(2)
}

/// A task name must be a single path component
fn check_name(name: &str) -> Result<(), ConfigurationError> {
    let bad = name.contains(['/', '\\', '\0']) || name == "." || name == "..";
    if bad {
        return Err(ConfigurationError::InvalidTaskName(name.to_string()));
    }
    Ok(())
}

fn value_name(assignment: &[(String, Value)]) -> String {
    let mut name = String::new();
    for (key, value) in assignment {
        if !name.is_empty() {
            name.push('_');
        }
        let leaf = key.rsplit('.').next().unwrap_or(key);
        let _ = match value {
            Value::String(s) => write!(name, "{leaf}_{s}"),
            other => write!(name, "{leaf}_{other}"),
        };
    }
    name.chars()
        .filter(|c| *c != '\0')
        .map(|c| if matches!(c, '/' | '\\') { '-' } else { c })
        .collect()
}

/// One concrete configuration to be executed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique name within the batch; join key for outputs and restarts
    pub name: String,
    /// Position in generation order
    pub index: usize,
    /// Base configuration with the variation applied
    pub configuration: Configuration,
    /// The `(key, value)` pairs applied to the base
    pub variation: Vec<(String, Value)>,
}

impl Task {
    /// Applied variation as a mapping
    pub fn variation_map(&self) -> Map<String, Value> {
        self.variation.iter().cloned().collect()
    }
}

/// An expanded sweep: the variation spec, naming, and the resulting tasks
#[derive(Debug, Clone)]
pub struct Strategy {
    label: String,
    spec: VariationSpec,
    naming: NamingOptions,
    base: Configuration,
    tasks: Vec<Task>,
}

impl Strategy {
    /// Load the single strategy defined by `declaration`.
    pub fn load(
        declaration: &Map<String, Value>,
        base: Configuration,
    ) -> Result<Self, ConfigurationError> {
        Self::load_named(declaration, base, None)
    }

    /// Load a strategy, selecting `name` when several are declared.
    pub fn load_named(
        declaration: &Map<String, Value>,
        base: Configuration,
        name: Option<&str>,
    ) -> Result<Self, ConfigurationError> {
        let naming = NamingOptions::from_declaration(declaration)?;

        if declaration.contains_key("entry") || declaration.contains_key("values") {
            tracing::warn!("'entry'/'values' variation syntax is deprecated, use 'sequence'");
            let spec = VariationSpec::legacy_from_map(declaration)?;
            return Self::from_spec("legacy", spec, base, naming);
        }

        let candidates: Vec<&String> = declaration
            .keys()
            .filter(|key| !OPTION_KEYS.contains(&key.as_str()))
            .collect();

        let label = match name {
            Some(name) => candidates
                .iter()
                .find(|key| key.as_str() == name)
                .copied()
                .ok_or_else(|| ConfigurationError::UnknownStrategy(name.to_string()))?,
            None => match candidates.as_slice() {
                [] => return Err(ConfigurationError::MissingStrategy),
                [single] => *single,
                many => {
                    return Err(ConfigurationError::AmbiguousStrategy(
                        many.iter().map(|k| k.to_string()).collect(),
                    ));
                }
            },
        };

        let spec = VariationSpec::from_entry(label, &declaration[label.as_str()])?;
        Self::from_spec(label, spec, base, naming)
    }

    /// Build from an already parsed spec.
    pub fn from_spec(
        label: &str,
        spec: VariationSpec,
        base: Configuration,
        naming: NamingOptions,
    ) -> Result<Self, ConfigurationError> {
        spec.validate()?;
        let spec = convert_legacy(spec);

        for key in spec.keys() {
            base.check_path(key)?;
        }

        let assignments = spec.assignments()?;
        let names = naming.generate(&assignments)?;

        let tasks = names
            .into_iter()
            .zip(assignments)
            .enumerate()
            .map(|(index, (name, variation))| {
                Ok(Task {
                    configuration: base.with_overrides(&variation)?,
                    name,
                    index,
                    variation,
                })
            })
            .collect::<Result<Vec<_>, ConfigurationError>>()?;

        Ok(Self {
            label: label.to_string(),
            spec,
            naming,
            base,
            tasks,
        })
    }

    /// Ordered task list
    pub fn create_tasks(&self) -> Vec<Task> {
        self.tasks.clone()
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Task at an axis position; only matrix sweeps have more than one axis,
    /// other kinds take a single-element position.
    pub fn task_at(&self, position: &[usize]) -> Option<&Task> {
        let ordinal = match &self.spec {
            VariationSpec::Matrix { axes } => {
                let shape: Vec<usize> = axes.iter().map(Axis::len).collect();
                Grid::new(&shape).ordinal(position)?
            }
            _ => match position {
                [ordinal] => *ordinal,
                _ => return None,
            },
        };
        self.tasks.get(ordinal)
    }

    pub fn kind(&self) -> &'static str {
        self.spec.kind()
    }

    /// Declaration key this strategy was loaded from
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn spec(&self) -> &VariationSpec {
        &self.spec
    }

    pub fn naming(&self) -> &NamingOptions {
        &self.naming
    }

    pub fn base(&self) -> &Configuration {
        &self.base
    }

    /// Strategy definition as stored in artifact metadata
    pub fn definition(&self) -> Value {
        serde_json::to_value(&self.spec).unwrap_or(Value::Null)
    }

    /// Short human-readable summary
    pub fn info(&self) -> String {
        format!(
            "{} strategy '{}' over [{}]: {} tasks",
            self.spec.kind(),
            self.label,
            self.spec.keys().join(", "),
            self.tasks.len()
        )
    }
}

/// `sequence-2` -> `sequence`
fn strategy_kind(key: &str) -> &str {
    key.split_once('-').map_or(key, |(kind, _)| kind)
}

fn validate_axis(axis: &Axis) -> Result<(), ConfigurationError> {
    if axis.key.is_empty() {
        return Err(ConfigurationError::invalid(&axis.key, "empty key"));
    }
    if axis.is_empty() {
        return Err(ConfigurationError::EmptyAxis(axis.key.clone()));
    }
    Ok(())
}

fn parse_axes(key: &str, value: &Value) -> Result<Vec<Axis>, ConfigurationError> {
    let Value::Object(map) = value else {
        return Err(ConfigurationError::invalid(
            key,
            format!("expected a mapping of keys to value lists, found {}", value_kind(value)),
        ));
    };

    map.iter()
        .map(|(axis_key, values)| match values {
            Value::Array(values) => Ok(Axis::new(axis_key.clone(), values.clone())),
            other => Err(ConfigurationError::invalid(
                axis_key,
                format!("expected a list of values, found {}", value_kind(other)),
            )),
        })
        .collect()
}

fn parse_sobol(key: &str, value: &Value) -> Result<VariationSpec, ConfigurationError> {
    let Value::Object(map) = value else {
        return Err(ConfigurationError::invalid(
            key,
            format!("expected a mapping, found {}", value_kind(value)),
        ));
    };

    let samples = match map.get("samples") {
        Some(Value::Number(n)) => match n.as_i64() {
            Some(n) if n > 0 => n as usize,
            Some(n) => return Err(ConfigurationError::InvalidSampleCount(n)),
            None => return Err(ConfigurationError::invalid("samples", "expected an integer")),
        },
        Some(_) => return Err(ConfigurationError::invalid("samples", "expected an integer")),
        None => return Err(ConfigurationError::invalid("samples", "missing sample count")),
    };

    let seed = match map.get("seed") {
        None => 0,
        Some(value) => value
            .as_u64()
            .ok_or_else(|| ConfigurationError::invalid("seed", "expected a non-negative integer"))?,
    };

    // Ranges live under `ranges`, or directly beside `samples`/`seed`
    let entries: Vec<(&String, &Value)> = match map.get("ranges") {
        Some(Value::Object(ranges)) => ranges.iter().collect(),
        Some(_) => return Err(ConfigurationError::invalid("ranges", "expected a mapping")),
        None => map
            .iter()
            .filter(|(k, _)| !matches!(k.as_str(), "samples" | "seed"))
            .collect(),
    };

    let ranges = entries
        .into_iter()
        .map(|(range_key, bounds)| parse_bounds(range_key, bounds))
        .collect::<Result<Vec<_>, _>>()?;

    let spec = VariationSpec::Sobol {
        ranges,
        samples,
        seed,
    };
    spec.validate()?;
    Ok(spec)
}

fn parse_bounds(key: &str, bounds: &Value) -> Result<Range, ConfigurationError> {
    match bounds.as_array().map(Vec::as_slice) {
        Some([low, high]) => match (low.as_f64(), high.as_f64()) {
            (Some(low), Some(high)) => Ok(Range::new(key, low, high)),
            _ => Err(ConfigurationError::invalid(key, "bounds must be numbers")),
        },
        _ => Err(ConfigurationError::invalid(key, "expected [low, high]")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    fn defaults() -> Configuration {
        Configuration::from(map(json!({"foobar": 1, "spam": 2.0, "eggs": 3.5})))
    }

    #[test]
    fn test_sequence_basic() {
        let values = vec![json!(0), json!(1), json!(2), json!(3)];
        let declaration = map(json!({"sequence": {"foobar": values}}));
        let strategy = Strategy::load(&declaration, defaults()).unwrap();

        assert_eq!(strategy.spec().kind(), "sequence");
        let tasks = strategy.create_tasks();
        assert_eq!(tasks.len(), 4);
        for (i, value) in values.iter().enumerate() {
            assert_eq!(tasks[i].configuration.get("foobar"), Some(value));
            assert_eq!(tasks[i].configuration.get("spam"), Some(&json!(2.0)));
        }
    }

    #[test]
    fn test_sequence_requires_single_axis() {
        let declaration = map(json!({"sequence": {"foo": [0, 1, 2], "bar": [3, 4]}}));
        let err = Strategy::load(&declaration, defaults()).unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::InvalidAxisCount { kind: "sequence", got: 2, .. }
        ));
    }

    #[test]
    fn test_sequence_rejects_non_mapping() {
        let declaration = map(json!({"sequence": [0, 1, 2]}));
        let err = Strategy::load(&declaration, defaults()).unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidEntry { .. }));
    }

    #[test]
    fn test_unknown_strategy() {
        let declaration = map(json!({"foobar": {"foo": [0, 1, 2]}}));
        let err = Strategy::load(&declaration, defaults()).unwrap_err();
        assert_eq!(err, ConfigurationError::UnknownStrategy("foobar".into()));
    }

    #[test]
    fn test_empty_axis() {
        let declaration = map(json!({"matrix": {"foo": [0, 1], "bar": []}}));
        let err = Strategy::load(&declaration, defaults()).unwrap_err();
        assert_eq!(err, ConfigurationError::EmptyAxis("bar".into()));
    }

    #[test]
    fn test_matrix_order_first_axis_slowest() {
        let declaration = map(json!({"matrix": {"foo": [0, 1, 2], "bar": [3, 4]}}));
        let strategy = Strategy::load(&declaration, Configuration::new()).unwrap();
        let pairs: Vec<(Value, Value)> = strategy
            .tasks()
            .iter()
            .map(|t| {
                (
                    t.configuration.get("foo").cloned().unwrap(),
                    t.configuration.get("bar").cloned().unwrap(),
                )
            })
            .collect();
        assert_eq!(
            pairs,
            vec![
                (json!(0), json!(3)),
                (json!(0), json!(4)),
                (json!(1), json!(3)),
                (json!(1), json!(4)),
                (json!(2), json!(3)),
                (json!(2), json!(4)),
            ]
        );
    }

    #[test]
    fn test_ordinal_names() {
        let declaration = map(json!({"sequence": {"eggs": [1, 2, 3]}, "prefix": "case"}));
        let strategy = Strategy::load(&declaration, defaults()).unwrap();
        let names: Vec<&str> = strategy.tasks().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["case_00", "case_01", "case_02"]);
    }

    #[test]
    fn test_ordinal_width_grows() {
        assert_eq!(ordinal_width(1), 2);
        assert_eq!(ordinal_width(100), 2);
        assert_eq!(ordinal_width(101), 3);
        assert_eq!(ordinal_width(1000), 3);
        assert_eq!(ordinal_width(1001), 4);
    }

    #[test]
    fn test_value_names() {
        let declaration = map(json!({
            "matrix": {"initial.spam": [0.5, 1.0], "eggs": ["a", "b"]},
            "naming": "value"
        }));
        let strategy = Strategy::load(&declaration, defaults()).unwrap();
        let names: Vec<&str> = strategy.tasks().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "spam_0.5_eggs_a",
                "spam_0.5_eggs_b",
                "spam_1.0_eggs_a",
                "spam_1.0_eggs_b"
            ]
        );
    }

    #[test]
    fn test_value_names_must_be_unique() {
        let declaration = map(json!({"sequence": {"eggs": [1, "1"]}, "naming": "value"}));
        let err = Strategy::load(&declaration, defaults()).unwrap_err();
        assert_eq!(err, ConfigurationError::DuplicateTaskName("eggs_1".into()));
    }

    #[test]
    fn test_explicit_names() {
        let declaration = map(json!({
            "sequence": {"eggs": [1, 2]},
            "names": ["low", "high"]
        }));
        let strategy = Strategy::load(&declaration, defaults()).unwrap();
        assert_eq!(strategy.tasks()[0].name, "low");
        assert_eq!(strategy.tasks()[1].name, "high");
    }

    #[test]
    fn test_explicit_names_duplicate_or_miscounted() {
        let duplicate = map(json!({"sequence": {"eggs": [1, 2]}, "names": ["a", "a"]}));
        assert_eq!(
            Strategy::load(&duplicate, defaults()).unwrap_err(),
            ConfigurationError::DuplicateTaskName("a".into())
        );

        let short = map(json!({"sequence": {"eggs": [1, 2]}, "names": ["a"]}));
        assert_eq!(
            Strategy::load(&short, defaults()).unwrap_err(),
            ConfigurationError::NameCountMismatch {
                expected: 2,
                got: 1
            }
        );
    }

    #[test]
    fn test_names_must_be_single_path_components() {
        for bad in ["../escape", "a/b", "a\\b", ".."] {
            let declaration = map(json!({"sequence": {"eggs": [1, 2]}, "names": [bad, "ok"]}));
            assert_eq!(
                Strategy::load(&declaration, defaults()).unwrap_err(),
                ConfigurationError::InvalidTaskName(bad.into())
            );
        }

        let declaration = map(json!({"sequence": {"eggs": [1, 2]}, "prefix": "runs/case"}));
        assert_eq!(
            Strategy::load(&declaration, defaults()).unwrap_err(),
            ConfigurationError::InvalidTaskName("runs/case".into())
        );
    }

    #[test]
    fn test_value_names_replace_separators() {
        let declaration = map(json!({
            "sequence": {"mechanism": ["data/gri30.yaml", "h2o2\\v2"]},
            "naming": "value"
        }));
        let strategy = Strategy::load(&declaration, defaults()).unwrap();
        let names: Vec<&str> = strategy.tasks().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["mechanism_data-gri30.yaml", "mechanism_h2o2-v2"]);
    }

    #[test]
    fn test_task_at_maps_axis_positions() {
        let declaration = map(json!({"matrix": {"foo": [0, 1, 2], "bar": [3, 4]}}));
        let strategy = Strategy::load(&declaration, defaults()).unwrap();
        let task = strategy.task_at(&[2, 0]).unwrap();
        assert_eq!(task.index, 4);
        assert_eq!(task.configuration.get("foo"), Some(&json!(2)));
        assert_eq!(task.configuration.get("bar"), Some(&json!(3)));
        assert!(strategy.task_at(&[3, 0]).is_none());
        assert!(strategy.task_at(&[1]).is_none());

        let declaration = map(json!({"sequence": {"eggs": [1, 2, 3]}}));
        let strategy = Strategy::load(&declaration, defaults()).unwrap();
        assert_eq!(strategy.task_at(&[1]).map(|t| t.name.as_str()), Some("task_01"));
        assert!(strategy.task_at(&[0, 1]).is_none());
    }

    #[test]
    fn test_named_selection() {
        let declaration = map(json!({
            "sequence-1": {"spam": [0.4, 0.6]},
            "sequence-2": {"eggs": [1, 2, 3]}
        }));
        let err = Strategy::load(&declaration, defaults()).unwrap_err();
        assert!(matches!(err, ConfigurationError::AmbiguousStrategy(_)));

        let strategy = Strategy::load_named(&declaration, defaults(), Some("sequence-2")).unwrap();
        assert_eq!(strategy.label(), "sequence-2");
        assert_eq!(strategy.len(), 3);

        let err = Strategy::load_named(&declaration, defaults(), Some("matrix")).unwrap_err();
        assert_eq!(err, ConfigurationError::UnknownStrategy("matrix".into()));
    }

    #[test]
    fn test_missing_strategy() {
        let declaration = map(json!({"prefix": "case"}));
        let err = Strategy::load(&declaration, defaults()).unwrap_err();
        assert_eq!(err, ConfigurationError::MissingStrategy);
    }

    #[test]
    fn test_legacy_declaration() {
        let declaration = map(json!({"entry": "sleep", "values": [0.4, 0.6, 0.8]}));
        let strategy = Strategy::load(&declaration, Configuration::new()).unwrap();
        assert_eq!(strategy.spec().kind(), "sequence");
        assert_eq!(strategy.label(), "legacy");
        let values: Vec<&Value> = strategy
            .tasks()
            .iter()
            .filter_map(|t| t.configuration.get("sleep"))
            .collect();
        assert_eq!(values, vec![&json!(0.4), &json!(0.6), &json!(0.8)]);
    }

    #[test]
    fn test_legacy_entry_segments() {
        let declaration = map(json!({"entry": ["initial", "phi"], "values": [0.8, 1.0]}));
        let spec = VariationSpec::legacy_from_map(&declaration).unwrap();
        assert_eq!(
            spec,
            VariationSpec::Legacy {
                entry: "initial.phi".into(),
                values: vec![json!(0.8), json!(1.0)]
            }
        );
    }

    #[test]
    fn test_sobol_declaration() {
        let declaration = map(json!({
            "sobol": {"ranges": {"spam": [1.0, 2.0]}, "samples": 4}
        }));
        let strategy = Strategy::load(&declaration, defaults()).unwrap();
        let values: Vec<f64> = strategy
            .tasks()
            .iter()
            .filter_map(|t| t.configuration.get("spam").and_then(Value::as_f64))
            .collect();
        assert_eq!(values, vec![1.5, 1.75, 1.25, 1.375]);
    }

    #[test]
    fn test_sobol_large_seed() {
        let declaration = map(json!({
            "sobol": {"ranges": {"spam": [0.0, 1.0]}, "samples": 2, "seed": 3_000_000_000u64}
        }));
        let strategy = Strategy::load(&declaration, defaults()).unwrap();
        let sequence = SobolSequence::new(1).unwrap();
        let values: Vec<f64> = strategy
            .tasks()
            .iter()
            .filter_map(|t| t.configuration.get("spam").and_then(Value::as_f64))
            .collect();
        assert_eq!(
            values,
            vec![sequence.point(3_000_000_001)[0], sequence.point(3_000_000_002)[0]]
        );
    }

    #[test]
    fn test_sobol_inline_ranges() {
        let declaration = map(json!({"sobol": {"spam": [0.0, 1.0], "eggs": [0.0, 10.0], "samples": 2}}));
        let strategy = Strategy::load(&declaration, defaults()).unwrap();
        assert_eq!(strategy.spec().keys(), vec!["spam", "eggs"]);
        assert_eq!(strategy.len(), 2);
    }

    #[test]
    fn test_sobol_invalid_inputs() {
        let inverted = map(json!({"sobol": {"ranges": {"spam": [2.0, 1.0]}, "samples": 4}}));
        assert!(matches!(
            Strategy::load(&inverted, defaults()).unwrap_err(),
            ConfigurationError::InvalidBounds { .. }
        ));

        let zero = map(json!({"sobol": {"ranges": {"spam": [1.0, 2.0]}, "samples": 0}}));
        assert_eq!(
            Strategy::load(&zero, defaults()).unwrap_err(),
            ConfigurationError::InvalidSampleCount(0)
        );

        let negative = map(json!({"sobol": {"ranges": {"spam": [1.0, 2.0]}, "samples": -3}}));
        assert_eq!(
            Strategy::load(&negative, defaults()).unwrap_err(),
            ConfigurationError::InvalidSampleCount(-3)
        );
    }

    #[test]
    fn test_variation_through_scalar_rejected() {
        let declaration = map(json!({"sequence": {"spam.inner": [1, 2]}}));
        let err = Strategy::load(&declaration, defaults()).unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidEntry { .. }));
    }

    #[test]
    fn test_info_mentions_kind_and_count() {
        let declaration = map(json!({"matrix": {"foo": [0, 1], "bar": [3, 4]}}));
        let strategy = Strategy::load(&declaration, defaults()).unwrap();
        assert_eq!(strategy.info(), "matrix strategy 'matrix' over [foo, bar]: 4 tasks");
    }
}
