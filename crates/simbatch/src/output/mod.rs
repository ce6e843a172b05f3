//! Per-task artifact persistence.
//!
//! An [`Output`] writes one artifact per task name. Each artifact goes through
//! a fixed lifecycle: it is opened by the first `save`, overwritten by every
//! further `save` (the last snapshot wins), and closed by exactly one
//! `finalize`, which also records the task's [`ArtifactMetadata`]. Only
//! finalized, successful artifacts are visible to [`Output::load_like`], which
//! is what restart with `skip_existing` relies on.
//!
//! Two formats are supported:
//! - `csv`: one delimited-text file per task plus a JSON metadata sidecar
//! - `sqlite`: a single container file with one group (row) per task

mod container;
mod delimited;

pub use container::ContainerWriter;
pub use delimited::CsvWriter;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::{Configuration, Payload, value_kind};
use crate::error::{ConfigurationError, FailureKind, OutputError};

/// Version stamped into every artifact's metadata
pub const FORMAT_VERSION: u32 = 1;

/// Final state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Success,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        }
    }

    pub(crate) fn parse(text: &str) -> Option<Self> {
        match text {
            "success" => Some(TaskStatus::Success),
            "failed" => Some(TaskStatus::Failed),
            "skipped" => Some(TaskStatus::Skipped),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attributes recorded with an artifact when it is finalized
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub task: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub configuration: Configuration,
    #[serde(default)]
    pub variation: Map<String, Value>,
    pub duration_secs: f64,
    pub format_version: u32,
    /// Set by the writer when the artifact is finalized
    #[serde(default)]
    pub finalized_at: Option<jiff::Timestamp>,
}

impl ArtifactMetadata {
    pub fn new(task: impl Into<String>, status: TaskStatus, configuration: Configuration) -> Self {
        Self {
            task: task.into(),
            status,
            error: None,
            configuration,
            variation: Map::new(),
            duration_secs: 0.0,
            format_version: FORMAT_VERSION,
            finalized_at: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_variation(mut self, variation: Map<String, Value>) -> Self {
        self.variation = variation;
        self
    }

    pub fn with_duration(mut self, duration_secs: f64) -> Self {
        self.duration_secs = duration_secs;
        self
    }

    /// Copy stamped with the finalize time, unless one is already set
    fn stamped(&self) -> Self {
        let mut out = self.clone();
        out.finalized_at.get_or_insert_with(jiff::Timestamp::now);
        out
    }
}

// ============================================================================
// Settings
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Flat delimited text, one file per task
    Csv,
    /// Hierarchical SQLite container, one group per task
    Sqlite,
}

impl OutputFormat {
    /// Resolve a format name or file extension (leading `.` ignored)
    pub fn from_extension(ext: &str) -> Result<Self, ConfigurationError> {
        match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "csv" => Ok(OutputFormat::Csv),
            "db" | "sqlite" | "sqlite3" => Ok(OutputFormat::Sqlite),
            other => Err(ConfigurationError::UnsupportedFormat(other.to_string())),
        }
    }

    /// Default file extension
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Csv => "csv",
            OutputFormat::Sqlite => "db",
        }
    }
}

/// Parsed `output:` section of a batch declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSettings {
    /// Base file name without extension
    pub name: String,
    pub format: OutputFormat,
    /// Output directory; current directory when unset
    pub path: Option<PathBuf>,
    /// Replace finalized artifacts left by an earlier run
    pub force: bool,
    /// Skip tasks whose finalized artifact already exists
    pub skip_existing: bool,
    /// Extension given with the name, when it differs from the default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
}

impl OutputSettings {
    pub fn new(name: impl Into<String>, format: OutputFormat) -> Self {
        Self {
            name: name.into(),
            format,
            path: None,
            force: false,
            skip_existing: false,
            extension: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_skip_existing(mut self, skip_existing: bool) -> Self {
        self.skip_existing = skip_existing;
        self
    }

    /// Parse an `output:` mapping.
    pub fn from_dict(settings: &Map<String, Value>) -> Result<Self, ConfigurationError> {
        Self::from_dict_with(settings, None, None)
    }

    /// Parse an `output:` mapping with optional name and path overrides.
    ///
    /// An override name may carry a directory, which then supplies the path;
    /// giving a directory in the name and an explicit path is contradictory.
    pub fn from_dict_with(
        settings: &Map<String, Value>,
        name: Option<&str>,
        path: Option<&Path>,
    ) -> Result<Self, ConfigurationError> {
        let mut settings = settings.clone();
        for (old, new) in [("force_overwrite", "force"), ("file_name", "name")] {
            if let Some(value) = settings.remove(old) {
                tracing::warn!("output key '{old}' is deprecated, use '{new}'");
                settings.entry(new).or_insert(value);
            }
        }

        let mut format = match settings.get("format") {
            None | Some(Value::Null) => None,
            Some(Value::String(f)) => Some(OutputFormat::from_extension(f)?),
            Some(other) => {
                return Err(ConfigurationError::invalid(
                    "format",
                    format!("expected a string, found {}", value_kind(other)),
                ));
            }
        };

        let mut dir = match (path, settings.get("path")) {
            (Some(path), _) => Some(path.to_path_buf()),
            (None, None | Some(Value::Null)) => None,
            (None, Some(Value::String(p))) => Some(PathBuf::from(p)),
            (None, Some(other)) => {
                return Err(ConfigurationError::invalid(
                    "path",
                    format!("expected a string, found {}", value_kind(other)),
                ));
            }
        };

        let raw_name = match name {
            Some(name) => name.to_string(),
            None => match settings.get("name") {
                Some(Value::String(n)) if !n.is_empty() => n.clone(),
                _ => return Err(ConfigurationError::invalid("name", "missing output name")),
            },
        };

        let raw_name = PathBuf::from(raw_name);
        if let Some(parent) = raw_name.parent().filter(|p| !p.as_os_str().is_empty()) {
            if dir.is_some() {
                return Err(ConfigurationError::ContradictoryPath);
            }
            dir = Some(parent.to_path_buf());
        }

        let mut extension = None;
        let mut stem = raw_name
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if let Some(ext) = raw_name.extension().map(|e| e.to_string_lossy().into_owned()) {
            match OutputFormat::from_extension(&ext) {
                Ok(from_name) => {
                    if *format.get_or_insert(from_name) == from_name
                        && ext != from_name.extension()
                    {
                        extension = Some(ext.clone());
                    }
                    stem.truncate(stem.len() - ext.len() - 1);
                }
                Err(err) if format.is_none() => return Err(err),
                Err(_) => {}
            }
        }
        if stem.is_empty() {
            return Err(ConfigurationError::invalid("name", "empty output name"));
        }

        let format = format.ok_or_else(|| {
            ConfigurationError::invalid("format", "not given and not implied by the name")
        })?;

        Ok(Self {
            name: stem,
            format,
            path: dir,
            force: flag(&settings, "force")?,
            skip_existing: flag(&settings, "skip_existing")?,
            extension,
        })
    }

    /// Directory artifacts are written to
    pub fn directory(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(|| PathBuf::from("."))
    }

    /// File name including the format extension
    pub fn file_name(&self) -> String {
        let ext = self
            .extension
            .as_deref()
            .unwrap_or_else(|| self.format.extension());
        format!("{}.{ext}", self.name)
    }
}

fn flag(settings: &Map<String, Value>, key: &str) -> Result<bool, ConfigurationError> {
    match settings.get(key) {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(b)) => Ok(*b),
        Some(other) => Err(ConfigurationError::invalid(
            key,
            format!("expected a bool, found {}", value_kind(other)),
        )),
    }
}

// ============================================================================
// Writers
// ============================================================================

/// Artifact writer, selected once from [`OutputSettings::format`]
#[derive(Debug)]
pub enum Output {
    Csv(CsvWriter),
    Container(ContainerWriter),
}

impl Output {
    pub fn from_dict(settings: &Map<String, Value>) -> Result<Self, ConfigurationError> {
        Ok(Self::from_settings(OutputSettings::from_dict(settings)?))
    }

    /// Writers open files lazily; construction does no I/O.
    pub fn from_settings(settings: OutputSettings) -> Self {
        match settings.format {
            OutputFormat::Csv => Output::Csv(CsvWriter::new(settings)),
            OutputFormat::Sqlite => Output::Container(ContainerWriter::new(settings)),
        }
    }

    pub fn settings(&self) -> &OutputSettings {
        match self {
            Output::Csv(w) => w.settings(),
            Output::Container(w) => w.settings(),
        }
    }

    /// Replace the task's current snapshot with `payload`.
    pub fn save(&mut self, task: &str, payload: &Payload) -> Result<(), OutputError> {
        match self {
            Output::Csv(w) => w.save(task, payload),
            Output::Container(w) => w.save(task, payload),
        }
    }

    /// Close the task's artifact and record its metadata. Allowed once.
    pub fn finalize(&mut self, task: &str, metadata: &ArtifactMetadata) -> Result<(), OutputError> {
        match self {
            Output::Csv(w) => w.finalize(task, metadata),
            Output::Container(w) => w.finalize(task, metadata),
        }
    }

    /// Payload of a finalized, successful artifact. Never writes.
    pub fn load_like(&self, task: &str) -> Option<Payload> {
        match self {
            Output::Csv(w) => w.load_like(task),
            Output::Container(w) => w.load_like(task),
        }
    }

    /// Like [`Output::load_like`], but only when the stored payload has the
    /// shape of `template`: every template key is present and holds a value
    /// of the same kind, recursively. A `null` in the template matches any
    /// value, and the first item of a template list constrains every item.
    pub fn load_matching(&self, task: &str, template: &Payload) -> Option<Payload> {
        let payload = self.load_like(task)?;
        if conforms_map(&payload, template) {
            Some(payload)
        } else {
            tracing::debug!("stored payload for '{task}' does not match the template");
            None
        }
    }

    /// Metadata of a finalized artifact
    pub fn metadata(&self, task: &str) -> Option<ArtifactMetadata> {
        match self {
            Output::Csv(w) => w.metadata(task),
            Output::Container(w) => w.metadata(task),
        }
    }

    /// Names of all finalized artifacts, sorted
    pub fn dir(&self) -> Vec<String> {
        match self {
            Output::Csv(w) => w.dir(),
            Output::Container(w) => w.dir(),
        }
    }

    /// Location of the task's artifact, e.g. `out/run_case_00.csv` or `out/run.db#case_00`
    pub fn output_reference(&self, task: &str) -> String {
        match self {
            Output::Csv(w) => w.data_path(task).display().to_string(),
            Output::Container(w) => format!("{}#{task}", w.file_path().display()),
        }
    }

    /// Record batch-level metadata next to the artifacts, replacing any earlier record.
    pub fn save_batch_metadata(&mut self, metadata: &Map<String, Value>) -> Result<(), OutputError> {
        match self {
            Output::Csv(w) => w.save_batch_metadata(metadata),
            Output::Container(w) => w.save_batch_metadata(metadata),
        }
    }

    pub fn batch_metadata(&self) -> Option<Map<String, Value>> {
        match self {
            Output::Csv(w) => w.batch_metadata(),
            Output::Container(w) => w.batch_metadata(),
        }
    }

    /// Whether independent writers may finalize into the same target at once
    pub fn concurrent_finalize_safe(&self) -> bool {
        match self {
            Output::Csv(_) => true,
            Output::Container(_) => false,
        }
    }
}

fn conforms_map(payload: &Map<String, Value>, template: &Map<String, Value>) -> bool {
    template
        .iter()
        .all(|(key, expected)| payload.get(key).is_some_and(|value| conforms(value, expected)))
}

fn conforms(value: &Value, template: &Value) -> bool {
    match (value, template) {
        (_, Value::Null) => true,
        (Value::Object(value), Value::Object(template)) => conforms_map(value, template),
        (Value::Array(items), Value::Array(template)) => match template.first() {
            Some(expected) => items.iter().all(|item| conforms(item, expected)),
            None => true,
        },
        (Value::Bool(_), Value::Bool(_))
        | (Value::Number(_), Value::Number(_))
        | (Value::String(_), Value::String(_)) => true,
        _ => false,
    }
}

/// Output handle scoped to a single task, passed to the simulation entry point.
///
/// Snapshots saved through the handle follow the last-save-wins rule; the
/// handler finalizes the artifact once the entry point returns.
#[derive(Debug)]
pub struct TaskOutput<'a> {
    name: &'a str,
    output: Option<&'a mut Output>,
    saves: usize,
    /// Kind of the first save that failed
    save_failure: Option<FailureKind>,
}

impl<'a> TaskOutput<'a> {
    pub fn new(name: &'a str, output: Option<&'a mut Output>) -> Self {
        Self {
            name,
            output,
            saves: 0,
            save_failure: None,
        }
    }

    /// Handle that persists nothing
    pub fn detached(name: &'a str) -> Self {
        Self::new(name, None)
    }

    pub fn name(&self) -> &str {
        self.name
    }

    /// Whether saves reach an artifact
    pub fn is_persistent(&self) -> bool {
        self.output.is_some()
    }

    /// Save an intermediate snapshot. A no-op without an output.
    pub fn save(&mut self, payload: &Payload) -> Result<(), OutputError> {
        if let Some(output) = self.output.as_deref_mut()
            && let Err(err) = output.save(self.name, payload)
        {
            self.save_failure.get_or_insert(err.kind());
            return Err(err);
        }
        self.saves += 1;
        Ok(())
    }

    /// Number of snapshots saved so far
    pub fn saved(&self) -> usize {
        self.saves
    }

    /// Kind of the first failed save, if any
    pub fn save_failure(&self) -> Option<FailureKind> {
        self.save_failure
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

    #[test]
    fn test_settings_format_from_extension() {
        let settings = OutputSettings::from_dict(&map(json!({"name": "results.db"}))).unwrap();
        assert_eq!(settings.name, "results");
        assert_eq!(settings.format, OutputFormat::Sqlite);
        assert_eq!(settings.path, None);
        assert!(!settings.force);
    }

    #[test]
    fn test_settings_explicit_format() {
        let settings =
            OutputSettings::from_dict(&map(json!({"name": "results", "format": ".csv", "path": "out"})))
                .unwrap();
        assert_eq!(settings.format, OutputFormat::Csv);
        assert_eq!(settings.path, Some(PathBuf::from("out")));
        assert_eq!(settings.file_name(), "results.csv");
    }

    #[test]
    fn test_settings_unsupported_format() {
        let err = OutputSettings::from_dict(&map(json!({"name": "results.h5"}))).unwrap_err();
        assert_eq!(err, ConfigurationError::UnsupportedFormat("h5".into()));

        let err =
            OutputSettings::from_dict(&map(json!({"name": "results", "format": "xlsx"}))).unwrap_err();
        assert_eq!(err, ConfigurationError::UnsupportedFormat("xlsx".into()));

        let err = OutputSettings::from_dict(&map(json!({"name": "results"}))).unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidEntry { .. }));
    }

    #[test]
    fn test_settings_deprecated_keys() {
        let settings = OutputSettings::from_dict(&map(json!({
            "file_name": "legacy.csv",
            "force_overwrite": true
        })))
        .unwrap();
        assert_eq!(settings.name, "legacy");
        assert!(settings.force);
    }

    #[test]
    fn test_settings_name_with_directory() {
        let settings = OutputSettings::from_dict(&map(json!({"name": "runs/batch.sqlite"}))).unwrap();
        assert_eq!(settings.name, "batch");
        assert_eq!(settings.path, Some(PathBuf::from("runs")));
        assert_eq!(settings.file_name(), "batch.sqlite");

        let err = OutputSettings::from_dict(&map(json!({"name": "runs/batch.db", "path": "other"})))
            .unwrap_err();
        assert_eq!(err, ConfigurationError::ContradictoryPath);
    }

    #[test]
    fn test_settings_overrides() {
        let base = map(json!({"name": "batch", "format": "csv"}));
        let settings = OutputSettings::from_dict_with(&base, Some("other.csv"), Some(Path::new("tmp")))
            .unwrap();
        assert_eq!(settings.name, "other");
        assert_eq!(settings.path, Some(PathBuf::from("tmp")));
    }

    #[test]
    fn test_settings_bad_flag() {
        let err = OutputSettings::from_dict(&map(json!({"name": "a.csv", "force": "yes"}))).unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidEntry { .. }));
    }

    #[test]
    fn test_task_output_detached() {
        let mut handle = TaskOutput::detached("case_00");
        assert!(!handle.is_persistent());
        handle.save(&map(json!({"x": 1}))).unwrap();
        handle.save(&map(json!({"x": 2}))).unwrap();
        assert_eq!(handle.saved(), 2);
        assert_eq!(handle.name(), "case_00");
    }

    #[test]
    fn test_metadata_serializes_status_lowercase() {
        let metadata = ArtifactMetadata::new("case_00", TaskStatus::Failed, Configuration::new())
            .with_error("boom");
        let value = serde_json::to_value(&metadata).unwrap();
        assert_eq!(value["status"], json!("failed"));
        assert_eq!(value["error"], json!("boom"));
        assert_eq!(value["format_version"], json!(FORMAT_VERSION));
    }
}
