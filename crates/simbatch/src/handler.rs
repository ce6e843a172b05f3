//! Batch execution: loading a batch declaration, running its tasks serially or
//! on a worker pool, and persisting each task's result.
//!
//! A batch declaration is a mapping with these sections:
//!
//! ```yaml
//! defaults:            # or `base`
//!   sleep: 0.2
//! strategy:            # or the legacy `variation`
//!   sequence:
//!     sleep: [0.4, 0.6, 0.8]
//! output:              # optional
//!   name: results.db
//! handler:             # optional, see HandlerConfig
//!   number_of_processes: 4
//!   verbosity: 1
//! ```

use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::{Configuration, Payload, load_yaml_file, parse_yaml, value_kind};
use crate::error::{BoxError, ConfigurationError, FailureKind, OutputError, SimulationError};
use crate::output::{ArtifactMetadata, Output, OutputSettings, TaskOutput, TaskStatus};
use crate::strategy::{Strategy, Task};

/// A simulation entry point.
///
/// Receives the task's configuration and an output handle for intermediate
/// snapshots, and returns the final payload. Entry points are shared by all
/// workers of a parallel run, hence the `Sync` bound.
pub trait Simulation: Sync {
    fn run(&self, config: &Configuration, output: &mut TaskOutput<'_>) -> Result<Payload, BoxError>;
}

impl<F> Simulation for F
where
    F: Fn(&Configuration, &mut TaskOutput<'_>) -> Result<Payload, BoxError> + Sync,
{
    fn run(&self, config: &Configuration, output: &mut TaskOutput<'_>) -> Result<Payload, BoxError> {
        self(config, output)
    }
}

/// Identity helper that pins a closure to the entry-point signature.
pub fn simulation_fn<F>(f: F) -> F
where
    F: Fn(&Configuration, &mut TaskOutput<'_>) -> Result<Payload, BoxError> + Sync,
{
    f
}

/// Explicit handler options; nothing is read from process-wide state.
/// Unknown keys are rejected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HandlerConfig {
    /// Worker count for parallel runs; all available cores when unset
    pub number_of_processes: Option<usize>,
    /// 0: silent, 1: per-task progress, 2: also worker lifecycle
    pub verbosity: u8,
    /// Skip tasks whose finalized artifact already exists
    pub skip_existing: bool,
    /// Strategy to select when several are declared
    pub strategy: Option<String>,
    /// Overrides the output name (may include a directory)
    pub output_name: Option<String>,
    /// Overrides the output directory
    pub output_path: Option<PathBuf>,
}

/// Worker count used when none is configured
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

// ============================================================================
// Results
// ============================================================================

/// Why a task failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl TaskFailure {
    /// An entry point that fails on an output error, whether it returned the
    /// error itself or gave up after a failed save, fails with the output
    /// error's kind.
    fn from_simulation(err: SimulationError, save_failure: Option<FailureKind>) -> Self {
        let kind = match &err {
            SimulationError::Failed(source) => source
                .downcast_ref::<OutputError>()
                .map(OutputError::kind)
                .or(save_failure)
                .unwrap_or(FailureKind::Simulation),
            SimulationError::Panicked(_) => FailureKind::Simulation,
        };
        Self {
            kind,
            message: err.to_string(),
        }
    }
}

impl From<OutputError> for TaskFailure {
    fn from(err: OutputError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Outcome of one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub name: String,
    pub index: usize,
    pub status: TaskStatus,
    pub error: Option<TaskFailure>,
    pub duration: Duration,
    /// Artifact location, when an output is configured
    pub output_reference: Option<String>,
}

impl TaskResult {
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Success
    }

    /// Copy with the duration zeroed, for comparing runs
    pub fn without_timing(&self) -> Self {
        Self {
            duration: Duration::ZERO,
            ..self.clone()
        }
    }
}

/// Aggregate counts over a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Sum of per-task durations
    pub task_time: Duration,
    /// Every executed task failed to persist its artifact
    pub persistence_failed_everywhere: bool,
}

impl BatchSummary {
    pub fn from_results(results: &[TaskResult]) -> Self {
        let count = |status: TaskStatus| results.iter().filter(|r| r.status == status).count();
        let executed: Vec<&TaskResult> = results
            .iter()
            .filter(|r| r.status != TaskStatus::Skipped)
            .collect();
        let persistence_failed_everywhere = !executed.is_empty()
            && executed.iter().all(|r| {
                r.error
                    .as_ref()
                    .is_some_and(|e| e.kind == FailureKind::Persistence)
            });

        Self {
            total: results.len(),
            succeeded: count(TaskStatus::Success),
            failed: count(TaskStatus::Failed),
            skipped: count(TaskStatus::Skipped),
            task_time: results.iter().map(|r| r.duration).sum(),
            persistence_failed_everywhere,
        }
    }
}

// ============================================================================
// Handler
// ============================================================================

/// Runs the tasks of one batch
#[derive(Debug, Clone)]
pub struct Handler {
    strategy: Strategy,
    output: Option<OutputSettings>,
    config: HandlerConfig,
}

impl Handler {
    pub fn new(strategy: Strategy, output: Option<OutputSettings>, config: HandlerConfig) -> Self {
        let output = output.map(|settings| {
            let skip = settings.skip_existing || config.skip_existing;
            settings.with_skip_existing(skip)
        });
        let handler = Self {
            strategy,
            output,
            config,
        };
        if handler.verbose() {
            tracing::info!("{}", handler.strategy.info());
        }
        handler
    }

    /// Load a batch declaration file, taking options from its `handler` section.
    pub fn from_yaml(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        Self::from_dict(&load_yaml_file(path.as_ref())?)
    }

    /// Load a batch declaration file with explicit options.
    pub fn from_yaml_with(
        path: impl AsRef<Path>,
        config: HandlerConfig,
    ) -> Result<Self, ConfigurationError> {
        Self::from_dict_with(&load_yaml_file(path.as_ref())?, Some(config))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigurationError> {
        Self::from_dict(&parse_yaml(text)?)
    }

    pub fn from_dict(content: &Map<String, Value>) -> Result<Self, ConfigurationError> {
        Self::from_dict_with(content, None)
    }

    /// Build from a parsed declaration. An explicit `config` replaces the
    /// declaration's own `handler` section.
    pub fn from_dict_with(
        content: &Map<String, Value>,
        config: Option<HandlerConfig>,
    ) -> Result<Self, ConfigurationError> {
        let config = match config {
            Some(config) => config,
            None => match content.get("handler") {
                None | Some(Value::Null) => HandlerConfig::default(),
                Some(section) => serde_json::from_value(section.clone())
                    .map_err(|e| ConfigurationError::invalid("handler", e.to_string()))?,
            },
        };

        let base = match (content.get("defaults"), content.get("base")) {
            (Some(_), Some(_)) => {
                return Err(ConfigurationError::invalid(
                    "defaults",
                    "give either 'defaults' or 'base', not both",
                ));
            }
            (Some(section), None) | (None, Some(section)) => section_map("defaults", section)?,
            (None, None) => Map::new(),
        };
        let base = Configuration::from(base);

        let declaration = match (content.get("variation"), content.get("strategy")) {
            (Some(_), Some(_)) => {
                return Err(ConfigurationError::invalid(
                    "strategy",
                    "give either 'strategy' or 'variation', not both",
                ));
            }
            (Some(section), None) | (None, Some(section)) => section_map("strategy", section)?,
            (None, None) => return Err(ConfigurationError::MissingStrategy),
        };
        let strategy = Strategy::load_named(&declaration, base, config.strategy.as_deref())?;

        let output = match content.get("output") {
            None | Some(Value::Null) => None,
            Some(section) => Some(OutputSettings::from_dict_with(
                &section_map("output", section)?,
                config.output_name.as_deref(),
                config.output_path.as_deref(),
            )?),
        };

        Ok(Self::new(strategy, output, config))
    }

    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    pub fn output_settings(&self) -> Option<&OutputSettings> {
        self.output.as_ref()
    }

    /// Tasks in declaration order
    pub fn tasks(&self) -> &[Task] {
        self.strategy.tasks()
    }

    pub fn task(&self, name: &str) -> Option<&Task> {
        self.tasks().iter().find(|t| t.name == name)
    }

    /// Full configuration of the named task
    pub fn configuration(&self, name: &str) -> Option<&Configuration> {
        self.task(name).map(|t| &t.configuration)
    }

    /// Base configuration, strategy definition and task names
    pub fn metadata(&self) -> Map<String, Value> {
        let mut strategy = Map::new();
        strategy.insert(self.strategy.label().to_string(), self.strategy.definition());

        let mut out = Map::new();
        out.insert(
            "defaults".into(),
            Value::Object(self.strategy.base().as_map().clone()),
        );
        out.insert("strategy".into(), Value::Object(strategy));
        out.insert(
            "tasks".into(),
            self.tasks().iter().map(|t| Value::from(t.name.as_str())).collect(),
        );
        out
    }

    pub fn summary(&self, results: &[TaskResult]) -> BatchSummary {
        BatchSummary::from_results(results)
    }

    fn verbose(&self) -> bool {
        self.config.verbosity > 0
    }

    fn workers(&self) -> usize {
        self.config.number_of_processes.unwrap_or_else(default_workers)
    }

    fn open_output(&self) -> Option<Output> {
        self.output.clone().map(Output::from_settings)
    }

    /// Run a single task with its own output writer.
    pub fn run_task<S: Simulation + ?Sized>(&self, task: &Task, sim: &S) -> TaskResult {
        let mut output = self.open_output();
        self.execute(task, sim, output.as_mut(), None)
    }

    /// Run all tasks one after another, in declaration order.
    pub fn run_serial<S: Simulation + ?Sized>(&self, sim: &S) -> Vec<TaskResult> {
        let started = Instant::now();
        let mut output = self.open_output();
        if let Some(out) = output.as_mut() {
            self.record_batch(out);
        }
        let results: Vec<TaskResult> = self
            .tasks()
            .iter()
            .map(|task| self.execute(task, sim, output.as_mut(), None))
            .collect();
        self.report(&results, started.elapsed());
        results
    }

    /// Run all tasks on a pool of `number_of_workers` threads.
    ///
    /// Each task opens its own output writer. Results are returned in
    /// declaration order regardless of completion order.
    #[cfg(feature = "parallel")]
    pub fn run_parallel<S: Simulation + ?Sized>(
        &self,
        sim: &S,
        number_of_workers: Option<usize>,
    ) -> Vec<TaskResult> {
        use std::sync::mpsc::channel;

        let workers = number_of_workers.unwrap_or_else(|| self.workers()).max(1);
        let pool = match rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("simbatch-worker-{i}"))
            .build()
        {
            Ok(pool) => pool,
            Err(err) => {
                tracing::warn!("cannot start worker pool ({err}), running serially");
                return self.run_serial(sim);
            }
        };
        if self.verbose() {
            tracing::info!("running {} tasks on {workers} workers", self.tasks().len());
        }

        let started = Instant::now();
        let serialize_finalize = match self.open_output() {
            Some(mut out) => {
                self.record_batch(&mut out);
                !out.concurrent_finalize_safe()
            }
            None => false,
        };
        let finalize_lock = Mutex::new(());
        let (tx, rx) = channel();

        pool.scope(|scope| {
            for task in self.tasks() {
                let tx = tx.clone();
                let lock = serialize_finalize.then_some(&finalize_lock);
                scope.spawn(move |_| {
                    let worker = rayon::current_thread_index().unwrap_or_default();
                    if self.config.verbosity > 1 {
                        tracing::debug!(worker, "worker picked up '{}'", task.name);
                    }
                    let mut output = self.open_output();
                    let result = self.execute(task, sim, output.as_mut(), lock);
                    if self.config.verbosity > 1 {
                        tracing::debug!(worker, "worker finished '{}'", task.name);
                    }
                    // The receiver outlives the scope
                    let _ = tx.send((task.index, result));
                });
            }
        });
        drop(tx);

        let mut slots: Vec<Option<TaskResult>> = vec![None; self.tasks().len()];
        for (index, result) in rx {
            if let Some(slot) = slots.get_mut(index) {
                *slot = Some(result);
            }
        }
        let results: Vec<TaskResult> = slots.into_iter().flatten().collect();
        self.report(&results, started.elapsed());
        results
    }

    /// Without the `parallel` feature tasks run serially.
    #[cfg(not(feature = "parallel"))]
    pub fn run_parallel<S: Simulation + ?Sized>(
        &self,
        sim: &S,
        _number_of_workers: Option<usize>,
    ) -> Vec<TaskResult> {
        tracing::debug!("built without the 'parallel' feature, running serially");
        self.run_serial(sim)
    }

    fn execute<S: Simulation + ?Sized>(
        &self,
        task: &Task,
        sim: &S,
        mut output: Option<&mut Output>,
        finalize_lock: Option<&Mutex<()>>,
    ) -> TaskResult {
        let started = Instant::now();
        let output_reference = output.as_deref().map(|o| o.output_reference(&task.name));

        if let Some(out) = output.as_deref()
            && out.settings().skip_existing
            && out.load_like(&task.name).is_some()
        {
            if self.verbose() {
                tracing::info!("skipping '{}': finalized output exists", task.name);
            }
            return TaskResult {
                name: task.name.clone(),
                index: task.index,
                status: TaskStatus::Skipped,
                error: None,
                duration: started.elapsed(),
                output_reference,
            };
        }

        if self.verbose() {
            tracing::info!("running '{}'", task.name);
        }

        let (outcome, save_failure) = {
            let mut handle = TaskOutput::new(&task.name, output.as_deref_mut());
            let run = panic::catch_unwind(AssertUnwindSafe(|| {
                sim.run(&task.configuration, &mut handle)
            }));
            let outcome = match run {
                Ok(Ok(payload)) => Ok(payload),
                Ok(Err(err)) => Err(SimulationError::Failed(err)),
                Err(panic) => Err(SimulationError::Panicked(panic_message(panic.as_ref()))),
            };
            (outcome, handle.save_failure())
        };
        let duration = started.elapsed();

        let mut failure: Option<TaskFailure> = None;
        let mut persisted: Result<(), OutputError> = Ok(());

        if let Some(out) = output {
            let error_text = outcome.as_ref().err().map(ToString::to_string);
            if let Ok(payload) = &outcome {
                persisted = out.save(&task.name, payload);
            }

            let status = match (&outcome, &persisted) {
                (Ok(_), Ok(())) => TaskStatus::Success,
                _ => TaskStatus::Failed,
            };
            let mut metadata =
                ArtifactMetadata::new(task.name.clone(), status, task.configuration.clone())
                    .with_variation(task.variation_map())
                    .with_duration(duration.as_secs_f64());
            let error_text =
                error_text.or_else(|| persisted.as_ref().err().map(ToString::to_string));
            if let Some(text) = error_text {
                metadata = metadata.with_error(text);
            }

            let finalized = {
                let _guard = finalize_lock.map(|m| m.lock().unwrap_or_else(PoisonError::into_inner));
                out.finalize(&task.name, &metadata)
            };
            persisted = persisted.and(finalized);
        }

        match outcome {
            Err(err) => failure = Some(TaskFailure::from_simulation(err, save_failure)),
            Ok(_) => {
                if let Err(err) = persisted {
                    failure = Some(err.into());
                }
            }
        }

        let status = if failure.is_some() {
            TaskStatus::Failed
        } else {
            TaskStatus::Success
        };

        if let Some(failure) = &failure {
            if self.verbose() {
                tracing::warn!("task '{}' failed: {}", task.name, failure.message);
            }
        } else if self.verbose() {
            tracing::info!("finished '{}' in {:.3}s", task.name, duration.as_secs_f64());
        }

        TaskResult {
            name: task.name.clone(),
            index: task.index,
            status,
            error: failure,
            duration,
            output_reference,
        }
    }

    /// Store [`Handler::metadata`] with the batch's artifacts.
    fn record_batch(&self, output: &mut Output) {
        if let Err(err) = output.save_batch_metadata(&self.metadata()) {
            tracing::warn!("cannot record batch metadata: {err}");
        }
    }

    fn report(&self, results: &[TaskResult], elapsed: Duration) {
        let summary = self.summary(results);
        if summary.persistence_failed_everywhere {
            tracing::error!(
                "no task could persist its output ({} attempted); check the output location",
                summary.total - summary.skipped
            );
        }
        if self.verbose() {
            tracing::info!(
                "batch finished in {:.3}s: {} succeeded, {} failed, {} skipped",
                elapsed.as_secs_f64(),
                summary.succeeded,
                summary.failed,
                summary.skipped
            );
        }
    }
}

fn section_map(key: &str, section: &Value) -> Result<Map<String, Value>, ConfigurationError> {
    match section {
        Value::Object(map) => Ok(map.clone()),
        other => Err(ConfigurationError::invalid(
            key,
            format!("expected a mapping, found {}", value_kind(other)),
        )),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn declaration(text: &str) -> Map<String, Value> {
        parse_yaml(text).unwrap()
    }

    #[test]
    fn test_from_dict_with_legacy_variation() {
        let handler = Handler::from_dict(&declaration(
            "defaults:\n  sleep: 0.2\nvariation:\n  entry: sleep\n  values: [0.4, 0.6]\n",
        ))
        .unwrap();
        assert_eq!(handler.tasks().len(), 2);
        assert_eq!(handler.strategy().kind(), "sequence");
        assert!(handler.output_settings().is_none());
        assert_eq!(
            handler.configuration("task_01").and_then(|c| c.get("sleep")),
            Some(&json!(0.6))
        );
    }

    #[test]
    fn test_from_dict_requires_strategy() {
        let err = Handler::from_dict(&declaration("defaults:\n  sleep: 0.2\n")).unwrap_err();
        assert_eq!(err, ConfigurationError::MissingStrategy);
    }

    #[test]
    fn test_handler_section_is_parsed() {
        let handler = Handler::from_dict(&declaration(
            "strategy:\n  sequence-1:\n    a: [1]\n  sequence-2:\n    b: [1, 2]\n\
             handler:\n  strategy: sequence-2\n  verbosity: 0\n  number_of_processes: 3\n",
        ))
        .unwrap();
        assert_eq!(handler.strategy().label(), "sequence-2");
        assert_eq!(handler.config().number_of_processes, Some(3));
        assert_eq!(handler.workers(), 3);
    }

    #[test]
    fn test_unknown_handler_option_type() {
        let err = Handler::from_dict(&declaration(
            "strategy:\n  sequence:\n    a: [1]\nhandler:\n  verbosity: loud\n",
        ))
        .unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidEntry { .. }));
    }

    #[test]
    fn test_misspelled_handler_option_rejected() {
        let err = Handler::from_dict(&declaration(
            "strategy:\n  sequence:\n    a: [1]\nhandler:\n  skip_exisiting: true\n",
        ))
        .unwrap_err();
        match err {
            ConfigurationError::InvalidEntry { key, reason } => {
                assert_eq!(key, "handler");
                assert!(reason.contains("skip_exisiting"), "{reason}");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_metadata_lists_tasks() {
        let handler = Handler::from_dict(&declaration(
            "base:\n  x: 1\nstrategy:\n  sequence:\n    x: [1, 2]\n  prefix: case\n",
        ))
        .unwrap();
        let metadata = handler.metadata();
        assert_eq!(metadata["tasks"], json!(["case_00", "case_01"]));
        assert_eq!(metadata["defaults"], json!({"x": 1}));
        assert!(metadata["strategy"].get("sequence").is_some());
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
    }

    #[test]
    fn test_summary_flags_persistence_everywhere() {
        let failed = |name: &str, kind| TaskResult {
            name: name.into(),
            index: 0,
            status: TaskStatus::Failed,
            error: Some(TaskFailure {
                kind,
                message: "disk full".into(),
            }),
            duration: Duration::from_millis(5),
            output_reference: None,
        };
        let results = vec![
            failed("a", FailureKind::Persistence),
            failed("b", FailureKind::Persistence),
        ];
        let summary = BatchSummary::from_results(&results);
        assert!(summary.persistence_failed_everywhere);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.task_time, Duration::from_millis(10));

        let mixed = vec![
            failed("a", FailureKind::Persistence),
            failed("b", FailureKind::Simulation),
        ];
        assert!(!BatchSummary::from_results(&mixed).persistence_failed_everywhere);
        assert!(!BatchSummary::from_results(&[]).persistence_failed_everywhere);
    }
}
