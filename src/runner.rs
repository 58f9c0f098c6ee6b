//! Test execution engine.
//!
//! A run happens in three phases. Planning selects the tests and expands
//! every command up front, so a broken definition aborts the run before
//! anything executes. Precondition checks guard run-wide hazards. Execution
//! then runs each planned test, in order, in its own simulated directory.

use crate::checks;
use crate::expand::{self, ExpandError, ExpansionContext, ResolvedCommand};
use crate::loader::{DEFINITION_DIRECTORY, FileError, LoadedDefinition};
use crate::report::{RunReport, TestOutcome};
use crate::schema::{CheckSpec, DEFAULT_TIMEOUT_MINUTES, ExecutionKind, Image, JoteConfig};
use crate::select::{self, SelectError, SelectedTest, Selection};
use crate::simulator::{self, HomeConfigConflict, INSTANCE_DIRECTORY, InputFile, TestDirectory};
use crate::strategy::{
    DEFAULT_CONTAINER_ENGINE, DirectStrategy, ExecutionResult, Executor, WorkflowStrategy,
    container_name, serialize_duration,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Default location of simulated test directories, under the definition
/// directory.
const DEFAULT_TEST_ROOT: &str = "jote";

/// Settings shared by every test of a run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Repository root. Input paths resolve against it and jobs see it as
    /// `CODE_DIRECTORY`.
    pub repo_root: PathBuf,
    /// Where simulated test directories are created.
    pub test_root: PathBuf,
    pub container_engine: String,
    /// Timeout for tests that do not declare one.
    pub default_timeout: Duration,
    pub environment: BTreeMap<String, String>,
    /// `(uid, gid)` direct jobs run as.
    pub user: (u32, u32),
    /// Home directory checked for a conflicting workflow configuration.
    pub home: Option<PathBuf>,
}

impl RunConfig {
    /// Resolve a run configuration from the optional config file.
    pub fn resolve(config: &JoteConfig, repo_root: &Path) -> Self {
        let test_root = match &config.test_root {
            Some(root) if root.is_absolute() => root.clone(),
            Some(root) => repo_root.join(root),
            None => repo_root.join(DEFINITION_DIRECTORY).join(DEFAULT_TEST_ROOT),
        };
        let (uid, gid) = current_user();

        Self {
            repo_root: repo_root.to_path_buf(),
            test_root,
            container_engine: config
                .container_engine
                .clone()
                .unwrap_or_else(|| DEFAULT_CONTAINER_ENGINE.to_string()),
            default_timeout: minutes(config.timeout_minutes.unwrap_or(DEFAULT_TIMEOUT_MINUTES)),
            environment: config
                .environment
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            user: (config.user_id.unwrap_or(uid), config.group_id.unwrap_or(gid)),
            home: dirs::home_dir(),
        }
    }
}

#[cfg(unix)]
fn current_user() -> (u32, u32) {
    // SAFETY: getuid and getgid cannot fail and touch no memory.
    unsafe { (libc::getuid(), libc::getgid()) }
}

#[cfg(not(unix))]
fn current_user() -> (u32, u32) {
    (0, 0)
}

fn minutes(n: u64) -> Duration {
    Duration::from_secs(n.saturating_mul(60))
}

/// Switches controlling how planned tests execute.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Leave each test's simulated directory on disk.
    pub keep_results: bool,
    /// Stop after the first failing test.
    pub exit_on_failure: bool,
}

/// A broken definition or selection; nothing runs.
#[derive(Debug)]
pub enum DefinitionError {
    Load(FileError),
    Select(SelectError),
    Template {
        path: PathBuf,
        collection: String,
        job: String,
        test: String,
        error: ExpandError,
    },
}

impl std::fmt::Display for DefinitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DefinitionError::Load(e) => write!(f, "{e}"),
            DefinitionError::Select(e) => write!(f, "{e}"),
            DefinitionError::Template {
                path,
                collection,
                job,
                test,
                error,
            } => write!(
                f,
                "{}: collection '{collection}' job '{job}' test '{test}': {error}",
                path.display()
            ),
        }
    }
}

impl std::error::Error for DefinitionError {}

impl From<FileError> for DefinitionError {
    fn from(e: FileError) -> Self {
        DefinitionError::Load(e)
    }
}

impl From<SelectError> for DefinitionError {
    fn from(e: SelectError) -> Self {
        DefinitionError::Select(e)
    }
}

/// A run aborted before any test executed.
#[derive(Debug)]
pub enum RunError {
    Definition(DefinitionError),
    HomeConfigConflict(HomeConfigConflict),
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunError::Definition(e) => write!(f, "{e}"),
            RunError::HomeConfigConflict(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for RunError {}

impl From<DefinitionError> for RunError {
    fn from(e: DefinitionError) -> Self {
        RunError::Definition(e)
    }
}

impl From<HomeConfigConflict> for RunError {
    fn from(e: HomeConfigConflict) -> Self {
        RunError::HomeConfigConflict(e)
    }
}

/// Everything needed to execute one test, resolved ahead of time.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TestPlan {
    pub definition: PathBuf,
    pub collection: String,
    pub job: String,
    pub test: String,
    pub image: Image,
    pub command: ResolvedCommand,
    pub inputs: Vec<InputFile>,
    pub checks: CheckSpec,
    #[serde(serialize_with = "serialize_duration")]
    pub timeout: Duration,
}

impl TestPlan {
    pub fn kind(&self) -> ExecutionKind {
        self.image.kind
    }

    /// The strategy that runs this test.
    pub fn executor(&self, config: &RunConfig) -> Executor {
        match self.kind() {
            ExecutionKind::Direct => Executor::Direct(DirectStrategy {
                engine: config.container_engine.clone(),
                image: self.image.reference(),
                container_name: container_name(&self.job, &self.test),
                project_mount: self.image.project_directory.clone(),
                user: config.user,
                memory: self.image.memory.clone(),
                cores: self.image.cores,
            }),
            ExecutionKind::Workflow => Executor::Workflow(WorkflowStrategy),
        }
    }
}

fn plan_test(selected: &SelectedTest<'_>, config: &RunConfig) -> Result<TestPlan, DefinitionError> {
    let ctx = ExpansionContext {
        instance_directory: INSTANCE_DIRECTORY,
        code_directory: &config.repo_root,
        environment: &config.environment,
    };
    let command = expand::expand(selected.job, selected.test, &ctx).map_err(|error| {
        DefinitionError::Template {
            path: selected.path.to_path_buf(),
            collection: selected.collection.to_string(),
            job: selected.job_name.to_string(),
            test: selected.test_name.to_string(),
            error,
        }
    })?;

    let inputs = selected
        .test
        .inputs
        .iter()
        .map(|(name, source)| InputFile {
            name: name.to_string(),
            source: source.clone(),
        })
        .collect();

    let timeout = selected
        .test
        .timeout_minutes
        .map(minutes)
        .unwrap_or(config.default_timeout);

    Ok(TestPlan {
        definition: selected.path.to_path_buf(),
        collection: selected.collection.to_string(),
        job: selected.job_name.to_string(),
        test: selected.test_name.to_string(),
        image: selected.job.image.clone(),
        command,
        inputs,
        checks: selected.test.checks.clone(),
        timeout,
    })
}

/// Select and expand the tests a run executes.
pub fn plan(
    definitions: &[LoadedDefinition],
    selection: &Selection,
    config: &RunConfig,
) -> Result<Vec<TestPlan>, DefinitionError> {
    select::select(definitions, selection)?
        .iter()
        .map(|t| plan_test(t, config))
        .collect()
}

/// Expand every declared test, whatever its ignore flag or run-level.
pub fn plan_all(
    definitions: &[LoadedDefinition],
    config: &RunConfig,
) -> Result<Vec<TestPlan>, DefinitionError> {
    select::all_tests(definitions)
        .iter()
        .map(|t| plan_test(t, config))
        .collect()
}

/// Run-wide checks made before any test touches the filesystem.
pub fn check_preconditions(plans: &[TestPlan], config: &RunConfig) -> Result<(), HomeConfigConflict> {
    if plans.iter().any(|p| p.kind() == ExecutionKind::Workflow) {
        simulator::check_home_config(config.home.as_deref())?;
    }
    Ok(())
}

/// Execute planned tests in order.
pub fn execute(plans: &[TestPlan], config: &RunConfig, options: RunOptions) -> RunReport {
    let mut report = RunReport::new();
    for plan in plans {
        let outcome = run_test(plan, config, options.keep_results);
        let failed = !outcome.passed;
        report.record(outcome);
        if failed && options.exit_on_failure {
            tracing::warn!("stopping after first failure");
            break;
        }
    }
    report
}

/// Plan, check and execute a selection.
pub fn run(
    definitions: &[LoadedDefinition],
    selection: &Selection,
    config: &RunConfig,
    options: RunOptions,
) -> Result<RunReport, RunError> {
    let plans = plan(definitions, selection, config)?;
    check_preconditions(&plans, config)?;
    Ok(execute(&plans, config, options))
}

/// Run a single planned test.
///
/// Setup and spawn failures fail the test; they never abort the run.
pub fn run_test(plan: &TestPlan, config: &RunConfig, keep_results: bool) -> TestOutcome {
    tracing::info!(
        collection = %plan.collection,
        job = %plan.job,
        test = %plan.test,
        kind = %plan.kind(),
        "+ running test"
    );
    let start = Instant::now();
    let mut failures = Vec::new();
    let mut execution = None;
    let mut retained_directory = None;

    match TestDirectory::create(
        &config.test_root,
        &plan.collection,
        &plan.job,
        &plan.test,
        plan.kind(),
    ) {
        Ok(dir) => {
            match execute_in(&dir, plan, config) {
                Ok(result) => {
                    failures.extend(
                        checks::evaluate(&plan.checks, &result, dir.project_path())
                            .iter()
                            .map(ToString::to_string),
                    );
                    execution = Some(result);
                }
                Err(failure) => failures.push(failure),
            }
            retained_directory = dir.release(keep_results);
        }
        Err(e) => failures.push(format!("Test setup failed: {e}")),
    }

    let passed = failures.is_empty();
    if passed {
        tracing::info!(test = %plan.test, "passed");
    } else {
        tracing::warn!(test = %plan.test, failures = failures.len(), "failed");
    }

    TestOutcome {
        collection: plan.collection.clone(),
        job: plan.job.clone(),
        test: plan.test.clone(),
        passed,
        duration: start.elapsed(),
        failures,
        execution,
        retained_directory,
    }
}

fn execute_in(dir: &TestDirectory, plan: &TestPlan, config: &RunConfig) -> Result<ExecutionResult, String> {
    dir.copy_inputs(&config.repo_root, &plan.inputs)
        .map_err(|e| format!("Test setup failed: {e}"))?;
    tracing::debug!(command = %plan.command.line, "expanded command");
    plan.executor(config)
        .execute(&plan.command, dir.project_path(), plan.timeout)
        .map_err(|e| format!("Execution failed: {e}"))
}
