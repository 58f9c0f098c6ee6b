//! Simulated runtime directories.
//!
//! Each test gets a fresh directory tree standing in for the one the Data
//! Manager prepares before launching a job:
//!
//! ```text
//! <test-root>/<collection>.<job>.<test>.<unique>/
//!     project/                    mounted into the container, inputs copied here
//!         .instance-8888.../      the instance directory
//!         nextflow.config         workflow jobs only
//! ```
//!
//! The tree is removed when the [`TestDirectory`] is dropped, unless it is
//! explicitly retained.

use crate::schema::ExecutionKind;
use std::path::{Path, PathBuf};

/// Name of the simulated instance directory inside the project directory.
///
/// Jobs find it through the `DM_INSTANCE_DIRECTORY` environment variable.
pub const INSTANCE_DIRECTORY: &str = ".instance-88888888-8888-8888-8888-888888888888";

/// Name of the project sub-directory of a test directory.
pub const PROJECT_DIRECTORY: &str = "project";

/// Workflow configuration file written into the project directory.
pub const WORKFLOW_CONFIG_FILENAME: &str = "nextflow.config";

/// Workflow configuration: run every process in Docker as the invoking user.
const WORKFLOW_CONFIG_CONTENT: &str = "
docker.enabled = true
docker.runOptions = '-u $(id -u):$(id -g)'
";

/// Location, relative to the home directory, of a user-level workflow
/// configuration that the engine would merge with ours.
pub const HOME_WORKFLOW_CONFIG: &str = ".nextflow/config";

/// Error preparing a test directory.
#[derive(Debug)]
pub enum SetupError {
    /// Creating the directory tree or writing a file failed.
    Io { context: String, source: std::io::Error },
    /// A declared input does not exist in the repository.
    MissingInput { name: String, path: PathBuf },
}

impl std::fmt::Display for SetupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SetupError::Io { context, source } => write!(f, "{context}: {source}"),
            SetupError::MissingInput { name, path } => {
                write!(f, "missing input file {} ({name})", path.display())
            }
        }
    }
}

impl std::error::Error for SetupError {}

/// A workflow configuration in the home directory that would be merged with
/// the simulated one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HomeConfigConflict {
    pub path: PathBuf,
}

impl std::fmt::Display for HomeConfigConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "found a workflow configuration at {}; it would be merged with the test's \
             configuration, remove or rename it before running workflow tests",
            self.path.display()
        )
    }
}

impl std::error::Error for HomeConfigConflict {}

/// Fail if the home directory holds a workflow configuration.
pub fn check_home_config(home: Option<&Path>) -> Result<(), HomeConfigConflict> {
    let Some(home) = home else {
        return Ok(());
    };
    let path = home.join(HOME_WORKFLOW_CONFIG);
    if path.exists() {
        return Err(HomeConfigConflict { path });
    }
    Ok(())
}

/// A test input: where it comes from and the name it gets in the project.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct InputFile {
    /// The variable the input is declared under.
    pub name: String,
    /// Source path, relative to the repository root.
    pub source: PathBuf,
}

impl InputFile {
    fn file_name(&self) -> PathBuf {
        self.source
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.source.clone())
    }
}

/// A live simulated directory tree for one test.
#[derive(Debug)]
pub struct TestDirectory {
    project: PathBuf,
    temp: Option<tempfile::TempDir>,
}

impl TestDirectory {
    /// Create a fresh tree under `test_root` for the named test.
    ///
    /// The directory name is unique, so a retained directory from an earlier
    /// run never collides with a new one.
    pub fn create(
        test_root: &Path,
        collection: &str,
        job: &str,
        test: &str,
        kind: ExecutionKind,
    ) -> Result<Self, SetupError> {
        std::fs::create_dir_all(test_root).map_err(|source| SetupError::Io {
            context: format!("failed to create test root {}", test_root.display()),
            source,
        })?;

        let temp = tempfile::Builder::new()
            .prefix(&format!("{collection}.{job}.{test}."))
            .tempdir_in(test_root)
            .map_err(|source| SetupError::Io {
                context: "failed to create test directory".to_string(),
                source,
            })?;
        let root = temp.path().to_path_buf();
        let project = root.join(PROJECT_DIRECTORY);
        let instance = project.join(INSTANCE_DIRECTORY);

        std::fs::create_dir_all(&instance).map_err(|source| SetupError::Io {
            context: format!("failed to create {}", instance.display()),
            source,
        })?;

        if kind == ExecutionKind::Workflow {
            let config = project.join(WORKFLOW_CONFIG_FILENAME);
            std::fs::write(&config, WORKFLOW_CONFIG_CONTENT).map_err(|source| SetupError::Io {
                context: format!("failed to write {}", config.display()),
                source,
            })?;
        }

        tracing::debug!(path = %root.display(), "created test directory");

        Ok(Self {
            project,
            temp: Some(temp),
        })
    }

    /// The test directory itself.
    #[cfg(test)]
    fn path(&self) -> &Path {
        self.project.parent().unwrap_or(&self.project)
    }

    /// The project directory: the job's working directory and where its
    /// outputs are checked.
    pub fn project_path(&self) -> &Path {
        &self.project
    }

    #[cfg(test)]
    fn instance_path(&self) -> PathBuf {
        self.project.join(INSTANCE_DIRECTORY)
    }

    /// Copy the test's inputs into the project directory under their file names.
    pub fn copy_inputs(&self, repo_root: &Path, inputs: &[InputFile]) -> Result<(), SetupError> {
        for input in inputs {
            let from = repo_root.join(&input.source);
            if !from.is_file() {
                return Err(SetupError::MissingInput {
                    name: input.name.clone(),
                    path: input.source.clone(),
                });
            }
            let to = self.project.join(input.file_name());
            std::fs::copy(&from, &to).map_err(|source| SetupError::Io {
                context: format!(
                    "failed to copy {} to {}",
                    input.source.display(),
                    to.display()
                ),
                source,
            })?;
            tracing::debug!(input = %input.name, file = %input.source.display(), "copied input");
        }
        Ok(())
    }

    /// Release the tree.
    ///
    /// With `retain` the directory is left on disk and its path returned;
    /// otherwise it is deleted.
    pub fn release(mut self, retain: bool) -> Option<PathBuf> {
        let temp = self.temp.take()?;
        if retain {
            let path = temp.keep();
            tracing::info!(path = %path.display(), "kept test directory");
            return Some(path);
        }
        let path = temp.path().to_path_buf();
        if let Err(e) = temp.close() {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove test directory");
        } else {
            tracing::debug!(path = %path.display(), "removed test directory");
        }
        None
    }
}
