//! Document loader.
//!
//! Loads the manifest, the job definition documents it lists and the
//! optional run configuration from disk.

use crate::schema::{
    Check, JOB_DEFINITION_KIND, JobDefinitionDocument, JoteConfig, MANIFEST_KIND, MAX_RUN_LEVEL,
    MIN_RUN_LEVEL, Manifest,
};
use crate::strategy::engine_memory;
use serde::de::DeserializeOwned;
use std::path::{Component, Path, PathBuf};

/// Error type for document loading operations.
#[derive(Debug)]
pub enum LoadError {
    /// Failed to read the file.
    Io(std::io::Error),
    /// Failed to parse YAML.
    Yaml(serde_yaml::Error),
    /// Failed to parse TOML.
    Toml(toml::de::Error),
    /// Unsupported file extension.
    UnsupportedFormat(String),
    /// The document declares the wrong `kind`.
    WrongKind { expected: &'static str, found: String },
    /// The document parsed but is not a valid definition.
    Invalid(String),
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadError::Io(e) => write!(f, "failed to read file: {e}"),
            LoadError::Yaml(e) => write!(f, "invalid YAML: {e}"),
            LoadError::Toml(e) => write!(f, "invalid TOML: {e}"),
            LoadError::UnsupportedFormat(ext) => {
                write!(
                    f,
                    "unsupported file format: {ext} (expected .yaml, .yml, or .toml)"
                )
            }
            LoadError::WrongKind { expected, found } => {
                write!(f, "expected kind '{expected}', found '{found}'")
            }
            LoadError::Invalid(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for LoadError {}

/// A load failure together with the file it came from.
#[derive(Debug)]
pub struct FileError {
    pub path: PathBuf,
    pub error: LoadError,
}

impl std::fmt::Display for FileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.error)
    }
}

impl std::error::Error for FileError {}

/// Directory, relative to the repository root, holding the documents.
pub const DEFINITION_DIRECTORY: &str = "data-manager";

/// The default manifest file name.
pub const MANIFEST_FILENAME: &str = "manifest.yaml";

/// The name of the run configuration file.
pub const CONFIG_FILENAME: &str = "jote.yaml";

/// A job definition document and the file it was read from.
#[derive(Debug, Clone)]
pub struct LoadedDefinition {
    pub path: PathBuf,
    pub document: JobDefinitionDocument,
}

/// The default manifest location for a repository.
pub fn default_manifest_path(repo_root: &Path) -> PathBuf {
    repo_root.join(DEFINITION_DIRECTORY).join(MANIFEST_FILENAME)
}

fn parse_file<T: DeserializeOwned>(path: &Path) -> Result<T, LoadError> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let contents = std::fs::read_to_string(path).map_err(LoadError::Io)?;

    match ext {
        "yaml" | "yml" => serde_yaml::from_str(&contents).map_err(LoadError::Yaml),
        "toml" => toml::from_str(&contents).map_err(LoadError::Toml),
        other => Err(LoadError::UnsupportedFormat(other.to_string())),
    }
}

/// Load a manifest from a file path.
pub fn load_manifest(path: &Path) -> Result<Manifest, LoadError> {
    let manifest: Manifest = parse_file(path)?;
    if manifest.kind != MANIFEST_KIND {
        return Err(LoadError::WrongKind {
            expected: MANIFEST_KIND,
            found: manifest.kind,
        });
    }
    Ok(manifest)
}

/// Load and validate a single job definition document.
pub fn load_definition(path: &Path) -> Result<JobDefinitionDocument, LoadError> {
    let document: JobDefinitionDocument = parse_file(path)?;
    if document.kind != JOB_DEFINITION_KIND {
        return Err(LoadError::WrongKind {
            expected: JOB_DEFINITION_KIND,
            found: document.kind,
        });
    }
    validate_definition(&document).map_err(LoadError::Invalid)?;
    Ok(document)
}

/// Load every job definition the manifest lists, in manifest order.
///
/// Stops at the first document that fails to load.
pub fn load_all(manifest_path: &Path) -> Result<Vec<LoadedDefinition>, FileError> {
    let manifest = load_manifest(manifest_path).map_err(|error| FileError {
        path: manifest_path.to_path_buf(),
        error,
    })?;
    let base = manifest_path.parent().unwrap_or(Path::new("."));

    manifest
        .job_definition_files
        .iter()
        .map(|file| {
            let path = base.join(file);
            match load_definition(&path) {
                Ok(document) => Ok(LoadedDefinition { path, document }),
                Err(error) => Err(FileError { path, error }),
            }
        })
        .collect()
}

/// Structural checks serde cannot express.
fn validate_definition(document: &JobDefinitionDocument) -> Result<(), String> {
    if document.collection.trim().is_empty() {
        return Err("collection must not be empty".to_string());
    }

    for (job_name, job) in document.jobs.iter() {
        if job.image.name.trim().is_empty() {
            return Err(format!("job '{job_name}': image name must not be empty"));
        }
        if job.command.trim().is_empty() {
            return Err(format!("job '{job_name}': command must not be empty"));
        }
        if let Some(memory) = &job.image.memory
            && engine_memory(memory).is_none()
        {
            return Err(format!(
                "job '{job_name}': memory {memory:?} must be a whole number of Mi or Gi"
            ));
        }

        for (test_name, test) in job.tests.iter() {
            if let Some(level) = test.run_level
                && !(MIN_RUN_LEVEL..=MAX_RUN_LEVEL).contains(&level)
            {
                return Err(format!(
                    "job '{job_name}' test '{test_name}': run-level {level} is outside \
                     {MIN_RUN_LEVEL}..={MAX_RUN_LEVEL}"
                ));
            }
            if test.timeout_minutes == Some(0) {
                return Err(format!(
                    "job '{job_name}' test '{test_name}': timeout-minutes must be positive"
                ));
            }
            for (name, path) in test.inputs.iter() {
                if !is_relative_inside(path) {
                    return Err(format!(
                        "job '{job_name}' test '{test_name}': input {name} ({}) must be a \
                         relative path inside the repository",
                        path.display()
                    ));
                }
            }
            for output in &test.checks.outputs {
                if !is_relative_inside(&output.name) {
                    return Err(format!(
                        "job '{job_name}' test '{test_name}': output {} must be a relative \
                         path inside the project directory",
                        output.name.display()
                    ));
                }
                for check in &output.checks {
                    if let Check::Matches(pattern) = check
                        && let Err(e) = regex::Regex::new(pattern)
                    {
                        return Err(format!(
                            "job '{job_name}' test '{test_name}': invalid pattern {pattern:?} \
                             for {}: {e}",
                            output.name.display()
                        ));
                    }
                }
            }
        }
    }

    Ok(())
}

/// Relative, with no `..`, so joining it stays under the base directory.
fn is_relative_inside(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Load the run configuration.
///
/// An explicit path must exist. Otherwise looks for `jote.yaml` in the
/// definition directory and returns the defaults when it is absent.
pub fn load_config(explicit: Option<&Path>, repo_root: &Path) -> Result<JoteConfig, FileError> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => {
            let path = repo_root.join(DEFINITION_DIRECTORY).join(CONFIG_FILENAME);
            if !path.exists() {
                return Ok(JoteConfig::default());
            }
            path
        }
    };

    parse_file(&path).map_err(|error| FileError { path, error })
}
