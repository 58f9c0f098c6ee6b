//! Schema definitions for jote documents.
//!
//! This module defines the structure of the manifest, the job definition
//! documents it references and the optional run configuration file.
//! Documents are written in YAML (or TOML) and validated against these types.

use schemars::JsonSchema;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::marker::PhantomData;
use std::path::PathBuf;

/// The `kind` a manifest must declare.
pub const MANIFEST_KIND: &str = "DataManagerManifest";

/// The `kind` a job definition document must declare.
pub const JOB_DEFINITION_KIND: &str = "DataManagerJobDefinition";

/// Default per-test timeout in minutes.
pub const DEFAULT_TIMEOUT_MINUTES: u64 = 10;

/// Lowest and highest permitted run-level.
pub const MIN_RUN_LEVEL: u8 = 1;
pub const MAX_RUN_LEVEL: u8 = 100;

/// A string-keyed mapping that keeps the order its entries were declared in.
///
/// Tests run in declaration order, which a `HashMap` would lose.
/// Duplicate keys are rejected while deserializing.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedMap<T>(Vec<(String, T)>);

impl<T> NamedMap<T> {
    pub fn new() -> Self {
        NamedMap(Vec::new())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    #[cfg(test)]
    pub fn get(&self, key: &str) -> Option<&T> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    #[cfg(test)]
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Append an entry, replacing any existing value under the same key.
    #[cfg(test)]
    pub fn insert(&mut self, key: impl Into<String>, value: T) {
        let key = key.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.0.push((key, value)),
        }
    }
}

impl<T> Default for NamedMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Serialize> Serialize for NamedMap<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for NamedMap<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct NamedMapVisitor<T>(PhantomData<T>);

        impl<'de, T: Deserialize<'de>> Visitor<'de> for NamedMapVisitor<T> {
            type Value = NamedMap<T>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mapping with unique string keys")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut entries: Vec<(String, T)> = Vec::new();
                while let Some((key, value)) = access.next_entry::<String, T>()? {
                    if entries.iter().any(|(k, _)| *k == key) {
                        return Err(serde::de::Error::custom(format!("duplicate key '{key}'")));
                    }
                    entries.push((key, value));
                }
                Ok(NamedMap(entries))
            }

            // An empty `tests:` or `options:` key reads as null in YAML.
            fn visit_unit<E: serde::de::Error>(self) -> Result<Self::Value, E> {
                Ok(NamedMap::new())
            }
        }

        deserializer.deserialize_any(NamedMapVisitor(PhantomData))
    }
}

impl<T: JsonSchema> JsonSchema for NamedMap<T> {
    fn schema_name() -> String {
        format!("Map_of_{}", T::schema_name())
    }

    fn is_referenceable() -> bool {
        false
    }

    fn json_schema(generator: &mut schemars::r#gen::SchemaGenerator) -> schemars::schema::Schema {
        <BTreeMap<String, T>>::json_schema(generator)
    }
}

/// The top-level manifest, listing the job definition documents to load.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub struct Manifest {
    /// Must be `DataManagerManifest`.
    pub kind: String,

    /// Version of the manifest format.
    #[serde(default)]
    pub kind_version: Option<String>,

    /// Job definition files, relative to the manifest's directory.
    #[serde(default)]
    pub job_definition_files: Vec<PathBuf>,
}

/// A job definition document: a collection of jobs.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub struct JobDefinitionDocument {
    /// Must be `DataManagerJobDefinition`.
    pub kind: String,

    /// Version of the job definition format.
    #[serde(default)]
    pub kind_version: Option<String>,

    /// The collection the jobs belong to.
    pub collection: String,

    /// The jobs, keyed by job name, in declaration order.
    #[serde(default)]
    pub jobs: NamedMap<Job>,
}

/// A single containerised job.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub struct Job {
    /// The container image (or workflow image) the job runs in.
    pub image: Image,

    /// The command template, with `{{ name }}` placeholders.
    pub command: String,

    /// The job's tests, keyed by test name, in declaration order.
    #[serde(default)]
    pub tests: NamedMap<TestCase>,
}

/// How a job is executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ExecutionKind {
    /// The image is run directly by the container engine.
    #[default]
    #[serde(rename = "simple", alias = "direct")]
    Direct,
    /// The command runs a workflow engine which launches its own containers.
    #[serde(rename = "nextflow", alias = "workflow")]
    Workflow,
}

impl fmt::Display for ExecutionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionKind::Direct => f.write_str("simple"),
            ExecutionKind::Workflow => f.write_str("nextflow"),
        }
    }
}

/// The image a job runs in, and the runtime contract it expects.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub struct Image {
    /// Image name (without tag).
    pub name: String,

    /// Image tag.
    #[serde(default = "default_tag")]
    pub tag: String,

    /// Where the project directory is mounted inside the container.
    #[serde(default = "default_project_directory")]
    pub project_directory: PathBuf,

    /// The container's working directory (defaults to the project directory).
    #[serde(default)]
    pub working_directory: Option<PathBuf>,

    /// Execution kind: `simple` (direct) or `nextflow` (workflow).
    #[serde(default, rename = "type")]
    pub kind: ExecutionKind,

    /// Memory limit, with an `Mi` or `Gi` suffix.
    #[serde(default)]
    pub memory: Option<String>,

    /// CPU cores.
    #[serde(default)]
    pub cores: Option<u32>,
}

impl Image {
    /// The `name:tag` reference.
    pub fn reference(&self) -> String {
        format!("{}:{}", self.name, self.tag)
    }

    pub fn working_directory(&self) -> PathBuf {
        self.working_directory
            .clone()
            .unwrap_or_else(|| self.project_directory.clone())
    }
}

fn default_tag() -> String {
    "latest".to_string()
}

fn default_project_directory() -> PathBuf {
    PathBuf::from("/data")
}

/// A single test of a job.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub struct TestCase {
    /// Input files, keyed by the variable name used in the command.
    /// Paths are relative to the repository root.
    #[serde(default)]
    pub inputs: NamedMap<PathBuf>,

    /// Option values, keyed by the variable name used in the command.
    #[serde(default)]
    pub options: NamedMap<OptionValue>,

    /// Expected outcomes.
    #[serde(default)]
    pub checks: CheckSpec,

    /// Skip this test unless it is named explicitly.
    #[serde(default)]
    pub ignore: bool,

    /// Cost tag; the test runs by default only when this is at or below the
    /// run's ceiling. Treated as 1 when absent.
    #[serde(default)]
    pub run_level: Option<u8>,

    /// Hard execution timeout in minutes.
    #[serde(default)]
    pub timeout_minutes: Option<u64>,
}

impl TestCase {
    pub fn effective_run_level(&self) -> u8 {
        self.run_level.unwrap_or(MIN_RUN_LEVEL)
    }
}

/// A scalar option value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Bool(b) => write!(f, "{b}"),
            OptionValue::Integer(i) => write!(f, "{i}"),
            OptionValue::Float(x) => write!(f, "{x:?}"),
            OptionValue::Text(s) => f.write_str(s),
        }
    }
}

/// The root of a test's check tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CheckSpec {
    /// Expected exit code. When absent a zero exit is required.
    #[serde(default)]
    pub exit_code: Option<i32>,

    /// Checks on files the job writes to its project directory.
    #[serde(default)]
    pub outputs: Vec<OutputCheck>,
}

/// Checks applied to one output file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct OutputCheck {
    /// Path of the output, relative to the project directory.
    pub name: PathBuf,

    /// Atomic checks, evaluated in order.
    #[serde(default)]
    pub checks: Vec<Check>,
}

/// An atomic check on an output file.
///
/// Each entry is a single-key map where the key selects the check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum Check {
    /// Whether the file should exist.
    Exists(bool),
    /// Exact number of newline-terminated lines.
    LineCount(u64),
    /// A substring the file must contain.
    Contains(String),
    /// A regular expression the file content must match.
    Matches(String),
}

/// Run configuration loaded from `jote.yaml` next to the manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub struct JoteConfig {
    /// Container engine binary for direct jobs (default: `docker`).
    #[serde(default)]
    pub container_engine: Option<String>,

    /// Where simulated test directories are created.
    /// Relative paths resolve against the repository root.
    #[serde(default)]
    pub test_root: Option<PathBuf>,

    /// Default timeout in minutes for tests that do not declare one.
    #[serde(default)]
    pub timeout_minutes: Option<u64>,

    /// Environment passed to every job, as the platform would.
    #[serde(default)]
    pub environment: HashMap<String, String>,

    /// User id the job runs as (default: the invoking user).
    #[serde(default)]
    pub user_id: Option<u32>,

    /// Group id the job runs as (default: the invoking user's group).
    #[serde(default)]
    pub group_id: Option<u32>,
}

/// Generate the JSON Schema for job definition documents.
pub fn generate_schema() -> schemars::schema::RootSchema {
    schemars::schema_for!(JobDefinitionDocument)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO: &str = r#"
kind: DataManagerJobDefinition
kind-version: '2021.1'
collection: rdkit
jobs:
  max-min-picker:
    image:
      name: informaticsmatters/rdkit
      tag: '1.0'
      project-directory: /data
    command: >-
      ./max_min_picker.py -i {{ inputFile }} -o {{ outputFile }} -c {{ count }}
    tests:
      simple-execution:
        inputs:
          inputFile: data/100.smi
        options:
          outputFile: diverse.smi
          count: 100
        checks:
          exitCode: 0
          outputs:
          - name: diverse.smi
            checks:
            - exists: true
            - lineCount: 100
      expensive:
        run-level: 5
        timeout-minutes: 30
      broken:
        ignore: true
"#;

    #[test]
    fn parse_job_definition() {
        let doc: JobDefinitionDocument = serde_yaml::from_str(SCENARIO).unwrap();
        assert_eq!(doc.kind, JOB_DEFINITION_KIND);
        assert_eq!(doc.collection, "rdkit");

        let job = doc.jobs.get("max-min-picker").unwrap();
        assert_eq!(job.image.reference(), "informaticsmatters/rdkit:1.0");
        assert_eq!(job.image.kind, ExecutionKind::Direct);
        assert_eq!(job.image.working_directory(), PathBuf::from("/data"));

        let test = job.tests.get("simple-execution").unwrap();
        assert_eq!(
            test.inputs.get("inputFile"),
            Some(&PathBuf::from("data/100.smi"))
        );
        assert_eq!(test.options.get("count"), Some(&OptionValue::Integer(100)));
        assert_eq!(test.checks.exit_code, Some(0));
        assert_eq!(
            test.checks.outputs[0].checks,
            vec![Check::Exists(true), Check::LineCount(100)]
        );
        assert_eq!(test.effective_run_level(), 1);
    }

    #[test]
    fn tests_keep_declaration_order() {
        let doc: JobDefinitionDocument = serde_yaml::from_str(SCENARIO).unwrap();
        let job = doc.jobs.get("max-min-picker").unwrap();
        let names: Vec<_> = job.tests.keys().collect();
        assert_eq!(names, vec!["simple-execution", "expensive", "broken"]);

        let expensive = job.tests.get("expensive").unwrap();
        assert_eq!(expensive.run_level, Some(5));
        assert_eq!(expensive.timeout_minutes, Some(30));
        assert!(job.tests.get("broken").unwrap().ignore);
    }

    #[test]
    fn duplicate_test_names_are_rejected() {
        let yaml = r#"
kind: DataManagerJobDefinition
collection: c
jobs:
  j:
    image:
      name: busybox
    command: "true"
    tests:
      a: {}
      a: {}
"#;
        let result: Result<JobDefinitionDocument, _> = serde_yaml::from_str(yaml);
        let err = result.unwrap_err().to_string();
        assert!(err.contains("duplicate"), "{err}");
    }

    #[test]
    fn unknown_check_type_is_rejected() {
        let yaml = r#"
name: out.txt
checks:
- sizeInBytes: 10
"#;
        let result: Result<OutputCheck, _> = serde_yaml::from_str(yaml);
        assert!(result.is_err());
    }

    #[test]
    fn nextflow_image_is_workflow_kind() {
        let yaml = r#"
name: informaticsmatters/nf-tools
type: nextflow
working-directory: /data/work
memory: 2Gi
cores: 2
"#;
        let image: Image = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(image.kind, ExecutionKind::Workflow);
        assert_eq!(image.tag, "latest");
        assert_eq!(image.working_directory(), PathBuf::from("/data/work"));
        assert_eq!(image.memory.as_deref(), Some("2Gi"));
    }

    #[test]
    fn option_values_render_as_text() {
        let options: NamedMap<OptionValue> =
            serde_yaml::from_str("a: true\nb: 3\nc: 0.5\nd: hello\ne: 1.0\n").unwrap();
        let rendered: Vec<String> = options.iter().map(|(_, v)| v.to_string()).collect();
        assert_eq!(rendered, vec!["true", "3", "0.5", "hello", "1.0"]);
    }

    #[test]
    fn empty_tests_mapping_is_empty() {
        let yaml = r#"
image:
  name: busybox
command: "true"
tests:
"#;
        let job: Job = serde_yaml::from_str(yaml).unwrap();
        assert!(job.tests.is_empty());
    }

    #[test]
    fn parse_toml_checks() {
        let toml_src = r#"
exitCode = 1

[[outputs]]
name = "out.txt"
checks = [{ exists = true }, { contains = "done" }]
"#;
        let spec: CheckSpec = toml::from_str(toml_src).unwrap();
        assert_eq!(spec.exit_code, Some(1));
        assert_eq!(
            spec.outputs[0].checks,
            vec![Check::Exists(true), Check::Contains("done".to_string())]
        );
    }

    #[test]
    fn schema_names_the_document() {
        let schema = generate_schema();
        let json = serde_json::to_string(&schema).unwrap();
        assert!(json.contains("JobDefinitionDocument"));
        assert!(json.contains("lineCount"));
    }
}
