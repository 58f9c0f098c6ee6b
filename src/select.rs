//! Test selection.
//!
//! Decides which declared tests a run executes, from the optional
//! collection/job scope, the explicit test allow-list and the run-level
//! ceiling.

use crate::loader::LoadedDefinition;
use crate::schema::{Job, TestCase};
use std::path::Path;

/// What the caller asked to run.
#[derive(Debug, Clone)]
pub struct Selection {
    pub collection: Option<String>,
    pub job: Option<String>,
    /// Explicitly named tests. When non-empty only these run, whatever their
    /// ignore flag or run-level.
    pub tests: Vec<String>,
    /// Tests with a run-level above this are skipped unless named.
    pub run_level: u8,
}

impl Default for Selection {
    fn default() -> Self {
        Self {
            collection: None,
            job: None,
            tests: Vec::new(),
            run_level: 1,
        }
    }
}

/// Why a selection could not be made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectError {
    UnknownCollection(String),
    UnknownJob(String),
    UnknownTest(String),
    /// The job was named explicitly but declares no tests.
    NoTests { collection: String, job: String },
}

impl std::fmt::Display for SelectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SelectError::UnknownCollection(c) => write!(f, "unknown collection '{c}'"),
            SelectError::UnknownJob(j) => write!(f, "unknown job '{j}'"),
            SelectError::UnknownTest(t) => write!(f, "unknown test '{t}'"),
            SelectError::NoTests { collection, job } => {
                write!(f, "job '{job}' in collection '{collection}' has no tests")
            }
        }
    }
}

impl std::error::Error for SelectError {}

/// A test chosen for execution, borrowed from its definition.
#[derive(Debug, Clone, Copy)]
pub struct SelectedTest<'a> {
    pub path: &'a Path,
    pub collection: &'a str,
    pub job_name: &'a str,
    pub job: &'a Job,
    pub test_name: &'a str,
    pub test: &'a TestCase,
}

/// Whether a single test runs under the given ceiling and naming.
///
/// Explicit naming wins over both the ignore flag and the run-level.
pub fn is_selected(test: &TestCase, named: bool, ceiling: u8) -> bool {
    named || (!test.ignore && test.effective_run_level() <= ceiling)
}

/// Every declared test, in discovery order, ignoring scope and run-levels.
pub fn all_tests(definitions: &[LoadedDefinition]) -> Vec<SelectedTest<'_>> {
    definitions
        .iter()
        .flat_map(|definition| {
            definition
                .document
                .jobs
                .iter()
                .flat_map(move |(job_name, job)| {
                    job.tests.iter().map(move |(test_name, test)| SelectedTest {
                        path: &definition.path,
                        collection: &definition.document.collection,
                        job_name,
                        job,
                        test_name,
                        test,
                    })
                })
        })
        .collect()
}

/// Select the tests to execute, in discovery order.
///
/// Jobs without tests are not part of the run. Every allow-listed name must
/// match at least one declared test in scope.
pub fn select<'a>(
    definitions: &'a [LoadedDefinition],
    selection: &Selection,
) -> Result<Vec<SelectedTest<'a>>, SelectError> {
    let in_collection = |collection: &str| {
        selection
            .collection
            .as_deref()
            .is_none_or(|c| c == collection)
    };

    if let Some(c) = &selection.collection
        && !definitions.iter().any(|d| d.document.collection == *c)
    {
        return Err(SelectError::UnknownCollection(c.clone()));
    }

    let mut job_found = false;
    let mut declared = Vec::new();
    for definition in definitions {
        let collection = definition.document.collection.as_str();
        if !in_collection(collection) {
            continue;
        }
        for (job_name, job) in definition.document.jobs.iter() {
            if selection.job.as_deref().is_some_and(|j| j != job_name) {
                continue;
            }
            job_found = true;
            if job.tests.is_empty() && selection.job.is_some() {
                return Err(SelectError::NoTests {
                    collection: collection.to_string(),
                    job: job_name.to_string(),
                });
            }
            for (test_name, test) in job.tests.iter() {
                declared.push(SelectedTest {
                    path: &definition.path,
                    collection,
                    job_name,
                    job,
                    test_name,
                    test,
                });
            }
        }
    }

    if let Some(j) = &selection.job
        && !job_found
    {
        return Err(SelectError::UnknownJob(j.clone()));
    }

    if let Some(unknown) = selection
        .tests
        .iter()
        .find(|name| !declared.iter().any(|t| t.test_name == name.as_str()))
    {
        return Err(SelectError::UnknownTest(unknown.clone()));
    }

    let explicit = !selection.tests.is_empty();
    Ok(declared
        .into_iter()
        .filter(|t| {
            let named = selection.tests.iter().any(|n| n == t.test_name);
            if explicit && !named {
                return false;
            }
            is_selected(t.test, named, selection.run_level)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Image, JobDefinitionDocument, NamedMap};
    use std::path::PathBuf;

    fn test_case(run_level: Option<u8>, ignore: bool) -> TestCase {
        TestCase {
            run_level,
            ignore,
            ..TestCase::default()
        }
    }

    fn job(tests: Vec<(&str, TestCase)>) -> Job {
        let mut map = NamedMap::new();
        for (name, test) in tests {
            map.insert(name, test);
        }
        Job {
            image: serde_yaml::from_str::<Image>("name: busybox").unwrap(),
            command: "true".to_string(),
            tests: map,
        }
    }

    fn definition(collection: &str, jobs: Vec<(&str, Job)>) -> LoadedDefinition {
        let mut map = NamedMap::new();
        for (name, job) in jobs {
            map.insert(name, job);
        }
        LoadedDefinition {
            path: PathBuf::from(format!("{collection}.yaml")),
            document: JobDefinitionDocument {
                kind: "DataManagerJobDefinition".to_string(),
                kind_version: None,
                collection: collection.to_string(),
                jobs: map,
            },
        }
    }

    fn names(selected: &[SelectedTest<'_>]) -> Vec<String> {
        selected
            .iter()
            .map(|t| format!("{}/{}", t.job_name, t.test_name))
            .collect()
    }

    fn sample() -> Vec<LoadedDefinition> {
        vec![
            definition(
                "alpha",
                vec![
                    (
                        "first",
                        job(vec![
                            ("default-level", test_case(None, false)),
                            ("level-one", test_case(Some(1), false)),
                            ("level-five", test_case(Some(5), false)),
                            ("ignored", test_case(None, true)),
                        ]),
                    ),
                    ("empty", job(vec![])),
                ],
            ),
            definition(
                "beta",
                vec![("second", job(vec![("level-ten", test_case(Some(10), false))]))],
            ),
        ]
    }

    #[test]
    fn run_level_property_holds_for_all_ceilings() {
        for ceiling in 1..=100u8 {
            for level in [None, Some(1u8), Some(2), Some(50), Some(100)] {
                let test = test_case(level, false);
                let expected = level.unwrap_or(1) <= ceiling;
                assert_eq!(is_selected(&test, false, ceiling), expected);
                assert!(is_selected(&test, true, ceiling));
            }
        }
    }

    #[test]
    fn explicit_naming_overrides_ignore() {
        assert!(!is_selected(&test_case(None, true), false, 100));
        assert!(is_selected(&test_case(None, true), true, 1));
    }

    #[test]
    fn default_ceiling_selects_level_one_in_order() {
        let defs = sample();
        let selected = select(&defs, &Selection::default()).unwrap();
        assert_eq!(
            names(&selected),
            vec!["first/default-level", "first/level-one"]
        );
    }

    #[test]
    fn raised_ceiling_includes_expensive_tests() {
        let defs = sample();
        let selection = Selection {
            run_level: 10,
            ..Selection::default()
        };
        let selected = select(&defs, &selection).unwrap();
        assert_eq!(
            names(&selected),
            vec![
                "first/default-level",
                "first/level-one",
                "first/level-five",
                "second/level-ten"
            ]
        );
    }

    #[test]
    fn named_tests_only_and_ignore_overridden() {
        let defs = sample();
        let selection = Selection {
            tests: vec!["ignored".to_string(), "level-ten".to_string()],
            ..Selection::default()
        };
        let selected = select(&defs, &selection).unwrap();
        assert_eq!(names(&selected), vec!["first/ignored", "second/level-ten"]);
    }

    #[test]
    fn unknown_test_fails() {
        let defs = sample();
        let selection = Selection {
            tests: vec!["no-such-test".to_string()],
            ..Selection::default()
        };
        let err = select(&defs, &selection).unwrap_err();
        assert_eq!(err, SelectError::UnknownTest("no-such-test".to_string()));
    }

    #[test]
    fn test_outside_scope_is_unknown() {
        let defs = sample();
        let selection = Selection {
            collection: Some("alpha".to_string()),
            tests: vec!["level-ten".to_string()],
            ..Selection::default()
        };
        assert!(matches!(
            select(&defs, &selection),
            Err(SelectError::UnknownTest(_))
        ));
    }

    #[test]
    fn collection_and_job_scope() {
        let defs = sample();
        let selection = Selection {
            collection: Some("beta".to_string()),
            run_level: 100,
            ..Selection::default()
        };
        assert_eq!(
            names(&select(&defs, &selection).unwrap()),
            vec!["second/level-ten"]
        );

        let unknown = Selection {
            collection: Some("gamma".to_string()),
            ..Selection::default()
        };
        assert_eq!(
            select(&defs, &unknown).unwrap_err(),
            SelectError::UnknownCollection("gamma".to_string())
        );

        let unknown_job = Selection {
            job: Some("third".to_string()),
            ..Selection::default()
        };
        assert_eq!(
            select(&defs, &unknown_job).unwrap_err(),
            SelectError::UnknownJob("third".to_string())
        );
    }

    #[test]
    fn all_tests_includes_ignored_and_expensive() {
        let defs = sample();
        assert_eq!(
            names(&all_tests(&defs)),
            vec![
                "first/default-level",
                "first/level-one",
                "first/level-five",
                "first/ignored",
                "second/level-ten"
            ]
        );
    }

    #[test]
    fn naming_a_job_without_tests_fails() {
        let defs = sample();
        let selection = Selection {
            job: Some("empty".to_string()),
            ..Selection::default()
        };
        assert!(matches!(
            select(&defs, &selection),
            Err(SelectError::NoTests { .. })
        ));
    }
}
