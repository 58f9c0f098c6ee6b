//! Check evaluation.
//!
//! Scores a job's execution against its declared [`CheckSpec`]. Evaluation
//! never stops at the first failure: every declared check is looked at and
//! every failure is returned. The only short-circuit is a failed `exists`
//! check, which skips the remaining checks of that one output.

use crate::schema::{Check, CheckSpec, OutputCheck};
use crate::strategy::ExecutionResult;
use std::fmt;
use std::path::{Path, PathBuf};

/// Exit code required when a test does not declare one.
pub const DEFAULT_EXIT_CODE: i32 = 0;

/// A single failed expectation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckFailure {
    /// The job was killed after exceeding its timeout.
    TimedOut { after_secs: u64 },
    /// The job ended without an exit code (killed by a signal).
    Terminated { expected: i32 },
    ExitCode { expected: i32, actual: i32 },
    Missing { output: PathBuf },
    UnexpectedOutput { output: PathBuf },
    LineCount { output: PathBuf, expected: u64, actual: u64 },
    NotContained { output: PathBuf, expected: String },
    NoMatch { output: PathBuf, pattern: String },
    InvalidPattern { output: PathBuf, pattern: String, message: String },
    Unreadable { output: PathBuf, message: String },
}

impl fmt::Display for CheckFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckFailure::TimedOut { after_secs } => {
                write!(f, "timed out after {after_secs}s (process tree killed)")
            }
            CheckFailure::Terminated { expected } => {
                write!(f, "exitCode: expected {expected}, but the process was killed by a signal")
            }
            CheckFailure::ExitCode { expected, actual } => {
                write!(f, "exitCode: expected {expected}, got {actual}")
            }
            CheckFailure::Missing { output } => {
                write!(f, "{}: exists: expected the file to exist", output.display())
            }
            CheckFailure::UnexpectedOutput { output } => {
                write!(f, "{}: exists: expected the file not to exist", output.display())
            }
            CheckFailure::LineCount { output, expected, actual } => {
                write!(f, "{}: lineCount expected {expected}, got {actual}", output.display())
            }
            CheckFailure::NotContained { output, expected } => {
                write!(f, "{}: contains: expected to contain {expected:?}", output.display())
            }
            CheckFailure::NoMatch { output, pattern } => {
                write!(f, "{}: matches: expected to match {pattern:?}", output.display())
            }
            CheckFailure::InvalidPattern { output, pattern, message } => {
                write!(f, "{}: matches: invalid pattern {pattern:?}: {message}", output.display())
            }
            CheckFailure::Unreadable { output, message } => {
                write!(f, "{}: cannot read: {message}", output.display())
            }
        }
    }
}

/// Evaluate the whole check tree.
///
/// `output_dir` is the simulated project directory the job wrote into.
pub fn evaluate(spec: &CheckSpec, result: &ExecutionResult, output_dir: &Path) -> Vec<CheckFailure> {
    let mut failures = Vec::new();

    let expected = spec.exit_code.unwrap_or(DEFAULT_EXIT_CODE);
    if result.timed_out {
        failures.push(CheckFailure::TimedOut {
            after_secs: result.duration.as_secs(),
        });
    } else {
        match result.exit_code {
            Some(actual) if actual != expected => {
                failures.push(CheckFailure::ExitCode { expected, actual });
            }
            Some(_) => {}
            None => failures.push(CheckFailure::Terminated { expected }),
        }
    }

    for output in &spec.outputs {
        check_output(output, output_dir, &mut failures);
    }

    failures
}

fn check_output(output: &OutputCheck, output_dir: &Path, failures: &mut Vec<CheckFailure>) {
    let path = output_dir.join(&output.name);
    // Read lazily, once, for the content checks.
    let mut contents: Option<Result<Vec<u8>, String>> = None;

    for check in &output.checks {
        match check {
            Check::Exists(expected) => {
                let exists = path.exists();
                if *expected && !exists {
                    failures.push(CheckFailure::Missing {
                        output: output.name.clone(),
                    });
                    return;
                }
                if !*expected && exists {
                    failures.push(CheckFailure::UnexpectedOutput {
                        output: output.name.clone(),
                    });
                    return;
                }
            }
            content_check => {
                let bytes = contents
                    .get_or_insert_with(|| std::fs::read(&path).map_err(|e| e.to_string()));
                match bytes {
                    Ok(bytes) => {
                        if let Some(failure) = check_content(content_check, &output.name, bytes) {
                            failures.push(failure);
                        }
                    }
                    Err(message) => failures.push(CheckFailure::Unreadable {
                        output: output.name.clone(),
                        message: message.clone(),
                    }),
                }
            }
        }
    }
}

fn check_content(check: &Check, output: &Path, bytes: &[u8]) -> Option<CheckFailure> {
    match check {
        Check::Exists(_) => None,
        Check::LineCount(expected) => {
            let actual = count_lines(bytes);
            (actual != *expected).then(|| CheckFailure::LineCount {
                output: output.to_path_buf(),
                expected: *expected,
                actual,
            })
        }
        Check::Contains(needle) => {
            let text = String::from_utf8_lossy(bytes);
            (!text.contains(needle.as_str())).then(|| CheckFailure::NotContained {
                output: output.to_path_buf(),
                expected: needle.clone(),
            })
        }
        Check::Matches(pattern) => match regex::Regex::new(pattern) {
            Ok(re) => {
                let text = String::from_utf8_lossy(bytes);
                (!re.is_match(&text)).then(|| CheckFailure::NoMatch {
                    output: output.to_path_buf(),
                    pattern: pattern.clone(),
                })
            }
            Err(e) => Some(CheckFailure::InvalidPattern {
                output: output.to_path_buf(),
                pattern: pattern.clone(),
                message: e.to_string(),
            }),
        },
    }
}

/// Number of newline-terminated records. A trailing fragment without a
/// newline is not a record.
pub fn count_lines(bytes: &[u8]) -> u64 {
    bytes.iter().filter(|&&b| b == b'\n').count() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    fn exited(code: i32) -> ExecutionResult {
        ExecutionResult {
            exit_code: Some(code),
            stdout: String::new(),
            stderr: String::new(),
            duration: Duration::from_millis(5),
            timed_out: false,
        }
    }

    fn output(name: &str, checks: Vec<Check>) -> OutputCheck {
        OutputCheck {
            name: PathBuf::from(name),
            checks,
        }
    }

    fn scenario_spec() -> CheckSpec {
        CheckSpec {
            exit_code: Some(0),
            outputs: vec![output(
                "diverse.smi",
                vec![Check::Exists(true), Check::LineCount(100)],
            )],
        }
    }

    fn write_lines(dir: &Path, name: &str, n: usize) {
        let body: String = (0..n).map(|i| format!("C{i}\n")).collect();
        std::fs::write(dir.join(name), body).unwrap();
    }

    #[test]
    fn satisfied_spec_has_no_failures() {
        let dir = tempdir().unwrap();
        write_lines(dir.path(), "diverse.smi", 100);
        assert!(evaluate(&scenario_spec(), &exited(0), dir.path()).is_empty());
    }

    #[test]
    fn one_wrong_line_count_is_exactly_one_failure() {
        let dir = tempdir().unwrap();
        write_lines(dir.path(), "diverse.smi", 99);

        let failures = evaluate(&scenario_spec(), &exited(0), dir.path());
        assert_eq!(
            failures,
            vec![CheckFailure::LineCount {
                output: PathBuf::from("diverse.smi"),
                expected: 100,
                actual: 99,
            }]
        );
        assert_eq!(
            failures[0].to_string(),
            "diverse.smi: lineCount expected 100, got 99"
        );
    }

    #[test]
    fn all_failures_are_reported() {
        let dir = tempdir().unwrap();
        write_lines(dir.path(), "a.txt", 3);
        let spec = CheckSpec {
            exit_code: Some(0),
            outputs: vec![
                output("a.txt", vec![Check::LineCount(4), Check::Contains("zzz".into())]),
                output("b.txt", vec![Check::Exists(true), Check::LineCount(1)]),
                output("a.txt", vec![Check::Matches(r"^C\d".into())]),
            ],
        };

        let failures = evaluate(&spec, &exited(2), dir.path());
        assert_eq!(failures.len(), 4, "{failures:?}");
        assert_eq!(failures[0], CheckFailure::ExitCode { expected: 0, actual: 2 });
        assert!(matches!(failures[1], CheckFailure::LineCount { expected: 4, actual: 3, .. }));
        assert!(matches!(failures[2], CheckFailure::NotContained { .. }));
        assert_eq!(
            failures[3],
            CheckFailure::Missing {
                output: PathBuf::from("b.txt")
            }
        );
    }

    #[test]
    fn missing_file_short_circuits_only_its_output() {
        let dir = tempdir().unwrap();
        write_lines(dir.path(), "present.txt", 1);
        let spec = CheckSpec {
            exit_code: None,
            outputs: vec![
                output("absent.txt", vec![Check::Exists(true), Check::LineCount(5)]),
                output("present.txt", vec![Check::Exists(true), Check::LineCount(2)]),
            ],
        };

        let failures = evaluate(&spec, &exited(0), dir.path());
        assert_eq!(failures.len(), 2, "{failures:?}");
        assert!(matches!(failures[0], CheckFailure::Missing { .. }));
        assert!(matches!(failures[1], CheckFailure::LineCount { expected: 2, actual: 1, .. }));
    }

    #[test]
    fn expected_absence() {
        let dir = tempdir().unwrap();
        let spec = CheckSpec {
            exit_code: None,
            outputs: vec![output("tmp.txt", vec![Check::Exists(false)])],
        };
        assert!(evaluate(&spec, &exited(0), dir.path()).is_empty());

        write_lines(dir.path(), "tmp.txt", 1);
        let failures = evaluate(&spec, &exited(0), dir.path());
        assert!(matches!(failures[0], CheckFailure::UnexpectedOutput { .. }));
    }

    #[test]
    fn content_check_without_exists_reports_unreadable() {
        let dir = tempdir().unwrap();
        let spec = CheckSpec {
            exit_code: None,
            outputs: vec![output("nope.txt", vec![Check::LineCount(1)])],
        };
        let failures = evaluate(&spec, &exited(0), dir.path());
        assert!(matches!(failures[0], CheckFailure::Unreadable { .. }));
    }

    #[test]
    fn undeclared_exit_code_requires_zero() {
        let dir = tempdir().unwrap();
        let spec = CheckSpec::default();
        assert!(evaluate(&spec, &exited(0), dir.path()).is_empty());
        assert_eq!(
            evaluate(&spec, &exited(1), dir.path()),
            vec![CheckFailure::ExitCode { expected: 0, actual: 1 }]
        );
    }

    #[test]
    fn declared_nonzero_exit_code() {
        let dir = tempdir().unwrap();
        let spec = CheckSpec {
            exit_code: Some(2),
            outputs: vec![],
        };
        assert!(evaluate(&spec, &exited(2), dir.path()).is_empty());
    }

    #[test]
    fn timeout_is_distinct_from_exit_code() {
        let dir = tempdir().unwrap();
        write_lines(dir.path(), "diverse.smi", 100);
        let result = ExecutionResult {
            exit_code: None,
            timed_out: true,
            duration: Duration::from_secs(600),
            ..exited(0)
        };

        let failures = evaluate(&scenario_spec(), &result, dir.path());
        assert_eq!(failures, vec![CheckFailure::TimedOut { after_secs: 600 }]);
        assert!(failures[0].to_string().contains("timed out"));
    }

    #[test]
    fn killed_by_signal() {
        let dir = tempdir().unwrap();
        let result = ExecutionResult {
            exit_code: None,
            ..exited(0)
        };
        let failures = evaluate(&CheckSpec::default(), &result, dir.path());
        assert_eq!(failures, vec![CheckFailure::Terminated { expected: 0 }]);
    }

    #[test]
    fn line_count_counts_terminated_records() {
        assert_eq!(count_lines(b""), 0);
        assert_eq!(count_lines(b"a\n"), 1);
        assert_eq!(count_lines(b"a\nb"), 1);
        assert_eq!(count_lines(b"a\n\nb\n"), 3);
    }

    #[test]
    fn regex_match() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("log.txt"), "processed 100 molecules\n").unwrap();
        let spec = CheckSpec {
            exit_code: None,
            outputs: vec![output(
                "log.txt",
                vec![
                    Check::Matches(r"processed \d+ molecules".into()),
                    Check::Contains("100".into()),
                ],
            )],
        };
        assert!(evaluate(&spec, &exited(0), dir.path()).is_empty());
    }
}
