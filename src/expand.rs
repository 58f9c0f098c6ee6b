//! Command template expansion.
//!
//! Renders a job's command template against a test's inputs and options
//! and splits the result into an argument vector.

use crate::schema::{Job, TestCase};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Variable holding the instance directory name, relative to the project directory.
pub const INSTANCE_DIRECTORY_VARIABLE: &str = "DM_INSTANCE_DIRECTORY";

/// Variable holding the repository root.
pub const CODE_DIRECTORY_VARIABLE: &str = "CODE_DIRECTORY";

/// Values provided by the simulated platform rather than by the test.
#[derive(Debug, Clone)]
pub struct ExpansionContext<'a> {
    pub instance_directory: &'a str,
    pub code_directory: &'a Path,
    /// Pass-through environment the platform injects into every job.
    pub environment: &'a BTreeMap<String, String>,
}

/// A command ready to execute.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ResolvedCommand {
    /// The rendered command line, as a single string.
    pub line: String,
    pub argv: Vec<String>,
    /// The directory the job starts in, as the job sees it.
    pub working_directory: PathBuf,
    pub env: BTreeMap<String, String>,
}

/// Error type for template expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpandError {
    /// A `{{` without a matching `}}`.
    Unclosed(String),
    /// `{{ }}` with nothing inside.
    EmptyPlaceholder,
    /// A placeholder naming neither an input nor an option of the test.
    Undeclared(String),
    /// Template syntax left in the rendered command.
    Unresolved(String),
    /// The command line could not be split into words.
    Split(String),
    /// The command rendered to nothing.
    EmptyCommand,
}

impl std::fmt::Display for ExpandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExpandError::Unclosed(text) => write!(f, "unclosed placeholder: {{{{{text}"),
            ExpandError::EmptyPlaceholder => f.write_str("empty placeholder"),
            ExpandError::Undeclared(name) => {
                write!(f, "placeholder '{name}' is not a declared input or option")
            }
            ExpandError::Unresolved(line) => write!(f, "unresolved template syntax in {line:?}"),
            ExpandError::Split(e) => write!(f, "cannot split command: {e}"),
            ExpandError::EmptyCommand => f.write_str("command is empty"),
        }
    }
}

impl std::error::Error for ExpandError {}

/// Replace every `{{ name }}` in `template` with its value from `variables`.
///
/// Whitespace inside the braces is ignored. Any other template syntax in the
/// template's literal text (`}}`, `{%`, `{#`) is reported as unresolved.
/// Substituted values are inserted verbatim and never rescanned.
pub fn render(template: &str, variables: &BTreeMap<String, String>) -> Result<String, ExpandError> {
    let mut result = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '{' && chars.peek() == Some(&'{') {
            chars.next(); // consume second '{'
            let mut name = String::new();
            loop {
                match chars.next() {
                    Some('}') if chars.peek() == Some(&'}') => {
                        chars.next();
                        break;
                    }
                    Some(c) => name.push(c),
                    None => return Err(ExpandError::Unclosed(name)),
                }
            }
            let name = name.trim();
            if name.is_empty() {
                return Err(ExpandError::EmptyPlaceholder);
            }
            let value = variables
                .get(name)
                .ok_or_else(|| ExpandError::Undeclared(name.to_string()))?;
            result.push_str(value);
        } else if matches!((c, chars.peek().copied()), ('}', Some('}')) | ('{', Some('%' | '#'))) {
            return Err(ExpandError::Unresolved(template.to_string()));
        } else {
            result.push(c);
        }
    }

    Ok(result)
}

/// The template variables a test declares, plus the platform built-ins.
///
/// Inputs resolve to their file name, which is where the simulator places
/// them in the project directory.
pub fn variables(test: &TestCase, ctx: &ExpansionContext<'_>) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();
    vars.insert(
        INSTANCE_DIRECTORY_VARIABLE.to_string(),
        ctx.instance_directory.to_string(),
    );
    vars.insert(
        CODE_DIRECTORY_VARIABLE.to_string(),
        ctx.code_directory.display().to_string(),
    );
    for (name, value) in test.options.iter() {
        vars.insert(name.to_string(), value.to_string());
    }
    for (name, path) in test.inputs.iter() {
        let file_name = path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        vars.insert(name.to_string(), file_name);
    }
    vars
}

/// Expand a job's command for one of its tests.
pub fn expand(
    job: &Job,
    test: &TestCase,
    ctx: &ExpansionContext<'_>,
) -> Result<ResolvedCommand, ExpandError> {
    let line = render(&job.command, &variables(test, ctx))?;
    let argv = shell_words::split(&line).map_err(|e| ExpandError::Split(e.to_string()))?;
    if argv.is_empty() {
        return Err(ExpandError::EmptyCommand);
    }

    let mut env = ctx.environment.clone();
    env.insert(
        INSTANCE_DIRECTORY_VARIABLE.to_string(),
        ctx.instance_directory.to_string(),
    );
    env.insert(
        CODE_DIRECTORY_VARIABLE.to_string(),
        ctx.code_directory.display().to_string(),
    );

    Ok(ResolvedCommand {
        line,
        argv,
        working_directory: job.image.working_directory(),
        env,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::OptionValue;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn job(command: &str) -> Job {
        serde_yaml::from_str(&format!(
            "image:\n  name: busybox\n  working-directory: /data/work\ncommand: {command:?}\n"
        ))
        .unwrap()
    }

    fn scenario_test() -> TestCase {
        let mut test = TestCase::default();
        test.inputs.insert("inputFile", PathBuf::from("data/100.smi"));
        test.options
            .insert("outputFile", OptionValue::Text("diverse.smi".to_string()));
        test.options.insert("count", OptionValue::Integer(100));
        test
    }

    #[test]
    fn render_placeholders() {
        let v = vars(&[("a", "1"), ("b", "two")]);
        assert_eq!(render("x {{a}} y {{ b }}", &v).unwrap(), "x 1 y two");
        assert_eq!(render("no placeholders", &v).unwrap(), "no placeholders");
        assert_eq!(render("", &v).unwrap(), "");
        assert_eq!(render("{ single } braces", &v).unwrap(), "{ single } braces");
    }

    #[test]
    fn render_undeclared() {
        let err = render("{{ missing }}", &vars(&[])).unwrap_err();
        assert_eq!(err, ExpandError::Undeclared("missing".to_string()));
    }

    #[test]
    fn render_unclosed() {
        let err = render("run {{ count", &vars(&[("count", "1")])).unwrap_err();
        assert!(matches!(err, ExpandError::Unclosed(_)));
        assert!(err.to_string().contains("unclosed"));
    }

    #[test]
    fn render_empty_placeholder() {
        assert_eq!(
            render("{{ }}", &vars(&[])).unwrap_err(),
            ExpandError::EmptyPlaceholder
        );
    }

    #[test]
    fn render_unsupported_statement() {
        let err = render("run {% if x %}--x{% endif %}", &vars(&[])).unwrap_err();
        assert!(matches!(err, ExpandError::Unresolved(_)));
    }

    #[test]
    fn render_stray_closing_braces() {
        let err = render("run }} x", &vars(&[])).unwrap_err();
        assert_eq!(err, ExpandError::Unresolved("run }} x".to_string()));
        assert!(matches!(
            render("run {# note #}", &vars(&[])),
            Err(ExpandError::Unresolved(_))
        ));
    }

    #[test]
    fn values_with_template_syntax_are_inserted_verbatim() {
        let v = vars(&[("config", r#"{"a":{"b":1}}"#), ("note", "{# x %}")]);
        assert_eq!(
            render("run --config '{{ config }}' {{ note }}", &v).unwrap(),
            r#"run --config '{"a":{"b":1}}' {# x %}"#
        );
    }

    #[test]
    fn expand_json_option() {
        let env = BTreeMap::new();
        let ctx = ExpansionContext {
            instance_directory: ".instance-1",
            code_directory: Path::new("/repo"),
            environment: &env,
        };
        let mut test = TestCase::default();
        test.options
            .insert("config", OptionValue::Text(r#"{"a":{"b":1}}"#.to_string()));

        let command = expand(&job("run --config '{{ config }}'"), &test, &ctx).unwrap();
        assert_eq!(command.argv, vec!["run", "--config", r#"{"a":{"b":1}}"#]);
    }

    #[test]
    fn expand_scenario_command() {
        let env = vars(&[("SQUONK_API_TOKEN", "abc")]);
        let ctx = ExpansionContext {
            instance_directory: ".instance-1",
            code_directory: Path::new("/repo"),
            environment: &env,
        };
        let job = job(
            "./max_min_picker.py -i {{ inputFile }} -o '{{ outputFile }}' -c {{ count }} -d {{ DM_INSTANCE_DIRECTORY }}",
        );

        let command = expand(&job, &scenario_test(), &ctx).unwrap();
        assert_eq!(
            command.argv,
            vec![
                "./max_min_picker.py",
                "-i",
                "100.smi",
                "-o",
                "diverse.smi",
                "-c",
                "100",
                "-d",
                ".instance-1"
            ]
        );
        assert_eq!(command.working_directory, PathBuf::from("/data/work"));
        assert_eq!(command.env.get("SQUONK_API_TOKEN").unwrap(), "abc");
        assert_eq!(command.env.get("DM_INSTANCE_DIRECTORY").unwrap(), ".instance-1");
        assert_eq!(command.env.get("CODE_DIRECTORY").unwrap(), "/repo");
    }

    #[test]
    fn expand_rejects_undeclared_option() {
        let env = BTreeMap::new();
        let ctx = ExpansionContext {
            instance_directory: ".instance-1",
            code_directory: Path::new("/repo"),
            environment: &env,
        };
        let err = expand(&job("run {{ seed }}"), &scenario_test(), &ctx).unwrap_err();
        assert_eq!(err, ExpandError::Undeclared("seed".to_string()));
    }

    #[test]
    fn expand_rejects_unbalanced_quotes() {
        let env = BTreeMap::new();
        let ctx = ExpansionContext {
            instance_directory: ".instance-1",
            code_directory: Path::new("/repo"),
            environment: &env,
        };
        let err = expand(&job("echo 'oops"), &TestCase::default(), &ctx).unwrap_err();
        assert!(matches!(err, ExpandError::Split(_)));
    }
}
