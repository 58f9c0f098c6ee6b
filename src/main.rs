mod checks;
mod expand;
mod loader;
mod report;
mod runner;
mod schema;
mod select;
mod simulator;
mod strategy;

use clap::{Args, Parser, Subcommand, ValueEnum};
use report::RunReport;
use runner::{RunConfig, RunOptions, TestPlan};
use select::Selection;
use std::fmt::Write as _;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Default, ValueEnum)]
enum OutputFormat {
    /// Human-readable output with checkmarks
    #[default]
    Human,
    /// Machine-readable JSON output
    Json,
    /// JUnit XML output for CI systems
    Junit,
}

#[derive(Parser)]
#[command(name = "jote")]
#[command(about = "Runs the tests declared in Data Manager job definitions")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct Location {
    /// Repository root
    #[arg(long, default_value = ".")]
    repo: PathBuf,
    /// Manifest file (default: <repo>/data-manager/manifest.yaml)
    #[arg(long)]
    manifest: Option<PathBuf>,
    /// Configuration file (default: <repo>/data-manager/jote.yaml, if present)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the selected job tests
    Run {
        #[command(flatten)]
        location: Location,
        /// Only run jobs in this collection
        #[arg(short, long)]
        collection: Option<String>,
        /// Only run this job
        #[arg(short, long)]
        job: Option<String>,
        /// Only run the named test (repeatable); named tests ignore run-levels
        #[arg(short, long = "test")]
        test: Vec<String>,
        /// Run tests up to this run-level
        #[arg(short, long, default_value_t = schema::MIN_RUN_LEVEL,
              value_parser = clap::value_parser!(u8).range(1..=100))]
        run_level: u8,
        /// Keep each test's simulated directory
        #[arg(short, long, conflicts_with = "dry_run")]
        keep_results: bool,
        /// Plan and print the commands without running them
        #[arg(short, long)]
        dry_run: bool,
        /// Stop after the first failing test
        #[arg(short = 'x', long)]
        exit_on_failure: bool,
        /// Output format
        #[arg(short, long, default_value = "human")]
        output: OutputFormat,
        /// Debug logging and job output in the report
        #[arg(short, long)]
        verbose: bool,
    },
    /// Load every job definition and expand every declared test
    Validate {
        #[command(flatten)]
        location: Location,
    },
    /// Output the job definition schema
    Schema,
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            location,
            collection,
            job,
            test,
            run_level,
            keep_results,
            dry_run,
            exit_on_failure,
            output,
            verbose,
        } => {
            init_logging(verbose);
            let (definitions, config) = load(&location);
            let selection = Selection {
                collection,
                job,
                tests: test,
                run_level,
            };

            if dry_run {
                let plans =
                    runner::plan(&definitions, &selection, &config).unwrap_or_else(|e| fail(e));
                print_plans(&plans, output);
                return;
            }

            let options = RunOptions {
                keep_results,
                exit_on_failure,
            };
            let report = runner::run(&definitions, &selection, &config, options)
                .unwrap_or_else(|e| fail(e));
            if report.jobs.is_empty() {
                eprintln!("No tests selected");
            }

            match output {
                OutputFormat::Human => print_human(&report, verbose),
                OutputFormat::Json => {
                    let (passed, failed) = report.counts();
                    let output = serde_json::json!({
                        "passed": passed,
                        "failed": failed,
                        "report": report,
                    });
                    match serde_json::to_string_pretty(&output) {
                        Ok(json) => println!("{json}"),
                        Err(e) => fail(e),
                    }
                }
                OutputFormat::Junit => print!("{}", format_junit_xml(&report)),
            }

            if !report.passed() {
                std::process::exit(1);
            }
        }
        Command::Validate { location } => {
            init_logging(false);
            let (definitions, config) = load(&location);
            let plans = runner::plan_all(&definitions, &config).unwrap_or_else(|e| fail(e));

            for definition in &definitions {
                let tests = plans
                    .iter()
                    .filter(|p| p.definition == definition.path)
                    .count();
                println!(
                    "✓ {} ({}, {} jobs, {tests} tests)",
                    definition.path.display(),
                    definition.document.collection,
                    definition.document.jobs.len()
                );
            }
            println!("\nAll {} definition(s) valid", definitions.len());
        }
        Command::Schema => {
            let schema = schema::generate_schema();
            match serde_json::to_string_pretty(&schema) {
                Ok(json) => println!("{json}"),
                Err(e) => fail(e),
            }
        }
    }
}

/// Log to stderr; `RUST_LOG` overrides the level.
fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn fail(error: impl std::fmt::Display) -> ! {
    eprintln!("Error: {error}");
    std::process::exit(1);
}

/// Load the definitions and resolve the run configuration.
fn load(location: &Location) -> (Vec<loader::LoadedDefinition>, RunConfig) {
    let repo_root = std::fs::canonicalize(&location.repo).unwrap_or_else(|e| {
        fail(format!("repository {}: {e}", location.repo.display()))
    });
    let manifest = location
        .manifest
        .clone()
        .unwrap_or_else(|| loader::default_manifest_path(&repo_root));

    let file_config =
        loader::load_config(location.config.as_deref(), &repo_root).unwrap_or_else(|e| fail(e));
    let config = RunConfig::resolve(&file_config, &repo_root);
    tracing::debug!(
        repo = %repo_root.display(),
        test_root = %config.test_root.display(),
        engine = %config.container_engine,
        "resolved configuration"
    );

    let definitions = loader::load_all(&manifest).unwrap_or_else(|e| fail(e));
    (definitions, config)
}

fn print_plans(plans: &[TestPlan], output: OutputFormat) {
    match output {
        OutputFormat::Json => match serde_json::to_string_pretty(plans) {
            Ok(json) => println!("{json}"),
            Err(e) => fail(e),
        },
        _ => {
            for plan in plans {
                println!(
                    "{}/{}/{} [{}, timeout {}s]",
                    plan.collection,
                    plan.job,
                    plan.test,
                    plan.kind(),
                    plan.timeout.as_secs()
                );
                for input in &plan.inputs {
                    println!("  < {}", input.source.display());
                }
                println!("  $ {}", plan.command.line);
            }
            println!("\n{} test(s) planned", plans.len());
        }
    }
}

fn print_human(report: &RunReport, verbose: bool) {
    for job in &report.jobs {
        println!("\n{}/{}", job.collection, job.job);
        for test in &job.tests {
            if test.passed {
                println!("  ✓ {} ({:.2?})", test.test, test.duration);
            } else {
                println!("  ✗ {} ({:.2?})", test.test, test.duration);
                for failure in &test.failures {
                    println!("    {failure}");
                }
            }
            if let Some(dir) = &test.retained_directory {
                println!("    kept: {}", dir.display());
            }
            if verbose && let Some(execution) = &test.execution {
                print_stream("stdout", &execution.stdout);
                print_stream("stderr", &execution.stderr);
            }
        }
    }

    let (passed, failed) = report.counts();
    println!("\n{passed} passed, {failed} failed");
}

fn print_stream(label: &str, content: &str) {
    if content.is_empty() {
        return;
    }
    println!("    {label}:");
    for line in content.lines() {
        println!("      {line}");
    }
}

/// Format the report as JUnit XML, one test suite per job.
fn format_junit_xml(report: &RunReport) -> String {
    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");

    let (passed, failed) = report.counts();
    let _ = writeln!(
        xml,
        "<testsuites tests=\"{}\" failures=\"{failed}\" time=\"{:.3}\" timestamp=\"{}\">",
        passed + failed,
        report.duration().as_secs_f64(),
        escape_xml(&report.started_at)
    );

    for job in &report.jobs {
        let failures = job.tests.iter().filter(|t| !t.passed).count();
        let _ = writeln!(
            xml,
            "  <testsuite name=\"{}\" tests=\"{}\" failures=\"{failures}\" time=\"{:.3}\">",
            escape_xml(&format!("{}.{}", job.collection, job.job)),
            job.tests.len(),
            job.duration().as_secs_f64()
        );

        for test in &job.tests {
            let _ = writeln!(
                xml,
                "    <testcase name=\"{}\" classname=\"{}\" time=\"{:.3}\">",
                escape_xml(&test.test),
                escape_xml(&format!("{}.{}", test.collection, test.job)),
                test.duration.as_secs_f64()
            );

            if !test.passed {
                let message = test
                    .failures
                    .first()
                    .map(|s| s.as_str())
                    .unwrap_or("Test failed");
                let _ = writeln!(xml, "      <failure message=\"{}\">", escape_xml(message));
                for failure in &test.failures {
                    let _ = writeln!(xml, "{}", escape_xml(failure));
                }
                xml.push_str("      </failure>\n");
            }

            if let Some(execution) = &test.execution {
                for (tag, content) in [("system-out", &execution.stdout), ("system-err", &execution.stderr)] {
                    if !content.is_empty() {
                        let _ = writeln!(xml, "      <{tag}>{}</{tag}>", escape_xml(content));
                    }
                }
            }

            xml.push_str("    </testcase>\n");
        }

        xml.push_str("  </testsuite>\n");
    }

    xml.push_str("</testsuites>\n");
    xml
}

/// Escape special XML characters.
fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
