//! `macroflow` command line: run, inspect and convert desktop macros.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use futures::StreamExt;
use macroflow::matching::StillScreen;
use macroflow::storage::library::{read_file, write_file};
use macroflow::storage::{save_as, MacroLibrary};
use macroflow::{
    ActionDriver, DryRunDriver, Engine, FailurePolicy, MacroFormat, MatchingService, Rect,
    RunOptions, RunOutcome, ScreenMatcher, Settings,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod duration;
mod output;

use duration::parse_millis;

const EXIT_FAILED: i32 = 1;
const EXIT_ABORTED: i32 = 130;

#[derive(Parser)]
#[command(name = "macroflow", version, about = "Desktop macros gated by what is on screen")]
struct Cli {
    /// Settings file (defaults to ~/.macroflow/settings.json)
    #[clap(long, global = true, env = "MACROFLOW_SETTINGS")]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a macro file
    Run(RunArgs),
    /// Check a macro file for structural problems
    Validate {
        file: PathBuf,
    },
    /// Print a macro's step tree
    Show {
        file: PathBuf,
    },
    /// Re-encode a macro (also upgrades legacy files)
    Convert {
        input: PathBuf,
        output: PathBuf,
        /// Output encoding; inferred from the output extension when omitted
        #[clap(long, short)]
        format: Option<FormatArg>,
    },
    /// List macros stored in the library
    List {
        /// Library directory (defaults to the settings value or ~/.macroflow/macros)
        #[clap(long, short)]
        dir: Option<PathBuf>,
        /// Print JSON instead of a table
        #[clap(long)]
        json: bool,
    },
    /// Print recognized text from the screen or an image file
    Ocr {
        /// Region as x,y,width,height
        #[clap(long, short, value_parser = parse_region)]
        region: Option<Rect>,
        /// Recognize this image instead of capturing the screen
        #[clap(long)]
        image: Option<PathBuf>,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    file: PathBuf,

    /// Variable override, repeatable: --var name=value
    #[clap(long = "var", short = 'v', value_parser = parse_key_val)]
    vars: Vec<(String, String)>,

    /// What a failed step does to the run
    #[clap(long, env = "MACROFLOW_POLICY")]
    policy: Option<PolicyArg>,

    /// Abort the run after this long (e.g. 90s, 5m)
    #[clap(long, env = "MACROFLOW_TIMEOUT", value_parser = parse_millis)]
    timeout: Option<u64>,

    /// Delay between screen probes while waiting for a match
    #[clap(long, env = "MACROFLOW_POLL_INTERVAL", value_parser = parse_millis)]
    poll_interval: Option<u64>,

    /// Pause after each successful step
    #[clap(long, env = "MACROFLOW_STEP_DELAY", value_parser = parse_millis)]
    step_delay: Option<u64>,

    /// Log input actions instead of performing them
    #[clap(long)]
    dry_run: bool,

    /// Match against this screenshot instead of the live screen
    #[clap(long)]
    screenshot: Option<PathBuf>,

    /// Write the full run report as JSON
    #[clap(long)]
    trace_out: Option<PathBuf>,

    /// Only print the final report
    #[clap(long, short)]
    quiet: bool,
}

#[derive(Clone, Copy, ValueEnum)]
#[clap(rename_all = "lower")]
enum PolicyArg {
    Skip,
    Abort,
}

impl From<PolicyArg> for FailurePolicy {
    fn from(p: PolicyArg) -> Self {
        match p {
            PolicyArg::Skip => FailurePolicy::SkipAndContinue,
            PolicyArg::Abort => FailurePolicy::AbortOnFailure,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
#[clap(rename_all = "lower")]
enum FormatArg {
    Json,
    Yaml,
}

impl From<FormatArg> for MacroFormat {
    fn from(f: FormatArg) -> Self {
        match f {
            FormatArg::Json => MacroFormat::Json,
            FormatArg::Yaml => MacroFormat::Yaml,
        }
    }
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got `{s}`"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty variable name in `{s}`"));
    }
    Ok((key.to_string(), value.to_string()))
}

fn parse_region(s: &str) -> Result<Rect, String> {
    let parts: Vec<&str> = s.split(',').map(str::trim).collect();
    if parts.len() != 4 {
        return Err(format!("expected x,y,width,height, got `{s}`"));
    }
    let x = parts[0].parse::<i32>().map_err(|e| format!("x: {e}"))?;
    let y = parts[1].parse::<i32>().map_err(|e| format!("y: {e}"))?;
    let width = parts[2].parse::<u32>().map_err(|e| format!("width: {e}"))?;
    let height = parts[3].parse::<u32>().map_err(|e| format!("height: {e}"))?;
    if width == 0 || height == 0 {
        return Err("region must have a non-zero size".to_string());
    }
    Ok(Rect::new(x, y, width, height))
}

fn init_logging() {
    let log_level = std::env::var("LOG_LEVEL")
        .map(|level| match level.to_lowercase().as_str() {
            "error" => Level::ERROR,
            "info" => Level::INFO,
            "debug" => Level::DEBUG,
            "trace" => Level::TRACE,
            _ => Level::WARN,
        })
        .unwrap_or(Level::WARN);

    let _ = tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false),
        )
        .try_init();
}

#[tokio::main]
async fn main() {
    init_logging();
    let cli = Cli::parse();

    match dispatch(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            std::process::exit(EXIT_FAILED);
        }
    }
}

async fn dispatch(cli: Cli) -> Result<i32> {
    let settings = match &cli.settings {
        Some(path) => Settings::load(path)?,
        None => Settings::load_default()?,
    };
    debug!("Loaded settings: {:?}", settings);

    match cli.command {
        Commands::Run(args) => run_macro(args, &settings).await,
        Commands::Validate { file } => validate(&file),
        Commands::Show { file } => {
            let document = read_file(&file)?;
            output::print_macro_tree(&document);
            Ok(0)
        }
        Commands::Convert { input, output, format } => {
            convert(&input, &output, format.map(MacroFormat::from))?;
            Ok(0)
        }
        Commands::List { dir, json } => {
            let root = dir
                .or_else(|| settings.library_dir.clone())
                .or_else(MacroLibrary::default_root)
                .ok_or_else(|| anyhow!("no library directory: pass --dir"))?;
            let entries = MacroLibrary::open(root)?.list()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                output::print_library(&entries);
            }
            Ok(0)
        }
        Commands::Ocr { region, image } => {
            let matcher = ocr_matcher(image.as_deref())?;
            let results = matcher.extract_text(region).await?;
            output::print_text_results(&results);
            Ok(0)
        }
    }
}

async fn run_macro(args: RunArgs, settings: &Settings) -> Result<i32> {
    let document =
        read_file(&args.file).with_context(|| format!("loading {}", args.file.display()))?;

    let mut config = settings.engine.clone();
    if let Some(policy) = args.policy {
        config = config.with_failure_policy(policy.into());
    }
    if let Some(ms) = args.timeout {
        config = config.with_run_timeout_ms(Some(ms));
    }
    if let Some(ms) = args.poll_interval {
        config = config.with_poll_interval_ms(ms);
    }
    if let Some(ms) = args.step_delay {
        config = config.with_step_delay_ms(ms);
    }

    let asset_root = args
        .file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .or_else(|| settings.asset_root.clone())
        .unwrap_or_else(|| PathBuf::from("."));
    let matcher = run_matcher(args.screenshot.as_deref(), asset_root)?;
    let driver = run_driver(args.dry_run)?;
    info!("Running {} with {} / {}", document.name, matcher.name(), driver.name());

    let options = RunOptions {
        variables: args.vars.into_iter().collect(),
        run_id: None,
    };
    let engine = Engine::new(matcher, driver, config);
    let mut events = engine.event_stream();
    let handle = engine.start(Arc::new(document), options)?;

    if !args.quiet {
        println!("{} {}", "▶".cyan().bold(), args.file.display());
    }
    let quiet = args.quiet;
    let progress = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            if !quiet {
                output::print_event(&event);
            }
            if matches!(event, macroflow::RunEvent::RunFinished { .. }) {
                break;
            }
        }
    });

    let context = handle.context();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling run");
            context.cancel();
        }
    });

    let report = handle.wait().await?;
    interrupt.abort();
    let _ = progress.await;

    output::print_report(&report);
    if let Some(path) = &args.trace_out {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
        println!("Report written to {}", path.display());
    }

    Ok(match report.outcome {
        RunOutcome::Completed => 0,
        RunOutcome::Aborted { .. } => EXIT_ABORTED,
        RunOutcome::Failed { .. } => EXIT_FAILED,
    })
}

fn run_matcher(screenshot: Option<&Path>, asset_root: PathBuf) -> Result<Arc<dyn MatchingService>> {
    if let Some(path) = screenshot {
        let matcher =
            ScreenMatcher::new(Arc::new(StillScreen::open(path)?)).with_asset_root(asset_root);
        return Ok(Arc::new(with_recognizer(matcher)));
    }
    live_matcher(asset_root)
}

#[cfg(feature = "screen")]
fn live_matcher(asset_root: PathBuf) -> Result<Arc<dyn MatchingService>> {
    let matcher = ScreenMatcher::new(Arc::new(macroflow::XcapScreen)).with_asset_root(asset_root);
    Ok(Arc::new(with_recognizer(matcher)))
}

#[cfg(not(feature = "screen"))]
fn live_matcher(_asset_root: PathBuf) -> Result<Arc<dyn MatchingService>> {
    warn!("Built without the `screen` feature; image and text steps will fail");
    Ok(Arc::new(macroflow::UnavailableMatcher::default()))
}

#[cfg(feature = "screen")]
fn with_recognizer(matcher: ScreenMatcher) -> ScreenMatcher {
    matcher.with_recognizer(Arc::new(macroflow::UniOcrRecognizer::default()))
}

#[cfg(not(feature = "screen"))]
fn with_recognizer(matcher: ScreenMatcher) -> ScreenMatcher {
    matcher
}

#[cfg(feature = "input")]
fn run_driver(dry_run: bool) -> Result<Arc<dyn ActionDriver>> {
    if dry_run {
        return Ok(Arc::new(DryRunDriver::new()));
    }
    Ok(Arc::new(macroflow::RdevDriver::new()))
}

#[cfg(not(feature = "input"))]
fn run_driver(dry_run: bool) -> Result<Arc<dyn ActionDriver>> {
    if !dry_run {
        bail!("built without the `input` feature; pass --dry-run to log actions instead");
    }
    Ok(Arc::new(DryRunDriver::new()))
}

fn ocr_matcher(image: Option<&Path>) -> Result<Arc<dyn MatchingService>> {
    if !cfg!(feature = "screen") {
        bail!("text recognition needs the `screen` feature");
    }
    let cwd = PathBuf::from(".");
    match image {
        Some(path) => run_matcher(Some(path), cwd),
        None => live_matcher(cwd),
    }
}

fn validate(file: &Path) -> Result<i32> {
    println!("{} {}", "Validating".bold(), file.display());
    let document = match read_file(file) {
        Ok(document) => document,
        Err(e) => {
            println!("{}", "❌ INVALID".red().bold());
            println!("  {} {}", "✗".red(), e);
            return Ok(EXIT_FAILED);
        }
    };
    if let Err(e) = document.validate() {
        println!("{}", "❌ INVALID".red().bold());
        println!("  {} {}", "✗".red(), e);
        return Ok(EXIT_FAILED);
    }

    let warnings: Vec<String> = document
        .referenced_variables()
        .into_iter()
        .filter(|name| {
            !document.variables.contains_key(name) && !is_produced_at_runtime(&document, name)
        })
        .map(|name| format!("variable `{name}` has no default; pass --var {name}=..."))
        .collect();

    if warnings.is_empty() {
        println!("{}", "✅ VALID".green().bold());
    } else {
        println!("{}", "⚠️  VALID WITH WARNINGS".yellow().bold());
        println!("\n{}", "Warnings:".yellow().bold());
        for warning in &warnings {
            println!("  {} {}", "⚠".yellow(), warning);
        }
    }
    println!(
        "\n{} steps, nesting depth {}",
        document.step_count(),
        document.max_depth()
    );
    Ok(0)
}

/// Names bound by the engine while the macro runs: match results, output
/// variables and loop indices.
fn is_produced_at_runtime(document: &macroflow::Macro, name: &str) -> bool {
    use macroflow::step::StepKind;

    if name.starts_with("matched_") {
        return true;
    }
    let mut produced = false;
    document.visit(&mut |step, _| {
        let output = match &step.kind {
            StepKind::WaitImage(w) => w.output_variable.as_deref(),
            StepKind::TextSearch(t) => t.output_variable.as_deref(),
            StepKind::Loop(l) => {
                produced |= l.index_variable.as_deref() == Some(name);
                None
            }
            _ => None,
        };
        if let Some(base) = output {
            produced |= name == base || name == format!("{base}_x") || name == format!("{base}_y");
        }
    });
    produced
}

fn convert(input: &Path, output: &Path, format: Option<MacroFormat>) -> Result<()> {
    let document = read_file(input).with_context(|| format!("loading {}", input.display()))?;
    match format {
        None => write_file(&document, output)?,
        Some(format) => {
            let bytes = save_as(&document, format)?;
            std::fs::write(output, bytes).with_context(|| format!("writing {}", output.display()))?;
        }
    }
    println!(
        "{} {} -> {}",
        "✓".green(),
        input.display(),
        output.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_val() {
        assert_eq!(parse_key_val("name=lee").unwrap(), ("name".to_string(), "lee".to_string()));
        assert_eq!(parse_key_val("q=a=b").unwrap(), ("q".to_string(), "a=b".to_string()));
        assert_eq!(parse_key_val("empty=").unwrap(), ("empty".to_string(), String::new()));
        assert!(parse_key_val("novalue").is_err());
        assert!(parse_key_val("=x").is_err());
    }

    #[test]
    fn test_parse_region() {
        assert_eq!(parse_region("10, 20, 300, 40").unwrap(), Rect::new(10, 20, 300, 40));
        assert_eq!(parse_region("-5,0,10,10").unwrap(), Rect::new(-5, 0, 10, 10));
        assert!(parse_region("1,2,3").is_err());
        assert!(parse_region("0,0,0,10").is_err());
        assert!(parse_region("a,0,1,1").is_err());
    }

    #[test]
    fn test_cli_parses_run_flags() {
        let cli = Cli::try_parse_from([
            "macroflow",
            "run",
            "login.json",
            "--var",
            "user=lee",
            "--policy",
            "abort",
            "--timeout",
            "2m",
            "--poll-interval",
            "250ms",
            "--dry-run",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.vars, vec![("user".to_string(), "lee".to_string())]);
        assert!(matches!(args.policy, Some(PolicyArg::Abort)));
        assert_eq!(args.timeout, Some(120_000));
        assert_eq!(args.poll_interval, Some(250));
        assert!(args.dry_run);
    }

    #[test]
    fn test_convert_json_to_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("m.json");
        let output = dir.path().join("m.yaml");
        let document = macroflow::Macro::new("convert me");
        write_file(&document, &input).unwrap();

        convert(&input, &output, None).unwrap();
        let text = std::fs::read_to_string(&output).unwrap();
        assert!(text.contains("schema_version: 2"));
        assert_eq!(read_file(&output).unwrap().name, "convert me");
    }
}
