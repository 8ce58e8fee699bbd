//! CLI tool for scoring the trustability of open source projects

use anyhow::{bail, Context};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use trustable_score::{
    assemble, read_sbom, score_batch, score_project, BatchOptions, GrimoireLabClient,
    GrimoireLabSource, LicenseRisk, MetricSource, MetricsDocument, OpenSearchSource,
    ProjectFailure, ProjectInput, Report, ReportFormat, ScoringEngine, StaticSource, TrustConfig,
};

/// Some projects failed or were cancelled
const EXIT_PARTIAL: i32 = 1;
/// Invalid configuration or unusable input
const EXIT_INVALID: i32 = 2;

#[derive(Parser)]
#[command(name = "trustable-score")]
#[command(about = "Score open source projects on development activity and license risk", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file (TOML)
    #[arg(short = 'c', long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Output format (json, markdown, text)
    #[arg(short = 'f', long, global = true, default_value = "text")]
    format: ReportFormat,

    /// Output file (default: stdout)
    #[arg(short = 'o', long, global = true)]
    output: Option<PathBuf>,

    /// OpenSearch URL holding GrimoireLab events
    #[arg(long, global = true)]
    opensearch_url: Option<String>,

    /// OpenSearch index holding GrimoireLab events
    #[arg(long, global = true)]
    opensearch_index: Option<String>,

    /// Read measurements from a metrics JSON file instead of OpenSearch
    #[arg(long, global = true)]
    measurements: Option<PathBuf>,

    /// GrimoireLab API URL; repositories are scheduled before scoring
    #[arg(long, global = true)]
    grimoirelab_url: Option<String>,

    /// GrimoireLab API user (default: $GRIMOIRELAB_USER)
    #[arg(long, global = true)]
    grimoirelab_user: Option<String>,

    /// GrimoireLab API password (default: $GRIMOIRELAB_PASSWORD)
    #[arg(long, global = true)]
    grimoirelab_password: Option<String>,

    /// Start of the analysis window (YYYY-MM-DD, default: one year ago)
    #[arg(long, global = true)]
    from_date: Option<NaiveDate>,

    /// End of the analysis window, exclusive (YYYY-MM-DD)
    #[arg(long, global = true)]
    to_date: Option<NaiveDate>,

    /// Verify TLS certificates of the OpenSearch server
    #[arg(long, global = true)]
    verify_certs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Score a single project
    Score {
        /// Project identifier (git repository URL)
        project: String,

        /// SPDX license expression of the project
        #[arg(short = 'l', long)]
        license: Option<String>,
    },

    /// Score many projects concurrently
    Batch {
        /// File with one `<project> [<spdx expression>]` per line
        list: Option<PathBuf>,

        /// SPDX JSON SBOM listing the projects
        #[arg(long)]
        sbom: Option<PathBuf>,

        /// Maximum number of projects fetched at the same time
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Print raw metrics as JSON without scoring
    Fetch {
        /// Project identifiers (git repository URLs)
        projects: Vec<String>,

        /// SPDX JSON SBOM listing the projects
        #[arg(long)]
        sbom: Option<PathBuf>,
    },

    /// Validate the configuration and print the metric table
    CheckConfig,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose);

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            EXIT_INVALID
        }
    };

    process::exit(code);
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Run a subcommand; errors returned here mean unusable configuration or input
async fn run(cli: Cli) -> anyhow::Result<i32> {
    let config = load_config(&cli)?;
    config.validate().context("Invalid configuration")?;

    match &cli.command {
        Commands::CheckConfig => {
            check_config(&cli, &config)?;
            Ok(0)
        }
        Commands::Score { project, license } => {
            let input = ProjectInput::new(project.clone(), license.clone());
            run_score(&cli, &config, input).await
        }
        Commands::Batch {
            list,
            sbom,
            concurrency,
        } => {
            let projects = collect_projects(list.as_deref(), sbom.as_deref(), &[])?;
            run_batch(&cli, &config, projects, *concurrency).await
        }
        Commands::Fetch { projects, sbom } => {
            let projects = collect_projects(None, sbom.as_deref(), projects)?;
            run_fetch(&cli, &config, projects).await
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<TrustConfig> {
    let mut config = match &cli.config {
        Some(path) => TrustConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => TrustConfig::default(),
    };

    if let Some(url) = &cli.opensearch_url {
        config.source.opensearch_url = url.clone();
    }
    if let Some(index) = &cli.opensearch_index {
        config.source.opensearch_index = index.clone();
    }
    if cli.from_date.is_some() {
        config.source.from_date = cli.from_date;
    }
    if cli.to_date.is_some() {
        config.source.to_date = cli.to_date;
    }
    if cli.verify_certs {
        config.source.verify_certs = true;
    }
    if let Some(url) = &cli.grimoirelab_url {
        config.grimoirelab.url = Some(url.clone());
    }
    if let Some(user) = &cli.grimoirelab_user {
        config.grimoirelab.user = Some(user.clone());
    }
    if let Some(password) = &cli.grimoirelab_password {
        config.grimoirelab.password = Some(password.clone());
    }

    Ok(config)
}

fn build_engine(config: &TrustConfig) -> anyhow::Result<Arc<ScoringEngine>> {
    let registry = Arc::new(config.build_registry()?);
    Ok(Arc::new(ScoringEngine::new(
        registry,
        config.license_multipliers.clone(),
    )?))
}

async fn build_source(cli: &Cli, config: &TrustConfig) -> anyhow::Result<Arc<dyn MetricSource>> {
    if let Some(path) = &cli.measurements {
        let source = StaticSource::from_file(path)
            .with_context(|| format!("Failed to read measurements {}", path.display()))?;
        return Ok(Arc::new(source));
    }

    let opensearch = OpenSearchSource::new(&config.source, &config.network)?;
    if config.grimoirelab.url.is_none() {
        return Ok(Arc::new(opensearch));
    }

    let client = GrimoireLabClient::connect(&config.grimoirelab, &config.network)
        .await
        .context("Failed to connect to GrimoireLab")?;
    Ok(Arc::new(GrimoireLabSource::new(
        client,
        opensearch,
        &config.grimoirelab,
    )))
}

/// Parse a project list: `<project> [<spdx expression>]` per line
fn parse_project_list(content: &str) -> Vec<ProjectInput> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| match line.split_once(char::is_whitespace) {
            Some((project, license)) => {
                ProjectInput::new(project, Some(license.trim().to_string()))
            }
            None => ProjectInput::new(line, None),
        })
        .collect()
}

fn collect_projects(
    list: Option<&Path>,
    sbom: Option<&Path>,
    named: &[String],
) -> anyhow::Result<Vec<ProjectInput>> {
    let mut projects: Vec<ProjectInput> = named
        .iter()
        .map(|p| ProjectInput::new(p.clone(), None))
        .collect();

    if let Some(path) = list {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read project list {}", path.display()))?;
        projects.extend(parse_project_list(&content));
    }
    if let Some(path) = sbom {
        info!("Parsing file {}", path.display());
        projects.extend(
            read_sbom(path).with_context(|| format!("Failed to read SBOM {}", path.display()))?,
        );
    }

    if projects.is_empty() {
        bail!("No projects to analyze; pass a project list, project names or --sbom");
    }

    let mut seen = HashSet::new();
    projects.retain(|p| seen.insert(p.project.clone()));
    Ok(projects)
}

fn spinner(message: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
        spinner.set_style(style);
    }
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(std::time::Duration::from_millis(100));
    spinner
}

async fn run_score(cli: &Cli, config: &TrustConfig, input: ProjectInput) -> anyhow::Result<i32> {
    let engine = build_engine(config)?;
    let source = build_source(cli, config).await?;

    let spinner = spinner(&format!("Scoring {}...", input.project));
    let result = score_project(&input, source.as_ref(), &engine, &config.license_policy).await;
    spinner.finish_and_clear();

    match result {
        Ok((score, warnings)) => {
            for warning in &warnings {
                warn!("{}: {}", input.project, warning);
            }
            emit_report(cli, &assemble(vec![score]))?;
            Ok(0)
        }
        Err(e) if e.is_configuration() => Err(e.into()),
        Err(e) => {
            eprintln!("{} {}: {}", "Failed:".red().bold(), input.project, e);
            Ok(EXIT_PARTIAL)
        }
    }
}

async fn run_batch(
    cli: &Cli,
    config: &TrustConfig,
    projects: Vec<ProjectInput>,
    concurrency: Option<usize>,
) -> anyhow::Result<i32> {
    let engine = build_engine(config)?;
    let source = build_source(cli, config).await?;

    let mut options = BatchOptions::from_config(config);
    if let Some(concurrency) = concurrency {
        if concurrency == 0 {
            bail!("--concurrency must be at least 1");
        }
        options.max_concurrent = concurrency;
    }
    if cli.measurements.is_some() {
        // Offline measurements never wait on GrimoireLab
        options.fetch_timeout = config.network.fetch_timeout();
    }

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing projects already in progress");
            let _ = cancel_tx.send(true);
        }
    });

    let spinner = spinner(&format!("Scoring {} projects...", projects.len()));
    let outcome = score_batch(projects, source, engine, &options, cancel_rx).await;
    spinner.finish_and_clear();

    let complete = outcome.is_complete();
    let mut failures = outcome.failures;
    failures.extend(outcome.cancelled.into_iter().map(|project| ProjectFailure {
        project,
        metric: None,
        reason: "cancelled before fetching".to_string(),
    }));

    let report = assemble(outcome.scores).with_failures(failures);
    emit_report(cli, &report)?;

    Ok(if complete { 0 } else { EXIT_PARTIAL })
}

async fn run_fetch(
    cli: &Cli,
    config: &TrustConfig,
    projects: Vec<ProjectInput>,
) -> anyhow::Result<i32> {
    let source = build_source(cli, config).await?;
    let mut document = MetricsDocument::default();
    let mut failed = 0;

    let spinner = spinner(&format!("Fetching metrics for {} projects...", projects.len()));
    for input in &projects {
        match source.fetch(&input.project).await {
            Ok(measurements) => {
                document
                    .repositories
                    .entry(input.project.clone())
                    .or_default();
                document.extend(measurements);
            }
            Err(e) => {
                error!("Failed to fetch {}: {}", input.project, e);
                failed += 1;
            }
        }
    }
    spinner.finish_and_clear();

    write_output(cli, &serde_json::to_string_pretty(&document)?)?;
    Ok(if failed == 0 { 0 } else { EXIT_PARTIAL })
}

fn check_config(cli: &Cli, config: &TrustConfig) -> anyhow::Result<()> {
    let registry = config.build_registry()?;

    let mut out = String::new();
    out.push_str(&format!(
        "{:<30} {:>8} {:>10} {:<12} {}\n",
        "METRIC", "WEIGHT", "EFFECTIVE", "CURVE", "ENABLED"
    ));
    for definition in registry.definitions() {
        let effective = registry.effective_weight(&definition.key)?;
        out.push_str(&format!(
            "{:<30} {:>8.3} {:>9.1}% {:<12} {}\n",
            definition.key,
            definition.weight,
            effective * 100.0,
            definition.normalization.name(),
            if definition.enabled { "yes" } else { "no" },
        ));
    }

    out.push_str("\nLicense multipliers:\n");
    for risk in LicenseRisk::ALL {
        out.push_str(&format!(
            "  {:<16} {:.2}\n",
            risk.to_string(),
            config.license_multipliers.multiplier(risk)
        ));
    }

    write_output(cli, &out)?;
    if cli.output.is_none() {
        println!("{} Configuration is valid", "Success:".green().bold());
    }
    Ok(())
}

fn emit_report(cli: &Cli, report: &Report) -> anyhow::Result<()> {
    if cli.format == ReportFormat::Text && cli.output.is_none() {
        display_report(report);
        return Ok(());
    }
    write_output(cli, &report.render(cli.format)?)
}

fn write_output(cli: &Cli, content: &str) -> anyhow::Result<()> {
    match &cli.output {
        Some(path) => {
            std::fs::write(path, content)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!("Report written to: {}", path.display());
        }
        None => println!("{}", content),
    }
    Ok(())
}

fn display_report(report: &Report) {
    println!("\n{}", "=== Trust Scores ===".bold());

    for row in &report.rows {
        let score = format!("{:>6.2}", row.score);
        let score = if row.score >= 70.0 {
            score.green()
        } else if row.score >= 40.0 {
            score.yellow()
        } else {
            score.red()
        };
        let license = match row.license_risk {
            LicenseRisk::Permissive => row.license_risk.to_string().green(),
            LicenseRisk::WeakCopyleft => row.license_risk.to_string().yellow(),
            _ => row.license_risk.to_string().red(),
        };

        println!("\n{} {}", score, row.project.bold());
        println!(
            "  License: {}  Coverage: {:.0}%",
            license,
            row.coverage * 100.0
        );
        if let Some(metric) = &row.top_contributor {
            println!("  Strongest: {}", metric.cyan());
        }
        if let Some(metric) = &row.top_detractor {
            println!("  Weakest:   {}", metric.yellow());
        }
    }

    if !report.failures.is_empty() {
        println!("\n{}", "=== Failures ===".bold());
        for failure in &report.failures {
            println!("  {} {}: {}", "●".red(), failure.project, failure.reason);
        }
    }

    println!();
    println!(
        "Scored {}/{} projects, average score {:.2}",
        report.summary.scored, report.summary.total_projects, report.summary.average_score
    );
}
