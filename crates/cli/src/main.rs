//! inbox-probe CLI - Main Entry Point
//!
//! Runs one round-trip check against a web mail client and reports each
//! step. Exit status: 0 completed, 1 aborted (or soft failures with
//! `--strict`), 2 setup error.

use std::path::PathBuf;
use std::time::Duration;
use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing::info;

use inbox_probe::config::Credential;
use inbox_probe::report::EXIT_SETUP;
use inbox_probe::sim::{SimMailClient, SimOptions};
use inbox_probe::webdriver::WebDriverSession;
use inbox_probe::{Orchestrator, ProbeConfig, RunReport};

mod output;

use output::OutputFormat;

#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq, Eq)]
enum DriverKind {
    /// A real browser through a W3C WebDriver server
    #[default]
    Webdriver,
    /// The built-in simulated mail client (dry run)
    Sim,
}

/// inbox-probe - send a message to yourself and check it arrives intact
#[derive(Parser, Debug)]
#[command(name = "inbox-probe")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Account email address (overrides the config file)
    #[arg(long)]
    email: Option<String>,

    /// Account password
    #[arg(long, env = "INBOX_PROBE_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Configuration file (TOML, or YAML by extension)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Automation backend
    #[arg(long, value_enum, default_value = "webdriver")]
    driver: DriverKind,

    /// WebDriver server address (overrides the config file)
    #[arg(long)]
    webdriver_url: Option<String>,

    /// Show the browser window
    #[arg(long)]
    headed: bool,

    /// Delivery delay of the simulated client, in milliseconds
    #[arg(long, default_value = "3000")]
    sim_delay_ms: u64,

    /// Directory for run-report.json
    #[arg(short, long, default_value = "probe-results")]
    output: PathBuf,

    /// Output format
    #[arg(long, value_enum, default_value = "table")]
    format: OutputFormat,

    /// Treat soft verification failures as a failed run
    #[arg(long)]
    strict: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .init();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            output::print_error(&format!("{:#}", e));
            EXIT_SETUP
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let config = load_config(&cli)?;
    let report = execute(&cli, config).await?;

    report
        .write_json(&cli.output)
        .with_context(|| format!("writing report to {}", cli.output.display()))?;
    output::print_report(&report, cli.format);

    Ok(report.exit_code(cli.strict))
}

/// Read the config file, then apply flag overrides.
fn load_config(cli: &Cli) -> anyhow::Result<ProbeConfig> {
    let mut config = match &cli.config {
        Some(path) => ProbeConfig::load(path).with_context(|| format!("loading config {}", path.display()))?,
        None => ProbeConfig::default(),
    };

    if let Some(email) = &cli.email {
        config.account.identity = email.clone();
    }
    if let Some(password) = &cli.password {
        config.account.credential = Credential::new(password.clone());
    }
    if let Some(url) = &cli.webdriver_url {
        config.webdriver.url = url.clone();
    }
    if cli.headed {
        config.webdriver.headless = false;
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

async fn execute(cli: &Cli, config: ProbeConfig) -> anyhow::Result<RunReport> {
    let report = match cli.driver {
        DriverKind::Webdriver => {
            let session = WebDriverSession::connect(&config.webdriver)
                .await
                .with_context(|| format!("connecting to WebDriver at {}", config.webdriver.url))?;
            Orchestrator::new(config, session).run().await
        }
        DriverKind::Sim => {
            info!(delay_ms = cli.sim_delay_ms, "using simulated mail client");
            let mut options = SimOptions {
                delivery_delay: Duration::from_millis(cli.sim_delay_ms),
                deliver_as: config.expected_originator.clone(),
                credential: Some(config.account.credential.expose().to_string()),
                ..Default::default()
            };
            if !options.labels.contains(&config.label) {
                options.labels.push(config.label.clone());
            }
            let client = SimMailClient::new(options);
            let session = client.session(&config.selectors);
            Orchestrator::new(config, session).run().await
        }
    };
    Ok(report)
}
