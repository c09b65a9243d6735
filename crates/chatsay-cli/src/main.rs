//! chatsay - replay chat pages through the screen-reader engine.

use anyhow::Result;
use chatsay_cli::{config, logging, scenario};
use chatsay_core::default_profile;
use chatsay_types::{Announcement, Site};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;

use config::Config;
use logging::{LogConfig, LogFormat};
use scenario::{ReplayOptions, Scenario};

#[derive(Parser, Debug)]
#[command(name = "chatsay")]
#[command(about = "Screen-reader announcements for streaming chat pages")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to config file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (INFO level for all targets)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Enable trace logging (TRACE level for everything)
    #[arg(long, global = true)]
    trace: bool,

    /// Quiet mode (WARN and ERROR only)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Set log level for specific targets (e.g., "tracker=debug").
    /// Can be specified multiple times. Targets are prefixed with "chatsay::" automatically.
    #[arg(long = "log", value_name = "TARGET=LEVEL", global = true)]
    log_overrides: Vec<String>,

    /// Log output format
    #[arg(long = "log-format", value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay a scenario file and print what would be spoken
    Replay {
        /// Scenario TOML file
        scenario: PathBuf,

        /// Site adapter to use (overrides the scenario's own)
        #[arg(long)]
        site: Option<Site>,

        /// Run on a paused clock so waits complete instantly
        #[arg(long)]
        fast: bool,

        /// Print the report as JSON instead of one line per announcement
        #[arg(long)]
        json: bool,
    },
    /// Print the built-in site profiles as TOML
    Sites,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = LogConfig::from_cli(
        cli.verbose,
        cli.debug,
        cli.trace,
        cli.quiet,
        cli.log_overrides,
        cli.log_format,
    );
    logging::init(&log_config);

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Command::Replay {
            scenario,
            site,
            fast,
            json,
        } => {
            let scenario = Scenario::load(&scenario)?;
            let runtime = if fast {
                tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .start_paused(true)
                    .build()?
            } else {
                tokio::runtime::Builder::new_multi_thread().enable_all().build()?
            };
            runtime.block_on(run_replay(scenario, site, config, json))
        }
        Command::Sites => {
            let sites: BTreeMap<String, _> = Site::ALL
                .into_iter()
                .map(|site| (site.to_string(), default_profile(site)))
                .collect();
            let defaults = Config {
                sites,
                ..Config::default()
            };
            print!("{}", toml::to_string_pretty(&defaults)?);
            Ok(())
        }
    }
}

async fn run_replay(scenario: Scenario, site: Option<Site>, config: Config, json: bool) -> Result<()> {
    let site = site.or(scenario.site);
    tracing::info!(
        target: "chatsay::startup",
        "Loaded configuration (policy: {:?}, site: {})",
        config.observer.policy,
        site.map_or_else(|| "unset".to_string(), |s| s.to_string())
    );

    let options = ReplayOptions {
        site,
        profile: site.and_then(|s| config.profile_for(s)),
        observer: config.observer,
        messages: config.messages,
    };

    let report = scenario::replay(&scenario, options, |announcement| {
        if !json {
            println!("{}", render(announcement));
        }
    })
    .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        tracing::info!(
            target: "chatsay::replay",
            "Finished in state {} with {} responses tracked",
            report.final_state,
            report.responses.len()
        );
    }
    Ok(())
}

fn render(announcement: &Announcement) -> String {
    if announcement.is_primary() {
        announcement.text.clone()
    } else {
        format!("({})", announcement.text)
    }
}
