use std::io::{self, BufRead, IsTerminal, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use aws_types::region::Region;
use clap::Parser;
use tracing::{error, info};

pub mod config;
pub mod orchestrator;
pub mod parameters;
pub mod report;
pub mod signal;
pub mod stack;
pub mod template;

use orchestrator::{Options, Orchestrator, RunSummary};
use stack::{CloudFormation, Deployer, WaitConfig};
use template::{LocalTemplateStore, S3TemplateStore, TemplateStore};

const EXIT_DEPLOY_FAILED: u8 = 1;
const EXIT_CONFIG_ERROR: u8 = 2;
const EXIT_CANCELLED: u8 = 130;

/// Deploy the Artemis storage stacks (S3 data bucket and Elasticsearch) for one environment.
#[derive(Parser, Debug)]
#[command(name = "artemis-storage-deployer", version)]
struct Cli {
    /// Environment to deploy (e.g. "dev", "qa"); prompted for when omitted
    #[arg(env = "ARTEMIS_ENVIRONMENT")]
    environment: Option<String>,

    /// Settings file with one block per environment
    #[arg(short, long, env = "ARTEMIS_CONFIG", default_value = "artemis-storage-config.yaml")]
    config: PathBuf,

    /// Number of block iterations, overriding BlockInstanceCount
    #[arg(short, long)]
    block_count: Option<u32>,

    /// Read templates from this directory instead of the ops bucket
    #[arg(long)]
    template_dir: Option<PathBuf>,

    /// Seconds between stack status polls
    #[arg(long, default_value = "30")]
    poll_interval: u64,

    /// Seconds to wait for a stack to settle
    #[arg(long, default_value = "3600")]
    wait_timeout: u64,

    /// Keep deploying the remaining resources after a failure
    #[arg(long)]
    keep_going: bool,

    /// Write a JSON summary of the run to this file
    #[arg(long)]
    report: Option<PathBuf>,

    /// Log debug output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .with_target(false)
        .init();

    let environment = match resolve_environment(cli.environment.clone()) {
        Ok(environment) => environment,
        Err(err) => {
            error!("No environment selected: {}", err);
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    let profile = match config::parse(&cli.config) {
        Ok(profile) => profile,
        Err(err) => {
            error!("{}", err);
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };
    let (environment, environment_config) = match profile.lookup(&environment) {
        Ok(found) => found,
        Err(err) => {
            let known: Vec<&str> = profile.environment_names().collect();
            error!("{} (known: {})", err, known.join(", "));
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    info!(
        "Deploying environment {} in {}",
        environment, environment_config.region
    );

    // Credentials come from the default provider chain only.
    let sdk_config = aws_config::from_env()
        .region(Region::new(environment_config.region.clone()))
        .load()
        .await;
    let stacks = CloudFormation::new(&sdk_config);
    let templates: Box<dyn TemplateStore> = match &cli.template_dir {
        Some(root) => Box::new(LocalTemplateStore::new(root)),
        None => Box::new(S3TemplateStore::new(&sdk_config)),
    };

    let wait = WaitConfig {
        poll_interval: Duration::from_secs(cli.poll_interval),
        timeout: Duration::from_secs(cli.wait_timeout),
    };
    let deployer = Deployer::new(&stacks, wait, signal::cancel_on_signal());
    let options = Options {
        block_count: cli.block_count,
        keep_going: cli.keep_going,
    };

    let summary = Orchestrator::new(deployer, templates.as_ref(), options)
        .run(environment, environment_config)
        .await;

    let mut report_written = true;
    if let Some(path) = &cli.report {
        match report::write(path, &summary) {
            Ok(()) => info!("Report written to {}", path.display()),
            Err(err) => {
                error!("{}", err);
                report_written = false;
            }
        }
    }

    return ExitCode::from(exit_status(&summary, report_written));
}

/// Cancellation wins over failures; an unwritten report counts as a failure.
fn exit_status(summary: &RunSummary, report_written: bool) -> u8 {
    if summary.cancelled {
        return EXIT_CANCELLED;
    }
    if summary.failed() || !report_written {
        return EXIT_DEPLOY_FAILED;
    }

    return 0;
}

fn resolve_environment(argument: Option<String>) -> Result<String, io::Error> {
    if let Some(environment) = argument {
        return Ok(environment);
    }

    let stdin = io::stdin();
    if !stdin.is_terminal() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "pass the environment as an argument",
        ));
    }

    print!("Enter env (dev, qa) :");
    io::stdout().flush()?;

    let mut line = String::new();
    stdin.lock().read_line(&mut line)?;
    let environment = line.trim();
    if environment.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty environment"));
    }

    return Ok(environment.to_string());
}
