//! CLI Entry Point for zptess
//!
//! Provides command-line interface for:
//! - Calibrating a test photometer against the reference (`calibrate`)
//! - Watching readings and statistics of one or both photometers (`read`)
//! - Checking that the test photometer answers (`dry-run`)
//! - Storing a zero point by hand (`write-zp`)
//!
//! # Usage
//!
//! ```bash
//! zptess calibrate --author "Jane Doe" --update
//! zptess read --role both --test-endpoint udp:192.168.4.1:2255
//! zptess write-zp 20.50
//! ```
//!
//! Values given on the command line override `config/zptess.toml` and the
//! `ZPTESS_` environment variables.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;
use zptess::config::{ZptessConfig, DEFAULT_CONFIG_PATH};
use zptess::core::{CentralMethod, Model, Role};
use zptess::logging::{self, LoggingConfig};
use zptess::session::{RoleSelection, RunMode, Session, SessionOutcome};

#[derive(Parser)]
#[command(name = "zptess")]
#[command(about = "TESS photometer zero point calibration", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Log format: pretty, compact or json
    #[arg(long, global = true)]
    log_format: Option<String>,

    /// Log raw protocol messages
    #[arg(short, long, global = true)]
    messages: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Calibrate the test photometer against the reference
    Calibrate {
        #[command(flatten)]
        devices: DeviceArgs,

        #[command(flatten)]
        stats: StatsArgs,

        /// Person running the calibration
        #[arg(short, long)]
        author: Option<String>,

        /// Offset added to the best zero point
        #[arg(short, long, allow_negative_numbers = true)]
        offset: Option<f64>,

        /// Write the final zero point to the test photometer
        #[arg(short, long)]
        update: bool,

        /// Number of rounds
        #[arg(short = 'R', long)]
        rounds: Option<u32>,
    },

    /// Show readings and statistics without calibrating
    Read {
        /// Photometers to read
        #[arg(long, value_enum, default_value = "test")]
        role: ReadRole,

        #[command(flatten)]
        devices: DeviceArgs,

        #[command(flatten)]
        stats: StatsArgs,
    },

    /// Connect to the test photometer, show its info and exit
    DryRun {
        #[command(flatten)]
        devices: DeviceArgs,
    },

    /// Write a zero point to the test photometer and verify it
    WriteZp {
        /// Zero point to store
        zero_point: f64,

        #[command(flatten)]
        devices: DeviceArgs,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ReadRole {
    Ref,
    Test,
    Both,
}

impl From<ReadRole> for RoleSelection {
    fn from(value: ReadRole) -> Self {
        match value {
            ReadRole::Ref => RoleSelection::Reference,
            ReadRole::Test => RoleSelection::Test,
            ReadRole::Both => RoleSelection::Both,
        }
    }
}

#[derive(Args)]
struct DeviceArgs {
    /// Reference endpoint, e.g. serial:/dev/ttyUSB0:9600
    #[arg(long)]
    ref_endpoint: Option<String>,

    /// Test endpoint, e.g. udp:192.168.4.1:2255
    #[arg(long)]
    test_endpoint: Option<String>,

    /// Reference model (TESS-W, TESS-P, TAS)
    #[arg(long)]
    ref_model: Option<Model>,

    /// Test model (TESS-W, TESS-P, TAS)
    #[arg(long)]
    test_model: Option<Model>,

    /// Reference speaks the legacy fixed-field protocol
    #[arg(long)]
    ref_old_proto: bool,

    /// Test speaks the legacy fixed-field protocol
    #[arg(long)]
    test_old_proto: bool,
}

impl DeviceArgs {
    fn apply(&self, config: &mut ZptessConfig) {
        let overrides = [
            (Role::Reference, &self.ref_endpoint, self.ref_model, self.ref_old_proto),
            (Role::Test, &self.test_endpoint, self.test_model, self.test_old_proto),
        ];
        for (role, endpoint, model, old_protocol) in overrides {
            let phot = config.photometer_mut(role);
            if let Some(endpoint) = endpoint {
                phot.endpoint = endpoint.clone();
            }
            if let Some(model) = model {
                phot.model = model;
            }
            if old_protocol {
                phot.old_protocol = true;
            }
        }
    }
}

#[derive(Args)]
struct StatsArgs {
    /// Samples per statistics window
    #[arg(short = 'N', long)]
    samples: Option<usize>,

    /// Central estimator (mean, median, mode)
    #[arg(short = 'C', long)]
    central: Option<CentralMethod>,

    /// Seconds between statistics
    #[arg(short = 'T', long)]
    period: Option<f64>,
}

impl StatsArgs {
    fn apply(&self, config: &mut ZptessConfig) -> Result<()> {
        if let Some(samples) = self.samples {
            config.stats.samples = samples;
        }
        if let Some(central) = self.central {
            config.stats.central = central;
        }
        if let Some(period) = self.period {
            config.stats.period = Duration::try_from_secs_f64(period)
                .with_context(|| format!("Invalid period {}", period))?;
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ZptessConfig::load_from(&cli.config)
        .with_context(|| format!("Loading {}", cli.config.display()))?;
    let mode = apply_command(&cli.command, &mut config)?;
    config.validate()?;

    let mut logging_config = LoggingConfig::from_config(&config).map_err(anyhow::Error::msg)?;
    if cli.quiet {
        logging_config.level = Level::WARN;
    } else if cli.verbose > 0 {
        logging_config.level = if cli.verbose > 1 { Level::TRACE } else { Level::DEBUG };
    }
    if let Some(format) = &cli.log_format {
        logging_config.format = logging::parse_output_format(format).map_err(anyhow::Error::msg)?;
    }
    logging::init(logging_config.with_protocol_messages(cli.messages)).map_err(anyhow::Error::msg)?;

    let session = Session::new(config);
    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };
    let outcome = session.run(mode, shutdown).await?;
    report(&outcome);
    std::process::exit(outcome.exit_code());
}

fn apply_command(command: &Commands, config: &mut ZptessConfig) -> Result<RunMode> {
    let mode = match command {
        Commands::Calibrate {
            devices,
            stats,
            author,
            offset,
            update,
            rounds,
        } => {
            devices.apply(config);
            stats.apply(config)?;
            if let Some(author) = author {
                config.calibration.author = author.clone();
            }
            if let Some(offset) = offset {
                config.calibration.offset = *offset;
            }
            if *update {
                config.calibration.update = true;
            }
            if let Some(rounds) = rounds {
                config.calibration.rounds = *rounds;
            }
            RunMode::Calibrate
        }
        Commands::Read {
            role,
            devices,
            stats,
        } => {
            devices.apply(config);
            stats.apply(config)?;
            RunMode::Read((*role).into())
        }
        Commands::DryRun { devices } => {
            devices.apply(config);
            RunMode::DryRun
        }
        Commands::WriteZp {
            zero_point,
            devices,
        } => {
            devices.apply(config);
            RunMode::WriteZeroPoint(*zero_point)
        }
    };
    Ok(mode)
}

fn report(outcome: &SessionOutcome) {
    match outcome {
        SessionOutcome::Completed {
            summaries,
            written,
        } => {
            if let Some((reference, test)) = summaries {
                println!(
                    "{} {:.2} -> {:.2} (ref. {} mag {:.2}, test mag {:.2}, diff {:.2})",
                    test.session,
                    test.previous_zero_point,
                    test.final_zero_point,
                    reference.final_zero_point,
                    reference.magnitude,
                    test.magnitude,
                    test.magnitude_offset
                );
            }
            if let Some(written) = written {
                match serde_json::to_string(written) {
                    Ok(json) => println!("{}", json),
                    Err(_) => println!("{:?}", written),
                }
            }
        }
        SessionOutcome::Offline(role) => eprintln!("{} photometer is offline", role),
        SessionOutcome::Interrupted => eprintln!("Interrupted"),
    }
}
