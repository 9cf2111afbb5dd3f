//! CLI binary entry point for pipeline-cli

#[cfg(feature = "cli")]
use clap::{Parser, Subcommand};
#[cfg(feature = "cli")]
use degustation_pipeline::cli::commands::{
    config::{handle_config_sample, handle_config_show},
    dbt::{DbtArgs, handle_dbt},
    fetch::{FetchArgs, handle_fetch},
    jobs::{JobRunArgs, handle_job_list, handle_job_run},
    load::{LoadArgs, handle_load},
    load_config,
    profiles::handle_profiles,
    provision::{ProvisionArgs, handle_provision},
    tunnel::handle_tunnel_check,
};
#[cfg(feature = "cli")]
use degustation_pipeline::cli::{error::CliError, init_logging, install_signal_handler};
#[cfg(feature = "cli")]
use degustation_pipeline::config::{PipelineConfig, WriteMode};
#[cfg(feature = "cli")]
use degustation_pipeline::infra::DbtCommand;
#[cfg(feature = "cli")]
use std::path::PathBuf;

#[cfg(feature = "cli")]
#[derive(Parser)]
#[command(name = "pipeline-cli")]
#[command(about = "Provision, fetch, load and transform the degustations dataset")]
#[command(version)]
struct Cli {
    /// Repository root
    #[arg(long, global = true, default_value = ".")]
    repo: PathBuf,
    /// Configuration file (default: <repo>/pipeline.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[cfg(feature = "cli")]
#[derive(Subcommand)]
enum Commands {
    /// Provision the PostgreSQL server with Terraform
    Provision {
        /// Only write terraform.tfvars
        #[arg(long)]
        tfvars_only: bool,
    },
    /// Download the dataset export
    Fetch {
        /// Export URL
        #[arg(long)]
        url: Option<String>,
        /// Destination file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Load the CSV file into PostgreSQL
    Load {
        /// CSV file
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// Destination table
        #[arg(short, long)]
        table: Option<String>,
        /// Destination schema
        #[arg(short, long)]
        schema: Option<String>,
        /// Write mode
        #[arg(short, long, value_enum)]
        mode: Option<WriteModeArg>,
        /// Field delimiter
        #[arg(short, long)]
        delimiter: Option<char>,
    },
    /// Generate dbt profiles.yml
    Profiles,
    /// Run dbt
    Dbt {
        #[command(subcommand)]
        command: DbtCommands,
    },
    /// Bastion tunnel utilities
    Tunnel {
        #[command(subcommand)]
        command: TunnelCommands,
    },
    /// Run or list jobs
    Job {
        #[command(subcommand)]
        command: JobCommands,
    },
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[cfg(feature = "cli")]
#[derive(Subcommand)]
enum DbtCommands {
    /// dbt build
    Build {
        #[arg(short, long)]
        select: Option<String>,
    },
    /// dbt run
    Run {
        #[arg(short, long)]
        select: Option<String>,
    },
}

#[cfg(feature = "cli")]
#[derive(Subcommand)]
enum TunnelCommands {
    /// Open the tunnel, probe the local port, close it
    Check,
}

#[cfg(feature = "cli")]
#[derive(Subcommand)]
enum JobCommands {
    /// Run a job by name
    Run {
        name: String,
        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },
    /// List defined jobs
    List,
}

#[cfg(feature = "cli")]
#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Print a sample pipeline.toml
    Sample,
}

#[cfg(feature = "cli")]
#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum WriteModeArg {
    Replace,
    Append,
}

#[cfg(feature = "cli")]
impl From<WriteModeArg> for WriteMode {
    fn from(mode: WriteModeArg) -> Self {
        match mode {
            WriteModeArg::Replace => WriteMode::Replace,
            WriteModeArg::Append => WriteMode::Append,
        }
    }
}

#[cfg(feature = "cli")]
fn run(cli: Cli) -> Result<(), CliError> {
    // Commands that need no configuration
    match &cli.command {
        Commands::Config {
            command: ConfigCommands::Sample,
        } => return handle_config_sample(),
        Commands::Job {
            command: JobCommands::List,
        } => return handle_job_list(),
        _ => {}
    }

    let config: PipelineConfig = load_config(&cli.repo, cli.config.as_deref())?;

    match cli.command {
        Commands::Provision { tfvars_only } => {
            handle_provision(&ProvisionArgs { tfvars_only }, &config)
        }
        Commands::Fetch { url, output } => handle_fetch(&FetchArgs { url, output }, &config),
        Commands::Load {
            file,
            table,
            schema,
            mode,
            delimiter,
        } => {
            let args = LoadArgs {
                file,
                table,
                schema,
                mode: mode.map(Into::into),
                delimiter,
            };
            handle_load(&args, &config)
        }
        Commands::Profiles => handle_profiles(&config),
        Commands::Dbt { command } => {
            let args = match command {
                DbtCommands::Build { select } => DbtArgs {
                    command: DbtCommand::Build,
                    select,
                },
                DbtCommands::Run { select } => DbtArgs {
                    command: DbtCommand::Run,
                    select,
                },
            };
            handle_dbt(&args, &config)
        }
        Commands::Tunnel {
            command: TunnelCommands::Check,
        } => handle_tunnel_check(&config),
        Commands::Job { command } => match command {
            JobCommands::Run { name, json } => handle_job_run(&JobRunArgs { name, json }, &config),
            JobCommands::List => handle_job_list(),
        },
        Commands::Config { command } => match command {
            ConfigCommands::Show => handle_config_show(&config),
            ConfigCommands::Sample => handle_config_sample(),
        },
    }
}

#[cfg(feature = "cli")]
fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_logging(cli.verbose);
    if let Err(e) = install_signal_handler() {
        tracing::warn!("{}", e);
    }

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

#[cfg(not(feature = "cli"))]
fn main() {
    eprintln!("CLI feature is not enabled. Build with --features cli");
    std::process::exit(1);
}
