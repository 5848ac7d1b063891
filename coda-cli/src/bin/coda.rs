use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use coda_cli::{connect, Action, Launcher, Outcome};
use coda_core::{CodaConfig, ConnectionSpec};
use std::io::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about = "Talk to a CODA debug agent", long_about = None)]
struct Cli {
    /// Device address: host[:port] for TCP (port defaults to 1534) or a serial port path
    #[arg(short, long, default_value = "127.0.0.1")]
    connection: String,

    /// Timeout in milliseconds (overrides the config file)
    #[arg(short, long)]
    timeout: Option<u64>,

    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check that the agent answers
    Ping,
    /// Start a program on the device
    Launch {
        /// Executable path on the device
        binary: String,
        /// Application UID (hex, e.g. 0xE1234567)
        #[arg(short, long, default_value = "0")]
        uid: String,
        /// Run under debug control until the program exits
        #[arg(short, long)]
        debug: bool,
        /// Program arguments
        #[arg(last = true)]
        arguments: Vec<String>,
    },
    /// Install a package already on the device
    Install {
        /// Package path on the device
        file: String,
        /// Silent install
        #[arg(short, long)]
        silent: bool,
        /// Target drive for silent installs
        #[arg(long, default_value_t = 'C')]
        drive: char,
    },
    /// Remove an installed package
    Uninstall {
        /// Package UID (hex)
        uid: String,
    },
    /// Copy a local file to the device
    Put {
        local: PathBuf,
        remote: String,
        /// Bytes per write (overrides the config file)
        #[arg(short, long)]
        chunk_size: Option<usize>,
    },
    /// Show size and times of a file on the device
    Stat { remote: String },
}

fn parse_uid(s: &str) -> Result<u32> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(digits, 16).with_context(|| format!("Invalid UID '{s}'"))
}

fn load_config(cli: &Cli) -> Result<CodaConfig> {
    let mut config = match &cli.config {
        Some(path) => CodaConfig::from_file(path)?,
        None => CodaConfig::default(),
    };
    if let Some(timeout) = cli.timeout {
        config.launcher.timeout_ms = timeout;
    }
    if let Commands::Put { chunk_size: Some(size), .. } = cli.command {
        config.launcher.put_chunk_size = size;
    }
    config.validate()?;
    Ok(config)
}

fn action(command: Commands, config: &CodaConfig) -> Result<Action> {
    Ok(match command {
        Commands::Ping => Action::Ping,
        Commands::Launch { binary, uid, debug, arguments } => {
            Action::Launch { binary, uid: parse_uid(&uid)?, arguments, debug }
        }
        Commands::Install { file, silent, drive } => Action::Install { file, silent, drive },
        Commands::Uninstall { uid } => Action::Uninstall { uid: parse_uid(&uid)? },
        Commands::Put { local, remote, .. } => {
            Action::Put { local, remote, chunk_size: config.launcher.put_chunk_size }
        }
        Commands::Stat { remote } => Action::Stat { remote },
    })
}

fn run(cli: Cli) -> Result<Outcome> {
    let config = load_config(&cli)?;
    let spec: ConnectionSpec = cli.connection.parse()?;
    let action = action(cli.command, &config)?;
    // A debug launch lasts as long as the program runs.
    let timeout = match action {
        Action::Launch { debug: true, .. } => None,
        _ => Some(config.launcher.timeout()),
    };

    let device = connect(&spec, &config)?;
    let mut launcher = Launcher::new(action, device)?.with_output(|text| {
        print!("{text}");
        let _ = std::io::stdout().flush();
    });
    launcher.run(timeout)
}

fn report(outcome: &Outcome) {
    match outcome {
        Outcome::Pong(version) => println!("Pong: {version}"),
        Outcome::Hello(services) => println!("Agent services: {}", services.join(", ")),
        Outcome::Launched { process_id } => println!("Started {process_id}"),
        Outcome::Exited { process_id, exit_code } => println!("{process_id} exited with code {exit_code}"),
        Outcome::Installed => println!("Installed."),
        Outcome::Uninstalled => println!("Uninstalled."),
        Outcome::Written { bytes } => println!("Wrote {bytes} bytes."),
        Outcome::Stat(stat) => println!(
            "Size: {} bytes, accessed: {}, modified: {}",
            stat.size, stat.access_time, stat.modification_time
        ),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match run(cli) {
        Ok(outcome) => {
            report(&outcome);
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("{:#}", e);
            // Exit status -1 as seen by the shell.
            ExitCode::from(255)
        }
    }
}
