mod config;
mod console;
mod controller;
mod db;
mod ea15;
mod error;
mod models;
mod pid;
mod protocol;
mod psu;
mod reader;
mod serial;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config::{PidConfig, expand_tilde};
use console::OperatorCommand;
use controller::TecController;
use db::Database;
use ea15::Ea15;
use models::DatalogSession;
use psu::{Dp832, ScpiSocket};
use reader::ReaderHandle;

const CONTROL_TICK: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "tec-controller")]
#[command(about = "Stabilize a TEC using an Extech EA15 and a Rigol DP832")]
struct Args {
    /// Serial device of the EA15 (skips discovery)
    #[arg(short, long)]
    device: Option<PathBuf>,

    /// Substring identifying the EA15 under /dev/serial/by-id/
    #[arg(long, default_value = serial::DEFAULT_DEVICE_ID)]
    device_id: String,

    /// PID configuration file
    #[arg(short, long, default_value = "config.txt")]
    config: String,

    /// Power supply SCPI address
    #[arg(long, default_value = "192.168.1.144:5555")]
    psu: String,

    /// Output current bound in amps
    #[arg(long, default_value_t = 6.0)]
    max_current: f64,

    /// Output readings and control steps as JSON lines on stdout
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the temperature control loop (default)
    Control,

    /// Print live readings
    Monitor {
        /// Also download the datalog once
        #[arg(long)]
        datalog: bool,
    },

    /// Download the meter's datalog and store it
    Datalog {
        /// Database file path
        #[arg(long, default_value = "~/ea15.db")]
        database: String,
    },

    /// Export stored datalog readings as CSV and exit
    Export {
        /// Database file path
        #[arg(long, default_value = "~/ea15.db")]
        database: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let args = Args::parse();

    match &args.command {
        Some(Command::Export { database }) => export(database),
        Some(Command::Monitor { datalog }) => monitor(&args, *datalog).await,
        Some(Command::Datalog { database }) => download(&args, database).await,
        Some(Command::Control) | None => control(&args).await,
    }
}

fn start_reader(args: &Args) -> Result<ReaderHandle> {
    let path = serial::resolve_device(args.device.as_deref(), &args.device_id)?;
    info!("using device: {}", path.display());
    let port = serial::open(&path).with_context(|| format!("opening {}", path.display()))?;
    Ok(reader::spawn(Ea15::new(port)))
}

fn print_batch(sessions: &[DatalogSession], json: bool) -> Result<()> {
    if sessions.is_empty() {
        info!("datalog is empty");
        return Ok(());
    }
    for (j, session) in sessions.iter().enumerate() {
        if json {
            println!("{}", serde_json::to_string(session)?);
            continue;
        }
        println!(
            "Datalog set {} with {} records, interval code {}",
            j + 1,
            session.readings.len(),
            session.interval
        );
        for (i, r) in session.readings.iter().enumerate() {
            println!("{:02} : {:04} : {}", j + 1, i + 1, r);
        }
    }
    Ok(())
}

fn export(database: &str) -> Result<()> {
    let db = Database::open(expand_tilde(database))?;
    let mut stdout = std::io::stdout();
    let count = db.export_csv(&mut stdout)?;
    info!("exported {} readings", count);
    Ok(())
}

async fn monitor(args: &Args, datalog: bool) -> Result<()> {
    let mut reader = start_reader(args)?;
    if datalog {
        reader.request_datalog();
    }

    loop {
        tokio::select! {
            reading = reader.readings.recv() => {
                let Some(reading) = reading else { break };
                if args.json {
                    println!("{}", serde_json::to_string(&reading)?);
                } else {
                    println!("{}", reading);
                }
            }
            batch = reader.batches.recv() => {
                let Some(batch) = batch else { break };
                print_batch(&batch, args.json)?;
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

async fn download(args: &Args, database: &str) -> Result<()> {
    let mut reader = start_reader(args)?;
    let mut db = Database::open(expand_tilde(database))?;

    info!("requesting datalog download");
    reader.request_datalog();

    let batch = tokio::select! {
        batch = reader.batches.recv() => batch.context("reader stopped before the datalog arrived")?,
        _ = tokio::signal::ctrl_c() => return Ok(()),
    };

    print_batch(&batch, args.json)?;
    if batch.is_empty() {
        return Ok(());
    }
    let count = db.insert_batch(&batch)?;
    info!("saved {} readings in {} sessions to {}", count, batch.len(), database);
    Ok(())
}

async fn control(args: &Args) -> Result<()> {
    let config_path = expand_tilde(&args.config);
    let config = PidConfig::load(&config_path)?;
    info!(
        "target {:.2}C kp {} ki {} kd {}",
        config.target, config.kp, config.ki, config.kd
    );

    let mut reader = start_reader(args)?;

    let socket = ScpiSocket::connect(&args.psu)
        .await
        .with_context(|| format!("connecting to power supply at {}", args.psu))?;
    let mut supply = Dp832::connect(socket).await?;
    supply.setup().await?;

    let mut tec = TecController::new(supply, config, config_path, args.max_current);
    let result = run_loop(&mut tec, &mut reader, args.json).await;

    info!("shutting down power supply");
    if let Err(e) = tec.shutdown().await {
        error!("power supply shutdown failed: {}", e);
    }
    result
}

async fn run_loop(
    tec: &mut TecController<ScpiSocket>,
    reader: &mut ReaderHandle,
    json: bool,
) -> Result<()> {
    let mut ticker = tokio::time::interval(CONTROL_TICK);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut console_open = true;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Some(record) = tec.tick(reader.latest_reading()?).await? {
                    if json {
                        println!("{}", serde_json::to_string(&record)?);
                    } else {
                        info!("{}", record.summary());
                    }
                }
                while let Ok(batch) = reader.batches.try_recv() {
                    print_batch(&batch, json)?;
                }
            }
            line = lines.next_line(), if console_open => {
                let Some(line) = line? else {
                    console_open = false;
                    continue;
                };
                match OperatorCommand::parse(&line) {
                    Ok(OperatorCommand::SetPid(config)) => tec.update_config(config)?,
                    Ok(OperatorCommand::ResetIntegral) => tec.reset_integral(),
                    Ok(OperatorCommand::Datalog) => reader.request_datalog(),
                    Ok(OperatorCommand::Quit) => break,
                    Err(e) => warn!("{}", e),
                }
            }
            _ = &mut ctrl_c => break,
        }
    }
    Ok(())
}
