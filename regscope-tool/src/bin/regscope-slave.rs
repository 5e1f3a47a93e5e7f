use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::TimestampPrecision;
use log::info;
use tokio::sync::Mutex;

use regscope_lib::port;
use regscope_lib::project::Project;
use regscope_lib::protocol::slave::{self, RegisterBank};
use regscope_lib::session::{ConnectionSettings, Parity};

/// Answers Modbus RTU requests from an in-memory register bank
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Skip sanity checks
    #[clap(long, short)]
    force: bool,

    /// UART device or 'auto'
    #[clap(long, short, default_value = "auto")]
    port: String,

    /// UART baud rate
    #[clap(long, short, default_value_t = 9600)]
    baudrate: u32,

    /// Parity: N, E or O
    #[clap(long, default_value = "N")]
    parity: Parity,

    /// Stop bits
    #[clap(long, default_value_t = 1)]
    stop_bits: u8,

    /// Unit id to answer for
    #[clap(long, short, default_value_t = 1)]
    unit: u8,

    /// Zero-filled holding registers starting at address 0
    #[clap(long, default_value_t = 256)]
    fill: u16,

    /// Also back every register of this project
    #[clap(long, short = 'P')]
    project: Option<PathBuf>,
}

fn make_bank(args: &Args) -> Result<RegisterBank> {
    let mut bank = RegisterBank::new(args.unit);
    bank.set(0, &vec![0; args.fill as usize]);

    if let Some(path) = &args.project {
        let project = Project::load(path).with_context(|| format!("Failed to load {:?}", path))?;
        for register in project.register_map()?.iter() {
            bank.set(register.address(), &vec![0; register.count() as usize]);
        }
    }
    Ok(bank)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(Some(TimestampPrecision::Millis))
        .format_target(false)
        .init();

    let args = Args::parse();
    let bank = Arc::new(Mutex::new(make_bank(&args)?));

    let settings = ConnectionSettings {
        port: args.port.clone(),
        slave_id: args.unit,
        baud_rate: args.baudrate,
        parity: args.parity,
        stop_bits: args.stop_bits,
        ..Default::default()
    };
    let port = port::open_port_async(&settings, args.force)?;
    info!("serving unit {} on {}", args.unit, settings.port);

    let stats = slave::serve(port, bank).await?;
    info!(
        "{} requests served, {} bytes discarded",
        stats.served, stats.discarded
    );
    Ok(())
}
