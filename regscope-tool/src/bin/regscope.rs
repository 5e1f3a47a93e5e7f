pub mod cli;

use std::fmt::Display;
use std::io;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::CommandFactory;
use clap_complete::{generate, shells::Bash};
use log::{error, info, warn};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;

use regscope_lib::bits::BitDefinition;
use regscope_lib::codec;
use regscope_lib::poll::{PollConfig, PollScheduler};
use regscope_lib::port;
use regscope_lib::project::Project;
use regscope_lib::regs::{RegisterDefinition, RegisterMap};
use regscope_lib::sample::Sample;
use regscope_lib::session::Session;
use regscope_lib::variables::{VariableSet, VariableValue};
use regscope_lib::write::{WriteCoordinator, WriteRequest};

use cli::{Cli, RegisterSpec, StructOpt, WordSpec};

enum OutputFormat {
    Plain,
    Json,
}

fn slice_to_line<T>(data: &[T]) -> String
where
    T: Display,
{
    data.iter()
        .map(|x| x.to_string())
        .collect::<Vec<String>>()
        .join(" ")
}

fn slice_to_column<T>(data: &[T]) -> String
where
    T: Display,
{
    data.iter()
        .map(|x| x.to_string())
        .collect::<Vec<String>>()
        .join("\n")
}

fn ad_hoc_map(specs: &[RegisterSpec]) -> Result<RegisterMap> {
    RegisterMap::from_definitions(specs.iter().map(RegisterDefinition::from).collect())
        .context("Invalid register list")
}

fn project_map(project: Option<&Project>) -> Result<RegisterMap> {
    match project {
        Some(project) => Ok(project.register_map()?),
        None => Ok(RegisterMap::new()),
    }
}

fn cmd_list_ports(fmt: OutputFormat) -> Result<String> {
    let ports = port::list_ports()?;
    Ok(match fmt {
        OutputFormat::Plain => slice_to_column(
            ports
                .iter()
                .map(|p| format!("{:<16} {}", p.name, p.description))
                .collect::<Vec<_>>()
                .as_slice(),
        ),
        OutputFormat::Json => serde_json::to_string(&ports)?,
    })
}

async fn cmd_scan(session: &Session, units: &[u8], address: u16, fmt: OutputFormat) -> Result<String> {
    let limit = session.settings().timeout_duration();
    let found = session
        .link()
        .lock()
        .await
        .scan(units, address, limit)
        .await
        .context("Scan aborted")?;

    Ok(match fmt {
        OutputFormat::Plain => slice_to_column(&found),
        OutputFormat::Json => serde_json::to_string(&found)?,
    })
}

async fn cmd_read(session: &Session, fmt: OutputFormat) -> Result<String> {
    let registers = session.registers();
    let link = session.link();
    let mut lines = Vec::new();
    let mut values = Vec::new();

    for register in registers.iter() {
        let words = link
            .lock()
            .await
            .read_registers(session.unit(), register.address(), register.count())
            .await
            .with_context(|| format!("Failed to read register {}", register.address()))?;
        let value = register.scale(&words)?;

        lines.push(format!("{:5} {}", register.address(), register.render(value)));
        values.push(json!({
            "address": register.address(),
            "raw": words,
            "value": value,
        }));
    }

    Ok(match fmt {
        OutputFormat::Plain => lines.join("\n"),
        OutputFormat::Json => serde_json::to_string(&values)?,
    })
}

async fn cmd_read_words(
    session: &Session,
    address: u16,
    count: u16,
    input: bool,
    fmt: OutputFormat,
) -> Result<String> {
    let unit = session.unit();
    let link = session.link();
    let mut proto = link.lock().await;
    let words = if input {
        proto.read_input_registers(unit, address, count).await
    } else {
        proto.read_registers(unit, address, count).await
    }
    .with_context(|| format!("Failed to read {} word(s) at {}", count, address))?;

    Ok(match fmt {
        OutputFormat::Plain => slice_to_line(
            words
                .iter()
                .map(|w| format!("{:04X}", w))
                .collect::<Vec<_>>()
                .as_slice(),
        ),
        OutputFormat::Json => serde_json::to_string(&words)?,
    })
}

async fn cmd_write(session: &Session, spec: &RegisterSpec, value: f64) -> Result<String> {
    let words = codec::encode(value, spec.data_type, spec.byte_order)?;
    WriteCoordinator::new(session)
        .write_raw(spec.address, &words)
        .await
        .with_context(|| format!("Failed to write register {}", spec.address))?;
    Ok(String::default())
}

async fn cmd_write_words(session: &Session, specs: &[WordSpec]) -> Result<String> {
    let writer = WriteCoordinator::new(session);
    for spec in specs {
        writer
            .write_raw(spec.address, &spec.words)
            .await
            .with_context(|| format!("Failed to write {} word(s) at {}", spec.words.len(), spec.address))?;
    }
    Ok(String::default())
}

fn find_register(registers: &RegisterMap, name: &str) -> Result<usize> {
    if let Ok(index) = name.parse::<usize>() {
        if index < registers.len() {
            return Ok(index);
        }
    }
    registers
        .iter()
        .position(|r| r.definition().label == name)
        .ok_or_else(|| anyhow!("No register {} in project", name))
}

async fn cmd_set(session: &Session, name: &str, value: f64, raw: bool, fmt: OutputFormat) -> Result<String> {
    let index = find_register(&session.registers(), name)?;
    let request = if raw {
        WriteRequest::raw(index, value)
    } else {
        WriteRequest::engineering(index, value)
    };

    let ack = WriteCoordinator::new(session)
        .submit(request)
        .await
        .context("Write task vanished")??;

    if ack.readback.is_some() && !ack.verified {
        warn!("register {} did not keep the written value", ack.address);
    }

    Ok(match fmt {
        OutputFormat::Plain => slice_to_line(
            ack.words
                .iter()
                .map(|w| format!("{:04X}", w))
                .collect::<Vec<_>>()
                .as_slice(),
        ),
        OutputFormat::Json => serde_json::to_string(&ack)?,
    })
}

fn format_sample(session: &Session, sample: &Sample, fmt: &OutputFormat) -> Result<String> {
    Ok(match fmt {
        OutputFormat::Json => serde_json::to_string(sample)?,
        OutputFormat::Plain => {
            let time = sample.timestamp.format("%H:%M:%S%.3f");
            match (session.registers().get(sample.index), sample.value) {
                (Some(register), Some(value)) if sample.is_ok() => format!(
                    "{} {:5} {:<16} {}",
                    time,
                    sample.address,
                    sample.label,
                    register.render(value)
                ),
                _ => format!("{} {}", time, sample),
            }
        }
    })
}

fn format_variable(variables: &VariableSet, value: &VariableValue, fmt: &OutputFormat) -> Result<String> {
    Ok(match fmt {
        OutputFormat::Json => serde_json::to_string(value)?,
        OutputFormat::Plain => {
            let time = value.timestamp.format("%H:%M:%S%.3f");
            let rendered = variables
                .get(&value.name)
                .map(|d| d.format.render(value.value))
                .unwrap_or_else(|| "---".to_string());
            match &value.error {
                Some(error) => format!("{}       {:<16} {} <{}>", time, value.name, rendered, error),
                None => format!("{}       {:<16} {}", time, value.name, rendered),
            }
        }
    })
}

async fn cmd_poll(
    session: &Session,
    mut config: PollConfig,
    variables: VariableSet,
    count: Option<u64>,
    fmt: OutputFormat,
) -> Result<String> {
    config.backoff_base = config.backoff_base.max(Duration::from_millis(1));
    let mut scheduler = PollScheduler::new(config);
    scheduler.set_variables(variables.clone());
    let mut rx = scheduler.subscribe();
    let mut values = scheduler.subscribe_variables();
    let mut status = scheduler.watch();
    scheduler.start(session)?;

    let mut done = false;
    while !done {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            received = rx.recv() => match received {
                Ok(sample) => println!("{}", format_sample(session, &sample, &fmt)?),
                Err(RecvError::Lagged(missed)) => warn!("output fell behind, {} samples dropped", missed),
                Err(RecvError::Closed) => break,
            },
            received = values.recv() => match received {
                Ok(value) => println!("{}", format_variable(&variables, &value, &fmt)?),
                Err(RecvError::Lagged(missed)) => warn!("output fell behind, {} values dropped", missed),
                Err(RecvError::Closed) => break,
            },
            changed = status.changed(), if count.is_some() => {
                if changed.is_err() {
                    break;
                }
                let cycles = status.borrow().stats.cycles;
                done = count.map_or(false, |count| cycles >= count);
            }
        }
    }

    // a cycle is published before it is counted, so its output is queued
    if let Some(count) = count.filter(|_| done) {
        while let Ok(sample) = rx.try_recv() {
            if sample.cycle <= count {
                println!("{}", format_sample(session, &sample, &fmt)?);
            }
        }
        while let Ok(value) = values.try_recv() {
            if value.cycle <= count {
                println!("{}", format_variable(&variables, &value, &fmt)?);
            }
        }
    }

    scheduler.stop().await;
    let stats = scheduler.status().stats;
    info!(
        "{} cycles, {} failed, {} error samples",
        stats.cycles, stats.failed_cycles, stats.errors
    );
    Ok(String::default())
}

fn poll_setup(
    session: &Session,
    project: Option<&Project>,
    registers: &[RegisterSpec],
    interval: Option<u64>,
) -> Result<(PollConfig, VariableSet)> {
    let mut config = match project {
        Some(project) => project.poll_config()?,
        None => PollConfig::default(),
    };
    if let Some(interval) = interval {
        if interval == 0 {
            bail!("Poll interval must be at least 1 ms");
        }
        config.interval = Duration::from_millis(interval);
        config.backoff_base = config.interval;
    }

    // variables refer to project registers only
    let variables = match project {
        Some(project) if registers.is_empty() => project.variable_set(&session.registers())?,
        _ => VariableSet::new(),
    };
    Ok((config, variables))
}

fn find_bit<'a>(project: Option<&'a Project>, name: &str) -> Result<&'a BitDefinition> {
    project
        .ok_or_else(|| anyhow!("No project given"))?
        .bits
        .iter()
        .find(|b| b.name == name)
        .ok_or_else(|| anyhow!("No bit {} in project", name))
}

async fn cmd_bits(session: &Session, project: Option<&Project>, fmt: OutputFormat) -> Result<String> {
    let project = project.ok_or_else(|| anyhow!("No project given"))?;
    project.check_bits()?;
    let link = session.link();
    let mut lines = Vec::new();
    let mut states = Vec::new();

    for bit in &project.bits {
        let word = link
            .lock()
            .await
            .read_registers(bit.unit.unwrap_or(session.unit()), bit.register_address, 1)
            .await
            .with_context(|| format!("Failed to read bit {}", bit.name))?;
        let on = bit.extract(word.first().copied().unwrap_or_default());

        lines.push(format!(
            "{:<16} {:<16} {}",
            bit.designator(session.unit()),
            bit.name,
            if on { "on" } else { "off" }
        ));
        states.push(json!({
            "name": bit.name,
            "designator": bit.designator(session.unit()),
            "state": on,
        }));
    }

    Ok(match fmt {
        OutputFormat::Plain => lines.join("\n"),
        OutputFormat::Json => serde_json::to_string(&states)?,
    })
}

async fn cmd_set_bit(session: &Session, project: Option<&Project>, name: &str, on: bool) -> Result<String> {
    let bit = find_bit(project, name)?;
    WriteCoordinator::new(session)
        .write_bit(bit, on)
        .await
        .with_context(|| format!("Failed to write bit {}", name))?;
    Ok(String::default())
}

fn cmd_check(project: Option<&Project>, fmt: OutputFormat) -> Result<String> {
    let project = project.ok_or_else(|| anyhow!("No project given"))?;
    project
        .connection
        .validate()
        .map_err(|e| anyhow!("Invalid connection settings: {}", e))?;
    let registers = project.register_map()?;
    let variables = project.variable_set(&registers)?;
    project.check_bits()?;
    project.poll_config()?;

    Ok(match fmt {
        OutputFormat::Plain => slice_to_column(
            registers
                .iter()
                .enumerate()
                .map(|(index, r)| format!("{:3} {}", index, r.definition()))
                .chain(
                    variables
                        .definitions()
                        .iter()
                        .map(|v| format!("    {:<16} = {}", v.name, v.expression)),
                )
                .chain(project.bits.iter().map(|b| format!("    {}", b)))
                .collect::<Vec<_>>()
                .as_slice(),
        ),
        OutputFormat::Json => serde_json::to_string(&json!({
            "registers": registers.definitions(),
            "variables": variables.definitions(),
            "bits": project.bits,
        }))?,
    })
}

fn cmd_export(cli: &Cli, project: Option<&Project>, registers: RegisterMap) -> Result<String> {
    let path = match &cli.command {
        cli::Commands::Export { path, .. } => path,
        _ => bail!("unexpected command (this is a bug!)"),
    };
    let mut exported = project.cloned().unwrap_or_default();
    exported.connection = cli.settings(project);
    exported.registers = registers.definitions();
    exported
        .save(path)
        .with_context(|| format!("Failed to export project to {:?}", path))?;
    Ok(String::default())
}

async fn do_main() -> Result<String> {
    if std::env::var("GENERATE_COMPLETION").is_ok() {
        generate(Bash, &mut cli::Cli::command(), "regscope", &mut io::stdout());

        return Ok(String::default());
    }

    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(if cli.debug {
        "debug"
    } else {
        "info"
    }))
    .format_timestamp(None)
    .format_target(false)
    .init();

    let fmt = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Plain
    };

    let project = cli
        .project
        .as_ref()
        .map(|path| Project::load(path).with_context(|| format!("Failed to load {:?}", path)))
        .transpose()?;

    match &cli.command {
        cli::Commands::ListPorts => cmd_list_ports(fmt),
        cli::Commands::Check => cmd_check(project.as_ref(), fmt),
        cli::Commands::Export { registers, .. } => {
            let registers = if registers.is_empty() {
                project_map(project.as_ref())?
            } else {
                ad_hoc_map(registers)?
            };
            cmd_export(&cli, project.as_ref(), registers)
        }
        command => {
            let registers = match command {
                cli::Commands::Read { registers } => ad_hoc_map(registers)?,
                cli::Commands::Poll { registers, .. } if !registers.is_empty() => {
                    ad_hoc_map(registers)?
                }
                _ => project_map(project.as_ref())?,
            };
            let settings = cli.settings(project.as_ref());
            let session = Session::connect(settings, registers, cli.force)?;

            let result = match command {
                cli::Commands::Scan { units, address } => {
                    cmd_scan(&session, units, *address, fmt).await
                }
                cli::Commands::Read { .. } => cmd_read(&session, fmt).await,
                cli::Commands::ReadWords {
                    address,
                    count,
                    input,
                } => cmd_read_words(&session, *address, *count, *input, fmt).await,
                cli::Commands::Write { register, value } => {
                    cmd_write(&session, register, *value).await
                }
                cli::Commands::WriteWords { specs } => cmd_write_words(&session, specs).await,
                cli::Commands::Set {
                    register,
                    value,
                    raw,
                } => cmd_set(&session, register, *value, *raw, fmt).await,
                cli::Commands::Bits => cmd_bits(&session, project.as_ref(), fmt).await,
                cli::Commands::SetBit { bit, state } => {
                    cmd_set_bit(&session, project.as_ref(), bit, *state).await
                }
                cli::Commands::Poll {
                    registers,
                    count,
                    interval,
                } => match poll_setup(&session, project.as_ref(), registers, *interval) {
                    Ok((config, variables)) => {
                        cmd_poll(&session, config, variables, *count, fmt).await
                    }
                    Err(e) => Err(e),
                },
                _ => Err(anyhow!("unexpected command (this is a bug!)")),
            };

            session.disconnect().await;
            result
        }
    }
}

#[tokio::main]
async fn main() {
    match do_main().await {
        Ok(s) if s.is_empty() => {}
        Ok(s) => println!("{}", s),
        Err(e) => error!("{:#}", e),
    }
}
