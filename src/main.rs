//! Headless entry point with an interactive operator console.
//!
//! The production deployment embeds [`plate_sampler::Sampler`] behind the
//! web layer; this binary wires the same core to a serial port (or the mock
//! MCU with `--mock`) and drives it from stdin, which is all that is needed
//! for bring-up and calibration on the bench.

use anyhow::{Context, Result};
use clap::Parser;
use plate_sampler::config::SamplerConfig;
use plate_sampler::position::{Axis, Direction, ZState};
use plate_sampler::program::Program;
use plate_sampler::transport::{MockTransport, SerialTransport, Transport};
use plate_sampler::{Sampler, WellId};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "plate-sampler", about = "96-well pipetting sampler motion core")]
struct Args {
    /// Serial port to the motor MCU
    #[arg(long, default_value = "/dev/ttyACM0")]
    port: String,

    /// Configuration file (KEY=value); defaults apply when absent
    #[arg(long)]
    config: Option<PathBuf>,

    /// Drive the in-memory mock MCU instead of hardware
    #[arg(long)]
    mock: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => SamplerConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => SamplerConfig::default(),
    };
    config
        .apply_env_overrides()
        .context("applying environment overrides")?;

    let transport: Arc<dyn Transport> = if args.mock {
        info!("running against the mock MCU (simulation mode)");
        Arc::new(MockTransport::new())
    } else {
        Arc::new(
            SerialTransport::open(&args.port)
                .await
                .with_context(|| format!("opening serial port {}", args.port))?,
        )
    };

    let sampler = Sampler::new(transport, config);
    sampler
        .initialize_motors()
        .await
        .context("initializing motors")?;

    let link = sampler.clone();
    tokio::spawn(async move { link.supervise_link().await });

    console(sampler).await
}

const HELP: &str = "\
commands:
  status                      machine status
  logs [n]                    last n log lines (default 20)
  home                        home all axes
  move <well>                 move to a well, e.g. move B4
  aspirate <ml> | dispense <ml>
  z up|down                   toggle the Z axis
  jog <axis> <steps> <cw|ccw> raw axis jog (axis: x y z pipette)
  exec <file.json>            start a pipetting program
  stop                        cancel the running job
  pipettes 1|3                select the head
  config                      show the active configuration
  limits                      read the limit switches
  quit";

async fn console(sampler: Sampler) -> Result<()> {
    println!("plate-sampler console; 'help' for commands");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let result = match parts.as_slice() {
            [] => continue,
            ["help"] => {
                println!("{HELP}");
                Ok(())
            }
            ["quit"] | ["exit"] => break,
            ["status"] => {
                let status = sampler.status();
                println!(
                    "{} | well {} | Z {:?} | {} pipette(s) | homed: {} | {}",
                    status.current_operation,
                    status
                        .current_well
                        .map(|w| w.to_string())
                        .unwrap_or_else(|| "-".into()),
                    status.z_state,
                    status.pipette_count,
                    status.initialized,
                    status.message,
                );
                println!(
                    "positions: X={} Y={} Z={} pipette={}",
                    status.positions.x,
                    status.positions.y,
                    status.positions.z,
                    status.positions.pipette,
                );
                Ok(())
            }
            ["logs", rest @ ..] => {
                let n = rest.first().and_then(|s| s.parse().ok()).unwrap_or(20);
                for entry in sampler.logs(n) {
                    println!("{entry}");
                }
                Ok(())
            }
            ["home"] => sampler.home_all().await,
            ["move", well] => match well.parse::<WellId>() {
                Ok(well) => sampler.move_to_well(well).await,
                Err(e) => Err(e),
            },
            ["aspirate", ml] => match ml.parse::<f64>() {
                Ok(ml) => sampler.aspirate(ml).await,
                Err(_) => {
                    println!("not a volume: {ml}");
                    Ok(())
                }
            },
            ["dispense", ml] => match ml.parse::<f64>() {
                Ok(ml) => sampler.dispense(ml).await,
                Err(_) => {
                    println!("not a volume: {ml}");
                    Ok(())
                }
            },
            ["z", "up"] => sampler.toggle_z(ZState::Up).await,
            ["z", "down"] => sampler.toggle_z(ZState::Down).await,
            ["jog", axis, steps, dir] => run_jog(&sampler, axis, steps, dir).await,
            ["exec", path] => match std::fs::read_to_string(path) {
                Ok(text) => match serde_json::from_str::<Program>(&text) {
                    Ok(program) => sampler.start_program(program).map(|()| {
                        println!("program accepted; poll 'status'");
                    }),
                    Err(e) => {
                        println!("bad program: {e}");
                        Ok(())
                    }
                },
                Err(e) => {
                    println!("cannot read {path}: {e}");
                    Ok(())
                }
            },
            ["stop"] => {
                sampler.stop();
                Ok(())
            }
            ["pipettes", n] => match n.parse::<u8>() {
                Ok(n) => sampler.set_pipette_count(n),
                Err(_) => {
                    println!("pipettes takes 1 or 3");
                    Ok(())
                }
            },
            ["config"] => {
                print!("{}", sampler.config().to_key_values());
                Ok(())
            }
            ["limits"] => match sampler.limit_states().await {
                Ok(limits) => {
                    for limit in limits {
                        println!(
                            "motor {} (pin {}): {}",
                            limit.motor_id,
                            limit.pin,
                            if limit.triggered { "TRIGGERED" } else { "open" }
                        );
                    }
                    Ok(())
                }
                Err(e) => Err(e),
            },
            _ => {
                println!("unknown command; 'help' for the list");
                Ok(())
            }
        };
        if let Err(e) = result {
            println!("error: {e}");
        }
    }
    Ok(())
}

async fn run_jog(
    sampler: &Sampler,
    axis: &str,
    steps: &str,
    dir: &str,
) -> plate_sampler::ControlResult<()> {
    let axis = match axis.to_ascii_lowercase().as_str() {
        "x" => Axis::X,
        "y" => Axis::Y,
        "z" => Axis::Z,
        "pipette" | "p" => Axis::Pipette,
        other => {
            println!("unknown axis: {other}");
            return Ok(());
        }
    };
    let steps: u32 = match steps.parse() {
        Ok(steps) => steps,
        Err(_) => {
            println!("not a step count: {steps}");
            return Ok(());
        }
    };
    let direction = match dir.to_ascii_lowercase().as_str() {
        "cw" => Direction::Cw,
        "ccw" => Direction::Ccw,
        other => {
            println!("direction must be cw or ccw, got {other}");
            return Ok(());
        }
    };
    let positions = sampler.axis_jog(axis, steps, direction).await?;
    println!(
        "positions: X={} Y={} Z={} pipette={}",
        positions.x, positions.y, positions.z, positions.pipette
    );
    Ok(())
}
