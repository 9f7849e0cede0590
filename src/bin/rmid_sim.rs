//! rmid_sim - simulated robot controller speaking the text protocol
//!
//! Accepts driver connections, acknowledges every `cmd` line with a
//! `result` line and streams `joints` lines at a fixed rate while easing each
//! joint toward the last commanded pose.

use anyhow::{Context, Result};
use clap::Parser;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Clone)]
#[command(name = "rmid_sim")]
#[command(about = "Simulated text-protocol robot controller for local testing")]
#[command(version)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    #[arg(short, long, default_value_t = 30000)]
    port: u16,

    /// Number of simulated joints
    #[arg(short, long, default_value_t = 6)]
    joints: usize,

    /// Joint stream rate in Hz
    #[arg(long, default_value_t = 50)]
    rate: u32,

    /// Largest joint move per tick, in radians
    #[arg(long, default_value_t = 0.02)]
    max_step: f64,
}

struct Arm {
    positions: Vec<f64>,
    target: Vec<f64>,
    max_step: f64,
}

impl Arm {
    fn new(joints: usize, max_step: f64) -> Self {
        Self {
            positions: vec![0.0; joints],
            target: vec![0.0; joints],
            max_step,
        }
    }

    fn set_target(&mut self, pose: &[f64]) {
        for (target, value) in self.target.iter_mut().zip(pose) {
            *target = *value;
        }
    }

    fn step(&mut self) {
        for (position, target) in self.positions.iter_mut().zip(&self.target) {
            let delta = (target - *position).clamp(-self.max_step, self.max_step);
            *position += delta;
        }
    }

    fn joints_line(&self) -> String {
        let values: Vec<String> = self.positions.iter().map(|p| format!("{:.6}", p)).collect();
        format!("joints {}\n", values.join(" "))
    }
}

/// `cmd <id> <type> [<pose_type> <values...>] [: <vel_type> <values...>] [| <blend_type> <values...>]`
fn parse_command(line: &str) -> Option<(u32, Vec<f64>)> {
    let mut tokens = line.split_whitespace();
    if tokens.next()? != "cmd" {
        return None;
    }
    let id = tokens.next()?.parse().ok()?;
    let _command_type = tokens.next()?;

    let rest: Vec<&str> = tokens.collect();
    let pose_section = rest.split(|token| *token == ":" || *token == "|").next().unwrap_or(&[]);
    let pose = pose_section
        .iter()
        .skip(1)
        .filter_map(|token| token.parse::<f64>().ok())
        .collect();
    Some((id, pose))
}

/// Writes on their own task so a driver that is slow to read never stalls
/// command intake
fn spawn_writer(mut writer: tokio::net::tcp::OwnedWriteHalf) -> mpsc::UnboundedSender<String> {
    let (sender, mut lines) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        while let Some(line) = lines.recv().await {
            if let Err(e) = writer.write_all(line.as_bytes()).await {
                debug!("Writer stopped: {}", e);
                break;
            }
        }
    });
    sender
}

async fn serve(stream: TcpStream, args: Args) -> Result<()> {
    let peer = stream.peer_addr()?;
    info!("Driver connected from {}", peer);

    let (reader, writer) = stream.into_split();
    let outgoing = spawn_writer(writer);
    let mut lines = BufReader::new(reader).lines();
    let mut arm = Arm::new(args.joints, args.max_step);

    let mut ticker = tokio::time::interval(Duration::from_secs_f64(1.0 / args.rate.max(1) as f64));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let _ = outgoing.send("info rmid_sim ready\n".to_string());

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    info!("Driver {} disconnected", peer);
                    return Ok(());
                };
                match parse_command(&line) {
                    Some((id, pose)) => {
                        debug!("Command {} -> {:?}", id, pose);
                        arm.set_target(&pose);
                        let _ = outgoing.send(format!("result {} 0 accepted\n", id));
                    }
                    None => warn!("Unrecognised line from {}: {}", peer, line),
                }
            }
            _ = ticker.tick() => {
                arm.step();
                if outgoing.send(arm.joints_line()).is_err() {
                    return Ok(());
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let address = format!("{}:{}", args.bind, args.port);
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to listen on {}", address))?;
    info!("Simulated controller with {} joints on {}", args.joints, address);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _) = accepted?;
                let args = args.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve(stream, args).await {
                        warn!("Session ended: {}", e);
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command_with_pose_and_velocity() {
        let (id, pose) = parse_command("cmd 4 PTP JOINTS 0.5 -1 : - 0.2").unwrap();
        assert_eq!(id, 4);
        assert_eq!(pose, vec![0.5, -1.0]);

        let (_, pose) = parse_command("cmd 5 PTP JOINTS 0.25 | BLENDING_PERCENT 40").unwrap();
        assert_eq!(pose, vec![0.25]);
    }

    #[test]
    fn test_parse_rejects_other_lines() {
        assert!(parse_command("joints 1 2").is_none());
        assert!(parse_command("cmd x PTP").is_none());
    }

    #[test]
    fn test_arm_moves_toward_target() {
        let mut arm = Arm::new(2, 0.1);
        arm.set_target(&[1.0, -0.05]);
        arm.step();
        assert!((arm.positions[0] - 0.1).abs() < 1e-9);
        assert!((arm.positions[1] + 0.05).abs() < 1e-9);
        assert_eq!(arm.joints_line(), "joints 0.100000 -0.050000\n");
    }
}
