use anyhow::{anyhow, bail, Context, Result};
use conductor::clock::system_now_ms;
use conductor::packet::{decode_sync, encode_sync, SyncMessage};
use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, info, warn};

// Forget clients that stopped probing
const CLIENT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
// Default lead between a `play` command and the scheduled start
const DEFAULT_LEAD_MS: i64 = 6_000;

fn usage(prog: &str) {
  eprintln!("Usage: {} <listen_addr:port> [--lead <ms>]", prog);
  eprintln!("Example: {} 0.0.0.0:4810", prog);
  eprintln!("Commands on stdin: play [delay_ms] | volume <0.0-1.0> | clients");
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    )
    .with_writer(std::io::stderr)
    .init();

  // 1. Parse listening address and options
  let mut args = env::args();
  let prog = args.next().unwrap_or_else(|| "conductor-server".into());
  let mut listen_addr: Option<String> = None;
  let mut lead_ms = DEFAULT_LEAD_MS;
  while let Some(arg) = args.next() {
    match arg.as_str() {
      "--lead" => {
        let v = args.next().ok_or_else(|| anyhow!("--lead needs a value"))?;
        lead_ms = v.parse().with_context(|| format!("invalid --lead: {v}"))?;
      }
      "-h" | "--help" => {
        usage(&prog);
        return Ok(());
      }
      s if s.starts_with('-') => bail!("unknown flag: {}", s),
      s => {
        if listen_addr.is_some() {
          bail!("unexpected argument: {}", s);
        }
        listen_addr = Some(s.to_string());
      }
    }
  }
  let listen_addr = listen_addr.ok_or_else(|| {
    usage(&prog);
    anyhow!("missing listen address")
  })?;

  // 2. Bind UDP socket and start answering probes
  let socket = UdpSocket::bind(&listen_addr)
    .await
    .with_context(|| format!("failed to bind {listen_addr}"))?;
  info!("time authority listening on {}", socket.local_addr()?);

  let mut clients: HashMap<SocketAddr, Instant> = HashMap::new();
  let mut lines = BufReader::new(tokio::io::stdin()).lines();
  let mut stdin_open = true;
  let mut buf = [0u8; 512];

  // 3. Serve probes and operator commands
  loop {
    tokio::select! {
      recv = socket.recv_from(&mut buf) => {
        let (n, src) = match recv {
          Ok(v) => v,
          Err(e) => {
            // e.g. ICMP port unreachable surfacing on some platforms
            warn!("receive failed: {e}");
            continue;
          }
        };
        match decode_sync(&buf[..n]) {
          Ok(SyncMessage::SyncRequest { t1_ms }) => {
            let reply = encode_sync(&SyncMessage::SyncResponse { t1_ms, s1_ms: system_now_ms() });
            if clients.insert(src, Instant::now()).is_none() {
              info!(%src, "new client");
            }
            if let Err(e) = socket.send_to(&reply, src).await {
              warn!(%src, "reply failed: {e}");
            }
          }
          Ok(other) => debug!(%src, ?other, "ignoring client message"),
          Err(e) => debug!(%src, "dropping datagram: {e}"),
        }
        let now = Instant::now();
        clients.retain(|_, seen| now.duration_since(*seen) < CLIENT_IDLE_TIMEOUT);
      }
      line = lines.next_line(), if stdin_open => {
        let Some(line) = line.context("failed to read stdin")? else {
          stdin_open = false;
          continue;
        };
        match parse_command(&line, lead_ms) {
          Ok(Command::Push(msg)) => broadcast(&socket, &clients, &msg).await,
          Ok(Command::ListClients) => {
            for (addr, seen) in &clients {
              eprintln!("  {} (seen {:.1}s ago)", addr, seen.elapsed().as_secs_f64());
            }
          }
          Ok(Command::Nothing) => {}
          Err(e) => eprintln!("{e:#}"),
        }
      }
    }
  }
}

#[derive(Debug, PartialEq)]
enum Command {
  Push(SyncMessage),
  ListClients,
  Nothing,
}

fn parse_command(line: &str, lead_ms: i64) -> Result<Command> {
  let mut words = line.split_whitespace();
  let Some(cmd) = words.next() else {
    return Ok(Command::Nothing);
  };
  match cmd {
    "play" => {
      let delay: i64 = match words.next() {
        Some(v) => v.parse().with_context(|| format!("invalid delay: {v}"))?,
        None => lead_ms,
      };
      Ok(Command::Push(SyncMessage::Schedule { time_ms: system_now_ms() + delay }))
    }
    "volume" => {
      let v = words.next().ok_or_else(|| anyhow!("volume needs a level"))?;
      let level: f32 = v.parse().with_context(|| format!("invalid level: {v}"))?;
      if !(0.0..=1.0).contains(&level) {
        bail!("level must be within 0.0..=1.0");
      }
      Ok(Command::Push(SyncMessage::Volume { level }))
    }
    "clients" => Ok(Command::ListClients),
    other => bail!("unknown command: {other}"),
  }
}

async fn broadcast(socket: &UdpSocket, clients: &HashMap<SocketAddr, Instant>, msg: &SyncMessage) {
  let pkt = encode_sync(msg);
  for addr in clients.keys() {
    if let Err(e) = socket.send_to(&pkt, addr).await {
      warn!(%addr, "push failed: {e}");
    }
  }
  info!(?msg, clients = clients.len(), "pushed");
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn play_uses_lead_or_explicit_delay() {
    let before = system_now_ms();
    let Command::Push(SyncMessage::Schedule { time_ms }) = parse_command("play", 6_000).unwrap() else {
      panic!("expected a schedule");
    };
    assert!(time_ms >= before + 6_000);
    let Command::Push(SyncMessage::Schedule { time_ms }) = parse_command("play 250", 6_000).unwrap() else {
      panic!("expected a schedule");
    };
    assert!(time_ms >= before + 250 && time_ms < before + 6_000);
  }

  #[test]
  fn volume_is_range_checked() {
    assert_eq!(
      parse_command("volume 0.5", 0).unwrap(),
      Command::Push(SyncMessage::Volume { level: 0.5 })
    );
    assert!(parse_command("volume 2", 0).is_err());
    assert!(parse_command("volume", 0).is_err());
    assert_eq!(parse_command("   ", 0).unwrap(), Command::Nothing);
    assert!(parse_command("dance", 0).is_err());
  }
}
