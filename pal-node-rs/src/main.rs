//! OfficePal Node - command line chat client
//!
//! Joins the office mesh, prints chat lines and shared-log changes as they
//! arrive, and reads commands from stdin.
//!
//! # Usage
//!
//! ```bash
//! # Discover peers over mDNS
//! pal-node --name alice
//!
//! # Two nodes on one machine without mDNS
//! pal-node --name alice --port 4001 --no-mdns --peer bob=127.0.0.1:4002
//! pal-node --name bob --port 4002 --no-mdns --peer alice=127.0.0.1:4001
//! ```

use clap::Parser;
use pal_core::{MeshConfig, MeshEvent, Node, PeerEndpoint, PeerId};
use std::io::{self, BufRead};
use std::net::{IpAddr, ToSocketAddrs};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// OfficePal LAN chat node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Node name/identifier (defaults to a random one)
    #[arg(short, long)]
    name: Option<String>,

    /// TCP port of the publish socket (0 picks a free one)
    #[arg(short, long, default_value = "31337")]
    port: u16,

    /// Static peer as id=host:port (can be repeated)
    #[arg(long, value_parser = parse_peer)]
    peer: Vec<(PeerId, PeerEndpoint)>,

    /// Disable mDNS discovery (use static peers only)
    #[arg(long)]
    no_mdns: bool,

    /// Address to announce instead of every interface address
    #[arg(long)]
    advertise_ip: Option<IpAddr>,

    /// File the shared log is loaded from and saved to
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

/// Parse `id=host:port`
fn parse_peer(s: &str) -> Result<(PeerId, PeerEndpoint), String> {
    let (id, addr) = s
        .split_once('=')
        .ok_or_else(|| format!("expected id=host:port, got '{}'", s))?;
    if id.is_empty() {
        return Err(format!("missing peer id in '{}'", s));
    }
    let endpoint = addr
        .to_socket_addrs()
        .map_err(|e| format!("cannot resolve '{}': {}", addr, e))?
        .next()
        .ok_or_else(|| format!("'{}' resolved to no address", addr))?;
    Ok((id.to_string(), endpoint))
}

/// Line typed on stdin
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Say(String),
    To(PeerId, String),
    Append(String),
    Reset,
    Sync,
    Log,
    Peers,
    Quit,
}

fn parse_command(line: &str) -> Result<Command, String> {
    let line = line.trim();
    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line, ""),
    };

    match verb {
        "say" if !rest.is_empty() => Ok(Command::Say(rest.to_string())),
        "to" => match rest.split_once(char::is_whitespace) {
            Some((peer, text)) if !text.trim().is_empty() => {
                Ok(Command::To(peer.to_string(), text.trim().to_string()))
            }
            _ => Err("usage: to <peer> <text>".to_string()),
        },
        "append" if !rest.is_empty() => Ok(Command::Append(rest.to_string())),
        "reset" => Ok(Command::Reset),
        "sync" => Ok(Command::Sync),
        "log" => Ok(Command::Log),
        "peers" => Ok(Command::Peers),
        "quit" | "exit" => Ok(Command::Quit),
        "say" | "append" => Err(format!("usage: {} <text>", verb)),
        _ => Err(format!("unknown command '{}'", verb)),
    }
}

fn print_help() {
    println!("\nCommands:");
    println!("  say <text>        - Chat with everyone");
    println!("  to <peer> <text>  - Chat with one peer");
    println!("  append <text>     - Add an entry to the shared log");
    println!("  reset             - Clear the local log");
    println!("  sync              - Re-send the local log to peers");
    println!("  log               - Show the local log");
    println!("  peers             - Show connected peers");
    println!("  quit              - Exit\n");
}

fn print_event(event: &MeshEvent) {
    match event {
        MeshEvent::PeerAdded(id) => println!("* {} joined", id),
        MeshEvent::PeerRemoved(id) => println!("* {} left", id),
        MeshEvent::MessageArrived { message, .. } => match &message.to {
            Some(_) => println!("[{} -> you] {}", message.author, message.content),
            None => println!("[{}] {}", message.author, message.content),
        },
        MeshEvent::EntryApplied(entry) => println!(
            "* log #{} from {}: {}",
            entry.seqno,
            entry.origin_node,
            String::from_utf8_lossy(&entry.payload)
        ),
    }
}

/// Returns false once the user asked to quit
fn run_command(node: &Node, command: Command) -> bool {
    match command {
        Command::Say(text) => match node.send_chat(text, None) {
            Ok(0) => println!("(nobody is listening yet)"),
            Ok(_) => {}
            Err(e) => warn!("Could not send: {}", e),
        },
        Command::To(peer, text) => {
            if let Err(e) = node.send_chat(text, Some(peer)) {
                warn!("Could not send: {}", e);
            }
        }
        Command::Append(text) => {
            let seqno = node.append(text);
            println!("* appended #{}", seqno);
        }
        Command::Reset => {
            node.reset();
            println!("* log cleared");
        }
        Command::Sync => println!("* re-sent {} entries", node.resync()),
        Command::Log => {
            let entries = node.log_snapshot();
            if entries.is_empty() {
                println!("(log is empty)");
            }
            for entry in entries {
                println!(
                    "  #{:<4} {:<16} {}",
                    entry.seqno,
                    entry.origin_node,
                    String::from_utf8_lossy(&entry.payload)
                );
            }
        }
        Command::Peers => {
            let peers = node.peers();
            if peers.is_empty() {
                println!("(no peers)");
            }
            for id in peers {
                let reachable = node.bus().peer(&id).map_or(false, |p| p.reachable);
                println!("  {}{}", id, if reachable { "" } else { " (unreachable)" });
            }
        }
        Command::Quit => return false,
    }
    true
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let name = args.name.clone().unwrap_or_else(|| {
        let id = uuid::Uuid::new_v4().simple().to_string();
        format!("pal-{}", &id[..8])
    });

    let mut config = MeshConfig::new(name).with_port(args.port);
    if args.no_mdns {
        config = config.without_mdns();
    }
    if let Some(ip) = args.advertise_ip {
        config = config.with_advertise_ip(ip);
    }
    if let Some(path) = &args.state_file {
        config = config.with_state_file(path);
    }
    for (id, endpoint) in &args.peer {
        info!("Added static peer: {} at {}", id, endpoint);
        config = config.with_peer(id.clone(), *endpoint);
    }

    let node = Node::start(config).await?;
    info!("OfficePal node \"{}\" listening on {}", node.id(), node.local_addr());

    // Print events as they arrive
    let events = node.events();
    std::thread::spawn(move || {
        for event in events.iter() {
            print_event(&event);
        }
    });

    // Spawn stdin handler
    let (command_tx, mut command_rx) = mpsc::channel::<Command>(16);
    std::thread::spawn(move || {
        print_help();
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            match parse_command(&line) {
                Ok(command) => {
                    if command_tx.blocking_send(command).is_err() {
                        break;
                    }
                }
                Err(e) => println!("{}", e),
            }
        }
        // EOF on stdin quits
        let _ = command_tx.blocking_send(Command::Quit);
    });

    loop {
        tokio::select! {
            Some(command) = command_rx.recv() => {
                if !run_command(&node, command) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    node.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_peer() {
        let (id, endpoint) = parse_peer("bob=127.0.0.1:4002").unwrap();
        assert_eq!(id, "bob");
        assert_eq!(endpoint, "127.0.0.1:4002".parse().unwrap());

        assert!(parse_peer("127.0.0.1:4002").is_err());
        assert!(parse_peer("=127.0.0.1:4002").is_err());
        assert!(parse_peer("bob=not-an-address").is_err());
    }

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command("say hello there"), Ok(Command::Say("hello there".to_string())));
        assert_eq!(
            parse_command("to bob  see you at 3"),
            Ok(Command::To("bob".to_string(), "see you at 3".to_string()))
        );
        assert_eq!(parse_command("append milk"), Ok(Command::Append("milk".to_string())));
        assert_eq!(parse_command("  log "), Ok(Command::Log));
        assert_eq!(parse_command("exit"), Ok(Command::Quit));

        assert!(parse_command("say").is_err());
        assert!(parse_command("to bob").is_err());
        assert!(parse_command("dance").is_err());
    }
}
