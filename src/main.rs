use anyhow::{anyhow, Result};
use dotenv::dotenv;
use log::{debug, error, info};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use warp_node::networking::{Remote, TransferDirection, TransferStatus};
use warp_node::{Engine, EngineEvent, EventReceiver, Settings};

fn print_help() {
    println!("Commands:");
    println!("  list                         show remotes");
    println!("  send <remote> <path>...      offer files or directories");
    println!("  transfers                    show transfers");
    println!("  accept <remote> <id>         accept an incoming transfer");
    println!("  decline <remote> <id>        decline an incoming transfer");
    println!("  cancel <remote> <id>         withdraw an outgoing offer");
    println!("  stop <remote> <id>           stop a running transfer");
    println!("  clear                        forget finished transfers");
    println!("  rescan                       look for remotes again");
    println!("  quit");
}

/// Find a remote by identifier prefix
fn find_remote(engine: &Engine, prefix: &str) -> Result<Arc<Remote>> {
    let mut matches = engine
        .remotes()
        .into_iter()
        .filter(|r| r.id().starts_with(prefix));
    match (matches.next(), matches.next()) {
        (Some(remote), None) => Ok(remote),
        (Some(_), Some(_)) => Err(anyhow!("'{}' matches more than one remote", prefix)),
        (None, _) => Err(anyhow!("No remote found with ID starting with '{}'", prefix)),
    }
}

fn parse_target(engine: &Engine, parts: &[&str]) -> Result<(Arc<Remote>, u64)> {
    match parts {
        [_, remote, id, ..] => Ok((find_remote(engine, remote)?, id.parse()?)),
        _ => Err(anyhow!("Usage: {} <remote> <id>", parts.first().unwrap_or(&""))),
    }
}

fn list_remotes(engine: &Engine) {
    let remotes = engine.remotes();
    if remotes.is_empty() {
        println!("⚠️ No remotes discovered yet.");
        return;
    }
    println!("\n=== Remotes ({}) ===", remotes.len());
    for remote in remotes {
        let info = remote.info();
        println!("{} ({}) - {:?}", info.display_name, info.id, info.status);
        println!("   Address: {}:{}", info.address, info.port);
        if !info.service_available {
            println!("   (not advertising)");
        }
    }
    println!();
}

fn list_transfers(engine: &Engine) {
    for remote in engine.remotes() {
        let transfers = remote.transfers();
        if transfers.is_empty() {
            continue;
        }
        println!("\n=== {} ===", remote.id());
        for transfer in transfers {
            let arrow = match transfer.direction() {
                TransferDirection::Send => "→",
                TransferDirection::Receive => "←",
            };
            let summary = transfer.summary();
            let name = if summary.single_name.is_empty() {
                format!("{} items", summary.file_count)
            } else {
                summary.single_name.clone()
            };
            let speed = if transfer.status() == TransferStatus::Transferring {
                format!(" {} KiB/s", transfer.bytes_per_second() / 1024)
            } else {
                String::new()
            };
            println!(
                "{} {} {} {:?} {:.0}%{}{}",
                arrow,
                transfer.start_time(),
                name,
                transfer.status(),
                transfer.progress() * 100.0,
                speed,
                transfer
                    .remaining_time()
                    .map(|t| format!(", {} left", t))
                    .unwrap_or_default()
            );
            if transfer.overwrite_warning() {
                println!("   ⚠️ existing files will be overwritten");
            }
            for error in transfer.errors() {
                println!("   ❌ {}", error);
            }
        }
    }
    println!();
}

async fn print_events(mut events: EventReceiver) {
    while let Some(event) = events.recv().await {
        match event {
            EngineEvent::IncomingTransfer { remote_id, start_time } => {
                println!("📨 Incoming transfer {} from {} (accept {} {})", start_time, remote_id, remote_id, start_time);
            }
            EngineEvent::RemoteStatusChanged { remote_id, status } => {
                println!("🔗 {} is {:?}", remote_id, status);
            }
            EngineEvent::TransferStatusChanged {
                remote_id,
                start_time,
                status,
            } => {
                println!("📦 Transfer {} with {}: {:?}", start_time, remote_id, status);
            }
            other => debug!("{:?}", other),
        }
    }
}

async fn handle_command(engine: &Arc<Engine>, parts: &[&str]) -> Result<bool> {
    match parts.first().copied() {
        Some("list") | Some("l") | None => list_remotes(engine),
        Some("transfers") | Some("t") => list_transfers(engine),
        Some("send") | Some("s") => {
            let [_, remote, paths @ ..] = parts else {
                return Err(anyhow!("Usage: send <remote> <path>..."));
            };
            if paths.is_empty() {
                return Err(anyhow!("Usage: send <remote> <path>..."));
            }
            let remote = find_remote(engine, remote)?;
            let paths = paths.iter().map(PathBuf::from).collect();
            let start_time = remote.send_files(paths).await?;
            println!("⏳ Offered transfer {} to {}", start_time, remote.id());
        }
        Some("accept") => {
            let (remote, id) = parse_target(engine, parts)?;
            remote.accept_transfer(id)?;
        }
        Some("decline") => {
            let (remote, id) = parse_target(engine, parts)?;
            remote.decline_transfer(id).await?;
        }
        Some("cancel") => {
            let (remote, id) = parse_target(engine, parts)?;
            remote.cancel_offer(id).await?;
        }
        Some("stop") => {
            let (remote, id) = parse_target(engine, parts)?;
            remote.stop_transfer(id, false).await?;
        }
        Some("clear") => engine.clear_finished_transfers(),
        Some("rescan") => engine.rescan()?,
        Some("help") | Some("?") => print_help(),
        Some("quit") | Some("q") | Some("exit") => return Ok(false),
        Some(cmd) => {
            println!("Unknown command: {}", cmd);
            print_help();
        }
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists
    dotenv().ok();

    // Initialize logging
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let settings = Settings::from_env()?;
    info!(
        "Saving received files to {}, group code '{}'",
        settings.download_dir.display(),
        settings.group_code
    );

    let (engine, events) = Engine::new(settings)?;
    engine.start().await?;
    tokio::spawn(print_events(events));

    let (interrupt_tx, mut interrupt_rx) = mpsc::unbounded_channel();
    ctrlc::set_handler(move || {
        let _ = interrupt_tx.send(());
    })?;

    println!("Node '{}' is running. Type 'help' for commands.\n", engine.local_id());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = interrupt_rx.recv() => None,
        };
        let Some(line) = line else {
            break;
        };

        let parts: Vec<&str> = line.split_whitespace().collect();
        match handle_command(&engine, &parts).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                error!("{:#}", e);
                println!("❌ Error: {:#}", e);
            }
        }
    }

    println!("Exiting...");
    engine.stop().await;
    Ok(())
}
