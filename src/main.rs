use anyhow::{Context, Result};
use chainrtc::config::{ensure_signing_key, Config};
use chainrtc::ledger::address_for;
use chainrtc::{ChannelStore, HttpLedger, PeerIdentity, PinataClient, RtcManager};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;

#[derive(Parser)]
#[command(name = "chainrtc")]
#[command(about = "Peer-to-peer chat over WebRTC with on-chain rendezvous", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon and the chat console
    Start {
        /// Offer a connection to this address right away
        #[arg(long)]
        connect: Option<String>,
    },
    /// Print the local ledger address
    Address,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Address => {
            let (key, was_generated) = ensure_signing_key()?;
            let address = address_for(&key);
            if was_generated {
                println!("{} (new)", address);
            } else {
                println!("{}", address);
            }
        }
        Commands::Start { connect } => {
            let config = Config::load()?;
            let (key, was_generated) = ensure_signing_key()?;

            let ledger = Arc::new(HttpLedger::new(&config.ledger, key));
            let identity = ledger.address().clone();
            let blob = Arc::new(PinataClient::new(&config.ipfs));
            let store = ChannelStore::new();

            let manager = Arc::new(RtcManager::new(
                identity.clone(),
                config.rtc_config(),
                blob,
                ledger,
                store.clone(),
            ));

            println!("Starting chainrtc");
            println!("Fullnode: {}", config.ledger.rpc_url);
            println!("Package: {}", config.ledger.package_id);
            if was_generated {
                println!("Identity: {} (new)", identity);
            } else {
                println!("Identity: {}", identity);
            }
            println!("IPFS gateway: {}", config.ipfs.gateway_url);
            println!();
            println!("Commands: /connect <addr>, /select <addr>, /peers, /messages, /quit");
            println!("Anything else is sent to the selected peer.");

            let runner = manager.clone();
            let run_handle = tokio::spawn(async move { runner.run().await });

            if let Some(addr) = connect {
                manager
                    .offer_connect(PeerIdentity::new(addr.trim()))
                    .await
                    .context("Failed to start connection")?;
            }

            console(&manager, &store).await?;

            manager.shutdown();
            let _ = run_handle.await;
        }
    }

    Ok(())
}

/// Thin line-oriented stand-in for the UI layer: issues entry-point calls
/// and renders store snapshots.
async fn console(manager: &RtcManager, store: &ChannelStore) -> Result<()> {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(addr) = line.strip_prefix("/connect ") {
            let peer = PeerIdentity::new(addr.trim());
            match manager.offer_connect(peer.clone()).await {
                Ok(()) => store.select_channel(&peer),
                Err(e) => eprintln!("connect failed: {}", e),
            }
        } else if let Some(addr) = line.strip_prefix("/select ") {
            let peer = PeerIdentity::new(addr.trim());
            store.select_channel(&peer);
            if store.selected() != Some(peer.clone()) {
                println!("Unknown peer {}", peer.short());
            }
        } else if line == "/peers" {
            let snapshot = store.snapshot();
            if snapshot.order.is_empty() {
                println!("No peers yet");
            }
            for peer in &snapshot.order {
                let status = snapshot
                    .channels
                    .get(peer)
                    .map(|r| r.status.to_string())
                    .unwrap_or_default();
                let marker = if snapshot.selected.as_ref() == Some(peer) {
                    "*"
                } else {
                    " "
                };
                println!("{} {} [{}]", marker, peer.short(), status);
            }
        } else if line == "/messages" {
            let snapshot = store.snapshot();
            match snapshot.selected {
                Some(ref peer) => match snapshot.channels.get(peer) {
                    Some(record) => {
                        for message in &record.messages {
                            println!("[{}] {}", message.sender, message.text);
                        }
                    }
                    None => println!("No messages"),
                },
                None => println!("No channel selected"),
            }
        } else if line == "/quit" {
            break;
        } else {
            match store.selected() {
                Some(peer) => {
                    if let Err(e) = manager.send_message(&peer, line).await {
                        eprintln!("send failed: {}", e);
                    }
                }
                None => println!("No channel selected; /connect <addr> first"),
            }
        }
    }

    Ok(())
}
