/// haven-node: local driver for the transfer engine.
///
/// ```text
///   haven-node demo [FILE] [RECIPIENTS]   group send over in-memory links
///   haven-node history                    list stored transfers
///   haven-node clear-history              drop finished transfers
/// ```
///
/// Configuration comes from `HAVEN_*` environment variables (see `config`).

mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use bytes::Bytes;
use haven_crypto::HybridKeyPair;
use haven_db::TransferStore;
use haven_transfer::memory;
use haven_transfer::{
    ChunkStore, GroupTransferController, PeerLink, ReceiveTarget, ReceivedFile, TracingLogger,
    TransferSession,
};
use haven_types::PeerIdentity;
use tracing::info;

use crate::config::NodeConfig;

const DEMO_SIZE: usize = 4 * 1024 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "haven=info".into()),
        )
        .init();

    let config = NodeConfig::from_env()?;
    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.first().map(String::as_str) {
        Some("demo") | None => {
            let file = args.get(1).map(PathBuf::from);
            let recipients: usize = match args.get(2) {
                Some(raw) => raw.parse().context("RECIPIENTS must be a number")?,
                None => 3,
            };
            if recipients == 0 {
                bail!("need at least one recipient");
            }
            demo(&config, file.as_deref(), recipients).await
        }
        Some("history") => history(&config),
        Some("clear-history") => {
            let store = TransferStore::open(&config.db_path)?;
            let removed = store.clear_history()?;
            println!("removed {} finished transfers", removed);
            Ok(())
        }
        Some(other) => bail!("unknown command: {} (expected demo, history or clear-history)", other),
    }
}

async fn demo(config: &NodeConfig, file: Option<&Path>, recipients: usize) -> anyhow::Result<()> {
    let source = match file {
        Some(path) => ChunkStore::open(path, config.transfer.chunk_size).await?,
        None => {
            let data: Vec<u8> = (0..DEMO_SIZE).map(|i| (i % 251) as u8).collect();
            ChunkStore::from_bytes("demo.bin", Bytes::from(data), config.transfer.chunk_size)?
        }
    };
    let source = Arc::new(source);
    info!(
        file = %source.metadata().name,
        size = source.metadata().size,
        chunks = source.chunk_count(),
        recipients,
        "starting loopback group send"
    );

    let store = Arc::new(TransferStore::open(&config.db_path)?);
    let controller = GroupTransferController::new(
        config.transfer.clone(),
        config.group.clone(),
        store,
        Arc::new(TracingLogger),
    )?;

    let local = PeerIdentity::new("local");
    let mut links = Vec::with_capacity(recipients);
    let mut receivers = Vec::with_capacity(recipients);
    for n in 0..recipients {
        let peer = PeerIdentity::new(format!("peer-{}", n + 1));
        let identity = Arc::new(HybridKeyPair::generate());
        let (ours, theirs, _link) = memory::pair();

        // Each simulated peer keeps its own store, as a separate node would.
        let peer_store = Arc::new(TransferStore::open_in_memory()?);
        let peer_sessions =
            TransferSession::new(config.transfer.clone(), peer_store, Arc::new(TracingLogger))?;
        let target = ReceiveTarget::Directory(config.output_dir.join(peer.as_str()));
        tokio::fs::create_dir_all(config.output_dir.join(peer.as_str())).await?;
        receivers.push(peer_sessions.receive(
            identity.clone(),
            PeerLink::inbound(local.clone(), theirs),
            target,
        ));

        links.push(PeerLink::outbound(peer, identity.public_key(), ours));
    }

    let group_id = controller.start(source.clone(), links)?;

    let total = source.chunk_count();
    let wait = controller.wait(group_id);
    tokio::pin!(wait);
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    let outcome = loop {
        tokio::select! {
            outcome = &mut wait => break outcome?,
            _ = ticker.tick() => {
                let progress = controller.progress(group_id)?;
                info!(
                    group_id = %group_id,
                    slowest = progress.slowest,
                    union = progress.union.len(),
                    total,
                    "group progress"
                );
            }
        }
    };

    println!("group {}", outcome.group_id);
    for member in &outcome.members {
        match &member.error {
            Some(err) => println!("  {} {} ({})", member.peer, member.status, err),
            None => println!("  {} {}", member.peer, member.status),
        }
    }
    for handle in receivers {
        let snapshot = handle.wait().await;
        if let Some(ReceivedFile::Path(path)) = snapshot.output {
            println!("  wrote {}", path.display());
        }
    }
    println!(
        "{} of {} recipients completed",
        outcome.completed(),
        outcome.members.len()
    );
    Ok(())
}

fn history(config: &NodeConfig) -> anyhow::Result<()> {
    let store = TransferStore::open(&config.db_path)?;
    let records = store.list_all()?;
    if records.is_empty() {
        println!("no transfers");
        return Ok(());
    }
    for record in records {
        println!(
            "{}  {:?}  {:<10} {:>6}/{:<6} {}  peer={}  updated={}",
            record.transfer_id,
            record.direction,
            record.status.as_str(),
            record.acked.len(),
            record.chunk_count(),
            record.file.name,
            record.peer,
            record.updated_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }
    Ok(())
}
