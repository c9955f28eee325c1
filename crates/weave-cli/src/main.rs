// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! weave developer CLI.
//!
//! Provides `weave serve` (run the realtime channel hub), `weave demo` (two
//! in-process peers converge a toy weave over a throwaway hub, to see the
//! protocol work end to end), and `weave inspect` (print a stored causal
//! tree's version vector and hash).
#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use weave_app_core::config::ConfigService;
use weave_app_core::prefs::{HubPrefs, PeerPrefs, HUB_PREFS_KEY, PEER_PREFS_KEY};
use weave_channel::RealtimeChannel;
use weave_config_fs::FsConfigStore;
use weave_core::{AtomFactory, SiteInfo, Weave};
use weave_proto::{ChannelEvent, ChannelInfo};

#[derive(Parser)]
#[command(name = "weave", about = "weave CRDT hub and demo tooling", disable_help_subcommand = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the realtime channel hub, relaying frames between joined peers.
    Serve {
        /// Unix socket path to bind. Overrides the persisted hub preference.
        #[arg(long)]
        socket: Option<String>,
    },
    /// Run two in-process peers against a throwaway hub and print the
    /// converged weave once they exchange and import each other's atoms.
    Demo,
    /// Print a stored causal tree's version vector and content hash.
    Inspect {
        /// Path to a JSON-serialized `StoredCausalTree`.
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { socket } => serve(socket).await,
        Commands::Demo => demo().await,
        Commands::Inspect { path } => inspect(&path),
    }
}

async fn serve(socket_override: Option<String>) -> Result<()> {
    let config: Option<ConfigService<FsConfigStore>> = FsConfigStore::new().map(ConfigService::new).ok();

    let mut prefs: HubPrefs = config
        .as_ref()
        .and_then(|c| c.load::<HubPrefs>(HUB_PREFS_KEY).ok().flatten())
        .unwrap_or_default();

    if let Some(socket) = socket_override {
        prefs.socket_path = socket;
    }

    if let Some(cfg) = &config {
        let _ = cfg.save(HUB_PREFS_KEY, &prefs);
    }

    info!("weave hub listening at {}", prefs.socket_path);
    weave_channel::hub::run(&prefs.socket_path).await
}

/// Exercise the full local loop: two peers claim sites, emit atoms to each
/// other, and converge by exchanging stored trees — the same sequence a
/// reconnecting editor front-end would run, minus the editor.
async fn demo() -> Result<()> {
    let socket_path = std::env::temp_dir().join(format!("weave-demo-{}.sock", std::process::id()));
    let _ = std::fs::remove_file(&socket_path);
    let hub_socket = socket_path.clone();
    tokio::spawn(async move {
        if let Err(err) = weave_channel::hub::run(hub_socket).await {
            tracing::warn!(?err, "demo hub exited");
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let room = ChannelInfo {
        id: "demo-room".to_string(),
        kind: "document".to_string(),
    };

    let a = RealtimeChannel::connect(&socket_path, room.clone())
        .await
        .context("peer a failed to connect")?;
    let b = RealtimeChannel::connect(&socket_path, room)
        .await
        .context("peer b failed to connect")?;

    // a restarted peer asks the hub for the same site id it had last time,
    // rather than always proposing 1.
    let config: Option<ConfigService<FsConfigStore>> = FsConfigStore::new().map(ConfigService::new).ok();
    let proposed_a = config
        .as_ref()
        .and_then(|c| c.load::<PeerPrefs>(PEER_PREFS_KEY).ok().flatten())
        .and_then(|p| p.last_site_id)
        .unwrap_or(1);

    if !a.request_site_id(SiteInfo { id: proposed_a }).await? {
        bail!("peer a failed to claim site {proposed_a}");
    }
    if let Some(cfg) = &config {
        let _ = cfg.save(
            PEER_PREFS_KEY,
            &PeerPrefs {
                last_site_id: Some(proposed_a),
            },
        );
    }
    if b.request_site_id(SiteInfo { id: proposed_a }).await? {
        bail!("peer b was unexpectedly granted an already-claimed site");
    }
    if !b.request_site_id(SiteInfo { id: 2 }).await? {
        bail!("peer b failed to claim site 2");
    }

    let mut factory_a = AtomFactory::new(proposed_a);
    let mut factory_b = AtomFactory::new(2);
    let mut weave_a = Weave::new();
    let mut weave_b = Weave::new();

    let root = factory_a.create(b"root".to_vec(), None);
    weave_a.insert(root.clone());
    a.emit(ChannelEvent { atom: root.clone() }).await;

    let seen = recv_event(&b).await.context("peer b never saw the root atom")?;
    weave_b.insert(seen.atom);
    factory_b.update_time(root.id);

    let b_child = factory_b.create(b"hello from b".to_vec(), Some(root.id));
    weave_b.insert(b_child.clone());
    b.emit(ChannelEvent { atom: b_child.clone() }).await;

    let a_child = factory_a.create(b"hello from a".to_vec(), Some(root.id));
    weave_a.insert(a_child);

    let seen = recv_event(&a).await.context("peer a never saw b's atom")?;
    weave_a.insert(seen.atom);
    factory_a.update_time(b_child.id);

    // a reports first; the hub has nothing from b yet, so it echoes a's own tree back.
    a.exchange_weaves(weave_a.to_stored()).await?;
    // b reports and receives a's just-registered tree.
    let from_a = b.exchange_weaves(weave_b.to_stored()).await?;
    weave_b.import(from_a.weave);

    // a asks again and receives b's now-converged tree.
    let from_b = a.exchange_weaves(weave_a.to_stored()).await?;
    weave_a.import(from_b.weave);

    println!("peer a: {} atoms, hash {}", weave_a.len(), weave_a.get_version().hash);
    println!("peer b: {} atoms, hash {}", weave_b.len(), weave_b.get_version().hash);
    if weave_a.get_version().hash == weave_b.get_version().hash {
        println!("converged");
    } else {
        bail!("peers did not converge to the same hash");
    }

    let _ = std::fs::remove_file(&socket_path);
    Ok(())
}

async fn recv_event(channel: &RealtimeChannel) -> Result<ChannelEvent> {
    tokio::time::timeout(Duration::from_secs(2), channel.next_event())
        .await
        .context("timed out waiting for a peer event")?
        .context("event stream closed before the expected atom arrived")
}

fn inspect(path: &std::path::Path) -> Result<()> {
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let stored: weave_core::StoredCausalTree =
        serde_json::from_slice(&bytes).with_context(|| format!("failed to parse {} as a stored causal tree", path.display()))?;

    println!("format_version: {}", stored.format_version);
    match &stored.site {
        Some(site) => println!("site: {}", site.id),
        None => println!("site: (none)"),
    }
    println!("known_sites: {}", stored.known_sites.len());
    println!("atoms: {}", stored.weave.len());
    match &stored.version {
        Some(version) => {
            println!("hash: {}", version.hash);
            for (site, timestamp) in &version.sites {
                println!("  site {site}: max timestamp {timestamp}");
            }
        }
        None => println!("hash: (not recorded)"),
    }
    Ok(())
}
