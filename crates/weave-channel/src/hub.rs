// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The relay hub: a small Unix-socket server that arbitrates site ids and
//! relays `ExchangeInfo`/`ExchangeWeaves`/`Event` frames between the
//! members of a channel ("room").
//!
//! Topology is implementation-defined per spec.md §4.6; this hub models a
//! room per `channel_id`, generalizing the spec's pairwise channel to any
//! number of members. With more than two members, `exchange_info` and
//! `exchange_weaves` answer using an arbitrarily-chosen other member —
//! adequate for the reference two-peer case spec.md describes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use weave_core::{SiteInfo, StoredCausalTree};
use weave_proto::{wire, ChannelInfo, Frame, Request, RequestId, Response, SiteVersionInfo, StatusUpdate};

type ConnId = u64;
const READ_CHUNK: usize = 16 * 1024;

struct ConnState {
    tx: mpsc::Sender<Vec<u8>>,
    joined_channel: Option<String>,
}

#[derive(Default)]
struct RoomState {
    members: HashSet<ConnId>,
    claimed_sites: HashMap<u32, ConnId>,
    last_version_info: HashMap<ConnId, SiteVersionInfo>,
    last_stored_tree: HashMap<ConnId, StoredCausalTree>,
}

/// Shared hub state: every connection and every room it has seen.
#[derive(Default)]
pub struct HubState {
    next_conn_id: ConnId,
    conns: HashMap<ConnId, ConnState>,
    rooms: HashMap<String, RoomState>,
}

impl HubState {
    fn add_conn(&mut self, tx: mpsc::Sender<Vec<u8>>) -> ConnId {
        let id = self.next_conn_id;
        self.next_conn_id += 1;
        self.conns.insert(
            id,
            ConnState {
                tx,
                joined_channel: None,
            },
        );
        id
    }

    fn remove_conn(&mut self, conn_id: ConnId) {
        if let Some(conn) = self.conns.remove(&conn_id) {
            if let Some(channel_id) = conn.joined_channel {
                if let Some(room) = self.rooms.get_mut(&channel_id) {
                    room.members.remove(&conn_id);
                    room.claimed_sites.retain(|_, holder| *holder != conn_id);
                    room.last_version_info.remove(&conn_id);
                    room.last_stored_tree.remove(&conn_id);
                }
            }
        }
    }

    fn other_member(&self, channel_id: &str, conn_id: ConnId) -> Option<ConnId> {
        self.rooms
            .get(channel_id)?
            .members
            .iter()
            .copied()
            .find(|&id| id != conn_id)
    }
}

/// Bind `socket_path` and serve connections until the process is asked to
/// stop. Removes a stale socket file at the same path, if any (matching
/// the teacher's hub skeleton).
pub async fn run(socket_path: impl AsRef<std::path::Path>) -> Result<()> {
    let socket_path = socket_path.as_ref();
    let hub = Arc::new(Mutex::new(HubState::default()));

    let _ = std::fs::remove_file(socket_path);
    let listener = UnixListener::bind(socket_path)?;
    info!(path = %socket_path.display(), "weave hub listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let hub = hub.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_client(stream, hub).await {
                warn!(?err, "client handler error");
            }
        });
    }
}

async fn handle_client(stream: UnixStream, hub: Arc<Mutex<HubState>>) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(256);
    let conn_id = hub.lock().await.add_conn(tx);

    tokio::spawn(async move {
        while let Some(buf) = rx.recv().await {
            if writer.write_all(&buf).await.is_err() {
                break;
            }
        }
    });

    let mut chunk = vec![0_u8; READ_CHUNK];
    let mut acc: Vec<u8> = Vec::with_capacity(READ_CHUNK);

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        acc.extend_from_slice(&chunk[..n]);

        loop {
            match wire::decode(&acc) {
                Ok((frame, used)) => {
                    acc.drain(..used);
                    if let Err(err) = handle_frame(frame, conn_id, &hub).await {
                        warn!(?err, conn_id, "dropping connection after protocol error");
                        hub.lock().await.remove_conn(conn_id);
                        return Ok(());
                    }
                }
                Err(wire::WireError::IncompleteLength | wire::WireError::IncompleteBody) => break,
                Err(err) => {
                    warn!(?err, conn_id, "malformed frame, dropping connection");
                    hub.lock().await.remove_conn(conn_id);
                    return Ok(());
                }
            }
        }
    }

    hub.lock().await.remove_conn(conn_id);
    Ok(())
}

/// Handle one inbound frame from `conn_id`. Exposed so it can be
/// exercised directly in tests without a real socket.
pub async fn handle_frame(frame: Frame, conn_id: ConnId, hub: &Arc<Mutex<HubState>>) -> Result<()> {
    match frame {
        Frame::Request { id, request } => handle_request(id, request, conn_id, hub).await,
        Frame::Event { channel_id, event } => {
            relay_event(&channel_id, event, conn_id, hub).await;
            Ok(())
        }
        Frame::Response { .. } | Frame::Status { .. } => {
            Err(anyhow!("hub does not accept Response/Status frames from clients"))
        }
    }
}

async fn handle_request(id: RequestId, request: Request, conn_id: ConnId, hub: &Arc<Mutex<HubState>>) -> Result<()> {
    let (response, extra): (Response, Vec<(ConnId, Frame)>) = {
        let mut h = hub.lock().await;
        match request {
            Request::JoinChannel { info } => join_channel(&mut h, conn_id, info),
            Request::ExchangeInfo { channel_id, local } => exchange_info(&mut h, conn_id, &channel_id, local),
            Request::RequestSiteId { channel_id, proposed } => {
                request_site_id(&mut h, conn_id, &channel_id, proposed)
            }
            Request::ExchangeWeaves { channel_id, local } => {
                exchange_weaves(&mut h, conn_id, &channel_id, local)
            }
        }
    };

    send_to(hub, conn_id, Frame::Response { id, response }).await;
    for (target, frame) in extra {
        send_to(hub, target, frame).await;
    }
    Ok(())
}

fn join_channel(hub: &mut HubState, conn_id: ConnId, info: ChannelInfo) -> (Response, Vec<(ConnId, Frame)>) {
    let room = hub.rooms.entry(info.id.clone()).or_default();
    room.members.insert(conn_id);
    if let Some(conn) = hub.conns.get_mut(&conn_id) {
        conn.joined_channel = Some(info.id);
    }
    let status_pushes = vec![
        (
            conn_id,
            Frame::Status {
                update: StatusUpdate::Authentication {
                    authenticated: Some(true),
                    user: None,
                    info: None,
                    reason: None,
                },
            },
        ),
        (
            conn_id,
            Frame::Status {
                update: StatusUpdate::Authorization {
                    authorized: Some(true),
                    reason: None,
                },
            },
        ),
    ];
    (Response::Joined, status_pushes)
}

fn exchange_info(
    hub: &mut HubState,
    conn_id: ConnId,
    channel_id: &str,
    local: SiteVersionInfo,
) -> (Response, Vec<(ConnId, Frame)>) {
    let other = hub.other_member(channel_id, conn_id);
    let room = hub.rooms.entry(channel_id.to_string()).or_default();
    room.last_version_info.insert(conn_id, local.clone());

    let remote = other
        .and_then(|id| room.last_version_info.get(&id).cloned())
        .unwrap_or(SiteVersionInfo {
            site: local.site,
            version: None,
        });
    (Response::Info { remote }, Vec::new())
}

fn request_site_id(
    hub: &mut HubState,
    conn_id: ConnId,
    channel_id: &str,
    proposed: SiteInfo,
) -> (Response, Vec<(ConnId, Frame)>) {
    let room = hub.rooms.entry(channel_id.to_string()).or_default();
    let granted = match room.claimed_sites.get(&proposed.id) {
        Some(&holder) if holder == conn_id => true,
        Some(_) => false,
        None => {
            room.claimed_sites.insert(proposed.id, conn_id);
            true
        }
    };
    (Response::SiteId { granted }, Vec::new())
}

fn exchange_weaves(
    hub: &mut HubState,
    conn_id: ConnId,
    channel_id: &str,
    local: StoredCausalTree,
) -> (Response, Vec<(ConnId, Frame)>) {
    let other = hub.other_member(channel_id, conn_id);
    let room = hub.rooms.entry(channel_id.to_string()).or_default();
    room.last_stored_tree.insert(conn_id, local.clone());

    let remote = other
        .and_then(|id| room.last_stored_tree.get(&id).cloned())
        .unwrap_or(local);
    (Response::Weaves { remote }, Vec::new())
}

async fn relay_event(channel_id: &str, event: weave_proto::ChannelEvent, conn_id: ConnId, hub: &Arc<Mutex<HubState>>) {
    let targets: Vec<ConnId> = {
        let h = hub.lock().await;
        h.rooms
            .get(channel_id)
            .map(|room| room.members.iter().copied().filter(|&id| id != conn_id).collect())
            .unwrap_or_default()
    };
    for target in targets {
        send_to(
            hub,
            target,
            Frame::Event {
                channel_id: channel_id.to_string(),
                event: event.clone(),
            },
        )
        .await;
    }
}

async fn send_to(hub: &Arc<Mutex<HubState>>, conn_id: ConnId, frame: Frame) {
    let tx = {
        let h = hub.lock().await;
        h.conns.get(&conn_id).map(|c| c.tx.clone())
    };
    let Some(tx) = tx else { return };
    if let Ok(bytes) = wire::encode(&frame) {
        let _ = tx.send(bytes).await;
    }
}
