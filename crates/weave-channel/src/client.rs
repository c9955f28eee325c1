// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! `RealtimeChannel`: the client half of the channel protocol.
//!
//! One `RealtimeChannel` owns one transport connection (spec.md §5: "the
//! only shared resource is the transport socket, owned by the channel").
//! It never touches a `Weave` directly — callers import/export stored
//! trees themselves, preserving the single-owner-task rule.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, Mutex};

use weave_proto::{
    wire, ChannelEvent, ChannelInfo, Request, RequestId, Response, SiteVersionInfo, StatusUpdate,
};
use weave_core::StoredCausalTree;

use crate::error::ChannelError;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const READ_CHUNK: usize = 16 * 1024;

/// The channel's connection state (spec.md §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// No live transport.
    Disconnected,
    /// Transport is up but `join_channel` has not yet been acknowledged.
    Connected,
    /// `join_channel` acknowledged; `events`/`emit` are meaningful.
    Joined,
}

struct Inner {
    info: ChannelInfo,
    socket_path: PathBuf,
    outbox: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    pending: Mutex<HashMap<RequestId, oneshot::Sender<Response>>>,
    next_id: AtomicU64,
    events_tx: mpsc::Sender<ChannelEvent>,
    events_rx: Mutex<mpsc::Receiver<ChannelEvent>>,
    status_tx: mpsc::Sender<StatusUpdate>,
    status_rx: Mutex<mpsc::Receiver<StatusUpdate>>,
    state: Mutex<ChannelState>,
}

/// The result of a `reconnect`: the peer's reported version, and —
/// only when the two versions differ — the peer's stored tree for the
/// caller to `import`.
#[derive(Debug, Clone)]
pub struct ReconnectOutcome {
    /// The peer's site and version as of the reconnect.
    pub remote: SiteVersionInfo,
    /// Present only when `remote.version` differed from the version the
    /// caller passed in.
    pub remote_tree: Option<StoredCausalTree>,
}

/// A realtime channel to one peer over a Unix domain socket.
pub struct RealtimeChannel {
    inner: Arc<Inner>,
}

impl RealtimeChannel {
    /// Dial `socket_path` and join `info`. Blocks (asynchronously) until
    /// the hub acknowledges `join_channel`.
    pub async fn connect(socket_path: impl AsRef<Path>, info: ChannelInfo) -> Result<Self, ChannelError> {
        let (events_tx, events_rx) = mpsc::channel(256);
        let (status_tx, status_rx) = mpsc::channel(64);
        let inner = Arc::new(Inner {
            info,
            socket_path: socket_path.as_ref().to_path_buf(),
            outbox: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            events_tx,
            events_rx: Mutex::new(events_rx),
            status_tx,
            status_rx: Mutex::new(status_rx),
            state: Mutex::new(ChannelState::Disconnected),
        });

        let channel = Self { inner };
        dial(&channel.inner).await?;
        *channel.inner.state.lock().await = ChannelState::Connected;
        channel.join().await?;
        Ok(channel)
    }

    /// This channel's identity.
    #[must_use]
    pub fn info(&self) -> &ChannelInfo {
        &self.inner.info
    }

    /// Current connection state.
    pub async fn state(&self) -> ChannelState {
        *self.inner.state.lock().await
    }

    /// `exchange_info(local_version) -> remote_version` (spec.md §4.6).
    pub async fn exchange_info(&self, local: SiteVersionInfo) -> Result<SiteVersionInfo, ChannelError> {
        let response = self
            .send_request(Request::ExchangeInfo {
                channel_id: self.inner.info.id.clone(),
                local,
            })
            .await?;
        match response {
            Response::Info { remote } => Ok(remote),
            Response::Error { message } => Err(ChannelError::Protocol(message)),
            _ => Err(ChannelError::Protocol("unexpected response to exchange_info".into())),
        }
    }

    /// `request_site_id(proposed_site) -> granted` (spec.md §4.6).
    pub async fn request_site_id(&self, proposed: weave_core::SiteInfo) -> Result<bool, ChannelError> {
        let response = self
            .send_request(Request::RequestSiteId {
                channel_id: self.inner.info.id.clone(),
                proposed,
            })
            .await?;
        match response {
            Response::SiteId { granted } => Ok(granted),
            Response::Error { message } => Err(ChannelError::Protocol(message)),
            _ => Err(ChannelError::Protocol("unexpected response to request_site_id".into())),
        }
    }

    /// `exchange_weaves(local_stored_tree) -> remote_stored_tree` (spec.md §4.6).
    pub async fn exchange_weaves(&self, local: StoredCausalTree) -> Result<StoredCausalTree, ChannelError> {
        let response = self
            .send_request(Request::ExchangeWeaves {
                channel_id: self.inner.info.id.clone(),
                local,
            })
            .await?;
        match response {
            Response::Weaves { remote } => Ok(remote),
            Response::Error { message } => Err(ChannelError::Protocol(message)),
            _ => Err(ChannelError::Protocol("unexpected response to exchange_weaves".into())),
        }
    }

    /// Send a local event to the peer. While disconnected, the emission
    /// is dropped — the peer will reconcile on reconnect (spec.md §4.6).
    pub async fn emit(&self, event: ChannelEvent) {
        let Some(outbox) = self.inner.outbox.lock().await.clone() else {
            return;
        };
        let frame = weave_proto::Frame::Event {
            channel_id: self.inner.info.id.clone(),
            event,
        };
        if let Ok(bytes) = wire::encode(&frame) {
            let _ = outbox.send(bytes).await;
        }
    }

    /// Await the next remote-originated event. Only meaningful once
    /// `state() == Joined` (spec.md §4.6: "`Joined` is the only state
    /// from which `events` flow").
    pub async fn next_event(&self) -> Option<ChannelEvent> {
        self.inner.events_rx.lock().await.recv().await
    }

    /// Await the next connection/authentication/authorization status push.
    pub async fn next_status(&self) -> Option<StatusUpdate> {
        self.inner.status_rx.lock().await.recv().await
    }

    /// Re-dial, re-join, and reconcile with the peer (spec.md §4.6,
    /// "Reconnection protocol"): re-join, `exchange_info`, and if versions
    /// differ, `exchange_weaves`. The caller is responsible for importing
    /// `remote_tree` into its own weave — this never touches a `Weave`.
    pub async fn reconnect(
        &self,
        local_version: SiteVersionInfo,
        local_tree: &StoredCausalTree,
    ) -> Result<ReconnectOutcome, ChannelError> {
        dial(&self.inner).await?;
        *self.inner.state.lock().await = ChannelState::Connected;
        self.join().await?;

        let remote = self.exchange_info(local_version.clone()).await?;
        let remote_tree = if remote.version != local_version.version {
            Some(self.exchange_weaves(local_tree.clone()).await?)
        } else {
            None
        };
        Ok(ReconnectOutcome { remote, remote_tree })
    }

    async fn join(&self) -> Result<(), ChannelError> {
        let response = self
            .send_request(Request::JoinChannel {
                info: self.inner.info.clone(),
            })
            .await?;
        match response {
            Response::Joined => {
                *self.inner.state.lock().await = ChannelState::Joined;
                let _ = self
                    .inner
                    .status_tx
                    .send(StatusUpdate::Connection { connected: true })
                    .await;
                Ok(())
            }
            Response::Error { message } => Err(ChannelError::Protocol(message)),
            _ => Err(ChannelError::Protocol("unexpected response to join_channel".into())),
        }
    }

    async fn send_request(&self, request: Request) -> Result<Response, ChannelError> {
        let outbox = self
            .inner
            .outbox
            .lock()
            .await
            .clone()
            .ok_or(ChannelError::Disconnected)?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(id, tx);

        let frame = weave_proto::Frame::Request { id, request };
        let bytes = wire::encode(&frame).map_err(|e| ChannelError::Protocol(e.to_string()))?;
        if outbox.send(bytes).await.is_err() {
            self.inner.pending.lock().await.remove(&id);
            return Err(ChannelError::Disconnected);
        }

        match tokio::time::timeout(DEFAULT_REQUEST_TIMEOUT, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ChannelError::Disconnected),
            Err(_) => {
                self.inner.pending.lock().await.remove(&id);
                Err(ChannelError::Timeout)
            }
        }
    }
}

async fn dial(inner: &Arc<Inner>) -> Result<(), ChannelError> {
    let stream = UnixStream::connect(&inner.socket_path).await?;
    let (reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::channel::<Vec<u8>>(256);
    *inner.outbox.lock().await = Some(tx);
    tokio::spawn(write_loop(writer, rx));
    tokio::spawn(read_loop(reader, inner.clone()));
    Ok(())
}

async fn write_loop(mut writer: tokio::net::unix::OwnedWriteHalf, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(buf) = rx.recv().await {
        if writer.write_all(&buf).await.is_err() {
            break;
        }
    }
}

async fn read_loop(mut reader: tokio::net::unix::OwnedReadHalf, inner: Arc<Inner>) {
    let mut chunk = vec![0_u8; READ_CHUNK];
    let mut acc: Vec<u8> = Vec::with_capacity(READ_CHUNK);

    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => acc.extend_from_slice(&chunk[..n]),
        }

        loop {
            match wire::decode(&acc) {
                Ok((frame, used)) => {
                    acc.drain(..used);
                    dispatch(frame, &inner).await;
                }
                Err(wire::WireError::IncompleteLength | wire::WireError::IncompleteBody) => break,
                Err(_) => {
                    tracing::warn!("channel {} received a malformed frame; dropping buffer", inner.info.id);
                    acc.clear();
                    break;
                }
            }
        }
    }

    mark_disconnected(&inner).await;
}

async fn dispatch(frame: weave_proto::Frame, inner: &Arc<Inner>) {
    match frame {
        weave_proto::Frame::Response { id, response } => {
            if let Some(tx) = inner.pending.lock().await.remove(&id) {
                let _ = tx.send(response);
            }
        }
        weave_proto::Frame::Event { channel_id, event } => {
            if channel_id == inner.info.id {
                let _ = inner.events_tx.send(event).await;
            }
        }
        weave_proto::Frame::Status { update } => {
            let _ = inner.status_tx.send(update).await;
        }
        weave_proto::Frame::Request { .. } => {
            tracing::warn!("channel {} received an unexpected Request frame from the hub", inner.info.id);
        }
    }
}

async fn mark_disconnected(inner: &Arc<Inner>) {
    *inner.outbox.lock().await = None;
    *inner.state.lock().await = ChannelState::Disconnected;
    let _ = inner
        .status_tx
        .send(StatusUpdate::Connection { connected: false })
        .await;
    inner.pending.lock().await.clear();
}
