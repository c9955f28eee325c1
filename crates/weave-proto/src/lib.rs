// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Wire schema for the weave realtime channel: request/response messages,
//! fire-and-forget events and status updates, and the framing that carries
//! them (see [`wire`]).

pub mod wire;

use serde::{Deserialize, Serialize};
use weave_core::{Atom, SiteInfo, StoredCausalTree, Version};

/// A channel's identity: which document/room it addresses and an
/// application-defined kind tag. Both fields are opaque strings — the
/// protocol relays them without interpreting them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    /// Channel/room identifier (the `<channel_id>` in `info_<channel_id>`
    /// etc.).
    pub id: String,
    /// Application-defined channel kind.
    pub kind: String,
}

/// A peer's site identity paired with its current weave version, exchanged
/// by `exchange_info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteVersionInfo {
    /// The reporting peer's site.
    pub site: SiteInfo,
    /// The reporting peer's current weave version, if it has inserted
    /// anything yet.
    pub version: Option<Version>,
}

/// A remote-originated event: an atom the peer has already applied to its
/// own weave. `events` on a joined channel yields these in the order the
/// peer applied them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelEvent {
    /// The atom the peer applied.
    pub atom: Atom,
}

/// Connection/authentication/authorization status pushed to channel
/// observers (spec.md §6).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusUpdate {
    /// Transport up/down.
    Connection {
        /// `true` once `join_channel` has been acknowledged.
        connected: bool,
    },
    /// Authentication outcome.
    Authentication {
        /// `None` while authentication has not yet been attempted.
        authenticated: Option<bool>,
        /// Authenticated principal, once known.
        user: Option<String>,
        /// Free-form informational text.
        info: Option<String>,
        /// Failure reason, when `authenticated == Some(false)`.
        reason: Option<String>,
    },
    /// Authorization outcome.
    Authorization {
        /// `None` while authorization has not yet been attempted.
        authorized: Option<bool>,
        /// Failure reason, when `authorized == Some(false)`.
        reason: Option<String>,
    },
}

/// Requests a peer can send over a channel (spec.md §6, "Channel
/// requests").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// `join_channel(info) -> {}`
    JoinChannel {
        /// The channel being joined.
        info: ChannelInfo,
    },
    /// `info_<channel_id>(SiteVersionInfo) -> SiteVersionInfo`
    ExchangeInfo {
        /// Target channel.
        channel_id: String,
        /// The requester's own site/version.
        local: SiteVersionInfo,
    },
    /// `siteId_<channel_id>(SiteInfo) -> bool`
    RequestSiteId {
        /// Target channel.
        channel_id: String,
        /// The site id the requester would like to claim.
        proposed: SiteInfo,
    },
    /// `weave_<channel_id>(StoredCausalTree) -> StoredCausalTree`
    ExchangeWeaves {
        /// Target channel.
        channel_id: String,
        /// The requester's own stored tree.
        local: StoredCausalTree,
    },
}

/// Responses matching each [`Request`] variant one-to-one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// Acknowledges `JoinChannel`.
    Joined,
    /// Answers `ExchangeInfo`.
    Info {
        /// The responder's site/version.
        remote: SiteVersionInfo,
    },
    /// Answers `RequestSiteId`.
    SiteId {
        /// `true` if the proposed id is now reserved for the requester.
        granted: bool,
    },
    /// Answers `ExchangeWeaves`.
    Weaves {
        /// The responder's stored tree.
        remote: StoredCausalTree,
    },
    /// The request could not be serviced.
    Error {
        /// Human-readable description.
        message: String,
    },
}

/// A correlation id pairing a [`Request`] with its eventual [`Response`].
pub type RequestId = u64;

/// Top-level frame carried over the wire: either half of a correlated
/// request/response pair, or a fire-and-forget event/status push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// A request awaiting a response with the same id.
    Request {
        /// Correlation id, chosen by the sender.
        id: RequestId,
        /// The request payload.
        request: Request,
    },
    /// A response to a previously-sent request.
    Response {
        /// The id of the request this answers.
        id: RequestId,
        /// The response payload.
        response: Response,
    },
    /// `event_<channel_id>` — fire-and-forget.
    Event {
        /// Target channel.
        channel_id: String,
        /// The event payload.
        event: ChannelEvent,
    },
    /// A connection/authentication/authorization status push.
    Status {
        /// The status payload.
        update: StatusUpdate,
    },
}
