// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Preference blobs persisted through `ConfigService`.

use serde::{Deserialize, Serialize};

/// Config key under which [`HubPrefs`] is stored.
pub const HUB_PREFS_KEY: &str = "hub";
/// Config key under which [`PeerPrefs`] is stored.
pub const PEER_PREFS_KEY: &str = "peer";

/// Preferences for a running hub (`weave-cli serve`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HubPrefs {
    /// Unix socket path the hub binds to.
    pub socket_path: String,
}

impl Default for HubPrefs {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
        }
    }
}

/// Preferences for a peer (`weave-cli demo`/future editor front-ends).
///
/// Remembering the last granted site id lets a restarted peer ask the hub
/// for the same id back, rather than allocating a new one every run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerPrefs {
    /// The site id this peer last had granted, if any.
    pub last_site_id: Option<u32>,
}

/// Default Unix socket path for the weave hub: prefers a per-user runtime
/// directory, falling back to `/tmp`.
#[must_use]
pub fn default_socket_path() -> String {
    std::env::var_os("XDG_RUNTIME_DIR")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| std::path::PathBuf::from("/tmp"))
        .join("weave-hub.sock")
        .display()
        .to_string()
}
