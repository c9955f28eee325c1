// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Channel-level errors (spec.md §7: transport disconnect and timeout are
//! the only error *kinds* a channel operation can fail with).

/// Failure of a single channel operation.
///
/// Per spec.md §7, all of these are reported as values — nothing here
/// unwinds. `insert`/`import` rejections are a `weave-core` concern and
/// never surface as a `ChannelError`.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The channel's transport is not currently connected.
    #[error("channel is disconnected")]
    Disconnected,
    /// The underlying socket returned an I/O error.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// A frame violated the wire protocol (bad encoding, unexpected
    /// response kind).
    #[error("protocol error: {0}")]
    Protocol(String),
    /// A request was sent but no response arrived in time.
    #[error("request timed out")]
    Timeout,
}
