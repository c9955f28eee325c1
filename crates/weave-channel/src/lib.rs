// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Realtime channel transport for weave peers: the `RealtimeChannel`
//! client and a small relay hub, built on Unix domain sockets and the
//! `weave-proto` wire schema.

pub mod client;
pub mod error;
pub mod hub;

pub use client::{ChannelState, ReconnectOutcome, RealtimeChannel};
pub use error::ChannelError;
