// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Shared application services for weave tools: a storage-agnostic config
//! service plus the preference blobs the CLI persists through it.

pub mod config;
pub mod prefs;
