// LNP Node: node running lightning network protocol and generalized lightning
// channels.
// Written in 2020-2022 by
//     Dr. Maxim Orlovsky <orlovsky@pandoracore.com>
//
// To the extent possible under law, the author(s) have dedicated all
// copyright and related and neighboring rights to this software to
// the public domain worldwide. This software is distributed without
// any warranty.
//
// You should have received a copy of the MIT License
// along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

#![recursion_limit = "256"]
// Coding conventions
#![deny(
    non_upper_case_globals,
    non_camel_case_types,
    non_snake_case,
    unused_mut,
    // unused_imports,
    // dead_code
    // missing_docs,
)]

//! Client core of a lightning node: route construction and pathfinding, payments over routes
//! and BOLT-11 requests, hold invoice lifecycle, forwarding reputation, streams of forwarded
//! HTLCs and static channel backup verification. The node itself is reached through
//! [`ln_rpc::Transport`].

#[macro_use]
extern crate amplify;
extern crate strict_encoding;
#[macro_use]
extern crate log;
#[macro_use]
extern crate serde_crate as serde;
#[macro_use]
extern crate serde_with;

#[macro_use]
mod macros;

pub mod automata;
pub mod backup;
mod config;
mod error;
mod forward;
pub mod invoice;
pub mod payment;
pub mod reputation;
pub mod route;
mod session;

pub use backup::BackupVerifier;
pub use config::{Config, ConfigError, PaymentConfig};
pub use error::{Error, RoutingFailure};
pub use forward::ForwardUpdates;
pub use invoice::{InvoiceManager, InvoiceOptions, InvoiceUpdates};
pub use ln_rpc as rpc;
pub use ln_rpc::BackupVerification;
pub use payment::{
    FeeEstimate, PayOptions, PaymentEngine, PaymentEvent, PaymentSuccess, ProbeOptions,
};
pub use reputation::{Confidence, ReputationStore, Settings as PathfindingSettings, SettingsUpdate};
pub use session::Session;

/// Confidence values are expressed in parts per million
pub const CONFIDENCE_PPM: u64 = 1_000_000;
