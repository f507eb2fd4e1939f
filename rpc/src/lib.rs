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

//! RPC API of a lightning node as seen by a client: the wire data model, request and reply
//! messages, server failures and the ZMQ transport with its notification subscriptions.

#[macro_use]
extern crate amplify;
#[macro_use]
extern crate log;
#[macro_use]
extern crate serde_crate as serde;
#[macro_use]
extern crate serde_with;

mod client;
pub mod error;
mod messages;
pub mod model;
mod subscription;
mod topic;

pub use client::{Client, ClientConfig, Transport};
pub use error::{Error, Failure, FailureCode, FailureContext, FailureReason};
pub use messages::{
    CreateHoldInvoice, CreateInvoice, GetInvoices, PaymentSent, Request, RpcMsg, SendToRoute,
    VerifyBackup, VerifyBackups,
};
pub use model::{
    BackupVerification, Channel, ChannelBackup, ChannelPoint, Forward, ForwardState, GraphNode,
    Hop, Invoice, InvoiceState, MultiBackup, NetworkGraph, NodeInfo, Payment, PaymentSecret,
    PaymentState, PaymentStatus, Policy, Preimage, Route, ShortChannelId,
};
pub use subscription::{Event, EventPayload, Subscription, SubscriptionFeed};
pub use topic::Topic;

/// Default endpoint of the node request/reply socket
pub const LN_NODE_RPC_ENDPOINT: &str = "tcp://127.0.0.1:62962";

/// Default endpoint of the node notification publisher socket
pub const LN_NODE_PUB_ENDPOINT: &str = "tcp://127.0.0.1:62963";
