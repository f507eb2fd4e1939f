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

use std::fmt::{self, Display, Formatter};

use bitcoin::hashes::sha256;
use chrono::{DateTime, Utc};
use serde_with::DisplayFromStr;

use crate::model::hex_bytes;
use crate::{
    BackupVerification, Channel, ChannelBackup, ChannelPoint, Failure, Invoice, MultiBackup,
    NetworkGraph, NodeInfo, PaymentStatus, Preimage, Route, ShortChannelId,
};

/// Envelope of every request sent to the node
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[derive(Serialize, Deserialize)]
#[serde(crate = "serde_crate")]
#[display("{call}")]
pub struct Request {
    /// Hex-encoded credentials
    pub macaroon: String,

    pub call: RpcMsg,
}

/// RPC API requests to the node and its replies.
#[derive(Clone, PartialEq, Eq, Debug, Display, From)]
#[derive(Serialize, Deserialize)]
#[serde(crate = "serde_crate", tag = "method", content = "params", rename_all = "snake_case")]
#[non_exhaustive]
pub enum RpcMsg {
    #[display("get_info()")]
    GetInfo,

    // Graph API
    // ---------
    #[display("get_channel({0})")]
    GetChannel(ShortChannelId),

    #[display("get_network_graph()")]
    GetNetworkGraph,

    // Invoice API
    // -----------
    #[display("create_invoice({0})")]
    #[from]
    CreateInvoice(CreateInvoice),

    #[display("create_hold_invoice({0})")]
    #[from]
    CreateHoldInvoice(CreateHoldInvoice),

    #[display("get_invoice({0})")]
    GetInvoice(sha256::Hash),

    #[display("get_invoices({0})")]
    #[from]
    GetInvoices(GetInvoices),

    /// Reveals the preimage of a held HTLC, settling it
    #[display("settle_hold_invoice(...)")]
    SettleHoldInvoice(Preimage),

    #[display("cancel_hold_invoice({0})")]
    CancelHoldInvoice(sha256::Hash),

    // Payment API
    // -----------
    /// Offers an HTLC along a fixed route
    #[display("send_to_route({0})")]
    #[from]
    SendToRoute(SendToRoute),

    /// Looks up the outcome of an HTLC the node has sent
    #[display("get_payment_status({0})")]
    GetPaymentStatus(sha256::Hash),

    // Backup API
    // ----------
    #[display("get_backup({0})")]
    GetBackup(ChannelPoint),

    #[display("get_backups()")]
    GetBackups,

    #[display("verify_backup({0})")]
    #[from]
    VerifyBackup(VerifyBackup),

    #[display("verify_backups({0})")]
    #[from]
    VerifyBackups(VerifyBackups),

    // Replies
    // -------
    #[display("success()")]
    Success,

    #[display("failure({0:#})")]
    #[from]
    Failure(Failure),

    #[display("node_info({0})", alt = "{0:#}")]
    #[from]
    NodeInfo(NodeInfo),

    #[display("channel({0})", alt = "{0:#}")]
    #[from]
    Channel(Channel),

    #[display("network_graph({0})")]
    #[from]
    NetworkGraph(NetworkGraph),

    #[display("invoice({0})", alt = "{0:#}")]
    #[from]
    Invoice(Invoice),

    #[display("invoices(...)")]
    #[from]
    Invoices(Vec<Invoice>),

    #[display("payment_sent({0})")]
    #[from]
    PaymentSent(PaymentSent),

    #[display("payment_status({0})")]
    #[from]
    PaymentStatus(PaymentStatus),

    #[display("backup({0})")]
    #[from]
    Backup(ChannelBackup),

    #[display("backups({0})")]
    #[from]
    Backups(MultiBackup),

    #[display("backup_verification({0})")]
    #[from]
    BackupVerification(BackupVerification),
}

impl RpcMsg {
    /// Short method name used in logs and errors
    pub fn method(&self) -> String {
        let display = self.to_string();
        display.split('(').next().map(str::to_owned).unwrap_or(display)
    }
}

#[serde_as]
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[derive(Serialize, Deserialize)]
#[serde(crate = "serde_crate")]
#[display("{mtokens} mtokens, ...")]
pub struct CreateInvoice {
    #[serde_as(as = "DisplayFromStr")]
    pub mtokens: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cltv_delta: Option<u16>,

    /// Preimage to use instead of a node-generated one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<Preimage>,
}

#[serde_as]
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[derive(Serialize, Deserialize)]
#[serde(crate = "serde_crate")]
#[display("{id}, {mtokens} mtokens, ...")]
pub struct CreateHoldInvoice {
    /// Payment hash chosen by the caller, who keeps the preimage
    pub id: sha256::Hash,

    #[serde_as(as = "DisplayFromStr")]
    pub mtokens: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cltv_delta: Option<u16>,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, Default, Display)]
#[derive(Serialize, Deserialize)]
#[serde(crate = "serde_crate")]
#[display(Debug)]
pub struct GetInvoices {
    /// Only return invoices whose creation index is above the given one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added_after: Option<u64>,
}

#[derive(Clone, PartialEq, Eq, Debug)]
#[derive(Serialize, Deserialize)]
#[serde(crate = "serde_crate")]
pub struct SendToRoute {
    /// Payment hash locking the HTLC
    pub id: sha256::Hash,

    pub route: Route,
}

#[derive(Clone, PartialEq, Eq, Debug)]
#[derive(Serialize, Deserialize)]
#[serde(crate = "serde_crate")]
pub struct PaymentSent {
    /// Preimage revealed by the destination
    pub secret: Preimage,

    pub route: Route,
}

/// Backup blob which must cover exactly one channel
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[derive(Serialize, Deserialize)]
#[serde(crate = "serde_crate")]
#[display("{channel}")]
pub struct VerifyBackup {
    #[serde(with = "hex_bytes")]
    pub backup: Vec<u8>,

    pub channel: ChannelPoint,
}

/// Backup blob which must cover exactly the given set of channels
#[derive(Clone, PartialEq, Eq, Debug)]
#[derive(Serialize, Deserialize)]
#[serde(crate = "serde_crate")]
pub struct VerifyBackups {
    #[serde(with = "hex_bytes")]
    pub backup: Vec<u8>,

    pub channels: Vec<ChannelPoint>,
}

impl Display for VerifyBackups {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} channels", self.channels.len())
    }
}

impl Display for SendToRoute {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {} mtokens over {} hops", self.id, self.route.mtokens, self.route.hops.len())
    }
}

impl Display for PaymentSent {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} mtokens with {} mtokens fee", self.route.mtokens, self.route.fee_mtokens)
    }
}
