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

//! Records exchanged with the node. Millitoken amounts travel as decimal strings, identifiers
//! as lowercase hex and timestamps as RFC 3339 strings.

use std::fmt::{self, Display, Formatter};
use std::num::ParseIntError;
use std::str::FromStr;

use amplify::hex::{self, FromHex, ToHex};
use amplify::ToYamlString;
use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::PublicKey;
use bitcoin::Txid;
use chrono::{DateTime, Utc};
use serde_with::DisplayFromStr;

use crate::Failure;

/// Number of millitokens in a token
pub const MTOKENS_PER_TOKEN: u64 = 1000;

/// Errors parsing a [`ShortChannelId`] from its `BLOCKxTXxVOUT` form
#[derive(Clone, PartialEq, Eq, Debug, Display, From, Error)]
#[display(doc_comments)]
pub enum ShortChannelIdError {
    /// short channel id must have exactly three `x`-separated components
    WrongComponentCount,

    /// invalid short channel id component: {0}
    #[from]
    InvalidComponent(ParseIntError),

    /// short channel id component exceeds its bit size
    Overflow,
}

/// Channel identifier derived from the location of its funding output in the chain
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default, Display)]
#[display("{block_height}x{block_index}x{output_index}")]
pub struct ShortChannelId {
    pub block_height: u32,
    pub block_index: u32,
    pub output_index: u16,
}

impl ShortChannelId {
    pub fn new(block_height: u32, block_index: u32, output_index: u16) -> Self {
        ShortChannelId { block_height, block_index, output_index }
    }
}

impl FromStr for ShortChannelId {
    type Err = ShortChannelIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut split = s.split('x');
        match (split.next(), split.next(), split.next(), split.next()) {
            (Some(height), Some(index), Some(vout), None) => {
                let block_height = height.parse::<u32>()?;
                let block_index = index.parse::<u32>()?;
                if block_height >= 1 << 24 || block_index >= 1 << 24 {
                    return Err(ShortChannelIdError::Overflow);
                }
                Ok(ShortChannelId { block_height, block_index, output_index: vout.parse()? })
            }
            _ => Err(ShortChannelIdError::WrongComponentCount),
        }
    }
}

impl From<ShortChannelId> for u64 {
    fn from(id: ShortChannelId) -> Self {
        (id.block_height as u64) << 40 | (id.block_index as u64) << 16 | id.output_index as u64
    }
}

impl From<u64> for ShortChannelId {
    fn from(id: u64) -> Self {
        ShortChannelId {
            block_height: (id >> 40) as u32 & 0xFF_FFFF,
            block_index: (id >> 16) as u32 & 0xFF_FFFF,
            output_index: id as u16,
        }
    }
}

impl serde::Serialize for ShortChannelId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for ShortChannelId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        ShortChannelId::from_str(&s).map_err(serde::de::Error::custom)
    }
}

macro_rules! hex_secret {
    ($(#[$attr:meta])* $name:ident) => {
        $(#[$attr])*
        #[derive(Wrapper, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, From)]
        pub struct $name([u8; 32]);

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result { f.write_str(&self.0.to_hex()) }
        }

        impl FromStr for $name {
            type Err = hex::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let vec = Vec::<u8>::from_hex(s)?;
                if vec.len() != 32 {
                    return Err(hex::Error::InvalidLength(32, vec.len()));
                }
                let mut inner = [0u8; 32];
                inner.copy_from_slice(&vec);
                Ok($name(inner))
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.collect_str(self)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = <String as serde::Deserialize>::deserialize(deserializer)?;
                $name::from_str(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

hex_secret!(
    /// Payment preimage revealed by the payee on settlement
    Preimage
);

hex_secret!(
    /// Payment secret (payment address) included in the final hop onion
    PaymentSecret
);

impl Preimage {
    /// Generates a random preimage
    pub fn random() -> Preimage {
        use bitcoin::secp256k1::rand;
        Preimage(rand::random())
    }

    /// Hash the preimage commits to; this is the payment or invoice id
    pub fn payment_hash(&self) -> sha256::Hash { sha256::Hash::hash(&self.0) }
}

/// Serde helper for binary blobs transferred as hex strings
pub mod hex_bytes {
    use amplify::hex::{FromHex, ToHex};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&data.to_hex())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        Vec::<u8>::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Funding outpoint of a channel
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
#[derive(Serialize, Deserialize)]
#[serde(crate = "serde_crate")]
#[display("{transaction_id}:{transaction_vout}")]
pub struct ChannelPoint {
    pub transaction_id: Txid,
    pub transaction_vout: u32,
}

/// One side's forwarding policy for a channel
#[serde_as]
#[derive(Clone, PartialEq, Eq, Hash, Debug, Display)]
#[derive(Serialize, Deserialize)]
#[serde(crate = "serde_crate")]
#[display(Policy::to_yaml_string)]
pub struct Policy {
    /// Node which owns (and enforces) the policy
    pub public_key: PublicKey,

    #[serde_as(as = "DisplayFromStr")]
    pub base_fee_mtokens: u64,

    /// Proportional fee in parts per million
    pub fee_rate: u64,

    pub cltv_delta: u16,

    #[serde_as(as = "DisplayFromStr")]
    #[serde(default)]
    pub min_htlc_mtokens: u64,

    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default)]
    pub max_htlc_mtokens: Option<u64>,

    #[serde(default)]
    pub is_disabled: bool,

    /// Discount on the base fee the owner grants to HTLCs it receives over this channel
    #[serde_as(as = "DisplayFromStr")]
    #[serde(default)]
    pub inbound_base_discount_mtokens: u64,

    /// Discount on the proportional fee (ppm) for HTLCs received over this channel
    #[serde(default)]
    pub inbound_rate_discount: u64,

    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Policy {
    /// Fee the owner charges for forwarding `mtokens` out of the channel, rounded down
    pub fn forwarding_fee(&self, mtokens: u64) -> u64 {
        self.base_fee_mtokens
            .saturating_add((mtokens as u128 * self.fee_rate as u128 / 1_000_000) as u64)
    }

    /// Discount the owner grants for receiving an HTLC of `mtokens` over the channel
    pub fn inbound_discount(&self, mtokens: u64) -> u64 {
        self.inbound_base_discount_mtokens.saturating_add(
            (mtokens as u128 * self.inbound_rate_discount as u128 / 1_000_000) as u64,
        )
    }

    /// Checks whether the policy lets an HTLC of `mtokens` through
    pub fn admits(&self, mtokens: u64) -> bool {
        !self.is_disabled
            && mtokens >= self.min_htlc_mtokens
            && self.max_htlc_mtokens.map(|max| mtokens <= max).unwrap_or(true)
    }
}

/// Public channel as seen in the network graph
#[derive(Clone, PartialEq, Eq, Hash, Debug, Display)]
#[derive(Serialize, Deserialize)]
#[serde(crate = "serde_crate")]
#[display(Channel::to_yaml_string)]
pub struct Channel {
    pub id: ShortChannelId,

    /// Channel capacity in tokens
    pub capacity: u64,

    pub transaction_id: Txid,

    pub transaction_vout: u32,

    /// Policies of both channel sides
    pub policies: Vec<Policy>,

    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Channel {
    /// A channel is only usable when both of its sides published a policy
    #[inline]
    pub fn is_valid(&self) -> bool { self.policies.len() == 2 }

    #[inline]
    pub fn capacity_mtokens(&self) -> u64 { self.capacity.saturating_mul(MTOKENS_PER_TOKEN) }

    pub fn channel_point(&self) -> ChannelPoint {
        ChannelPoint {
            transaction_id: self.transaction_id,
            transaction_vout: self.transaction_vout,
        }
    }

    /// Policy published by the given node
    pub fn policy_of(&self, node: &PublicKey) -> Option<&Policy> {
        self.policies.iter().find(|policy| &policy.public_key == node)
    }

    /// The other side of the channel
    pub fn counterparty(&self, node: &PublicKey) -> Option<PublicKey> {
        if self.policy_of(node).is_none() {
            return None;
        }
        self.policies.iter().map(|policy| policy.public_key).find(|key| key != node)
    }
}

/// Node announcement from the network graph
#[derive(Clone, PartialEq, Eq, Hash, Debug, Display)]
#[derive(Serialize, Deserialize)]
#[serde(crate = "serde_crate")]
#[display("{public_key} {alias}")]
pub struct GraphNode {
    pub public_key: PublicKey,

    #[serde(default)]
    pub alias: String,

    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Clone, PartialEq, Eq, Debug, Default, Display)]
#[derive(Serialize, Deserialize)]
#[serde(crate = "serde_crate")]
#[display(Debug)]
pub struct NetworkGraph {
    pub channels: Vec<Channel>,

    pub nodes: Vec<GraphNode>,
}

/// Single hop of a payment route
#[serde_as]
#[derive(Clone, PartialEq, Eq, Hash, Debug, Display)]
#[derive(Serialize, Deserialize)]
#[serde(crate = "serde_crate")]
#[display("{channel} -> {public_key}: forward {forward_mtokens} mtokens, fee {fee_mtokens}")]
pub struct Hop {
    pub channel: ShortChannelId,

    /// Capacity of the channel, in tokens
    pub channel_capacity: u64,

    /// Fee charged by the node this hop leaves from, rounded down to tokens
    pub fee: u64,

    #[serde_as(as = "DisplayFromStr")]
    pub fee_mtokens: u64,

    pub forward: u64,

    #[serde_as(as = "DisplayFromStr")]
    pub forward_mtokens: u64,

    /// Node reached by the hop
    pub public_key: PublicKey,

    /// Absolute CLTV expiry of the HTLC leaving this hop's receiver
    pub timeout: u32,
}

impl Hop {
    /// Amount carried by the hop channel: the forwarded amount plus the fee of the hop node
    #[inline]
    pub fn incoming_mtokens(&self) -> u64 { self.forward_mtokens.saturating_add(self.fee_mtokens) }
}

/// Complete payment route with fee and timelock accounting
#[serde_as]
#[derive(Clone, PartialEq, Eq, Hash, Debug, Display)]
#[derive(Serialize, Deserialize)]
#[serde(crate = "serde_crate")]
#[display(Route::to_yaml_string)]
pub struct Route {
    pub fee: u64,

    #[serde_as(as = "DisplayFromStr")]
    pub fee_mtokens: u64,

    pub hops: Vec<Hop>,

    /// Amount sent including fees
    #[serde_as(as = "DisplayFromStr")]
    pub mtokens: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment: Option<PaymentSecret>,

    /// Absolute CLTV expiry of the first HTLC
    pub timeout: u32,

    pub tokens: u64,

    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_mtokens: Option<u64>,
}

impl Route {
    pub fn destination(&self) -> Option<PublicKey> { self.hops.last().map(|hop| hop.public_key) }

    /// Amount received by the destination
    pub fn delivered_mtokens(&self) -> u64 { self.mtokens.saturating_sub(self.fee_mtokens) }

    /// Nodes visited by the route starting from `source`
    pub fn nodes(&self, source: PublicKey) -> Vec<PublicKey> {
        let mut nodes = Vec::with_capacity(self.hops.len() + 1);
        nodes.push(source);
        nodes.extend(self.hops.iter().map(|hop| hop.public_key));
        nodes
    }
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
#[derive(Serialize, Deserialize)]
#[serde(crate = "serde_crate", rename_all = "snake_case")]
pub enum InvoiceState {
    /// Waiting for a payment
    #[display("created")]
    Created,

    /// HTLC is locked in but not yet settled (hold invoices only)
    #[display("held")]
    Held,

    #[display("confirmed")]
    Confirmed,

    #[display("canceled")]
    Canceled,
}

impl InvoiceState {
    pub fn is_final(self) -> bool {
        matches!(self, InvoiceState::Confirmed | InvoiceState::Canceled)
    }
}

#[serde_as]
#[derive(Clone, PartialEq, Eq, Hash, Debug, Display)]
#[derive(Serialize, Deserialize)]
#[serde(crate = "serde_crate")]
#[display(Invoice::to_yaml_string)]
pub struct Invoice {
    /// Payment hash
    pub id: sha256::Hash,

    /// Preimage; absent for hold invoices until settled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<Preimage>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment: Option<PaymentSecret>,

    pub tokens: u64,

    #[serde_as(as = "DisplayFromStr")]
    pub mtokens: u64,

    #[serde_as(as = "DisplayFromStr")]
    #[serde(default)]
    pub received_mtokens: u64,

    /// BOLT-11 payment request
    pub request: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub cltv_delta: u16,

    pub created_at: DateTime<Utc>,

    pub expires_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmed_at: Option<DateTime<Utc>>,

    pub state: InvoiceState,

    #[serde(default)]
    pub is_hold: bool,

    /// Position of the invoice in the order of creation
    pub index: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmed_index: Option<u64>,

    /// Node-wide update sequence number of the latest change of the invoice
    pub sequence: u64,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
#[derive(Serialize, Deserialize)]
#[serde(crate = "serde_crate", rename_all = "snake_case")]
pub enum PaymentState {
    #[display("pending")]
    Pending,

    #[display("confirmed")]
    Confirmed,

    #[display("failed")]
    Failed,
}

/// Outgoing payment record
#[serde_as]
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[derive(Serialize, Deserialize)]
#[serde(crate = "serde_crate")]
#[display(Payment::to_yaml_string)]
pub struct Payment {
    /// Payment hash
    pub id: sha256::Hash,

    pub destination: PublicKey,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<String>,

    pub state: PaymentState,

    /// Amount delivered to the destination
    #[serde_as(as = "DisplayFromStr")]
    pub mtokens: u64,

    #[serde_as(as = "DisplayFromStr")]
    #[serde(default)]
    pub fee_mtokens: u64,

    /// Hops of the route used by the latest attempt
    #[serde(default)]
    pub hops: Vec<Hop>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<Preimage>,

    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,

    #[serde(default)]
    pub attempts: u32,
}

impl Payment {
    #[inline]
    pub fn tokens(&self) -> u64 { self.mtokens / MTOKENS_PER_TOKEN }

    #[inline]
    pub fn fee(&self) -> u64 { self.fee_mtokens / MTOKENS_PER_TOKEN }
}

/// Outcome of an outgoing HTLC as known to the node
#[derive(Clone, PartialEq, Eq, Hash, Debug, Display)]
#[derive(Serialize, Deserialize)]
#[serde(crate = "serde_crate")]
#[display("{id} {state}")]
pub struct PaymentStatus {
    /// Payment hash
    pub id: sha256::Hash,

    pub state: PaymentState,

    /// Preimage, once the destination has revealed it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<Preimage>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
#[derive(Serialize, Deserialize)]
#[serde(crate = "serde_crate", rename_all = "snake_case")]
pub enum ForwardState {
    /// HTLC is offered and waits for its resolution
    #[display("pending")]
    Pending,

    #[display("confirmed")]
    Confirmed,

    #[display("failed")]
    Failed,
}

/// HTLC passing through the node. The node may be its sender, one of the forwarding nodes or
/// its receiver.
#[serde_as]
#[derive(Clone, PartialEq, Eq, Hash, Debug, Display)]
#[derive(Serialize, Deserialize)]
#[serde(crate = "serde_crate")]
#[display(Forward::to_yaml_string)]
pub struct Forward {
    pub at: DateTime<Utc>,

    /// Channel the HTLC came in over; absent when the node sends it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_channel: Option<ShortChannelId>,

    /// Channel the HTLC leaves over; absent when the node receives it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_channel: Option<ShortChannelId>,

    /// Amount leaving the node, or the amount received by the destination
    #[serde_as(as = "DisplayFromStr")]
    pub mtokens: u64,

    #[serde_as(as = "DisplayFromStr")]
    #[serde(default)]
    pub fee_mtokens: u64,

    pub state: ForwardState,
}

impl Forward {
    #[inline]
    pub fn is_send(&self) -> bool { self.in_channel.is_none() }

    #[inline]
    pub fn is_receive(&self) -> bool { self.out_channel.is_none() }
}

/// Static channel backup of a single channel
#[derive(Clone, PartialEq, Eq, Hash, Debug, Display)]
#[derive(Serialize, Deserialize)]
#[serde(crate = "serde_crate")]
#[display("backup({transaction_id}:{transaction_vout})")]
pub struct ChannelBackup {
    pub transaction_id: Txid,

    pub transaction_vout: u32,

    #[serde(with = "hex_bytes")]
    pub backup: Vec<u8>,
}

impl ChannelBackup {
    pub fn channel_point(&self) -> ChannelPoint {
        ChannelPoint {
            transaction_id: self.transaction_id,
            transaction_vout: self.transaction_vout,
        }
    }
}

/// Backup blob covering all channels together with per-channel blobs
#[derive(Clone, PartialEq, Eq, Hash, Debug, Display)]
#[derive(Serialize, Deserialize)]
#[serde(crate = "serde_crate")]
#[display(Debug)]
pub struct MultiBackup {
    #[serde(with = "hex_bytes")]
    pub backup: Vec<u8>,

    pub channels: Vec<ChannelBackup>,
}

/// Outcome of a backup verification performed by the node
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Display)]
#[derive(Serialize, Deserialize)]
#[serde(crate = "serde_crate")]
#[display("is_valid: {is_valid}")]
pub struct BackupVerification {
    pub is_valid: bool,
}

#[derive(Clone, PartialEq, Eq, Hash, Debug, Display)]
#[derive(Serialize, Deserialize)]
#[serde(crate = "serde_crate")]
#[display(NodeInfo::to_yaml_string)]
pub struct NodeInfo {
    pub public_key: PublicKey,

    #[serde(default)]
    pub alias: String,

    pub current_block_height: u32,

    #[serde(default)]
    pub is_synced_to_chain: bool,

    #[serde(default)]
    pub version: String,
}

impl ToYamlString for Policy {}
impl ToYamlString for Channel {}
impl ToYamlString for Route {}
impl ToYamlString for Invoice {}
impl ToYamlString for Payment {}
impl ToYamlString for Forward {}
impl ToYamlString for NodeInfo {}
