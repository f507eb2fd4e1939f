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

//! Payment routes: construction of the fee and timelock accounting out of a known channel path
//! and discovery of such paths in the network graph.

mod builder;
mod pathfind;

pub use builder::{hops_from_channels, route_from_channels, route_from_hops, HopHint, RouteParams};
pub use pathfind::{find_route, CostModel, IgnoredPair, RouteConstraints};

use ln_rpc::ShortChannelId;

/// Errors constructing a route. Routes are never produced in a state the network would reject
/// on policy grounds.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Display, Error)]
#[display(doc_comments)]
pub enum RouteError {
    /// route must contain at least one hop
    Empty,

    /// channel {0} must have policies of both sides
    InvalidChannel(ShortChannelId),

    /// channel {0} does not connect to the next node of the route
    Disconnected(ShortChannelId),

    /// channel {0} is disabled
    Disabled(ShortChannelId),

    /// HTLC of {mtokens} mtokens is below {minimum} mtokens minimum of channel {channel}
    BelowMinimum { channel: ShortChannelId, mtokens: u64, minimum: u64 },

    /// HTLC of {mtokens} mtokens is above {maximum} mtokens maximum of channel {channel}
    AboveMaximum { channel: ShortChannelId, mtokens: u64, maximum: u64 },

    /// HTLC of {mtokens} mtokens exceeds capacity of channel {channel}
    CapacityExceeded { channel: ShortChannelId, mtokens: u64 },

    /// route amount overflows
    AmountOverflow,

    /// route timelock overflows
    TimeoutOverflow,
}
