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

use bitcoin::secp256k1::PublicKey;
use ln_rpc::model::MTOKENS_PER_TOKEN;
use ln_rpc::{Channel, Hop, PaymentSecret, Policy, Route, ShortChannelId};

use super::RouteError;

/// Channel of a route together with the policy of its sending side and the policy of its
/// receiving side, which may offer an inbound discount.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct HopHint {
    pub channel: ShortChannelId,

    /// Channel capacity, in tokens
    pub channel_capacity: u64,

    /// Policy of the node sending over the channel
    pub forwarding: Policy,

    /// Policy of the node the hop leads to
    pub receiving: Policy,
}

impl Display for HopHint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.channel, self.receiving.public_key)
    }
}

impl HopHint {
    /// Constructs hint out of the channel policies of the sending and receiving sides
    pub fn with(channel: &Channel, forwarding: &Policy, receiving: &Policy) -> HopHint {
        HopHint {
            channel: channel.id,
            channel_capacity: channel.capacity,
            forwarding: forwarding.clone(),
            receiving: receiving.clone(),
        }
    }

    /// Node the hop leads to
    #[inline]
    pub fn public_key(&self) -> PublicKey { self.receiving.public_key }

    /// Checks that the sending side accepts an HTLC of `mtokens` over the channel
    fn check(&self, mtokens: u64) -> Result<(), RouteError> {
        let (channel, policy) = (self.channel, &self.forwarding);
        if policy.is_disabled {
            return Err(RouteError::Disabled(channel));
        }
        if mtokens < policy.min_htlc_mtokens {
            let minimum = policy.min_htlc_mtokens;
            return Err(RouteError::BelowMinimum { channel, mtokens, minimum });
        }
        match policy.max_htlc_mtokens {
            Some(maximum) if mtokens > maximum => {
                return Err(RouteError::AboveMaximum { channel, mtokens, maximum })
            }
            _ => {}
        }
        if mtokens > self.channel_capacity.saturating_mul(MTOKENS_PER_TOKEN) {
            return Err(RouteError::CapacityExceeded { channel, mtokens });
        }
        Ok(())
    }
}

/// Amount-independent parameters of a route
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Display)]
#[display("{mtokens} mtokens at height {height}")]
pub struct RouteParams {
    /// Current block height
    pub height: u32,

    /// Amount to deliver to the destination
    pub mtokens: u64,

    /// CLTV delta required by the destination for the final HTLC
    pub initial_cltv: u16,

    pub payment: Option<PaymentSecret>,

    /// Total amount of a multi-part payment this route is a part of
    pub total_mtokens: Option<u64>,
}

/// Resolves channel path leading to `destination` into hop hints. Channels go in the payment
/// order; the last one must be connected to the destination.
pub fn hops_from_channels(
    channels: &[Channel],
    destination: PublicKey,
) -> Result<Vec<HopHint>, RouteError> {
    let mut receiver = destination;
    let mut hops = Vec::with_capacity(channels.len());
    for channel in channels.iter().rev() {
        if !channel.is_valid() {
            return Err(RouteError::InvalidChannel(channel.id));
        }
        let receiving = channel.policy_of(&receiver).ok_or(RouteError::Disconnected(channel.id))?;
        let sender =
            channel.counterparty(&receiver).ok_or(RouteError::Disconnected(channel.id))?;
        let forwarding = channel.policy_of(&sender).ok_or(RouteError::Disconnected(channel.id))?;
        hops.push(HopHint::with(channel, forwarding, receiving));
        receiver = sender;
    }
    hops.reverse();
    Ok(hops)
}

/// Builds route out of hop hints, computing amounts and timelocks from the destination back to
/// the sender.
///
/// Each node on the way is paid by the previous hop for forwarding over its outgoing channel,
/// less the inbound discount it offers for the channel the payment came in. Fees are rounded
/// down and never go negative. The sender does not pay itself, so the policy of the first hop
/// never charges.
pub fn route_from_hops(hops: &[HopHint], params: &RouteParams) -> Result<Route, RouteError> {
    let last = hops.last().ok_or(RouteError::Empty)?;

    let mut timeout =
        params.height.checked_add(params.initial_cltv as u32).ok_or(RouteError::TimeoutOverflow)?;
    let mut forward = params.mtokens;
    let mut route_hops = Vec::with_capacity(hops.len());

    last.check(forward)?;
    route_hops.push(Hop {
        channel: last.channel,
        channel_capacity: last.channel_capacity,
        fee: 0,
        fee_mtokens: 0,
        forward: forward / MTOKENS_PER_TOKEN,
        forward_mtokens: forward,
        public_key: last.public_key(),
        timeout,
    });

    for pos in (0..hops.len() - 1).rev() {
        let (hop, next) = (&hops[pos], &hops[pos + 1]);
        let hop_timeout = timeout;
        timeout = timeout
            .checked_add(next.forwarding.cltv_delta as u32)
            .ok_or(RouteError::TimeoutOverflow)?;

        let outbound = next.forwarding.forwarding_fee(forward);
        let discount = hop.receiving.inbound_discount(forward.saturating_add(outbound));
        let fee = outbound.saturating_sub(discount);
        let incoming = forward.checked_add(fee).ok_or(RouteError::AmountOverflow)?;
        hop.check(incoming)?;

        route_hops.push(Hop {
            channel: hop.channel,
            channel_capacity: hop.channel_capacity,
            fee: fee / MTOKENS_PER_TOKEN,
            fee_mtokens: fee,
            forward: forward / MTOKENS_PER_TOKEN,
            forward_mtokens: forward,
            public_key: hop.public_key(),
            timeout: hop_timeout,
        });
        forward = incoming;
    }
    route_hops.reverse();

    let fee_mtokens = route_hops.iter().map(|hop| hop.fee_mtokens).sum::<u64>();
    trace!(
        "Constructed route over {} hops: {} mtokens with {} mtokens fee",
        route_hops.len(),
        forward,
        fee_mtokens
    );
    Ok(Route {
        fee: fee_mtokens / MTOKENS_PER_TOKEN,
        fee_mtokens,
        hops: route_hops,
        mtokens: forward,
        payment: params.payment,
        timeout,
        tokens: forward / MTOKENS_PER_TOKEN,
        total_mtokens: params.total_mtokens,
    })
}

/// Builds route over a path of channels ending at `destination`
pub fn route_from_channels(
    channels: &[Channel],
    destination: PublicKey,
    params: &RouteParams,
) -> Result<Route, RouteError> {
    route_from_hops(&hops_from_channels(channels, destination)?, params)
}
