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

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use bitcoin::secp256k1::PublicKey;
use ln_rpc::{Channel, NetworkGraph, Route, ShortChannelId};

use super::{route_from_channels, RouteParams};
use crate::config::PaymentConfig;
use crate::CONFIDENCE_PPM;

/// Directed pair of nodes excluded from pathfinding
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Display)]
#[display("{from} -> {to}")]
pub struct IgnoredPair {
    pub from: PublicKey,
    pub to: PublicKey,
}

/// Restrictions a found route must satisfy
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct RouteConstraints {
    /// First channel the route must take
    pub outgoing_channel: Option<ShortChannelId>,

    /// Nodes the route must not go through
    pub ignore_nodes: HashSet<PublicKey>,

    /// Node pairs the route must not go through
    pub ignore_pairs: HashSet<IgnoredPair>,

    pub max_fee_mtokens: Option<u64>,

    /// Highest absolute CLTV expiry acceptable for the first HTLC
    pub max_timeout_height: Option<u32>,
}

impl RouteConstraints {
    fn is_ignored(&self, from: &PublicKey, to: &PublicKey) -> bool {
        self.ignore_nodes.contains(from)
            || self.ignore_nodes.contains(to)
            || self.ignore_pairs.contains(&IgnoredPair { from: *from, to: *to })
    }
}

/// Weights of the edge cost components
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct CostModel {
    pub attempt_cost_mtokens: u64,
    pub timelock_risk_ppb: u64,
}

impl From<&PaymentConfig> for CostModel {
    fn from(config: &PaymentConfig) -> Self {
        CostModel {
            attempt_cost_mtokens: config.attempt_cost_mtokens,
            timelock_risk_ppb: config.timelock_risk_ppb,
        }
    }
}

impl CostModel {
    fn edge_cost(&self, fee: u64, mtokens: u64, cltv_delta: u16, confidence: u64) -> u64 {
        let risk = mtokens as u128 * cltv_delta as u128 * self.timelock_risk_ppb as u128
            / 1_000_000_000;
        let penalty =
            self.attempt_cost_mtokens as u128 * CONFIDENCE_PPM as u128 / confidence as u128;
        (fee as u128 + risk + penalty).min(u64::MAX as u128) as u64
    }
}

/// Best known way from a node to the destination
#[derive(Copy, Clone, Debug)]
struct Label {
    cost: u64,
    /// Amount which must arrive to the node
    mtokens: u64,
    /// CLTV delta of the HTLC arriving to the node, relative to the current height
    expiry: u32,
    /// Channel and the node it leads to; `None` for the destination
    next: Option<(usize, usize)>,
}

impl Label {
    #[inline]
    fn rank(&self) -> (u64, u32) { (self.cost, self.expiry) }
}

struct Search<'graph, F> {
    channels: Vec<&'graph Channel>,
    nodes: Vec<PublicKey>,
    /// Edges indexed by the receiving node: (channel, sending node)
    incoming: HashMap<usize, Vec<(usize, usize)>>,
    src: usize,
    dest: usize,
    params: &'graph RouteParams,
    constraints: &'graph RouteConstraints,
    cost_model: &'graph CostModel,
    max_expiry: Option<u32>,
    confidence: F,
}

impl<'graph, F> Search<'graph, F>
where
    F: Fn(&PublicKey, &PublicKey, u64) -> u64,
{
    /// Label of `from` when it reaches `to` over the channel, if the edge is usable
    fn relax(&self, to: usize, label: &Label, chan_no: usize, from: usize) -> Option<Label> {
        let channel = self.channels[chan_no];
        let (from_key, to_key) = (self.nodes[from], self.nodes[to]);
        if self.constraints.is_ignored(&from_key, &to_key) {
            return None;
        }
        // Payment can't bounce back over the channel it came through
        if matches!(label.next, Some((next_chan, _)) if next_chan == chan_no) {
            return None;
        }
        let is_source = from == self.src;
        if is_source && matches!(self.constraints.outgoing_channel, Some(id) if id != channel.id) {
            return None;
        }

        let policy = channel.policy_of(&from_key)?;
        if !policy.admits(label.mtokens) || label.mtokens > channel.capacity_mtokens() {
            return None;
        }
        let confidence = (self.confidence)(&from_key, &to_key, label.mtokens);
        if confidence == 0 {
            return None;
        }

        // The source does not charge for its own channel
        let (fee, cltv_delta) = match is_source {
            true => (0, 0),
            false => (policy.forwarding_fee(label.mtokens), policy.cltv_delta),
        };
        let mtokens = label.mtokens.checked_add(fee)?;
        let expiry = label.expiry.saturating_add(cltv_delta as u32);
        let fee_total = mtokens.saturating_sub(self.params.mtokens);
        if matches!(self.constraints.max_fee_mtokens, Some(max) if fee_total > max)
            || matches!(self.max_expiry, Some(max) if expiry > max)
        {
            return None;
        }

        let edge = self.cost_model.edge_cost(fee, label.mtokens, cltv_delta, confidence);
        Some(Label {
            cost: label.cost.saturating_add(edge),
            mtokens,
            expiry,
            next: Some((chan_no, to)),
        })
    }

    /// Dijkstra run from `seed` towards the source, never using the `excluded` channel.
    /// Returns label of the source and channel path.
    fn run(
        &self,
        seed: usize,
        seed_label: Label,
        excluded: Option<usize>,
    ) -> Option<(Label, Vec<usize>)> {
        let mut labels = HashMap::<usize, Label>::new();
        labels.insert(seed, seed_label);
        let mut queue = BinaryHeap::new();
        queue.push(Reverse((seed_label.cost, seed_label.expiry, seed)));
        let mut best: Option<Label> = None;

        while let Some(Reverse((cost, expiry, to))) = queue.pop() {
            let label = labels[&to];
            if (cost, expiry) != label.rank() {
                continue;
            }
            if matches!(best, Some(best) if best.cost <= cost) {
                break;
            }
            for &(chan_no, from) in self.incoming.get(&to).map(Vec::as_slice).unwrap_or_default() {
                if Some(chan_no) == excluded || from == to {
                    continue;
                }
                // Neither the destination nor the source may be intermediate hops
                if from != self.src && from == self.dest {
                    continue;
                }
                let next = match self.relax(to, &label, chan_no, from) {
                    Some(next) => next,
                    None => continue,
                };
                if from == self.src {
                    if best.map(|best| next.rank() < best.rank()).unwrap_or(true) {
                        best = Some(next);
                    }
                    continue;
                }
                if labels.get(&from).map(|known| next.rank() < known.rank()).unwrap_or(true) {
                    labels.insert(from, next);
                    queue.push(Reverse((next.cost, next.expiry, from)));
                }
            }
        }

        let best = best?;
        let mut path = vec![];
        let mut visited = HashSet::new();
        let mut step = best.next;
        while let Some((chan_no, node)) = step {
            path.push(chan_no);
            if !visited.insert(node) {
                warn!("Pathfinding produced cyclic path, discarding");
                return None;
            }
            step = labels.get(&node).and_then(|label| label.next);
        }
        Some((best, path))
    }
}

/// Finds the cheapest route from `source` to `destination` delivering `params.mtokens`.
///
/// Search goes backwards from the destination, so the amount and timelock each node needs are
/// known exactly when its outgoing channels are evaluated. An edge costs the fee charged by its
/// sending node, the risk of the locked-up funds and an attempt penalty inversely proportional
/// to the `confidence` of the node pair. Equal-cost candidates prefer lower timelocks. Inbound
/// discounts are not taken into account by the search but do reduce fees of the found route.
///
/// The source may be the destination itself (circular rebalancing), in which case the route
/// leaves and comes back over different channels. Returns `None` when no route satisfies the
/// constraints.
pub fn find_route<F>(
    graph: &NetworkGraph,
    source: PublicKey,
    destination: PublicKey,
    params: &RouteParams,
    constraints: &RouteConstraints,
    cost_model: &CostModel,
    confidence: F,
) -> Option<Route>
where
    F: Fn(&PublicKey, &PublicKey, u64) -> u64,
{
    let channels = graph.channels.iter().filter(|channel| channel.is_valid()).collect::<Vec<_>>();

    let mut index = HashMap::<PublicKey, usize>::new();
    let mut nodes = Vec::<PublicKey>::new();
    let mut node_index = |key: PublicKey| {
        *index.entry(key).or_insert_with(|| {
            nodes.push(key);
            nodes.len() - 1
        })
    };
    let dest = node_index(destination);
    let src = node_index(source);
    let mut incoming = HashMap::<usize, Vec<(usize, usize)>>::new();
    for (no, channel) in channels.iter().enumerate() {
        let a = node_index(channel.policies[0].public_key);
        let b = node_index(channel.policies[1].public_key);
        incoming.entry(a).or_default().push((no, b));
        incoming.entry(b).or_default().push((no, a));
    }

    let search = Search {
        channels,
        nodes,
        incoming,
        src,
        dest,
        params,
        constraints,
        cost_model,
        max_expiry: constraints
            .max_timeout_height
            .map(|height| height.saturating_sub(params.height)),
        confidence,
    };
    let dest_label = Label {
        cost: 0,
        mtokens: params.mtokens,
        expiry: params.initial_cltv as u32,
        next: None,
    };

    let found = if src != dest {
        search.run(dest, dest_label, None)
    } else {
        // Circular route: fix the channel the payment returns over, then search for the way
        // out which does not use it
        let mut best: Option<(Label, Vec<usize>)> = None;
        for &(chan_no, peer) in search.incoming.get(&dest).map(Vec::as_slice).unwrap_or_default() {
            if peer == dest {
                continue;
            }
            let seed = match search.relax(dest, &dest_label, chan_no, peer) {
                Some(seed) => seed,
                None => continue,
            };
            if let Some((label, path)) = search.run(peer, seed, Some(chan_no)) {
                if best.as_ref().map(|(best, _)| label.rank() < best.rank()).unwrap_or(true) {
                    best = Some((label, path));
                }
            }
        }
        best
    };

    let (_, path) = found?;
    let path = path.into_iter().map(|no| search.channels[no].clone()).collect::<Vec<_>>();
    let route = match route_from_channels(&path, destination, params) {
        Ok(route) => route,
        Err(err) => {
            debug!("Path to {} can't be turned into a route: {}", destination, err);
            return None;
        }
    };
    if matches!(constraints.max_fee_mtokens, Some(max) if route.fee_mtokens > max) {
        return None;
    }
    debug!(
        "Found route to {} over {} hops with {} mtokens fee",
        destination,
        route.hops.len(),
        route.fee_mtokens
    );
    Some(route)
}
