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

//! Forwarding reputation of node pairs and the success confidence pathfinding derives from it.
//!
//! Every payment attempt reports which pairs of nodes managed to forward the HTLC and which
//! pair failed. A failed pair is considered unusable right after the failure and recovers
//! towards the baseline confidence with a configurable half-life. A pair which recently
//! forwarded at least the queried amount gets high confidence.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use amplify::ToYamlString;
use bitcoin::secp256k1::PublicKey;
use chrono::{DateTime, Utc};
use ln_rpc::Route;
use serde_with::{DisplayFromStr, DurationMilliSeconds};

use crate::{Error, CONFIDENCE_PPM};

/// Success probability in parts per million
pub type Confidence = u64;

/// Confidence of a pair which has recently forwarded the amount
pub const SUCCESS_CONFIDENCE: Confidence = 950_000;

/// Pathfinding configuration of the reputation store
#[serde_as]
#[derive(Clone, PartialEq, Eq, Hash, Debug, Display)]
#[derive(Serialize, Deserialize)]
#[serde(crate = "serde_crate", default)]
#[display(Settings::to_yaml_string)]
pub struct Settings {
    /// Confidence of pairs without any history
    pub baseline_success_rate: Confidence,

    /// Number of node pairs the store keeps; least recently updated pairs are evicted first
    pub max_payment_records: usize,

    /// Weight of the sending node history when estimating pairs it has no history for
    pub node_ignore_rate: Confidence,

    /// Time it takes a failed pair to recover half of the way back to the baseline
    #[serde_as(as = "DurationMilliSeconds")]
    #[serde(rename = "penalty_half_life_ms")]
    pub penalty_half_life: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            baseline_success_rate: 600_000,
            max_payment_records: 1000,
            node_ignore_rate: 500_000,
            penalty_half_life: Duration::from_secs(3600),
        }
    }
}

impl ToYamlString for Settings {}

/// Partial update of [`Settings`]; absent fields keep their current values
#[serde_as]
#[derive(Clone, PartialEq, Eq, Hash, Debug, Default)]
#[derive(Serialize, Deserialize)]
#[serde(crate = "serde_crate")]
pub struct SettingsUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_success_rate: Option<Confidence>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_payment_records: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_ignore_rate: Option<Confidence>,

    #[serde_as(as = "Option<DurationMilliSeconds>")]
    #[serde(default, rename = "penalty_half_life_ms", skip_serializing_if = "Option::is_none")]
    pub penalty_half_life: Option<Duration>,
}

impl Settings {
    fn validate(&self) -> Result<(), Error> {
        if self.baseline_success_rate > CONFIDENCE_PPM || self.node_ignore_rate > CONFIDENCE_PPM {
            return Err(Error::validation("rates must be expressed in parts per million"));
        }
        if self.max_payment_records == 0 {
            return Err(Error::validation("at least one payment record must be kept"));
        }
        if self.penalty_half_life.is_zero() {
            return Err(Error::validation("penalty half-life must be positive"));
        }
        Ok(())
    }

    fn updated(&self, update: &SettingsUpdate) -> Settings {
        Settings {
            baseline_success_rate: update
                .baseline_success_rate
                .unwrap_or(self.baseline_success_rate),
            max_payment_records: update.max_payment_records.unwrap_or(self.max_payment_records),
            node_ignore_rate: update.node_ignore_rate.unwrap_or(self.node_ignore_rate),
            penalty_half_life: update.penalty_half_life.unwrap_or(self.penalty_half_life),
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
struct Outcome {
    at: DateTime<Utc>,
    mtokens: u64,
}

/// History of a single directed pair
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
struct PairHistory {
    success: Option<Outcome>,
    failure: Option<Outcome>,
}

impl PairHistory {
    fn updated_at(&self) -> Option<DateTime<Utc>> {
        match (self.success, self.failure) {
            (Some(success), Some(failure)) => Some(success.at.max(failure.at)),
            (Some(outcome), None) | (None, Some(outcome)) => Some(outcome.at),
            (None, None) => None,
        }
    }

    /// Confidence for `mtokens` at time `at`, with `prior` for amounts without history
    fn confidence(
        &self,
        mtokens: u64,
        at: DateTime<Utc>,
        prior: Confidence,
        half_life: Duration,
    ) -> Confidence {
        let failure = self.failure.filter(|failure| mtokens >= failure.mtokens);
        match (self.success, failure) {
            (Some(success), failure)
                if success.mtokens >= mtokens
                    && failure.map(|failure| success.at > failure.at).unwrap_or(true) =>
            {
                SUCCESS_CONFIDENCE
            }
            (_, Some(failure)) => decay(prior, (at - failure.at).num_milliseconds(), half_life),
            _ => prior,
        }
    }
}

/// Share of `prior` recovered after `elapsed_ms` since a failure: `1 - 2^(-t/half_life)`
fn decay(prior: Confidence, elapsed_ms: i64, half_life: Duration) -> Confidence {
    let half_life_ms = half_life.as_millis() as f64;
    if half_life_ms <= 0.0 {
        return prior;
    }
    let elapsed = elapsed_ms.max(0) as f64;
    let recovered = 1.0 - 0.5f64.powf(elapsed / half_life_ms);
    ((prior as f64 * recovered) as Confidence).min(prior)
}

/// Reputation of forwarding from a node to one of its peers
#[serde_as]
#[derive(Clone, PartialEq, Eq, Hash, Debug, Display)]
#[derive(Serialize, Deserialize)]
#[serde(crate = "serde_crate")]
#[display("{to_public_key}: {confidence}")]
pub struct PeerReputation {
    pub to_public_key: PublicKey,

    /// Current confidence of forwarding the amount of the latest record
    pub confidence: Confidence,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<DateTime<Utc>>,

    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_mtokens: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<DateTime<Utc>>,

    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_mtokens: Option<u64>,
}

/// Forwarding reputations of a node towards its peers
#[derive(Clone, PartialEq, Eq, Hash, Debug, Display)]
#[derive(Serialize, Deserialize)]
#[serde(crate = "serde_crate")]
#[display(NodeReputation::to_yaml_string)]
pub struct NodeReputation {
    pub public_key: PublicKey,

    /// Confidence of the node forwarding to peers without history
    pub confidence: Confidence,

    pub peers: Vec<PeerReputation>,
}

impl ToYamlString for NodeReputation {}

#[derive(Debug, Default)]
struct Inner {
    settings: Settings,
    pairs: HashMap<(PublicKey, PublicKey), PairHistory>,
}

impl Inner {
    /// Confidence of `from` forwarding to a node it has no history with. Blends the baseline
    /// with the node's average confidence over its other pairs.
    fn node_prior(
        &self,
        from: &PublicKey,
        except: &PublicKey,
        mtokens: u64,
        at: DateTime<Utc>,
    ) -> Confidence {
        let baseline = self.settings.baseline_success_rate;
        let others = self
            .pairs
            .iter()
            .filter(|((source, peer), _)| source == from && peer != except)
            .map(|(_, history)| {
                history.confidence(mtokens, at, baseline, self.settings.penalty_half_life)
            })
            .collect::<Vec<_>>();
        if others.is_empty() {
            return baseline;
        }
        let average = others.iter().sum::<Confidence>() / others.len() as Confidence;
        let weight = self.settings.node_ignore_rate;
        (baseline * (CONFIDENCE_PPM - weight) + average * weight) / CONFIDENCE_PPM
    }

    fn confidence(
        &self,
        from: &PublicKey,
        to: &PublicKey,
        mtokens: u64,
        at: DateTime<Utc>,
    ) -> Confidence {
        let prior = self.node_prior(from, to, mtokens, at);
        match self.pairs.get(&(*from, *to)) {
            Some(history) => {
                history.confidence(mtokens, at, prior, self.settings.penalty_half_life)
            }
            None => prior,
        }
    }

    fn record(&mut self, from: PublicKey, to: PublicKey, update: impl FnOnce(&mut PairHistory)) {
        update(self.pairs.entry((from, to)).or_default());
        self.evict();
    }

    fn evict(&mut self) {
        while self.pairs.len() > self.settings.max_payment_records {
            let oldest = self
                .pairs
                .iter()
                .min_by_key(|(_, history)| history.updated_at())
                .map(|(pair, _)| *pair);
            match oldest {
                Some(pair) => {
                    trace!("Evicting reputation of {} -> {}", pair.0, pair.1);
                    self.pairs.remove(&pair);
                }
                None => break,
            }
        }
    }
}

/// Thread-safe store of pair reputations. Concurrent updates of the same pair resolve by
/// their timestamps: the latest outcome wins.
#[derive(Debug, Default)]
pub struct ReputationStore {
    inner: RwLock<Inner>,
}

impl ReputationStore {
    pub fn with(settings: Settings) -> Result<Self, Error> {
        settings.validate()?;
        Ok(ReputationStore { inner: RwLock::new(Inner { settings, pairs: empty!() }) })
    }

    fn read(&self) -> RwLockReadGuard<Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers that `from` failed to forward to `to`. Without an amount the failure applies
    /// to any amount.
    pub fn record_failure(
        &self,
        from: PublicKey,
        to: PublicKey,
        mtokens: Option<u64>,
        at: DateTime<Utc>,
    ) {
        debug!("Recording failure to forward {:?} mtokens from {} to {}", mtokens, from, to);
        let mtokens = mtokens.unwrap_or_default();
        self.write().record(from, to, |history| {
            if matches!(history.failure, Some(known) if known.at > at) {
                return;
            }
            // Successes at or above the failed amount are no longer trusted
            if let Some(success) = history.success.as_mut() {
                if success.at <= at && success.mtokens >= mtokens {
                    success.mtokens = mtokens.saturating_sub(1);
                }
            }
            history.failure = Some(Outcome { at, mtokens });
        });
    }

    /// Registers that `from` forwarded `mtokens` to `to`
    pub fn record_success(&self, from: PublicKey, to: PublicKey, mtokens: u64, at: DateTime<Utc>) {
        trace!("Recording success forwarding {} mtokens from {} to {}", mtokens, from, to);
        self.write().record(from, to, |history| {
            if matches!(history.success, Some(known) if known.at > at) {
                return;
            }
            // A success above a failed amount moves the failure threshold up
            if let Some(failure) = history.failure {
                if failure.at <= at && failure.mtokens <= mtokens {
                    history.failure =
                        Some(Outcome { at: failure.at, mtokens: mtokens.saturating_add(1) });
                }
            }
            history.success = Some(Outcome { at, mtokens });
        });
    }

    /// Registers outcome of a payment attempt over `route` from `source`. The node at
    /// `failed_index` reported a failure forwarding over its outgoing channel, so all pairs
    /// before it have forwarded successfully. With no index the whole route succeeded.
    pub fn record_route(
        &self,
        source: PublicKey,
        route: &Route,
        failed_index: Option<usize>,
        at: DateTime<Utc>,
    ) {
        let nodes = route.nodes(source);
        for (pos, hop) in route.hops.iter().enumerate() {
            let (from, to) = (nodes[pos], nodes[pos + 1]);
            match failed_index {
                Some(index) if pos == index => {
                    self.record_failure(from, to, Some(hop.incoming_mtokens()), at);
                    break;
                }
                _ => self.record_success(from, to, hop.incoming_mtokens(), at),
            }
        }
    }

    /// Confidence of `from` forwarding `mtokens` to `to` now
    pub fn get_confidence(&self, from: &PublicKey, to: &PublicKey, mtokens: u64) -> Confidence {
        self.confidence_at(from, to, mtokens, Utc::now())
    }

    /// Confidence of `from` forwarding `mtokens` to `to` at the given time
    pub fn confidence_at(
        &self,
        from: &PublicKey,
        to: &PublicKey,
        mtokens: u64,
        at: DateTime<Utc>,
    ) -> Confidence {
        self.read().confidence(from, to, mtokens, at)
    }

    /// Probability of the whole route succeeding, as a product of its pair confidences
    pub fn route_confidence(&self, source: PublicKey, route: &Route) -> Confidence {
        let at = Utc::now();
        let inner = self.read();
        let nodes = route.nodes(source);
        route.hops.iter().enumerate().fold(CONFIDENCE_PPM, |confidence, (pos, hop)| {
            let pair = inner.confidence(&nodes[pos], &nodes[pos + 1], hop.incoming_mtokens(), at);
            confidence * pair / CONFIDENCE_PPM
        })
    }

    /// Removes the history of all pairs
    pub fn delete_all_reputations(&self) {
        let mut inner = self.write();
        info!("Deleting reputations of {} node pairs", inner.pairs.len());
        inner.pairs.clear();
    }

    /// Reputations grouped by the forwarding node
    pub fn get_forwarding_reputations(&self) -> Vec<NodeReputation> {
        let at = Utc::now();
        let inner = self.read();
        let mut nodes = BTreeMap::<PublicKey, Vec<PeerReputation>>::new();
        for ((from, to), history) in &inner.pairs {
            let mtokens = match (history.success, history.failure) {
                (_, Some(failure)) => failure.mtokens,
                (Some(success), None) => success.mtokens,
                (None, None) => continue,
            };
            nodes.entry(*from).or_default().push(PeerReputation {
                to_public_key: *to,
                confidence: inner.confidence(from, to, mtokens, at),
                last_success_at: history.success.map(|outcome| outcome.at),
                success_mtokens: history.success.map(|outcome| outcome.mtokens),
                last_failure_at: history.failure.map(|outcome| outcome.at),
                failure_mtokens: history.failure.map(|outcome| outcome.mtokens),
            });
        }
        nodes
            .into_iter()
            .map(|(public_key, mut peers)| {
                peers.sort_by_key(|peer| peer.to_public_key);
                NodeReputation {
                    public_key,
                    confidence: inner.node_prior(&public_key, &public_key, 0, at),
                    peers,
                }
            })
            .collect()
    }

    pub fn get_settings(&self) -> Settings { self.read().settings.clone() }

    /// Applies partial settings update, returning the resulting settings
    pub fn update_settings(&self, update: &SettingsUpdate) -> Result<Settings, Error> {
        let mut inner = self.write();
        let settings = inner.settings.updated(update);
        settings.validate()?;
        debug!("Updating pathfinding settings to {:?}", settings);
        inner.settings = settings.clone();
        inner.evict();
        Ok(settings)
    }
}
