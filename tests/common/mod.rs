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

//! In-memory lightning network serving the client RPC API of each of its nodes

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::mem;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use amplify::Wrapper;
use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::Txid;
use chrono::Utc;
use lightning_invoice::{Currency, InvoiceBuilder};
use ln_client::backup::{self, SealedBackup};
use ln_client::rpc::{
    BackupVerification, Channel, ChannelBackup, ChannelPoint, CreateHoldInvoice, CreateInvoice,
    Error, Event, EventPayload, Failure, FailureCode, FailureReason, Forward, ForwardState,
    GetInvoices, GraphNode, Invoice, InvoiceState, MultiBackup, NetworkGraph, NodeInfo,
    PaymentSecret, PaymentSent, PaymentState, PaymentStatus, Policy, Preimage, Route, RpcMsg,
    SendToRoute, ShortChannelId, Subscription, SubscriptionFeed, Topic, Transport,
    VerifyBackup, VerifyBackups,
};

pub const START_HEIGHT: u32 = 500;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

pub fn init_logging() { let _ = env_logger::builder().is_test(true).try_init(); }

struct Stored {
    invoice: Invoice,
    preimage: Option<Preimage>,
}

struct NodeState {
    /// Key signing payment requests, in the secp256k1 version of the invoice library
    signer: invoice_secp256k1::SecretKey,
    /// Key sealing the channel backups of the node
    backup_key: Vec<u8>,
    alias: String,
    invoices: BTreeMap<sha256::Hash, Stored>,
    invoice_count: u64,
    settle_count: u64,
    /// Outcomes of the HTLCs the node has sent
    sent: BTreeMap<sha256::Hash, PaymentStatus>,
    feeds: Vec<(Topic, SubscriptionFeed)>,
}

struct SimChannel {
    channel: Channel,
    /// Local balance of each side, in millitokens
    balances: HashMap<PublicKey, u64>,
}

/// Part of the HTLC path: channel index, sender, receiver and amount
type Leg = (usize, PublicKey, PublicKey, u64);

/// HTLC held by the destination until its hold invoice is settled or canceled
struct Htlc {
    sender: PublicKey,
    destination: PublicKey,
    id: sha256::Hash,
    legs: Vec<Leg>,
    delivered: u64,
}

#[derive(Default)]
struct State {
    height: u32,
    sequence: u64,
    nodes: BTreeMap<PublicKey, NodeState>,
    channels: Vec<SimChannel>,
    failing_pairs: HashSet<(PublicKey, PublicKey)>,
    sent_htlcs: usize,
    held: Vec<Htlc>,
}

impl State {
    fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    fn publish(&mut self, node: PublicKey, payload: EventPayload) {
        let sequence = self.next_sequence();
        let event = Event { sequence, payload };
        if let Some(node) = self.nodes.get_mut(&node) {
            let feeds = mem::take(&mut node.feeds);
            node.feeds = feeds
                .into_iter()
                .filter_map(|(topic, mut feed)| {
                    if topic.matches(&event.payload) && !feed.publish(event.clone()) {
                        None
                    } else {
                        Some((topic, feed))
                    }
                })
                .collect();
        }
    }

    /// Updates stored invoice, assigning it a new sequence number, and notifies subscribers
    fn update_invoice(
        &mut self,
        node: PublicKey,
        id: sha256::Hash,
        update: impl FnOnce(&mut Invoice),
    ) {
        let sequence = self.sequence + 1;
        let invoice = match self.nodes.get_mut(&node).and_then(|node| node.invoices.get_mut(&id)) {
            Some(stored) => {
                update(&mut stored.invoice);
                stored.invoice.sequence = sequence;
                stored.invoice.clone()
            }
            None => return,
        };
        // Publishing assigns the event the same sequence number
        self.publish(node, EventPayload::InvoiceUpdated(invoice));
    }

    fn backups(&self, node: PublicKey) -> MultiBackup {
        let key = &self.nodes[&node].backup_key;
        let points = self
            .channels
            .iter()
            .filter(|sim| sim.channel.policy_of(&node).is_some())
            .map(|sim| sim.channel.channel_point())
            .collect::<Vec<_>>();
        let channels = points
            .iter()
            .map(|point| ChannelBackup {
                transaction_id: point.transaction_id,
                transaction_vout: point.transaction_vout,
                backup: seal(key, &[*point]),
            })
            .collect();
        MultiBackup { backup: seal(key, &points), channels }
    }

    fn settle_legs(&mut self, legs: &[Leg]) {
        for (index, _, to, amount) in legs {
            *self.channels[*index].balances.entry(*to).or_default() += amount;
        }
    }

    fn refund_legs(&mut self, legs: &[Leg]) {
        for (index, from, _, amount) in legs {
            *self.channels[*index].balances.entry(*from).or_default() += amount;
        }
    }

    /// Reports the HTLC to every node on its path: the sender, the forwarding nodes and the
    /// destination
    fn publish_forwards(&mut self, legs: &[Leg], delivered: u64, state: ForwardState) {
        let at = Utc::now();
        let channel = |index: usize| self.channels[index].channel.id;
        let mut forwards = Vec::with_capacity(legs.len() + 1);
        for (pos, (index, from, _, amount)) in legs.iter().enumerate() {
            let (in_channel, fee_mtokens) = match pos {
                0 => (None, amount - delivered),
                _ => {
                    let (incoming, _, _, received) = legs[pos - 1];
                    (Some(channel(incoming)), received - amount)
                }
            };
            let out_channel = Some(channel(*index));
            let mtokens = *amount;
            let forward = Forward { at, in_channel, out_channel, mtokens, fee_mtokens, state };
            forwards.push((*from, forward));
        }
        if let Some((index, _, to, _)) = legs.last() {
            let in_channel = Some(channel(*index));
            let (out_channel, mtokens, fee_mtokens) = (None, delivered, 0);
            let forward = Forward { at, in_channel, out_channel, mtokens, fee_mtokens, state };
            forwards.push((*to, forward));
        }
        for (node, forward) in forwards {
            self.publish(node, EventPayload::Forward(forward));
        }
    }

    fn record_sent(&mut self, sender: PublicKey, status: PaymentStatus) {
        if let Some(node) = self.nodes.get_mut(&sender) {
            node.sent.insert(status.id, status);
        }
    }

    fn reject(&mut self, sender: PublicKey, id: sha256::Hash, err: Error) -> Error {
        let failure = Some(err.to_failure());
        let status = PaymentStatus { id, state: PaymentState::Failed, secret: None, failure };
        self.record_sent(sender, status);
        err
    }

    /// Settles or refunds the HTLCs held for the invoice of `destination`
    fn resolve_held(&mut self, destination: PublicKey, id: sha256::Hash, secret: Option<Preimage>) {
        let (resolved, held) = mem::take(&mut self.held)
            .into_iter()
            .partition::<Vec<_>, _>(|htlc| htlc.destination == destination && htlc.id == id);
        self.held = held;
        for htlc in resolved {
            let status = match secret {
                Some(secret) => {
                    self.settle_legs(&htlc.legs);
                    self.publish_forwards(&htlc.legs, htlc.delivered, ForwardState::Confirmed);
                    let secret = Some(secret);
                    PaymentStatus { id, state: PaymentState::Confirmed, secret, failure: None }
                }
                None => {
                    self.refund_legs(&htlc.legs);
                    self.publish_forwards(&htlc.legs, htlc.delivered, ForwardState::Failed);
                    let rejection =
                        routing(FailureReason::PaymentRejectedByDestination, htlc.legs.len());
                    let failure = Some(rejection.to_failure());
                    PaymentStatus { id, state: PaymentState::Failed, secret: None, failure }
                }
            };
            self.record_sent(htlc.sender, status);
        }
    }
}

fn seal(key: &[u8], points: &[ChannelPoint]) -> Vec<u8> {
    backup::seal(key, points, b"channel state").expect("non-empty key")
}

fn verify(key: &[u8], blob: &[u8], channels: &[ChannelPoint]) -> RpcMsg {
    let is_valid = match SealedBackup::open(key, blob) {
        Ok(backup) => backup.covers(channels),
        Err(err) => {
            trace!("Rejecting backup: {}", err);
            false
        }
    };
    RpcMsg::BackupVerification(BackupVerification { is_valid })
}

fn failure(code: u16, message: &str) -> Error { Error::Failure(Failure::new(code, message)) }

fn routing(reason: FailureReason, index: usize) -> Error {
    Error::Failure(Failure::routing(reason, Some(index as u32)))
}

struct Shared {
    state: Mutex<State>,
    resolved: Condvar,
}

/// Network of simulated nodes
#[derive(Clone)]
pub struct Network {
    shared: Arc<Shared>,
}

/// RPC access to a single node of the network
#[derive(Clone)]
pub struct Node {
    shared: Arc<Shared>,
    pub key: PublicKey,
}

impl Network {
    pub fn new() -> Network {
        init_logging();
        let state = State { height: START_HEIGHT, ..State::default() };
        Network { shared: Arc::new(Shared { state: Mutex::new(state), resolved: Condvar::new() }) }
    }

    fn lock(&self) -> MutexGuard<State> { self.shared.state.lock().expect("poisoned") }

    pub fn add_node(&self, seed: u8, alias: &str) -> Node {
        let secret = SecretKey::from_slice(&[seed; 32]).expect("valid key");
        let key = PublicKey::from_secret_key(&Secp256k1::new(), &secret);
        let signer = invoice_secp256k1::SecretKey::from_slice(&[seed; 32]).expect("valid key");
        let backup_key = sha256::Hash::hash(format!("backup key of {}", alias).as_bytes());
        self.lock().nodes.insert(key, NodeState {
            signer,
            backup_key: backup_key[..].to_vec(),
            alias: alias.to_owned(),
            invoices: empty!(),
            invoice_count: 0,
            settle_count: 0,
            sent: empty!(),
            feeds: empty!(),
        });
        Node { shared: self.shared.clone(), key }
    }

    /// Opens channel funded by `funder`, with the whole capacity on its side
    pub fn open_channel(&self, funder: &Node, peer: &Node, capacity: u64) -> ShortChannelId {
        let mut state = self.lock();
        let no = state.channels.len() as u32 + 1;
        let id = ShortChannelId::new(state.height + no, 1, 0);
        let policy = |public_key| Policy {
            public_key,
            base_fee_mtokens: 1000,
            fee_rate: 1,
            cltv_delta: 40,
            min_htlc_mtokens: 1000,
            max_htlc_mtokens: None,
            is_disabled: false,
            inbound_base_discount_mtokens: 0,
            inbound_rate_discount: 0,
            updated_at: None,
        };
        let channel = Channel {
            id,
            capacity,
            transaction_id: Txid::from_inner([no as u8; 32]),
            transaction_vout: 0,
            policies: vec![policy(funder.key), policy(peer.key)],
            updated_at: Some(Utc::now()),
        };
        let mut balances = HashMap::new();
        balances.insert(funder.key, capacity * 1000);
        balances.insert(peer.key, 0);
        state.channels.push(SimChannel { channel, balances });
        for node in [funder.key, peer.key] {
            let backups = state.backups(node);
            state.publish(node, EventPayload::BackupUpdated(backups));
        }
        id
    }

    /// Changes policy the node enforces for the channel
    pub fn update_policy(&self, id: ShortChannelId, node: &Node, update: impl FnOnce(&mut Policy)) {
        let mut state = self.lock();
        let policy = state
            .channels
            .iter_mut()
            .find(|sim| sim.channel.id == id)
            .and_then(|sim| {
                sim.channel.policies.iter_mut().find(|policy| policy.public_key == node.key)
            })
            .expect("unknown channel");
        update(policy);
    }

    /// HTLCs from `from` to `to` fail with temporary channel failure
    pub fn fail_pair(&self, from: &Node, to: &Node) {
        self.lock().failing_pairs.insert((from.key, to.key));
    }

    pub fn balance(&self, id: ShortChannelId, node: &Node) -> u64 {
        let state = self.lock();
        state
            .channels
            .iter()
            .find(|sim| sim.channel.id == id)
            .and_then(|sim| sim.balances.get(&node.key).copied())
            .unwrap_or_default()
    }

    pub fn height(&self) -> u32 { self.lock().height }

    /// Number of HTLCs which were offered, unsettleable ones included
    pub fn sent_htlcs(&self) -> usize { self.lock().sent_htlcs }
}

impl Node {
    fn lock(&self) -> MutexGuard<State> { self.shared.state.lock().expect("poisoned") }

    /// Creates invoice; hold invoices come without a preimage
    fn create_invoice(
        &self,
        preimage: Option<Preimage>,
        terms: CreateHoldInvoice,
    ) -> Result<RpcMsg, Error> {
        let CreateHoldInvoice { id, mtokens, description, expires_at, cltv_delta } = terms;
        let mut state = self.lock();
        // Publishing the update assigns the event the same sequence number
        let sequence = state.sequence + 1;
        let node = state.nodes.get_mut(&self.key).expect("known node");
        if node.invoices.contains_key(&id) {
            return Err(failure(400, "InvoiceWithPaymentHashAlreadyExists"));
        }
        let now = Utc::now();
        let expires_at = expires_at.unwrap_or_else(|| now + chrono::Duration::hours(1));
        let cltv_delta = cltv_delta.unwrap_or(40);
        let payment = PaymentSecret::from_inner(sha256::Hash::hash(&id[..]).into_inner());

        let mut builder = InvoiceBuilder::new(Currency::Regtest)
            .description(description.clone().unwrap_or_default())
            .payment_hash(id)
            .payment_secret(lightning::ln::PaymentSecret(payment.into_inner()))
            .current_timestamp()
            .min_final_cltv_expiry(cltv_delta as u64)
            .expiry_time(Duration::from_secs((expires_at - now).num_seconds().max(1) as u64));
        if mtokens > 0 {
            builder = builder.amount_milli_satoshis(mtokens);
        }
        let (signer, secp) = (node.signer, invoice_secp256k1::Secp256k1::new());
        let request = builder
            .build_signed(|hash| secp.sign_recoverable(hash, &signer))
            .map_err(|err| failure(400, &err.to_string()))?
            .to_string();

        node.invoice_count += 1;
        let invoice = Invoice {
            id,
            secret: preimage,
            payment: Some(payment),
            tokens: mtokens / 1000,
            mtokens,
            received_mtokens: 0,
            request,
            description,
            cltv_delta,
            created_at: now,
            expires_at,
            confirmed_at: None,
            state: InvoiceState::Created,
            is_hold: preimage.is_none(),
            index: node.invoice_count,
            confirmed_index: None,
            sequence,
        };
        node.invoices.insert(id, Stored { invoice: invoice.clone(), preimage });
        state.publish(self.key, EventPayload::InvoiceUpdated(invoice.clone()));
        Ok(RpcMsg::Invoice(invoice))
    }

    fn invoice(&self, id: sha256::Hash) -> Result<RpcMsg, Error> {
        self.lock()
            .nodes
            .get(&self.key)
            .and_then(|node| node.invoices.get(&id))
            .map(|stored| RpcMsg::Invoice(stored.invoice.clone()))
            .ok_or_else(|| failure(404, "InvoiceNotFound"))
    }

    fn invoices(&self, added_after: Option<u64>) -> RpcMsg {
        let state = self.lock();
        let invoices = state.nodes[&self.key]
            .invoices
            .values()
            .map(|stored| stored.invoice.clone())
            .filter(|invoice| added_after.map(|index| invoice.index > index).unwrap_or(true))
            .collect();
        RpcMsg::Invoices(invoices)
    }

    fn settle(&self, preimage: Preimage) -> Result<RpcMsg, Error> {
        let id = preimage.payment_hash();
        let mut state = self.lock();
        let node = state.nodes.get_mut(&self.key).expect("known node");
        let stored = match node.invoices.get_mut(&id) {
            Some(stored) if stored.invoice.is_hold => stored,
            _ => return Err(failure(404, "SecretDoesNotMatchAnyExistingHodlInvoice")),
        };
        if stored.invoice.state != InvoiceState::Held {
            return Err(failure(402, "CannotSettleHtlcBeforeHtlcReceived"));
        }
        stored.preimage = Some(preimage);
        node.settle_count += 1;
        let confirmed_index = node.settle_count;
        state.update_invoice(self.key, id, |invoice| {
            invoice.state = InvoiceState::Confirmed;
            invoice.secret = Some(preimage);
            invoice.confirmed_at = Some(Utc::now());
            invoice.confirmed_index = Some(confirmed_index);
        });
        state.resolve_held(self.key, id, Some(preimage));
        self.shared.resolved.notify_all();
        Ok(RpcMsg::Success)
    }

    fn cancel(&self, id: sha256::Hash) -> Result<RpcMsg, Error> {
        let mut state = self.lock();
        let invoice = match state.nodes[&self.key].invoices.get(&id) {
            Some(stored) => stored.invoice.state,
            None => return Err(failure(404, "InvoiceNotFound")),
        };
        if invoice == InvoiceState::Confirmed {
            return Err(failure(402, "CannotCancelSettledInvoice"));
        }
        state.update_invoice(self.key, id, |invoice| invoice.state = InvoiceState::Canceled);
        state.resolve_held(self.key, id, None);
        self.shared.resolved.notify_all();
        Ok(RpcMsg::Success)
    }

    /// Checks that every hop is able to forward the HTLC, returning its path
    fn walk(&self, state: &State, route: &Route) -> Result<Vec<Leg>, Error> {
        let mut current = self.key;
        let mut legs = Vec::<Leg>::with_capacity(route.hops.len());
        for (index, hop) in route.hops.iter().enumerate() {
            let channel_no = state
                .channels
                .iter()
                .position(|sim| {
                    sim.channel.id == hop.channel
                        && sim.channel.counterparty(&current) == Some(hop.public_key)
                })
                .ok_or_else(|| routing(FailureReason::UnknownNextPeer, index))?;
            let sim = &state.channels[channel_no];
            let amount = hop.incoming_mtokens();
            let policy = sim.channel.policy_of(&current).expect("channel side");
            if policy.is_disabled {
                return Err(routing(FailureReason::ChannelDisabled, index));
            }
            if !policy.admits(amount) {
                return Err(routing(FailureReason::AmountBelowMinimum, index));
            }
            if state.failing_pairs.contains(&(current, hop.public_key))
                || sim.balances.get(&current).copied().unwrap_or_default() < amount
            {
                return Err(routing(FailureReason::TemporaryChannelFailure, index));
            }
            legs.push((channel_no, current, hop.public_key, amount));
            current = hop.public_key;
        }
        Ok(legs)
    }

    fn send_to_route(
        &self,
        request: SendToRoute,
        timeout: Option<Duration>,
    ) -> Result<RpcMsg, Error> {
        let SendToRoute { id, route } = request;
        let mut state = self.lock();
        state.sent_htlcs += 1;

        let legs = match self.walk(&state, &route) {
            Ok(legs) => legs,
            Err(err) => return Err(state.reject(self.key, id, err)),
        };
        let destination = legs.last().map(|(_, _, to, _)| *to).unwrap_or(self.key);
        let final_index = route.hops.len();
        let delivered = route.hops.last().map(|hop| hop.forward_mtokens).unwrap_or_default();

        let stored = state.nodes.get(&destination).and_then(|node| node.invoices.get(&id));
        let (is_hold, preimage) = match stored {
            Some(stored)
                if stored.invoice.state == InvoiceState::Created
                    && delivered >= stored.invoice.mtokens =>
            {
                (stored.invoice.is_hold, stored.preimage)
            }
            _ => {
                let rejection = routing(FailureReason::PaymentRejectedByDestination, final_index);
                return Err(state.reject(self.key, id, rejection));
            }
        };

        // Lock HTLC amounts along the route
        for (index, from, _, amount) in &legs {
            *state.channels[*index].balances.entry(*from).or_default() -= amount;
        }
        state.publish_forwards(&legs, delivered, ForwardState::Pending);
        state.record_sent(self.key, PaymentStatus {
            id,
            state: PaymentState::Pending,
            secret: None,
            failure: None,
        });

        if !is_hold {
            let preimage = preimage.expect("regular invoices have preimage");
            state.settle_legs(&legs);
            state.publish_forwards(&legs, delivered, ForwardState::Confirmed);
            let node = state.nodes.get_mut(&destination).expect("known node");
            node.settle_count += 1;
            let confirmed_index = node.settle_count;
            state.update_invoice(destination, id, |invoice| {
                invoice.state = InvoiceState::Confirmed;
                invoice.secret = Some(preimage);
                invoice.received_mtokens = delivered;
                invoice.confirmed_at = Some(Utc::now());
                invoice.confirmed_index = Some(confirmed_index);
            });
            state.record_sent(self.key, PaymentStatus {
                id,
                state: PaymentState::Confirmed,
                secret: Some(preimage),
                failure: None,
            });
            return Ok(RpcMsg::PaymentSent(PaymentSent { secret: preimage, route }));
        }

        state.update_invoice(destination, id, |invoice| {
            invoice.state = InvoiceState::Held;
            invoice.received_mtokens = delivered;
        });
        state.held.push(Htlc { sender: self.key, destination, id, legs, delivered });

        // Stays in flight after the caller gives up waiting
        let timeout = timeout.unwrap_or(DEFAULT_TIMEOUT);
        let deadline = Instant::now() + timeout;
        loop {
            match state.nodes[&self.key].sent.get(&id) {
                Some(PaymentStatus {
                    state: PaymentState::Confirmed, secret: Some(secret), ..
                }) => {
                    let secret = *secret;
                    return Ok(RpcMsg::PaymentSent(PaymentSent { secret, route }));
                }
                Some(PaymentStatus { state: PaymentState::Failed, .. }) => {
                    return Err(routing(FailureReason::PaymentRejectedByDestination, final_index));
                }
                _ => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout(timeout));
            }
            state = self.shared.resolved.wait_timeout(state, deadline - now).expect("poisoned").0;
        }
    }
}

impl Transport for Node {
    fn call(&self, request: RpcMsg, timeout: Option<Duration>) -> Result<RpcMsg, Error> {
        match request {
            RpcMsg::GetInfo => {
                let state = self.lock();
                Ok(RpcMsg::NodeInfo(NodeInfo {
                    public_key: self.key,
                    alias: state.nodes[&self.key].alias.clone(),
                    current_block_height: state.height,
                    is_synced_to_chain: true,
                    version: s!("0.8.0-sim"),
                }))
            }
            RpcMsg::GetChannel(id) => self
                .lock()
                .channels
                .iter()
                .find(|sim| sim.channel.id == id)
                .map(|sim| RpcMsg::Channel(sim.channel.clone()))
                .ok_or_else(|| failure(404, "FullChannelDetailsNotFound")),
            RpcMsg::GetNetworkGraph => {
                let state = self.lock();
                Ok(RpcMsg::NetworkGraph(NetworkGraph {
                    channels: state.channels.iter().map(|sim| sim.channel.clone()).collect(),
                    nodes: state
                        .nodes
                        .iter()
                        .map(|(key, node)| GraphNode {
                            public_key: *key,
                            alias: node.alias.clone(),
                            updated_at: None,
                        })
                        .collect(),
                }))
            }
            RpcMsg::CreateInvoice(CreateInvoice {
                mtokens,
                description,
                expires_at,
                cltv_delta,
                secret,
            }) => {
                let preimage = secret.unwrap_or_else(Preimage::random);
                let id = preimage.payment_hash();
                let terms = CreateHoldInvoice { id, mtokens, description, expires_at, cltv_delta };
                self.create_invoice(Some(preimage), terms)
            }
            RpcMsg::CreateHoldInvoice(terms) => self.create_invoice(None, terms),
            RpcMsg::GetInvoice(id) => self.invoice(id),
            RpcMsg::GetInvoices(GetInvoices { added_after }) => Ok(self.invoices(added_after)),
            RpcMsg::SettleHoldInvoice(preimage) => self.settle(preimage),
            RpcMsg::CancelHoldInvoice(id) => self.cancel(id),
            RpcMsg::SendToRoute(request) => self.send_to_route(request, timeout),
            RpcMsg::GetPaymentStatus(id) => self
                .lock()
                .nodes[&self.key]
                .sent
                .get(&id)
                .cloned()
                .map(RpcMsg::PaymentStatus)
                .ok_or_else(|| failure(404, "SentPaymentNotFound")),
            RpcMsg::GetBackup(point) => self
                .lock()
                .backups(self.key)
                .channels
                .into_iter()
                .find(|backup| backup.channel_point() == point)
                .map(RpcMsg::Backup)
                .ok_or_else(|| failure(404, "ChannelBackupNotFound")),
            RpcMsg::GetBackups => Ok(RpcMsg::Backups(self.lock().backups(self.key))),
            RpcMsg::VerifyBackup(VerifyBackup { backup, channel }) => {
                let key = self.lock().nodes[&self.key].backup_key.clone();
                Ok(verify(&key, &backup, &[channel]))
            }
            RpcMsg::VerifyBackups(VerifyBackups { backup, channels }) => {
                let key = self.lock().nodes[&self.key].backup_key.clone();
                Ok(verify(&key, &backup, &channels))
            }
            other => Err(Error::Failure(Failure::new(
                FailureCode::BadRequest,
                format!("{} is not a request", other.method()),
            ))),
        }
    }

    fn subscribe(&self, topic: Topic) -> Result<Subscription, Error> {
        let (subscription, mut feed) = Subscription::channel(topic.clone());
        let mut state = self.lock();
        if let Some(request) = topic.snapshot_request() {
            let node = &state.nodes[&self.key];
            let invoices = node.invoices.values().map(|stored| stored.invoice.clone()).collect();
            for event in topic.snapshot_events(RpcMsg::Invoices(invoices)) {
                feed.publish(event);
            }
            trace!("Delivered snapshot of {}", request);
        }
        state.nodes.get_mut(&self.key).expect("known node").feeds.push((topic, feed));
        Ok(subscription)
    }
}

/// Network of Alice, Bob, Carol and Dave. Alice has a channel to Bob and to Carol, both of
/// which have channels to Dave.
pub struct Diamond {
    pub network: Network,
    pub alice: Node,
    pub bob: Node,
    pub carol: Node,
    pub dave: Node,
    pub alice_bob: ShortChannelId,
    pub alice_carol: ShortChannelId,
    pub bob_dave: ShortChannelId,
    pub carol_dave: ShortChannelId,
}

impl Diamond {
    pub fn new() -> Diamond {
        let network = Network::new();
        let alice = network.add_node(1, "alice");
        let bob = network.add_node(2, "bob");
        let carol = network.add_node(3, "carol");
        let dave = network.add_node(4, "dave");
        let alice_bob = network.open_channel(&alice, &bob, 1_000_000);
        let alice_carol = network.open_channel(&alice, &carol, 1_000_000);
        let bob_dave = network.open_channel(&bob, &dave, 1_000_000);
        let carol_dave = network.open_channel(&carol, &dave, 1_000_000);
        // Carol is pricier, so routes go over Bob unless he fails
        network.update_policy(carol_dave, &carol, |policy| policy.base_fee_mtokens = 2000);
        Diamond { network, alice, bob, carol, dave, alice_bob, alice_carol, bob_dave, carol_dave }
    }
}
