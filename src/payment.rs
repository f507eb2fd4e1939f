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

//! Payment engine: pays over explicit routes and BOLT-11 payment requests, tests the network
//! for usable routes with unsettleable HTLCs and keeps the ledger of sent payments.
//!
//! Each payment is a sequence of attempts, each over a different route. Outcome of every
//! attempt, route tests included, is fed into the [`ReputationStore`], so pathfinding learns which
//! node pairs are able to forward. A payment ends in exactly one terminal state, which is
//! announced to payment subscribers. When the node does not answer an attempt in time, the
//! HTLC may still be in flight: such a payment stays pending and its outcome is looked up from
//! the node whenever the payment is queried.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use amplify::Wrapper;
use bitcoin::hashes::sha256;
use bitcoin::secp256k1::PublicKey;
use chrono::Utc;
use lightning_invoice::Invoice as PaymentRequest;
use ln_rpc::model::MTOKENS_PER_TOKEN;
use ln_rpc::{
    Failure, NetworkGraph, NodeInfo, Payment, PaymentSecret, PaymentSent, PaymentState,
    PaymentStatus, Preimage, Route, RpcMsg, SendToRoute, Topic, Transport,
};

use crate::automata::StateMachine;
use crate::forward::ForwardUpdates;
use crate::reputation::{Confidence, ReputationStore};
use crate::route::{find_route, CostModel, IgnoredPair, RouteConstraints, RouteParams};
use crate::{Error, PaymentConfig, RoutingFailure};

/// Notification about a change of a payment state
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum PaymentEvent {
    /// Payment was registered and its first attempt is about to start
    Paying(Payment),

    Confirmed(Payment),

    Failed(Payment),
}

impl PaymentEvent {
    pub fn payment(&self) -> &Payment {
        match self {
            PaymentEvent::Paying(payment)
            | PaymentEvent::Confirmed(payment)
            | PaymentEvent::Failed(payment) => payment,
        }
    }

    #[inline]
    pub fn id(&self) -> sha256::Hash { self.payment().id }
}

impl Display for PaymentEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            PaymentEvent::Paying(_) => "paying",
            PaymentEvent::Confirmed(_) => "confirmed",
            PaymentEvent::Failed(_) => "failed",
        };
        write!(f, "{}({})", name, self.id())
    }
}

/// Result of a confirmed payment
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct PaymentSuccess {
    pub id: sha256::Hash,

    /// Preimage revealed by the destination, proving the payment
    pub secret: Preimage,

    /// Route of the successful attempt
    pub route: Route,

    pub fee_mtokens: u64,

    /// Number of attempts the payment took
    pub attempts: u32,
}

impl Display for PaymentSuccess {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "paid {} with {} mtokens fee in {} attempt(s)",
            self.id, self.fee_mtokens, self.attempts
        )
    }
}

/// Parameters of [`PaymentEngine::pay_via_request`]
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct PayOptions {
    /// Amount to pay; required for requests without an amount, may exceed the requested one
    pub mtokens: Option<u64>,

    /// Restrictions on the routes the payment may take
    pub constraints: RouteConstraints,

    /// Overrides configured number of attempts
    pub max_attempts: Option<u32>,

    /// Timeout of each node call; overrides the configured one
    pub timeout: Option<Duration>,
}

/// Parameters of the pathfinding-only and probing operations
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct ProbeOptions {
    pub constraints: RouteConstraints,

    /// CLTV delta of the destination; configured default when absent
    pub cltv_delta: Option<u16>,

    /// Pathfinding ignores the recorded reputation of node pairs. Outcomes of route tests
    /// are still recorded.
    pub is_ignoring_past_failures: bool,

    /// Overrides configured number of attempts
    pub max_attempts: Option<u32>,

    pub payment: Option<PaymentSecret>,

    pub total_mtokens: Option<u64>,

    /// Timeout of each node call; overrides the configured one
    pub timeout: Option<Duration>,
}

/// Estimate of the cost of paying a request
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Display)]
#[display("{fee_mtokens} mtokens fee, timeout at {timeout}")]
pub struct FeeEstimate {
    pub fee_mtokens: u64,

    /// Absolute CLTV expiry of the first HTLC
    pub timeout: u32,
}

/// Details of a decoded payment request needed to pay it
struct RequestDetails {
    id: sha256::Hash,
    destination: PublicKey,
    mtokens: u64,
    cltv_delta: u16,
    payment: PaymentSecret,
}

/// Sends payments through the node and keeps the ledger of their outcomes
#[derive(Debug)]
pub struct PaymentEngine<T: Transport> {
    transport: T,
    config: PaymentConfig,
    reputation: Arc<ReputationStore>,
    payments: Mutex<BTreeMap<sha256::Hash, Payment>>,
    /// Pending payments whose last attempt has an unknown outcome
    unresolved: Mutex<BTreeSet<sha256::Hash>>,
    subscribers: Mutex<Vec<Sender<PaymentEvent>>>,
}

fn lock<D>(mutex: &Mutex<D>) -> MutexGuard<D> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T: Transport> PaymentEngine<T> {
    pub fn with(transport: T, config: PaymentConfig, reputation: Arc<ReputationStore>) -> Self {
        PaymentEngine {
            transport,
            config,
            reputation,
            payments: empty!(),
            unresolved: empty!(),
            subscribers: empty!(),
        }
    }

    #[inline]
    pub fn reputation(&self) -> &ReputationStore { &self.reputation }

    #[inline]
    pub fn config(&self) -> &PaymentConfig { &self.config }

    // Node queries
    // ------------

    #[inline]
    fn timeout(&self, requested: Option<Duration>) -> Option<Duration> {
        requested.or(self.config.call_timeout)
    }

    fn node_info(&self, timeout: Option<Duration>) -> Result<NodeInfo, Error> {
        let timeout = self.timeout(timeout);
        rpc_call!(self.transport, RpcMsg::GetInfo, timeout => RpcMsg::NodeInfo(info) => info)
    }

    fn network_graph(&self, timeout: Option<Duration>) -> Result<NetworkGraph, Error> {
        let timeout = self.timeout(timeout);
        rpc_call!(
            self.transport, RpcMsg::GetNetworkGraph, timeout => RpcMsg::NetworkGraph(graph) => graph
        )
    }

    fn send_to_route(
        &self,
        id: sha256::Hash,
        route: &Route,
        timeout: Option<Duration>,
    ) -> Result<PaymentSent, Error> {
        let request = RpcMsg::SendToRoute(SendToRoute { id, route: route.clone() });
        let timeout = self.timeout(timeout);
        rpc_call!(self.transport, request, timeout => RpcMsg::PaymentSent(sent) => sent)
    }

    fn payment_status(&self, id: sha256::Hash) -> Result<PaymentStatus, Error> {
        let request = RpcMsg::GetPaymentStatus(id);
        let timeout = self.config.call_timeout;
        rpc_call!(self.transport, request, timeout => RpcMsg::PaymentStatus(status) => status)
    }

    // Ledger
    // ------

    fn notify(&self, event: PaymentEvent) {
        debug!("Payment event {}", event);
        lock(&self.subscribers).retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    /// Registers new pending payment. Payments which have failed may be attempted again.
    fn register(&self, payment: Payment) -> Result<(), Error> {
        if lock(&self.unresolved).contains(&payment.id) {
            self.resolve(payment.id);
        }
        let mut payments = lock(&self.payments);
        match payments.get(&payment.id).map(|known| known.state) {
            Some(PaymentState::Confirmed) => return Err(Error::state("PaymentAlreadyConfirmed")),
            Some(PaymentState::Pending) => return Err(Error::state("PaymentIsPending")),
            Some(PaymentState::Failed) | None => {}
        }
        payments.insert(payment.id, payment.clone());
        drop(payments);
        self.notify(PaymentEvent::Paying(payment));
        Ok(())
    }

    /// Moves pending payment into a terminal state
    fn finish(&self, id: sha256::Hash, update: impl FnOnce(&mut Payment)) {
        let mut payments = lock(&self.payments);
        let payment = match payments.get_mut(&id) {
            Some(payment) => payment,
            None => return,
        };
        let before = payment.state;
        update(payment);
        if let Err(err) = before.next(payment.state) {
            error!("Payment {} {}; keeping it {}", id, err, before);
            payment.state = before;
            return;
        }
        let event = match payment.state {
            PaymentState::Confirmed => PaymentEvent::Confirmed(payment.clone()),
            PaymentState::Failed => PaymentEvent::Failed(payment.clone()),
            PaymentState::Pending => return,
        };
        drop(payments);
        lock(&self.unresolved).remove(&id);
        self.notify(event);
    }

    fn confirm(&self, id: sha256::Hash, success: &PaymentSuccess) {
        info!("Payment {} is confirmed", id);
        self.finish(id, |payment| {
            payment.state = PaymentState::Confirmed;
            payment.secret = Some(success.secret);
            payment.fee_mtokens = success.fee_mtokens;
            payment.hops = success.route.hops.clone();
            payment.attempts = success.attempts;
            payment.confirmed_at = Some(Utc::now());
        });
    }

    fn fail(&self, id: sha256::Hash, err: &Error, route: Option<&Route>, attempts: u32) {
        warn!("Payment {} has failed: {}", id, err);
        self.finish(id, |payment| {
            payment.state = PaymentState::Failed;
            payment.failure = Some(err.failure());
            payment.attempts = attempts;
            if let Some(route) = route {
                payment.hops = route.hops.clone();
            }
        });
    }

    /// Keeps payment pending after an attempt whose outcome is unknown
    fn keep_pending(&self, id: sha256::Hash, err: &Error, route: &Route, attempts: u32) {
        warn!("Outcome of payment {} is unknown ({}); keeping it pending", id, err);
        if let Some(payment) = lock(&self.payments).get_mut(&id) {
            payment.hops = route.hops.clone();
            payment.fee_mtokens = route.fee_mtokens;
            payment.attempts = attempts;
        }
        lock(&self.unresolved).insert(id);
    }

    /// Asks the node for the outcome of a payment which was left pending. The payment stays
    /// pending while the node can't tell.
    fn resolve(&self, id: sha256::Hash) {
        match self.payment_status(id) {
            Ok(PaymentStatus { state: PaymentState::Pending, .. }) => {
                trace!("Payment {} is still in flight", id);
            }
            Ok(PaymentStatus { state: PaymentState::Confirmed, secret: Some(secret), .. })
                if secret.payment_hash() == id =>
            {
                info!("Payment {} is confirmed by the node", id);
                self.finish(id, |payment| {
                    payment.state = PaymentState::Confirmed;
                    payment.secret = Some(secret);
                    payment.confirmed_at = Some(Utc::now());
                });
            }
            Ok(PaymentStatus { state: PaymentState::Confirmed, .. }) => {
                self.fail_with(id, Error::PreimageMismatch(id).failure());
            }
            Ok(PaymentStatus { state: PaymentState::Failed, failure, .. }) => {
                let failure = failure.unwrap_or_else(|| Failure::new(503u16, "PaymentFailed"));
                self.fail_with(id, failure);
            }
            // The HTLC has never left the node
            Err(err) if err.is_not_found() => self.fail_with(id, err.failure()),
            Err(err) => debug!("Unable to resolve payment {}: {}", id, err),
        }
    }

    fn fail_with(&self, id: sha256::Hash, failure: Failure) {
        warn!("Payment {} has failed: {}", id, failure);
        self.finish(id, |payment| {
            payment.state = PaymentState::Failed;
            payment.failure = Some(failure);
        });
    }

    fn resolve_all(&self) {
        let unresolved = lock(&self.unresolved).iter().copied().collect::<Vec<_>>();
        for id in unresolved {
            self.resolve(id);
        }
    }

    /// Sent payment by its payment hash
    pub fn get_payment(&self, id: sha256::Hash) -> Result<Payment, Error> {
        if lock(&self.unresolved).contains(&id) {
            self.resolve(id);
        }
        lock(&self.payments)
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("SentPaymentNotFound"))
    }

    /// All sent payments, oldest first
    pub fn get_payments(&self) -> Vec<Payment> {
        self.resolve_all();
        let mut payments = lock(&self.payments).values().cloned().collect::<Vec<_>>();
        payments.sort_by_key(|payment| payment.created_at);
        payments
    }

    pub fn get_failed_payments(&self) -> Vec<Payment> {
        self.get_payments()
            .into_iter()
            .filter(|payment| payment.state == PaymentState::Failed)
            .collect()
    }

    /// Removes records of payments in terminal states, returning the number of removed records.
    /// Pending payments are kept.
    pub fn delete_payments(&self) -> usize {
        let mut payments = lock(&self.payments);
        let count = payments.len();
        payments.retain(|_, payment| payment.state == PaymentState::Pending);
        count - payments.len()
    }

    /// HTLCs sent, received and forwarded by the node from now on
    pub fn subscribe_to_forwards(&self) -> Result<ForwardUpdates, Error> {
        Ok(ForwardUpdates::with(self.transport.subscribe(Topic::Forwards)?))
    }

    /// Receives an event for every payment state change from now on. Dropping the receiver
    /// unsubscribes without affecting the payments.
    pub fn subscribe_to_payments(&self) -> Receiver<PaymentEvent> {
        let (sender, receiver) = mpsc::channel();
        lock(&self.subscribers).push(sender);
        receiver
    }

    // Attempts
    // --------

    /// Single attempt over the route, recording its outcome in the reputation store
    fn attempt(
        &self,
        source: PublicKey,
        id: sha256::Hash,
        route: &Route,
        timeout: Option<Duration>,
    ) -> Result<Preimage, Error> {
        debug!("Sending {} over {} hops", id, route.hops.len());
        let result = self.send_to_route(id, route, timeout);
        let now = Utc::now();
        match result {
            Ok(sent) if sent.secret.payment_hash() == id => {
                self.reputation.record_route(source, route, None, now);
                Ok(sent.secret)
            }
            Ok(_) => Err(Error::PreimageMismatch(id)),
            Err(Error::Routing(failure)) => {
                // Any failure reported from the destination means all hops have forwarded
                let failed_index = failure
                    .index
                    .map(|index| index as usize)
                    .filter(|index| *index < route.hops.len());
                match failure.index {
                    Some(_) => self.reputation.record_route(source, route, failed_index, now),
                    None => warn!(
                        "Failure of {} does not name the failing hop; reputation is not updated",
                        id
                    ),
                }
                Err(Error::Routing(failure))
            }
            Err(err) => Err(err),
        }
    }

    /// Pays over the given route. The route must lock funds with `id`, and the destination must
    /// reveal its preimage. `timeout` overrides the configured timeout of the node calls.
    pub fn pay_via_route(
        &self,
        route: &Route,
        id: sha256::Hash,
        timeout: Option<Duration>,
    ) -> Result<PaymentSuccess, Error> {
        let destination =
            route.destination().ok_or_else(|| Error::validation("route must not be empty"))?;
        let source = self.node_info(timeout)?.public_key;

        self.register(Payment {
            id,
            destination,
            request: None,
            state: PaymentState::Pending,
            mtokens: route.delivered_mtokens(),
            fee_mtokens: route.fee_mtokens,
            hops: route.hops.clone(),
            secret: None,
            created_at: Utc::now(),
            confirmed_at: None,
            failure: None,
            attempts: 0,
        })?;

        match self.attempt(source, id, route, timeout) {
            Ok(secret) => {
                let success = PaymentSuccess {
                    id,
                    secret,
                    route: route.clone(),
                    fee_mtokens: route.fee_mtokens,
                    attempts: 1,
                };
                self.confirm(id, &success);
                Ok(success)
            }
            Err(err) if err.is_outcome_unknown() => {
                self.keep_pending(id, &err, route, 1);
                Err(err)
            }
            Err(err) => {
                self.fail(id, &err, Some(route), 1);
                Err(err)
            }
        }
    }

    fn decode_request(&self, request: &str, mtokens: Option<u64>) -> Result<RequestDetails, Error> {
        let invoice = PaymentRequest::from_str(request)
            .map_err(|err| Error::validation(format!("invalid payment request: {}", err)))?;
        if invoice.is_expired() {
            return Err(Error::validation("payment request has expired"));
        }
        let mtokens = match (invoice.amount_milli_satoshis(), mtokens) {
            (Some(requested), Some(paid)) if paid < requested => {
                return Err(Error::validation(format!(
                    "payment of {} mtokens is below requested {} mtokens",
                    paid, requested
                )))
            }
            (_, Some(paid)) => paid,
            (Some(requested), None) => requested,
            (None, None) => {
                return Err(Error::validation("payment request does not specify amount"))
            }
        };
        let cltv_delta = u16::try_from(invoice.min_final_cltv_expiry())
            .map_err(|_| Error::validation("payment request final CLTV delta is too large"))?;
        // Payment requests are signed with keys of their own secp256k1 version
        let payee = invoice.recover_payee_pub_key().serialize();
        let destination = PublicKey::from_slice(&payee)
            .map_err(|err| Error::validation(format!("invalid payee key: {}", err)))?;
        Ok(RequestDetails {
            id: *invoice.payment_hash(),
            destination,
            mtokens,
            cltv_delta,
            payment: PaymentSecret::from_inner(invoice.payment_secret().0),
        })
    }

    fn route_params(&self, height: u32, mtokens: u64, cltv_delta: Option<u16>) -> RouteParams {
        let cltv_delta = cltv_delta.unwrap_or(self.config.final_cltv_delta);
        RouteParams {
            height,
            mtokens,
            initial_cltv: cltv_delta.saturating_add(self.config.cltv_padding),
            payment: None,
            total_mtokens: None,
        }
    }

    /// Finds route through the graph weighting node pairs by their reputation
    fn find(
        &self,
        graph: &NetworkGraph,
        source: PublicKey,
        destination: PublicKey,
        params: &RouteParams,
        constraints: &RouteConstraints,
        is_ignoring_past_failures: bool,
    ) -> Option<Route> {
        let mut constraints = constraints.clone();
        constraints.max_timeout_height = Some(
            constraints
                .max_timeout_height
                .unwrap_or(u32::MAX)
                .min(params.height.saturating_add(self.config.max_timeout_delta)),
        );
        let cost_model = CostModel::from(&self.config);
        if is_ignoring_past_failures {
            let baseline = self.reputation.get_settings().baseline_success_rate;
            find_route(graph, source, destination, params, &constraints, &cost_model, |_, _, _| {
                baseline
            })
        } else {
            let now = Utc::now();
            let reputation = &self.reputation;
            let confidence = |from: &PublicKey, to: &PublicKey, mtokens: u64| {
                reputation.confidence_at(from, to, mtokens, now)
            };
            find_route(graph, source, destination, params, &constraints, &cost_model, confidence)
        }
    }

    /// Pays BOLT-11 payment request, trying up to the configured number of routes
    pub fn pay_via_request(
        &self,
        request: &str,
        options: &PayOptions,
    ) -> Result<PaymentSuccess, Error> {
        let details = self.decode_request(request, options.mtokens)?;
        let id = details.id;
        let node = self.node_info(options.timeout)?;

        self.register(Payment {
            id,
            destination: details.destination,
            request: Some(request.to_owned()),
            state: PaymentState::Pending,
            mtokens: details.mtokens,
            fee_mtokens: 0,
            hops: vec![],
            secret: None,
            created_at: Utc::now(),
            confirmed_at: None,
            failure: None,
            attempts: 0,
        })?;

        let graph = match self.network_graph(options.timeout) {
            Ok(graph) => graph,
            Err(err) => {
                self.fail(id, &err, None, 0);
                return Err(err);
            }
        };
        let height = node.current_block_height;
        let params = RouteParams {
            payment: Some(details.payment),
            total_mtokens: Some(details.mtokens),
            ..self.route_params(height, details.mtokens, Some(details.cltv_delta))
        };
        let max_attempts = options.max_attempts.unwrap_or(self.config.max_attempts);
        let mut constraints = options.constraints.clone();
        let mut last: Option<(Error, Route)> = None;
        let mut attempts = 0;

        for attempt in 1..=max_attempts {
            let route = match self.find(
                &graph,
                node.public_key,
                details.destination,
                &params,
                &constraints,
                false,
            ) {
                Some(route) => route,
                None => break,
            };
            trace!("Payment {} attempt {} over route {}", id, attempt, route);
            attempts = attempt;

            match self.attempt(node.public_key, id, &route, options.timeout) {
                Ok(secret) => {
                    let success = PaymentSuccess {
                        id,
                        secret,
                        fee_mtokens: route.fee_mtokens,
                        route,
                        attempts: attempt,
                    };
                    self.confirm(id, &success);
                    return Ok(success);
                }
                Err(Error::Routing(failure)) if !failure.reason.is_destination_rejection() => {
                    debug!("Attempt {} of payment {} has failed: {}", attempt, id, failure);
                    match failing_pair(node.public_key, &route, failure) {
                        Some(pair) => {
                            constraints.ignore_pairs.insert(pair);
                        }
                        // Without knowing the failing pair the same route would be found again
                        None => {
                            let err = Error::Routing(failure);
                            self.fail(id, &err, Some(&route), attempt);
                            return Err(err);
                        }
                    }
                    last = Some((Error::Routing(failure), route));
                }
                Err(err) if err.is_outcome_unknown() => {
                    self.keep_pending(id, &err, &route, attempt);
                    return Err(err);
                }
                Err(err) => {
                    self.fail(id, &err, Some(&route), attempt);
                    return Err(err);
                }
            }
        }

        let (err, route) = match last {
            Some((err, route)) => (err, Some(route)),
            None => (Error::Routing(RoutingFailure::no_route()), None),
        };
        self.fail(id, &err, route.as_ref(), attempts);
        Err(err)
    }

    /// Runs [`PaymentEngine::pay_via_request`] in a separate thread
    pub fn spawn_pay_via_request(
        engine: Arc<Self>,
        request: String,
        options: PayOptions,
    ) -> Result<JoinHandle<Result<PaymentSuccess, Error>>, Error>
    where
        T: 'static,
    {
        let handle = thread::Builder::new()
            .name(s!("payment"))
            .spawn(move || engine.pay_via_request(&request, &options))?;
        Ok(handle)
    }

    // Pathfinding
    // -----------

    /// Finds route to the destination without sending anything
    pub fn get_route_to_destination(
        &self,
        destination: PublicKey,
        mtokens: u64,
        options: &ProbeOptions,
    ) -> Result<Route, Error> {
        let node = self.node_info(options.timeout)?;
        let graph = self.network_graph(options.timeout)?;
        let params = RouteParams {
            payment: options.payment,
            total_mtokens: options.total_mtokens,
            ..self.route_params(node.current_block_height, mtokens, options.cltv_delta)
        };
        self.find(
            &graph,
            node.public_key,
            destination,
            &params,
            &options.constraints,
            options.is_ignoring_past_failures,
        )
        .ok_or_else(|| RoutingFailure::no_route().into())
    }

    /// Looks for a route able to deliver `mtokens` to the destination by sending HTLCs which
    /// the destination can't settle. Nothing is paid and no payment is registered; learned
    /// reputation is kept.
    pub fn probe_for_route(
        &self,
        destination: PublicKey,
        mtokens: u64,
        options: &ProbeOptions,
    ) -> Result<Route, Error> {
        let node = self.node_info(options.timeout)?;
        let graph = self.network_graph(options.timeout)?;
        let params = RouteParams {
            payment: options.payment,
            total_mtokens: options.total_mtokens,
            ..self.route_params(node.current_block_height, mtokens, options.cltv_delta)
        };
        let max_attempts = options.max_attempts.unwrap_or(self.config.max_attempts);
        let mut constraints = options.constraints.clone();

        for attempt in 1..=max_attempts {
            let route = self
                .find(
                    &graph,
                    node.public_key,
                    destination,
                    &params,
                    &constraints,
                    options.is_ignoring_past_failures,
                )
                .ok_or_else(|| Error::from(RoutingFailure::no_route()))?;

            let id = Preimage::random().payment_hash();
            trace!("Route test attempt {} over route {}", attempt, route);
            match self.attempt(node.public_key, id, &route, options.timeout) {
                Err(Error::Routing(failure)) if failure.reason.is_destination_rejection() => {
                    debug!("Route to {} proven after {} attempt(s)", destination, attempt);
                    return Ok(route);
                }
                Ok(_) => {
                    warn!("Destination {} has settled an HTLC with a random hash", destination);
                    return Ok(route);
                }
                Err(Error::Routing(failure)) => match failing_pair(node.public_key, &route, failure)
                {
                    Some(pair) => {
                        constraints.ignore_pairs.insert(pair);
                    }
                    None => return Err(Error::Routing(failure)),
                },
                Err(err) => return Err(err),
            }
        }
        Err(RoutingFailure::no_route().into())
    }

    /// Checks whether the destination is reachable with the amount, by probing. Defaults to a
    /// single token.
    pub fn is_destination_payable(
        &self,
        destination: PublicKey,
        mtokens: Option<u64>,
    ) -> Result<bool, Error> {
        let mtokens = mtokens.unwrap_or(MTOKENS_PER_TOKEN);
        match self.probe_for_route(destination, mtokens, &default!()) {
            Ok(_) => Ok(true),
            Err(Error::Routing(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Estimates fee and timelock of paying the request by probing a route to its destination
    pub fn get_routing_fee_estimate(&self, request: &str) -> Result<FeeEstimate, Error> {
        let details = self.decode_request(request, None)?;
        let options = ProbeOptions {
            cltv_delta: Some(details.cltv_delta),
            payment: Some(details.payment),
            total_mtokens: Some(details.mtokens),
            ..default!()
        };
        let route = self.probe_for_route(details.destination, details.mtokens, &options)?;
        Ok(FeeEstimate { fee_mtokens: route.fee_mtokens, timeout: route.timeout })
    }

    /// Success probability of the route according to the current reputation, starting at the
    /// node itself unless `source` is given
    pub fn get_route_confidence(
        &self,
        route: &Route,
        source: Option<PublicKey>,
    ) -> Result<Confidence, Error> {
        let source = match source {
            Some(source) => source,
            None => self.node_info(None)?.public_key,
        };
        Ok(self.reputation.route_confidence(source, route))
    }
}

/// Node pair which could not forward the attempt
fn failing_pair(source: PublicKey, route: &Route, failure: RoutingFailure) -> Option<IgnoredPair> {
    let index = failure.index? as usize;
    if index >= route.hops.len() {
        return None;
    }
    let from = if index == 0 { source } else { route.hops[index - 1].public_key };
    Some(IgnoredPair { from, to: route.hops[index].public_key })
}
