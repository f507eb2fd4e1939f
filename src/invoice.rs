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

//! Invoices and the hold invoice lifecycle.
//!
//! A hold invoice is created with a payment hash whose preimage only the caller knows. Once
//! the HTLC paying it arrives the invoice is `held`, and the caller either reveals the preimage
//! to settle it or cancels it. Updates of invoices are streamed in the order of their sequence
//! numbers and are validated against the lifecycle, so no invoice is ever observed moving
//! backwards.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bitcoin::hashes::sha256;
use chrono::{DateTime, Utc};
use ln_rpc::{
    CreateHoldInvoice, CreateInvoice, Event, GetInvoices, Invoice, InvoiceState, Preimage,
    RpcMsg, Subscription, Topic, Transport,
};

use crate::automata::{InvoiceLifecycle, StateMachine};
use crate::Error;

/// Optional parameters of a new invoice
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct InvoiceOptions {
    pub description: Option<String>,

    pub expires_at: Option<DateTime<Utc>>,

    /// CLTV delta required for the final HTLC
    pub cltv_delta: Option<u16>,

    /// Preimage to use; the node generates one when absent. Not allowed for hold invoices.
    pub secret: Option<Preimage>,
}

impl InvoiceOptions {
    fn validate(&self) -> Result<(), Error> {
        if matches!(self.expires_at, Some(expires_at) if expires_at <= Utc::now()) {
            return Err(Error::validation("invoice expiration must be in the future"));
        }
        if self.cltv_delta == Some(0) {
            return Err(Error::validation("invoice CLTV delta must be positive"));
        }
        Ok(())
    }
}

/// Creates invoices and drives hold invoices through their lifecycle
#[derive(Debug)]
pub struct InvoiceManager<T: Transport> {
    transport: T,
    timeout: Option<Duration>,
}

impl<T: Transport> InvoiceManager<T> {
    pub fn with(transport: T) -> Self { InvoiceManager { transport, timeout: None } }

    /// Limits each node call made by the manager to `timeout` instead of the transport default
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn create_invoice(&self, mtokens: u64, options: &InvoiceOptions) -> Result<Invoice, Error> {
        options.validate()?;
        let request = RpcMsg::from(CreateInvoice {
            mtokens,
            description: options.description.clone(),
            expires_at: options.expires_at,
            cltv_delta: options.cltv_delta,
            secret: options.secret,
        });
        let invoice =
            rpc_call!(self.transport, request, self.timeout => RpcMsg::Invoice(new) => new)?;
        debug!("Created invoice {} for {} mtokens", invoice.id, invoice.mtokens);
        Ok(invoice)
    }

    /// Creates invoice locked to the given payment hash, which stays held once paid until
    /// settled with the preimage or canceled
    pub fn create_hold_invoice(
        &self,
        id: sha256::Hash,
        mtokens: u64,
        options: &InvoiceOptions,
    ) -> Result<Invoice, Error> {
        options.validate()?;
        if options.secret.is_some() {
            return Err(Error::validation("hold invoice preimage must stay with the caller"));
        }
        let request = RpcMsg::from(CreateHoldInvoice {
            id,
            mtokens,
            description: options.description.clone(),
            expires_at: options.expires_at,
            cltv_delta: options.cltv_delta,
        });
        let invoice =
            rpc_call!(self.transport, request, self.timeout => RpcMsg::Invoice(new) => new)?;
        debug!("Created hold invoice {} for {} mtokens", invoice.id, invoice.mtokens);
        Ok(invoice)
    }

    pub fn get_invoice(&self, id: sha256::Hash) -> Result<Invoice, Error> {
        let request = RpcMsg::GetInvoice(id);
        rpc_call!(self.transport, request, self.timeout => RpcMsg::Invoice(invoice) => invoice)
    }

    /// All invoices in the order of their creation
    pub fn get_invoices(&self) -> Result<Vec<Invoice>, Error> {
        let request = RpcMsg::GetInvoices(GetInvoices { added_after: None });
        let mut invoices =
            rpc_call!(self.transport, request, self.timeout => RpcMsg::Invoices(list) => list)?;
        invoices.sort_by_key(|invoice| invoice.index);
        Ok(invoices)
    }

    /// Hold invoice matching the preimage
    fn hold_invoice_for(&self, secret: &Preimage) -> Result<Invoice, Error> {
        match self.get_invoice(secret.payment_hash()) {
            Ok(invoice) if invoice.is_hold => Ok(invoice),
            Ok(_) => Err(Error::not_found("SecretDoesNotMatchAnyExistingHodlInvoice")),
            Err(err) if err.is_not_found() => {
                Err(Error::not_found("SecretDoesNotMatchAnyExistingHodlInvoice"))
            }
            Err(err) => Err(err),
        }
    }

    /// Settles held invoice by revealing its preimage. Invoices which have not received the
    /// HTLC yet can't be settled.
    pub fn settle_hold_invoice(&self, secret: Preimage) -> Result<(), Error> {
        let invoice = self.hold_invoice_for(&secret)?;
        match invoice.state {
            InvoiceState::Held => {}
            InvoiceState::Created => {
                return Err(Error::state("CannotSettleHtlcBeforeHtlcReceived"))
            }
            InvoiceState::Confirmed => return Err(Error::state("InvoiceIsAlreadySettled")),
            InvoiceState::Canceled => return Err(Error::state("InvoiceIsCanceled")),
        }
        let request = RpcMsg::SettleHoldInvoice(secret);
        rpc_call!(self.transport, request, self.timeout => RpcMsg::Success => ())?;
        info!("Settled hold invoice {}", invoice.id);
        Ok(())
    }

    /// Cancels invoice which is not settled yet, returning the HTLC if it is held
    pub fn cancel_hold_invoice(&self, id: sha256::Hash) -> Result<(), Error> {
        let invoice = self.get_invoice(id)?;
        if InvoiceLifecycle::from(&invoice).next_state(InvoiceState::Canceled).is_err() {
            return Err(Error::state("CannotCancelSettledInvoice"));
        }
        let request = RpcMsg::CancelHoldInvoice(id);
        rpc_call!(self.transport, request, self.timeout => RpcMsg::Success => ())?;
        info!("Canceled invoice {}", id);
        Ok(())
    }

    /// Updates of a single invoice, starting with its current state
    pub fn subscribe_to_invoice(&self, id: sha256::Hash) -> Result<InvoiceUpdates, Error> {
        Ok(InvoiceUpdates::with(self.transport.subscribe(Topic::Invoice(id))?))
    }

    /// Updates of all invoices. Invoices created after the `added_after` index are delivered
    /// first.
    pub fn subscribe_to_invoices(&self, added_after: Option<u64>) -> Result<InvoiceUpdates, Error> {
        Ok(InvoiceUpdates::with(self.transport.subscribe(Topic::Invoices { added_after })?))
    }
}

/// Stream of invoice updates. Every delivered update moves its invoice forward in the
/// lifecycle; repeated and stale updates are skipped.
#[derive(Debug)]
pub struct InvoiceUpdates {
    subscription: Subscription,
    known: HashMap<sha256::Hash, (InvoiceLifecycle, u64)>,
}

impl InvoiceUpdates {
    fn with(subscription: Subscription) -> Self { InvoiceUpdates { subscription, known: empty!() } }

    fn accept(&mut self, event: Event) -> Option<Invoice> {
        let invoice = match event.invoice() {
            Some(invoice) => invoice.clone(),
            None => return None,
        };
        let lifecycle = InvoiceLifecycle::from(&invoice);
        if let Some((known, sequence)) = self.known.get(&invoice.id).copied() {
            if invoice.sequence <= sequence {
                trace!("Skipping stale update #{} of invoice {}", invoice.sequence, invoice.id);
                return None;
            }
            if let Err(err) = known.next(lifecycle) {
                warn!("Skipping update #{} of invoice {}: {}", invoice.sequence, invoice.id, err);
                return None;
            }
        }
        self.known.insert(invoice.id, (lifecycle, invoice.sequence));
        Some(invoice)
    }

    /// Blocks until the next update
    pub fn recv(&mut self) -> Result<Invoice, Error> {
        loop {
            let event = self.subscription.recv()?;
            if let Some(invoice) = self.accept(event) {
                return Ok(invoice);
            }
        }
    }

    /// Waits up to `timeout` for the next update
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Invoice>, Error> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.subscription.recv_timeout(remaining)? {
                Some(event) => {
                    if let Some(invoice) = self.accept(event) {
                        return Ok(Some(invoice));
                    }
                }
                None => return Ok(None),
            }
        }
    }

    /// Waits until the invoice reaches the given state, returning its update
    pub fn wait_for(
        &mut self,
        id: sha256::Hash,
        state: InvoiceState,
        timeout: Duration,
    ) -> Result<Option<Invoice>, Error> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.recv_timeout(remaining)? {
                Some(invoice) if invoice.id == id && invoice.state == state => {
                    return Ok(Some(invoice))
                }
                Some(_) => continue,
                None => return Ok(None),
            }
        }
    }

    /// Stops the stream; no updates are delivered afterwards
    pub fn close(&mut self) { self.subscription.close() }
}

#[cfg(test)]
mod test {
    use bitcoin::hashes::Hash;
    use chrono::TimeZone;

    use super::*;

    /// Node answering every call after `delay`, or timing out if the caller allows less
    struct SlowNode {
        delay: Duration,
    }

    impl Transport for SlowNode {
        fn call(
            &self,
            request: RpcMsg,
            timeout: Option<Duration>,
        ) -> Result<RpcMsg, ln_rpc::Error> {
            match timeout {
                Some(timeout) if timeout < self.delay => {
                    std::thread::sleep(timeout);
                    Err(ln_rpc::Error::Timeout(timeout))
                }
                _ => {
                    std::thread::sleep(self.delay);
                    match request {
                        RpcMsg::GetInvoice(_) => {
                            Ok(RpcMsg::Invoice(invoice(InvoiceState::Held, 1)))
                        }
                        _ => Ok(RpcMsg::Success),
                    }
                }
            }
        }

        fn subscribe(&self, topic: Topic) -> Result<Subscription, ln_rpc::Error> {
            Ok(Subscription::channel(topic).0)
        }
    }

    fn invoice(state: InvoiceState, sequence: u64) -> Invoice {
        let at = Utc.timestamp(1_600_000_000, 0);
        Invoice {
            id: sha256::Hash::hash(b"hold"),
            secret: None,
            payment: None,
            tokens: 100,
            mtokens: 100_000,
            received_mtokens: 0,
            request: s!("lnbcrt1"),
            description: None,
            cltv_delta: 40,
            created_at: at,
            expires_at: at,
            confirmed_at: None,
            state,
            is_hold: true,
            index: 1,
            confirmed_index: None,
            sequence,
        }
    }

    #[test]
    fn updates_never_go_backwards() {
        let id = sha256::Hash::hash(b"hold");
        let (subscription, mut feed) = Subscription::channel(Topic::Invoice(id));
        let mut updates = InvoiceUpdates::with(subscription);

        let timeout = Duration::from_millis(10);
        feed.publish(Event::from(invoice(InvoiceState::Created, 1)));
        feed.publish(Event::from(invoice(InvoiceState::Held, 4)));
        assert_eq!(updates.recv().unwrap().state, InvoiceState::Created);
        assert_eq!(updates.recv().unwrap().state, InvoiceState::Held);

        // Stale state with a fresh sequence violates the lifecycle
        feed.publish(Event::from(invoice(InvoiceState::Created, 5)));
        assert_eq!(updates.recv_timeout(timeout).unwrap(), None);

        feed.publish(Event::from(invoice(InvoiceState::Confirmed, 6)));
        let settled = updates.wait_for(id, InvoiceState::Confirmed, timeout).unwrap().unwrap();
        assert_eq!(settled.sequence, 6);

        updates.close();
        assert!(updates.recv().is_err());
    }

    #[test]
    fn hold_invoice_skips_confirmation_without_htlc() {
        let id = sha256::Hash::hash(b"hold");
        let (subscription, mut feed) = Subscription::channel(Topic::Invoice(id));
        let mut updates = InvoiceUpdates::with(subscription);

        feed.publish(Event::from(invoice(InvoiceState::Created, 1)));
        assert_eq!(updates.recv().unwrap().state, InvoiceState::Created);
        feed.publish(Event::from(invoice(InvoiceState::Confirmed, 2)));
        assert_eq!(updates.recv_timeout(Duration::from_millis(10)).unwrap(), None);

        feed.publish(Event::from(invoice(InvoiceState::Canceled, 3)));
        assert_eq!(updates.recv().unwrap().state, InvoiceState::Canceled);
    }

    #[test]
    fn short_timeout_fires_before_slow_node_replies() {
        let id = sha256::Hash::hash(b"hold");
        let node = SlowNode { delay: Duration::from_millis(300) };
        let manager = InvoiceManager::with(node).with_timeout(Duration::from_millis(20));

        let started = Instant::now();
        let err = manager.get_invoice(id).unwrap_err();
        assert!(matches!(err, Error::Transport(ln_rpc::Error::Timeout(_))));
        assert!(started.elapsed() < Duration::from_millis(300));
        assert!(matches!(
            manager.cancel_hold_invoice(id),
            Err(Error::Transport(ln_rpc::Error::Timeout(_)))
        ));

        let manager = InvoiceManager::with(SlowNode { delay: Duration::from_millis(1) });
        assert_eq!(manager.get_invoice(id).unwrap().state, InvoiceState::Held);
        manager.cancel_hold_invoice(id).unwrap();
    }
}
