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
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::{Error, Failure, Forward, Invoice, MultiBackup, Topic};

/// Notification published by the node
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[derive(Serialize, Deserialize)]
#[serde(crate = "serde_crate")]
#[display("#{sequence} {payload}")]
pub struct Event {
    /// Node-wide monotonic sequence number of the update
    pub sequence: u64,

    pub payload: EventPayload,
}

#[derive(Clone, PartialEq, Eq, Debug)]
#[derive(Serialize, Deserialize)]
#[serde(crate = "serde_crate", tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    InvoiceUpdated(Invoice),

    BackupUpdated(MultiBackup),

    Forward(Forward),
}

impl Display for EventPayload {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            EventPayload::InvoiceUpdated(invoice) => {
                write!(f, "invoice_updated({}, {})", invoice.id, invoice.state)
            }
            EventPayload::BackupUpdated(backup) => {
                write!(f, "backup_updated({} channels)", backup.channels.len())
            }
            EventPayload::Forward(forward) => {
                write!(f, "forward({}, {} mtokens)", forward.state, forward.mtokens)
            }
        }
    }
}

impl From<Invoice> for Event {
    fn from(invoice: Invoice) -> Self {
        Event { sequence: invoice.sequence, payload: EventPayload::InvoiceUpdated(invoice) }
    }
}

impl Event {
    pub fn invoice(&self) -> Option<&Invoice> {
        match &self.payload {
            EventPayload::InvoiceUpdated(invoice) => Some(invoice),
            _ => None,
        }
    }

    pub fn forward(&self) -> Option<&Forward> {
        match &self.payload {
            EventPayload::Forward(forward) => Some(forward),
            _ => None,
        }
    }
}

type Item = Result<Event, Failure>;

/// Producer side of a subscription. Drops events which were already delivered, so snapshots
/// re-sent after a reconnection never produce duplicates.
#[derive(Debug)]
pub struct SubscriptionFeed {
    sender: Sender<Item>,
    closed: Arc<AtomicBool>,
    last_sequence: Option<u64>,
}

impl SubscriptionFeed {
    #[inline]
    pub fn is_closed(&self) -> bool { self.closed.load(Ordering::Acquire) }

    #[inline]
    pub fn last_sequence(&self) -> Option<u64> { self.last_sequence }

    /// Delivers the event unless it is a repetition. Returns `false` once the consumer is gone
    /// and the producer should stop.
    pub fn publish(&mut self, event: Event) -> bool {
        if self.is_closed() {
            return false;
        }
        if matches!(self.last_sequence, Some(last) if event.sequence <= last) {
            trace!("Skipping already delivered event #{}", event.sequence);
            return true;
        }
        let sequence = event.sequence;
        if self.sender.send(Ok(event)).is_err() {
            self.closed.store(true, Ordering::Release);
            return false;
        }
        self.last_sequence = Some(sequence);
        true
    }

    /// Terminates the subscription with a failure
    pub fn fail(self, failure: Failure) {
        if !self.is_closed() {
            let _ = self.sender.send(Err(failure));
        }
    }
}

/// Stream of node notifications on a single [`Topic`]. Once closed (explicitly or by dropping)
/// no further events are delivered.
#[derive(Debug)]
pub struct Subscription {
    topic: Topic,
    receiver: Receiver<Item>,
    closed: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Creates subscription fed from the current process
    pub fn channel(topic: Topic) -> (Subscription, SubscriptionFeed) {
        let (sender, receiver) = mpsc::channel();
        let closed = Arc::new(AtomicBool::new(false));
        let feed = SubscriptionFeed { sender, closed: closed.clone(), last_sequence: None };
        (Subscription { topic, receiver, closed, worker: None }, feed)
    }

    pub(crate) fn with_worker(mut self, worker: JoinHandle<()>) -> Self {
        self.worker = Some(worker);
        self
    }

    #[inline]
    pub fn topic(&self) -> &Topic { &self.topic }

    #[inline]
    pub fn is_closed(&self) -> bool { self.closed.load(Ordering::Acquire) }

    /// Blocks until the next event arrives
    pub fn recv(&self) -> Result<Event, Error> {
        if self.is_closed() {
            return Err(Error::SubscriptionClosed);
        }
        match self.receiver.recv() {
            Ok(item) => item.map_err(Error::from),
            Err(_) => Err(Error::SubscriptionClosed),
        }
    }

    /// Waits for the next event up to `timeout`, returning `Ok(None)` if nothing arrived
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<Event>, Error> {
        if self.is_closed() {
            return Err(Error::SubscriptionClosed);
        }
        match self.receiver.recv_timeout(timeout) {
            Ok(item) => item.map(Some).map_err(Error::from),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(Error::SubscriptionClosed),
        }
    }

    pub fn try_recv(&self) -> Result<Option<Event>, Error> {
        if self.is_closed() {
            return Err(Error::SubscriptionClosed);
        }
        match self.receiver.try_recv() {
            Ok(item) => item.map(Some).map_err(Error::from),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(Error::SubscriptionClosed),
        }
    }

    /// Stops the subscription. The worker notices the flag on its next poll and exits on its
    /// own; closing never waits for it.
    pub fn close(&mut self) {
        self.closed.store(true, Ordering::Release);
        if self.worker.take().is_some() {
            debug!("Closing subscription to {}", self.topic);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) { self.close() }
}

#[cfg(test)]
mod test {
    use bitcoin::hashes::{sha256, Hash};

    use super::*;

    fn event(sequence: u64) -> Event {
        Event {
            sequence,
            payload: EventPayload::BackupUpdated(MultiBackup { backup: vec![], channels: vec![] }),
        }
    }

    #[test]
    fn repeated_sequences_are_dropped() {
        let (subscription, mut feed) = Subscription::channel(Topic::Backups);
        assert!(feed.publish(event(1)));
        assert!(feed.publish(event(2)));
        assert!(feed.publish(event(2)));
        assert!(feed.publish(event(1)));
        assert!(feed.publish(event(3)));
        assert_eq!(feed.last_sequence(), Some(3));

        let received: Vec<_> = (0..3).map(|_| subscription.recv().unwrap().sequence).collect();
        assert_eq!(received, vec![1, 2, 3]);
        assert_eq!(subscription.try_recv().unwrap(), None);
    }

    #[test]
    fn closed_subscription_delivers_nothing() {
        let id = sha256::Hash::hash(b"closed");
        let (mut subscription, mut feed) = Subscription::channel(Topic::Invoice(id));
        assert!(feed.publish(event(1)));
        subscription.close();
        assert!(!feed.publish(event(2)));
        assert!(matches!(subscription.recv(), Err(Error::SubscriptionClosed)));
        assert!(matches!(
            subscription.recv_timeout(Duration::from_millis(1)),
            Err(Error::SubscriptionClosed)
        ));
    }

    #[test]
    fn dropped_subscription_stops_producer() {
        let (subscription, mut feed) = Subscription::channel(Topic::Backups);
        drop(subscription);
        assert!(!feed.publish(event(1)));
        assert!(feed.is_closed());
    }

    #[test]
    fn close_does_not_wait_for_busy_worker() {
        let (subscription, feed) = Subscription::channel(Topic::Backups);
        let worker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_secs(5));
            drop(feed);
        });
        let mut subscription = subscription.with_worker(worker);
        let started = std::time::Instant::now();
        subscription.close();
        drop(subscription);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn failure_terminates_stream() {
        let (subscription, feed) = Subscription::channel(Topic::Backups);
        feed.fail(Failure::new(503u16, "Unavailable"));
        assert!(matches!(subscription.recv(), Err(Error::Failure(_))));
        assert!(matches!(subscription.recv(), Err(Error::SubscriptionClosed)));
    }
}
