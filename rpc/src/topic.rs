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

use bitcoin::hashes::sha256;

use crate::{Event, EventPayload, GetInvoices, RpcMsg};

/// Notification streams published by the node
#[derive(Clone, PartialEq, Eq, Hash, Debug, Display)]
pub enum Topic {
    /// Updates of all invoices; the initial snapshot is limited to invoices created after the
    /// given index
    #[display("invoices")]
    Invoices { added_after: Option<u64> },

    /// Updates of a single invoice
    #[display("invoice/{0}")]
    Invoice(sha256::Hash),

    /// Refreshed channel backups
    #[display("backups")]
    Backups,

    /// HTLCs forwarded, sent or received by the node. Has no snapshot.
    #[display("forwards")]
    Forwards,
}

impl Topic {
    /// ZMQ subscription prefix matching the first frame of the published messages
    pub fn filter(&self) -> String { self.to_string() }

    /// Request returning the current state of the topic. The reply is delivered to the
    /// subscriber before live updates, each time the subscription (re)connects.
    pub fn snapshot_request(&self) -> Option<RpcMsg> {
        match self {
            Topic::Invoices { added_after } => {
                Some(RpcMsg::GetInvoices(GetInvoices { added_after: *added_after }))
            }
            Topic::Invoice(id) => Some(RpcMsg::GetInvoice(*id)),
            Topic::Backups | Topic::Forwards => None,
        }
    }

    /// Converts snapshot reply into events ordered by their sequence numbers
    pub fn snapshot_events(&self, reply: RpcMsg) -> Vec<Event> {
        let mut invoices = match reply {
            RpcMsg::Invoice(invoice) => vec![invoice],
            RpcMsg::Invoices(invoices) => invoices,
            _ => return empty!(),
        };
        invoices.retain(|invoice| match self {
            Topic::Invoices { added_after: Some(index) } => invoice.index > *index,
            Topic::Invoices { added_after: None } => true,
            Topic::Invoice(id) => &invoice.id == id,
            Topic::Backups | Topic::Forwards => false,
        });
        invoices.sort_by_key(|invoice| invoice.sequence);
        invoices.into_iter().map(Event::from).collect()
    }

    /// Checks whether a live event belongs to the topic
    pub fn matches(&self, payload: &EventPayload) -> bool {
        match (self, payload) {
            (Topic::Invoices { .. }, EventPayload::InvoiceUpdated(_)) => true,
            (Topic::Invoice(id), EventPayload::InvoiceUpdated(invoice)) => &invoice.id == id,
            (Topic::Backups, EventPayload::BackupUpdated(_)) => true,
            (Topic::Forwards, EventPayload::Forward(_)) => true,
            _ => false,
        }
    }
}
