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

use std::sync::Arc;

use ln_rpc::{Client, Transport};

use crate::{BackupVerifier, Config, Error, InvoiceManager, PaymentEngine, ReputationStore};

/// Client components sharing a single node connection and reputation store
pub struct Session<T: Transport + Clone> {
    pub payments: Arc<PaymentEngine<T>>,

    pub invoices: InvoiceManager<T>,

    pub backups: BackupVerifier<T>,

    pub reputation: Arc<ReputationStore>,
}

impl Session<Client> {
    /// Connects to the node over ZMQ
    pub fn connect(config: &Config) -> Result<Self, Error> {
        let client = Client::connect(&config.client_config())?;
        Session::with(client, config)
    }
}

impl<T: Transport + Clone> Session<T> {
    pub fn with(transport: T, config: &Config) -> Result<Self, Error> {
        let reputation = Arc::new(ReputationStore::with(config.pathfinding.clone())?);
        let payments =
            PaymentEngine::with(transport.clone(), config.payment.clone(), reputation.clone());
        info!("Client session is ready");
        Ok(Session {
            payments: Arc::new(payments),
            invoices: InvoiceManager::with(transport.clone()),
            backups: BackupVerifier::with(transport),
            reputation,
        })
    }
}
