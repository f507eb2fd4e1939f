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

use std::time::{Duration, Instant};

use ln_rpc::{Event, Forward, Subscription};

use crate::Error;

/// Stream of HTLCs passing through the node. Each HTLC is reported once when it is locked in
/// and once more when it is settled or failed.
#[derive(Debug)]
pub struct ForwardUpdates {
    subscription: Subscription,
}

impl ForwardUpdates {
    pub(crate) fn with(subscription: Subscription) -> Self { ForwardUpdates { subscription } }

    fn accept(event: Event) -> Option<Forward> {
        let forward = event.forward().cloned();
        if forward.is_none() {
            trace!("Skipping {} on the forwards stream", event);
        }
        forward
    }

    /// Blocks until the next forward
    pub fn recv(&mut self) -> Result<Forward, Error> {
        loop {
            if let Some(forward) = ForwardUpdates::accept(self.subscription.recv()?) {
                return Ok(forward);
            }
        }
    }

    /// Waits up to `timeout` for the next forward
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Forward>, Error> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.subscription.recv_timeout(remaining)? {
                Some(event) => {
                    if let Some(forward) = ForwardUpdates::accept(event) {
                        return Ok(Some(forward));
                    }
                }
                None => return Ok(None),
            }
        }
    }

    pub fn close(&mut self) { self.subscription.close() }
}
