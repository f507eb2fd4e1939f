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
use ln_rpc::{Failure, FailureCode, FailureContext, FailureReason, ShortChannelId};

use crate::backup;
use crate::route::RouteError;

/// Payment attempt failure reported by the network
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Display)]
#[display("{reason}")]
pub struct RoutingFailure {
    pub reason: FailureReason,

    /// Position of the node reporting the failure, zero being the sender
    pub index: Option<u32>,

    /// Channel the failing node was asked to forward over
    pub channel: Option<ShortChannelId>,
}

impl RoutingFailure {
    pub fn with(reason: FailureReason) -> Self {
        RoutingFailure { reason, index: None, channel: None }
    }

    /// Pathfinding was unable to come up with any route
    pub fn no_route() -> Self {
        RoutingFailure::with(FailureReason::PaymentPathfindingFailedToFindPossibleRoute)
    }

    pub fn to_failure(&self) -> Failure {
        let context = FailureContext {
            reason: Some(self.reason),
            index: self.index,
            channel: self.channel,
            details: None,
        };
        let message = match self.reason {
            FailureReason::PaymentRejectedByDestination
            | FailureReason::PaymentPathfindingFailedToFindPossibleRoute => self.reason.to_string(),
            _ => s!("RoutingFailure"),
        };
        Failure { code: FailureCode::Unavailable, message, context: Some(context) }
    }
}

#[derive(Debug, Display, From, Error)]
#[display(doc_comments)]
#[non_exhaustive]
pub enum Error {
    /// invalid request: {0}
    Validation(String),

    /// operation is not supported by the node: {0}
    Unsupported(Failure),

    /// {0}
    NotFound(Failure),

    /// payment has failed: {0}
    Routing(RoutingFailure),

    /// {0}
    State(Failure),

    /// node communication failure: {0}
    Transport(ln_rpc::Error),

    /// node has rejected the provided credentials
    Unauthorized,

    /// unable to construct route: {0}
    #[from]
    Route(RouteError),

    /// node reported preimage which does not match payment hash {0}
    PreimageMismatch(sha256::Hash),

    /// channel backup failure: {0}
    #[from]
    Backup(backup::Error),

    /// node failure: {0:#}
    Rpc(Failure),

    /// unable to start payment task: {0}
    #[from]
    Io(std::io::Error),
}

impl From<ln_rpc::Error> for Error {
    fn from(err: ln_rpc::Error) -> Self {
        match err {
            ln_rpc::Error::Unauthorized => Error::Unauthorized,
            ln_rpc::Error::Failure(failure) => Error::from(failure),
            err => Error::Transport(err),
        }
    }
}

impl From<Failure> for Error {
    fn from(failure: Failure) -> Self {
        match failure.code {
            FailureCode::Unauthorized => Error::Unauthorized,
            FailureCode::NotImplemented => Error::Unsupported(failure),
            FailureCode::NotFound => Error::NotFound(failure),
            FailureCode::StateConflict => Error::State(failure),
            FailureCode::Unavailable => match failure.context.as_ref() {
                Some(FailureContext { reason: Some(reason), index, channel, .. }) => {
                    Error::Routing(RoutingFailure {
                        reason: *reason,
                        index: *index,
                        channel: *channel,
                    })
                }
                _ => Error::Rpc(failure),
            },
            _ => Error::Rpc(failure),
        }
    }
}

impl From<RoutingFailure> for Error {
    fn from(failure: RoutingFailure) -> Self { Error::Routing(failure) }
}

impl Error {
    pub(crate) fn validation(message: impl ToString) -> Self {
        Error::Validation(message.to_string())
    }

    pub(crate) fn not_found(message: &str) -> Self {
        Error::NotFound(Failure::new(FailureCode::NotFound, message))
    }

    pub(crate) fn state(message: &str) -> Self {
        Error::State(Failure::new(FailureCode::StateConflict, message))
    }

    /// Feature is missing in the connected node; callers may skip the operation
    pub fn is_unsupported(&self) -> bool { matches!(self, Error::Unsupported(_)) }

    pub fn is_not_found(&self) -> bool { matches!(self, Error::NotFound(_)) }

    /// The request might have reached the node, but no reply came back
    pub fn is_outcome_unknown(&self) -> bool {
        matches!(self, Error::Transport(err) if err.is_retryable())
    }

    pub fn routing_failure(&self) -> Option<RoutingFailure> {
        match self {
            Error::Routing(failure) => Some(*failure),
            _ => None,
        }
    }

    /// Error in the `(code, message, context)` form reported to the callers
    pub fn failure(&self) -> Failure {
        match self {
            Error::Validation(message) => Failure::new(FailureCode::BadRequest, message),
            Error::Unsupported(failure)
            | Error::NotFound(failure)
            | Error::State(failure)
            | Error::Rpc(failure) => failure.clone(),
            Error::Routing(failure) => failure.to_failure(),
            Error::Transport(err) => err.to_failure(),
            Error::Unauthorized => Failure::new(FailureCode::Unauthorized, "AccessDenied"),
            Error::Route(err) => Failure::new(FailureCode::BadRequest, "InvalidRoute")
                .with_context(FailureContext { details: Some(err.to_string()), ..default!() }),
            Error::PreimageMismatch(_) => {
                Failure::new(FailureCode::Unavailable, "UnexpectedPaymentPreimage")
            }
            Error::Backup(err) => Failure::new(FailureCode::BadRequest, "InvalidBackup")
                .with_context(FailureContext { details: Some(err.to_string()), ..default!() }),
            Error::Io(err) => Failure::new(500u16, err.to_string()),
        }
    }

    /// Numeric failure code
    #[inline]
    pub fn code(&self) -> u16 { self.failure().code.into() }
}
