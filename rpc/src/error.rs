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
use std::time::Duration;

use crate::ShortChannelId;

/// Failure codes returned by the node. The numbering follows HTTP status codes, which is what
/// clients branch on.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[derive(Serialize, Deserialize)]
#[serde(crate = "serde_crate", from = "u16", into = "u16")]
pub enum FailureCode {
    /// Malformed or invalid request parameters
    BadRequest,

    /// Credentials were missing or rejected
    Unauthorized,

    /// Operation is not valid for the current lifecycle state of the entity
    StateConflict,

    /// Referenced entity does not exist
    NotFound,

    /// Method is not implemented by the connected node version
    NotImplemented,

    /// Upstream or transient failure; the request may be retried
    Unavailable,

    /// Any other code
    Other(u16),
}

impl From<u16> for FailureCode {
    fn from(code: u16) -> Self {
        match code {
            400 => FailureCode::BadRequest,
            401 => FailureCode::Unauthorized,
            402 => FailureCode::StateConflict,
            404 => FailureCode::NotFound,
            501 => FailureCode::NotImplemented,
            503 => FailureCode::Unavailable,
            other => FailureCode::Other(other),
        }
    }
}

impl From<FailureCode> for u16 {
    fn from(code: FailureCode) -> Self {
        match code {
            FailureCode::BadRequest => 400,
            FailureCode::Unauthorized => 401,
            FailureCode::StateConflict => 402,
            FailureCode::NotFound => 404,
            FailureCode::NotImplemented => 501,
            FailureCode::Unavailable => 503,
            FailureCode::Other(code) => code,
        }
    }
}

impl Display for FailureCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result { write!(f, "{}", u16::from(*self)) }
}

/// Reasons a payment attempt fails while being routed, as reported by the node
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
#[derive(Serialize, Deserialize)]
#[serde(crate = "serde_crate")]
#[display(Debug)]
pub enum FailureReason {
    TemporaryChannelFailure,
    TemporaryNodeFailure,
    PermanentChannelFailure,
    UnknownNextPeer,
    ChannelDisabled,
    FeeInsufficient,
    AmountBelowMinimum,
    IncorrectCltvExpiry,
    ExpiryTooSoon,
    InsufficientBalance,
    MppTimeout,
    PaymentRejectedByDestination,
    PaymentPathfindingFailedToFindPossibleRoute,
    UnknownFailure,
}

impl FailureReason {
    /// Failures which are expected to go away with time or through a different route
    pub fn is_temporary(self) -> bool {
        matches!(
            self,
            FailureReason::TemporaryChannelFailure
                | FailureReason::TemporaryNodeFailure
                | FailureReason::UnknownNextPeer
                | FailureReason::ChannelDisabled
                | FailureReason::FeeInsufficient
                | FailureReason::AmountBelowMinimum
                | FailureReason::IncorrectCltvExpiry
                | FailureReason::ExpiryTooSoon
                | FailureReason::InsufficientBalance
        )
    }

    /// Failure was produced by the final node, which means the route itself is usable
    pub fn is_destination_rejection(self) -> bool {
        self == FailureReason::PaymentRejectedByDestination
    }
}

/// Additional details accompanying a [`Failure`]
#[derive(Clone, PartialEq, Eq, Hash, Debug, Default)]
#[derive(Serialize, Deserialize)]
#[serde(crate = "serde_crate")]
pub struct FailureContext {
    /// Routing failure sub-code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,

    /// Position of the node which reported the failure: zero is the sender, `n` is the node
    /// reached by the `n`-th hop
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,

    /// Channel which the failing node was asked to forward over
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<ShortChannelId>,

    /// Free-form details
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl FailureContext {
    pub fn with_reason(reason: FailureReason) -> Self {
        FailureContext { reason: Some(reason), ..default!() }
    }
}

/// Information about server-side failure returned through RPC API
#[derive(Clone, PartialEq, Eq, Hash, Debug, Display)]
#[derive(Serialize, Deserialize)]
#[serde(crate = "serde_crate")]
#[display("{message}", alt = "Server returned failure #{code}: {message}")]
pub struct Failure {
    /// Failure code
    pub code: FailureCode,

    /// Failure message, a camel-case tag like `SentPaymentNotFound`
    pub message: String,

    /// Detailed information about the failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<FailureContext>,
}

impl std::error::Error for Failure {}

impl Failure {
    pub fn new(code: impl Into<FailureCode>, message: impl ToString) -> Self {
        Failure { code: code.into(), message: message.to_string(), context: None }
    }

    pub fn routing(reason: FailureReason, index: Option<u32>) -> Self {
        Failure {
            code: FailureCode::Unavailable,
            message: s!("RoutingFailure"),
            context: Some(FailureContext { index, ..FailureContext::with_reason(reason) }),
        }
    }

    pub fn with_context(mut self, context: FailureContext) -> Self {
        self.context = Some(context);
        self
    }

    #[inline]
    pub fn reason(&self) -> Option<FailureReason> {
        self.context.as_ref().and_then(|context| context.reason)
    }

    /// Returns the `(code, message, context)` triple
    pub fn into_triple(self) -> (u16, String, Option<FailureContext>) {
        (self.code.into(), self.message, self.context)
    }
}

/// Errors of the RPC transport
#[derive(Debug, Display, From, Error)]
#[display(doc_comments)]
#[non_exhaustive]
pub enum Error {
    /// ZMQ socket error: {0}
    #[from]
    Zmq(zmq::Error),

    /// I/O error: {0}
    #[from]
    Io(std::io::Error),

    /// malformed RPC payload: {0}
    #[from]
    Encoding(serde_json::Error),

    /// no response from the node within {0:?}
    Timeout(Duration),

    /// node has rejected the provided credentials
    Unauthorized,

    /// {0}
    #[from]
    Failure(Failure),

    /// unexpected server response {0}
    UnexpectedReply(String),

    /// subscription is closed
    SubscriptionClosed,

    /// transport state is poisoned by a panic in another thread
    Poisoned,
}

impl Error {
    /// Returns the failure code the error corresponds to. Transport-level problems are
    /// reported as transient (503-class) failures.
    pub fn code(&self) -> FailureCode {
        match self {
            Error::Failure(failure) => failure.code,
            Error::Unauthorized => FailureCode::Unauthorized,
            Error::Encoding(_) | Error::UnexpectedReply(_) => FailureCode::BadRequest,
            Error::Zmq(_)
            | Error::Io(_)
            | Error::Timeout(_)
            | Error::SubscriptionClosed
            | Error::Poisoned => FailureCode::Unavailable,
        }
    }

    /// Whether repeating the same request may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Zmq(_) | Error::Timeout(_))
            || matches!(self, Error::Failure(failure) if failure.code == FailureCode::Unavailable
                && failure.reason().map(FailureReason::is_temporary).unwrap_or(true))
    }

    /// Converts error into a [`Failure`], keeping server failures verbatim
    pub fn to_failure(&self) -> Failure {
        match self {
            Error::Failure(failure) => failure.clone(),
            Error::Timeout(_) => Failure::new(FailureCode::Unavailable, "RequestTimedOut"),
            Error::Unauthorized => Failure::new(FailureCode::Unauthorized, "AccessDenied"),
            err => Failure::new(err.code(), err.to_string()),
        }
    }
}
