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

//! State machines keep invoice and payment lifecycles consistent: updates coming out of order,
//! or repeated after a reconnection, can't move an entity backwards.

use std::fmt::{self, Debug, Display, Formatter};

use ln_rpc::{Invoice, InvoiceState, PaymentState};

/// Transition which is not allowed by the lifecycle
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct TransitionError<State> {
    pub from: State,
    pub to: State,
}

impl<State> Display for TransitionError<State>
where
    State: Display,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "lifecycle can't move from `{}` to `{}`", self.from, self.to)
    }
}

impl<State> std::error::Error for TransitionError<State> where State: Debug + Display {}

/// Lifecycle of an entity represented by its state
pub trait StateMachine: Copy + Eq + Display {
    /// Whether the lifecycle allows to go from `self` to `next` directly
    fn can_transit(self, next: Self) -> bool;

    /// Terminal states do not have outgoing transitions
    fn is_terminal(self) -> bool;

    /// Moves state machine to a next state. Staying in the same state is always allowed.
    fn next(self, next: Self) -> Result<Self, TransitionError<Self>> {
        if self == next || self.can_transit(next) {
            Ok(next)
        } else {
            Err(TransitionError { from: self, to: next })
        }
    }
}

/// Invoice state together with the kind of the invoice. Only hold invoices pass through
/// `held`, and only regular invoices get confirmed right away.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Display)]
#[display("{state}")]
pub struct InvoiceLifecycle {
    pub state: InvoiceState,
    pub is_hold: bool,
}

impl From<&Invoice> for InvoiceLifecycle {
    fn from(invoice: &Invoice) -> Self {
        InvoiceLifecycle { state: invoice.state, is_hold: invoice.is_hold }
    }
}

impl InvoiceLifecycle {
    #[inline]
    pub fn hold(state: InvoiceState) -> Self { InvoiceLifecycle { state, is_hold: true } }

    #[inline]
    pub fn regular(state: InvoiceState) -> Self { InvoiceLifecycle { state, is_hold: false } }

    /// Moves to the given state keeping the invoice kind
    pub fn next_state(self, state: InvoiceState) -> Result<Self, TransitionError<Self>> {
        self.next(InvoiceLifecycle { state, is_hold: self.is_hold })
    }
}

impl StateMachine for InvoiceLifecycle {
    fn can_transit(self, next: Self) -> bool {
        use InvoiceState::*;
        if self.is_hold != next.is_hold {
            return false;
        }
        match (self.state, next.state) {
            (Created, Canceled) => true,
            (Created, Held) | (Held, Confirmed) | (Held, Canceled) => self.is_hold,
            (Created, Confirmed) => !self.is_hold,
            _ => false,
        }
    }

    fn is_terminal(self) -> bool { self.state.is_final() }
}

impl StateMachine for PaymentState {
    fn can_transit(self, next: Self) -> bool {
        matches!(
            (self, next),
            (PaymentState::Pending, PaymentState::Confirmed)
                | (PaymentState::Pending, PaymentState::Failed)
        )
    }

    fn is_terminal(self) -> bool { self != PaymentState::Pending }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hold_invoice_lifecycle() {
        let state = InvoiceLifecycle::hold(InvoiceState::Created);
        let state = state.next_state(InvoiceState::Held).unwrap();
        assert_eq!(state.next_state(InvoiceState::Held), Ok(state));
        let state = state.next_state(InvoiceState::Confirmed).unwrap();
        assert!(state.is_terminal());
        assert_eq!(
            state.next_state(InvoiceState::Held),
            Err(TransitionError {
                from: InvoiceLifecycle::hold(InvoiceState::Confirmed),
                to: InvoiceLifecycle::hold(InvoiceState::Held)
            })
        );
        let held = InvoiceLifecycle::hold(InvoiceState::Held);
        assert!(held.next_state(InvoiceState::Created).is_err());
        assert!(InvoiceLifecycle::hold(InvoiceState::Canceled)
            .next_state(InvoiceState::Confirmed)
            .is_err());
    }

    #[test]
    fn hold_invoice_is_never_confirmed_before_held() {
        let created = InvoiceLifecycle::hold(InvoiceState::Created);
        let err = created.next_state(InvoiceState::Confirmed).unwrap_err();
        assert_eq!(err.to_string(), "lifecycle can't move from `created` to `confirmed`");
        assert!(created.next_state(InvoiceState::Canceled).is_ok());
    }

    #[test]
    fn regular_invoice_is_confirmed_directly() {
        let created = InvoiceLifecycle::regular(InvoiceState::Created);
        assert!(created.next_state(InvoiceState::Confirmed).is_ok());
        assert!(created.next_state(InvoiceState::Held).is_err());
        assert!(created.next_state(InvoiceState::Canceled).is_ok());
        assert!(InvoiceLifecycle::regular(InvoiceState::Held)
            .next_state(InvoiceState::Confirmed)
            .is_err());
        assert!(created.next(InvoiceLifecycle::hold(InvoiceState::Created)).is_err());
    }

    #[test]
    fn payments_end_in_single_terminal_state() {
        assert!(PaymentState::Pending.next(PaymentState::Failed).is_ok());
        assert!(PaymentState::Failed.next(PaymentState::Confirmed).is_err());
        assert!(PaymentState::Confirmed.next(PaymentState::Pending).is_err());
        assert_eq!(
            TransitionError { from: PaymentState::Failed, to: PaymentState::Confirmed }.to_string(),
            "lifecycle can't move from `failed` to `confirmed`"
        );
    }
}
