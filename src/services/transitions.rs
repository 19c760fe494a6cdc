//! Transition tables for every status column in the system.
//!
//! Each table is a static mapping from a state to the states it may move to
//! next. There are no implicit self-loops: asking to move to the current state
//! is rejected like any other missing edge.

use std::fmt;

use crate::entities::{
    bank_transfer::BankTransferStatus, order::OrderStatus, order::PaymentStatus,
    remittance::RemittanceStatus,
};
use crate::errors::ServiceError;

pub trait StateMachine: Copy + Eq + fmt::Display + Sized + 'static {
    /// Name used in error messages, e.g. "order".
    const ENTITY: &'static str;

    fn allowed_transitions(&self) -> &'static [Self];

    fn can_transition_to(&self, next: Self) -> bool {
        self.allowed_transitions().contains(&next)
    }

    fn is_terminal(&self) -> bool {
        self.allowed_transitions().is_empty()
    }

    /// Fails with [`ServiceError::InvalidTransition`] naming the allowed destinations.
    fn ensure_transition(&self, next: Self) -> Result<(), ServiceError> {
        if self.can_transition_to(next) {
            return Ok(());
        }
        Err(ServiceError::InvalidTransition {
            entity: Self::ENTITY.to_string(),
            from: self.to_string(),
            to: next.to_string(),
            allowed: self
                .allowed_transitions()
                .iter()
                .map(ToString::to_string)
                .collect(),
        })
    }
}

impl StateMachine for OrderStatus {
    const ENTITY: &'static str = "order";

    fn allowed_transitions(&self) -> &'static [Self] {
        use OrderStatus::*;
        match self {
            Pending => &[Processing, Cancelled],
            Processing => &[Dispatched, Cancelled],
            Dispatched => &[Delivered],
            Delivered => &[Completed],
            Completed => &[],
            Cancelled => &[Pending],
        }
    }
}

impl StateMachine for PaymentStatus {
    const ENTITY: &'static str = "order payment";

    fn allowed_transitions(&self) -> &'static [Self] {
        use PaymentStatus::*;
        match self {
            Pending => &[ProofUploaded, Rejected, Validated],
            ProofUploaded => &[Validated, Rejected, Pending],
            Validated => &[],
            Rejected => &[Pending],
        }
    }
}

impl StateMachine for RemittanceStatus {
    const ENTITY: &'static str = "remittance";

    fn allowed_transitions(&self) -> &'static [Self] {
        use RemittanceStatus::*;
        match self {
            PaymentPending => &[PaymentProofUploaded, Cancelled],
            PaymentProofUploaded => &[PaymentValidated, PaymentRejected],
            PaymentValidated => &[Processing],
            PaymentRejected => &[PaymentPending],
            Processing => &[Delivered],
            Delivered => &[Completed],
            Completed => &[],
            Cancelled => &[],
        }
    }
}

impl RemittanceStatus {
    /// States a remittance may be cancelled from. Cancellation is governed by
    /// this set rather than by the pipeline table above.
    pub const CANCELLABLE: &'static [RemittanceStatus] = &[
        RemittanceStatus::PaymentPending,
        RemittanceStatus::PaymentProofUploaded,
        RemittanceStatus::PaymentValidated,
        RemittanceStatus::PaymentRejected,
        RemittanceStatus::Processing,
    ];

    /// States in which the amounts may still be recalculated.
    pub const RECALCULABLE: &'static [RemittanceStatus] = &[
        RemittanceStatus::PaymentPending,
        RemittanceStatus::PaymentRejected,
    ];

    pub fn is_cancellable(&self) -> bool {
        Self::CANCELLABLE.contains(self)
    }

    pub fn ensure_cancellable(&self) -> Result<(), ServiceError> {
        if self.is_cancellable() {
            return Ok(());
        }
        Err(ServiceError::InvalidTransition {
            entity: Self::ENTITY.to_string(),
            from: self.to_string(),
            to: RemittanceStatus::Cancelled.to_string(),
            allowed: self
                .allowed_transitions()
                .iter()
                .map(ToString::to_string)
                .collect(),
        })
    }
}

impl StateMachine for BankTransferStatus {
    const ENTITY: &'static str = "bank transfer";

    fn allowed_transitions(&self) -> &'static [Self] {
        use BankTransferStatus::*;
        match self {
            Pending => &[Confirmed, Failed],
            Confirmed => &[Transferred, Failed],
            Transferred => &[Reversed],
            Failed => &[],
            Reversed => &[],
        }
    }
}
