//! Admission control for subscriptions and unary RPCs.
//!
//! Two independent counting semaphores, acquired without waiting: when no
//! slot is free the call is rejected immediately. A slot is released when its
//! permit is dropped, which happens exactly once per successful acquire.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

/// Rejection raised when a limit is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("Subscription limit reached ({limit} active)")]
    Subscriptions { limit: usize },

    #[error("Unary RPC limit reached ({limit} in flight)")]
    Unary { limit: usize },
}

/// Held for the lifetime of an admitted session or RPC.
#[derive(Debug)]
pub struct Permit {
    _permit: OwnedSemaphorePermit,
}

/// Limits on concurrent subscription sessions and unary RPCs.
#[derive(Debug, Clone)]
pub struct AdmissionControl {
    subscriptions: Arc<Semaphore>,
    subscription_limit: usize,
    unary: Arc<Semaphore>,
    unary_limit: usize,
}

impl AdmissionControl {
    pub fn new(max_subscriptions: usize, max_unary_rpc: usize) -> Self {
        Self {
            subscriptions: Arc::new(Semaphore::new(max_subscriptions)),
            subscription_limit: max_subscriptions,
            unary: Arc::new(Semaphore::new(max_unary_rpc)),
            unary_limit: max_unary_rpc,
        }
    }

    /// Claim a subscription slot or fail immediately.
    pub fn try_subscription(&self) -> Result<Permit, AdmissionError> {
        acquire(&self.subscriptions).ok_or(AdmissionError::Subscriptions {
            limit: self.subscription_limit,
        })
    }

    /// Claim a unary RPC slot or fail immediately.
    pub fn try_unary(&self) -> Result<Permit, AdmissionError> {
        acquire(&self.unary).ok_or(AdmissionError::Unary {
            limit: self.unary_limit,
        })
    }

    /// Free subscription slots.
    pub fn available_subscriptions(&self) -> usize {
        self.subscriptions.available_permits()
    }

    /// Free unary RPC slots.
    pub fn available_unary(&self) -> usize {
        self.unary.available_permits()
    }
}

fn acquire(semaphore: &Arc<Semaphore>) -> Option<Permit> {
    match semaphore.clone().try_acquire_owned() {
        Ok(permit) => Some(Permit { _permit: permit }),
        Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => None,
    }
}
