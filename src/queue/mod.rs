//! The pending action queue and its observers.

mod action;
mod manager;

pub use action::{Method, NewAction, QueuedAction};
pub use manager::{QueueManager, Subscription};

use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
  #[error("{0} requests are not mutations and are never queued")]
  NotAMutation(Method),

  #[error(transparent)]
  Store(#[from] StoreError),
}
