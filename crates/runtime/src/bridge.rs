use log::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::oneshot;

use crate::error::{HostError, HostResult};

/// Host-owned promise slot. Resolved at most once; late arrivals are
/// discarded with a debug log instead of an error.
pub struct CompletionSlot<T> {
  sender: Option<oneshot::Sender<HostResult<T>>>,
}

impl<T> CompletionSlot<T> {
  pub fn new() -> (Self, oneshot::Receiver<HostResult<T>>) {
    let (sender, receiver) = oneshot::channel();
    return (
      Self {
        sender: Some(sender),
      },
      receiver,
    );
  }

  pub fn complete(&mut self, result: HostResult<T>) {
    match self.sender.take() {
      Some(sender) => {
        if sender.send(result).is_err() {
          debug!("completion receiver went away");
        }
      }
      None => debug!("discarding late completion"),
    };
  }

  pub fn is_resolved(&self) -> bool {
    return self.sender.is_none();
  }
}

pub async fn await_completion<T>(receiver: oneshot::Receiver<HostResult<T>>) -> HostResult<T> {
  return receiver
    .await
    .map_err(|_| HostError::internal("completion slot dropped unresolved"))?;
}

/// Shared counter with RAII guards. Used for in-flight async ops (keeps
/// the engine pumping) and keepalive resources (keeps the loop itself up).
#[derive(Clone, Debug, Default)]
pub struct Gauge {
  count: Arc<AtomicUsize>,
}

pub struct GaugeGuard {
  count: Arc<AtomicUsize>,
}

impl Gauge {
  pub fn new() -> Self {
    return Self::default();
  }

  pub fn count(&self) -> usize {
    return self.count.load(Ordering::SeqCst);
  }

  pub fn guard(&self) -> GaugeGuard {
    self.count.fetch_add(1, Ordering::SeqCst);
    return GaugeGuard {
      count: self.count.clone(),
    };
  }
}

impl Drop for GaugeGuard {
  fn drop(&mut self) {
    self.count.fetch_sub(1, Ordering::SeqCst);
  }
}

impl std::fmt::Debug for GaugeGuard {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    return f.debug_struct("GaugeGuard").finish();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::ErrorKind;

  #[tokio::test]
  async fn test_resolves_at_most_once() {
    let (mut slot, receiver) = CompletionSlot::<i32>::new();
    assert!(!slot.is_resolved());

    slot.complete(Ok(1));
    assert!(slot.is_resolved());

    // Late arrival is discarded, the first result wins.
    slot.complete(Ok(2));
    assert_eq!(1, await_completion(receiver).await.unwrap());
  }

  #[tokio::test]
  async fn test_dropped_slot_surfaces_internal_error() {
    let (slot, receiver) = CompletionSlot::<i32>::new();
    drop(slot);

    let err = await_completion(receiver).await.unwrap_err();
    assert_eq!(ErrorKind::Internal, err.kind);
  }

  #[test]
  fn test_gauge_guard() {
    let gauge = Gauge::new();
    assert_eq!(0, gauge.count());
    {
      let _a = gauge.guard();
      let _b = gauge.guard();
      assert_eq!(2, gauge.count());
    }
    assert_eq!(0, gauge.count());
  }
}
