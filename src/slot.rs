// Single-assignment result cells that can be awaited from any task.

use tokio::sync::watch;

/// A value that is resolved at most once per arming. `rearm` returns it to
/// the unresolved state so a later `resolve` can fill it again.
#[derive(Debug)]
pub struct ResultSlot<T> {
  tx: watch::Sender<Option<T>>,
}

impl<T: Clone> ResultSlot<T> {
  pub fn new() -> Self {
    let (tx, _rx) = watch::channel(None);
    Self { tx }
  }

  /// Fills an unresolved slot. Returns false, leaving the value untouched,
  /// if it was already resolved.
  pub fn resolve(&self, value: T) -> bool {
    self.tx.send_if_modified(|slot| {
      if slot.is_some() {
        return false;
      }
      *slot = Some(value);
      true
    })
  }

  /// Clears a resolved slot. Returns true if there was a value to clear.
  pub fn rearm(&self) -> bool {
    self.tx.send_if_modified(|slot| slot.take().is_some())
  }

  pub fn get(&self) -> Option<T> {
    self.tx.borrow().clone()
  }

  pub fn is_resolved(&self) -> bool {
    self.tx.borrow().is_some()
  }

  /// Waits until the slot holds a value.
  pub async fn wait(&self) -> T {
    let mut rx = self.tx.subscribe();
    loop {
      if let Some(v) = rx.borrow_and_update().clone() {
        return v;
      }
      // the sender is owned by `self`, so the channel outlives this borrow
      if rx.changed().await.is_err() {
        std::future::pending::<()>().await;
      }
    }
  }
}

impl<T: Clone> Default for ResultSlot<T> {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;
  use std::time::Duration;

  #[test]
  fn first_resolve_wins() {
    let slot = ResultSlot::new();
    assert!(slot.resolve(7));
    assert!(!slot.resolve(9));
    assert_eq!(slot.get(), Some(7));
  }

  #[test]
  fn rearm_clears_only_resolved() {
    let slot = ResultSlot::new();
    assert!(!slot.rearm());
    slot.resolve(1);
    assert!(slot.rearm());
    assert!(!slot.is_resolved());
    assert!(slot.resolve(2));
    assert_eq!(slot.get(), Some(2));
  }

  #[tokio::test(start_paused = true)]
  async fn wait_sees_later_resolution() {
    let slot = Arc::new(ResultSlot::new());
    let waiter = {
      let slot = slot.clone();
      tokio::spawn(async move { slot.wait().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!waiter.is_finished());
    slot.resolve(42i64);
    assert_eq!(waiter.await.unwrap(), 42);
  }
}
