use futures::channel::mpsc;
use std::sync::{Mutex, MutexGuard};

/// Fan-out of component events to every live subscriber.
///
/// Subscribers whose receiver was dropped are pruned on the next emit.
pub(crate) struct Listeners<T> {
    senders: Mutex<Vec<mpsc::UnboundedSender<T>>>,
}

impl<T: Clone> Listeners<T> {
    pub(crate) fn new() -> Self {
        Self {
            senders: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded();
        lock(&self.senders).push(tx);
        rx
    }

    pub(crate) fn emit(&self, event: T) {
        lock(&self.senders).retain(|tx| tx.unbounded_send(event.clone()).is_ok());
    }
}

/// Locks a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[async_std::test]
    async fn dropped_subscribers_are_pruned() {
        let listeners = Listeners::new();
        let mut kept = listeners.subscribe();
        let dropped = listeners.subscribe();
        drop(dropped);

        listeners.emit(7u32);
        assert_eq!(kept.next().await, Some(7));
        assert_eq!(lock(&listeners.senders).len(), 1);
    }
}
