use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;
type Registry<E> = Arc<Mutex<HashMap<u64, Callback<E>>>>;

/// A list of change observers. Registration hands back a [`Subscription`]
/// whose drop removes the callback, so observer lifetime is tied to the
/// subscriber rather than the observed object.
pub struct ObserverList<E> {
    callbacks: Registry<E>,
    next_id: Mutex<u64>,
}

impl<E> Default for ObserverList<E> {
    fn default() -> Self {
        ObserverList {
            callbacks: Arc::new(Mutex::new(HashMap::new())),
            next_id: Mutex::new(0),
        }
    }
}

impl<E: 'static> ObserverList<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, callback: impl Fn(&E) + Send + Sync + 'static) -> Subscription {
        let id = {
            let mut next = self.next_id.lock().unwrap_or_else(|e| e.into_inner());
            *next += 1;
            *next
        };
        self.callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Arc::new(callback));
        Subscription {
            id,
            detach: Arc::downgrade(&self.callbacks) as Weak<dyn Detach + Send + Sync>,
            detached: false,
        }
    }

    pub fn notify(&self, event: &E) {
        // Snapshot under the lock, invoke outside it: a callback may
        // re-enter and subscribe or unsubscribe.
        let snapshot: Vec<Callback<E>> = self
            .callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        for cb in snapshot {
            cb(event);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }
}

trait Detach {
    fn remove(&self, id: u64);
}

impl<E: 'static> Detach for Mutex<HashMap<u64, Callback<E>>> {
    fn remove(&self, id: u64) {
        self.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
    }
}

/// Guard returned by [`ObserverList::add`]. Dropping it deregisters the
/// callback; [`Subscription::detach`] keeps the callback alive for the
/// lifetime of the observed object instead.
pub struct Subscription {
    id: u64,
    detach: Weak<dyn Detach + Send + Sync>,
    detached: bool,
}

impl Subscription {
    pub fn detach(mut self) {
        self.detached = true;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.detached {
            return;
        }
        if let Some(registry) = self.detach.upgrade() {
            registry.remove(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn drop_deregisters() {
        let list = ObserverList::<u32>::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits2 = hits.clone();
        let sub = list.add(move |_| {
            hits2.fetch_add(1, Ordering::SeqCst);
        });

        list.notify(&1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        drop(sub);
        list.notify(&2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn detach_keeps_callback() {
        let list = ObserverList::<u32>::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits2 = hits.clone();
        list.add(move |_| {
            hits2.fetch_add(1, Ordering::SeqCst);
        })
        .detach();

        list.notify(&1);
        list.notify(&2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
