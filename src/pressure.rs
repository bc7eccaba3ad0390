//! A process-wide "memory pressure" broadcast source.
//!
//! The host environment (or the embedding application) owns a
//! [`MemoryPressureMonitor`] and calls [`notify`](MemoryPressureMonitor::notify)
//! when memory should be given back. Caches register a callback at
//! construction and deregister when dropped, so a monitor never calls into a
//! cache that no longer exists.

use std::sync::{Arc, Mutex};

type Callback = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    subscribers: Vec<(u64, Callback)>,
}

/// A cloneable handle to a memory-pressure event source.
#[derive(Clone, Default)]
pub struct MemoryPressureMonitor {
    registry: Arc<Mutex<Registry>>,
}

impl MemoryPressureMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` to be invoked on every [`notify`](Self::notify).
    ///
    /// The subscription is scoped: dropping the returned
    /// [`PressureSubscription`] deregisters the callback.
    pub fn subscribe(&self, callback: impl Fn() + Send + Sync + 'static) -> PressureSubscription {
        let mut registry = self.registry.lock().unwrap();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.subscribers.push((id, Box::new(callback)));
        PressureSubscription {
            registry: Arc::clone(&self.registry),
            id,
        }
    }

    /// Broadcasts a memory-pressure event to all live subscribers.
    ///
    /// Callbacks run on the calling thread. They are expected to be cheap:
    /// clearing an in-memory map, not performing I/O.
    pub fn notify(&self) {
        let registry = self.registry.lock().unwrap();
        tracing::debug!(
            subscribers = registry.subscribers.len(),
            "Broadcasting memory pressure"
        );
        for (_, callback) in &registry.subscribers {
            callback();
        }
    }

    /// The number of currently registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.registry.lock().unwrap().subscribers.len()
    }
}

impl std::fmt::Debug for MemoryPressureMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPressureMonitor")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Deregisters its callback from the [`MemoryPressureMonitor`] on drop.
pub struct PressureSubscription {
    registry: Arc<Mutex<Registry>>,
    id: u64,
}

impl Drop for PressureSubscription {
    fn drop(&mut self) {
        let mut registry = self.registry.lock().unwrap();
        registry.subscribers.retain(|(id, _)| *id != self.id);
    }
}

impl std::fmt::Debug for PressureSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PressureSubscription")
            .field("id", &self.id)
            .finish()
    }
}
