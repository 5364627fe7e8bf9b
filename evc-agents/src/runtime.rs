//! Agent timers
//!
//! Timers are relative and deliver their expiry as an ordinary event on the
//! agent's queue, so expiries are handled in order with everything else.
//! Each arming gets a fresh generation number; an expiry whose generation no
//! longer matches (the timer was cancelled or re-armed meanwhile) is stale and
//! must be discarded by the agent via [`Timers::accept`].

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::trace;

/// Expiry notice for a named timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired<K> {
    pub key: K,
    pub generation: u64,
}

/// Named, cancellable one-shot timers feeding an event queue
pub struct Timers<K, E>
where
    K: Copy + Eq + Hash + Debug + Send + 'static,
    E: From<TimerFired<K>> + Send + 'static,
{
    events: UnboundedSender<E>,
    armed: HashMap<K, (u64, JoinHandle<()>)>,
    next_generation: u64,
}

impl<K, E> Timers<K, E>
where
    K: Copy + Eq + Hash + Debug + Send + 'static,
    E: From<TimerFired<K>> + Send + 'static,
{
    pub fn new(events: UnboundedSender<E>) -> Self {
        Self {
            events,
            armed: HashMap::new(),
            next_generation: 0,
        }
    }

    /// Arm `key` to fire after `after`, replacing any pending arming
    pub fn start(&mut self, key: K, after: Duration) {
        self.cancel(key);
        self.next_generation += 1;
        let generation = self.next_generation;

        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = events.send(E::from(TimerFired { key, generation }));
        });

        trace!("Timers: Armed {:?} (gen {}) for {:?}", key, generation, after);
        self.armed.insert(key, (generation, handle));
    }

    pub fn cancel(&mut self, key: K) {
        if let Some((generation, handle)) = self.armed.remove(&key) {
            handle.abort();
            trace!("Timers: Cancelled {:?} (gen {})", key, generation);
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, (_, handle)) in self.armed.drain() {
            handle.abort();
        }
    }

    /// Consume an expiry. Returns false if it is stale.
    pub fn accept(&mut self, fired: &TimerFired<K>) -> bool {
        match self.armed.get(&fired.key) {
            Some((generation, _)) if *generation == fired.generation => {
                self.armed.remove(&fired.key);
                true
            }
            _ => {
                trace!("Timers: Discarding stale {:?} (gen {})", fired.key, fired.generation);
                false
            }
        }
    }

    pub fn is_armed(&self, key: K) -> bool {
        self.armed.contains_key(&key)
    }
}

impl<K, E> Drop for Timers<K, E>
where
    K: Copy + Eq + Hash + Debug + Send + 'static,
    E: From<TimerFired<K>> + Send + 'static,
{
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Key {
        Tick,
        Safety,
    }

    #[derive(Debug)]
    struct Fired(TimerFired<Key>);

    impl From<TimerFired<Key>> for Fired {
        fn from(f: TimerFired<Key>) -> Self {
            Fired(f)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers: Timers<Key, Fired> = Timers::new(tx);

        timers.start(Key::Tick, Duration::from_millis(500));
        assert!(timers.is_armed(Key::Tick));

        let Fired(fired) = rx.recv().await.unwrap();
        assert_eq!(fired.key, Key::Tick);
        assert!(timers.accept(&fired));
        assert!(!timers.is_armed(Key::Tick));
        assert!(!timers.accept(&fired));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_makes_earlier_expiry_stale() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers: Timers<Key, Fired> = Timers::new(tx);

        timers.start(Key::Safety, Duration::from_secs(1));
        let stale = TimerFired { key: Key::Safety, generation: 1 };
        timers.start(Key::Safety, Duration::from_secs(2));

        // An expiry already queued before the re-arm is rejected
        assert!(!timers.accept(&stale));

        let Fired(fired) = rx.recv().await.unwrap();
        assert_eq!(fired.generation, 2);
        assert!(timers.accept(&fired));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_suppresses_expiry() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers: Timers<Key, Fired> = Timers::new(tx);

        timers.start(Key::Tick, Duration::from_secs(1));
        timers.start(Key::Safety, Duration::from_secs(3));
        timers.cancel(Key::Tick);

        let Fired(fired) = rx.recv().await.unwrap();
        assert_eq!(fired.key, Key::Safety);

        timers.cancel_all();
        assert!(!timers.is_armed(Key::Safety));
    }
}
