//! Market-data boundary.
//!
//! A process reads a [`MarketDataSnapshot`] at the start of every cycle and listens for
//! change signals to decide when the next live cycle is due.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{Condvar, Mutex, RwLock};
use slab::Slab;

use crate::value::{Value, ValueRequirement};

/// Receives change signals from a [`MarketDataProvider`].
pub trait MarketDataListener: Send + Sync + 'static {
    /// Some subscribed values changed.
    fn values_changed(&self, requirements: &[ValueRequirement]);
}

/// Values available at one moment.
#[derive(Debug, Clone)]
pub struct MarketDataSnapshot {
    snapshot_time: SystemTime,
    values: HashMap<ValueRequirement, Value>,
}

impl MarketDataSnapshot {
    /// Create a snapshot.
    pub fn new(snapshot_time: SystemTime, values: HashMap<ValueRequirement, Value>) -> Self {
        Self {
            snapshot_time,
            values,
        }
    }

    /// A snapshot with no values.
    pub fn empty() -> Self {
        Self::new(SystemTime::now(), HashMap::new())
    }

    /// When the snapshot was taken.
    pub fn snapshot_time(&self) -> SystemTime {
        self.snapshot_time
    }

    /// Value for a requirement.
    pub fn value(&self, requirement: &ValueRequirement) -> Option<&Value> {
        self.values.get(requirement)
    }

    /// Number of values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if the snapshot has no values.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Source of live market data.
pub trait MarketDataProvider: Send + Sync + 'static {
    /// Snapshot the current values of `requirements`. Unknown requirements are left out.
    fn snapshot(&self, requirements: &BTreeSet<ValueRequirement>) -> MarketDataSnapshot;

    /// Register a change listener. Returns a key for [`remove_listener`](Self::remove_listener).
    fn add_listener(&self, listener: Arc<dyn MarketDataListener>) -> usize;

    /// Unregister a change listener.
    fn remove_listener(&self, key: usize);

    /// Block until every requirement has a value or the timeout elapses.
    ///
    /// Returns true if all values are available.
    fn await_values(&self, _requirements: &BTreeSet<ValueRequirement>, _timeout: Duration) -> bool {
        true
    }
}

/// Last-known-value provider held in memory.
///
/// Every [`set_value`](Self::set_value) notifies listeners synchronously.
#[derive(Default)]
pub struct InMemoryMarketDataProvider {
    values: RwLock<HashMap<ValueRequirement, Value>>,
    listeners: Mutex<Slab<Arc<dyn MarketDataListener>>>,
    arrivals: Mutex<()>,
    arrived: Condvar,
}

impl std::fmt::Debug for InMemoryMarketDataProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryMarketDataProvider")
            .field("values", &self.values.read().len())
            .field("listeners", &self.listeners.lock().len())
            .finish()
    }
}

impl InMemoryMarketDataProvider {
    /// Create an empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a value and notify listeners.
    pub fn set_value(&self, requirement: ValueRequirement, value: impl Into<Value>) {
        self.values.write().insert(requirement.clone(), value.into());
        self.notify(&[requirement]);
    }

    /// Publish several values with a single notification.
    pub fn set_values(&self, values: impl IntoIterator<Item = (ValueRequirement, Value)>) {
        let mut changed = Vec::new();
        {
            let mut current = self.values.write();
            for (requirement, value) in values {
                changed.push(requirement.clone());
                current.insert(requirement, value);
            }
        }
        if !changed.is_empty() {
            self.notify(&changed);
        }
    }

    /// Withdraw a value and notify listeners.
    pub fn remove_value(&self, requirement: &ValueRequirement) {
        if self.values.write().remove(requirement).is_some() {
            self.notify(std::slice::from_ref(requirement));
        }
    }

    /// Current value of a requirement.
    pub fn value(&self, requirement: &ValueRequirement) -> Option<Value> {
        self.values.read().get(requirement).cloned()
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    fn notify(&self, requirements: &[ValueRequirement]) {
        {
            let _guard = self.arrivals.lock();
            self.arrived.notify_all();
        }
        let listeners: Vec<_> = self.listeners.lock().iter().map(|(_, l)| l.clone()).collect();
        for listener in listeners {
            listener.values_changed(requirements);
        }
    }

    fn has_all(&self, requirements: &BTreeSet<ValueRequirement>) -> bool {
        let values = self.values.read();
        requirements.iter().all(|requirement| values.contains_key(requirement))
    }
}

impl MarketDataProvider for InMemoryMarketDataProvider {
    fn snapshot(&self, requirements: &BTreeSet<ValueRequirement>) -> MarketDataSnapshot {
        let values = self.values.read();
        let values = requirements
            .iter()
            .filter_map(|requirement| {
                values
                    .get(requirement)
                    .map(|value| (requirement.clone(), value.clone()))
            })
            .collect();
        MarketDataSnapshot::new(SystemTime::now(), values)
    }

    fn add_listener(&self, listener: Arc<dyn MarketDataListener>) -> usize {
        self.listeners.lock().insert(listener)
    }

    fn remove_listener(&self, key: usize) {
        self.listeners.lock().try_remove(key);
    }

    fn await_values(&self, requirements: &BTreeSet<ValueRequirement>, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.arrivals.lock();
        loop {
            if self.has_all(requirements) {
                return true;
            }
            if self.arrived.wait_until(&mut guard, deadline).timed_out() {
                return self.has_all(requirements);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::TargetSpecification;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn requirement(name: &str) -> ValueRequirement {
        ValueRequirement::new(name, TargetSpecification::security("S"))
    }

    struct Counter(AtomicU32);

    impl MarketDataListener for Counter {
        fn values_changed(&self, _requirements: &[ValueRequirement]) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_snapshot_only_contains_known_values() {
        let provider = InMemoryMarketDataProvider::new();
        provider.set_value(requirement("Spot"), 100.0);
        let snapshot =
            provider.snapshot(&BTreeSet::from([requirement("Spot"), requirement("Vol")]));
        assert_eq!(snapshot.len(), 1);
        assert_eq!(
            snapshot.value(&requirement("Spot")),
            Some(&Value::Double(100.0))
        );
        assert!(snapshot.value(&requirement("Vol")).is_none());
    }

    #[test]
    fn test_listeners_are_notified() {
        let provider = InMemoryMarketDataProvider::new();
        let counter = Arc::new(Counter(AtomicU32::new(0)));
        let key = provider.add_listener(counter.clone());
        provider.set_value(requirement("Spot"), 1.0);
        provider.remove_value(&requirement("Spot"));
        provider.remove_value(&requirement("Spot"));
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);

        provider.remove_listener(key);
        provider.set_value(requirement("Spot"), 2.0);
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
        assert_eq!(provider.listener_count(), 0);
    }

    #[test]
    fn test_await_values() {
        let provider = Arc::new(InMemoryMarketDataProvider::new());
        let wanted = BTreeSet::from([requirement("Spot")]);
        assert!(!provider.await_values(&wanted, Duration::from_millis(10)));

        let publisher = provider.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            publisher.set_value(requirement("Spot"), 1.0);
        });
        assert!(provider.await_values(&wanted, Duration::from_secs(5)));
        handle.join().unwrap();
    }
}
