//! In-process metric instrumentation.
//!
//! A process holds a single [`Registry`]. Components register a named
//! [`Metric`] and obtain per-attribute-set recorders from it:
//!
//! ```
//! use metric::{Metric, Registry, U64Counter};
//!
//! let registry = Registry::new();
//! let metric: Metric<U64Counter> =
//!     registry.register_metric("requests", "number of requests processed");
//!
//! let ok = metric.recorder(&[("outcome", "success")]);
//! ok.inc(1);
//! assert_eq!(ok.fetch(), 1);
//! ```
//!
//! Recorders are cheap handles onto shared state: any recorder obtained for
//! the same metric name and attribute set observes the same value.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use parking_lot::Mutex;
use std::any::Any;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A sorted set of key-value pairs identifying one time series of a metric.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Attributes(BTreeMap<&'static str, Cow<'static, str>>);

impl Attributes {
    /// Insert or replace the value for `key`.
    pub fn insert(&mut self, key: &'static str, value: impl Into<Cow<'static, str>>) {
        self.0.insert(key, value.into());
    }

    /// Iterate the attribute pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&&'static str, &Cow<'static, str>)> {
        self.0.iter()
    }
}

impl<const N: usize> From<&[(&'static str, &'static str); N]> for Attributes {
    fn from(pairs: &[(&'static str, &'static str); N]) -> Self {
        Self(
            pairs
                .iter()
                .map(|(k, v)| (*k, Cow::Borrowed(*v)))
                .collect(),
        )
    }
}

impl<const N: usize> From<[(&'static str, Cow<'static, str>); N]> for Attributes {
    fn from(pairs: [(&'static str, Cow<'static, str>); N]) -> Self {
        Self(pairs.into_iter().collect())
    }
}

impl From<&Attributes> for Attributes {
    fn from(attributes: &Attributes) -> Self {
        attributes.clone()
    }
}

/// An observer that can be registered as one time series of a [`Metric`].
pub trait MetricObserver: Debug + Default + Clone + Send + Sync + 'static {}

/// A monotonically increasing counter.
#[derive(Debug, Clone, Default)]
pub struct U64Counter {
    state: Arc<AtomicU64>,
}

impl U64Counter {
    /// Increment the counter by `count`.
    pub fn inc(&self, count: u64) {
        self.state.fetch_add(count, Ordering::Relaxed);
    }

    /// Read the current value.
    pub fn fetch(&self) -> u64 {
        self.state.load(Ordering::Relaxed)
    }
}

impl MetricObserver for U64Counter {}

/// A gauge that can be set, incremented and decremented.
#[derive(Debug, Clone, Default)]
pub struct U64Gauge {
    state: Arc<AtomicU64>,
}

impl U64Gauge {
    /// Set the gauge to `value`.
    pub fn set(&self, value: u64) {
        self.state.store(value, Ordering::Relaxed);
    }

    /// Increment the gauge by `delta`.
    pub fn inc(&self, delta: u64) {
        self.state.fetch_add(delta, Ordering::Relaxed);
    }

    /// Decrement the gauge by `delta`, saturating at zero.
    pub fn dec(&self, delta: u64) {
        let mut current = self.state.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(delta);
            match self.state.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Read the current value.
    pub fn fetch(&self) -> u64 {
        self.state.load(Ordering::Relaxed)
    }
}

impl MetricObserver for U64Gauge {}

/// A named family of observers, one per attribute set.
#[derive(Debug, Clone)]
pub struct Metric<T> {
    name: &'static str,
    description: &'static str,
    observers: Arc<Mutex<BTreeMap<Attributes, T>>>,
}

impl<T: MetricObserver> Metric<T> {
    fn new(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            observers: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// The metric name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The human-readable description.
    pub fn description(&self) -> &'static str {
        self.description
    }

    /// Return the recorder for `attributes`, creating the time series on
    /// first use.
    pub fn recorder(&self, attributes: impl Into<Attributes>) -> T {
        let attributes = attributes.into();
        let mut observers = self.observers.lock();
        observers.entry(attributes).or_default().clone()
    }

    /// Return the observer for `attributes` if the time series exists.
    pub fn get_observer(&self, attributes: &Attributes) -> Option<T> {
        self.observers.lock().get(attributes).cloned()
    }

    /// Snapshot of every `(attributes, observer)` pair.
    pub fn observers(&self) -> Vec<(Attributes, T)> {
        self.observers
            .lock()
            .iter()
            .map(|(a, o)| (a.clone(), o.clone()))
            .collect()
    }
}

/// The per-process collection of metrics.
#[derive(Default)]
pub struct Registry {
    instruments: Mutex<BTreeMap<&'static str, Box<dyn Any + Send>>>,
}

impl Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("metrics", &self.instruments.lock().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or look up) the metric called `name`.
    ///
    /// Registration is idempotent: a second call with the same name returns
    /// a handle onto the same observers.
    ///
    /// # Panics
    ///
    /// If `name` was already registered with a different observer type.
    pub fn register_metric<T: MetricObserver>(
        &self,
        name: &'static str,
        description: &'static str,
    ) -> Metric<T> {
        let mut instruments = self.instruments.lock();
        let entry = instruments
            .entry(name)
            .or_insert_with(|| Box::new(Metric::<T>::new(name, description)));
        entry
            .downcast_ref::<Metric<T>>()
            .unwrap_or_else(|| panic!("metric \"{name}\" registered with a different type"))
            .clone()
    }

    /// Look up a previously registered metric by name.
    pub fn get_instrument<T: MetricObserver>(&self, name: &'static str) -> Option<Metric<T>> {
        self.instruments
            .lock()
            .get(name)
            .and_then(|i| i.downcast_ref::<Metric<T>>())
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_shares_state_per_attribute_set() {
        let registry = Registry::new();
        let metric: Metric<U64Counter> = registry.register_metric("writes", "write count");

        let a = metric.recorder(&[("partition", "0")]);
        let b = metric.recorder(&[("partition", "0")]);
        let other = metric.recorder(&[("partition", "1")]);

        a.inc(2);
        b.inc(3);
        other.inc(10);

        assert_eq!(a.fetch(), 5);
        assert_eq!(b.fetch(), 5);
        assert_eq!(other.fetch(), 10);
    }

    #[test]
    fn registration_is_idempotent() {
        let registry = Registry::new();
        let first: Metric<U64Counter> = registry.register_metric("hits", "hit count");
        first.recorder(&[("kind", "a")]).inc(1);

        let second: Metric<U64Counter> = registry.register_metric("hits", "hit count");
        assert_eq!(
            second
                .get_observer(&Attributes::from(&[("kind", "a")]))
                .unwrap()
                .fetch(),
            1
        );
    }

    #[test]
    #[should_panic(expected = "registered with a different type")]
    fn type_mismatch_panics() {
        let registry = Registry::new();
        let _counter: Metric<U64Counter> = registry.register_metric("m", "");
        let _gauge: Metric<U64Gauge> = registry.register_metric("m", "");
    }

    #[test]
    fn gauge_set_inc_dec() {
        let registry = Registry::new();
        let metric: Metric<U64Gauge> = registry.register_metric("live", "live things");
        let gauge = metric.recorder(&[("kind", "chunk")]);

        gauge.set(5);
        gauge.inc(3);
        gauge.dec(2);
        assert_eq!(gauge.fetch(), 6);

        gauge.dec(100);
        assert_eq!(gauge.fetch(), 0);
    }

    #[test]
    fn get_instrument_unknown_name() {
        let registry = Registry::new();
        assert!(registry.get_instrument::<U64Counter>("nope").is_none());
    }

    #[test]
    fn owned_attribute_values() {
        let registry = Registry::new();
        let metric: Metric<U64Counter> = registry.register_metric("drops", "dropped records");

        let service = "tenant-a".to_string();
        let recorder = metric.recorder(Attributes::from([
            ("service", Cow::from(service)),
            ("reason", Cow::from("over_limit")),
        ]));
        recorder.inc(7);

        let mut lookup = Attributes::default();
        lookup.insert("service", "tenant-a");
        lookup.insert("reason", "over_limit");
        assert_eq!(metric.get_observer(&lookup).unwrap().fetch(), 7);
    }
}
