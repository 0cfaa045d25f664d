//! Makes a desired playback rate authoritative for a media element.
//!
//! Guarding an element replaces its public rate accessor with a [`RateProxy`].
//! Reads through the proxy return the desired rate. Writes through it are
//! foreign: they are never applied, and a correction is deferred to the next
//! scheduling turn instead. The guard's own writes go through
//! [`RateProxy::force_write`], which is the only path that changes the desired
//! rate of a live guard.

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::Duration,
};

use anyhow::Context;
use parking_lot::Mutex;
use tokio::{runtime::Handle, task::JoinHandle};

use crate::{
    media::{ElementId, MediaElement, RateAccessor},
    scheduler,
    utils::rates_differ,
};

#[derive(Debug, Clone, Copy)]
struct GuardState {
    desired_rate: f64,
    active: bool,
}

pub struct RateProxy {
    id: ElementId,
    this: Weak<RateProxy>,
    element: Weak<dyn MediaElement>,
    state: Mutex<GuardState>,
    runtime: Handle,
}

impl RateProxy {
    fn new(element: &Arc<dyn MediaElement>, desired_rate: f64, runtime: Handle) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            id: element.id(),
            this: this.clone(),
            element: Arc::downgrade(element),
            state: Mutex::new(GuardState {
                desired_rate,
                active: true,
            }),
            runtime,
        })
    }

    pub fn id(&self) -> ElementId {
        self.id
    }

    pub fn element(&self) -> Option<Arc<dyn MediaElement>> {
        self.element.upgrade()
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    pub fn desired_rate(&self) -> f64 {
        self.state.lock().desired_rate
    }

    /// The value host scripts observe. While the guard is live this is always
    /// the desired rate; a retired guard is transparent.
    pub fn read(&self) -> f64 {
        let state = *self.state.lock();
        if state.active {
            return state.desired_rate;
        }
        match self.element() {
            Some(element) => element.raw_rate(),
            None => state.desired_rate,
        }
    }

    /// A write from outside the guard. The value is dropped and the raw rate is
    /// re-checked against the desired rate on the next scheduling turn.
    pub fn write(&self, rate: f64) {
        if !self.is_active() {
            if let Some(element) = self.element() {
                if let Err(err) = element.set_raw_rate(rate) {
                    log::warn!("Failed to pass rate {rate} through to element {}: {err:?}", self.id);
                }
            }
            return;
        }

        log::debug!("Rejected foreign rate write {rate} on element {}", self.id);
        let proxy = self.this.clone();
        self.runtime.spawn(async move {
            if let Some(proxy) = proxy.upgrade() {
                proxy.reconcile();
            }
        });
    }

    /// The guard's internal write path: updates the desired rate and pushes it
    /// through the element's own setter.
    pub fn force_write(&self, rate: f64) {
        {
            let mut state = self.state.lock();
            if !state.active {
                return;
            }
            state.desired_rate = rate;
        }
        self.push_raw(rate);
    }

    /// Re-asserts the desired rate if the raw rate has drifted. Reads the
    /// desired rate at call time and never writes it, so a newer desired rate
    /// always wins over an older pending correction.
    pub fn reconcile(&self) -> bool {
        let Some(element) = self.element() else {
            return false;
        };
        let raw_rate = element.raw_rate();
        let state = *self.state.lock();
        if !state.active || !rates_differ(raw_rate, state.desired_rate) {
            return false;
        }
        log::debug!(
            "Correcting rate drift on element {}: {raw_rate} -> {}",
            self.id,
            state.desired_rate
        );
        self.push_raw(state.desired_rate);
        true
    }

    fn push_raw(&self, rate: f64) {
        let Some(element) = self.element() else {
            return;
        };
        if let Err(err) = element.set_raw_rate(rate) {
            log::warn!("Failed to set rate {rate} on element {}: {err:?}", self.id);
        }
    }

    pub(crate) fn retire(&self) {
        self.state.lock().active = false;
    }
}

impl RateAccessor for RateProxy {
    fn get(&self) -> f64 {
        self.read()
    }

    fn set(&self, rate: f64) {
        self.write(rate)
    }
}

impl std::fmt::Debug for RateProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = *self.state.lock();
        f.debug_struct("RateProxy")
            .field("id", &self.id)
            .field("desired_rate", &state.desired_rate)
            .field("active", &state.active)
            .finish()
    }
}

struct GuardEntry {
    proxy: Arc<RateProxy>,
    reconciler: JoinHandle<()>,
}

impl GuardEntry {
    fn teardown(self) {
        self.reconciler.abort();
        self.proxy.retire();
    }
}

/// Element identity to guard state. Holds no strong reference to elements.
#[derive(Clone, Default)]
pub struct GuardRegistry {
    entries: Arc<Mutex<HashMap<ElementId, GuardEntry>>>,
}

impl GuardRegistry {
    pub fn contains(&self, id: ElementId) -> bool {
        self.entries.lock().contains_key(&id)
    }

    pub fn proxy(&self, id: ElementId) -> Option<Arc<RateProxy>> {
        self.entries.lock().get(&id).map(|entry| Arc::clone(&entry.proxy))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Number of reconciliation tasks that are still running.
    pub fn active_reconcilers(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|entry| !entry.reconciler.is_finished())
            .count()
    }

    fn insert(&self, entry: GuardEntry) {
        let previous = self.entries.lock().insert(entry.proxy.id(), entry);
        if let Some(previous) = previous {
            log::debug!("Tore down previous guard on element {}", previous.proxy.id());
            previous.teardown();
        }
    }

    /// Drops the entry for `proxy` without aborting its task. Called by the
    /// reconciler itself when it retires.
    pub(crate) fn release(&self, proxy: &Arc<RateProxy>) {
        proxy.retire();
        let mut entries = self.entries.lock();
        let owned = entries
            .get(&proxy.id())
            .is_some_and(|entry| Arc::ptr_eq(&entry.proxy, proxy));
        if owned {
            entries.remove(&proxy.id());
        }
    }

    pub fn teardown(&self, id: ElementId) {
        let entry = self.entries.lock().remove(&id);
        if let Some(entry) = entry {
            entry.teardown();
        }
    }

    pub fn teardown_all(&self) {
        let entries: Vec<GuardEntry> = self.entries.lock().drain().map(|(_, e)| e).collect();
        for entry in entries {
            entry.teardown();
        }
    }
}

impl std::fmt::Debug for GuardRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardRegistry")
            .field("len", &self.len())
            .finish()
    }
}

/// Installs and updates guards on media elements.
#[derive(Debug, Clone)]
pub struct RateGuard {
    registry: GuardRegistry,
    check_interval: Duration,
    runtime: Handle,
}

impl RateGuard {
    pub fn new(check_interval: Duration, runtime: Handle) -> Self {
        Self {
            registry: GuardRegistry::default(),
            check_interval,
            runtime,
        }
    }

    pub fn registry(&self) -> &GuardRegistry {
        &self.registry
    }

    pub fn is_guarded(&self, id: ElementId) -> bool {
        self.registry.contains(id)
    }

    pub fn desired_rate(&self, id: ElementId) -> Option<f64> {
        self.registry.proxy(id).map(|proxy| proxy.desired_rate())
    }

    /// Guards `element` from scratch at `rate`, tearing down any guard it
    /// already has.
    pub fn guard(&self, element: &Arc<dyn MediaElement>, rate: f64) -> Arc<RateProxy> {
        let id = element.id();
        self.registry.teardown(id);

        let proxy = RateProxy::new(element, rate, self.runtime.clone());
        proxy.push_raw(rate);

        let accessor: Arc<dyn RateAccessor> = proxy.clone();
        if let Err(err) = element
            .install_rate_accessor(accessor)
            .with_context(|| format!("Failed to intercept rate of element {id}"))
        {
            log::warn!("{err:?}; continuing without write interception");
            proxy.push_raw(rate);
        }

        let reconciler = scheduler::spawn_reconciler(
            &self.runtime,
            Arc::clone(&proxy),
            self.registry.clone(),
            self.check_interval,
        );
        self.registry.insert(GuardEntry {
            proxy: Arc::clone(&proxy),
            reconciler,
        });
        log::debug!("Guarding element {id} at rate {rate}");
        proxy
    }

    /// Guards `element` at `rate` unless it is already guarded.
    pub fn process(&self, element: &Arc<dyn MediaElement>, rate: f64) -> bool {
        if self.is_guarded(element.id()) {
            return false;
        }
        self.guard(element, rate);
        true
    }

    /// Makes `rate` the element's desired rate, guarding it first if needed.
    pub fn enforce(&self, element: &Arc<dyn MediaElement>, rate: f64) {
        match self.registry.proxy(element.id()) {
            Some(proxy) => proxy.force_write(rate),
            None => {
                self.guard(element, rate);
            }
        }
    }
}
