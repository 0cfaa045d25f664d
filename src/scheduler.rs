//! Per-element reconciliation loop.
//!
//! Every guarded element gets one task that re-checks the raw rate on a fixed
//! interval and immediately after native events that may reset the rate. The
//! task retires itself, and releases the element's guard, once the element is
//! gone or no longer attached to the document.

use std::{sync::Arc, time::Duration};

use tokio::{
    runtime::Handle,
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};

use crate::{
    guard::{GuardRegistry, RateProxy},
    media::MediaEvent,
};

pub(crate) fn spawn_reconciler(
    runtime: &Handle,
    proxy: Arc<RateProxy>,
    registry: GuardRegistry,
    period: Duration,
) -> JoinHandle<()> {
    let events = proxy.element().map(|element| element.events());
    let reconciler = Reconciler {
        proxy,
        registry,
        events,
        period,
    };
    runtime.spawn(reconciler.run())
}

struct Reconciler {
    proxy: Arc<RateProxy>,
    registry: GuardRegistry,
    events: Option<broadcast::Receiver<MediaEvent>>,
    period: Duration,
}

impl Reconciler {
    async fn run(mut self) {
        // The guard forced the rate on install, so the first check waits a full period.
        let mut ticker = time::interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.tick() {
                        break;
                    }
                }
                event = next_event(&mut self.events) => self.handle_event(event),
            }
        }
    }

    /// Returns false once the element is gone and the loop should stop.
    fn tick(&self) -> bool {
        let attached = self
            .proxy
            .element()
            .is_some_and(|element| element.is_attached());
        if !attached {
            log::debug!(
                "Element {} left the document; retiring its guard",
                self.proxy.id()
            );
            self.registry.release(&self.proxy);
            return false;
        }
        self.proxy.reconcile();
        true
    }

    fn handle_event(&mut self, event: Result<MediaEvent, RecvError>) {
        match event {
            Ok(event) if event.may_reset_rate() => {
                if self.proxy.reconcile() {
                    log::debug!(
                        "Restored rate of element {} after {event:?}",
                        self.proxy.id()
                    );
                }
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                log::debug!(
                    "Missed {skipped} events from element {}; reconciling",
                    self.proxy.id()
                );
                self.proxy.reconcile();
            }
            Err(RecvError::Closed) => {
                log::debug!(
                    "Event stream of element {} closed; relying on interval checks",
                    self.proxy.id()
                );
                self.events = None;
            }
        }
    }
}

async fn next_event(
    events: &mut Option<broadcast::Receiver<MediaEvent>>,
) -> Result<MediaEvent, RecvError> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}
