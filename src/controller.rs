use std::sync::{Arc, Weak};

use anyhow::Context;
use parking_lot::Mutex;
use tokio::{runtime::Handle, sync::broadcast::error::RecvError, task::JoinHandle};

use crate::{
    config::{Config, SpeedControlConfig},
    guard::RateGuard,
    keys::{Action, ActionRegistry, KeyEvent},
    media::{MediaElement, Page},
    notify::{rate_message, seek_message, Notifier},
    storage::RateStore,
};

/// What happened to a key event or action.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Dispatch {
    Applied(Action),
    /// The page has no media element to act on.
    NoTarget,
    /// No binding matched the key event.
    Unbound,
    /// Shortcuts are turned off.
    Disabled,
}

impl Dispatch {
    /// Whether the host should swallow the originating key event.
    pub fn consumed(&self) -> bool {
        matches!(self, Self::Applied(_) | Self::NoTarget)
    }
}

struct ControllerInner {
    config: Config,
    actions: ActionRegistry,
    guard: RateGuard,
    target_rate: Mutex<f64>,
    store: Arc<dyn RateStore>,
    notifier: Arc<dyn Notifier>,
    runtime: Handle,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl ControllerInner {
    fn stop_watching(&self) {
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.abort();
        }
    }
}

impl Drop for ControllerInner {
    fn drop(&mut self) {
        self.stop_watching();
    }
}

/// Owns the process-wide target rate and every element's guard, and routes
/// actions to them.
#[derive(Clone)]
pub struct RateController {
    inner: Arc<ControllerInner>,
}

impl RateController {
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: Config,
        store: Arc<dyn RateStore>,
        notifier: Arc<dyn Notifier>,
    ) -> anyhow::Result<Self> {
        let runtime =
            Handle::try_current().context("Rate controller requires a running tokio runtime")?;
        let config = config.sanitized();
        let target_rate = restore_target_rate(&config.speed_control, store.as_ref());
        log::info!("Target rate is {target_rate}");

        Ok(Self {
            inner: Arc::new(ControllerInner {
                actions: ActionRegistry::from_config(&config.keyboard),
                guard: RateGuard::new(config.advanced.check_interval(), runtime.clone()),
                target_rate: Mutex::new(target_rate),
                config,
                store,
                notifier,
                runtime,
                watcher: Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn guard(&self) -> &RateGuard {
        &self.inner.guard
    }

    pub fn target_rate(&self) -> f64 {
        *self.inner.target_rate.lock()
    }

    /// Guards `element` at the target rate unless it is already guarded.
    pub fn process_media(&self, element: &Arc<dyn MediaElement>) -> bool {
        self.inner.guard.process(element, self.target_rate())
    }

    /// Clamps `rate`, makes it the element's desired rate and the new target
    /// rate, persists it if configured and notifies. Returns the applied rate.
    pub fn set_desired_rate(&self, element: &Arc<dyn MediaElement>, rate: f64) -> f64 {
        let speed = &self.inner.config.speed_control;
        let rate = speed.clamp(rate);

        self.inner.guard.enforce(element, rate);
        *self.inner.target_rate.lock() = rate;

        if speed.remember_last_rate {
            if let Err(err) = self.inner.store.save(rate) {
                log::warn!("Failed to persist rate {rate}: {err:?}");
            }
        }
        self.notify(&rate_message(rate));
        log::debug!("Set rate of element {} to {rate}", element.id());
        rate
    }

    /// Guards every media element on the page and, if enabled, every element
    /// inserted later. Returns whether a watcher for insertions was started.
    /// Observing another page replaces the previous watcher.
    pub fn observe(&self, page: Arc<dyn Page>) -> bool {
        if !self.inner.config.ui.enable_on_page_load {
            log::info!("Controller disabled on page load");
            return false;
        }

        let mut insertions = page.insertions();
        for element in page.media_elements() {
            self.process_media(&element);
        }
        if !self.inner.config.advanced.auto_apply_to_new_media {
            return false;
        }

        // The page keeps the insertion channel open, so the task only ends
        // when it is aborted. It must not keep the controller alive.
        let inner = Arc::downgrade(&self.inner);
        let handle = self.inner.runtime.spawn(async move {
            loop {
                let received = insertions.recv().await;
                let Some(controller) = upgrade(&inner) else {
                    break;
                };
                match received {
                    Ok(element) => {
                        controller.process_media(&element);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!("Missed {skipped} insertions; rescanning page");
                        for element in page.media_elements() {
                            controller.process_media(&element);
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        let previous = self.inner.watcher.lock().replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
        true
    }

    /// Whether a watcher for inserted elements is running.
    pub fn is_watching(&self) -> bool {
        self.inner
            .watcher
            .lock()
            .as_ref()
            .is_some_and(|watcher| !watcher.is_finished())
    }

    pub fn handle_key(&self, page: &dyn Page, event: &KeyEvent) -> Dispatch {
        let config = &self.inner.config;
        if !config.ui.enable_on_page_load || !config.keyboard.enable_shortcuts {
            return Dispatch::Disabled;
        }
        let Some(action) = self.inner.actions.resolve(event) else {
            return Dispatch::Unbound;
        };
        self.dispatch(page, action)
    }

    pub fn dispatch(&self, page: &dyn Page, action: Action) -> Dispatch {
        let elements = page.media_elements();
        let Some(target) = select_target(&elements) else {
            log::debug!("No media element to apply {action:?} to");
            return Dispatch::NoTarget;
        };

        match action {
            Action::SetRate(rate) => self.apply_rate(&elements, target, rate),
            Action::AdjustRate(step) => {
                let rate = self.target_rate() + step;
                self.apply_rate(&elements, target, rate);
            }
            Action::SeekBy(seconds) => self.seek_by(target, seconds),
        }
        Dispatch::Applied(action)
    }

    fn apply_rate(
        &self,
        elements: &[Arc<dyn MediaElement>],
        target: &Arc<dyn MediaElement>,
        rate: f64,
    ) {
        let rate = self.set_desired_rate(target, rate);
        if !self.inner.config.speed_control.apply_to_all_media {
            return;
        }
        for element in elements {
            if element.id() != target.id() {
                self.inner.guard.enforce(element, rate);
            }
        }
    }

    fn seek_by(&self, element: &Arc<dyn MediaElement>, seconds: f64) {
        if !seconds.is_finite() {
            log::warn!("Ignoring seek by {seconds}s");
            return;
        }
        let time = seek_position(element.current_time(), element.duration(), seconds);
        element.set_current_time(time);
        self.notify(&seek_message(seconds));
        log::debug!("Seeked element {} by {seconds}s to {time}", element.id());
    }

    fn notify(&self, message: &str) {
        let ui = &self.inner.config.ui;
        if ui.show_notifications {
            self.inner
                .notifier
                .notify(message, ui.notification_duration());
        }
    }

    /// Stops watching for new elements, then tears down every guard and
    /// cancels every reconciliation task.
    pub fn shutdown(&self) {
        self.inner.stop_watching();
        self.inner.guard.registry().teardown_all();
    }
}

impl std::fmt::Debug for RateController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateController")
            .field("target_rate", &self.target_rate())
            .field("guard", &self.inner.guard)
            .finish()
    }
}

fn upgrade(inner: &Weak<ControllerInner>) -> Option<RateController> {
    inner.upgrade().map(|inner| RateController { inner })
}

fn restore_target_rate(speed: &SpeedControlConfig, store: &dyn RateStore) -> f64 {
    if !speed.remember_last_rate {
        return speed.clamp(speed.default_rate);
    }
    match store.load() {
        Ok(Some(rate)) if rate.is_finite() => speed.clamp(rate),
        Ok(Some(rate)) => {
            log::warn!("Ignoring stored rate {rate}");
            speed.clamp(speed.default_rate)
        }
        Ok(None) => speed.clamp(speed.default_rate),
        Err(err) => {
            log::warn!("Failed to restore last rate: {err:?}");
            speed.clamp(speed.default_rate)
        }
    }
}

/// Prefers a playing element, otherwise the first one.
fn select_target(elements: &[Arc<dyn MediaElement>]) -> Option<&Arc<dyn MediaElement>> {
    elements
        .iter()
        .find(|element| !element.is_paused())
        .or_else(|| elements.first())
}

/// `current + seconds` clamped to `[0, duration]`. An unknown duration allows
/// no forward seeking.
fn seek_position(current: f64, duration: Option<f64>, seconds: f64) -> f64 {
    let current = if current.is_finite() { current } else { 0.0 };
    let upper = match duration {
        Some(duration) if duration > 0.0 => duration,
        _ => 0.0,
    };
    (current + seconds).min(upper).max(0.0)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::sleep;

    use crate::{
        keys::Modifier,
        sim::{next_turn, RecordingNotifier, SimulatedMedia, SimulatedPage},
        storage::MemoryStore,
    };

    use super::*;

    const INTERVAL: Duration = Duration::from_millis(100);

    struct Fixture {
        controller: RateController,
        page: Arc<SimulatedPage>,
        store: Arc<MemoryStore>,
        notifier: Arc<RecordingNotifier>,
    }

    fn fixture_with(config: Config, store: MemoryStore) -> Fixture {
        let store = Arc::new(store);
        let notifier = Arc::new(RecordingNotifier::default());
        let controller =
            RateController::new(config, store.clone(), notifier.clone()).unwrap();
        Fixture {
            controller,
            page: SimulatedPage::new(),
            store,
            notifier,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Config::default(), MemoryStore::default())
    }

    fn add_media(page: &SimulatedPage, duration: Option<f64>) -> Arc<SimulatedMedia> {
        let media = SimulatedMedia::new(duration);
        page.insert(media.clone());
        media
    }

    #[tokio::test(start_paused = true)]
    async fn should_restore_stored_rate() {
        let fixture = fixture_with(Config::default(), MemoryStore::with_rate(2.5));
        assert_eq!(fixture.controller.target_rate(), 2.5);
    }

    #[tokio::test(start_paused = true)]
    async fn should_clamp_stored_rate() {
        let fixture = fixture_with(Config::default(), MemoryStore::with_rate(9.0));
        assert_eq!(fixture.controller.target_rate(), 5.0);

        let fixture = fixture_with(Config::default(), MemoryStore::with_rate(f64::NAN));
        assert_eq!(fixture.controller.target_rate(), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn should_ignore_stored_rate_when_not_remembering() {
        // given
        let mut config = Config::default();
        config.speed_control.remember_last_rate = false;
        config.speed_control.default_rate = 1.25;

        // when
        let fixture = fixture_with(config, MemoryStore::with_rate(3.0));

        // then
        assert_eq!(fixture.controller.target_rate(), 1.25);
    }

    #[tokio::test(start_paused = true)]
    async fn should_clamp_requested_rates() {
        // given
        let fixture = fixture();
        let media = add_media(&fixture.page, Some(60.0));
        let element: Arc<dyn MediaElement> = media.clone();

        // when / then
        for (requested, applied) in [(9.0, 5.0), (0.01, 0.1), (-3.0, 0.1), (2.0, 2.0)] {
            assert_eq!(fixture.controller.set_desired_rate(&element, requested), applied);
            assert_eq!(fixture.controller.guard().desired_rate(media.id()), Some(applied));
            assert_eq!(media.raw_rate(), applied);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn should_adjust_twice_and_hold_against_foreign_writes() {
        // given
        let fixture = fixture();
        let media = add_media(&fixture.page, Some(120.0));
        fixture.controller.observe(fixture.page.clone());
        next_turn().await;

        // when
        fixture.controller.dispatch(&*fixture.page, Action::AdjustRate(0.5));
        fixture.controller.dispatch(&*fixture.page, Action::AdjustRate(0.5));

        // then
        assert_eq!(fixture.controller.target_rate(), 2.0);
        assert_eq!(fixture.controller.guard().desired_rate(media.id()), Some(2.0));

        media.set_playback_rate(0.3);
        assert_eq!(media.playback_rate(), 2.0);

        media.set_raw_rate_silently(0.3);
        sleep(INTERVAL).await;
        assert_eq!(media.raw_rate(), 2.0);
        assert_eq!(media.playback_rate(), 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn should_clamp_backward_seek_at_zero() {
        // given
        let fixture = fixture();
        let media = add_media(&fixture.page, Some(120.0));
        media.set_current_time(3.0);

        // when
        let outcome = fixture.controller.dispatch(&*fixture.page, Action::SeekBy(-6.0));

        // then
        assert_eq!(outcome, Dispatch::Applied(Action::SeekBy(-6.0)));
        assert_eq!(media.current_time(), 0.0);
        assert_eq!(fixture.notifier.messages(), vec!["6s back".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn should_clamp_forward_seek_at_duration() {
        // given
        let fixture = fixture();
        let media = add_media(&fixture.page, Some(120.0));
        media.set_current_time(100.0);

        // when
        fixture.controller.dispatch(&*fixture.page, Action::SeekBy(80.0));

        // then
        assert_eq!(media.current_time(), 120.0);
    }

    #[tokio::test(start_paused = true)]
    async fn should_not_seek_forward_with_unknown_duration() {
        // given
        let fixture = fixture();
        let media = add_media(&fixture.page, None);

        // when
        fixture.controller.dispatch(&*fixture.page, Action::SeekBy(6.0));

        // then
        assert_eq!(media.current_time(), 0.0);
    }

    #[test]
    fn should_sanitize_seek_inputs() {
        assert_eq!(seek_position(f64::NAN, Some(10.0), 4.0), 4.0);
        assert_eq!(seek_position(5.0, Some(f64::NAN), 4.0), 0.0);
        assert_eq!(seek_position(5.0, Some(0.0), -2.0), 0.0);
        assert_eq!(seek_position(5.0, Some(f64::INFINITY), 36000.0), 36005.0);
    }

    #[tokio::test(start_paused = true)]
    async fn should_resolve_alt_d_with_and_without_shift() {
        // given
        let fixture = fixture();
        let media = add_media(&fixture.page, Some(60.0));

        // when
        let first = fixture
            .controller
            .handle_key(&*fixture.page, &KeyEvent::new("d", &[Modifier::Alt]));
        let second = fixture.controller.handle_key(
            &*fixture.page,
            &KeyEvent::new("d", &[Modifier::Alt, Modifier::Shift]),
        );

        // then
        assert_eq!(first, Dispatch::Applied(Action::AdjustRate(0.5)));
        assert_eq!(second, Dispatch::Applied(Action::AdjustRate(0.5)));
        assert_eq!(media.playback_rate(), 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn should_report_unbound_and_disabled_keys() {
        // given
        let fixture = fixture();
        add_media(&fixture.page, Some(60.0));

        // then
        let outcome = fixture
            .controller
            .handle_key(&*fixture.page, &KeyEvent::new("d", &[]));
        assert_eq!(outcome, Dispatch::Unbound);
        assert!(!outcome.consumed());

        let mut config = Config::default();
        config.keyboard.enable_shortcuts = false;
        let disabled = fixture_with(config, MemoryStore::default());
        add_media(&disabled.page, Some(60.0));
        let outcome = disabled
            .controller
            .handle_key(&*disabled.page, &KeyEvent::new("d", &[Modifier::Alt]));
        assert_eq!(outcome, Dispatch::Disabled);
    }

    #[tokio::test(start_paused = true)]
    async fn should_report_missing_target() {
        // given
        let fixture = fixture();

        // when
        let outcome = fixture
            .controller
            .handle_key(&*fixture.page, &KeyEvent::new("e", &[Modifier::Alt]));

        // then
        assert_eq!(outcome, Dispatch::NoTarget);
        assert_eq!(fixture.controller.target_rate(), 1.0);
        assert!(fixture.notifier.messages().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn should_prefer_playing_element() {
        // given
        let mut config = Config::default();
        config.speed_control.apply_to_all_media = false;
        let fixture = fixture_with(config, MemoryStore::default());
        let paused = add_media(&fixture.page, Some(60.0));
        let playing = add_media(&fixture.page, Some(60.0));
        playing.play();

        // when
        fixture.controller.dispatch(&*fixture.page, Action::SetRate(1.5));

        // then
        assert_eq!(playing.playback_rate(), 1.5);
        assert_eq!(paused.playback_rate(), 1.0);
        assert!(!fixture.controller.guard().is_guarded(paused.id()));
    }

    #[tokio::test(start_paused = true)]
    async fn should_apply_rate_to_every_element() {
        // given
        let fixture = fixture();
        let first = add_media(&fixture.page, Some(60.0));
        let second = add_media(&fixture.page, Some(60.0));

        // when
        fixture.controller.dispatch(&*fixture.page, Action::SetRate(1.5));

        // then
        assert_eq!(first.playback_rate(), 1.5);
        assert_eq!(second.playback_rate(), 1.5);
        assert_eq!(fixture.controller.guard().registry().len(), 2);
        assert_eq!(fixture.notifier.messages(), vec!["Speed: 1.50x".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn should_persist_rate_when_remembering() {
        // given
        let fixture = fixture();
        add_media(&fixture.page, Some(60.0));

        // when
        fixture.controller.dispatch(&*fixture.page, Action::SetRate(2.0));

        // then
        assert_eq!(fixture.store.load().unwrap(), Some(2.0));
    }

    #[tokio::test(start_paused = true)]
    async fn should_not_persist_or_notify_when_disabled() {
        // given
        let mut config = Config::default();
        config.speed_control.remember_last_rate = false;
        config.ui.show_notifications = false;
        let fixture = fixture_with(config, MemoryStore::default());
        add_media(&fixture.page, Some(60.0));

        // when
        fixture.controller.dispatch(&*fixture.page, Action::SetRate(2.0));

        // then
        assert_eq!(fixture.store.load().unwrap(), None);
        assert!(fixture.notifier.messages().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn should_guard_existing_and_inserted_elements() {
        // given
        let fixture = fixture_with(Config::default(), MemoryStore::with_rate(1.5));
        let existing = add_media(&fixture.page, Some(60.0));

        // when
        let watching = fixture.controller.observe(fixture.page.clone());
        let inserted = add_media(&fixture.page, Some(60.0));
        next_turn().await;

        // then
        assert!(watching);
        assert!(fixture.controller.is_watching());
        assert_eq!(existing.playback_rate(), 1.5);
        assert_eq!(inserted.playback_rate(), 1.5);
        assert_eq!(fixture.controller.guard().registry().active_reconcilers(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn should_leave_inserted_elements_alone_without_auto_apply() {
        // given
        let mut config = Config::default();
        config.advanced.auto_apply_to_new_media = false;
        let fixture = fixture_with(config, MemoryStore::with_rate(1.5));

        // when
        let watching = fixture.controller.observe(fixture.page.clone());
        let inserted = add_media(&fixture.page, Some(60.0));
        next_turn().await;

        // then
        assert!(!watching);
        assert!(!fixture.controller.guard().is_guarded(inserted.id()));
        assert_eq!(inserted.playback_rate(), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn should_reregister_reinserted_element() {
        // given
        let fixture = fixture();
        let media = add_media(&fixture.page, Some(60.0));
        fixture.controller.observe(fixture.page.clone());
        next_turn().await;
        let first_guard = fixture.controller.guard().registry().proxy(media.id()).unwrap();

        // when
        fixture.page.remove(0);
        sleep(INTERVAL).await;
        assert!(!fixture.controller.guard().is_guarded(media.id()));
        fixture.page.insert(media.clone());
        next_turn().await;

        // then
        let second_guard = fixture.controller.guard().registry().proxy(media.id()).unwrap();
        assert!(!first_guard.is_active());
        assert!(second_guard.is_active());
        assert!(!Arc::ptr_eq(&first_guard, &second_guard));
        assert_eq!(fixture.controller.guard().registry().active_reconcilers(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn should_cancel_everything_on_shutdown() {
        // given
        let fixture = fixture();
        let media = add_media(&fixture.page, Some(60.0));
        fixture.controller.observe(fixture.page.clone());
        next_turn().await;

        // when
        fixture.controller.shutdown();
        media.set_raw_rate_silently(0.5);
        sleep(INTERVAL * 3).await;

        // then
        assert!(fixture.controller.guard().registry().is_empty());
        assert_eq!(media.raw_rate(), 0.5);
    }

    #[tokio::test(start_paused = true)]
    async fn should_ignore_insertions_after_shutdown() {
        // given
        let fixture = fixture_with(Config::default(), MemoryStore::with_rate(2.0));
        add_media(&fixture.page, Some(60.0));
        fixture.controller.observe(fixture.page.clone());
        next_turn().await;

        // when
        fixture.controller.shutdown();
        next_turn().await;
        let inserted = add_media(&fixture.page, Some(60.0));
        next_turn().await;

        // then
        assert!(!fixture.controller.is_watching());
        assert!(!fixture.controller.guard().is_guarded(inserted.id()));
        assert_eq!(fixture.controller.guard().registry().active_reconcilers(), 0);
        assert_eq!(inserted.playback_rate(), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn should_stop_watching_when_controller_is_dropped() {
        // given
        let fixture = fixture_with(Config::default(), MemoryStore::with_rate(2.0));
        fixture.controller.observe(fixture.page.clone());
        next_turn().await;
        let Fixture { controller, page, .. } = fixture;

        // when
        drop(controller);
        next_turn().await;
        let inserted = add_media(&page, Some(60.0));
        next_turn().await;

        // then
        assert_eq!(inserted.raw_write_count(), 0);
        assert_eq!(inserted.playback_rate(), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn should_keep_reconciling_with_zero_check_interval() {
        // given
        let mut config_file = std::io::Cursor::new("[advanced]\ncheck_interval_ms = 0");
        let config = Config::read(&mut config_file).unwrap();
        let fixture = fixture_with(config, MemoryStore::default());
        let media = add_media(&fixture.page, Some(60.0));

        // when
        fixture.controller.dispatch(&*fixture.page, Action::SetRate(2.0));
        media.set_raw_rate_silently(0.5);
        sleep(Duration::from_millis(500)).await;

        // then
        assert_eq!(fixture.controller.config().advanced.check_interval(), INTERVAL);
        assert_eq!(fixture.controller.guard().registry().active_reconcilers(), 1);
        assert_eq!(media.raw_rate(), 2.0);
    }
}
