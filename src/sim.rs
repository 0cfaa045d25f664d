//! In-process stand-ins for a host page and its media elements.
//!
//! Used by the headless harness and by tests. The "host script" side of an
//! element is [`SimulatedMedia::playback_rate`] / [`SimulatedMedia::set_playback_rate`],
//! which go through whatever accessor was installed, exactly like page scripts
//! going through a redefined property.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use anyhow::anyhow;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::media::{ElementId, MediaElement, MediaEvent, Page, RateAccessor};

#[cfg(test)]
pub(crate) use doubles::{next_turn, RecordingNotifier};

const EVENT_CAPACITY: usize = 16;

#[derive(Debug, Clone)]
struct MediaState {
    rate: f64,
    current_time: f64,
    duration: Option<f64>,
    paused: bool,
    attached: bool,
}

pub struct SimulatedMedia {
    id: ElementId,
    state: Mutex<MediaState>,
    accessor: Mutex<Option<Arc<dyn RateAccessor>>>,
    accessor_locked: AtomicBool,
    raw_writes: AtomicUsize,
    events: broadcast::Sender<MediaEvent>,
}

impl SimulatedMedia {
    pub fn new(duration: Option<f64>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            id: ElementId::new(),
            state: Mutex::new(MediaState {
                rate: 1.0,
                current_time: 0.0,
                duration,
                paused: true,
                attached: true,
            }),
            accessor: Mutex::new(None),
            accessor_locked: AtomicBool::new(false),
            raw_writes: AtomicUsize::new(0),
            events,
        })
    }

    fn accessor(&self) -> Option<Arc<dyn RateAccessor>> {
        self.accessor.lock().clone()
    }

    fn emit(&self, event: MediaEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    /// `playbackRate` as read by a page script.
    pub fn playback_rate(&self) -> f64 {
        match self.accessor() {
            Some(accessor) => accessor.get(),
            None => self.raw_rate(),
        }
    }

    /// `playbackRate = rate` as written by a page script.
    pub fn set_playback_rate(&self, rate: f64) {
        match self.accessor() {
            Some(accessor) => accessor.set(rate),
            None => {
                if let Err(err) = self.set_raw_rate(rate) {
                    log::debug!("Element {} ignored rate write: {err:?}", self.id);
                }
            }
        }
    }

    /// Changes the underlying rate without firing any event.
    pub fn set_raw_rate_silently(&self, rate: f64) {
        self.state.lock().rate = rate;
    }

    /// The media pipeline resetting the rate on its own.
    pub fn pipeline_reset_rate(&self, rate: f64) {
        self.state.lock().rate = rate;
        self.emit(MediaEvent::RateChange);
    }

    /// A new source finished loading: duration becomes known and the rate
    /// falls back to 1.0.
    pub fn load_metadata(&self, duration: f64) {
        {
            let mut state = self.state.lock();
            state.duration = Some(duration);
            state.rate = 1.0;
        }
        self.emit(MediaEvent::LoadedMetadata);
    }

    pub fn play(&self) {
        self.state.lock().paused = false;
        self.emit(MediaEvent::Play);
    }

    pub fn pause(&self) {
        self.state.lock().paused = true;
        self.emit(MediaEvent::Pause);
    }

    pub fn attach(&self) {
        self.state.lock().attached = true;
    }

    pub fn detach(&self) {
        self.state.lock().attached = false;
    }

    /// Makes the rate property non-configurable.
    pub fn lock_accessor(&self) {
        self.accessor_locked.store(true, Ordering::SeqCst);
    }

    /// How many times the element's own rate setter ran.
    pub fn raw_write_count(&self) -> usize {
        self.raw_writes.load(Ordering::SeqCst)
    }
}

impl MediaElement for SimulatedMedia {
    fn id(&self) -> ElementId {
        self.id
    }

    fn raw_rate(&self) -> f64 {
        self.state.lock().rate
    }

    fn set_raw_rate(&self, rate: f64) -> anyhow::Result<()> {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(anyhow!("Playback rate {rate} is not supported"));
        }
        self.raw_writes.fetch_add(1, Ordering::SeqCst);
        let changed = {
            let mut state = self.state.lock();
            let changed = state.rate != rate;
            state.rate = rate;
            changed
        };
        if changed {
            self.emit(MediaEvent::RateChange);
        }
        Ok(())
    }

    fn current_time(&self) -> f64 {
        self.state.lock().current_time
    }

    fn set_current_time(&self, time: f64) {
        self.state.lock().current_time = time;
        self.emit(MediaEvent::Seeked);
    }

    fn duration(&self) -> Option<f64> {
        self.state.lock().duration
    }

    fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    fn is_attached(&self) -> bool {
        self.state.lock().attached
    }

    fn install_rate_accessor(&self, accessor: Arc<dyn RateAccessor>) -> anyhow::Result<()> {
        if self.accessor_locked.load(Ordering::SeqCst) {
            return Err(anyhow!("playbackRate of element {} is not configurable", self.id));
        }
        *self.accessor.lock() = Some(accessor);
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<MediaEvent> {
        self.events.subscribe()
    }
}

impl std::fmt::Debug for SimulatedMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedMedia")
            .field("id", &self.id)
            .field("state", &*self.state.lock())
            .finish()
    }
}

pub struct SimulatedPage {
    elements: Mutex<Vec<Arc<SimulatedMedia>>>,
    insertions: broadcast::Sender<Arc<dyn MediaElement>>,
}

impl SimulatedPage {
    pub fn new() -> Arc<Self> {
        let (insertions, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            elements: Mutex::new(Vec::new()),
            insertions,
        })
    }

    pub fn insert(&self, media: Arc<SimulatedMedia>) {
        media.attach();
        self.elements.lock().push(Arc::clone(&media));
        let _ = self.insertions.send(media);
    }

    pub fn remove(&self, index: usize) -> Option<Arc<SimulatedMedia>> {
        let mut elements = self.elements.lock();
        if index >= elements.len() {
            return None;
        }
        let media = elements.remove(index);
        media.detach();
        Some(media)
    }

    pub fn get(&self, index: usize) -> Option<Arc<SimulatedMedia>> {
        self.elements.lock().get(index).cloned()
    }

    pub fn elements(&self) -> Vec<Arc<SimulatedMedia>> {
        self.elements.lock().clone()
    }
}

impl Page for SimulatedPage {
    fn media_elements(&self) -> Vec<Arc<dyn MediaElement>> {
        self.elements
            .lock()
            .iter()
            .map(|media| Arc::clone(media) as Arc<dyn MediaElement>)
            .collect()
    }

    fn insertions(&self) -> broadcast::Receiver<Arc<dyn MediaElement>> {
        self.insertions.subscribe()
    }
}
