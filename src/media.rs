//! Collaborator surface for media elements owned by the host page.
//!
//! The controller never creates or destroys elements. It only reads and writes
//! through [`MediaElement`] and replaces the element's public rate accessor.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::id_type;

id_type!(ElementId);

/// Native lifecycle events fired by a media element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaEvent {
    RateChange,
    LoadedMetadata,
    Emptied,
    Play,
    Pause,
    Seeked,
}

impl MediaEvent {
    /// Whether the media pipeline may have reset the playback rate.
    pub fn may_reset_rate(self) -> bool {
        matches!(
            self,
            Self::RateChange | Self::LoadedMetadata | Self::Emptied
        )
    }
}

/// The accessor pair host scripts see for `playbackRate` once it is replaced.
pub trait RateAccessor: Send + Sync {
    fn get(&self) -> f64;
    fn set(&self, rate: f64);
}

pub trait MediaElement: Send + Sync {
    fn id(&self) -> ElementId;

    /// Reads the rate through the element's own getter, bypassing any
    /// installed accessor.
    fn raw_rate(&self) -> f64;

    /// Writes the rate through the element's own setter, bypassing any
    /// installed accessor.
    fn set_raw_rate(&self, rate: f64) -> anyhow::Result<()>;

    fn current_time(&self) -> f64;
    fn set_current_time(&self, time: f64);

    /// `None` while the duration is unknown.
    fn duration(&self) -> Option<f64>;

    fn is_paused(&self) -> bool;

    /// Whether the element is still part of the document.
    fn is_attached(&self) -> bool;

    /// Replaces the public rate accessor. Fails if the property cannot be
    /// redefined.
    fn install_rate_accessor(&self, accessor: Arc<dyn RateAccessor>) -> anyhow::Result<()>;

    fn events(&self) -> broadcast::Receiver<MediaEvent>;
}

/// The document hosting the media elements.
pub trait Page: Send + Sync {
    /// Every media element currently in the document, in document order.
    fn media_elements(&self) -> Vec<Arc<dyn MediaElement>>;

    /// Elements inserted into the document from now on.
    fn insertions(&self) -> broadcast::Receiver<Arc<dyn MediaElement>>;
}
