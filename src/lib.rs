//! Locks the playback rate of media elements on a page.
//!
//! A [`RateController`] owns the target rate and one guard per media element.
//! Guards intercept the element's public rate accessor, so page scripts always
//! read the desired rate and can't change it, and a per-element reconciler
//! corrects any drift that bypassed the accessor.

pub mod config;
pub mod controller;
pub mod guard;
pub mod keys;
pub mod media;
pub mod notify;
mod scheduler;
pub mod sim;
pub mod storage;
pub mod utils;

pub use config::Config;
pub use controller::{Dispatch, RateController};
pub use guard::{GuardRegistry, RateGuard, RateProxy};
pub use keys::{Action, ActionRegistry, KeyEvent, Modifier, Modifiers};
pub use media::{ElementId, MediaElement, MediaEvent, Page, RateAccessor};
pub use notify::{LogNotifier, Notifier};
pub use storage::{FileStore, MemoryStore, RateStore};
