use std::time::Duration;

/// Shows short action feedback to the user.
pub trait Notifier: Send + Sync {
    fn notify(&self, message: &str, duration: Duration);
}

/// Writes notifications to the log instead of drawing them.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, message: &str, duration: Duration) {
        log::info!("[{}ms] {message}", duration.as_millis());
    }
}

pub fn rate_message(rate: f64) -> String {
    format!("Speed: {rate:.2}x")
}

pub fn seek_message(seconds: f64) -> String {
    let direction = if seconds > 0.0 { "forward" } else { "back" };
    format!("{}s {direction}", seconds.abs())
}
