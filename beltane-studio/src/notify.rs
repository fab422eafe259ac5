//! Fire-and-forget queue of operator-visible status events.

use beltane_types::{Level, Notification};
use crossbeam_channel::{unbounded, Receiver, Sender};

/// Sender half of the notification channel.
///
/// Sends never block; if the receiving side is gone the event is dropped.
/// Every event is also mirrored into the `log` facade at the matching
/// level, so a consumer-less studio still leaves a trace.
#[derive(Clone)]
pub struct Notifier {
    tx: Sender<Notification>,
}

impl Notifier {
    pub fn new() -> (Self, Receiver<Notification>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }

    /// A notifier with no consumer. Events still reach the log.
    pub fn detached() -> Self {
        let (tx, _) = unbounded();
        Self { tx }
    }

    pub fn info(&self, message: impl Into<String>) {
        self.push(Level::Info, message.into());
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.push(Level::Warn, message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.push(Level::Error, message.into());
    }

    fn push(&self, level: Level, message: String) {
        match level {
            Level::Info => log::info!(target: "studio", "{}", message),
            Level::Warn => log::warn!(target: "studio", "{}", message),
            Level::Error => log::error!(target: "studio", "{}", message),
        }
        let _ = self.tx.try_send(Notification { level, message });
    }
}
