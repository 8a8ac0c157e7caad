//! Audible alert for new unread messages.
//!
//! Audio may only play after the user interacted with the client at least
//! once. [`NotificationCue::on_user_gesture`] tries to unlock the sink on
//! every interaction until it succeeds; until then [`Cue::ring`] does
//! nothing. Sink failures are logged and swallowed.

use std::io::{IsTerminal, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Errors reported by an [`AudioSink`].
#[derive(Debug, thiserror::Error)]
pub enum CueError {
    /// The sink refuses to play before it is unlocked.
    #[error("audio is locked")]
    Locked,

    /// The output device failed.
    #[error("audio device error: {0}")]
    Device(String),
}

/// Something that can make a short sound.
pub trait AudioSink: Send + Sync + 'static {
    /// Prepares the sink after a user gesture.
    ///
    /// # Errors
    ///
    /// Returns [`CueError`] if the sink cannot be unlocked.
    fn unlock(&self) -> Result<(), CueError>;

    /// Plays the cue once.
    ///
    /// # Errors
    ///
    /// Returns [`CueError`] if nothing could be played.
    fn play(&self) -> Result<(), CueError>;
}

/// Receiver of "unread count went up" notifications.
pub trait Cue: Send + Sync + 'static {
    /// Signals that new unread messages arrived.
    fn ring(&self);
}

/// Plays an [`AudioSink`] once unlocked by a user gesture.
#[derive(Debug)]
pub struct NotificationCue<S: AudioSink> {
    sink: S,
    unlocked: AtomicBool,
    played: AtomicUsize,
}

impl<S: AudioSink> NotificationCue<S> {
    /// Creates a locked cue.
    #[must_use]
    pub const fn new(sink: S) -> Self {
        Self {
            sink,
            unlocked: AtomicBool::new(false),
            played: AtomicUsize::new(0),
        }
    }

    /// Call on any user interaction. Unlocks the sink the first time it
    /// succeeds; a failed attempt leaves the cue silent.
    pub fn on_user_gesture(&self) {
        if self.unlocked.load(Ordering::Acquire) {
            return;
        }
        match self.sink.unlock() {
            Ok(()) => {
                self.unlocked.store(true, Ordering::Release);
                tracing::debug!("notification cue unlocked");
            }
            Err(e) => tracing::debug!(err = %e, "notification cue unlock failed"),
        }
    }

    /// Whether a gesture has unlocked the sink.
    #[must_use]
    pub fn is_unlocked(&self) -> bool {
        self.unlocked.load(Ordering::Acquire)
    }

    /// Number of cues actually played.
    #[must_use]
    pub fn played(&self) -> usize {
        self.played.load(Ordering::Relaxed)
    }
}

impl<S: AudioSink> Cue for NotificationCue<S> {
    fn ring(&self) {
        if !self.is_unlocked() {
            tracing::debug!("notification cue locked; staying silent");
            return;
        }
        match self.sink.play() {
            Ok(()) => {
                self.played.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => tracing::debug!(err = %e, "notification cue failed to play"),
        }
    }
}

/// Rings the terminal bell on stderr.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalBell;

impl AudioSink for TerminalBell {
    fn unlock(&self) -> Result<(), CueError> {
        if std::io::stderr().is_terminal() {
            Ok(())
        } else {
            Err(CueError::Device("stderr is not a terminal".into()))
        }
    }

    fn play(&self) -> Result<(), CueError> {
        let mut err = std::io::stderr().lock();
        err.write_all(b"\x07")
            .and_then(|()| err.flush())
            .map_err(|e| CueError::Device(e.to_string()))
    }
}

/// A sink that plays nothing and never fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl AudioSink for NullSink {
    fn unlock(&self) -> Result<(), CueError> {
        Ok(())
    }

    fn play(&self) -> Result<(), CueError> {
        Ok(())
    }
}
