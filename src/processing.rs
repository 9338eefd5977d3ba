//! The adaptive timer driving the audio thread.

use crate::backend::MixingBackend;
use crate::config::AudioEngineDesc;
use crate::dispatcher::AudioCommand;
use crate::server::AudioServer;
use crossbeam_channel::{RecvTimeoutError, TryRecvError};
use std::time::{Duration, Instant};

/// How often the loop wants to tick next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    /// A load is pending or shutdown is in progress.
    PendingLoad,
    /// At least one fade is running.
    Fade,
    /// A streamed source needs periodic refills.
    Streaming,
    Idle,
}

impl Cadence {
    pub fn interval(self, desc: &AudioEngineDesc) -> Duration {
        match self {
            Self::PendingLoad => desc.pending_load_interval,
            Self::Fade => desc.fade_interval,
            Self::Streaming => desc.stream_interval,
            Self::Idle => desc.idle_interval,
        }
    }
}

/// Audio-thread driver: executes commands and ticks the server on an adaptive cadence.
///
/// In threaded mode [`run`](Self::run) owns the thread. In manual mode the
/// caller drives it with [`pump`](Self::pump) and [`tick`](Self::tick), which
/// take the current time explicitly so tests can run on synthetic clocks.
pub struct ProcessingLoop<B: MixingBackend> {
    server: AudioServer<B>,
    desc: AudioEngineDesc,
    running: bool,
}

impl<B: MixingBackend> ProcessingLoop<B> {
    pub(crate) fn new(server: AudioServer<B>, desc: AudioEngineDesc) -> Self {
        Self {
            server,
            desc,
            running: true,
        }
    }

    pub fn server(&self) -> &AudioServer<B> {
        &self.server
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn cadence(&self) -> Cadence {
        if self.server.has_pending_loads() || self.server.is_shutting_down() {
            Cadence::PendingLoad
        } else if self.server.has_fades() {
            Cadence::Fade
        } else if self.server.has_streams() {
            Cadence::Streaming
        } else {
            Cadence::Idle
        }
    }

    pub fn handle(&mut self, command: AudioCommand, now: Instant) {
        if self.running && !self.server.handle(command, now) {
            self.running = false;
        }
    }

    /// Executes every queued command without blocking. Returns how many ran.
    pub fn pump(&mut self, now: Instant) -> usize {
        let mut executed = 0;
        while self.running {
            match self.server.endpoint().try_recv() {
                Ok(command) => {
                    self.handle(command, now);
                    executed += 1;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.disconnect(now);
                    break;
                }
            }
        }
        executed
    }

    /// Runs one pass of periodic work and returns the delay until the next one.
    pub fn tick(&mut self, now: Instant) -> Duration {
        if self.running {
            self.server.tick(now);
        }
        self.cadence().interval(&self.desc)
    }

    /// Blocks the calling thread until shutdown.
    pub fn run(mut self) {
        log::info!("Audio thread started");
        let mut next_tick = Instant::now();
        while self.running {
            let now = Instant::now();
            if now >= next_tick {
                next_tick = now + self.tick(now);
            }

            match self
                .server
                .endpoint()
                .recv_timeout(next_tick.saturating_duration_since(Instant::now()))
            {
                Ok(command) => {
                    let now = Instant::now();
                    self.handle(command, now);
                    // A command may call for a faster cadence, e.g. a new load request.
                    next_tick = next_tick.min(now + self.cadence().interval(&self.desc));
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => self.disconnect(Instant::now()),
            }
        }
        log::info!("Audio thread exiting");
    }

    fn disconnect(&mut self, now: Instant) {
        log::warn!("Client endpoint dropped without shutdown, stopping audio");
        self.handle(AudioCommand::Shutdown, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cadence_intervals_follow_config() {
        let desc = AudioEngineDesc::default();
        assert_eq!(Cadence::PendingLoad.interval(&desc), Duration::from_millis(1));
        assert_eq!(Cadence::Fade.interval(&desc), Duration::from_millis(50));
        assert_eq!(Cadence::Streaming.interval(&desc), Duration::from_millis(100));
        assert_eq!(Cadence::Idle.interval(&desc), Duration::from_millis(500));
    }
}
