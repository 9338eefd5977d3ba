//! Message passing between the client thread and the audio thread.
//!
//! Two unbounded queues, one per direction:
//! - [`AudioCommand`]: client → audio thread (play, parameter updates, stop, loads, global settings)
//! - [`ClientMessage`]: audio thread → client (sound handles coming home, load completions)
//!
//! Nothing else crosses the thread boundary except the per-slot client lock
//! and the pool's free-list. Neither side ever waits for a reply.

use crate::error::{PetalSonicError, Result};
use crate::fade::FadeDirection;
use crate::math::{Pose, Vec3};
use crate::play_id::PlayId;
use crate::sound::SoundHandle;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, unbounded};
use std::time::Duration;

/// Per-source parameters a client sets before starting playback.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceParams {
    pub position: Vec3,
    pub gain: f32,
    pub fade: f32,
    pub looping: bool,
    pub is_music: bool,
}

impl Default for SourceParams {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            gain: 1.0,
            fade: 1.0,
            looping: false,
            is_music: false,
        }
    }
}

impl SourceParams {
    pub fn apply(&mut self, update: SourceUpdate) {
        match update {
            SourceUpdate::Position(position) => self.position = position,
            SourceUpdate::Gain(gain) => self.gain = gain,
            SourceUpdate::Fade(fade) => self.fade = fade,
            SourceUpdate::Looping(looping) => self.looping = looping,
            SourceUpdate::IsMusic(is_music) => self.is_music = is_music,
        }
    }
}

/// A single parameter change on a playing source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SourceUpdate {
    Position(Vec3),
    Gain(f32),
    Fade(f32),
    Looping(bool),
    IsMusic(bool),
}

/// Commands sent from the client thread to the audio thread.
///
/// Slot commands carry the [`PlayId`] they were issued for; the audio thread
/// ignores them if the slot has moved on to another session.
#[derive(Debug)]
pub enum AudioCommand {
    Play {
        slot: usize,
        play_id: PlayId,
        sound: SoundHandle,
        params: SourceParams,
    },
    Update {
        slot: usize,
        play_id: PlayId,
        update: SourceUpdate,
    },
    Stop {
        slot: usize,
        play_id: PlayId,
    },
    Fade {
        slot: usize,
        play_id: PlayId,
        duration: Duration,
        direction: FadeDirection,
    },
    Load(SoundHandle),
    SetMusicVolume(f32),
    SetSoundVolume(f32),
    SetSoundPitch(f32),
    SetAppActive(bool),
    SetSuspended(bool),
    SetListener(Pose),
    Shutdown,
}

impl AudioCommand {
    /// The slot whose in-flight counter this command holds, if any.
    pub fn slot(&self) -> Option<usize> {
        match self {
            Self::Play { slot, .. }
            | Self::Update { slot, .. }
            | Self::Stop { slot, .. }
            | Self::Fade { slot, .. } => Some(*slot),
            _ => None,
        }
    }
}

/// Messages sent from the audio thread back to the client thread.
#[derive(Debug)]
pub enum ClientMessage {
    /// The audio thread is done with this handle; drop it on the owning thread.
    ReleaseSound(SoundHandle),
    /// The load requested for this handle has completed.
    LoadFinished(SoundHandle),
    ShutdownComplete,
}

/// Client-thread end of the dispatcher.
pub struct ClientEndpoint {
    commands: Sender<AudioCommand>,
    messages: Receiver<ClientMessage>,
}

/// Audio-thread end of the dispatcher.
pub struct AudioEndpoint {
    commands: Receiver<AudioCommand>,
    messages: Sender<ClientMessage>,
}

/// Creates a connected pair of endpoints.
pub fn channel() -> (ClientEndpoint, AudioEndpoint) {
    let (command_tx, command_rx) = unbounded();
    let (message_tx, message_rx) = unbounded();
    (
        ClientEndpoint {
            commands: command_tx,
            messages: message_rx,
        },
        AudioEndpoint {
            commands: command_rx,
            messages: message_tx,
        },
    )
}

impl ClientEndpoint {
    pub fn post(&self, command: AudioCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| PetalSonicError::ChannelClosed("audio command queue"))
    }

    pub fn try_recv(&self) -> Option<ClientMessage> {
        self.messages.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<ClientMessage> {
        self.messages.recv_timeout(timeout).ok()
    }
}

impl AudioEndpoint {
    pub fn try_recv(&self) -> std::result::Result<AudioCommand, TryRecvError> {
        self.commands.try_recv()
    }

    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> std::result::Result<AudioCommand, RecvTimeoutError> {
        self.commands.recv_timeout(timeout)
    }

    /// Posts a message to the client. If the client is gone the message is dropped here.
    pub fn reply(&self, message: ClientMessage) {
        if let Err(e) = self.messages.send(message) {
            log::debug!("Client endpoint closed, dropping {:?}", e.into_inner());
        }
    }

    pub fn release(&self, sound: SoundHandle) {
        self.reply(ClientMessage::ReleaseSound(sound));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_data::PcmClip;

    #[test]
    fn commands_arrive_in_post_order() {
        let (client, audio) = channel();
        let id = PlayId::new(3, 1);
        client
            .post(AudioCommand::Update {
                slot: 3,
                play_id: id,
                update: SourceUpdate::Gain(0.5),
            })
            .unwrap();
        client.post(AudioCommand::Stop { slot: 3, play_id: id }).unwrap();

        assert!(matches!(audio.try_recv(), Ok(AudioCommand::Update { .. })));
        let stop = audio.try_recv().unwrap();
        assert_eq!(stop.slot(), Some(3));
        assert!(matches!(stop, AudioCommand::Stop { .. }));
        assert!(audio.try_recv().is_err());
    }

    #[test]
    fn released_handles_return_to_client() {
        let (client, audio) = channel();
        let sound = SoundHandle::from_clip("tone", PcmClip::fallback());
        let id = sound.id();
        audio.release(sound);
        match client.try_recv() {
            Some(ClientMessage::ReleaseSound(returned)) => assert_eq!(returned.id(), id),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn post_fails_once_audio_side_is_gone() {
        let (client, audio) = channel();
        drop(audio);
        assert!(matches!(
            client.post(AudioCommand::Shutdown),
            Err(PetalSonicError::ChannelClosed(_))
        ));
    }

    #[test]
    fn params_apply_updates() {
        let mut params = SourceParams::default();
        params.apply(SourceUpdate::Gain(0.25));
        params.apply(SourceUpdate::IsMusic(true));
        assert_eq!(params.gain, 0.25);
        assert!(params.is_music);
        assert_eq!(params.fade, 1.0);
    }
}
