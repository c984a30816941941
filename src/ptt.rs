//! Push-to-talk gate.
//!
//! `Idle -> Armed` on press (track enabled, a user turn opened),
//! `Armed -> Committed` on release (track disabled, commit then response
//! request sent), `Committed -> Idle` once the remote acknowledges the turn.

use crate::audio::LocalTrack;
use crate::conversation::Conversation;
use crate::error::Result;
use crate::realtime::{ClientEvent, TransportHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PttState {
    #[default]
    Idle,
    Armed,
    Committed,
}

#[derive(Debug, Default)]
pub struct PushToTalk {
    state: PttState,
}

impl PushToTalk {
    pub fn state(&self) -> PttState {
        self.state
    }

    /// Returns true if the microphone went live.
    pub fn press(
        &mut self,
        active: bool,
        transport_open: bool,
        track: &LocalTrack,
        conversation: &mut Conversation,
    ) -> bool {
        if !active || !transport_open {
            log::debug!("[ptt] press ignored (active={}, transport_open={})", active, transport_open);
            return false;
        }
        if self.state == PttState::Armed {
            return false;
        }
        track.enable();
        conversation.begin_turn();
        self.state = PttState::Armed;
        log::info!("[ptt] armed");
        true
    }

    /// Returns true if the utterance was committed.
    pub fn release(&mut self, track: &LocalTrack, transport: &TransportHandle) -> Result<bool> {
        if self.state != PttState::Armed {
            return Ok(false);
        }
        track.disable();
        self.state = PttState::Committed;
        // Commit before asking for a response, or the remote answers an empty turn.
        transport.send(ClientEvent::AudioCommit)?;
        transport.send(ClientEvent::ResponseCreate)?;
        log::info!("[ptt] committed");
        Ok(true)
    }

    /// The remote has taken the committed turn.
    pub fn settle(&mut self) {
        if self.state == PttState::Committed {
            self.state = PttState::Idle;
        }
    }

    pub fn reset(&mut self) {
        self.state = PttState::Idle;
    }
}
