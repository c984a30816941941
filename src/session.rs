//! Session lifecycle: acquire everything on `start`, release everything on `stop`.
//!
//! The owner drives the session from one task. `next_event` pulls inbound
//! messages off the transport and applies each one fully before returning,
//! and `press`/`release` are called between those awaits. Every resource is
//! stored on the session the moment it is acquired, so a `start` future that
//! is dropped half-way still leaves `stop` (or `Drop`) something to clean.

use crate::audio::{AudioSource, LocalTrack, Microphone};
use crate::conversation::ConversationEntry;
use crate::error::{Result, SessionError};
use crate::ptt::PttState;
use crate::realtime::{Connector, SessionConfigurator, SessionOptions, TransportHandle};
use crate::router::{self, RouteOutcome, SessionState};
use crate::settings::Settings;
use crate::token::{CredentialSource, Persona};
use crate::usage::{self, BillingClient, SessionUsage, UsageCounters};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Captured frames buffered between the device and the transport writer.
const AUDIO_CHANNEL_CAPACITY: usize = 256;

/// External collaborators. Swapped for fakes in tests.
#[derive(Clone)]
pub struct SessionDeps {
    pub credentials: Arc<dyn CredentialSource>,
    pub connector: Arc<dyn Connector>,
    pub audio: Arc<dyn AudioSource>,
    pub billing: Arc<dyn BillingClient>,
}

#[derive(Debug, Clone, Default)]
pub struct SessionSettings {
    pub persona: Persona,
    pub options: SessionOptions,
    /// Where finished sessions are journaled; `None` disables the journal.
    pub usage_journal: Option<PathBuf>,
}

impl From<&Settings> for SessionSettings {
    fn from(settings: &Settings) -> Self {
        Self {
            persona: settings.persona.clone(),
            options: SessionOptions::from_settings(settings),
            usage_journal: if settings.usage_journal {
                usage::session_usage_path()
            } else {
                None
            },
        }
    }
}

#[derive(Debug)]
pub enum SessionEvent {
    LogUpdated,
    UsageUpdated,
    /// Reported by the remote; the session is still running.
    RemoteError(SessionError),
    /// The transport went away and the session has been stopped.
    Disconnected,
}

pub struct Session {
    deps: SessionDeps,
    settings: SessionSettings,
    state: SessionState,
    active: bool,
    started_at: Option<DateTime<Utc>>,
    track: LocalTrack,
    configurator: SessionConfigurator,
    transport: Option<TransportHandle>,
    audio_pipeline: Option<mpsc::Sender<Vec<u8>>>,
    microphone: Option<Box<dyn Microphone>>,
    last_debit: Option<JoinHandle<()>>,
}

impl Session {
    pub fn new(deps: SessionDeps, settings: SessionSettings) -> Self {
        Self {
            deps,
            settings,
            state: SessionState::default(),
            active: false,
            started_at: None,
            track: LocalTrack::new(),
            configurator: SessionConfigurator::default(),
            transport: None,
            audio_pipeline: None,
            microphone: None,
            last_debit: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// The conversation so far, in display order.
    pub fn log(&self) -> &[ConversationEntry] {
        self.state.conversation.entries()
    }

    pub fn usage(&self) -> UsageCounters {
        self.state.usage.counters()
    }

    pub fn ptt_state(&self) -> PttState {
        self.state.ptt.state()
    }

    pub fn is_transmitting(&self) -> bool {
        self.track.is_enabled()
    }

    /// The billing task spawned by the most recent `stop`, if one was needed.
    pub fn take_debit_task(&mut self) -> Option<JoinHandle<()>> {
        self.last_debit.take()
    }

    /// Opens a new session. Any terminal failure tears down whatever was
    /// acquired and is returned to the caller.
    pub async fn start(&mut self) -> Result<()> {
        if self.active {
            log::debug!("[session] start ignored, already active");
            return Ok(());
        }
        // Leftovers from a start that was cancelled mid-way.
        self.stop();

        self.state.conversation.reset();
        self.state.ptt.reset();
        self.configurator.reset();
        self.track = LocalTrack::new();

        match self.open().await {
            Ok(()) => {
                self.active = true;
                log::info!("[session] started");
                Ok(())
            }
            Err(e) => {
                log::error!("[session] start failed: {}", e);
                self.stop();
                Err(e)
            }
        }
    }

    async fn open(&mut self) -> Result<()> {
        self.state.usage.start();
        self.started_at = Some(Utc::now());

        let credential = self.deps.credentials.fetch(&self.settings.persona).await?;
        log::info!("[session] credential acquired (expires_at={:?})", credential.expires_at);

        let (frames_tx, frames_rx) = mpsc::channel(AUDIO_CHANNEL_CAPACITY);
        self.audio_pipeline = Some(frames_tx.clone());
        self.microphone = Some(self.deps.audio.acquire(self.track.clone(), frames_tx)?);

        let transport = self.deps.connector.connect(&credential, frames_rx).await?;
        let transport = self.transport.insert(transport);
        self.configurator.configure(transport, &self.settings.options)?;
        Ok(())
    }

    /// Push-to-talk down. Returns true if the microphone went live.
    pub fn press(&mut self) -> bool {
        let transport_open = self
            .transport
            .as_ref()
            .map(TransportHandle::is_open)
            .unwrap_or(false);
        self.state.ptt.press(
            self.active,
            transport_open,
            &self.track,
            &mut self.state.conversation,
        )
    }

    /// Push-to-talk up. Returns true if the utterance was committed.
    pub fn release(&mut self) -> Result<bool> {
        match &self.transport {
            Some(transport) => self.state.ptt.release(&self.track, transport),
            None => {
                self.track.disable();
                Ok(false)
            }
        }
    }

    /// Waits for the next inbound message that changes something.
    /// Returns `None` once there is no transport to read from.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        loop {
            let raw = match self.transport.as_mut()?.recv().await {
                Some(raw) => raw,
                None => {
                    log::warn!("[session] transport closed by remote");
                    self.stop();
                    return Some(SessionEvent::Disconnected);
                }
            };
            if let Some(event) = self.handle_message(&raw) {
                return Some(event);
            }
        }
    }

    /// Applies one raw control-channel message.
    pub fn handle_message(&mut self, raw: &str) -> Option<SessionEvent> {
        if !self.active {
            log::debug!("[session] message ignored, session not active");
            return None;
        }
        match router::dispatch(&mut self.state, raw) {
            RouteOutcome::LogChanged => Some(SessionEvent::LogUpdated),
            RouteOutcome::UsageRecorded => Some(SessionEvent::UsageUpdated),
            RouteOutcome::RemoteError(e) => Some(SessionEvent::RemoteError(e)),
            RouteOutcome::Ignored => None,
        }
    }

    /// Releases everything. Safe to call at any point, any number of times.
    pub fn stop(&mut self) {
        let was_active = std::mem::replace(&mut self.active, false);

        if let Some(record) = self.state.usage.finish() {
            self.last_debit = usage::submit_detached(Arc::clone(&self.deps.billing), &record);
            self.journal(&record);
        }

        if let Some(transport) = self.transport.as_mut() {
            transport.close_control();
        }
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }

        self.track.disable();
        self.audio_pipeline = None;

        if let Some(mut microphone) = self.microphone.take() {
            microphone.release();
        }

        self.state.conversation.clear_ephemeral();
        self.state.ptt.reset();
        self.configurator.reset();
        self.started_at = None;

        if was_active {
            log::info!("[session] stopped");
        }
    }

    fn journal(&self, record: &SessionUsage) {
        if record.counters.is_zero() {
            return;
        }
        let Some(path) = self.settings.usage_journal.as_deref() else {
            return;
        };
        if let Err(e) = usage::append_usage_line(path, record) {
            log::warn!("[usage] {}", e);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}
