use super::transport::TransportHandle;
use super::ClientEvent;
use crate::audio::TARGET_SAMPLE_RATE;
use crate::error::Result;
use crate::settings::Settings;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Text,
    Audio,
}

impl Modality {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "text" => Some(Modality::Text),
            "audio" => Some(Modality::Audio),
            _ => None,
        }
    }
}

/// What the remote endpoint is told once the control channel opens.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    pub modalities: Vec<Modality>,
    pub transcription_model: String,
    pub language: String,
    pub voice: String,
}

impl SessionOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        let mut modalities = Vec::new();
        for name in &settings.modalities {
            match Modality::parse(name) {
                Some(m) if !modalities.contains(&m) => modalities.push(m),
                Some(_) => {}
                None => log::warn!("[config] ignoring unknown modality {:?}", name),
            }
        }
        if modalities.is_empty() {
            modalities.push(Modality::Audio);
        }
        Self {
            modalities,
            transcription_model: settings.transcription_model.clone(),
            language: settings.language.clone(),
            voice: settings.voice.clone(),
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionConfig {
    #[serde(rename = "type")]
    kind: &'static str,
    output_modalities: Vec<Modality>,
    audio: AudioConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct AudioConfig {
    input: AudioInputConfig,
    output: AudioOutputConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct AudioInputConfig {
    format: AudioFormat,
    transcription: TranscriptionConfig,
    /// Always null: push-to-talk decides when a turn ends, not server VAD.
    turn_detection: Option<()>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct AudioOutputConfig {
    format: AudioFormat,
    voice: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct AudioFormat {
    #[serde(rename = "type")]
    kind: &'static str,
    rate: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct TranscriptionConfig {
    model: String,
    language: String,
}

fn pcm_format() -> AudioFormat {
    AudioFormat {
        kind: "audio/pcm",
        rate: TARGET_SAMPLE_RATE,
    }
}

pub fn session_update(options: &SessionOptions) -> ClientEvent {
    ClientEvent::SessionUpdate {
        session: SessionConfig {
            kind: "realtime",
            output_modalities: options.modalities.clone(),
            audio: AudioConfig {
                input: AudioInputConfig {
                    format: pcm_format(),
                    transcription: TranscriptionConfig {
                        model: options.transcription_model.clone(),
                        language: options.language.clone(),
                    },
                    turn_detection: None,
                },
                output: AudioOutputConfig {
                    format: pcm_format(),
                    voice: options.voice.clone(),
                },
            },
        },
    }
}

/// Sends the session configuration exactly once per transport.
#[derive(Debug, Default)]
pub struct SessionConfigurator {
    sent: bool,
}

impl SessionConfigurator {
    pub fn is_configured(&self) -> bool {
        self.sent
    }

    pub fn configure(&mut self, transport: &TransportHandle, options: &SessionOptions) -> Result<()> {
        if self.sent {
            log::debug!("[config] session already configured");
            return Ok(());
        }
        transport.send(session_update(options))?;
        self.sent = true;
        log::info!(
            "[config] session.update sent: modalities={:?} transcription={} language={} voice={}",
            options.modalities,
            options.transcription_model,
            options.language,
            options.voice
        );
        Ok(())
    }

    pub fn reset(&mut self) {
        self.sent = false;
    }
}
