use crate::error::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// PCM16 mono rate expected by the realtime endpoint.
pub const TARGET_SAMPLE_RATE: u32 = 24000;

/// Shared on/off switch for the outgoing microphone track.
///
/// Starts disabled: captured audio is dropped at the source until
/// push-to-talk enables it.
#[derive(Debug, Clone, Default)]
pub struct LocalTrack {
    enabled: Arc<AtomicBool>,
}

impl LocalTrack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

/// Something that can take exclusive hold of an input device.
pub trait AudioSource: Send + Sync {
    /// Starts capturing. PCM16 frames go to `frames` only while `track` is enabled.
    fn acquire(&self, track: LocalTrack, frames: mpsc::Sender<Vec<u8>>)
        -> Result<Box<dyn Microphone>>;
}

/// A held microphone. Releasing stops capture and frees the device.
pub trait Microphone: Send {
    /// Must be safe to call more than once.
    fn release(&mut self);
}

/// Forwards one captured chunk if the track is live. Never blocks the capture path.
pub fn forward_frame(track: &LocalTrack, frames: &mpsc::Sender<Vec<u8>>, pcm: Vec<u8>) -> bool {
    if pcm.is_empty() || !track.is_enabled() {
        return false;
    }
    frames.try_send(pcm).is_ok()
}

pub fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

pub fn to_pcm16(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&s| {
            let clamped = (s * 32767.0).clamp(-32768.0, 32767.0) as i16;
            clamped.to_le_bytes()
        })
        .collect()
}

#[derive(Debug, Default)]
pub struct ResamplerState {
    t: f64,
    last_sample: f32,
    has_last: bool,
}

/// Streaming linear resampler; `state` carries phase across chunks.
pub fn resample_linear(
    samples: &[f32],
    input_rate: u32,
    target_rate: u32,
    state: &mut ResamplerState,
) -> Vec<f32> {
    if samples.is_empty() || input_rate == target_rate || target_rate == 0 {
        return samples.to_vec();
    }
    let step = input_rate as f64 / target_rate as f64;
    let mut out = Vec::with_capacity(((samples.len() as f64 / step) + 2.0) as usize);

    let mut buf = Vec::with_capacity(samples.len() + 1);
    if state.has_last {
        buf.push(state.last_sample);
    }
    buf.extend_from_slice(samples);

    let mut i: usize = 0;
    let mut t = state.t;
    while i + 1 < buf.len() {
        let s0 = buf[i];
        let s1 = buf[i + 1];
        out.push(s0 + (s1 - s0) * t as f32);
        t += step;
        while t >= 1.0 {
            t -= 1.0;
            i += 1;
            if i + 1 >= buf.len() {
                break;
            }
        }
    }

    state.t = t;
    if let Some(last) = buf.last() {
        state.last_sample = *last;
        state.has_last = true;
    }
    out
}

#[cfg(feature = "microphone")]
pub use capture::{list_input_devices, CpalSource};

#[cfg(feature = "microphone")]
mod capture {
    use super::*;
    use crate::error::SessionError;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::StreamConfig;
    use std::sync::mpsc as std_mpsc;
    use std::thread::JoinHandle;

    /// Default-host microphone via cpal.
    pub struct CpalSource {
        device_name: Option<String>,
    }

    impl CpalSource {
        /// An empty name selects the default input device.
        pub fn new(device_name: &str) -> Self {
            Self {
                device_name: if device_name.is_empty() {
                    None
                } else {
                    Some(device_name.to_string())
                },
            }
        }
    }

    struct CpalMicrophone {
        stop_tx: Option<std_mpsc::Sender<()>>,
        owner: Option<JoinHandle<()>>,
        processor: Option<JoinHandle<()>>,
    }

    impl Microphone for CpalMicrophone {
        fn release(&mut self) {
            let Some(stop_tx) = self.stop_tx.take() else {
                return;
            };
            let _ = stop_tx.send(());
            if let Some(owner) = self.owner.take() {
                let _ = owner.join();
            }
            // The processor exits once the stream (and its sender) is gone.
            if let Some(processor) = self.processor.take() {
                let _ = processor.join();
            }
            log::info!("[audio] microphone released");
        }
    }

    impl Drop for CpalMicrophone {
        fn drop(&mut self) {
            self.release();
        }
    }

    impl AudioSource for CpalSource {
        fn acquire(
            &self,
            track: LocalTrack,
            frames: mpsc::Sender<Vec<u8>>,
        ) -> Result<Box<dyn Microphone>> {
            let (raw_tx, raw_rx) = std_mpsc::sync_channel::<Vec<f32>>(128);
            let (ready_tx, ready_rx) = std_mpsc::sync_channel::<std::result::Result<u32, String>>(1);
            let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
            let device_name = self.device_name.clone();

            // cpal streams are not Send; the stream lives and dies on this thread.
            let owner = std::thread::spawn(move || {
                let stream = match open_stream(device_name.as_deref(), raw_tx) {
                    Ok((stream, rate)) => {
                        let _ = ready_tx.send(Ok(rate));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = stop_rx.recv();
                drop(stream);
            });

            let input_rate = match ready_rx.recv() {
                Ok(Ok(rate)) => rate,
                Ok(Err(e)) => {
                    let _ = owner.join();
                    return Err(SessionError::PermissionDenied(e));
                }
                Err(_) => {
                    let _ = owner.join();
                    return Err(SessionError::PermissionDenied(
                        "capture thread exited before the stream opened".into(),
                    ));
                }
            };

            let processor = std::thread::spawn(move || {
                let mut resampler = ResamplerState::default();
                let mut forwarded: u64 = 0;
                while let Ok(samples) = raw_rx.recv() {
                    let resampled =
                        resample_linear(&samples, input_rate, TARGET_SAMPLE_RATE, &mut resampler);
                    if forward_frame(&track, &frames, to_pcm16(&resampled)) {
                        forwarded += 1;
                    }
                }
                log::debug!("[audio] processing thread stopped after {} frames", forwarded);
            });

            Ok(Box::new(CpalMicrophone {
                stop_tx: Some(stop_tx),
                owner: Some(owner),
                processor: Some(processor),
            }))
        }
    }

    fn open_stream(
        device_name: Option<&str>,
        raw_tx: std_mpsc::SyncSender<Vec<f32>>,
    ) -> std::result::Result<(cpal::Stream, u32), String> {
        let host = cpal::default_host();
        let device = if let Some(name) = device_name {
            host.input_devices()
                .map_err(|e| format!("Failed to list devices: {}", e))?
                .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                .ok_or_else(|| format!("Device '{}' not found", name))?
        } else {
            host.default_input_device()
                .ok_or("No default input device")?
        };
        let name = device.name().unwrap_or_else(|_| "unknown".into());

        let default = device
            .default_input_config()
            .map_err(|e| format!("No input config for '{}': {}", name, e))?;
        let config = StreamConfig {
            channels: default.channels(),
            sample_rate: default.sample_rate(),
            buffer_size: cpal::BufferSize::Default,
        };
        let channels = config.channels as usize;
        log::info!(
            "[audio] using device '{}': {}Hz {}ch -> {}Hz mono",
            name,
            config.sample_rate.0,
            channels,
            TARGET_SAMPLE_RATE
        );

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let _ = raw_tx.try_send(downmix(data, channels));
                },
                |err| log::error!("[audio] stream error: {}", err),
                None,
            )
            .map_err(|e| format!("Failed to build stream: {}", e))?;
        stream
            .play()
            .map_err(|e| format!("Failed to start stream: {}", e))?;
        Ok((stream, config.sample_rate.0))
    }

    /// Names of the available input devices.
    pub fn list_input_devices() -> Vec<String> {
        let host = cpal::default_host();
        match host.input_devices() {
            Ok(devices) => devices.filter_map(|d| d.name().ok()).collect(),
            Err(_) => Vec::new(),
        }
    }
}
