//! Audio Engine
//!
//! Manages the cpal output stream. The audio callback runs on a separate
//! thread and owns the [`AudioProcessor`]; it must stay real-time safe.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Host, SampleRate, Stream, StreamConfig};
use thiserror::Error;

use super::audio_processor::AudioProcessor;

/// Errors that can occur during audio engine operation.
#[derive(Debug, Clone, Error)]
pub enum AudioError {
    #[error("No audio output device found")]
    NoOutputDevice,
    #[error("Failed to get device configuration: {0}")]
    ConfigurationFailed(String),
    #[error("Failed to create audio stream: {0}")]
    StreamCreationFailed(String),
    #[error("Failed to control audio playback: {0}")]
    StreamPlaybackFailed(String),
}

/// Information about an audio output device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Human-readable device name.
    pub name: String,
    /// Whether this is the default output device.
    pub is_default: bool,
    /// Index in the device list (for selection).
    pub index: usize,
}

/// Lists the output devices of the default host.
pub fn list_output_devices() -> Vec<DeviceInfo> {
    let host = cpal::default_host();
    let default_name = host.default_output_device().and_then(|d| d.name().ok());

    host.output_devices()
        .map(|devices| {
            devices
                .enumerate()
                .filter_map(|(index, device)| {
                    device.name().ok().map(|name| DeviceInfo {
                        is_default: Some(&name) == default_name.as_ref(),
                        name,
                        index,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn stream_config(device: &Device) -> Result<StreamConfig, AudioError> {
    let supported = device
        .default_output_config()
        .map_err(|e| AudioError::ConfigurationFailed(e.to_string()))?;
    Ok(StreamConfig {
        channels: supported.channels(),
        sample_rate: SampleRate(supported.sample_rate().0),
        buffer_size: cpal::BufferSize::Default,
    })
}

/// The output stream driving the graph.
pub struct AudioEngine {
    host: Host,
    device: Device,
    config: StreamConfig,
    stream: Option<Stream>,
}

impl AudioEngine {
    /// Create a new AudioEngine using the default output device.
    pub fn new() -> Result<Self, AudioError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or(AudioError::NoOutputDevice)?;
        let config = stream_config(&device)?;

        Ok(Self {
            host,
            device,
            config,
            stream: None,
        })
    }

    /// Get information about all available output devices.
    pub fn enumerate_devices(&self) -> Vec<DeviceInfo> {
        list_output_devices()
    }

    /// Get the name of the currently selected device.
    pub fn current_device_name(&self) -> String {
        self.device.name().unwrap_or_else(|_| "Unknown".to_string())
    }

    /// Select a different output device by index.
    ///
    /// Fails if a stream is running; stop it first.
    pub fn select_device(&mut self, index: usize) -> Result<(), AudioError> {
        if self.is_running() {
            return Err(AudioError::StreamPlaybackFailed(
                "cannot switch devices while running".to_string(),
            ));
        }

        let device = self
            .host
            .output_devices()
            .map_err(|e| AudioError::ConfigurationFailed(e.to_string()))?
            .nth(index)
            .ok_or(AudioError::NoOutputDevice)?;

        self.config = stream_config(&device)?;
        self.device = device;
        tracing::info!(device = %self.current_device_name(), "audio device selected");
        Ok(())
    }

    /// Get the current stream configuration.
    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Get the sample rate in Hz.
    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    /// Get the number of output channels.
    pub fn channels(&self) -> u16 {
        self.config.channels
    }

    /// Start the output stream, moving `processor` into the audio callback.
    pub fn start(&mut self, mut processor: AudioProcessor) -> Result<(), AudioError> {
        if self.stream.is_some() {
            return Ok(());
        }

        let channels = self.config.channels as usize;
        let stream = self
            .device
            .build_output_stream(
                &self.config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    processor.process(data, channels);
                },
                move |err| {
                    tracing::error!(error = %err, "audio stream error");
                },
                None,
            )
            .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?;

        stream
            .play()
            .map_err(|e| AudioError::StreamPlaybackFailed(e.to_string()))?;

        tracing::info!(
            device = %self.current_device_name(),
            sample_rate = self.sample_rate(),
            channels,
            "audio stream started"
        );
        self.stream = Some(stream);
        Ok(())
    }

    /// Stop the output stream. The processor is dropped with it.
    pub fn stop(&mut self) -> Result<(), AudioError> {
        if let Some(stream) = self.stream.take() {
            stream
                .pause()
                .map_err(|e| AudioError::StreamPlaybackFailed(e.to_string()))?;
            tracing::info!("audio stream stopped");
        }
        Ok(())
    }

    /// Check if the audio stream is currently running.
    pub fn is_running(&self) -> bool {
        self.stream.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_error_display() {
        let err = AudioError::NoOutputDevice;
        assert_eq!(err.to_string(), "No audio output device found");

        let err = AudioError::StreamCreationFailed("test error".to_string());
        assert!(err.to_string().contains("test error"));
    }

    #[test]
    fn test_processor_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<AudioProcessor>();
    }
}
