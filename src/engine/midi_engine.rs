//! MIDI Engine
//!
//! Handles MIDI input from hardware controllers and virtual MIDI ports.
//! Uses midir for cross-platform MIDI access. Every message received is
//! handed to the [`MidiDispatcher`], which fans it out to the session's
//! listeners.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use midir::{Ignore, MidiInput, MidiInputConnection, MidiInputPort};
use parking_lot::Mutex;
use thiserror::Error;

use crate::dsp::midi::{MidiMessage, TimestampedMidiMessage};

use super::dispatcher::{MidiDispatcher, MidiSource};

/// Interval between hot-plug scans.
const SCAN_INTERVAL: Duration = Duration::from_secs(2);

/// Information about a MIDI input device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MidiDeviceInfo {
    /// Human-readable device name.
    pub name: String,
    /// Internal port index.
    pub index: usize,
}

/// Error type for MIDI operations.
#[derive(Debug, Error)]
pub enum MidiError {
    #[error("MIDI init error: {0}")]
    Init(String),
    #[error("MIDI connection error: {0}")]
    Connection(String),
    #[error("MIDI device not found: {0}")]
    DeviceNotFound(String),
}

/// Port list refreshed by the scan thread.
struct MidiState {
    ports: Vec<MidiInputPort>,
    port_names: Vec<String>,
}

fn scan_ports(midi_in: &MidiInput) -> MidiState {
    let ports: Vec<MidiInputPort> = midi_in.ports().into_iter().collect();
    let port_names = ports
        .iter()
        .map(|p| midi_in.port_name(p).unwrap_or_else(|_| "Unknown".to_string()))
        .collect();
    MidiState { ports, port_names }
}

/// Hands one raw message to the dispatcher.
///
/// System exclusive data is forwarded as a sysex fragment; anything else
/// that parses is forwarded as a message. Unparseable data is dropped.
pub(crate) fn dispatch_raw(
    dispatcher: &MidiDispatcher,
    source: &MidiSource,
    timestamp_us: u64,
    data: &[u8],
) {
    match data.first() {
        Some(0xF0) => dispatcher.dispatch_partial_sysex(source, data, 0, timestamp_us),
        Some(_) => {
            if let Some(message) = MidiMessage::from_bytes(data) {
                dispatcher.dispatch(source, &TimestampedMidiMessage::new(message, timestamp_us));
            }
        }
        None => {}
    }
}

/// MIDI engine for receiving MIDI input.
pub struct MidiEngine {
    client_name: String,
    dispatcher: Arc<MidiDispatcher>,
    /// Currently selected device (None = no device).
    selected_device: Option<MidiDeviceInfo>,
    connection: Option<MidiInputConnection<()>>,
    state: Arc<Mutex<MidiState>>,
    /// Flag to signal device scan thread to stop.
    scan_running: Arc<AtomicBool>,
    scan_thread: Option<thread::JoinHandle<()>>,
}

impl MidiEngine {
    /// Create a new MIDI engine feeding `dispatcher`.
    ///
    /// Starts a background thread that rescans ports for hot-plugged devices.
    pub fn new(client_name: &str, dispatcher: Arc<MidiDispatcher>) -> Result<Self, MidiError> {
        let midi_in = MidiInput::new(client_name).map_err(|e| MidiError::Init(e.to_string()))?;
        let state = Arc::new(Mutex::new(scan_ports(&midi_in)));

        let scan_running = Arc::new(AtomicBool::new(true));
        let scan_thread = {
            let state = Arc::clone(&state);
            let running = Arc::clone(&scan_running);
            let scanner_name = format!("{client_name} scanner");
            thread::Builder::new()
                .name("midi-scan".into())
                .spawn(move || {
                    while running.load(Ordering::Relaxed) {
                        thread::sleep(SCAN_INTERVAL);
                        if !running.load(Ordering::Relaxed) {
                            break;
                        }
                        if let Ok(midi_in) = MidiInput::new(&scanner_name) {
                            *state.lock() = scan_ports(&midi_in);
                        }
                    }
                })
                .map_err(|e| MidiError::Init(e.to_string()))?
        };

        Ok(Self {
            client_name: client_name.to_string(),
            dispatcher,
            selected_device: None,
            connection: None,
            state,
            scan_running,
            scan_thread: Some(scan_thread),
        })
    }

    /// Enumerate available MIDI input devices, including hot-plugged ones.
    pub fn enumerate_devices(&self) -> Vec<MidiDeviceInfo> {
        self.state
            .lock()
            .port_names
            .iter()
            .enumerate()
            .map(|(index, name)| MidiDeviceInfo {
                name: name.clone(),
                index,
            })
            .collect()
    }

    /// The device currently connected.
    pub fn selected_device(&self) -> Option<&MidiDeviceInfo> {
        self.selected_device.as_ref()
    }

    /// Connect to the first device whose name contains `pattern`, ignoring case.
    pub fn connect_by_name(&mut self, pattern: &str) -> Result<(), MidiError> {
        let wanted = pattern.to_lowercase();
        let index = self
            .enumerate_devices()
            .into_iter()
            .find(|device| device.name.to_lowercase().contains(&wanted))
            .map(|device| device.index)
            .ok_or_else(|| MidiError::DeviceNotFound(pattern.to_string()))?;
        self.connect(index)
    }

    /// Connect to a MIDI device by index, replacing any current connection.
    pub fn connect(&mut self, device_index: usize) -> Result<(), MidiError> {
        self.disconnect();

        let (port, name) = {
            let state = self.state.lock();
            let port = state
                .ports
                .get(device_index)
                .cloned()
                .ok_or_else(|| MidiError::DeviceNotFound(format!("index {device_index}")))?;
            (port, state.port_names[device_index].clone())
        };

        let mut midi_in =
            MidiInput::new(&self.client_name).map_err(|e| MidiError::Init(e.to_string()))?;
        // Timing clock and sysex are both needed downstream.
        midi_in.ignore(Ignore::None);

        let source = MidiSource::new(device_index, name.clone());
        let dispatcher = Arc::clone(&self.dispatcher);
        let connection = midi_in
            .connect(
                &port,
                &format!("{} input", self.client_name),
                move |timestamp_us, data, _| dispatch_raw(&dispatcher, &source, timestamp_us, data),
                (),
            )
            .map_err(|e| MidiError::Connection(e.to_string()))?;

        tracing::info!(device = %name, index = device_index, "MIDI connected");
        self.connection = Some(connection);
        self.selected_device = Some(MidiDeviceInfo {
            name,
            index: device_index,
        });
        Ok(())
    }

    /// Disconnect from the current MIDI device.
    pub fn disconnect(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close();
            if let Some(device) = self.selected_device.take() {
                tracing::info!(device = %device.name, "MIDI disconnected");
            }
        }
    }

    /// Check if currently connected to a device.
    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }
}

impl Drop for MidiEngine {
    fn drop(&mut self) {
        self.scan_running.store(false, Ordering::Relaxed);
        self.disconnect();
        if let Some(thread) = self.scan_thread.take() {
            let _ = thread.join();
        }
    }
}
