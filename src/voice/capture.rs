//! Microphone level metering with cpal
//!
//! cpal streams are not `Send`, so each open meter owns a dedicated thread
//! that keeps the input stream alive until the meter is closed.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::mpsc;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::spectrum::{FFT_SIZE, SpectrumAnalyzer};
use super::vad::{LevelMeter, Microphone};
use crate::{Error, Result};

/// Samples kept for level analysis
pub const ANALYSIS_WINDOW: usize = FFT_SIZE;

type SampleWindow = Arc<Mutex<VecDeque<f32>>>;

/// The default input device
#[derive(Debug, Clone, Copy)]
pub struct CpalMicrophone {
    window: usize,
}

impl Default for CpalMicrophone {
    fn default() -> Self {
        Self {
            window: ANALYSIS_WINDOW,
        }
    }
}

impl CpalMicrophone {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different analysis window (in samples)
    #[must_use]
    pub fn with_window(window: usize) -> Self {
        Self {
            window: window.max(1),
        }
    }
}

#[async_trait]
impl Microphone for CpalMicrophone {
    async fn open(&self) -> Result<Box<dyn LevelMeter>> {
        let samples: SampleWindow = Arc::new(Mutex::new(VecDeque::with_capacity(self.window)));
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let buffer = Arc::clone(&samples);
        let window = self.window;
        std::thread::Builder::new()
            .name("lotus-microphone".to_string())
            .spawn(move || match open_stream(buffer, window) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    // Blocks until the meter is closed or dropped
                    let _ = stop_rx.recv();
                    drop(stream);
                    tracing::debug!("microphone stream closed");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })?;

        ready_rx
            .await
            .map_err(|_| Error::Audio("microphone thread exited".to_string()))??;

        Ok(Box::new(CpalLevelMeter {
            samples,
            analyzer: SpectrumAnalyzer::default(),
            stop: Some(stop_tx),
        }))
    }
}

fn open_stream(buffer: SampleWindow, window: usize) -> Result<Stream> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| Error::Audio("no input device available".to_string()))?;

    let supported = device
        .default_input_config()
        .map_err(|e| Error::Permission(e.to_string()))?;
    let format = supported.sample_format();
    let config: StreamConfig = supported.config();

    tracing::debug!(
        device = %device.name().unwrap_or_default(),
        sample_rate = config.sample_rate.0,
        channels = config.channels,
        ?format,
        "opening microphone"
    );

    let on_error = |err: cpal::StreamError| tracing::error!(error = %err, "microphone stream error");
    let stream = match format {
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                push_samples(&buffer, window, data.iter().copied());
            },
            on_error,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                push_samples(&buffer, window, data.iter().map(|s| f32::from(*s) / 32768.0));
            },
            on_error,
            None,
        ),
        other => {
            return Err(Error::Audio(format!("unsupported sample format: {other:?}")));
        }
    }
    .map_err(|e| Error::Permission(e.to_string()))?;

    stream.play().map_err(|e| Error::Permission(e.to_string()))?;
    Ok(stream)
}

fn push_samples(buffer: &SampleWindow, window: usize, samples: impl Iterator<Item = f32>) {
    let mut buf = buffer.lock();
    for sample in samples {
        if buf.len() == window {
            buf.pop_front();
        }
        buf.push_back(sample);
    }
}

/// Level meter over an open cpal input stream
pub struct CpalLevelMeter {
    samples: SampleWindow,
    analyzer: SpectrumAnalyzer,
    stop: Option<mpsc::Sender<()>>,
}

impl LevelMeter for CpalLevelMeter {
    fn level(&mut self) -> f32 {
        let mut buf = self.samples.lock();
        self.analyzer.level(buf.make_contiguous())
    }

    fn close(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.samples.lock().clear();
        self.analyzer.reset();
    }
}

impl Drop for CpalLevelMeter {
    fn drop(&mut self) {
        self.close();
    }
}
