//! cpal-backed microphone and speaker streams
//!
//! `cpal::Stream` is `!Send`, so each stream lives on a dedicated thread
//! that builds it, reports readiness, and drops it when told to stop.

use std::collections::VecDeque;
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SampleFormat, SizedSample, Stream, StreamConfig};
use tokio::sync::{mpsc, oneshot};

use super::capture::{CaptureConstraints, CaptureHandle, CaptureStream, MicrophoneSource};
use super::pcm::{f32_to_i16, i16_to_f32, resample, to_mono};
use super::playback::{AudioOutput, OutputStream};
use super::AudioError;

/// Frames buffered between the device callback and the capture pump
const FRAME_QUEUE: usize = 64;

/// Upper bound on queued playback samples (~30 s at 48 kHz)
const MAX_QUEUED_SAMPLES: usize = 48_000 * 30;

/// Keeps a stream thread alive until stopped
struct StreamThread {
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl StreamThread {
    /// Spawn `build` on its own thread and wait for it to report a result
    fn spawn<T, F>(name: &str, build: F) -> Result<(Self, T), AudioError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<(Stream, T), AudioError> + Send + 'static,
    {
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<T, AudioError>>(1);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || match build() {
                Ok((stream, value)) => {
                    if let Err(e) = stream.play() {
                        let _ = ready_tx.send(Err(AudioError::StreamCreationFailed(format!(
                            "Failed to start stream: {}",
                            e
                        ))));
                        return;
                    }
                    let _ = ready_tx.send(Ok(value));
                    // Blocks until stop() or the handle is dropped
                    let _ = stop_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?;

        let value = ready_rx
            .recv()
            .map_err(|_| AudioError::StreamCreationFailed("stream thread exited".to_string()))??;

        Ok((
            Self {
                stop_tx: Some(stop_tx),
                thread: Some(thread),
            },
            value,
        ))
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        drop(self.stop_tx.take());
        if let Some(thread) = self.thread.take() {
            thread
                .join()
                .map_err(|_| AudioError::DeviceError("stream thread panicked".to_string()))?;
        }
        Ok(())
    }
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        drop(self.stop_tx.take());
    }
}

// ============================================================================
// Microphone
// ============================================================================

/// Captures from the host's default input device.
///
/// cpal exposes no echo cancellation, noise suppression or gain control,
/// so `CaptureConstraints` are not applied here. Whatever the OS input
/// chain does is what the session gets.
#[derive(Debug, Default)]
pub struct CpalMicrophone;

struct CpalCaptureHandle(StreamThread);

impl CaptureHandle for CpalCaptureHandle {
    fn stop(&mut self) -> Result<(), AudioError> {
        self.0.stop()?;
        log::info!("Microphone released");
        Ok(())
    }
}

impl MicrophoneSource for CpalMicrophone {
    fn open(&self, constraints: &CaptureConstraints) -> Result<CaptureStream, AudioError> {
        if constraints.echo_cancellation || constraints.noise_suppression {
            log::warn!(
                "Capture constraints {:?} not supported by cpal, using the host audio stack as is",
                constraints
            );
        }

        let (frame_tx, frame_rx) = mpsc::channel::<Vec<i16>>(FRAME_QUEUE);
        let (ended_tx, ended_rx) = oneshot::channel::<String>();

        let (thread, sample_rate) = StreamThread::spawn("mic-capture", move || {
            build_input(frame_tx, ended_tx)
        })?;

        Ok(CaptureStream {
            frames: frame_rx,
            sample_rate,
            ended: ended_rx,
            handle: Box::new(CpalCaptureHandle(thread)),
        })
    }
}

fn build_input(
    frame_tx: mpsc::Sender<Vec<i16>>,
    ended_tx: oneshot::Sender<String>,
) -> Result<(Stream, u32), AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(AudioError::NoInputDevice)?;

    log::info!("Using audio input device: {:?}", device.name());

    let supported = device
        .default_input_config()
        .map_err(|_| AudioError::NoSupportedConfig)?;

    log::info!(
        "Input config: {} Hz, {} channels, {:?}",
        supported.sample_rate().0,
        supported.channels(),
        supported.sample_format()
    );

    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.into();
    let sample_rate = config.sample_rate.0;

    let ended_tx = Arc::new(Mutex::new(Some(ended_tx)));
    let err_fn = move |err: cpal::StreamError| match err {
        cpal::StreamError::DeviceNotAvailable => {
            log::error!("Input device disconnected");
            if let Some(tx) = ended_tx.lock().ok().and_then(|mut g| g.take()) {
                let _ = tx.send("input device disconnected".to_string());
            }
        }
        other => log::warn!("Audio input stream error: {}", other),
    };

    let stream = match sample_format {
        SampleFormat::I16 => build_input_typed::<i16>(&device, &config, frame_tx, err_fn),
        SampleFormat::U16 => build_input_typed::<u16>(&device, &config, frame_tx, err_fn),
        SampleFormat::F32 => build_input_typed::<f32>(&device, &config, frame_tx, err_fn),
        _ => Err(AudioError::NoSupportedConfig),
    }?;

    Ok((stream, sample_rate))
}

fn build_input_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    frame_tx: mpsc::Sender<Vec<i16>>,
    err_fn: impl FnMut(cpal::StreamError) + Send + 'static,
) -> Result<Stream, AudioError>
where
    T: SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let channels = config.channels;

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let interleaved: Vec<i16> = data
                    .iter()
                    .map(|&s| f32_to_i16(f32::from_sample_(s)))
                    .collect();
                // Never block the audio thread; a full queue drops the frame
                let _ = frame_tx.try_send(to_mono(&interleaved, channels));
            },
            err_fn,
            None,
        )
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => AudioError::NoInputDevice,
            other => AudioError::StreamCreationFailed(other.to_string()),
        })
}

// ============================================================================
// Speaker
// ============================================================================

/// Plays to the host's default output device
#[derive(Debug, Default)]
pub struct CpalOutput;

struct CpalOutputStream {
    thread: StreamThread,
    queue: Arc<Mutex<VecDeque<f32>>>,
    source_rate: u32,
    device_rate: u32,
    channels: u16,
}

impl AudioOutput for CpalOutput {
    fn open(&self, sample_rate: u32) -> Result<Box<dyn OutputStream>, AudioError> {
        let queue = Arc::new(Mutex::new(VecDeque::<f32>::new()));
        let shared = queue.clone();

        let (thread, (device_rate, channels)) =
            StreamThread::spawn("speaker-output", move || build_output(shared))?;

        Ok(Box::new(CpalOutputStream {
            thread,
            queue,
            source_rate: sample_rate,
            device_rate,
            channels,
        }))
    }
}

impl OutputStream for CpalOutputStream {
    fn write(&mut self, samples: &[i16]) -> Result<(), AudioError> {
        let resampled = resample(samples, self.source_rate, self.device_rate);
        let mut queue = self
            .queue
            .lock()
            .map_err(|_| AudioError::DeviceError("playback queue poisoned".to_string()))?;

        for &sample in &resampled {
            let value = i16_to_f32(sample);
            for _ in 0..self.channels {
                queue.push_back(value);
            }
        }

        let overflow = queue.len().saturating_sub(MAX_QUEUED_SAMPLES);
        if overflow > 0 {
            log::warn!("Playback queue overflow, dropping {} samples", overflow);
            queue.drain(..overflow);
        }
        Ok(())
    }

    fn clear(&mut self) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.clear();
        }
    }

    fn close(&mut self) -> Result<(), AudioError> {
        self.clear();
        self.thread.stop()?;
        log::info!("Speaker released");
        Ok(())
    }
}

fn build_output(queue: Arc<Mutex<VecDeque<f32>>>) -> Result<(Stream, (u32, u16)), AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(AudioError::NoOutputDevice)?;

    log::info!("Using audio output device: {:?}", device.name());

    let supported = device
        .default_output_config()
        .map_err(|_| AudioError::NoSupportedConfig)?;
    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.into();

    let err_fn = |err: cpal::StreamError| log::warn!("Audio output stream error: {}", err);

    let stream = match sample_format {
        SampleFormat::I16 => build_output_typed::<i16>(&device, &config, queue, err_fn),
        SampleFormat::U16 => build_output_typed::<u16>(&device, &config, queue, err_fn),
        SampleFormat::F32 => build_output_typed::<f32>(&device, &config, queue, err_fn),
        _ => Err(AudioError::NoSupportedConfig),
    }?;

    Ok((stream, (config.sample_rate.0, config.channels)))
}

fn build_output_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    queue: Arc<Mutex<VecDeque<f32>>>,
    err_fn: impl FnMut(cpal::StreamError) + Send + 'static,
) -> Result<Stream, AudioError>
where
    T: SizedSample + FromSample<f32> + Send + 'static,
{
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let mut queue = queue.lock().ok();
                for slot in data.iter_mut() {
                    let value = queue
                        .as_mut()
                        .and_then(|q| q.pop_front())
                        .unwrap_or(0.0);
                    *slot = T::from_sample_(value);
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))
}
