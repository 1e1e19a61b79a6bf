//! Capture pipeline: microphone -> frame FIFO -> chunked upload.
//!
//! The Sampler is a dedicated thread reading fixed-size PCM frames while the
//! gate is open. The Uploader is a tokio task owning the upload stream.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};

use super::fifo::Fifo;
use super::gate::WorkerGate;
use crate::audio::{Microphone, WavHeader, WAV_HEADER_LEN};
use crate::net_link::{UploadSink, UploadStream};

/// Longest single microphone read before the Sampler re-checks its gate.
const SAMPLE_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Bytes of PCM per frame.
    pub frame_size: usize,
    /// FIFO capacity in frames.
    pub queue_size: usize,
    /// Queued frames above which the Uploader sheds the whole FIFO.
    pub backlog_threshold: usize,
    /// Longest wait for a frame before re-checking state.
    pub frame_timeout: Duration,
    pub sample_rate: u32,
    /// Frames announced in the WAV header's data size.
    pub wav_nominal_frames: u32,
    pub capture_device: String,
    pub idle_poll: Duration,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            frame_size: 1024,
            queue_size: 200,
            backlog_threshold: 6,
            frame_timeout: Duration::from_millis(500),
            sample_rate: 16000,
            wav_nominal_frames: 50,
            capture_device: "default".to_string(),
            idle_poll: Duration::from_millis(100),
        }
    }
}

impl RecorderConfig {
    pub fn wav_header(&self) -> WavHeader {
        let data_size = self.wav_nominal_frames.saturating_mul(self.frame_size as u32);
        WavHeader::pcm_mono16(self.sample_rate, data_size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Starting,
    Active,
    Halt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureEvent {
    /// Remote switched the recorder on.
    Start,
    /// Remote switched it off, upload failed or media is shutting down.
    Stop,
    /// Upload opened and header sent; Sampler may run.
    Armed,
    /// Upload finished after HALT.
    Closed,
}

pub fn transition(state: CaptureState, event: CaptureEvent) -> CaptureState {
    use CaptureEvent as E;
    use CaptureState as S;

    match (state, event) {
        (S::Idle, E::Start) => S::Starting,
        (S::Idle | S::Halt, E::Stop) => state,
        (_, E::Stop) => S::Halt,
        (S::Starting, E::Armed) => S::Active,
        (S::Halt, E::Closed) => S::Idle,
        _ => state,
    }
}

pub struct CaptureInner {
    state: CaptureState,
    halts: u64,
    gate: Arc<WorkerGate>,
}

impl CaptureInner {
    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn halts(&self) -> u64 {
        self.halts
    }

    pub fn apply(&mut self, event: CaptureEvent) -> CaptureState {
        let prev = self.state;
        let next = transition(prev, event);
        if next != prev {
            log::debug!("recorder: {:?} -> {:?} ({:?})", prev, next, event);
            if next == CaptureState::Halt {
                self.halts += 1;
            }
            self.state = next;
        }
        self.gate.set(next == CaptureState::Active);
        next
    }
}

/// The single capture session of the device.
pub struct CaptureSession {
    inner: Mutex<CaptureInner>,
    fifo: Fifo,
    gate: Arc<WorkerGate>,
    header: [u8; WAV_HEADER_LEN],
    uploads: AtomicU64,
    shed: AtomicU64,
}

impl CaptureSession {
    /// Allocates the frame FIFO and computes the WAV header. Startup only.
    pub fn new(config: &RecorderConfig) -> Self {
        let gate = Arc::new(WorkerGate::new());
        Self {
            inner: Mutex::new(CaptureInner {
                state: CaptureState::Idle,
                halts: 0,
                gate: gate.clone(),
            }),
            fifo: Fifo::new(config.queue_size, config.frame_size),
            gate,
            header: config.wav_header().to_bytes(),
            uploads: AtomicU64::new(0),
            shed: AtomicU64::new(0),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, CaptureInner> {
        self.inner.lock().await
    }

    pub async fn state(&self) -> CaptureState {
        self.lock().await.state()
    }

    pub fn header(&self) -> &[u8] {
        &self.header
    }

    /// Upload sessions opened so far.
    pub fn uploads(&self) -> u64 {
        self.uploads.load(Ordering::Relaxed)
    }

    /// Frames discarded by backlog shedding.
    pub fn shed_frames(&self) -> u64 {
        self.shed.load(Ordering::Relaxed)
    }

    pub fn is_sampling(&self) -> bool {
        self.gate.is_open()
    }

    pub fn shutdown(&self) {
        self.gate.shutdown();
    }

    fn is_shutdown(&self) -> bool {
        self.gate.is_shutdown()
    }

    /// Hands `frame` back if it is fresh, otherwise drops it together with
    /// everything queued behind it.
    fn take_fresh(&self, frame: Vec<u8>, threshold: usize) -> Option<Vec<u8>> {
        let queued = self.fifo.len();
        if queued <= threshold {
            return Some(frame);
        }
        self.fifo.recycle(frame);
        let dropped = self.fifo.reset() + 1;
        self.shed.fetch_add(dropped as u64, Ordering::Relaxed);
        log::warn!("Upload backlog of {} frames, dropped {}", queued, dropped);
        None
    }
}

pub struct RecorderHandle {
    session: Arc<CaptureSession>,
    uploader: tokio::task::JoinHandle<()>,
    sampler: Option<JoinHandle<()>>,
}

impl RecorderHandle {
    pub async fn shutdown(mut self) {
        self.session.shutdown();
        if let Err(e) = (&mut self.uploader).await {
            log::error!("Uploader task failed: {}", e);
        }
        if let Some(sampler) = self.sampler.take() {
            let joined = tokio::task::spawn_blocking(move || sampler.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                log::error!("Sampler thread panicked");
            }
        }
    }
}

/// Network side of the capture pipeline.
pub struct Recorder {
    session: Arc<CaptureSession>,
    sink: Arc<dyn UploadSink>,
    config: RecorderConfig,
}

impl Recorder {
    pub fn spawn(
        session: Arc<CaptureSession>,
        mic: Box<dyn Microphone>,
        sink: Arc<dyn UploadSink>,
        config: RecorderConfig,
    ) -> anyhow::Result<RecorderHandle> {
        let sampler = {
            let session = session.clone();
            let frame_size = config.frame_size;
            thread::Builder::new()
                .name("media-sampler".into())
                .spawn(move || sample(&session, mic, frame_size))?
        };

        let recorder = Recorder {
            session: session.clone(),
            sink,
            config,
        };
        let uploader = tokio::spawn(recorder.run());

        Ok(RecorderHandle {
            session,
            uploader,
            sampler: Some(sampler),
        })
    }

    async fn run(self) {
        log::info!(
            "Recorder started: frame={} B, {} Hz, backlog limit={}",
            self.config.frame_size,
            self.config.sample_rate,
            self.config.backlog_threshold
        );
        while !self.session.is_shutdown() {
            match self.session.state().await {
                CaptureState::Starting => self.upload().await,
                CaptureState::Halt => {
                    self.session.lock().await.apply(CaptureEvent::Closed);
                }
                _ => tokio::time::sleep(self.config.idle_poll).await,
            }
        }
        log::info!("Recorder stopped");
    }

    async fn upload(&self) {
        let session = &self.session;
        session.fifo.reset();

        log::info!("Opening upload stream");
        let mut stream = match self.sink.open().await {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!("Failed to open upload: {}", e);
                let mut inner = session.lock().await;
                inner.apply(CaptureEvent::Stop);
                inner.apply(CaptureEvent::Closed);
                return;
            }
        };
        session.uploads.fetch_add(1, Ordering::Relaxed);

        match stream.write_chunk(&session.header).await {
            Ok(()) => {
                session.fifo.reset();
                session.lock().await.apply(CaptureEvent::Armed);
                self.stream_frames(stream.as_mut()).await;
            }
            Err(e) => {
                log::warn!("Failed to send WAV header: {}", e);
                session.lock().await.apply(CaptureEvent::Stop);
            }
        }

        match stream.finish().await {
            Ok(status) => log::info!("Upload closed, HTTP {}", status),
            Err(e) => log::warn!("Upload close failed: {}", e),
        }
        session.lock().await.apply(CaptureEvent::Closed);
    }

    async fn stream_frames(&self, stream: &mut dyn UploadStream) {
        let session = &self.session;
        let mut sent = 0u64;

        while !session.is_shutdown() && session.state().await == CaptureState::Active {
            let fifo = session.fifo.clone();
            let timeout = self.config.frame_timeout;
            let frame = match tokio::task::spawn_blocking(move || fifo.pop_timeout(timeout)).await
            {
                Ok(Some(frame)) => frame,
                Ok(None) => continue,
                Err(e) => {
                    log::error!("Frame wait failed: {}", e);
                    break;
                }
            };

            let Some(frame) = session.take_fresh(frame, self.config.backlog_threshold) else {
                continue;
            };
            let written = stream.write_chunk(&frame).await;
            session.fifo.recycle(frame);
            if let Err(e) = written {
                log::warn!("Upload write failed: {}", e);
                session.lock().await.apply(CaptureEvent::Stop);
                break;
            }
            sent += 1;
        }
        log::debug!("Uploaded {} frames", sent);
    }
}

/// Sampler thread body.
fn sample(session: &CaptureSession, mut mic: Box<dyn Microphone>, frame_size: usize) {
    let fifo = &session.fifo;
    let gate = &session.gate;
    gate.attach();

    let mut scratch = vec![0u8; frame_size];
    let mut filled = 0;
    let mut upload_seen = session.uploads();
    let mut dropped = 0u64;

    while gate.wait() {
        let upload = session.uploads();
        if upload != upload_seen {
            upload_seen = upload;
            filled = 0;
        }

        match mic.take_samples(&mut scratch[filled..], SAMPLE_TIMEOUT) {
            Ok(n) => filled += n,
            Err(e) => {
                log::warn!("{}", e);
                thread::sleep(SAMPLE_TIMEOUT);
                continue;
            }
        }
        if filled < frame_size {
            continue;
        }
        filled = 0;

        let Some(mut frame) = fifo.try_acquire() else {
            dropped += 1;
            log::debug!("Frame FIFO full, {} frames dropped", dropped);
            continue;
        };
        frame.extend_from_slice(&scratch);
        if let Err(frame) = fifo.push(frame) {
            fifo.recycle(frame);
            dropped += 1;
            log::debug!("Frame FIFO full, {} frames dropped", dropped);
        }
    }
}
