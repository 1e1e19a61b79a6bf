//! Playback pipeline: network track -> chunk FIFO -> decoder.
//!
//! The Fetcher is a tokio task that opens the track, fills the FIFO and
//! drives the state machine. The Feeder is a dedicated thread that drains the
//! FIFO into the decoder while the gate is open (ACTIVE or STOP_AT_END).

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};

use super::fifo::Fifo;
use super::gate::WorkerGate;
use crate::audio::Vs1053b;
use crate::error::NetError;
use crate::net_link::{TrackSource, TrackStream};
use crate::track_id::TrackId;

/// How long the Feeder waits on an empty FIFO before re-checking state.
const FEED_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub struct PlayerConfig {
    /// Bytes per FIFO chunk and per network read.
    pub chunk_size: usize,
    /// FIFO capacity in chunks.
    pub queue_size: usize,
    /// Zero-length reads tolerated on a chunked body before calling it ended.
    pub empty_read_retries: u32,
    pub idle_poll: Duration,
    /// Back-off while paused or while the FIFO is full.
    pub pause_poll: Duration,
    /// Longest wait for a single body read before the track is abandoned.
    pub read_timeout: Duration,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            queue_size: 100,
            empty_read_retries: 10,
            idle_poll: Duration::from_millis(100),
            pause_poll: Duration::from_millis(100),
            read_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Starting,
    Buffering,
    Active,
    Pause,
    StopAtEnd,
    Halt,
}

impl PlaybackState {
    /// Whether the Feeder may drain the FIFO.
    pub fn is_feeding(self) -> bool {
        matches!(self, Self::Active | Self::StopAtEnd)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// Remote asked for the pending track.
    Start,
    /// Remote lifted a pause.
    Resume,
    Pause,
    /// Track changed, network failed or media is being shut down.
    Abort,
    /// The source answered 200.
    Opened,
    /// The source answered anything else.
    Rejected { not_acceptable: bool },
    /// The source could not be reached at all.
    OpenFailed,
    /// FIFO occupancy after a fill or drain step.
    Progress {
        queued: usize,
        capacity: usize,
        eos: bool,
    },
    /// FIFO ran empty after end of stream.
    Drained,
    /// Network side released after HALT.
    Closed,
}

/// Next playback state. Events that do not apply leave the state unchanged.
pub fn transition(state: PlaybackState, event: PlaybackEvent) -> PlaybackState {
    use PlaybackEvent as E;
    use PlaybackState as S;

    match (state, event) {
        (S::Idle, E::Start) => S::Starting,
        (S::Pause, E::Resume) => S::Active,
        (S::Buffering | S::Active | S::StopAtEnd, E::Pause) => S::Pause,
        (S::Idle | S::Halt, E::Abort) => state,
        (_, E::Abort) => S::Halt,

        (S::Starting, E::Opened) => S::Buffering,
        (S::Starting, E::Rejected { .. }) => S::Halt,
        (S::Starting, E::OpenFailed) => S::Idle,

        (S::Buffering | S::Active, E::Progress { eos: true, .. }) => S::StopAtEnd,
        (S::Buffering, E::Progress { queued, capacity, .. }) if queued * 2 >= capacity => {
            S::Active
        }
        (S::Active, E::Progress { queued, capacity, .. }) if queued * 2 < capacity => {
            S::Buffering
        }

        (S::StopAtEnd, E::Drained) => S::Halt,
        (S::Halt, E::Closed) => S::Idle,
        _ => state,
    }
}

/// Playback fields guarded by the session lock.
pub struct PlaybackInner {
    state: PlaybackState,
    /// Track the remote currently wants played.
    pub track: TrackId,
    /// Remote-reported number of queued tracks.
    pub track_count: u32,
    pub volume: f32,
    pub muted: bool,
    report_end: bool,
    halts: u64,
    gate: Arc<WorkerGate>,
}

impl PlaybackInner {
    pub fn state(&self) -> PlaybackState {
        self.state
    }

    /// Times the session has entered HALT.
    pub fn halts(&self) -> u64 {
        self.halts
    }

    /// Runs `event` through the state machine and updates the Feeder gate.
    pub fn apply(&mut self, event: PlaybackEvent) -> PlaybackState {
        let prev = self.state;
        let next = transition(prev, event);
        if next != prev {
            log::debug!("player: {:?} -> {:?} ({:?})", prev, next, event);
            match (next, event) {
                (PlaybackState::Halt, PlaybackEvent::Rejected { not_acceptable }) => {
                    self.report_end = not_acceptable;
                }
                (PlaybackState::Halt, PlaybackEvent::Drained) => self.report_end = true,
                (PlaybackState::Idle, _) => self.report_end = false,
                _ => {}
            }
            if next == PlaybackState::Halt {
                self.halts += 1;
            }
            self.state = next;
        }
        self.gate.set(next.is_feeding());
        next
    }
}

/// The single playback session of the device.
pub struct PlaybackSession {
    inner: Mutex<PlaybackInner>,
    fifo: Fifo,
    gate: Arc<WorkerGate>,
}

impl PlaybackSession {
    /// Allocates the chunk FIFO. Startup only.
    pub fn new(config: &PlayerConfig) -> Self {
        let gate = Arc::new(WorkerGate::new());
        Self {
            inner: Mutex::new(PlaybackInner {
                state: PlaybackState::Idle,
                track: TrackId::nil(),
                track_count: 0,
                volume: 100.0,
                muted: false,
                report_end: false,
                halts: 0,
                gate: gate.clone(),
            }),
            fifo: Fifo::new(config.queue_size, config.chunk_size),
            gate,
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, PlaybackInner> {
        self.inner.lock().await
    }

    fn lock_blocking(&self) -> MutexGuard<'_, PlaybackInner> {
        self.inner.blocking_lock()
    }

    pub async fn state(&self) -> PlaybackState {
        self.lock().await.state()
    }

    /// Whether the Feeder is currently allowed to run.
    pub fn is_feeding(&self) -> bool {
        self.gate.is_open()
    }

    /// Stops both workers for good.
    pub fn shutdown(&self) {
        self.gate.shutdown();
    }

    fn is_shutdown(&self) -> bool {
        self.gate.is_shutdown()
    }
}

/// Running playback workers.
pub struct PlayerHandle {
    session: Arc<PlaybackSession>,
    fetcher: tokio::task::JoinHandle<()>,
    feeder: Option<JoinHandle<()>>,
}

impl PlayerHandle {
    pub async fn shutdown(mut self) {
        self.session.shutdown();
        if let Err(e) = (&mut self.fetcher).await {
            log::error!("Fetcher task failed: {}", e);
        }
        if let Some(feeder) = self.feeder.take() {
            let joined = tokio::task::spawn_blocking(move || feeder.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                log::error!("Feeder thread panicked");
            }
        }
    }
}

/// Network side of the playback pipeline.
pub struct Player {
    session: Arc<PlaybackSession>,
    source: Arc<dyn TrackSource>,
    config: PlayerConfig,
}

impl Player {
    /// Starts the Feeder thread and the Fetcher task. Must run inside a
    /// tokio runtime.
    pub fn spawn(
        session: Arc<PlaybackSession>,
        codec: Arc<Vs1053b>,
        source: Arc<dyn TrackSource>,
        config: PlayerConfig,
    ) -> anyhow::Result<PlayerHandle> {
        let feeder = {
            let session = session.clone();
            thread::Builder::new()
                .name("media-feeder".into())
                .spawn(move || feed(&session, &codec))?
        };

        let player = Player {
            session: session.clone(),
            source,
            config,
        };
        let fetcher = tokio::spawn(player.run());

        Ok(PlayerHandle {
            session,
            fetcher,
            feeder: Some(feeder),
        })
    }

    async fn run(self) {
        log::info!(
            "Player started: chunk={} B, queue={} chunks",
            self.config.chunk_size,
            self.config.queue_size
        );
        while !self.session.is_shutdown() {
            match self.session.state().await {
                PlaybackState::Starting => self.play_track().await,
                PlaybackState::Halt => self.close(None).await,
                _ => tokio::time::sleep(self.config.idle_poll).await,
            }
        }
        log::info!("Player stopped");
    }

    async fn play_track(&self) {
        let track = {
            let inner = self.session.lock().await;
            self.session.fifo.reset();
            inner.track
        };
        log::info!("Opening track {}", track);

        let response = match self.source.open(track).await {
            Ok(response) => response,
            Err(e) => {
                log::warn!("Failed to open track {}: {}", track, e);
                self.session.lock().await.apply(PlaybackEvent::OpenFailed);
                return;
            }
        };

        if response.status != 200 {
            log::warn!("Track {} refused with HTTP {}", track, response.status);
            self.session.lock().await.apply(PlaybackEvent::Rejected {
                not_acceptable: response.status == 406,
            });
        } else {
            match response.length {
                Some(len) => log::info!("Track {}: {} bytes", track, len),
                None => log::info!("Track {}: chunked", track),
            }
            self.session.lock().await.apply(PlaybackEvent::Opened);
            self.fill(response.body, response.length).await;
        }

        if self.session.state().await == PlaybackState::Halt {
            self.close(Some(track)).await;
        }
    }

    /// Moves body bytes into the FIFO until the session leaves the
    /// streaming states.
    async fn fill(&self, mut body: Box<dyn TrackStream>, length: Option<u64>) {
        let fifo = &self.session.fifo;
        let mut remaining = length;
        let mut eos = remaining == Some(0);
        let mut empty_reads = 0u32;
        let mut pending: Option<Vec<u8>> = None;

        while !self.session.is_shutdown() {
            let state = self.session.lock().await.apply(PlaybackEvent::Progress {
                queued: fifo.len(),
                capacity: fifo.capacity(),
                eos: eos && pending.is_none(),
            });
            match state {
                PlaybackState::Buffering | PlaybackState::Active | PlaybackState::Pause => {}
                PlaybackState::StopAtEnd => {
                    tokio::time::sleep(self.config.idle_poll).await;
                    continue;
                }
                PlaybackState::Idle | PlaybackState::Starting | PlaybackState::Halt => break,
            }

            if let Some(chunk) = pending.take() {
                if let Err(chunk) = fifo.push(chunk) {
                    pending = Some(chunk);
                    tokio::time::sleep(self.config.pause_poll).await;
                }
                continue;
            }
            if eos {
                tokio::time::sleep(self.config.pause_poll).await;
                continue;
            }
            let Some(mut buf) = fifo.try_acquire() else {
                tokio::time::sleep(self.config.pause_poll).await;
                continue;
            };

            let want = match remaining {
                Some(r) => r.min(self.config.chunk_size as u64) as usize,
                None => self.config.chunk_size,
            };
            buf.resize(want, 0);

            let read = tokio::time::timeout(self.config.read_timeout, body.read(&mut buf))
                .await
                .unwrap_or(Err(NetError::Timeout(self.config.read_timeout)));
            match read {
                Ok(0) => {
                    fifo.recycle(buf);
                    if remaining.is_some() {
                        eos = true;
                    } else {
                        empty_reads += 1;
                        eos = empty_reads >= self.config.empty_read_retries;
                    }
                    if eos {
                        log::debug!("End of stream");
                    }
                }
                Ok(n) => {
                    empty_reads = 0;
                    buf.truncate(n);
                    if let Some(r) = remaining.as_mut() {
                        *r = r.saturating_sub(n as u64);
                        eos = *r == 0;
                    }
                    pending = Some(buf);
                }
                Err(e) => {
                    log::error!("Track read failed: {}", e);
                    fifo.recycle(buf);
                    self.session.lock().await.apply(PlaybackEvent::Abort);
                    break;
                }
            }
        }

        if let Some(chunk) = pending {
            fifo.recycle(chunk);
        }
    }

    async fn close(&self, track: Option<TrackId>) {
        let report_end = self.session.lock().await.report_end;
        if let (true, Some(track)) = (report_end, track) {
            if let Err(e) = self.source.finish_track(track).await {
                log::warn!("Failed to release track {}: {}", track, e);
            }
        }
        self.session.lock().await.apply(PlaybackEvent::Closed);
        log::info!("Player halted");
    }
}

/// Feeder thread body.
fn feed(session: &PlaybackSession, codec: &Vs1053b) {
    let fifo = &session.fifo;
    let gate = &session.gate;
    gate.attach();

    while gate.wait() {
        let Some(chunk) = fifo.pop_timeout(FEED_POLL) else {
            let mut inner = session.lock_blocking();
            if inner.state() == PlaybackState::StopAtEnd && fifo.is_empty() {
                inner.apply(PlaybackEvent::Drained);
            }
            continue;
        };

        let sent = codec.send_audio_chunk(&chunk);
        fifo.recycle(chunk);
        if let Err(e) = sent {
            log::error!("Decoder rejected audio: {}", e);
            session.lock_blocking().apply(PlaybackEvent::Abort);
            continue;
        }

        let queued = fifo.len();
        if queued * 2 < fifo.capacity() {
            session.lock_blocking().apply(PlaybackEvent::Progress {
                queued,
                capacity: fifo.capacity(),
                eos: false,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use PlaybackEvent as E;
    use PlaybackState as S;

    fn progress(queued: usize, eos: bool) -> PlaybackEvent {
        E::Progress {
            queued,
            capacity: 100,
            eos,
        }
    }

    #[test]
    fn test_start_only_from_idle() {
        assert_eq!(transition(S::Idle, E::Start), S::Starting);
        for s in [S::Buffering, S::Active, S::Pause, S::StopAtEnd, S::Halt] {
            assert_eq!(transition(s, E::Start), s);
        }
    }

    #[test]
    fn test_open_outcomes() {
        assert_eq!(transition(S::Starting, E::Opened), S::Buffering);
        assert_eq!(
            transition(S::Starting, E::Rejected { not_acceptable: true }),
            S::Halt
        );
        assert_eq!(transition(S::Starting, E::OpenFailed), S::Idle);
        assert_eq!(transition(S::Halt, E::Opened), S::Halt);
    }

    #[test]
    fn test_buffering_waits_for_half_capacity() {
        assert_eq!(transition(S::Buffering, progress(49, false)), S::Buffering);
        assert_eq!(transition(S::Buffering, progress(50, false)), S::Active);
        assert_eq!(transition(S::Buffering, progress(3, true)), S::StopAtEnd);
    }

    #[test]
    fn test_underrun_returns_to_buffering() {
        assert_eq!(transition(S::Active, progress(50, false)), S::Active);
        assert_eq!(transition(S::Active, progress(49, false)), S::Buffering);
        assert_eq!(transition(S::Active, progress(0, true)), S::StopAtEnd);
    }

    #[test]
    fn test_pause_and_resume() {
        for s in [S::Buffering, S::Active, S::StopAtEnd] {
            assert_eq!(transition(s, E::Pause), S::Pause);
        }
        assert_eq!(transition(S::Pause, progress(100, true)), S::Pause);
        assert_eq!(transition(S::Pause, E::Resume), S::Active);
        assert_eq!(transition(S::Active, E::Resume), S::Active);
    }

    #[test]
    fn test_abort_from_any_running_state() {
        for s in [S::Starting, S::Buffering, S::Active, S::Pause, S::StopAtEnd] {
            assert_eq!(transition(s, E::Abort), S::Halt);
        }
        assert_eq!(transition(S::Idle, E::Abort), S::Idle);
        assert_eq!(transition(S::Halt, E::Abort), S::Halt);
    }

    #[test]
    fn test_end_of_track() {
        assert_eq!(transition(S::StopAtEnd, progress(10, false)), S::StopAtEnd);
        assert_eq!(transition(S::StopAtEnd, E::Drained), S::Halt);
        assert_eq!(transition(S::Active, E::Drained), S::Active);
        assert_eq!(transition(S::Halt, E::Closed), S::Idle);
    }

    #[test]
    fn test_apply_drives_gate_and_counts_halts() {
        let session = PlaybackSession::new(&PlayerConfig::default());
        let mut inner = session.lock_blocking();

        inner.apply(E::Start);
        inner.apply(E::Opened);
        assert!(!session.is_feeding());
        inner.apply(progress(60, false));
        assert_eq!(inner.state(), S::Active);
        assert!(session.is_feeding());

        inner.apply(E::Pause);
        assert!(!session.is_feeding());
        inner.apply(E::Abort);
        inner.apply(E::Abort);
        assert_eq!(inner.halts(), 1);
        assert!(!inner.report_end);
    }

    #[test]
    fn test_end_reporting_flag() {
        let session = PlaybackSession::new(&PlayerConfig::default());
        let mut inner = session.lock_blocking();

        inner.apply(E::Start);
        inner.apply(E::Rejected { not_acceptable: true });
        assert!(inner.report_end);
        inner.apply(E::Closed);
        assert!(!inner.report_end);

        inner.apply(E::Start);
        inner.apply(E::Rejected { not_acceptable: false });
        assert!(!inner.report_end);
        inner.apply(E::Closed);

        inner.apply(E::Start);
        inner.apply(E::Opened);
        inner.apply(progress(0, true));
        inner.apply(E::Drained);
        assert!(inner.report_end);
    }
}
