//! Maps the polled device profile onto the media pipelines.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};

use crate::audio::Vs1053b;
use crate::error::ProfileError;
use crate::hal::OutputLine;
use crate::net_link::ProfileSource;
use crate::pipeline::{
    CaptureEvent, CaptureSession, CaptureState, PlaybackEvent, PlaybackSession, PlaybackState,
};
use crate::profile::DeviceProfileSnapshot;

/// Consecutive failed polls after which the link is treated as down.
const LINK_DOWN_AFTER: u32 = 3;

/// Longest wait for both pipelines to settle in IDLE during a media halt.
const HALT_TIMEOUT: Duration = Duration::from_secs(10);
const HALT_POLL: Duration = Duration::from_millis(20);

pub struct ProfileReconciler {
    playback: Arc<PlaybackSession>,
    capture: Arc<CaptureSession>,
    codec: Arc<Vs1053b>,
    indicator: Box<dyn OutputLine>,
    producing: bool,
}

impl ProfileReconciler {
    pub fn new(
        playback: Arc<PlaybackSession>,
        capture: Arc<CaptureSession>,
        codec: Arc<Vs1053b>,
        mut indicator: Box<dyn OutputLine>,
    ) -> Self {
        indicator.set_level(false);
        Self {
            playback,
            capture,
            codec,
            indicator,
            producing: false,
        }
    }

    /// Whether the activity indicator is lit.
    pub fn indicator_on(&self) -> bool {
        self.producing
    }

    /// Applies one profile snapshot.
    pub async fn apply(&mut self, profile: &DeviceProfileSnapshot) {
        {
            let mut player = self.playback.lock().await;

            if profile.mute != player.muted {
                self.codec.set_amp_mute(profile.mute);
                player.muted = profile.mute;
                log::info!("Amplifier {}", if profile.mute { "muted" } else { "unmuted" });
            }

            if profile.volume != player.volume {
                match self.codec.set_volume(profile.volume) {
                    Ok(_) => {
                        player.volume = profile.volume;
                        log::info!("Volume set to {}", profile.volume);
                    }
                    Err(e) => log::error!("Failed to set volume: {}", e),
                }
            }

            if profile.track_id != player.track {
                if player.state() != PlaybackState::Idle {
                    log::info!("Track changed to {}, stopping {}", profile.track_id, player.track);
                }
                player.apply(PlaybackEvent::Abort);
            } else if profile.track_count > 0 {
                if profile.player_active {
                    player.apply(PlaybackEvent::Start);
                    player.apply(PlaybackEvent::Resume);
                } else {
                    player.apply(PlaybackEvent::Pause);
                }
            }

            player.track_count = profile.track_count;
            player.track = profile.track_id;
        }

        {
            let mut recorder = self.capture.lock().await;
            if profile.recorder_active {
                recorder.apply(CaptureEvent::Start);
            } else {
                recorder.apply(CaptureEvent::Stop);
            }
        }

        self.update_indicator().await;
    }

    /// Lights the indicator while either pipeline is moving audio.
    pub async fn update_indicator(&mut self) {
        let producing = self.playback.state().await.is_feeding()
            || self.capture.state().await == CaptureState::Active;
        if producing != self.producing {
            self.indicator.set_level(producing);
            self.producing = producing;
            log::debug!("Activity indicator {}", if producing { "on" } else { "off" });
        }
    }

    /// Stops both pipelines and waits for them to return to IDLE.
    pub async fn halt_media(&mut self) {
        self.playback.lock().await.apply(PlaybackEvent::Abort);
        self.capture.lock().await.apply(CaptureEvent::Stop);

        let deadline = Instant::now() + HALT_TIMEOUT;
        loop {
            let player = self.playback.state().await;
            let recorder = self.capture.state().await;
            if player == PlaybackState::Idle && recorder == CaptureState::Idle {
                break;
            }
            if Instant::now() >= deadline {
                log::warn!(
                    "Media did not settle: player={:?}, recorder={:?}",
                    player,
                    recorder
                );
                break;
            }
            sleep(HALT_POLL).await;
        }

        self.indicator.set_level(false);
        self.producing = false;
        log::info!("Media halted");
    }

    /// Polls `source` until it reports the device as unauthorized.
    pub async fn run(
        &mut self,
        source: Arc<dyn ProfileSource>,
        interval: Duration,
        backoff: Duration,
    ) -> Result<(), ProfileError> {
        let mut failures = 0u32;
        loop {
            match source.fetch().await {
                Ok(profile) => {
                    failures = 0;
                    self.apply(&profile).await;
                    sleep(interval).await;
                }
                Err(ProfileError::Unauthorized) => {
                    log::error!("Profile request unauthorized, device needs provisioning");
                    self.halt_media().await;
                    return Err(ProfileError::Unauthorized);
                }
                Err(ProfileError::Malformed(e)) => {
                    log::warn!("Skipping malformed profile: {}", e);
                    sleep(interval).await;
                }
                Err(ProfileError::Transport(e)) => {
                    failures += 1;
                    log::error!("Failed to perform profile request ({}): {}", failures, e);
                    if failures == LINK_DOWN_AFTER {
                        log::warn!("Server unreachable, halting media");
                        self.halt_media().await;
                    }
                    sleep(if failures >= LINK_DOWN_AFTER { backoff } else { interval }).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::ResetTiming;
    use crate::audio::regs::SCI_VOL;
    use crate::hal::SimBoard;
    use crate::pipeline::{PlayerConfig, RecorderConfig};
    use crate::track_id::TrackId;
    use async_trait::async_trait;

    struct Fixture {
        board: SimBoard,
        playback: Arc<PlaybackSession>,
        capture: Arc<CaptureSession>,
        reconciler: ProfileReconciler,
    }

    fn fixture() -> Fixture {
        let board = SimBoard::new();
        let playback = Arc::new(PlaybackSession::new(&PlayerConfig::default()));
        let capture = Arc::new(CaptureSession::new(&RecorderConfig::default()));
        let reconciler = ProfileReconciler::new(
            playback.clone(),
            capture.clone(),
            Arc::new(board.decoder(ResetTiming::immediate())),
            Box::new(board.line("led")),
        );
        Fixture {
            board,
            playback,
            capture,
            reconciler,
        }
    }

    fn profile(track_id: TrackId, player_active: bool, track_count: u32) -> DeviceProfileSnapshot {
        DeviceProfileSnapshot {
            id: "dev".into(),
            name: "test".into(),
            mute: false,
            player_active,
            recorder_active: false,
            track_count,
            volume: 100.0,
            track_id,
        }
    }

    async fn drive_to_active(playback: &PlaybackSession, track: TrackId) {
        let mut inner = playback.lock().await;
        inner.track = track;
        inner.apply(PlaybackEvent::Start);
        inner.apply(PlaybackEvent::Opened);
        inner.apply(PlaybackEvent::Progress {
            queued: 100,
            capacity: 100,
            eos: false,
        });
        assert_eq!(inner.state(), PlaybackState::Active);
    }

    #[tokio::test]
    async fn test_same_track_active_starts_from_idle() {
        let mut f = fixture();
        let track = TrackId::generate();
        f.playback.lock().await.track = track;

        f.reconciler.apply(&profile(track, true, 1)).await;
        assert_eq!(f.playback.state().await, PlaybackState::Starting);
    }

    #[tokio::test]
    async fn test_zero_count_does_not_start() {
        let mut f = fixture();
        let track = TrackId::generate();
        f.playback.lock().await.track = track;

        f.reconciler.apply(&profile(track, true, 0)).await;
        assert_eq!(f.playback.state().await, PlaybackState::Idle);
    }

    #[tokio::test]
    async fn test_inactive_player_pauses_and_resumes() {
        let mut f = fixture();
        let track = TrackId::generate();
        drive_to_active(&f.playback, track).await;

        f.reconciler.apply(&profile(track, false, 1)).await;
        assert_eq!(f.playback.state().await, PlaybackState::Pause);

        f.reconciler.apply(&profile(track, true, 1)).await;
        assert_eq!(f.playback.state().await, PlaybackState::Active);
    }

    #[tokio::test]
    async fn test_changed_track_forces_halt() {
        let mut f = fixture();
        let old = TrackId::generate();
        let new = TrackId::generate();
        drive_to_active(&f.playback, old).await;

        f.reconciler.apply(&profile(new, true, 1)).await;
        let inner = f.playback.lock().await;
        assert_eq!(inner.state(), PlaybackState::Halt);
        assert_eq!(inner.track, new);
        assert_eq!(inner.track_count, 1);
    }

    #[tokio::test]
    async fn test_changed_track_from_idle_only_records_it() {
        let mut f = fixture();
        let track = TrackId::generate();
        f.reconciler.apply(&profile(track, true, 1)).await;
        let inner = f.playback.lock().await;
        assert_eq!(inner.state(), PlaybackState::Idle);
        assert_eq!(inner.track, track);
        assert_eq!(inner.halts(), 0);
    }

    #[tokio::test]
    async fn test_mute_and_volume_reach_the_hardware() {
        let mut f = fixture();
        let mut p = profile(TrackId::nil(), false, 0);
        p.volume = 80.0;
        p.mute = true;
        f.reconciler.apply(&p).await;

        assert_eq!(f.board.line_level("amp_mute"), Some(false));
        let code = f.board.register(SCI_VOL);
        assert_eq!(code >> 8, code & 0xFF);
        assert!(code > 0);
        let inner = f.playback.lock().await;
        assert!(inner.muted);
        assert_eq!(inner.volume, 80.0);
    }

    #[tokio::test]
    async fn test_recorder_flag_drives_capture() {
        let mut f = fixture();
        let mut p = profile(TrackId::nil(), false, 0);
        p.recorder_active = true;
        f.reconciler.apply(&p).await;
        assert_eq!(f.capture.state().await, CaptureState::Starting);

        f.capture.lock().await.apply(CaptureEvent::Armed);
        p.recorder_active = false;
        f.reconciler.apply(&p).await;
        assert_eq!(f.capture.state().await, CaptureState::Halt);
    }

    #[tokio::test]
    async fn test_indicator_is_edge_triggered() {
        let mut f = fixture();
        let track = TrackId::generate();
        assert_eq!(f.board.line_history("led"), vec![false]);

        drive_to_active(&f.playback, track).await;
        f.reconciler.update_indicator().await;
        f.reconciler.update_indicator().await;
        assert!(f.reconciler.indicator_on());
        assert_eq!(f.board.line_history("led"), vec![false, true]);

        f.playback.lock().await.apply(PlaybackEvent::Pause);
        f.reconciler.update_indicator().await;
        assert_eq!(f.board.line_history("led"), vec![false, true, false]);
    }

    struct Revoked;

    #[async_trait]
    impl ProfileSource for Revoked {
        async fn fetch(&self) -> Result<DeviceProfileSnapshot, ProfileError> {
            Err(ProfileError::Unauthorized)
        }
    }

    #[tokio::test]
    async fn test_unauthorized_stops_polling() {
        let mut f = fixture();
        let result = f
            .reconciler
            .run(
                Arc::new(Revoked),
                Duration::from_millis(1),
                Duration::from_millis(1),
            )
            .await;
        assert!(matches!(result, Err(ProfileError::Unauthorized)));
        assert!(!f.reconciler.indicator_on());
    }
}
