use std::sync::Arc;

use anyhow::{bail, Context};
use mac_address::get_mac_address;
use tokio::signal;
use uuid::Uuid;

use racoon_media::audio::{Microphone, ResetTiming};
use racoon_media::config::Config;
use racoon_media::hal::SimBoard;
use racoon_media::net_link::HttpLink;
use racoon_media::pipeline::{CaptureSession, PlaybackSession, Player, Recorder};
use racoon_media::ProfileReconciler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init();

    // 加载配置
    let mut config = Config::new().map_err(anyhow::Error::msg)?;

    // 设备id的处理
    if config.device_id == "unknown-device" {
        config.device_id = match get_mac_address() {
            Ok(Some(mac)) => mac.to_string().to_lowercase(),
            _ => Uuid::new_v4().to_string(),
        };
    }

    log::info!(
        "{} {} starting on {} ({}), device id {}",
        config.app_name,
        config.app_version,
        config.board_name,
        config.board_type,
        config.device_id
    );

    if config.board_type != "sim" {
        bail!("Unsupported board type '{}'", config.board_type);
    }
    let board = SimBoard::new();

    // 解码芯片，启动失败直接退出
    let codec = Arc::new(board.decoder(ResetTiming::default()));
    codec.start().context("Failed to start audio decoder")?;

    let mic = open_microphone(&config)?;
    let link = Arc::new(HttpLink::new(&config)?);

    // 会话与FIFO在启动时一次性分配
    let playback = Arc::new(PlaybackSession::new(&config.player));
    let capture = Arc::new(CaptureSession::new(&config.recorder));

    let player = Player::spawn(
        playback.clone(),
        codec.clone(),
        link.clone(),
        config.player.clone(),
    )?;
    let recorder = Recorder::spawn(capture.clone(), mic, link.clone(), config.recorder.clone())?;

    let mut reconciler =
        ProfileReconciler::new(playback, capture, codec, Box::new(board.line("led")));

    let outcome = tokio::select! {
        // 监听 Ctrl+C 信号
        _ = signal::ctrl_c() => {
            log::info!("Received Ctrl+C, shutting down...");
            Ok(())
        }
        result = reconciler.run(link.clone(), config.poll_interval, config.disconnected_backoff) => result,
    };

    reconciler.halt_media().await;
    player.shutdown().await;
    recorder.shutdown().await;

    outcome.context("Device profile polling stopped")
}

#[cfg(feature = "alsa")]
fn open_microphone(config: &Config) -> anyhow::Result<Box<dyn Microphone>> {
    let mic = racoon_media::audio::AlsaMicrophone::open(
        &config.recorder.capture_device,
        config.recorder.sample_rate,
    )?;
    Ok(Box::new(mic))
}

#[cfg(not(feature = "alsa"))]
fn open_microphone(config: &Config) -> anyhow::Result<Box<dyn Microphone>> {
    log::info!("Using simulated microphone");
    Ok(Box::new(racoon_media::audio::SimMicrophone::sine(config.recorder.sample_rate)))
}
