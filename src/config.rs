use std::time::Duration;

use crate::pipeline::capture::RecorderConfig;
use crate::pipeline::playback::PlayerConfig;

#[derive(Debug, Clone)]
pub struct Config {
    // 应用和板子信息
    pub app_name: &'static str,
    pub app_version: &'static str,
    pub board_type: &'static str,
    pub board_name: &'static str,

    // 网络配置（静态部分）
    pub profile_url: &'static str,
    pub player_url: &'static str,
    pub recorder_url: &'static str,
    pub login: &'static str,
    pub password: &'static str,
    /// Connect and per-read timeout of every network request.
    pub net_timeout: Duration,

    // 设备标识（动态部分，可在运行时修改）
    pub device_id: String,

    // 媒体管线参数
    pub player: PlayerConfig,
    pub recorder: RecorderConfig,

    // 设备配置轮询
    pub poll_interval: Duration,
    pub disconnected_backoff: Duration,
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self, &'static str> {
        let net_timeout = Duration::from_millis(env!("NETWORK_TIMEOUT_MS").parse()
            .map_err(|_| "Failed to parse NETWORK_TIMEOUT_MS")?);

        Ok(Self {
            app_name: env!("APP_NAME"),
            app_version: env!("APP_VERSION"),
            board_type: env!("BOARD_TYPE"),
            board_name: env!("BOARD_NAME"),

            profile_url: env!("PROFILE_URL"),
            player_url: env!("PLAYER_URL"),
            recorder_url: env!("RECORDER_URL"),
            login: env!("DEVICE_LOGIN"),
            password: env!("DEVICE_PASSWORD"),
            net_timeout,

            device_id: env!("DEVICE_ID").to_string(),

            player: PlayerConfig {
                chunk_size: env!("PLAYER_CHUNK_SIZE").parse()
                    .map_err(|_| "Failed to parse PLAYER_CHUNK_SIZE")?,
                queue_size: env!("PLAYER_QUEUE_SIZE").parse()
                    .map_err(|_| "Failed to parse PLAYER_QUEUE_SIZE")?,
                empty_read_retries: env!("PLAYER_EMPTY_READ_RETRIES").parse()
                    .map_err(|_| "Failed to parse PLAYER_EMPTY_READ_RETRIES")?,
                idle_poll: Duration::from_millis(env!("PLAYER_IDLE_POLL_MS").parse()
                    .map_err(|_| "Failed to parse PLAYER_IDLE_POLL_MS")?),
                pause_poll: Duration::from_millis(env!("PLAYER_PAUSE_POLL_MS").parse()
                    .map_err(|_| "Failed to parse PLAYER_PAUSE_POLL_MS")?),
                read_timeout: net_timeout,
            },

            recorder: RecorderConfig {
                frame_size: env!("RECORDER_FRAME_SIZE").parse()
                    .map_err(|_| "Failed to parse RECORDER_FRAME_SIZE")?,
                queue_size: env!("RECORDER_QUEUE_SIZE").parse()
                    .map_err(|_| "Failed to parse RECORDER_QUEUE_SIZE")?,
                backlog_threshold: env!("RECORDER_BACKLOG_THRESHOLD").parse()
                    .map_err(|_| "Failed to parse RECORDER_BACKLOG_THRESHOLD")?,
                frame_timeout: Duration::from_millis(env!("RECORDER_FRAME_TIMEOUT_MS").parse()
                    .map_err(|_| "Failed to parse RECORDER_FRAME_TIMEOUT_MS")?),
                sample_rate: env!("RECORDER_SAMPLE_RATE").parse()
                    .map_err(|_| "Failed to parse RECORDER_SAMPLE_RATE")?,
                wav_nominal_frames: env!("RECORDER_WAV_NOMINAL_FRAMES").parse()
                    .map_err(|_| "Failed to parse RECORDER_WAV_NOMINAL_FRAMES")?,
                capture_device: env!("RECORDER_CAPTURE_DEVICE").to_string(),
                ..RecorderConfig::default()
            },

            poll_interval: Duration::from_millis(env!("PROFILE_POLL_INTERVAL_MS").parse()
                .map_err(|_| "Failed to parse PROFILE_POLL_INTERVAL_MS")?),
            disconnected_backoff: Duration::from_millis(env!("PROFILE_DISCONNECTED_BACKOFF_MS").parse()
                .map_err(|_| "Failed to parse PROFILE_DISCONNECTED_BACKOFF_MS")?),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new().expect("Failed to create default Config from build-time environment variables")
    }
}
