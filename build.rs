use std::fs;
use std::path::Path;
use serde::Deserialize;

#[derive(Deserialize)]
struct Config {
    application: Application,
    board: Board,
    network: Network,
    player: Player,
    recorder: Recorder,
    profile: Profile,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Board {
    #[serde(rename = "type")]
    type_: String,
    name: String,
}

#[derive(Deserialize)]
struct Network {
    profile_url: String,
    player_url: String,
    recorder_url: String,
    login: String,
    password: String,
    device_id: String,
    timeout_ms: u64,
}

#[derive(Deserialize)]
struct Player {
    chunk_size: usize,
    queue_size: usize,
    empty_read_retries: u32,
    idle_poll_ms: u64,
    pause_poll_ms: u64,
}

#[derive(Deserialize)]
struct Recorder {
    frame_size: usize,
    queue_size: usize,
    backlog_threshold: usize,
    frame_timeout_ms: u64,
    sample_rate: u32,
    wav_nominal_frames: u32,
    capture_device: String,
}

#[derive(Deserialize)]
struct Profile {
    poll_interval_ms: u64,
    disconnected_backoff_ms: u64,
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    // 应用和板子信息
    println!("cargo:rustc-env=APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=APP_VERSION={}", config.application.version);
    println!("cargo:rustc-env=BOARD_TYPE={}", config.board.type_);
    println!("cargo:rustc-env=BOARD_NAME={}", config.board.name);

    // 网络配置
    println!("cargo:rustc-env=PROFILE_URL={}", config.network.profile_url);
    println!("cargo:rustc-env=PLAYER_URL={}", config.network.player_url);
    println!("cargo:rustc-env=RECORDER_URL={}", config.network.recorder_url);
    println!("cargo:rustc-env=DEVICE_LOGIN={}", config.network.login);
    println!("cargo:rustc-env=DEVICE_PASSWORD={}", config.network.password);
    println!("cargo:rustc-env=DEVICE_ID={}", config.network.device_id);
    println!("cargo:rustc-env=NETWORK_TIMEOUT_MS={}", config.network.timeout_ms);

    // 播放器配置
    println!("cargo:rustc-env=PLAYER_CHUNK_SIZE={}", config.player.chunk_size);
    println!("cargo:rustc-env=PLAYER_QUEUE_SIZE={}", config.player.queue_size);
    println!("cargo:rustc-env=PLAYER_EMPTY_READ_RETRIES={}", config.player.empty_read_retries);
    println!("cargo:rustc-env=PLAYER_IDLE_POLL_MS={}", config.player.idle_poll_ms);
    println!("cargo:rustc-env=PLAYER_PAUSE_POLL_MS={}", config.player.pause_poll_ms);

    // 录音配置
    println!("cargo:rustc-env=RECORDER_FRAME_SIZE={}", config.recorder.frame_size);
    println!("cargo:rustc-env=RECORDER_QUEUE_SIZE={}", config.recorder.queue_size);
    println!("cargo:rustc-env=RECORDER_BACKLOG_THRESHOLD={}", config.recorder.backlog_threshold);
    println!("cargo:rustc-env=RECORDER_FRAME_TIMEOUT_MS={}", config.recorder.frame_timeout_ms);
    println!("cargo:rustc-env=RECORDER_SAMPLE_RATE={}", config.recorder.sample_rate);
    println!("cargo:rustc-env=RECORDER_WAV_NOMINAL_FRAMES={}", config.recorder.wav_nominal_frames);
    println!("cargo:rustc-env=RECORDER_CAPTURE_DEVICE={}", config.recorder.capture_device);

    // 设备配置轮询
    println!("cargo:rustc-env=PROFILE_POLL_INTERVAL_MS={}", config.profile.poll_interval_ms);
    println!("cargo:rustc-env=PROFILE_DISCONNECTED_BACKOFF_MS={}", config.profile.disconnected_backoff_ms);
}
