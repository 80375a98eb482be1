//! blelink ホスト
//!
//! 実機のBluetoothアダプタでデバイスレジストリとセッションを動かし、
//! レジストリイベントと受信値をログ/標準出力に流す。

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use blelink_common::config::LoggingConfig;
use blelink_common::{
    BleDeviceManager, BleSession, CharacteristicCapability, RegistryEvent, SessionState, Settings, VERSION,
};

mod bluetooth_impl;
mod platform;

use bluetooth_impl::BtleProvider;
use platform::HostPlatform;

/// 接続状態の確認間隔（--read-all用）
const READ_ALL_POLL: Duration = Duration::from_millis(500);

/// blelink BLEデバイスホスト
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 設定ファイル（json / toml / yaml）。未指定ならCONFIG_FILE環境変数
    #[arg(short, long)]
    config: Option<String>,

    /// ログレベル設定 (error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,

    /// 使用するアダプタ名
    #[arg(long)]
    adapter: Option<String>,

    /// 見つかり次第選択するデバイスのアドレス
    #[arg(short, long)]
    device: Option<String>,

    /// セッション状態ファイル
    #[arg(long)]
    state_file: Option<String>,

    /// 1回だけスキャンする
    #[arg(long)]
    scan_once: bool,

    /// 接続時に読み取り可能なキャラクタリスティックを全て読む
    #[arg(long)]
    read_all: bool,

    /// 接続時にNotify/Indicateを全て購読する
    #[arg(long)]
    subscribe_all: bool,

    /// 前回のデバイスの記録を消してから開始する
    #[arg(long)]
    forget: bool,
}

impl Args {
    /// コマンドライン引数で設定を上書き
    fn apply(&self, settings: &mut Settings) {
        if let Some(level) = &self.log_level {
            settings.logging.level = level.clone();
        }
        if let Some(adapter) = &self.adapter {
            settings.bluetooth.adapter = Some(adapter.clone());
        }
        if let Some(state_file) = &self.state_file {
            settings.session.state_file = Some(state_file.clone());
        }
        if self.scan_once {
            settings.bluetooth.scan_interval_secs = None;
        }
        if self.subscribe_all {
            settings.session.subscribe_on_connect = true;
        }
    }
}

fn load_settings(args: &Args) -> anyhow::Result<Settings> {
    let mut settings = match &args.config {
        Some(path) => {
            let mut settings = Settings::from_file(path)
                .with_context(|| format!("Failed to load configuration from {}", path))?;
            settings.override_from_env();
            settings
        }
        None => Settings::new().context("Failed to load configuration")?,
    };
    args.apply(&mut settings);
    settings.validate().context("Invalid configuration")?;
    Ok(settings)
}

fn init_logging(config: &LoggingConfig) {
    // RUST_LOGがあれば優先
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.output.as_str() {
        "stderr" => builder.with_writer(std::io::stderr).init(),
        _ => builder.init(),
    }
}

/// 現在のデバイスの読み取り可能なキャラクタリスティックを全て読む
async fn read_all(session: &BleSession) -> usize {
    let Some(device) = session.current_device() else {
        return 0;
    };
    let entries = session.inventory().entries_for(device.address());
    let mut read = 0;
    for entry in entries
        .iter()
        .filter(|e| e.capability == CharacteristicCapability::Read)
    {
        match entry.trigger(&device, &[]).await {
            Ok(()) => read += 1,
            Err(e) => warn!("Read of {} failed: {}", entry.info.nice_name, e),
        }
    }
    read
}

fn spawn_read_all(session: Arc<BleSession>) {
    tokio::spawn(async move {
        let mut done_for: Option<String> = None;
        let mut interval = tokio::time::interval(READ_ALL_POLL);
        loop {
            interval.tick().await;
            if !session.is_connected() {
                done_for = None;
                continue;
            }
            let current = session.current_device().map(|d| d.address().to_string());
            if current.is_some() && current != done_for {
                let count = read_all(&session).await;
                info!("Read {} characteristic(s)", count);
                done_for = current;
            }
        }
    });
}

fn spawn_printers(manager: &BleDeviceManager, session: &BleSession) {
    let mut registry = manager.subscribe();
    tokio::spawn(async move {
        loop {
            match registry.recv().await {
                Ok(RegistryEvent::DeviceAdded(device)) => info!("+ {}", device.description),
                Ok(RegistryEvent::DeviceRemoved(device)) => info!("- {}", device.description),
                Err(RecvError::Lagged(skipped)) => warn!("Missed {} registry event(s)", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut values = session.subscribe_data();
    tokio::spawn(async move {
        loop {
            match values.recv().await {
                Ok(value) => match serde_json::to_string(&value) {
                    Ok(line) => println!("{}", line),
                    Err(e) => warn!("Failed to serialize value: {}", e),
                },
                Err(RecvError::Lagged(skipped)) => warn!("Dropped {} value(s)", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

/// 指定アドレスのデバイスが登録されたら選択する
fn spawn_device_selection(manager: Arc<BleDeviceManager>, session: Arc<BleSession>, address: String) {
    let mut registry = manager.subscribe();
    tokio::spawn(async move {
        if manager.lookup(&address).await.is_none() {
            info!("Waiting for {}...", address);
            loop {
                match registry.recv().await {
                    Ok(RegistryEvent::DeviceAdded(device)) if device.address.eq_ignore_ascii_case(&address) => {
                        break;
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return,
                }
            }
        }
        let Some(device) = manager
            .devices()
            .await
            .into_iter()
            .find(|d| d.address().eq_ignore_ascii_case(&address))
        else {
            warn!("{} disappeared before it could be selected", address);
            return;
        };
        if let Err(e) = session.select_device(device.address()).await {
            warn!("Failed to select {}: {}", address, e);
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let settings = load_settings(&args)?;
    init_logging(&settings.logging);

    // ビルド番号を取得
    const BUILD_NUMBER: &str = env!("BUILD_NUMBER");
    info!(
        "blelink host {} starting (build #{}, {})",
        VERSION,
        BUILD_NUMBER,
        env!("GIT_HASH")
    );
    let platform = blelink_common::platform_info();
    info!(
        "Platform: {} ({} {}/{})",
        HostPlatform::distribution(),
        platform.family,
        platform.os,
        platform.arch
    );

    // Bluetooth利用可能性チェック
    info!("Checking Bluetooth availability...");
    if !HostPlatform::check_bluetooth_available().await {
        anyhow::bail!("Bluetooth is not available on this system");
    }

    let provider = Arc::new(BtleProvider::new().await?);
    let manager = BleDeviceManager::new(provider, settings.bluetooth.clone())?;
    manager
        .initialize()
        .await
        .context("Failed to initialize Bluetooth")?;

    let state = match settings.session.state_file.as_deref() {
        Some(path) => SessionState::load(path).unwrap_or_else(|e| {
            warn!("Ignoring unreadable session state {}: {}", path, e);
            SessionState::default()
        }),
        None => SessionState::default(),
    };
    if let Some(last) = &state.last_device_id {
        info!("Last used device: {}", last);
    }
    let session = BleSession::new(Arc::clone(&manager), settings.session.clone(), state)?;
    if args.forget {
        session.detach_device().await;
    }

    let shutdown = HostPlatform::setup_shutdown_handler();
    spawn_printers(&manager, &session);
    if let Some(address) = args.device.clone() {
        spawn_device_selection(Arc::clone(&manager), Arc::clone(&session), address);
    }
    if args.read_all {
        spawn_read_all(Arc::clone(&session));
    }

    session.start().await;
    manager.start()?;
    info!("Running. Press Ctrl+C to stop");

    shutdown.wait().await;
    info!("Shutdown signal received, stopping...");
    session.shutdown().await;
    manager.shutdown().await;
    info!("Stopped");

    Ok(())
}
