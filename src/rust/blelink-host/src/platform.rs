//! プラットフォーム固有の処理

use tokio::signal;
use tokio::sync::oneshot;
use tracing::{info, warn};

/// シャットダウンシグナル受信器
pub struct ShutdownReceiver {
    rx: oneshot::Receiver<()>,
}

impl ShutdownReceiver {
    /// シグナルを待機
    pub async fn wait(self) {
        let _ = self.rx.await;
    }
}

/// ホストプラットフォーム
pub struct HostPlatform;

impl HostPlatform {
    /// Ctrl+C（UnixではSIGTERMも）のハンドラーをセットアップ
    pub fn setup_shutdown_handler() -> ShutdownReceiver {
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            wait_for_signal().await;
            let _ = tx.send(());
        });

        ShutdownReceiver { rx }
    }

    /// Bluetooth利用可能かチェック
    #[cfg(target_os = "linux")]
    pub async fn check_bluetooth_available() -> bool {
        // systemdサービスのチェック（簡易版）
        match tokio::process::Command::new("systemctl")
            .args(["is-active", "bluetooth"])
            .output()
            .await
        {
            Ok(output) => {
                let status = String::from_utf8_lossy(&output.stdout);
                status.trim() == "active" || std::path::Path::new("/sys/class/bluetooth").exists()
            }
            Err(_) => {
                // systemctlが使えない場合は、/sys/class/bluetoothをチェック
                std::path::Path::new("/sys/class/bluetooth").exists()
            }
        }
    }

    /// Bluetooth利用可能かチェック（アダプタ列挙に任せる）
    #[cfg(not(target_os = "linux"))]
    pub async fn check_bluetooth_available() -> bool {
        true
    }

    /// ディストリビューション名（Linux以外はOS名）
    pub fn distribution() -> String {
        if let Ok(content) = std::fs::read_to_string("/etc/os-release") {
            for line in content.lines() {
                if let Some(name) = line.strip_prefix("PRETTY_NAME=") {
                    return name.trim_matches('"').to_string();
                }
            }
        }
        std::env::consts::OS.to_string()
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal as unix_signal, SignalKind};

    let mut sigterm = match unix_signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!("Unable to listen for SIGTERM: {}", e);
            wait_for_ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = wait_for_ctrl_c() => {}
        _ = sigterm.recv() => info!("Received SIGTERM signal"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    wait_for_ctrl_c().await;
}

async fn wait_for_ctrl_c() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C signal"),
        Err(err) => {
            warn!("Unable to listen for shutdown signal: {}", err);
            std::future::pending::<()>().await;
        }
    }
}
