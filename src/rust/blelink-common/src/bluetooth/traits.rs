//! Bluetooth抽象化トレイト
//!
//! ハードウェアスタック（アダプタバインディング）との境界。
//! コールバックはスタック側のスレッドから呼ばれる可能性があるため、
//! すべて `Send + Sync` のクロージャとして受け渡す。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;
use crate::protocol::ServiceDescriptor;

/// 接続・切断・スキャン開始/停止の通知
pub type EventCallback = Arc<dyn Fn() + Send + Sync>;

/// Notify/Indicateで届いた生バイト列の通知
pub type NotificationCallback = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// スキャン中に見つかったペリフェラルの通知
pub type PeripheralCallback = Arc<dyn Fn(Arc<dyn Peripheral>) + Send + Sync>;

/// スキャン関連コールバック一式
#[derive(Clone, Default)]
pub struct ScanCallbacks {
    pub on_scan_start: Option<EventCallback>,
    pub on_scan_stop: Option<EventCallback>,
    pub on_scan_found: Option<PeripheralCallback>,
}

/// デバイス情報（イベント・表示用のスナップショット）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// 表示名
    pub name: String,

    /// Bluetoothアドレス（識別子）
    pub address: String,

    /// "名前 (アドレス)"
    pub description: String,

    /// イベント発生時点の接続状態
    pub connected: bool,
}

/// アダプタ一覧の提供元
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AdapterProvider: Send + Sync {
    /// 無線が有効か
    async fn is_radio_enabled(&self) -> bool;

    /// 利用可能なアダプタ一覧
    async fn list_adapters(&self) -> Result<Vec<Arc<dyn Adapter>>>;
}

/// 1つの無線アダプタ
#[async_trait]
pub trait Adapter: Send + Sync + Debug {
    /// アダプタ名
    fn identifier(&self) -> String;

    /// アダプタのアドレス
    fn address(&self) -> String;

    /// スキャンコールバックを登録（既存の登録は置き換え）
    fn set_scan_callbacks(&self, callbacks: ScanCallbacks);

    /// スキャン開始
    async fn start_scan(&self) -> Result<()>;

    /// スキャン停止
    async fn stop_scan(&self) -> Result<()>;

    /// 最新のスキャン結果
    async fn scan_results(&self) -> Result<Vec<Arc<dyn Peripheral>>>;

    /// 指定時間だけスキャンして停止
    async fn scan_for(&self, duration: Duration) -> Result<()> {
        self.start_scan().await?;
        tokio::time::sleep(duration).await;
        self.stop_scan().await
    }
}

/// リモートペリフェラルへのハンドル
///
/// 同じデバイスでもスキャンのたびに新しいハンドルが返ることがある。
/// 同一性は `address()` で判定する。
#[async_trait]
pub trait Peripheral: Send + Sync + Debug {
    /// 表示名（空文字の場合あり）
    fn identifier(&self) -> String;

    /// ハードウェアアドレス
    fn address(&self) -> String;

    async fn is_connectable(&self) -> bool;

    async fn is_connected(&self) -> bool;

    /// 接続を要求する。完了は接続コールバックで通知される
    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    /// サービスとキャラクタリスティックの一覧
    async fn services(&self) -> Result<Vec<ServiceDescriptor>>;

    async fn read(&self, service: Uuid, characteristic: Uuid) -> Result<Vec<u8>>;

    /// 応答なし書き込み
    async fn write_command(&self, service: Uuid, characteristic: Uuid, data: &[u8]) -> Result<()>;

    /// Notify/Indicateを購読する。値はコールバックで届く
    async fn subscribe(
        &self,
        service: Uuid,
        characteristic: Uuid,
        callback: NotificationCallback,
    ) -> Result<()>;

    /// 接続/切断コールバックを登録（既存の登録は置き換え）
    fn set_connection_callbacks(&self, on_connected: EventCallback, on_disconnected: EventCallback);
}
