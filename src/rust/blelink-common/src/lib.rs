//! blelink 共通ライブラリ
//!
//! BLEデバイスの発見・接続管理・キャラクタリスティック操作を提供する。
//! ハードウェアとの境界は `bluetooth::traits` のトレイトで、
//! 実際のバインディングはホスト側クレートが実装する。

pub mod error;
pub mod protocol;
pub mod bluetooth;
pub mod config;

// バージョン情報
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

// 主要な型の再エクスポート
pub use error::{BleLinkError, Result};
pub use protocol::{
    CharacteristicCapability,
    CharacteristicInfo,
    CharacteristicProperties,
    DecodedValue,
    ReceivedValue,
    ServiceDescriptor,
    CharacteristicDescriptor,
};
pub use bluetooth::{
    Adapter,
    AdapterProvider,
    Peripheral,
    DeviceInfo,
    BleDevice,
    BleDeviceManager,
    BleSession,
    CharacteristicInventory,
    ConnectionState,
    RegistryEvent,
    SessionState,
};
pub use config::Settings;

/// プラットフォーム情報
pub fn platform_info() -> PlatformInfo {
    PlatformInfo {
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        family: std::env::consts::FAMILY.to_string(),
    }
}

/// プラットフォーム情報構造体
#[derive(Debug, Clone)]
pub struct PlatformInfo {
    pub os: String,
    pub arch: String,
    pub family: String,
}
