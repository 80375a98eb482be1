//! 共通エラー型定義

use thiserror::Error;

/// blelink共通エラー型
#[derive(Debug, Error)]
pub enum BleLinkError {
    /// 利用可能なアダプタがない（またはBluetoothが無効）
    #[error("No Bluetooth adapter available: {0}")]
    NoAdapterAvailable(String),

    /// 接続要求の失敗
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// read/write/subscribeの失敗
    #[error("Operation failed: {0}")]
    OperationFailed(String),

    /// 切断の失敗（ベストエフォート）
    #[error("Disconnect failed: {0}")]
    DisconnectFailed(String),

    /// デバイスが見つからない
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// デバイスが接続されていない
    #[error("Device not connected: {0}")]
    DeviceNotConnected(String),

    /// 設定エラー
    #[error("Configuration error: {0}")]
    Config(String),

    /// タイムアウト
    #[error("Operation timeout: {0}")]
    Timeout(String),

    /// IO エラー
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON パースエラー
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// その他のエラー
    #[error("Other error: {0}")]
    Other(String),
}

/// Result型のエイリアス
pub type Result<T> = std::result::Result<T, BleLinkError>;

impl BleLinkError {
    /// エラーコードを返す（ログ・ホスト層向け）
    pub fn error_code(&self) -> &str {
        match self {
            BleLinkError::NoAdapterAvailable(_) => "NO_ADAPTER_AVAILABLE",
            BleLinkError::ConnectionFailed(_) => "CONNECTION_FAILED",
            BleLinkError::OperationFailed(_) => "OPERATION_FAILED",
            BleLinkError::DisconnectFailed(_) => "DISCONNECT_FAILED",
            BleLinkError::DeviceNotFound(_) => "DEVICE_NOT_FOUND",
            BleLinkError::DeviceNotConnected(_) => "DEVICE_NOT_CONNECTED",
            BleLinkError::Config(_) => "CONFIG_ERROR",
            BleLinkError::Timeout(_) => "TIMEOUT",
            BleLinkError::Io(_) => "IO_ERROR",
            BleLinkError::Json(_) => "JSON_ERROR",
            BleLinkError::Other(_) => "UNKNOWN_ERROR",
        }
    }

    /// ハードウェア層由来のエラーか（デバイス境界で吸収される種類）
    pub fn is_hardware(&self) -> bool {
        matches!(
            self,
            BleLinkError::ConnectionFailed(_)
                | BleLinkError::OperationFailed(_)
                | BleLinkError::DisconnectFailed(_)
                | BleLinkError::DeviceNotConnected(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            BleLinkError::NoAdapterAvailable("radio off".into()).error_code(),
            "NO_ADAPTER_AVAILABLE"
        );
        assert_eq!(
            BleLinkError::DisconnectFailed("x".into()).error_code(),
            "DISCONNECT_FAILED"
        );
    }

    #[test]
    fn test_hardware_classification() {
        assert!(BleLinkError::OperationFailed("busy".into()).is_hardware());
        assert!(!BleLinkError::Config("bad".into()).is_hardware());
        assert!(!BleLinkError::NoAdapterAvailable("none".into()).is_hardware());
    }
}
