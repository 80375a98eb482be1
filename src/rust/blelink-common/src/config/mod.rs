//! 共通設定管理モジュール

use serde::{Deserialize, Serialize};
use std::env;
use crate::error::{BleLinkError, Result};

/// Bluetooth設定
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// 使用するアダプタ名（未指定なら最初のアダプタ）
    pub adapter: Option<String>,

    /// 1回のスキャン時間（ミリ秒）
    pub scan_duration_ms: u64,

    /// スキャン間隔（秒）。未指定なら1回だけスキャンする
    pub scan_interval_secs: Option<u64>,

    /// キープアライブ周期（ミリ秒）
    pub keepalive_interval_ms: u64,

    /// キープアライブ停止待ち（ミリ秒）
    pub keepalive_stop_timeout_ms: u64,

    /// イベントチャネル容量
    pub event_capacity: usize,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        BluetoothConfig {
            adapter: None,
            scan_duration_ms: 5000,
            scan_interval_secs: Some(3),
            keepalive_interval_ms: 1000,
            keepalive_stop_timeout_ms: 1000,
            event_capacity: 64,
        }
    }
}

/// セッション設定
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// 選択時（ゴースト復帰時を含む）に自動接続する
    pub auto_connect: bool,

    /// 接続時にNotify/Indicateエントリを全て購読する
    pub subscribe_on_connect: bool,

    /// 前回のデバイスがない場合に自動選択する名前（部分一致）
    pub name_filter: Option<String>,

    /// 前回のデバイスを保存するファイル
    pub state_file: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            auto_connect: true,
            subscribe_on_connect: false,
            name_filter: None,
            state_file: None,
        }
    }
}

/// ロギング設定
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// ログレベル（EnvFilter形式も可）
    pub level: String,

    /// ログ出力先（stdout / stderr）
    pub output: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            output: "stdout".to_string(),
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Bluetooth設定
    pub bluetooth: BluetoothConfig,

    /// セッション設定
    pub session: SessionConfig,

    /// ロギング設定
    pub logging: LoggingConfig,
}

impl Settings {
    /// 設定を読み込む
    ///
    /// 読み込み優先順位：
    /// 1. 環境変数
    /// 2. 設定ファイル（CONFIG_FILE で指定された場合）
    /// 3. デフォルト値
    pub fn new() -> Result<Self> {
        let mut settings = Self::default();

        if let Ok(config_path) = env::var("CONFIG_FILE") {
            settings = Self::from_file(&config_path)?;
        }

        settings.override_from_env();

        Ok(settings)
    }

    /// 設定ファイルから読み込む
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BleLinkError::Config(format!("Failed to read config file: {}", e)))?;

        if path.ends_with(".json") {
            serde_json::from_str(&content)
                .map_err(|e| BleLinkError::Config(format!("Failed to parse JSON config: {}", e)))
        } else if path.ends_with(".toml") {
            toml::from_str(&content)
                .map_err(|e| BleLinkError::Config(format!("Failed to parse TOML config: {}", e)))
        } else if path.ends_with(".yaml") || path.ends_with(".yml") {
            serde_yaml::from_str(&content)
                .map_err(|e| BleLinkError::Config(format!("Failed to parse YAML config: {}", e)))
        } else {
            Err(BleLinkError::Config("Unsupported config file format".to_string()))
        }
    }

    /// 環境変数で設定を上書き
    pub fn override_from_env(&mut self) {
        self.apply_overrides(|key| env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        // Bluetooth設定
        if let Some(adapter) = lookup("BLE_ADAPTER") {
            self.bluetooth.adapter = Some(adapter);
        }
        if let Some(duration) = lookup("SCAN_DURATION_MS").and_then(|v| v.parse().ok()) {
            self.bluetooth.scan_duration_ms = duration;
        }
        if let Some(interval) = lookup("SCAN_INTERVAL_SECS") {
            let interval = interval.trim().to_lowercase();
            if interval == "once" || interval == "0" {
                self.bluetooth.scan_interval_secs = None;
            } else if let Ok(secs) = interval.parse() {
                self.bluetooth.scan_interval_secs = Some(secs);
            }
        }
        if let Some(interval) = lookup("KEEPALIVE_INTERVAL_MS").and_then(|v| v.parse().ok()) {
            self.bluetooth.keepalive_interval_ms = interval;
        }

        // セッション設定
        if let Some(auto_connect) = lookup("AUTO_CONNECT") {
            self.session.auto_connect = auto_connect.to_lowercase() == "true" || auto_connect == "1";
        }
        if let Some(filter) = lookup("NAME_FILTER") {
            self.session.name_filter = Some(filter);
        }
        if let Some(state_file) = lookup("STATE_FILE") {
            self.session.state_file = Some(state_file);
        }

        // ロギング設定
        if let Some(level) = lookup("LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(output) = lookup("LOG_OUTPUT") {
            self.logging.output = output;
        }
    }

    /// 設定を検証
    pub fn validate(&self) -> Result<()> {
        if self.bluetooth.scan_duration_ms == 0 {
            return Err(BleLinkError::Config("Scan duration must be greater than 0".to_string()));
        }
        if self.bluetooth.scan_interval_secs == Some(0) {
            return Err(BleLinkError::Config(
                "Scan interval must be greater than 0 (omit it to scan once)".to_string(),
            ));
        }
        if self.bluetooth.keepalive_interval_ms == 0 || self.bluetooth.keepalive_stop_timeout_ms == 0 {
            return Err(BleLinkError::Config("Keep-alive timings must be greater than 0".to_string()));
        }
        if self.bluetooth.event_capacity == 0 {
            return Err(BleLinkError::Config("Event capacity must be greater than 0".to_string()));
        }
        if self.bluetooth.adapter.as_deref().map(str::is_empty).unwrap_or(false) {
            return Err(BleLinkError::Config("Adapter name cannot be empty".to_string()));
        }
        if self.logging.level.trim().is_empty() {
            return Err(BleLinkError::Config("Log level cannot be empty".to_string()));
        }
        if !matches!(self.logging.output.as_str(), "stdout" | "stderr") {
            return Err(BleLinkError::Config(format!(
                "Unsupported log output: {}",
                self.logging.output
            )));
        }

        Ok(())
    }

    /// 設定をファイルに保存
    pub fn save_to_file(&self, path: &str) -> Result<()> {
        let content = if path.ends_with(".json") {
            serde_json::to_string_pretty(self)
                .map_err(|e| BleLinkError::Config(format!("Failed to serialize to JSON: {}", e)))?
        } else if path.ends_with(".toml") {
            toml::to_string_pretty(self)
                .map_err(|e| BleLinkError::Config(format!("Failed to serialize to TOML: {}", e)))?
        } else if path.ends_with(".yaml") || path.ends_with(".yml") {
            serde_yaml::to_string(self)
                .map_err(|e| BleLinkError::Config(format!("Failed to serialize to YAML: {}", e)))?
        } else {
            return Err(BleLinkError::Config("Unsupported config file format".to_string()));
        };

        std::fs::write(path, content)
            .map_err(|e| BleLinkError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn temp_path(name: &str) -> String {
        std::env::temp_dir()
            .join(format!("blelink-{}-{}", std::process::id(), name))
            .to_string_lossy()
            .into_owned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.bluetooth.scan_duration_ms, 5000);
        assert_eq!(settings.bluetooth.keepalive_interval_ms, 1000);
        assert!(settings.session.auto_connect);
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("BLE_ADAPTER", "hci1"),
            ("SCAN_INTERVAL_SECS", "once"),
            ("AUTO_CONNECT", "0"),
            ("NAME_FILTER", "Sensor"),
            ("LOG_LEVEL", "debug"),
        ]
        .into_iter()
        .collect();

        let mut settings = Settings::default();
        settings.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(settings.bluetooth.adapter.as_deref(), Some("hci1"));
        assert_eq!(settings.bluetooth.scan_interval_secs, None);
        assert!(!settings.session.auto_connect);
        assert_eq!(settings.session.name_filter.as_deref(), Some("Sensor"));
        assert_eq!(settings.logging.level, "debug");
    }

    #[test]
    fn test_validation_errors() {
        let mut settings = Settings::default();
        settings.bluetooth.scan_interval_secs = Some(0);
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.logging.output = "syslog".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_file_round_trip() {
        for ext in ["json", "toml", "yaml"] {
            let path = temp_path(&format!("settings.{}", ext));
            let mut settings = Settings::default();
            settings.bluetooth.adapter = Some("hci0".to_string());
            settings.session.state_file = Some("state.json".to_string());
            settings.save_to_file(&path).unwrap();

            let loaded = Settings::from_file(&path).unwrap();
            assert_eq!(loaded.bluetooth.adapter.as_deref(), Some("hci0"));
            assert_eq!(loaded.session.state_file.as_deref(), Some("state.json"));
            assert_eq!(loaded.bluetooth.scan_interval_secs, Some(3));
            let _ = std::fs::remove_file(&path);
        }
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let path = temp_path("partial.toml");
        std::fs::write(&path, "[session]\nauto_connect = false\n").unwrap();
        let loaded = Settings::from_file(&path).unwrap();
        assert!(!loaded.session.auto_connect);
        assert_eq!(loaded.bluetooth.scan_duration_ms, 5000);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_unsupported_format() {
        assert!(Settings::default().save_to_file("settings.ini").is_err());
        assert!(Settings::from_file("settings.ini").is_err());
    }
}
