//! GATT共通型と変換処理

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::hash::{Hash, Hasher};
use ::uuid::Uuid;

use crate::error::{BleLinkError, Result};

/// キャラクタリスティック識別情報
///
/// 同一性は (サービスUUID, キャラクタリスティックUUID) の組のみで判定する。
/// ラベルは表示用で比較には使わない。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharacteristicInfo {
    pub service_uuid: Uuid,
    #[serde(rename = "char_uuid", alias = "characteristic_uuid")]
    pub characteristic_uuid: Uuid,
    pub nice_name: String,
}

impl CharacteristicInfo {
    /// 既定ラベル（既知UUIDなら名称、それ以外はUUID文字列）で作成
    pub fn new(service_uuid: Uuid, characteristic_uuid: Uuid) -> Self {
        let nice_name = uuid::well_known_name(&characteristic_uuid)
            .map(str::to_string)
            .unwrap_or_else(|| characteristic_uuid.to_string());
        CharacteristicInfo {
            service_uuid,
            characteristic_uuid,
            nice_name,
        }
    }

    /// ラベルを指定して作成
    pub fn with_label(service_uuid: Uuid, characteristic_uuid: Uuid, label: impl Into<String>) -> Self {
        CharacteristicInfo {
            service_uuid,
            characteristic_uuid,
            nice_name: label.into(),
        }
    }

    /// 同一性キー
    pub fn key(&self) -> (Uuid, Uuid) {
        (self.service_uuid, self.characteristic_uuid)
    }
}

impl PartialEq for CharacteristicInfo {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for CharacteristicInfo {}

impl Hash for CharacteristicInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl fmt::Display for CharacteristicInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}/{}]", self.nice_name, self.service_uuid, self.characteristic_uuid)
    }
}

/// キャラクタリスティックの機能
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CharacteristicCapability {
    Read,
    Write,
    Notify,
    Indicate,
}

impl CharacteristicCapability {
    pub const ALL: [CharacteristicCapability; 4] = [
        CharacteristicCapability::Read,
        CharacteristicCapability::Write,
        CharacteristicCapability::Notify,
        CharacteristicCapability::Indicate,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CharacteristicCapability::Read => "Read",
            CharacteristicCapability::Write => "Write",
            CharacteristicCapability::Notify => "Notify",
            CharacteristicCapability::Indicate => "Indicate",
        }
    }
}

impl fmt::Display for CharacteristicCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// キャラクタリスティックのプロパティ（バインディングが報告する生フラグ）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

impl CharacteristicProperties {
    /// プロパティから機能一覧を導出（宣言順）
    pub fn capabilities(&self) -> Vec<CharacteristicCapability> {
        CharacteristicCapability::ALL
            .into_iter()
            .filter(|cap| self.supports(*cap))
            .collect()
    }

    pub fn supports(&self, capability: CharacteristicCapability) -> bool {
        match capability {
            CharacteristicCapability::Read => self.read,
            CharacteristicCapability::Write => self.write || self.write_without_response,
            CharacteristicCapability::Notify => self.notify,
            CharacteristicCapability::Indicate => self.indicate,
        }
    }
}

/// バインディングが列挙したキャラクタリスティック
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicDescriptor {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
}

/// バインディングが列挙したサービス
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub uuid: Uuid,
    pub characteristics: Vec<CharacteristicDescriptor>,
}

/// デコード済みの値
///
/// JSONでは10進文字列になる（数値でも読み込める）。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodedValue {
    /// ビッグエンディアン符号なし整数
    UnsignedBe(u64),
}

impl DecodedValue {
    pub fn as_u64(&self) -> u64 {
        match self {
            DecodedValue::UnsignedBe(v) => *v,
        }
    }
}

impl fmt::Display for DecodedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodedValue::UnsignedBe(v) => write!(f, "{}", v),
        }
    }
}

impl Serialize for DecodedValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DecodedValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Number(u64),
            Text(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Number(v) => Ok(DecodedValue::UnsignedBe(v)),
            Repr::Text(s) => s
                .trim()
                .parse()
                .map(DecodedValue::UnsignedBe)
                .map_err(serde::de::Error::custom),
        }
    }
}

/// 受信値（キャラクタリスティック情報付き）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceivedValue {
    /// 送信元デバイスのアドレス
    pub device: String,
    #[serde(flatten)]
    pub info: CharacteristicInfo,
    pub data: DecodedValue,
    pub raw: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl ReceivedValue {
    /// 生バイト列から受信値を作成
    pub fn from_bytes(device: impl Into<String>, info: CharacteristicInfo, bytes: &[u8]) -> Self {
        ReceivedValue {
            device: device.into(),
            info,
            data: DecodedValue::UnsignedBe(decode_be_uint(bytes)),
            raw: bytes.to_vec(),
            received_at: Utc::now(),
        }
    }
}

/// バイト列をビッグエンディアン符号なし整数として解釈
///
/// 空のバイト列は0。8バイトを超える場合は下位8バイトが残る。
pub fn decode_be_uint(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte))
}

/// バイト列を16進文字列に変換（ログ用）
pub fn to_hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// UUID文字列をパース
///
/// 16ビット/32ビットの短縮形（"180f", "0x2a19"）はBluetooth Base UUIDに展開する。
pub fn parse_uuid(s: &str) -> Result<Uuid> {
    let trimmed = s.trim();
    let hex = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    if (hex.len() == 4 || hex.len() == 8) && hex.chars().all(|c| c.is_ascii_hexdigit()) {
        let short = u32::from_str_radix(hex, 16)
            .map_err(|e| BleLinkError::Config(format!("Invalid short UUID {}: {}", s, e)))?;
        return Ok(uuid::from_short(short));
    }

    Uuid::parse_str(trimmed).map_err(|e| BleLinkError::Config(format!("Invalid UUID {}: {}", s, e)))
}

/// 既知のGATT UUID
pub mod uuid {
    use ::uuid::Uuid;

    /// Bluetooth Base UUID (0000xxxx-0000-1000-8000-00805f9b34fb)
    const BASE: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;

    pub const GENERIC_ACCESS_SERVICE: Uuid = Uuid::from_u128(0x00001800_0000_1000_8000_00805f9b34fb);
    pub const DEVICE_INFORMATION_SERVICE: Uuid = Uuid::from_u128(0x0000180a_0000_1000_8000_00805f9b34fb);
    pub const BATTERY_SERVICE: Uuid = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);
    pub const HEART_RATE_SERVICE: Uuid = Uuid::from_u128(0x0000180d_0000_1000_8000_00805f9b34fb);

    pub const DEVICE_NAME: Uuid = Uuid::from_u128(0x00002a00_0000_1000_8000_00805f9b34fb);
    pub const BATTERY_LEVEL: Uuid = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);
    pub const MODEL_NUMBER: Uuid = Uuid::from_u128(0x00002a24_0000_1000_8000_00805f9b34fb);
    pub const MANUFACTURER_NAME: Uuid = Uuid::from_u128(0x00002a29_0000_1000_8000_00805f9b34fb);
    pub const HEART_RATE_MEASUREMENT: Uuid = Uuid::from_u128(0x00002a37_0000_1000_8000_00805f9b34fb);

    /// 短縮UUIDを128ビットに展開
    pub fn from_short(short: u32) -> Uuid {
        Uuid::from_u128(BASE | (u128::from(short) << 96))
    }

    const NAMES: &[(Uuid, &str)] = &[
        (GENERIC_ACCESS_SERVICE, "Generic Access"),
        (DEVICE_INFORMATION_SERVICE, "Device Information"),
        (BATTERY_SERVICE, "Battery Service"),
        (HEART_RATE_SERVICE, "Heart Rate"),
        (DEVICE_NAME, "Device Name"),
        (BATTERY_LEVEL, "Battery Level"),
        (MODEL_NUMBER, "Model Number"),
        (MANUFACTURER_NAME, "Manufacturer Name"),
        (HEART_RATE_MEASUREMENT, "Heart Rate Measurement"),
    ];

    /// 既知UUIDの名称
    pub fn well_known_name(uuid: &Uuid) -> Option<&'static str> {
        NAMES
            .iter()
            .find(|(known, _)| known == uuid)
            .map(|(_, name)| *name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_be_uint() {
        assert_eq!(decode_be_uint(&[0x00, 0x01]), 1);
        assert_eq!(decode_be_uint(&[0x01, 0x00]), 256);
        assert_eq!(decode_be_uint(&[]), 0);
        assert_eq!(decode_be_uint(&[0x64]), 100);
    }

    #[test]
    fn test_decode_be_uint_keeps_low_bytes() {
        let bytes = [0xAA, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01];
        assert_eq!(decode_be_uint(&bytes), 1);
    }

    #[test]
    fn test_hex_string() {
        assert_eq!(to_hex_string(&[0x00, 0xAB, 0x10]), "00ab10");
        assert_eq!(to_hex_string(&[]), "");
    }

    #[test]
    fn test_parse_short_uuid() {
        assert_eq!(parse_uuid("180f").unwrap(), uuid::BATTERY_SERVICE);
        assert_eq!(parse_uuid("0x2A19").unwrap(), uuid::BATTERY_LEVEL);
        assert_eq!(
            parse_uuid("0000180f-0000-1000-8000-00805f9b34fb").unwrap(),
            uuid::BATTERY_SERVICE
        );
        assert!(parse_uuid("not-a-uuid").is_err());
    }

    #[test]
    fn test_characteristic_info_identity_ignores_label() {
        let a = CharacteristicInfo::new(uuid::BATTERY_SERVICE, uuid::BATTERY_LEVEL);
        let b = CharacteristicInfo::with_label(uuid::BATTERY_SERVICE, uuid::BATTERY_LEVEL, "battery");
        assert_eq!(a, b);
        assert_eq!(a.nice_name, "Battery Level");

        let custom = Uuid::from_u128(0x12345678_1234_5678_1234_56789abcdef1);
        let c = CharacteristicInfo::new(uuid::BATTERY_SERVICE, custom);
        assert_eq!(c.nice_name, custom.to_string());
        assert_ne!(a, c);
    }

    #[test]
    fn test_properties_to_capabilities() {
        let props = CharacteristicProperties {
            read: true,
            notify: true,
            ..Default::default()
        };
        assert_eq!(
            props.capabilities(),
            vec![CharacteristicCapability::Read, CharacteristicCapability::Notify]
        );

        let write_only = CharacteristicProperties {
            write_without_response: true,
            ..Default::default()
        };
        assert_eq!(write_only.capabilities(), vec![CharacteristicCapability::Write]);
    }

    #[test]
    fn test_received_value_json_shape() {
        let info = CharacteristicInfo::new(uuid::BATTERY_SERVICE, uuid::BATTERY_LEVEL);
        let value = ReceivedValue::from_bytes("AA:BB:CC:DD:EE:FF", info, &[0x01, 0x00]);
        assert_eq!(value.data.as_u64(), 256);

        let json = serde_json::to_value(&value).unwrap();
        assert_eq!(json["service_uuid"], uuid::BATTERY_SERVICE.to_string());
        assert_eq!(json["char_uuid"], uuid::BATTERY_LEVEL.to_string());
        assert_eq!(json["data"], "256");
        assert_eq!(json["device"], "AA:BB:CC:DD:EE:FF");

        let back: ReceivedValue = serde_json::from_value(json).unwrap();
        assert_eq!(back.info, value.info);
        assert_eq!(back.data, DecodedValue::UnsignedBe(256));
    }

    #[test]
    fn test_decoded_value_accepts_number_or_text() {
        let from_number: DecodedValue = serde_json::from_str("42").unwrap();
        let from_text: DecodedValue = serde_json::from_str("\"42\"").unwrap();
        assert_eq!(from_number, from_text);
        assert!(serde_json::from_str::<DecodedValue>("\"forty\"").is_err());
    }
}
