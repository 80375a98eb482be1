//! キャラクタリスティック機能インベントリ
//!
//! 接続済みデバイスのサービス/キャラクタリスティックを列挙し、
//! 機能ごとに実行可能なエントリとして記録する。
//! ツリー構造: デバイス → サービス → キャラクタリスティック → 機能エントリ

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::device::BleDevice;
use crate::error::Result;
use crate::protocol::{uuid as gatt, CharacteristicCapability, CharacteristicInfo, ServiceDescriptor};

/// 機能エントリ（1キャラクタリスティックの1機能）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapabilityEntry {
    pub info: CharacteristicInfo,
    pub capability: CharacteristicCapability,
}

impl CapabilityEntry {
    /// エントリに対応する操作を実行する
    ///
    /// Readは読み取り、Writeは `payload` の書き込み、Notify/Indicateは購読。
    pub async fn trigger(&self, device: &BleDevice, payload: &[u8]) -> Result<()> {
        match self.capability {
            CharacteristicCapability::Read => device.try_read_characteristic(&self.info).await.map(|_| ()),
            CharacteristicCapability::Write => device.try_write_characteristic(&self.info, payload).await,
            CharacteristicCapability::Notify | CharacteristicCapability::Indicate => {
                device.try_notify_characteristic(&self.info).await
            }
        }
    }

    /// 操作を実行する（失敗はログのみ）
    pub async fn invoke(&self, device: &BleDevice, payload: &[u8]) {
        if let Err(e) = self.trigger(device, payload).await {
            warn!("{} {} failed: {}", self.capability, self.info.nice_name, e);
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CharacteristicNode {
    pub info: CharacteristicInfo,
    pub entries: Vec<CapabilityEntry>,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceNode {
    pub uuid: Uuid,
    pub label: String,
    pub characteristics: Vec<CharacteristicNode>,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceNode {
    pub address: String,
    pub name: String,
    pub services: Vec<ServiceNode>,
    pub summary: String,
}

impl DeviceNode {
    /// 全エントリ（列挙順）
    pub fn entries(&self) -> Vec<CapabilityEntry> {
        self.services
            .iter()
            .flat_map(|s| s.characteristics.iter())
            .flat_map(|c| c.entries.iter().cloned())
            .collect()
    }
}

/// インベントリ本体
#[derive(Debug, Clone, Default, Serialize)]
pub struct CharacteristicInventory {
    devices: Vec<DeviceNode>,
}

impl CharacteristicInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// 接続済みデバイスを列挙して記録する
    pub async fn inventory_device(&mut self, device: &BleDevice) -> Result<&DeviceNode> {
        let services = device.services().await?;
        info!(
            "Inventory of {}: {} service(s)",
            device.description(),
            services.len()
        );
        Ok(self.record(device.address(), device.name(), &services))
    }

    /// 列挙結果を記録する。同じ内容で何度呼んでもエントリは重複しない
    pub fn record(&mut self, address: &str, name: &str, services: &[ServiceDescriptor]) -> &DeviceNode {
        let device_index = match self.devices.iter().position(|d| d.address == address) {
            Some(index) => index,
            None => {
                self.devices.push(DeviceNode {
                    address: address.to_string(),
                    name: name.to_string(),
                    services: Vec::new(),
                    summary: String::new(),
                });
                self.devices.len() - 1
            }
        };
        let device_node = &mut self.devices[device_index];

        for service in services {
            let service_index = match device_node.services.iter().position(|s| s.uuid == service.uuid) {
                Some(index) => index,
                None => {
                    device_node.services.push(ServiceNode {
                        uuid: service.uuid,
                        label: gatt::well_known_name(&service.uuid)
                            .map(str::to_string)
                            .unwrap_or_else(|| service.uuid.to_string()),
                        characteristics: Vec::new(),
                        summary: String::new(),
                    });
                    device_node.services.len() - 1
                }
            };
            let service_node = &mut device_node.services[service_index];

            for characteristic in &service.characteristics {
                let info = CharacteristicInfo::new(service.uuid, characteristic.uuid);
                let char_index = match service_node.characteristics.iter().position(|c| c.info == info) {
                    Some(index) => index,
                    None => {
                        service_node.characteristics.push(CharacteristicNode {
                            info: info.clone(),
                            entries: Vec::new(),
                            summary: String::new(),
                        });
                        service_node.characteristics.len() - 1
                    }
                };
                let char_node = &mut service_node.characteristics[char_index];

                for capability in characteristic.properties.capabilities() {
                    if char_node.entries.iter().any(|e| e.capability == capability) {
                        continue;
                    }
                    debug!("{}: {} {}", address, capability, info.nice_name);
                    char_node.entries.push(CapabilityEntry {
                        info: info.clone(),
                        capability,
                    });
                }
                char_node.summary = summarize(char_node.entries.iter().map(|e| e.capability));
            }
            service_node.summary = summarize(
                service_node
                    .characteristics
                    .iter()
                    .flat_map(|c| c.entries.iter().map(|e| e.capability)),
            );
        }
        device_node.summary = summarize(
            device_node
                .services
                .iter()
                .flat_map(|s| s.characteristics.iter())
                .flat_map(|c| c.entries.iter().map(|e| e.capability)),
        );

        &self.devices[device_index]
    }

    pub fn devices(&self) -> &[DeviceNode] {
        &self.devices
    }

    pub fn device(&self, address: &str) -> Option<&DeviceNode> {
        self.devices.iter().find(|d| d.address == address)
    }

    /// デバイスの全エントリ
    pub fn entries_for(&self, address: &str) -> Vec<CapabilityEntry> {
        self.device(address).map(DeviceNode::entries).unwrap_or_default()
    }

    /// 指定機能のエントリを検索
    pub fn find_entry(
        &self,
        address: &str,
        info: &CharacteristicInfo,
        capability: CharacteristicCapability,
    ) -> Option<&CapabilityEntry> {
        self.device(address)?
            .services
            .iter()
            .find(|s| s.uuid == info.service_uuid)?
            .characteristics
            .iter()
            .find(|c| &c.info == info)?
            .entries
            .iter()
            .find(|e| e.capability == capability)
    }

    pub fn remove_device(&mut self, address: &str) -> bool {
        let before = self.devices.len();
        self.devices.retain(|d| d.address != address);
        before != self.devices.len()
    }

    pub fn clear(&mut self) {
        self.devices.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// 機能一覧を宣言順・重複なしで "Read, Notify" 形式にする
fn summarize(capabilities: impl Iterator<Item = CharacteristicCapability>) -> String {
    let present: Vec<CharacteristicCapability> = capabilities.collect();
    CharacteristicCapability::ALL
        .iter()
        .filter(|cap| present.contains(cap))
        .map(|cap| cap.name())
        .collect::<Vec<_>>()
        .join(", ")
}
