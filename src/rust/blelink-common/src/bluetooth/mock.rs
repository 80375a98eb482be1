//! スクリプト可能なアダプタ実装（テスト・デモ用）
//!
//! 実機の代わりにスキャン結果・接続コールバック・通知を手動で発生させる。

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

use super::traits::{
    Adapter, AdapterProvider, EventCallback, NotificationCallback, Peripheral, ScanCallbacks,
};
use crate::error::{BleLinkError, Result};
use crate::protocol::{CharacteristicDescriptor, CharacteristicProperties, ServiceDescriptor};

type CharKey = (Uuid, Uuid);

#[derive(Default)]
struct PeripheralState {
    connectable: bool,
    connected: bool,
    auto_confirm: bool,
    fail_connect: bool,
    fail_disconnect: bool,
    services: Vec<ServiceDescriptor>,
    values: HashMap<CharKey, Vec<u8>>,
    writes: Vec<(CharKey, Vec<u8>)>,
    subscribers: HashMap<CharKey, Vec<NotificationCallback>>,
    on_connected: Option<EventCallback>,
    on_disconnected: Option<EventCallback>,
    read_gate: Option<Arc<Notify>>,
    connect_calls: usize,
    disconnect_calls: usize,
    services_calls: usize,
}

/// スクリプト可能なペリフェラル
pub struct ScriptedPeripheral {
    name: String,
    address: String,
    state: Mutex<PeripheralState>,
}

impl Debug for ScriptedPeripheral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedPeripheral")
            .field("name", &self.name)
            .field("address", &self.address)
            .finish()
    }
}

impl ScriptedPeripheral {
    /// 接続可能・接続コールバック自動発火のペリフェラルを作成
    pub fn new(name: &str, address: &str) -> Arc<Self> {
        Arc::new(ScriptedPeripheral {
            name: name.to_string(),
            address: address.to_string(),
            state: Mutex::new(PeripheralState {
                connectable: true,
                auto_confirm: true,
                ..Default::default()
            }),
        })
    }

    pub fn set_connectable(&self, connectable: bool) {
        self.state.lock().connectable = connectable;
    }

    /// スタック側で既に接続済みの状態にする（コールバックは発火しない）
    pub fn set_connected(&self, connected: bool) {
        self.state.lock().connected = connected;
    }

    /// connect()後に接続コールバックを自動で呼ぶか
    pub fn set_auto_confirm(&self, auto_confirm: bool) {
        self.state.lock().auto_confirm = auto_confirm;
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.state.lock().fail_connect = fail;
    }

    pub fn set_fail_disconnect(&self, fail: bool) {
        self.state.lock().fail_disconnect = fail;
    }

    /// サービスを追加
    pub fn add_service(&self, service: Uuid, characteristics: &[(Uuid, CharacteristicProperties)]) {
        let descriptor = ServiceDescriptor {
            uuid: service,
            characteristics: characteristics
                .iter()
                .map(|(uuid, properties)| CharacteristicDescriptor {
                    uuid: *uuid,
                    properties: *properties,
                })
                .collect(),
        };
        self.state.lock().services.push(descriptor);
    }

    /// read()が返す値を設定
    pub fn set_value(&self, service: Uuid, characteristic: Uuid, value: &[u8]) {
        self.state
            .lock()
            .values
            .insert((service, characteristic), value.to_vec());
    }

    /// read()を指定のNotifyが来るまで待たせる
    pub fn set_read_gate(&self, gate: Option<Arc<Notify>>) {
        self.state.lock().read_gate = gate;
    }

    /// 接続コールバックを手動で発火
    pub fn fire_connected(&self) {
        let callback = {
            let mut state = self.state.lock();
            state.connected = true;
            state.on_connected.clone()
        };
        if let Some(callback) = callback {
            callback();
        }
    }

    /// リモート側からの切断をシミュレート
    pub fn simulate_disconnect(&self) {
        let callback = {
            let mut state = self.state.lock();
            state.connected = false;
            state.on_disconnected.clone()
        };
        if let Some(callback) = callback {
            callback();
        }
    }

    /// 購読者へ通知を送る。届いた購読者数を返す
    pub fn push_notification(&self, service: Uuid, characteristic: Uuid, value: &[u8]) -> usize {
        let subscribers = self
            .state
            .lock()
            .subscribers
            .get(&(service, characteristic))
            .cloned()
            .unwrap_or_default();
        for callback in &subscribers {
            callback(value.to_vec());
        }
        subscribers.len()
    }

    pub fn writes(&self) -> Vec<(CharKey, Vec<u8>)> {
        self.state.lock().writes.clone()
    }

    pub fn connect_calls(&self) -> usize {
        self.state.lock().connect_calls
    }

    pub fn disconnect_calls(&self) -> usize {
        self.state.lock().disconnect_calls
    }

    pub fn services_calls(&self) -> usize {
        self.state.lock().services_calls
    }

    pub fn has_connection_callbacks(&self) -> bool {
        let state = self.state.lock();
        state.on_connected.is_some() && state.on_disconnected.is_some()
    }

    fn check_connected(&self) -> Result<()> {
        if self.state.lock().connected {
            Ok(())
        } else {
            Err(BleLinkError::OperationFailed(format!("{} is not connected", self.address)))
        }
    }
}

#[async_trait]
impl Peripheral for ScriptedPeripheral {
    fn identifier(&self) -> String {
        self.name.clone()
    }

    fn address(&self) -> String {
        self.address.clone()
    }

    async fn is_connectable(&self) -> bool {
        self.state.lock().connectable
    }

    async fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    async fn connect(&self) -> Result<()> {
        let confirm = {
            let mut state = self.state.lock();
            state.connect_calls += 1;
            if state.fail_connect {
                return Err(BleLinkError::ConnectionFailed(format!(
                    "{} refused the connection",
                    self.address
                )));
            }
            state.auto_confirm
        };
        if confirm {
            self.fire_connected();
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.disconnect_calls += 1;
            if state.fail_disconnect {
                return Err(BleLinkError::DisconnectFailed(format!(
                    "{} did not acknowledge",
                    self.address
                )));
            }
        }
        self.simulate_disconnect();
        Ok(())
    }

    async fn services(&self) -> Result<Vec<ServiceDescriptor>> {
        self.check_connected()?;
        let mut state = self.state.lock();
        state.services_calls += 1;
        Ok(state.services.clone())
    }

    async fn read(&self, service: Uuid, characteristic: Uuid) -> Result<Vec<u8>> {
        self.check_connected()?;
        let gate = self.state.lock().read_gate.clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.state
            .lock()
            .values
            .get(&(service, characteristic))
            .cloned()
            .ok_or_else(|| BleLinkError::OperationFailed(format!("{} not found", characteristic)))
    }

    async fn write_command(&self, service: Uuid, characteristic: Uuid, data: &[u8]) -> Result<()> {
        self.check_connected()?;
        self.state
            .lock()
            .writes
            .push(((service, characteristic), data.to_vec()));
        Ok(())
    }

    async fn subscribe(
        &self,
        service: Uuid,
        characteristic: Uuid,
        callback: NotificationCallback,
    ) -> Result<()> {
        self.check_connected()?;
        self.state
            .lock()
            .subscribers
            .entry((service, characteristic))
            .or_default()
            .push(callback);
        Ok(())
    }

    fn set_connection_callbacks(&self, on_connected: EventCallback, on_disconnected: EventCallback) {
        let mut state = self.state.lock();
        state.on_connected = Some(on_connected);
        state.on_disconnected = Some(on_disconnected);
    }
}

/// スクリプト可能なアダプタ
pub struct ScriptedAdapter {
    identifier: String,
    address: String,
    results: Mutex<Vec<Arc<ScriptedPeripheral>>>,
    callbacks: Mutex<ScanCallbacks>,
    fail_scan: Mutex<bool>,
    scan_passes: Mutex<usize>,
}

impl Debug for ScriptedAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedAdapter")
            .field("identifier", &self.identifier)
            .field("address", &self.address)
            .finish()
    }
}

impl ScriptedAdapter {
    pub fn new(identifier: &str, address: &str) -> Arc<Self> {
        Arc::new(ScriptedAdapter {
            identifier: identifier.to_string(),
            address: address.to_string(),
            results: Mutex::new(Vec::new()),
            callbacks: Mutex::new(ScanCallbacks::default()),
            fail_scan: Mutex::new(false),
            scan_passes: Mutex::new(0),
        })
    }

    /// 次のスキャンで返す結果を設定
    pub fn set_results(&self, peripherals: Vec<Arc<ScriptedPeripheral>>) {
        *self.results.lock() = peripherals;
    }

    pub fn set_fail_scan(&self, fail: bool) {
        *self.fail_scan.lock() = fail;
    }

    pub fn scan_passes(&self) -> usize {
        *self.scan_passes.lock()
    }

    pub fn has_scan_callbacks(&self) -> bool {
        let callbacks = self.callbacks.lock();
        callbacks.on_scan_start.is_some() && callbacks.on_scan_stop.is_some()
    }
}

#[async_trait]
impl Adapter for ScriptedAdapter {
    fn identifier(&self) -> String {
        self.identifier.clone()
    }

    fn address(&self) -> String {
        self.address.clone()
    }

    fn set_scan_callbacks(&self, callbacks: ScanCallbacks) {
        *self.callbacks.lock() = callbacks;
    }

    async fn start_scan(&self) -> Result<()> {
        if *self.fail_scan.lock() {
            return Err(BleLinkError::OperationFailed("scan refused by adapter".to_string()));
        }
        *self.scan_passes.lock() += 1;
        let on_start = self.callbacks.lock().on_scan_start.clone();
        if let Some(callback) = on_start {
            callback();
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        let on_stop = self.callbacks.lock().on_scan_stop.clone();
        if let Some(callback) = on_stop {
            callback();
        }
        Ok(())
    }

    async fn scan_results(&self) -> Result<Vec<Arc<dyn Peripheral>>> {
        Ok(self
            .results
            .lock()
            .iter()
            .map(|p| Arc::clone(p) as Arc<dyn Peripheral>)
            .collect())
    }

    /// 待たずに結果を報告する
    async fn scan_for(&self, _duration: Duration) -> Result<()> {
        self.start_scan().await?;
        let on_found = self.callbacks.lock().on_scan_found.clone();
        if let Some(callback) = on_found {
            let results = self.results.lock().clone();
            for peripheral in results {
                callback(peripheral as Arc<dyn Peripheral>);
            }
        }
        self.stop_scan().await
    }
}

/// スクリプト可能なアダプタ一覧
pub struct ScriptedProvider {
    radio_enabled: bool,
    adapters: Vec<Arc<ScriptedAdapter>>,
}

impl ScriptedProvider {
    pub fn new(adapters: Vec<Arc<ScriptedAdapter>>) -> Arc<Self> {
        Arc::new(ScriptedProvider {
            radio_enabled: true,
            adapters,
        })
    }

    pub fn radio_disabled() -> Arc<Self> {
        Arc::new(ScriptedProvider {
            radio_enabled: false,
            adapters: Vec::new(),
        })
    }
}

#[async_trait]
impl AdapterProvider for ScriptedProvider {
    async fn is_radio_enabled(&self) -> bool {
        self.radio_enabled
    }

    async fn list_adapters(&self) -> Result<Vec<Arc<dyn Adapter>>> {
        Ok(self
            .adapters
            .iter()
            .map(|a| Arc::clone(a) as Arc<dyn Adapter>)
            .collect())
    }
}
