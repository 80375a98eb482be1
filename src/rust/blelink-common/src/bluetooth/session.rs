//! デバイスセッション（現在のデバイス選択とゴースト復帰）
//!
//! レジストリのイベントを監視し、前回使用したデバイスが再び見つかったら
//! 自動で選択し直す。接続完了時にはインベントリを作り直す。

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::device::{BleDevice, DeviceEventKind};
use super::inventory::CharacteristicInventory;
use super::manager::{BleDeviceManager, RegistryEvent};
use super::traits::DeviceInfo;
use crate::config::SessionConfig;
use crate::error::{BleLinkError, Result};
use crate::protocol::{CharacteristicCapability, CharacteristicInfo, ReceivedValue};

const PUMP_STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// 永続化されるセッション状態
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    /// 前回選択したデバイスのアドレス
    pub last_device_id: Option<String>,
}

impl SessionState {
    /// ファイルから読み込む。ファイルがなければ空の状態
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

struct Pump {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Pump {
    async fn stop(mut self) {
        self.token.cancel();
        if tokio::time::timeout(PUMP_STOP_TIMEOUT, &mut self.handle).await.is_err() {
            self.handle.abort();
        }
    }
}

/// 利用者向けのセッション
pub struct BleSession {
    manager: Arc<BleDeviceManager>,
    config: SessionConfig,
    runtime: Handle,
    current: Mutex<Option<Arc<BleDevice>>>,
    last_device_id: Mutex<Option<String>>,
    inventory: RwLock<CharacteristicInventory>,
    data: broadcast::Sender<ReceivedValue>,
    connected: AtomicBool,
    registry_pump: Mutex<Option<Pump>>,
    device_pump: Mutex<Option<Pump>>,
    /// 選択の確認と切り替えを一続きにする
    selection: AsyncMutex<()>,
}

impl BleSession {
    pub fn new(manager: Arc<BleDeviceManager>, config: SessionConfig, state: SessionState) -> Result<Arc<Self>> {
        let runtime = Handle::try_current()
            .map_err(|e| BleLinkError::Other(format!("Session needs a tokio runtime: {}", e)))?;
        let (data, _) = broadcast::channel(manager.config().event_capacity.max(1));
        Ok(Arc::new(BleSession {
            manager,
            config,
            runtime,
            current: Mutex::new(None),
            last_device_id: Mutex::new(state.last_device_id),
            inventory: RwLock::new(CharacteristicInventory::new()),
            data,
            connected: AtomicBool::new(false),
            registry_pump: Mutex::new(None),
            device_pump: Mutex::new(None),
            selection: AsyncMutex::new(()),
        }))
    }

    /// レジストリの監視を開始する。登録済みのデバイスも照合する
    pub async fn start(self: &Arc<Self>) {
        let mut registry = self.manager.subscribe();
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let weak = Arc::downgrade(self);

        let handle = self.runtime.spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancelled.cancelled() => break,
                    event = registry.recv() => event,
                };
                let Some(session) = weak.upgrade() else {
                    break;
                };
                match event {
                    Ok(RegistryEvent::DeviceAdded(info)) => session.on_device_added(info).await,
                    Ok(RegistryEvent::DeviceRemoved(info)) => session.on_device_removed(&info.address).await,
                    Err(RecvError::Lagged(skipped)) => warn!("Session missed {} registry event(s)", skipped),
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Registry pump stopped");
        });

        let previous = self.registry_pump.lock().replace(Pump { token, handle });
        if let Some(previous) = previous {
            previous.stop().await;
        }

        for info in self.manager.device_infos().await {
            self.on_device_added(info).await;
        }
    }

    fn candidate(&self, info: &DeviceInfo) -> Option<bool> {
        let last = self.last_device_id.lock().clone();
        match last {
            Some(last) if last == info.address => Some(false),
            Some(_) => None,
            None => {
                let filter = self.config.name_filter.as_deref()?;
                if info.name.contains(filter) {
                    Some(true)
                } else {
                    None
                }
            }
        }
    }

    async fn on_device_added(self: &Arc<Self>, info: DeviceInfo) {
        let device = {
            let _selection = self.selection.lock().await;
            if self.current.lock().is_some() {
                return;
            }
            let Some(remember) = self.candidate(&info) else {
                return;
            };

            info!("Restoring session device {}", info.description);
            match self.select_inner(&info.address, remember).await {
                Ok(device) => device,
                Err(e) => {
                    warn!("Could not restore {}: {}", info.address, e);
                    return;
                }
            }
        };
        if self.config.auto_connect {
            device.open().await;
        }
    }

    async fn on_device_removed(&self, address: &str) {
        let removed = {
            let mut current = self.current.lock();
            if current.as_ref().map(|d| d.address() == address).unwrap_or(false) {
                current.take()
            } else {
                None
            }
        };
        if removed.is_none() {
            return;
        }

        info!("Session device {} is gone", address);
        self.connected.store(false, Ordering::SeqCst);
        self.inventory.write().remove_device(address);
        let pump = self.device_pump.lock().take();
        if let Some(pump) = pump {
            pump.stop().await;
        }
    }

    /// デバイスを選択し、前回のデバイスとして記録する
    pub async fn select_device(self: &Arc<Self>, address: &str) -> Result<Arc<BleDevice>> {
        let device = {
            let _selection = self.selection.lock().await;
            self.select_inner(address, true).await?
        };
        if self.config.auto_connect {
            device.open().await;
        }
        Ok(device)
    }

    async fn select_inner(self: &Arc<Self>, address: &str, remember: bool) -> Result<Arc<BleDevice>> {
        let device = self
            .manager
            .lookup(address)
            .await
            .ok_or_else(|| BleLinkError::DeviceNotFound(address.to_string()))?;

        let previous = self.current.lock().replace(Arc::clone(&device));
        if let Some(previous) = previous {
            if previous.address() != address {
                self.release_current(&previous).await;
            }
        }

        if remember {
            *self.last_device_id.lock() = Some(address.to_string());
            self.persist();
        }

        self.start_device_pump(&device).await;
        let connected = device.state() == super::device::ConnectionState::Connected;
        self.connected.store(connected, Ordering::SeqCst);
        if connected {
            self.rebuild_inventory(&device).await;
        }
        info!("Selected device {}", device.description());
        Ok(device)
    }

    async fn release_current(&self, device: &BleDevice) {
        let pump = self.device_pump.lock().take();
        if let Some(pump) = pump {
            pump.stop().await;
        }
        device.close().await;
        self.inventory.write().remove_device(device.address());
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn start_device_pump(self: &Arc<Self>, device: &Arc<BleDevice>) {
        let mut events = device.subscribe_events();
        let mut values = device.subscribe_data();
        let forward = self.data.clone();
        let address = device.address().to_string();
        let weak: Weak<Self> = Arc::downgrade(self);
        let token = CancellationToken::new();
        let cancelled = token.clone();

        let handle = self.runtime.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => {
                            let Some(session) = weak.upgrade() else {
                                break;
                            };
                            if !session.on_device_event(&address, event.kind).await {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => warn!("{} missed {} event(s)", address, skipped),
                        Err(RecvError::Closed) => break,
                    },
                    value = values.recv() => match value {
                        Ok(value) => {
                            let _ = forward.send(value);
                        }
                        Err(RecvError::Lagged(skipped)) => warn!("{} dropped {} value(s)", address, skipped),
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            debug!("Device pump for {} stopped", address);
        });

        let previous = self.device_pump.lock().replace(Pump { token, handle });
        if let Some(previous) = previous {
            previous.stop().await;
        }
    }

    /// デバイスイベントの処理。falseで監視を終える
    async fn on_device_event(&self, address: &str, kind: DeviceEventKind) -> bool {
        let device = self.current.lock().clone();
        let Some(device) = device.filter(|d| d.address() == address) else {
            return false;
        };

        match kind {
            DeviceEventKind::Opened => {
                self.connected.store(true, Ordering::SeqCst);
                self.rebuild_inventory(&device).await;
                if self.config.subscribe_on_connect {
                    self.subscribe_all(&device).await;
                }
            }
            DeviceEventKind::Closed | DeviceEventKind::Disconnected => {
                self.connected.store(false, Ordering::SeqCst);
            }
            DeviceEventKind::Connected => {}
            DeviceEventKind::Removed => {
                {
                    let mut current = self.current.lock();
                    if current.as_ref().map(|d| d.address() == address).unwrap_or(false) {
                        current.take();
                    }
                }
                self.connected.store(false, Ordering::SeqCst);
                self.inventory.write().remove_device(address);
                return false;
            }
        }
        true
    }

    async fn rebuild_inventory(&self, device: &BleDevice) {
        match device.services().await {
            Ok(services) => {
                let mut inventory = self.inventory.write();
                let node = inventory.record(device.address(), device.name(), &services);
                info!(
                    "Inventory of {}: {} service(s), capabilities: {}",
                    device.description(),
                    node.services.len(),
                    node.summary
                );
            }
            Err(e) => warn!("Inventory of {} failed: {}", device.address(), e),
        }
    }

    async fn subscribe_all(&self, device: &BleDevice) {
        let entries = self.inventory.read().entries_for(device.address());
        for entry in entries.iter().filter(|e| {
            matches!(
                e.capability,
                CharacteristicCapability::Notify | CharacteristicCapability::Indicate
            )
        }) {
            entry.invoke(device, &[]).await;
        }
    }

    /// 現在のデバイスを切断し、前回のデバイスの記録も消す
    pub async fn detach_device(&self) {
        let device = self.current.lock().take();
        if let Some(device) = device {
            info!("Detaching {}", device.description());
            self.release_current(&device).await;
        }
        *self.last_device_id.lock() = None;
        self.persist();
    }

    fn current_or_err(&self) -> Result<Arc<BleDevice>> {
        self.current
            .lock()
            .clone()
            .ok_or_else(|| BleLinkError::DeviceNotFound("no device selected".to_string()))
    }

    pub async fn connect(&self) -> Result<()> {
        self.current_or_err()?.try_open().await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.current_or_err()?.try_close().await
    }

    /// インベントリのエントリを実行する
    pub async fn trigger(
        &self,
        info: &CharacteristicInfo,
        capability: CharacteristicCapability,
        payload: &[u8],
    ) -> Result<()> {
        let device = self.current_or_err()?;
        let entry = self
            .inventory
            .read()
            .find_entry(device.address(), info, capability)
            .cloned()
            .ok_or_else(|| {
                BleLinkError::OperationFailed(format!("{} does not support {}", info.nice_name, capability))
            })?;
        entry.trigger(&device, payload).await
    }

    pub fn current_device(&self) -> Option<Arc<BleDevice>> {
        self.current.lock().clone()
    }

    pub fn inventory(&self) -> CharacteristicInventory {
        self.inventory.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SessionState {
        SessionState {
            last_device_id: self.last_device_id.lock().clone(),
        }
    }

    pub fn subscribe_data(&self) -> broadcast::Receiver<ReceivedValue> {
        self.data.subscribe()
    }

    fn persist(&self) {
        let Some(path) = self.config.state_file.as_deref() else {
            return;
        };
        if let Err(e) = self.state().save(path) {
            warn!("Failed to save session state to {}: {}", path, e);
        }
    }

    /// 監視を止めて状態を保存する（デバイスの切断はマネージャーが行う）
    pub async fn shutdown(&self) {
        let registry = self.registry_pump.lock().take();
        if let Some(pump) = registry {
            pump.stop().await;
        }
        let device = self.device_pump.lock().take();
        if let Some(pump) = device {
            pump.stop().await;
        }
        self.persist();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::mock::{ScriptedAdapter, ScriptedPeripheral, ScriptedProvider};
    use crate::bluetooth::traits::Peripheral;
    use crate::config::BluetoothConfig;
    use crate::protocol::{uuid, CharacteristicProperties};

    fn bluetooth_config() -> BluetoothConfig {
        BluetoothConfig {
            scan_duration_ms: 10,
            scan_interval_secs: None,
            keepalive_interval_ms: 10,
            keepalive_stop_timeout_ms: 200,
            ..Default::default()
        }
    }

    async fn manager() -> Arc<BleDeviceManager> {
        let adapter = ScriptedAdapter::new("hci0", "00:01");
        let manager = BleDeviceManager::new(ScriptedProvider::new(vec![adapter]), bluetooth_config()).unwrap();
        manager.initialize().await.unwrap();
        manager
    }

    fn sensor(address: &str) -> Arc<ScriptedPeripheral> {
        let peripheral = ScriptedPeripheral::new("Sensor", address);
        peripheral.add_service(
            uuid::BATTERY_SERVICE,
            &[(
                uuid::BATTERY_LEVEL,
                CharacteristicProperties {
                    read: true,
                    notify: true,
                    ..Default::default()
                },
            )],
        );
        peripheral.set_value(uuid::BATTERY_SERVICE, uuid::BATTERY_LEVEL, &[0x50]);
        peripheral
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    fn temp_state_file(name: &str) -> String {
        std::env::temp_dir()
            .join(format!("blelink-session-{}-{}.json", std::process::id(), name))
            .to_string_lossy()
            .into_owned()
    }

    #[tokio::test]
    async fn test_ghost_device_is_restored_and_connected() {
        let manager = manager().await;
        let state = SessionState {
            last_device_id: Some("AA:01".to_string()),
        };
        let session = BleSession::new(Arc::clone(&manager), SessionConfig::default(), state).unwrap();
        session.start().await;

        let other = ScriptedPeripheral::new("Other", "BB:01");
        let peripheral = sensor("AA:01");
        manager.add_device(Arc::clone(&other) as Arc<dyn Peripheral>).await;
        manager.add_device(Arc::clone(&peripheral) as Arc<dyn Peripheral>).await;
        settle().await;

        let current = session.current_device().unwrap();
        assert_eq!(current.address(), "AA:01");
        assert!(session.is_connected());
        assert_eq!(session.inventory().entries_for("AA:01").len(), 2);
        assert_eq!(other.connect_calls(), 0);
        session.shutdown().await;
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_ghost_device_already_registered() {
        let manager = manager().await;
        let peripheral = sensor("AA:02");
        manager.add_device(Arc::clone(&peripheral) as Arc<dyn Peripheral>).await;

        let config = SessionConfig {
            auto_connect: false,
            ..Default::default()
        };
        let state = SessionState {
            last_device_id: Some("AA:02".to_string()),
        };
        let session = BleSession::new(Arc::clone(&manager), config, state).unwrap();
        session.start().await;

        assert_eq!(session.current_device().unwrap().address(), "AA:02");
        assert!(!session.is_connected());
        assert_eq!(peripheral.connect_calls(), 0);

        session.connect().await.unwrap();
        settle().await;
        assert!(session.is_connected());
        assert_eq!(session.inventory().entries_for("AA:02").len(), 2);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_name_filter_selects_and_remembers() {
        let manager = manager().await;
        let config = SessionConfig {
            auto_connect: false,
            name_filter: Some("Sens".to_string()),
            ..Default::default()
        };
        let session = BleSession::new(Arc::clone(&manager), config, SessionState::default()).unwrap();
        session.start().await;

        manager
            .add_device(ScriptedPeripheral::new("Beacon", "CC:01") as Arc<dyn Peripheral>)
            .await;
        manager.add_device(sensor("AA:03") as Arc<dyn Peripheral>).await;
        settle().await;

        assert_eq!(session.current_device().unwrap().address(), "AA:03");
        assert_eq!(session.state().last_device_id.as_deref(), Some("AA:03"));
    }

    #[tokio::test]
    async fn test_select_and_detach_persist_state() {
        let manager = manager().await;
        let path = temp_state_file("select");
        let config = SessionConfig {
            state_file: Some(path.clone()),
            ..Default::default()
        };
        let peripheral = sensor("AA:04");
        manager.add_device(Arc::clone(&peripheral) as Arc<dyn Peripheral>).await;
        let session = BleSession::new(Arc::clone(&manager), config, SessionState::default()).unwrap();

        let device = session.select_device("AA:04").await.unwrap();
        settle().await;
        assert!(session.is_connected());
        assert_eq!(
            SessionState::load(&path).unwrap().last_device_id.as_deref(),
            Some("AA:04")
        );

        session.detach_device().await;
        assert!(session.current_device().is_none());
        assert!(!session.is_connected());
        assert_eq!(device.state(), crate::bluetooth::device::ConnectionState::Disconnected);
        assert_eq!(SessionState::load(&path).unwrap(), SessionState::default());
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_removed_device_clears_selection_keeps_identity() {
        let manager = manager().await;
        manager.add_device(sensor("AA:05") as Arc<dyn Peripheral>).await;
        let session = BleSession::new(Arc::clone(&manager), SessionConfig::default(), SessionState::default()).unwrap();
        session.start().await;
        session.select_device("AA:05").await.unwrap();
        settle().await;

        manager.reconcile_scan(Vec::new()).await;
        settle().await;

        assert!(session.current_device().is_none());
        assert!(!session.is_connected());
        assert_eq!(session.state().last_device_id.as_deref(), Some("AA:05"));
        assert!(session.inventory().device("AA:05").is_none());
    }

    #[tokio::test]
    async fn test_subscribe_on_connect_forwards_values() {
        let manager = manager().await;
        let peripheral = sensor("AA:06");
        manager.add_device(Arc::clone(&peripheral) as Arc<dyn Peripheral>).await;
        let config = SessionConfig {
            subscribe_on_connect: true,
            ..Default::default()
        };
        let session = BleSession::new(Arc::clone(&manager), config, SessionState::default()).unwrap();
        let mut data = session.subscribe_data();

        session.select_device("AA:06").await.unwrap();
        settle().await;
        peripheral.push_notification(uuid::BATTERY_SERVICE, uuid::BATTERY_LEVEL, &[0x00, 0x2a]);
        settle().await;

        let value = data.try_recv().unwrap();
        assert_eq!(value.data.as_u64(), 42);
        assert_eq!(value.device, "AA:06");

        let info = CharacteristicInfo::new(uuid::BATTERY_SERVICE, uuid::BATTERY_LEVEL);
        session
            .trigger(&info, CharacteristicCapability::Read, &[])
            .await
            .unwrap();
        settle().await;
        assert_eq!(data.try_recv().unwrap().data.as_u64(), 0x50);
        assert!(session
            .trigger(&info, CharacteristicCapability::Write, &[0x01])
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_data_channel_uses_configured_capacity() {
        let adapter = ScriptedAdapter::new("hci0", "00:01");
        let config = BluetoothConfig {
            event_capacity: 2,
            ..bluetooth_config()
        };
        let manager = BleDeviceManager::new(ScriptedProvider::new(vec![adapter]), config).unwrap();
        manager.initialize().await.unwrap();
        let peripheral = sensor("AA:08");
        manager.add_device(Arc::clone(&peripheral) as Arc<dyn Peripheral>).await;

        let session = BleSession::new(Arc::clone(&manager), SessionConfig::default(), SessionState::default()).unwrap();
        let mut data = session.subscribe_data();
        session.select_device("AA:08").await.unwrap();
        settle().await;

        let info = CharacteristicInfo::new(uuid::BATTERY_SERVICE, uuid::BATTERY_LEVEL);
        for _ in 0..3 {
            session
                .trigger(&info, CharacteristicCapability::Read, &[])
                .await
                .unwrap();
            settle().await;
        }

        // 容量2に3件送られたので最古の1件が落ちる
        assert!(matches!(data.try_recv(), Err(broadcast::error::TryRecvError::Lagged(1))));
        assert_eq!(data.try_recv().unwrap().data.as_u64(), 0x50);
        session.shutdown().await;
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_ghost_restore_selects_once() {
        let manager = manager().await;
        let peripheral = sensor("AA:09");
        let device = manager.add_device(Arc::clone(&peripheral) as Arc<dyn Peripheral>).await;
        device.open().await;

        let config = SessionConfig {
            auto_connect: false,
            ..Default::default()
        };
        let state = SessionState {
            last_device_id: Some("AA:09".to_string()),
        };
        let session = BleSession::new(Arc::clone(&manager), config, state).unwrap();

        // 登録済みデバイスの照合とレジストリ通知が重なる
        let info = device.info();
        tokio::join!(session.on_device_added(info.clone()), session.on_device_added(info));
        settle().await;

        assert_eq!(session.current_device().unwrap().address(), "AA:09");
        assert_eq!(peripheral.services_calls(), 1);
        assert_eq!(session.inventory().entries_for("AA:09").len(), 2);
        session.shutdown().await;
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_operations_without_selection() {
        let manager = manager().await;
        let session = BleSession::new(manager, SessionConfig::default(), SessionState::default()).unwrap();
        assert!(matches!(
            session.select_device("ZZ:99").await,
            Err(BleLinkError::DeviceNotFound(_))
        ));
        assert!(session.connect().await.is_err());
        assert!(session.disconnect().await.is_err());
    }

    #[test]
    fn test_state_file_round_trip() {
        let path = temp_state_file("roundtrip");
        assert_eq!(SessionState::load(&path).unwrap(), SessionState::default());

        let state = SessionState {
            last_device_id: Some("AA:BB".to_string()),
        };
        state.save(&path).unwrap();
        assert_eq!(SessionState::load(&path).unwrap(), state);
        let _ = std::fs::remove_file(&path);
    }
}
