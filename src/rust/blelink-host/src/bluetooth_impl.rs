//! btleplugによるアダプタバインディング

use async_trait::async_trait;
use btleplug::api::{
    BDAddr, Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter,
    WriteType,
};
use btleplug::platform::{Adapter as PlatformAdapter, Manager, Peripheral as PlatformPeripheral, PeripheralId};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::fmt::{self, Debug};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};
use uuid::Uuid;

use blelink_common::bluetooth::{
    Adapter, AdapterProvider, EventCallback, NotificationCallback, Peripheral, ScanCallbacks,
};
use blelink_common::protocol::{CharacteristicDescriptor, CharacteristicProperties, ServiceDescriptor};
use blelink_common::{BleLinkError, Result};

use crate::platform::HostPlatform;

/// 接続/切断コールバック（ペリフェラルID単位）
#[derive(Clone)]
struct ConnectionHandlers {
    on_connected: EventCallback,
    on_disconnected: EventCallback,
}

/// ペリフェラルIDごとのフック。同じIDのラッパー間で共有する
#[derive(Default)]
struct Hooks {
    handlers: HashMap<PeripheralId, ConnectionHandlers>,
    notification_tasks: HashMap<PeripheralId, Vec<JoinHandle<()>>>,
}

impl Hooks {
    fn abort_notifications(&mut self, id: &PeripheralId) {
        if let Some(tasks) = self.notification_tasks.remove(id) {
            for task in tasks {
                task.abort();
            }
        }
    }
}

type SharedHooks = Arc<Mutex<Hooks>>;

fn bt_error(context: &str, e: btleplug::Error) -> BleLinkError {
    BleLinkError::OperationFailed(format!("{}: {}", context, e))
}

/// btleplugのアダプタ一覧
pub struct BtleProvider {
    manager: Manager,
}

impl BtleProvider {
    pub async fn new() -> Result<Self> {
        info!("Creating Bluetooth manager...");
        let manager = Manager::new().await.map_err(|e| {
            error!("Failed to create BT manager: {}", e);
            BleLinkError::NoAdapterAvailable(format!("Failed to create BT manager: {}", e))
        })?;
        Ok(BtleProvider { manager })
    }
}

#[async_trait]
impl AdapterProvider for BtleProvider {
    async fn is_radio_enabled(&self) -> bool {
        HostPlatform::check_bluetooth_available().await
    }

    async fn list_adapters(&self) -> Result<Vec<Arc<dyn Adapter>>> {
        let adapters = self
            .manager
            .adapters()
            .await
            .map_err(|e| BleLinkError::NoAdapterAvailable(format!("Failed to get adapters: {}", e)))?;

        let mut result: Vec<Arc<dyn Adapter>> = Vec::with_capacity(adapters.len());
        for adapter in adapters {
            result.push(BtleAdapter::new(adapter).await?);
        }
        Ok(result)
    }
}

/// btleplugのアダプタ
pub struct BtleAdapter {
    adapter: PlatformAdapter,
    identifier: String,
    info: String,
    callbacks: Arc<Mutex<ScanCallbacks>>,
    hooks: SharedHooks,
    event_pump: JoinHandle<()>,
}

impl Debug for BtleAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BtleAdapter")
            .field("identifier", &self.identifier)
            .field("info", &self.info)
            .finish()
    }
}

impl BtleAdapter {
    /// アダプタをラップし、セントラルイベントの配送を開始する
    pub async fn new(adapter: PlatformAdapter) -> Result<Arc<Self>> {
        let info = adapter
            .adapter_info()
            .await
            .unwrap_or_else(|_| "unknown adapter".to_string());
        let identifier = info.split_whitespace().next().unwrap_or("unknown").to_string();

        let events = adapter
            .events()
            .await
            .map_err(|e| bt_error("Failed to subscribe to adapter events", e))?;

        let callbacks: Arc<Mutex<ScanCallbacks>> = Arc::new(Mutex::new(ScanCallbacks::default()));
        let hooks: SharedHooks = Arc::new(Mutex::new(Hooks::default()));

        let event_pump = {
            let adapter = adapter.clone();
            let callbacks = Arc::clone(&callbacks);
            let hooks = Arc::clone(&hooks);
            let mut events = events;
            tokio::spawn(async move {
                while let Some(event) = events.next().await {
                    match event {
                        CentralEvent::DeviceConnected(id) => {
                            let handler = hooks.lock().handlers.get(&id).cloned();
                            if let Some(handler) = handler {
                                (handler.on_connected)();
                            }
                        }
                        CentralEvent::DeviceDisconnected(id) => {
                            let handler = {
                                let mut hooks = hooks.lock();
                                hooks.abort_notifications(&id);
                                hooks.handlers.get(&id).cloned()
                            };
                            if let Some(handler) = handler {
                                (handler.on_disconnected)();
                            }
                        }
                        CentralEvent::DeviceDiscovered(id) => {
                            let on_found = callbacks.lock().on_scan_found.clone();
                            let Some(on_found) = on_found else {
                                continue;
                            };
                            match adapter.peripheral(&id).await {
                                Ok(peripheral) => {
                                    let peripheral = BtlePeripheral::wrap(peripheral, Arc::clone(&hooks)).await;
                                    on_found(peripheral);
                                }
                                Err(e) => trace!("Discovered peripheral vanished: {}", e),
                            }
                        }
                        _ => {}
                    }
                }
                debug!("Adapter event stream ended");
            })
        };

        info!("Bluetooth adapter available: {}", info);
        Ok(Arc::new(BtleAdapter {
            adapter,
            identifier,
            info,
            callbacks,
            hooks,
            event_pump,
        }))
    }
}

impl Drop for BtleAdapter {
    fn drop(&mut self) {
        self.event_pump.abort();
    }
}

#[async_trait]
impl Adapter for BtleAdapter {
    fn identifier(&self) -> String {
        self.identifier.clone()
    }

    fn address(&self) -> String {
        self.info.clone()
    }

    fn set_scan_callbacks(&self, callbacks: ScanCallbacks) {
        *self.callbacks.lock() = callbacks;
    }

    async fn start_scan(&self) -> Result<()> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| bt_error("Failed to start scan", e))?;
        let on_start = self.callbacks.lock().on_scan_start.clone();
        if let Some(callback) = on_start {
            callback();
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.adapter
            .stop_scan()
            .await
            .map_err(|e| bt_error("Failed to stop scan", e))?;
        let on_stop = self.callbacks.lock().on_scan_stop.clone();
        if let Some(callback) = on_stop {
            callback();
        }
        Ok(())
    }

    async fn scan_results(&self) -> Result<Vec<Arc<dyn Peripheral>>> {
        let peripherals = self
            .adapter
            .peripherals()
            .await
            .map_err(|e| bt_error("Failed to get peripherals", e))?;

        let mut results: Vec<Arc<dyn Peripheral>> = Vec::with_capacity(peripherals.len());
        for peripheral in peripherals {
            results.push(BtlePeripheral::wrap(peripheral, Arc::clone(&self.hooks)).await);
        }
        Ok(results)
    }
}

/// btleplugのペリフェラル
pub struct BtlePeripheral {
    peripheral: PlatformPeripheral,
    name: String,
    address: String,
    hooks: SharedHooks,
}

impl Debug for BtlePeripheral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BtlePeripheral")
            .field("name", &self.name)
            .field("address", &self.address)
            .finish()
    }
}

impl BtlePeripheral {
    /// ペリフェラルをラップする。名前とアドレスはこの時点のプロパティで固定
    async fn wrap(peripheral: PlatformPeripheral, hooks: SharedHooks) -> Arc<dyn Peripheral> {
        let properties = peripheral.properties().await.ok().flatten();
        let name = properties
            .as_ref()
            .and_then(|p| p.local_name.clone())
            .unwrap_or_default();
        let address = properties
            .as_ref()
            .map(|p| p.address)
            .filter(|address| *address != BDAddr::default())
            .map(|address| address.to_string())
            // macOSではアドレスが取れないためIDを使う
            .unwrap_or_else(|| format!("{:?}", peripheral.id()));

        Arc::new(BtlePeripheral {
            peripheral,
            name,
            address,
            hooks,
        })
    }

    async fn characteristic(&self, service: Uuid, characteristic: Uuid) -> Result<Characteristic> {
        let find = |chars: BTreeSet<Characteristic>| {
            chars
                .into_iter()
                .find(|c| c.service_uuid == service && c.uuid == characteristic)
        };

        if let Some(found) = find(self.peripheral.characteristics()) {
            return Ok(found);
        }
        self.peripheral
            .discover_services()
            .await
            .map_err(|e| bt_error("Failed to discover services", e))?;
        find(self.peripheral.characteristics()).ok_or_else(|| {
            BleLinkError::OperationFailed(format!(
                "Characteristic {} not found in service {}",
                characteristic, service
            ))
        })
    }
}

/// 通知はキャラクタリスティックUUIDしか持たない。同じUUIDが別サービスにもあれば配信先を決められない
fn is_attributable(all: &BTreeSet<Characteristic>, target: &Characteristic) -> bool {
    !all
        .iter()
        .any(|c| c.uuid == target.uuid && c.service_uuid != target.service_uuid)
}

fn to_properties(flags: CharPropFlags) -> CharacteristicProperties {
    CharacteristicProperties {
        read: flags.contains(CharPropFlags::READ),
        write: flags.contains(CharPropFlags::WRITE),
        write_without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
        notify: flags.contains(CharPropFlags::NOTIFY),
        indicate: flags.contains(CharPropFlags::INDICATE),
    }
}

#[async_trait]
impl Peripheral for BtlePeripheral {
    fn identifier(&self) -> String {
        self.name.clone()
    }

    fn address(&self) -> String {
        self.address.clone()
    }

    /// btleplugは広告の接続可否を公開しないため、常に接続可能とみなす
    async fn is_connectable(&self) -> bool {
        true
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn connect(&self) -> Result<()> {
        self.peripheral
            .connect()
            .await
            .map_err(|e| BleLinkError::ConnectionFailed(e.to_string()))
    }

    async fn disconnect(&self) -> Result<()> {
        self.hooks.lock().abort_notifications(&self.peripheral.id());
        self.peripheral
            .disconnect()
            .await
            .map_err(|e| BleLinkError::DisconnectFailed(e.to_string()))
    }

    async fn services(&self) -> Result<Vec<ServiceDescriptor>> {
        if self.peripheral.services().is_empty() {
            self.peripheral
                .discover_services()
                .await
                .map_err(|e| bt_error("Failed to discover services", e))?;
        }

        Ok(self
            .peripheral
            .services()
            .into_iter()
            .map(|service| ServiceDescriptor {
                uuid: service.uuid,
                characteristics: service
                    .characteristics
                    .into_iter()
                    .map(|c| CharacteristicDescriptor {
                        uuid: c.uuid,
                        properties: to_properties(c.properties),
                    })
                    .collect(),
            })
            .collect())
    }

    async fn read(&self, service: Uuid, characteristic: Uuid) -> Result<Vec<u8>> {
        let target = self.characteristic(service, characteristic).await?;
        self.peripheral
            .read(&target)
            .await
            .map_err(|e| bt_error("Read failed", e))
    }

    async fn write_command(&self, service: Uuid, characteristic: Uuid, data: &[u8]) -> Result<()> {
        let target = self.characteristic(service, characteristic).await?;
        self.peripheral
            .write(&target, data, WriteType::WithoutResponse)
            .await
            .map_err(|e| bt_error("Write failed", e))
    }

    async fn subscribe(
        &self,
        service: Uuid,
        characteristic: Uuid,
        callback: NotificationCallback,
    ) -> Result<()> {
        let target = self.characteristic(service, characteristic).await?;
        if !is_attributable(&self.peripheral.characteristics(), &target) {
            return Err(BleLinkError::OperationFailed(format!(
                "Characteristic {} is shared by several services; notifications cannot be told apart",
                characteristic
            )));
        }
        self.peripheral
            .subscribe(&target)
            .await
            .map_err(|e| bt_error("Subscribe failed", e))?;
        let mut stream = self
            .peripheral
            .notifications()
            .await
            .map_err(|e| bt_error("Failed to open notification stream", e))?;

        let task = tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                if notification.uuid == characteristic {
                    callback(notification.value);
                }
            }
        });
        let mut hooks = self.hooks.lock();
        let tasks = hooks.notification_tasks.entry(self.peripheral.id()).or_default();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
        Ok(())
    }

    fn set_connection_callbacks(&self, on_connected: EventCallback, on_disconnected: EventCallback) {
        self.hooks.lock().handlers.insert(
            self.peripheral.id(),
            ConnectionHandlers {
                on_connected,
                on_disconnected,
            },
        );
    }
}
