//! デバイスレジストリ（スキャンループと照合）

use futures::future::join_all;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::device::{BleDevice, DeviceConfig};
use super::traits::{Adapter, AdapterProvider, DeviceInfo, Peripheral, ScanCallbacks};
use crate::config::BluetoothConfig;
use crate::error::{BleLinkError, Result};

/// スキャンループ停止時の最大待ち時間
const SCAN_WORKER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// レジストリイベント
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "device", rename_all = "snake_case")]
pub enum RegistryEvent {
    DeviceAdded(DeviceInfo),
    DeviceRemoved(DeviceInfo),
}

/// 1回の照合結果（アドレス一覧）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub added: Vec<String>,
    pub refreshed: Vec<String>,
    pub removed: Vec<String>,
}

impl ReconcileReport {
    pub fn is_unchanged(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[derive(Default)]
struct DeviceTable {
    /// アドレス -> エンティティ
    devices: HashMap<String, Arc<BleDevice>>,

    /// 登録順のアドレス
    order: Vec<String>,
}

struct ScanWorker {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// 発見済みデバイスの唯一の管理元
///
/// 追加・削除はすべて照合ロックの下で行うため、同じアドレスの
/// 追加/削除イベントは必ず発生順に並ぶ。
pub struct BleDeviceManager {
    provider: Arc<dyn AdapterProvider>,
    config: BluetoothConfig,
    device_config: DeviceConfig,
    runtime: Handle,
    adapter: parking_lot::RwLock<Option<Arc<dyn Adapter>>>,
    table: RwLock<DeviceTable>,
    reconcile_lock: Mutex<()>,
    events: broadcast::Sender<RegistryEvent>,
    scan_worker: parking_lot::Mutex<Option<ScanWorker>>,
}

impl BleDeviceManager {
    /// 新しいマネージャーを作成（tokioランタイム内で呼ぶこと）
    pub fn new(provider: Arc<dyn AdapterProvider>, config: BluetoothConfig) -> Result<Arc<Self>> {
        let runtime = Handle::try_current()
            .map_err(|e| BleLinkError::Other(format!("Device manager needs a tokio runtime: {}", e)))?;
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Ok(Arc::new(BleDeviceManager {
            provider,
            device_config: DeviceConfig::from(&config),
            config,
            runtime,
            adapter: parking_lot::RwLock::new(None),
            table: RwLock::new(DeviceTable::default()),
            reconcile_lock: Mutex::new(()),
            events,
            scan_worker: parking_lot::Mutex::new(None),
        }))
    }

    /// アダプタを選択してスキャンコールバックを登録する
    pub async fn initialize(&self) -> Result<()> {
        if let Some(adapter) = self.adapter.read().as_ref() {
            debug!("Adapter {} already selected", adapter.identifier());
            return Ok(());
        }

        if !self.provider.is_radio_enabled().await {
            return Err(BleLinkError::NoAdapterAvailable("Bluetooth is disabled".to_string()));
        }

        let adapters = self.provider.list_adapters().await?;
        if adapters.is_empty() {
            return Err(BleLinkError::NoAdapterAvailable("no adapter found".to_string()));
        }
        if adapters.len() > 1 {
            info!("Found {} Bluetooth adapters", adapters.len());
            for adapter in &adapters {
                info!("  - {} ({})", adapter.identifier(), adapter.address());
            }
        }

        let preferred = self.config.adapter.as_ref().and_then(|name| {
            let found = adapters.iter().find(|a| &a.identifier() == name).cloned();
            if found.is_none() {
                warn!("Adapter {} not found, using the first adapter", name);
            }
            found
        });
        let adapter = match preferred {
            Some(adapter) => adapter,
            None => Arc::clone(&adapters[0]),
        };

        adapter.set_scan_callbacks(ScanCallbacks {
            on_scan_start: Some(Arc::new(|| info!("Scan started"))),
            on_scan_stop: Some(Arc::new(|| info!("Scan stopped"))),
            on_scan_found: Some(Arc::new(|peripheral: Arc<dyn Peripheral>| {
                trace!("Scan found {} ({})", peripheral.identifier(), peripheral.address());
            })),
        });

        info!("Using adapter {} ({})", adapter.identifier(), adapter.address());
        *self.adapter.write() = Some(adapter);
        Ok(())
    }

    fn adapter(&self) -> Result<Arc<dyn Adapter>> {
        self.adapter
            .read()
            .clone()
            .ok_or_else(|| BleLinkError::NoAdapterAvailable("manager is not initialized".to_string()))
    }

    pub fn config(&self) -> &BluetoothConfig {
        &self.config
    }

    /// 選択中のアダプタ名
    pub fn adapter_identifier(&self) -> Option<String> {
        self.adapter.read().as_ref().map(|a| a.identifier())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    async fn scan_pass(&self) -> Result<Vec<Arc<dyn Peripheral>>> {
        let adapter = self.adapter()?;
        adapter
            .scan_for(Duration::from_millis(self.config.scan_duration_ms))
            .await?;
        adapter.scan_results().await
    }

    /// 1回スキャンして照合する
    pub async fn update_device_list(&self) -> Result<ReconcileReport> {
        let results = self.scan_pass().await?;
        Ok(self.reconcile_scan(results).await)
    }

    /// 最新のスキャン結果と登録済みデバイスを照合する
    ///
    /// 名前が空のもの、接続済みでも接続可能でもないものは追加しない。
    /// 削除判定はフィルタ前の結果に対して行う。
    pub async fn reconcile_scan(&self, results: Vec<Arc<dyn Peripheral>>) -> ReconcileReport {
        let _guard = self.reconcile_lock.lock().await;
        let present: HashSet<String> = results.iter().map(|p| p.address()).collect();

        let mut seen = HashSet::new();
        let mut admissible = Vec::new();
        for peripheral in results {
            let address = peripheral.address();
            if address.is_empty() || peripheral.identifier().is_empty() {
                trace!("Skipping unnamed peripheral {}", address);
                continue;
            }
            if !peripheral.is_connected().await && !peripheral.is_connectable().await {
                trace!("Skipping unconnectable peripheral {}", address);
                continue;
            }
            if !seen.insert(address) {
                continue;
            }
            admissible.push(peripheral);
        }

        let mut report = ReconcileReport::default();
        for peripheral in admissible {
            let address = peripheral.address();
            let existing = self.table.read().await.devices.get(&address).cloned();
            match existing {
                Some(device) => {
                    device.set_peripheral(peripheral);
                    report.refreshed.push(address);
                }
                None => {
                    self.insert_device(peripheral).await;
                    report.added.push(address);
                }
            }
        }

        let stale: Vec<String> = self
            .table
            .read()
            .await
            .order
            .iter()
            .filter(|address| !present.contains(*address))
            .cloned()
            .collect();
        for address in stale {
            if self.detach_and_release(&address).await {
                report.removed.push(address);
            }
        }

        if !report.is_unchanged() {
            info!(
                "Device list updated: +{} -{} ({} known)",
                report.added.len(),
                report.removed.len(),
                self.table.read().await.order.len()
            );
        }
        report
    }

    async fn insert_device(&self, peripheral: Arc<dyn Peripheral>) -> Arc<BleDevice> {
        let device = BleDevice::new(peripheral, self.device_config.clone(), self.runtime.clone());
        {
            let mut table = self.table.write().await;
            table.order.push(device.address().to_string());
            table
                .devices
                .insert(device.address().to_string(), Arc::clone(&device));
        }
        info!("Added device: {}", device.description());
        let _ = self.events.send(RegistryEvent::DeviceAdded(device.info()));
        device
    }

    async fn detach_and_release(&self, address: &str) -> bool {
        let device = {
            let mut table = self.table.write().await;
            table.order.retain(|a| a != address);
            table.devices.remove(address)
        };
        let Some(device) = device else {
            return false;
        };

        device.release().await;
        info!("Removed device: {}", device.description());
        let _ = self.events.send(RegistryEvent::DeviceRemoved(device.info()));
        true
    }

    /// スキャン外でデバイスを登録する。登録済みならハンドルを更新して返す
    pub async fn add_device(&self, peripheral: Arc<dyn Peripheral>) -> Arc<BleDevice> {
        let _guard = self.reconcile_lock.lock().await;
        let existing = self.table.read().await.devices.get(&peripheral.address()).cloned();
        match existing {
            Some(device) => {
                device.set_peripheral(peripheral);
                device
            }
            None => self.insert_device(peripheral).await,
        }
    }

    /// デバイスを切断して登録解除する
    pub async fn remove_device(&self, address: &str) -> Result<()> {
        let _guard = self.reconcile_lock.lock().await;
        if self.detach_and_release(address).await {
            Ok(())
        } else {
            Err(BleLinkError::DeviceNotFound(address.to_string()))
        }
    }

    pub async fn lookup(&self, address: &str) -> Option<Arc<BleDevice>> {
        self.table.read().await.devices.get(address).cloned()
    }

    /// 登録順のデバイス一覧
    pub async fn devices(&self) -> Vec<Arc<BleDevice>> {
        let table = self.table.read().await;
        table
            .order
            .iter()
            .filter_map(|address| table.devices.get(address).cloned())
            .collect()
    }

    pub async fn device_infos(&self) -> Vec<DeviceInfo> {
        self.devices().await.iter().map(|d| d.info()).collect()
    }

    pub async fn device_count(&self) -> usize {
        self.table.read().await.order.len()
    }

    /// スキャンループを開始する
    ///
    /// `scan_interval_secs` が未指定なら1回だけスキャンして終了する。
    pub fn start(self: &Arc<Self>) -> Result<()> {
        self.adapter()?;

        let mut slot = self.scan_worker.lock();
        if slot.as_ref().map(|w| !w.handle.is_finished()).unwrap_or(false) {
            debug!("Scan loop already running");
            return Ok(());
        }

        let weak = Arc::downgrade(self);
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let interval = self.config.scan_interval_secs.map(Duration::from_secs);

        let handle = self.runtime.spawn(async move {
            info!("Scan loop started");
            loop {
                let Some(manager) = weak.upgrade() else {
                    break;
                };

                let scanned = tokio::select! {
                    _ = cancelled.cancelled() => break,
                    scanned = manager.scan_pass() => scanned,
                };
                match scanned {
                    Ok(results) => {
                        let report = manager.reconcile_scan(results).await;
                        debug!("Scan pass: {:?}", report);
                    }
                    Err(e) => warn!("Scan failed: [{}] {}", e.error_code(), e),
                }
                drop(manager);

                let Some(period) = interval else {
                    break;
                };
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = tokio::time::sleep(period) => {}
                }
            }
            info!("Scan loop stopped");
        });

        *slot = Some(ScanWorker { token, handle });
        Ok(())
    }

    pub fn is_scanning(&self) -> bool {
        self.scan_worker
            .lock()
            .as_ref()
            .map(|w| !w.handle.is_finished())
            .unwrap_or(false)
    }

    /// スキャンループを止め、全デバイスを切断・解放する
    pub async fn shutdown(&self) {
        let worker = self.scan_worker.lock().take();
        if let Some(mut worker) = worker {
            worker.token.cancel();
            if tokio::time::timeout(SCAN_WORKER_STOP_TIMEOUT, &mut worker.handle)
                .await
                .is_err()
            {
                warn!("Scan loop did not stop within {:?}, aborting", SCAN_WORKER_STOP_TIMEOUT);
                worker.handle.abort();
            }
        }

        if let Ok(adapter) = self.adapter() {
            if let Err(e) = adapter.stop_scan().await {
                debug!("stop_scan on shutdown: {}", e);
            }
        }

        let _guard = self.reconcile_lock.lock().await;
        let devices: Vec<Arc<BleDevice>> = {
            let mut table = self.table.write().await;
            let order = std::mem::take(&mut table.order);
            let devices = order
                .iter()
                .filter_map(|address| table.devices.remove(address))
                .collect();
            table.devices.clear();
            devices
        };

        join_all(devices.iter().map(|device| device.release())).await;
        for device in &devices {
            let _ = self.events.send(RegistryEvent::DeviceRemoved(device.info()));
        }
        info!("Device manager shut down ({} device(s) released)", devices.len());
    }
}
