//! デバイスエンティティ（接続状態機械とキープアライブ）

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::dispatcher::DataDispatcher;
use super::traits::{DeviceInfo, EventCallback, NotificationCallback, Peripheral};
use crate::config::BluetoothConfig;
use crate::error::{BleLinkError, Result};
use crate::protocol::{CharacteristicInfo, ReceivedValue, ServiceDescriptor};

/// 接続状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
        };
        f.write_str(s)
    }
}

/// デバイスイベントの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceEventKind {
    Opened,
    Closed,
    Removed,
    Connected,
    Disconnected,
}

/// デバイスイベント
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEvent {
    pub address: String,
    pub kind: DeviceEventKind,
}

/// デバイス単位の設定
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// キープアライブの周期
    pub keepalive_interval: Duration,

    /// キープアライブ停止時の最大待ち時間
    pub keepalive_stop_timeout: Duration,

    /// イベント・データチャネルの容量
    pub event_capacity: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            keepalive_interval: Duration::from_millis(1000),
            keepalive_stop_timeout: Duration::from_millis(1000),
            event_capacity: 64,
        }
    }
}

impl From<&BluetoothConfig> for DeviceConfig {
    fn from(config: &BluetoothConfig) -> Self {
        DeviceConfig {
            keepalive_interval: Duration::from_millis(config.keepalive_interval_ms),
            keepalive_stop_timeout: Duration::from_millis(config.keepalive_stop_timeout_ms),
            event_capacity: config.event_capacity,
        }
    }
}

#[derive(Debug)]
struct LinkState {
    state: ConnectionState,
    /// 切断のたびに進む。古い世代の完了通知は捨てる
    generation: u64,
    /// 接続要求を出した時点の世代
    attempt: Option<u64>,
}

struct KeepAlive {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// 発見済みペリフェラル1台
///
/// 接続状態はこのエンティティ自身だけが変更する（アダプタのコールバック、
/// または明示的な open/close 経由）。購読者はエンティティを所有しない。
pub struct BleDevice {
    self_ref: Weak<BleDevice>,
    address: String,
    name: String,
    description: String,
    peripheral: Mutex<Arc<dyn Peripheral>>,
    link: Mutex<LinkState>,
    keepalive: Mutex<Option<KeepAlive>>,
    heartbeats: Arc<AtomicU64>,
    subscriptions: Mutex<HashSet<CharacteristicInfo>>,
    events: broadcast::Sender<DeviceEvent>,
    dispatcher: DataDispatcher,
    config: DeviceConfig,
    runtime: Handle,
}

impl fmt::Debug for BleDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BleDevice")
            .field("address", &self.address)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl BleDevice {
    /// ペリフェラルからエンティティを作成し、接続コールバックを登録する
    pub fn new(peripheral: Arc<dyn Peripheral>, config: DeviceConfig, runtime: Handle) -> Arc<Self> {
        let address = peripheral.address();
        let name = peripheral.identifier();
        let description = format!("{} ({})", name, address);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let dispatcher = DataDispatcher::new(address.clone(), config.event_capacity);

        let device = Arc::new_cyclic(|self_ref| BleDevice {
            self_ref: self_ref.clone(),
            address,
            name,
            description,
            peripheral: Mutex::new(Arc::clone(&peripheral)),
            link: Mutex::new(LinkState {
                state: ConnectionState::Disconnected,
                generation: 0,
                attempt: None,
            }),
            keepalive: Mutex::new(None),
            heartbeats: Arc::new(AtomicU64::new(0)),
            subscriptions: Mutex::new(HashSet::new()),
            events,
            dispatcher,
            config,
            runtime,
        });
        device.attach_callbacks(peripheral.as_ref());
        debug!("Created device entity {}", device.description);
        device
    }

    fn attach_callbacks(&self, peripheral: &dyn Peripheral) {
        let on_connected: EventCallback = {
            let weak = self.self_ref.clone();
            Arc::new(move || {
                if let Some(device) = weak.upgrade() {
                    device.handle_connected();
                }
            })
        };
        let on_disconnected: EventCallback = {
            let weak = self.self_ref.clone();
            Arc::new(move || {
                if let Some(device) = weak.upgrade() {
                    device.handle_disconnected();
                }
            })
        };
        peripheral.set_connection_callbacks(on_connected, on_disconnected);
    }

    /// 新しいスキャン結果のハンドルに差し替える（接続状態は変えない）
    pub fn set_peripheral(&self, peripheral: Arc<dyn Peripheral>) {
        if peripheral.address() != self.address {
            warn!(
                "Ignoring peripheral {} for device {}: identity mismatch",
                peripheral.address(),
                self.address
            );
            return;
        }
        self.attach_callbacks(peripheral.as_ref());
        *self.peripheral.lock() = peripheral;
        trace!("Refreshed peripheral handle for {}", self.address);
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn state(&self) -> ConnectionState {
        self.link.lock().state
    }

    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            name: self.name.clone(),
            address: self.address.clone(),
            description: self.description.clone(),
            connected: self.state() == ConnectionState::Connected,
        }
    }

    /// 現在のペリフェラルハンドル
    pub fn peripheral(&self) -> Arc<dyn Peripheral> {
        Arc::clone(&self.peripheral.lock())
    }

    /// スタック側から見た接続状態
    pub async fn is_open(&self) -> bool {
        self.peripheral().is_connected().await
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_data(&self) -> broadcast::Receiver<ReceivedValue> {
        self.dispatcher.subscribe()
    }

    pub fn heartbeat_count(&self) -> u64 {
        self.heartbeats.load(Ordering::Relaxed)
    }

    pub fn is_keepalive_running(&self) -> bool {
        self.keepalive
            .lock()
            .as_ref()
            .map(|k| !k.handle.is_finished())
            .unwrap_or(false)
    }

    /// 購読中のキャラクタリスティック
    pub fn subscriptions(&self) -> Vec<CharacteristicInfo> {
        self.subscriptions.lock().iter().cloned().collect()
    }

    fn emit(&self, kind: DeviceEventKind) {
        debug!("{}: {:?}", self.address, kind);
        let _ = self.events.send(DeviceEvent {
            address: self.address.clone(),
            kind,
        });
    }

    /// 接続を要求する
    ///
    /// `Connected` への遷移は接続コールバックが行う。接続中・接続済みなら何もしない。
    pub async fn try_open(&self) -> Result<()> {
        {
            let mut link = self.link.lock();
            let current = link.state;
            match current {
                ConnectionState::Connecting | ConnectionState::Connected => {
                    debug!("{} is already {}", self.address, current);
                    return Ok(());
                }
                ConnectionState::Disconnecting => {
                    return Err(BleLinkError::ConnectionFailed(format!(
                        "{} is disconnecting",
                        self.address
                    )));
                }
                ConnectionState::Disconnected => {
                    link.state = ConnectionState::Connecting;
                    link.attempt = Some(link.generation);
                }
            }
        }

        info!("Connecting to {}", self.description);
        if let Err(e) = self.peripheral().connect().await {
            let mut link = self.link.lock();
            if link.state == ConnectionState::Connecting {
                link.state = ConnectionState::Disconnected;
                link.attempt = None;
            }
            return Err(BleLinkError::ConnectionFailed(format!("{}: {}", self.address, e)));
        }
        Ok(())
    }

    /// 接続を要求する（失敗はログのみ）
    pub async fn open(&self) {
        if let Err(e) = self.try_open().await {
            report(&e);
        }
    }

    fn handle_connected(&self) {
        {
            let mut link = self.link.lock();
            let current = link.state;
            // 要求中の接続と同じ世代の通知だけを受け付ける
            let pending = link.attempt.take();
            if current != ConnectionState::Connecting || pending != Some(link.generation) {
                debug!("Dropping connected callback for {} in state {}", self.address, current);
                return;
            }
            link.state = ConnectionState::Connected;
        }
        info!("Connected to {}", self.description);
        self.emit(DeviceEventKind::Opened);
        self.emit(DeviceEventKind::Connected);
        self.start_keepalive();
    }

    fn handle_disconnected(&self) {
        let remote = {
            let mut link = self.link.lock();
            let current = link.state;
            match current {
                ConnectionState::Connecting | ConnectionState::Connected => {
                    link.state = ConnectionState::Disconnected;
                    link.generation += 1;
                    link.attempt = None;
                    true
                }
                // close() が後始末をする
                ConnectionState::Disconnecting => return,
                ConnectionState::Disconnected => false,
            }
        };

        if remote {
            info!("{} dropped the link", self.description);
            self.subscriptions.lock().clear();
            self.emit(DeviceEventKind::Disconnected);
        }

        let keepalive = self.keepalive.lock().take();
        if let Some(keepalive) = keepalive {
            let timeout = self.config.keepalive_stop_timeout;
            let address = self.address.clone();
            self.runtime.spawn(async move {
                if let Err(e) = join_keepalive(keepalive, timeout, &address).await {
                    report(&e);
                }
            });
        }
    }

    fn start_keepalive(&self) {
        let mut slot = self.keepalive.lock();
        if slot.as_ref().map(|k| !k.handle.is_finished()).unwrap_or(false) {
            return;
        }

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let heartbeats = Arc::clone(&self.heartbeats);
        let period = self.config.keepalive_interval;
        let address = self.address.clone();

        let handle = self.runtime.spawn(async move {
            debug!("Keep-alive started for {}", address);
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = interval.tick() => {
                        let beats = heartbeats.fetch_add(1, Ordering::Relaxed) + 1;
                        trace!("Keep-alive {} #{}", address, beats);
                    }
                }
            }
            debug!("Keep-alive stopped for {}", address);
        });

        *slot = Some(KeepAlive { token, handle });
    }

    async fn stop_keepalive(&self) {
        let keepalive = self.keepalive.lock().take();
        if let Some(keepalive) = keepalive {
            if let Err(e) = join_keepalive(keepalive, self.config.keepalive_stop_timeout, &self.address).await {
                report(&e);
            }
        }
    }

    /// 切断する
    ///
    /// 何度呼んでもよい。未接続ならアダプタは呼ばないが、イベント送出と
    /// リスナー解除は毎回行う。切断失敗は `DisconnectFailed` として返すが
    /// 後始末は必ず完了する。
    pub async fn try_close(&self) -> Result<()> {
        let previous = {
            let mut link = self.link.lock();
            let previous = link.state;
            if previous != ConnectionState::Disconnected {
                link.state = ConnectionState::Disconnecting;
            }
            link.generation += 1;
            link.attempt = None;
            previous
        };

        let mut result = Ok(());
        if previous != ConnectionState::Disconnected {
            info!("Disconnecting from {}", self.description);
            if let Err(e) = self.peripheral().disconnect().await {
                result = Err(BleLinkError::DisconnectFailed(format!("{}: {}", self.address, e)));
            }
        }

        self.link.lock().state = ConnectionState::Disconnected;
        self.emit(DeviceEventKind::Disconnected);
        self.emit(DeviceEventKind::Closed);
        self.stop_keepalive().await;
        self.subscriptions.lock().clear();
        result
    }

    /// 切断する（失敗はログのみ）
    pub async fn close(&self) {
        if let Err(e) = self.try_close().await {
            report(&e);
        }
    }

    /// 切断してレジストリから外れたことを通知する
    pub async fn release(&self) {
        self.close().await;
        self.emit(DeviceEventKind::Removed);
    }

    fn connected_link(&self) -> Result<(Arc<dyn Peripheral>, u64)> {
        let link = self.link.lock();
        if link.state != ConnectionState::Connected {
            return Err(BleLinkError::DeviceNotConnected(format!(
                "{} is {}",
                self.address, link.state
            )));
        }
        Ok((self.peripheral(), link.generation))
    }

    fn is_current(&self, generation: u64) -> bool {
        let link = self.link.lock();
        link.state == ConnectionState::Connected && link.generation == generation
    }

    /// サービス一覧
    pub async fn services(&self) -> Result<Vec<ServiceDescriptor>> {
        let (peripheral, _) = self.connected_link()?;
        peripheral
            .services()
            .await
            .map_err(|e| BleLinkError::OperationFailed(format!("services on {}: {}", self.address, e)))
    }

    /// 読み取ってデコードし、配信する
    pub async fn try_read_characteristic(&self, info: &CharacteristicInfo) -> Result<ReceivedValue> {
        let (peripheral, generation) = self.connected_link()?;
        let bytes = peripheral
            .read(info.service_uuid, info.characteristic_uuid)
            .await
            .map_err(|e| {
                BleLinkError::OperationFailed(format!("read {} on {}: {}", info.nice_name, self.address, e))
            })?;

        if !self.is_current(generation) {
            debug!("Dropping late read of {} on {}", info.nice_name, self.address);
            return Err(BleLinkError::DeviceNotConnected(format!(
                "{} disconnected during read",
                self.address
            )));
        }
        Ok(self.dispatcher.dispatch(info, &bytes))
    }

    pub async fn read_characteristic(&self, info: &CharacteristicInfo) {
        if let Err(e) = self.try_read_characteristic(info).await {
            report(&e);
        }
    }

    /// 応答なし書き込み
    pub async fn try_write_characteristic(&self, info: &CharacteristicInfo, data: &[u8]) -> Result<()> {
        let (peripheral, _) = self.connected_link()?;
        peripheral
            .write_command(info.service_uuid, info.characteristic_uuid, data)
            .await
            .map_err(|e| {
                BleLinkError::OperationFailed(format!("write {} on {}: {}", info.nice_name, self.address, e))
            })
    }

    pub async fn write_characteristic(&self, info: &CharacteristicInfo, data: &[u8]) {
        if let Err(e) = self.try_write_characteristic(info, data).await {
            report(&e);
        }
    }

    /// Notify/Indicateを購読する。切断またはエンティティ破棄まで有効
    pub async fn try_notify_characteristic(&self, info: &CharacteristicInfo) -> Result<()> {
        let (peripheral, generation) = self.connected_link()?;
        if !self.subscriptions.lock().insert(info.clone()) {
            debug!("{} already subscribed on {}", info.nice_name, self.address);
            return Ok(());
        }

        let callback: NotificationCallback = {
            let weak = self.self_ref.clone();
            let info = info.clone();
            Arc::new(move |bytes: Vec<u8>| {
                if let Some(device) = weak.upgrade() {
                    device.deliver_notification(&info, generation, &bytes);
                }
            })
        };

        if let Err(e) = peripheral
            .subscribe(info.service_uuid, info.characteristic_uuid, callback)
            .await
        {
            self.subscriptions.lock().remove(info);
            return Err(BleLinkError::OperationFailed(format!(
                "subscribe {} on {}: {}",
                info.nice_name, self.address, e
            )));
        }
        debug!("Subscribed to {} on {}", info.nice_name, self.address);
        Ok(())
    }

    pub async fn notify_characteristic(&self, info: &CharacteristicInfo) {
        if let Err(e) = self.try_notify_characteristic(info).await {
            report(&e);
        }
    }

    fn deliver_notification(&self, info: &CharacteristicInfo, generation: u64, bytes: &[u8]) {
        if !self.is_current(generation) {
            trace!("Dropping stale notification of {} on {}", info.nice_name, self.address);
            return;
        }
        self.dispatcher.dispatch(info, bytes);
    }
}

async fn join_keepalive(mut keepalive: KeepAlive, timeout: Duration, address: &str) -> Result<()> {
    keepalive.token.cancel();
    if tokio::time::timeout(timeout, &mut keepalive.handle).await.is_err() {
        keepalive.handle.abort();
        return Err(BleLinkError::Timeout(format!(
            "keep-alive for {} did not stop within {:?}, aborted",
            address, timeout
        )));
    }
    Ok(())
}

/// 互換モードの失敗ログ。ハードウェア由来はwarn、それ以外はerror
fn report(e: &BleLinkError) {
    if e.is_hardware() {
        warn!("[{}] {}", e.error_code(), e);
    } else {
        error!("[{}] {}", e.error_code(), e);
    }
}

impl Drop for BleDevice {
    fn drop(&mut self) {
        if let Some(keepalive) = self.keepalive.get_mut().take() {
            keepalive.token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::mock::ScriptedPeripheral;
    use crate::protocol::uuid;
    use tokio::sync::Notify;

    fn test_config() -> DeviceConfig {
        DeviceConfig {
            keepalive_interval: Duration::from_millis(10),
            keepalive_stop_timeout: Duration::from_millis(200),
            event_capacity: 32,
        }
    }

    fn battery() -> CharacteristicInfo {
        CharacteristicInfo::new(uuid::BATTERY_SERVICE, uuid::BATTERY_LEVEL)
    }

    fn device_with(peripheral: &Arc<ScriptedPeripheral>) -> Arc<BleDevice> {
        BleDevice::new(
            Arc::clone(peripheral) as Arc<dyn Peripheral>,
            test_config(),
            Handle::current(),
        )
    }

    fn drain(rx: &mut broadcast::Receiver<DeviceEvent>) -> Vec<DeviceEventKind> {
        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind);
        }
        kinds
    }

    #[tokio::test]
    async fn test_description_and_identity() {
        let peripheral = ScriptedPeripheral::new("Sensor", "AA:BB:CC:DD:EE:01");
        let device = device_with(&peripheral);
        assert_eq!(device.name(), "Sensor");
        assert_eq!(device.address(), "AA:BB:CC:DD:EE:01");
        assert_eq!(device.description(), "Sensor (AA:BB:CC:DD:EE:01)");
        assert_eq!(device.state(), ConnectionState::Disconnected);
        assert!(peripheral.has_connection_callbacks());
    }

    #[tokio::test]
    async fn test_open_emits_opened_then_connected() {
        let peripheral = ScriptedPeripheral::new("Sensor", "AA:01");
        let device = device_with(&peripheral);
        let mut events = device.subscribe_events();

        device.open().await;

        assert_eq!(device.state(), ConnectionState::Connected);
        assert_eq!(drain(&mut events), vec![DeviceEventKind::Opened, DeviceEventKind::Connected]);
        assert!(device.is_keepalive_running());
        assert!(device.is_open().await);
        assert!(device.info().connected);
    }

    #[tokio::test]
    async fn test_open_waits_for_callback() {
        let peripheral = ScriptedPeripheral::new("Sensor", "AA:02");
        peripheral.set_auto_confirm(false);
        let device = device_with(&peripheral);

        device.open().await;
        assert_eq!(device.state(), ConnectionState::Connecting);
        assert!(!device.is_keepalive_running());

        // 接続中の再要求は無視
        device.open().await;
        assert_eq!(peripheral.connect_calls(), 1);

        peripheral.fire_connected();
        assert_eq!(device.state(), ConnectionState::Connected);
        assert!(device.is_keepalive_running());
    }

    #[tokio::test]
    async fn test_connected_callback_after_close_is_dropped() {
        let peripheral = ScriptedPeripheral::new("Sensor", "AA:20");
        peripheral.set_auto_confirm(false);
        let device = device_with(&peripheral);

        device.open().await;
        assert_eq!(device.state(), ConnectionState::Connecting);
        device.close().await;
        let mut events = device.subscribe_events();

        // 接続完了が切断後に届く
        peripheral.fire_connected();

        assert_eq!(device.state(), ConnectionState::Disconnected);
        assert!(drain(&mut events).is_empty());
        assert!(!device.is_keepalive_running());
        assert_eq!(device.heartbeat_count(), 0);

        // 次の接続要求は通常どおり完了する
        device.open().await;
        peripheral.fire_connected();
        assert_eq!(device.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_stuck_keepalive_is_aborted_with_timeout() {
        let token = CancellationToken::new();
        // キャンセルを無視するワーカー
        let handle = tokio::spawn(std::future::pending::<()>());
        let keepalive = KeepAlive { token, handle };

        let err = join_keepalive(keepalive, Duration::from_millis(20), "AA:22")
            .await
            .unwrap_err();
        assert!(matches!(err, BleLinkError::Timeout(_)));
        assert!(!err.is_hardware());
    }

    #[tokio::test]
    async fn test_unsolicited_connected_callback_is_dropped() {
        let peripheral = ScriptedPeripheral::new("Sensor", "AA:21");
        let device = device_with(&peripheral);
        let mut events = device.subscribe_events();

        peripheral.fire_connected();

        assert_eq!(device.state(), ConnectionState::Disconnected);
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn test_open_while_connected_is_noop() {
        let peripheral = ScriptedPeripheral::new("Sensor", "AA:03");
        let device = device_with(&peripheral);
        device.open().await;
        let mut events = device.subscribe_events();

        device.open().await;

        assert_eq!(peripheral.connect_calls(), 1);
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn test_failed_open_reverts_to_disconnected() {
        let peripheral = ScriptedPeripheral::new("Sensor", "AA:04");
        peripheral.set_fail_connect(true);
        let device = device_with(&peripheral);

        let err = device.try_open().await.unwrap_err();
        assert!(matches!(err, BleLinkError::ConnectionFailed(_)));
        assert_eq!(device.state(), ConnectionState::Disconnected);

        // 互換モードはログのみ
        device.open().await;
        assert_eq!(device.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let peripheral = ScriptedPeripheral::new("Sensor", "AA:05");
        let device = device_with(&peripheral);
        device.open().await;
        let mut events = device.subscribe_events();

        device.close().await;
        device.close().await;

        assert_eq!(peripheral.disconnect_calls(), 1);
        assert_eq!(device.state(), ConnectionState::Disconnected);
        assert!(!device.is_keepalive_running());
        assert_eq!(
            drain(&mut events),
            vec![
                DeviceEventKind::Disconnected,
                DeviceEventKind::Closed,
                DeviceEventKind::Disconnected,
                DeviceEventKind::Closed,
            ]
        );
    }

    #[tokio::test]
    async fn test_close_finishes_when_disconnect_fails() {
        let peripheral = ScriptedPeripheral::new("Sensor", "AA:06");
        let device = device_with(&peripheral);
        device.open().await;
        peripheral.set_fail_disconnect(true);

        let err = device.try_close().await.unwrap_err();
        assert!(matches!(err, BleLinkError::DisconnectFailed(_)));
        assert_eq!(device.state(), ConnectionState::Disconnected);
        assert!(!device.is_keepalive_running());
    }

    #[tokio::test]
    async fn test_reopen_after_close() {
        let peripheral = ScriptedPeripheral::new("Sensor", "AA:07");
        let device = device_with(&peripheral);

        for _ in 0..3 {
            device.open().await;
            assert_eq!(device.state(), ConnectionState::Connected);
            device.close().await;
            assert_eq!(device.state(), ConnectionState::Disconnected);
        }
        assert_eq!(peripheral.connect_calls(), 3);
        assert!(!device.is_keepalive_running());
    }

    #[tokio::test]
    async fn test_keepalive_heartbeats_and_stops() {
        let peripheral = ScriptedPeripheral::new("Sensor", "AA:08");
        let device = device_with(&peripheral);
        device.open().await;

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(device.heartbeat_count() > 0);

        device.close().await;
        let after_close = device.heartbeat_count();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(device.heartbeat_count(), after_close);
    }

    #[tokio::test]
    async fn test_remote_disconnect() {
        let peripheral = ScriptedPeripheral::new("Sensor", "AA:09");
        let device = device_with(&peripheral);
        device.open().await;
        let mut events = device.subscribe_events();

        peripheral.simulate_disconnect();

        assert_eq!(device.state(), ConnectionState::Disconnected);
        assert_eq!(drain(&mut events), vec![DeviceEventKind::Disconnected]);
        assert!(!device.is_keepalive_running());

        let beats = device.heartbeat_count();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(device.heartbeat_count(), beats);
    }

    #[tokio::test]
    async fn test_read_dispatches_decoded_value() {
        let peripheral = ScriptedPeripheral::new("Sensor", "AA:10");
        peripheral.set_value(uuid::BATTERY_SERVICE, uuid::BATTERY_LEVEL, &[0x01, 0x00]);
        let device = device_with(&peripheral);
        let mut data = device.subscribe_data();
        device.open().await;

        let value = device.try_read_characteristic(&battery()).await.unwrap();
        assert_eq!(value.data.as_u64(), 256);

        let delivered = data.try_recv().unwrap();
        assert_eq!(delivered.info, battery());
        assert_eq!(delivered.device, "AA:10");
    }

    #[tokio::test]
    async fn test_read_on_disconnected_device() {
        let peripheral = ScriptedPeripheral::new("Sensor", "AA:11");
        peripheral.set_value(uuid::BATTERY_SERVICE, uuid::BATTERY_LEVEL, &[0x64]);
        let device = device_with(&peripheral);
        let mut data = device.subscribe_data();

        let err = device.try_read_characteristic(&battery()).await.unwrap_err();
        assert!(matches!(err, BleLinkError::DeviceNotConnected(_)));

        device.read_characteristic(&battery()).await;
        assert!(data.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_late_read_after_close_is_dropped() {
        let peripheral = ScriptedPeripheral::new("Sensor", "AA:12");
        peripheral.set_value(uuid::BATTERY_SERVICE, uuid::BATTERY_LEVEL, &[0x2a]);
        let gate = Arc::new(Notify::new());
        peripheral.set_read_gate(Some(Arc::clone(&gate)));
        let device = device_with(&peripheral);
        let mut data = device.subscribe_data();
        device.open().await;

        let reader = {
            let device = Arc::clone(&device);
            tokio::spawn(async move { device.try_read_characteristic(&battery()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        device.close().await;
        gate.notify_one();

        let result = reader.await.unwrap();
        assert!(matches!(result, Err(BleLinkError::DeviceNotConnected(_))));
        assert!(data.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_write_without_response() {
        let peripheral = ScriptedPeripheral::new("Sensor", "AA:13");
        let device = device_with(&peripheral);
        device.open().await;

        device.write_characteristic(&battery(), &[0x01, 0x02]).await;

        let writes = peripheral.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, battery().key());
        assert_eq!(writes[0].1, vec![0x01, 0x02]);
    }

    #[tokio::test]
    async fn test_notifications_stop_after_close() {
        let peripheral = ScriptedPeripheral::new("Sensor", "AA:14");
        let device = device_with(&peripheral);
        let mut data = device.subscribe_data();
        device.open().await;

        device.try_notify_characteristic(&battery()).await.unwrap();
        // 二重購読はしない
        device.try_notify_characteristic(&battery()).await.unwrap();
        assert_eq!(device.subscriptions().len(), 1);

        assert_eq!(peripheral.push_notification(uuid::BATTERY_SERVICE, uuid::BATTERY_LEVEL, &[0x00, 0x01]), 1);
        assert_eq!(data.try_recv().unwrap().data.as_u64(), 1);

        device.close().await;
        assert!(device.subscriptions().is_empty());
        peripheral.push_notification(uuid::BATTERY_SERVICE, uuid::BATTERY_LEVEL, &[0x05]);
        assert!(data.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_set_peripheral_keeps_identity_and_state() {
        let first = ScriptedPeripheral::new("Sensor", "AA:15");
        let device = device_with(&first);
        device.open().await;

        let stranger = ScriptedPeripheral::new("Other", "FF:FF");
        device.set_peripheral(Arc::clone(&stranger) as Arc<dyn Peripheral>);
        assert!(!stranger.has_connection_callbacks());
        assert_eq!(device.address(), "AA:15");

        let refreshed = ScriptedPeripheral::new("Sensor", "AA:15");
        refreshed.set_connected(true);
        device.set_peripheral(Arc::clone(&refreshed) as Arc<dyn Peripheral>);
        assert!(refreshed.has_connection_callbacks());
        assert_eq!(device.state(), ConnectionState::Connected);

        refreshed.simulate_disconnect();
        assert_eq!(device.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_release_emits_removed_last() {
        let peripheral = ScriptedPeripheral::new("Sensor", "AA:16");
        let device = device_with(&peripheral);
        device.open().await;
        let mut events = device.subscribe_events();

        device.release().await;

        assert_eq!(
            drain(&mut events),
            vec![
                DeviceEventKind::Disconnected,
                DeviceEventKind::Closed,
                DeviceEventKind::Removed,
            ]
        );
    }
}
