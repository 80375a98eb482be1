//! Bluetooth共通モジュール

pub mod traits;
pub mod device;
pub mod dispatcher;
pub mod inventory;
pub mod manager;
pub mod session;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

// 再エクスポート
pub use traits::{
    Adapter,
    AdapterProvider,
    DeviceInfo,
    EventCallback,
    NotificationCallback,
    Peripheral,
    PeripheralCallback,
    ScanCallbacks,
};

pub use device::{BleDevice, ConnectionState, DeviceConfig, DeviceEvent, DeviceEventKind};
pub use dispatcher::DataDispatcher;
pub use inventory::{CapabilityEntry, CharacteristicInventory, CharacteristicNode, DeviceNode, ServiceNode};
pub use manager::{BleDeviceManager, ReconcileReport, RegistryEvent};
pub use session::{BleSession, SessionState};
