//! 受信データの配信

use tokio::sync::broadcast;
use tracing::trace;

use crate::protocol::{to_hex_string, CharacteristicInfo, ReceivedValue};

/// 受信バイト列を型付きの値に変換し、購読者へ配信する
///
/// 配信順はスタックから届いた順（送信元ごと）。購読者の受信は
/// 各購読者のタスク上で行われる。
#[derive(Debug)]
pub struct DataDispatcher {
    address: String,
    sender: broadcast::Sender<ReceivedValue>,
}

impl DataDispatcher {
    pub fn new(address: impl Into<String>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        DataDispatcher {
            address: address.into(),
            sender,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReceivedValue> {
        self.sender.subscribe()
    }

    pub fn observer_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// デコードして配信。購読者がいなくても値は返す
    pub fn dispatch(&self, info: &CharacteristicInfo, bytes: &[u8]) -> ReceivedValue {
        let value = ReceivedValue::from_bytes(self.address.clone(), info.clone(), bytes);
        trace!(
            "{} <- {} = {} (0x{})",
            self.address,
            info.nice_name,
            value.data,
            to_hex_string(bytes)
        );
        let _ = self.sender.send(value.clone());
        value
    }
}
