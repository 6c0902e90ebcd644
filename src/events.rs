// =============================================================================
// Event Bus — best-effort push channel toward the UI subscriber
// =============================================================================
//
// Delivery is non-blocking: if no subscriber is attached, or the subscriber
// fell behind and dropped its receiver, events are discarded. The core never
// waits on the bus and subscribers must not call back into the core.
// =============================================================================

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::types::Side;

/// Payload for a `placed` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacedEvent {
    pub symbol: String,
    pub interval: String,
    pub side: Side,
    pub qty: f64,
    pub price: f64,
    #[serde(default)]
    pub avg_price: f64,
    pub leverage: u32,
    pub trigger_indicators: Vec<String>,
    pub trigger_desc: String,
    pub time: String,
    pub status: String,
    pub ok: bool,
    #[serde(default)]
    pub order_id: Option<u64>,
    #[serde(default)]
    pub client_order_id: Option<String>,
    #[serde(default)]
    pub commission_usdt: Option<f64>,
    #[serde(default)]
    pub net_realized_usdt: Option<f64>,
}

/// Payload for `close` and `close_interval` events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseEvent {
    pub symbol: String,
    pub interval: String,
    pub side: Side,
    pub qty: f64,
    pub close_price: f64,
    pub entry_price: f64,
    pub pnl_value: f64,
    pub margin_usdt: f64,
    pub leverage: u32,
    pub roi_percent: f64,
    #[serde(default)]
    pub ledger_id: Option<String>,
    #[serde(default)]
    pub entry_fee_usdt: Option<f64>,
    #[serde(default)]
    pub close_fee_usdt: Option<f64>,
    #[serde(default)]
    pub realized_pnl_usdt: Option<f64>,
    pub reason: String,
    pub latency_seconds: f64,
    pub latency_ms: f64,
    pub event_id: String,
}

/// Payload for emergency lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyEvent {
    pub reason: String,
    pub source: String,
    pub requested_at: f64,
    #[serde(default)]
    pub completed_at: Option<f64>,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Everything the core publishes to the outside.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    Placed(PlacedEvent),
    Close(CloseEvent),
    CloseInterval(CloseEvent),
    EmergencyStarted(EmergencyEvent),
    EmergencyCompleted(EmergencyEvent),
}

/// Single-subscriber, non-blocking event channel.
pub struct EventBus {
    sender: Mutex<Option<mpsc::UnboundedSender<EngineEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            sender: Mutex::new(None),
        }
    }

    /// Attach the (single) subscriber, replacing any previous one.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<EngineEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.sender.lock() = Some(tx);
        rx
    }

    /// Publish an event. Never blocks; silently drops when nobody listens.
    pub fn emit(&self, event: EngineEvent) {
        let mut guard = self.sender.lock();
        if let Some(tx) = guard.as_ref() {
            if tx.send(event).is_err() {
                // Receiver gone; detach so later sends skip the clone.
                debug!("event subscriber dropped; detaching");
                *guard = None;
            }
        }
    }

    pub fn emit_placed(&self, event: PlacedEvent) {
        self.emit(EngineEvent::Placed(event));
    }

    pub fn emit_close(&self, event: CloseEvent) {
        self.emit(EngineEvent::Close(event));
    }

    pub fn emit_close_interval(&self, event: CloseEvent) {
        self.emit(EngineEvent::CloseInterval(event));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Fresh event id for close events.
pub fn new_event_id() -> String {
    Uuid::new_v4().to_string()
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn sample_close() -> CloseEvent {
        CloseEvent {
            symbol: "BTCUSDT".into(),
            interval: "1m".into(),
            side: Side::Buy,
            qty: 0.005,
            close_price: 19_000.0,
            entry_price: 20_000.0,
            pnl_value: -5.0,
            margin_usdt: 20.0,
            leverage: 5,
            roi_percent: -25.0,
            ledger_id: None,
            entry_fee_usdt: None,
            close_fee_usdt: None,
            realized_pnl_usdt: None,
            reason: "per_trade_stop_loss".into(),
            latency_seconds: 0.1,
            latency_ms: 100.0,
            event_id: new_event_id(),
        }
    }

    #[tokio::test]
    async fn delivers_to_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit_close(sample_close());
        match rx.recv().await.unwrap() {
            EngineEvent::Close(ev) => assert_eq!(ev.reason, "per_trade_stop_loss"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn emit_without_subscriber_is_noop() {
        let bus = EventBus::new();
        bus.emit_close(sample_close());
    }

    #[tokio::test]
    async fn detaches_after_receiver_drop() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        drop(rx);
        bus.emit_close(sample_close());
        bus.emit_close(sample_close());
        assert!(bus.sender.lock().is_none());
    }
}
