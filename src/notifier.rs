// =============================================================================
// Notifier — order lifecycle tap for UI and alerting surfaces
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::timeframe::Timeframe;
use crate::types::Direction;

/// Which leg of the trade the notification refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderPhase {
    Entry,
    Exit,
}

/// One order lifecycle notification. `trade_id` is -1 for signal-only
/// notifications (no order was submitted).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderNotification {
    pub trade_id: i64,
    pub direction: Direction,
    pub market_id: String,
    pub price: f64,
    pub timestamp: f64,
    pub timeframe: Timeframe,
    pub phase: OrderPhase,
    #[serde(default)]
    pub profit_loss_rate: Option<f64>,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
}

/// Consumer of order lifecycle notifications.
pub trait Notifier: Send + Sync {
    fn notify_order(&self, notification: OrderNotification);
}

/// Default sink: structured log lines.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify_order(&self, n: OrderNotification) {
        info!(
            trade_id = n.trade_id,
            direction = %n.direction,
            market_id = %n.market_id,
            price = n.price,
            timeframe = %n.timeframe,
            phase = ?n.phase,
            pl = ?n.profit_loss_rate,
            sl = ?n.stop_loss,
            tp = ?n.take_profit,
            "order notification"
        );
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Captures notifications for assertions.
    #[derive(Debug, Default)]
    pub struct RecordingNotifier {
        pub notifications: Mutex<Vec<OrderNotification>>,
    }

    impl Notifier for RecordingNotifier {
        fn notify_order(&self, notification: OrderNotification) {
            self.notifications.lock().push(notification);
        }
    }
}
