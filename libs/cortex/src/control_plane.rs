//! Bridge between the core and whatever control-plane front-end is
//! attached (a Telegram bot in production, a log drain in tests).
//!
//! The core never talks to the front-end directly: it fans typed
//! notifications out over a channel and accepts imperative commands back.

use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    Message,
    Order,
    OrderConfirmed,
    Review,
    Delivery,
    Raise,
    LotActivate,
    LotDeactivate,
    Command,
    BotStart,
    Critical,
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub kind: NotificationKind,
    pub text: String,
}

/// Imperative operations the front-end can request.
#[derive(Debug, Clone)]
pub enum ControlCommand {
    SendMessage { chat_id: i64, text: String },
    RefundOrder { order_id: String },
    RefreshProfile,
    ToggleAutoRaise,
    ToggleAutoResponse,
    ToggleAutoDelivery,
    /// Registers a one-shot auto-delivery test key bound to a lot title.
    SubmitDeliveryTest { key: String, lot_title: String },
}

#[derive(Clone)]
pub struct ControlPlane {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ControlPlane {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// A bridge with no front-end attached; notifications are dropped.
    pub fn disconnected() -> Self {
        let (bridge, _rx) = Self::channel();
        bridge
    }

    pub fn notify(&self, kind: NotificationKind, text: impl Into<String>) {
        let notification = Notification {
            kind,
            text: text.into(),
        };
        if self.tx.send(notification).is_err() {
            debug!("control plane receiver detached, dropping notification");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn notifications_arrive_in_order() {
        let (bridge, mut rx) = ControlPlane::channel();
        bridge.notify(NotificationKind::BotStart, "started");
        bridge.notify(NotificationKind::Critical, "oops");

        let first = rx.recv().await.unwrap();
        assert_eq!(first.kind, NotificationKind::BotStart);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.kind, NotificationKind::Critical);
    }

    #[test]
    fn disconnected_bridge_drops_silently() {
        let bridge = ControlPlane::disconnected();
        bridge.notify(NotificationKind::Message, "nobody listens");
    }
}
