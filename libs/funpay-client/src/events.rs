//! Events produced by the long-poll runner.

use std::sync::Arc;

use crate::types::{ChatShortcut, Message, OrderCounters, OrderShortcut};

/// Sibling `NewMessage` events produced by one history fetch for one chat.
///
/// Handlers inspect the stack to act once per batch (log output, Telegram
/// digests) instead of once per message.
#[derive(Debug, Clone)]
pub struct MessageEventsStack {
    messages: Arc<Vec<Message>>,
}

impl MessageEventsStack {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages: Arc::new(messages),
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last_id(&self) -> Option<i64> {
        self.messages.last().map(|m| m.id)
    }
}

#[derive(Debug, Clone)]
pub struct NewMessageEvent {
    pub tag: String,
    pub message: Message,
    pub stack: MessageEventsStack,
}

#[derive(Debug, Clone)]
pub struct NewOrderEvent {
    pub tag: String,
    pub order: OrderShortcut,
}

/// Everything the runner can emit, in the order constraints of the polling
/// contract (see [`crate::runner`]).
#[derive(Debug, Clone)]
pub enum Event {
    /// One per chat on the first cycle; seeds cursors, fetches nothing.
    InitialChat { tag: String, chat: ChatShortcut },
    ChatsListChanged { tag: String },
    LastChatMessageChanged { tag: String, chat: ChatShortcut },
    NewMessage(NewMessageEvent),
    InitialOrder { tag: String, order: OrderShortcut },
    OrdersListChanged { tag: String, counters: OrderCounters },
    NewOrder(NewOrderEvent),
    OrderStatusChanged { tag: String, order: OrderShortcut },
}

impl Event {
    pub fn tag(&self) -> &str {
        match self {
            Event::InitialChat { tag, .. }
            | Event::ChatsListChanged { tag }
            | Event::LastChatMessageChanged { tag, .. }
            | Event::InitialOrder { tag, .. }
            | Event::OrdersListChanged { tag, .. }
            | Event::OrderStatusChanged { tag, .. } => tag,
            Event::NewMessage(e) => &e.tag,
            Event::NewOrder(e) => &e.tag,
        }
    }
}
