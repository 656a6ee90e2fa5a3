//! Chat-message chain: logging, the greeting gate, auto-replies,
//! notifications and the operator's delivery test hook.

use std::sync::Arc;

use funpay_client::events::NewMessageEvent;
use funpay_client::types::{ChatShortcut, Currency, Message, MessageType, OrderShortcut, OrderStatus};
use tracing::{info, warn};

use crate::control_plane::NotificationKind;
use crate::cortex::{Cortex, TEST_ORDER_ID};
use crate::expander::{self, MessageSource};
use crate::handlers::{orders, reviews};

/// Literal prefix of the operator's delivery-test command.
pub const DELIVERY_TEST_PREFIX: &str = "!автовыдача";

/// The `NewMessage` chain, in order.
pub async fn handle_new_message(cortex: &Arc<Cortex>, event: &NewMessageEvent) {
    log_new_message(event);
    greetings_gate(cortex, event.message.chat_id, Some(&event.message), None);
    auto_reply(cortex, &event.message.chat_id, event.message.display_text(), &event.message.author, || {
        MessageSource::Message(&event.message)
    });
    reviews::process_review(cortex, &event.message);
    notify_new_message(cortex, event);
    notify_command(cortex, event.message.display_text(), &event.message.author, || {
        MessageSource::Message(&event.message)
    });
    test_auto_delivery(
        cortex,
        &event.tag,
        event.message.display_text(),
        event.message.chat_id,
        event.message.chat_name.as_deref().unwrap_or(&event.message.author),
    );
}

/// The legacy chain driven by chat-list snapshots only (`oldMsgGetMode`).
pub async fn handle_legacy_chat_message(cortex: &Arc<Cortex>, tag: &str, chat: &ChatShortcut) {
    greetings_gate(cortex, chat.id, None, Some(chat));
    auto_reply(cortex, &chat.id, &chat.last_message_text, &chat.name, || {
        MessageSource::Chat(chat)
    });
    reviews::process_review_legacy(cortex, chat);
    notify_legacy_message(cortex, chat);
    notify_command(cortex, &chat.last_message_text, &chat.name, || {
        MessageSource::Chat(chat)
    });
    test_auto_delivery(cortex, tag, &chat.last_message_text, chat.id, &chat.name);
}

/// Chats that existed before the first cycle are marked seen so a dialog
/// started long ago never triggers a greeting.
pub fn save_initial_chat(cortex: &Arc<Cortex>, chat: &ChatShortcut) {
    let now = chrono::Utc::now().timestamp();
    let mut old_users = cortex.old_users.lock();
    if old_users.last_seen(chat.id).is_none() {
        if let Err(e) = old_users.mark_seen(chat.id, now) {
            warn!(chat_id = chat.id, error = %e, "failed to persist greeting table");
        }
    }
}

fn log_new_message(event: &NewMessageEvent) {
    // A batch is logged once, on its last event.
    if event.stack.last_id() != Some(event.message.id) {
        return;
    }
    let chat_name = event.message.chat_name.as_deref().unwrap_or("?");
    info!(
        chat = chat_name,
        chat_id = event.message.chat_id,
        "new messages"
    );
    for message in event.stack.messages() {
        info!("  {}: {}", message.author, message.display_text());
    }
}

/// The single-shot greeting gate.
///
/// The eligibility check and the mark-as-seen happen under one lock so two
/// concurrent events for the same chat can never both pass.
fn greetings_gate(
    cortex: &Arc<Cortex>,
    chat_id: i64,
    message: Option<&Message>,
    chat: Option<&ChatShortcut>,
) {
    let (send_greetings, cooldown_days, ignore_system, greeting_template) = {
        let cfg = cortex.main_cfg.read();
        (
            cfg.greetings.send_greetings,
            cfg.greetings.greetings_cooldown,
            cfg.greetings.ignore_system_messages,
            cfg.greetings.greetings_text.clone(),
        )
    };
    if !send_greetings {
        return;
    }

    let (kind, its_me, badge, chat_name) = match (message, chat) {
        (Some(m), _) => (
            m.kind,
            m.author_id == cortex.account().id(),
            m.badge.clone(),
            m.chat_name.clone().unwrap_or_else(|| m.author.clone()),
        ),
        (None, Some(c)) => (MessageType::NonSystem, !c.unread, None, c.name.clone()),
        (None, None) => return,
    };
    let now = chrono::Utc::now().timestamp();

    // Our own opening message makes the chat "old" without greeting it.
    if its_me {
        let mut old_users = cortex.old_users.lock();
        if old_users.last_seen(chat_id).is_none() {
            if let Err(e) = old_users.mark_seen(chat_id, now) {
                warn!(chat_id, error = %e, "failed to persist greeting table");
            }
        }
        return;
    }

    {
        let mut old_users = cortex.old_users.lock();
        let cooldown_secs = (cooldown_days * 86_400.0) as i64;
        if let Some(seen) = old_users.last_seen(chat_id) {
            if now - seen < cooldown_secs {
                return;
            }
        }

        let ignored = kind == MessageType::OrderPurchased
            || kind == MessageType::DearVendors
            || kind == MessageType::OrderConfirmedByAdmin
            || badge.is_some()
            || (kind != MessageType::NonSystem && ignore_system);
        if ignored {
            return;
        }

        if let Err(e) = old_users.mark_seen(chat_id, now) {
            warn!(chat_id, error = %e, "failed to persist greeting table");
        }
    }

    let text = match (message, chat) {
        (Some(m), _) => expander::format_msg_text(&greeting_template, &MessageSource::Message(m)),
        (None, Some(c)) => expander::format_msg_text(&greeting_template, &MessageSource::Chat(c)),
        (None, None) => return,
    };
    info!(chat = %chat_name, chat_id, "sending greeting");
    let cortex = Arc::clone(cortex);
    let pool = cortex.pool.clone();
    pool.spawn("greeting", async move {
        cortex
            .send_message(chat_id, &text, Some(&chat_name), None, true)
            .await;
    });
}

fn auto_reply<'a>(
    cortex: &Arc<Cortex>,
    chat_id: &i64,
    text: &str,
    author: &str,
    source: impl FnOnce() -> MessageSource<'a>,
) {
    if !cortex.autoresponse_enabled() {
        return;
    }
    let block_response = cortex.main_cfg.read().blocklist.block_response;
    if block_response && cortex.is_blacklisted(author) {
        return;
    }
    let command = bot_config::auto_response::normalize_command(text);
    let Some(rule) = cortex.auto_response.read().get(&command).cloned() else {
        return;
    };

    let chat_id = *chat_id;
    info!(command = %command, chat_id, "auto-reply command received");
    let response = expander::format_msg_text(&rule.response, &source());
    let author = author.to_owned();
    let cortex = Arc::clone(cortex);
    let pool = cortex.pool.clone();
    pool.spawn("auto_reply", async move {
        cortex
            .send_message(chat_id, &response, Some(&author), None, true)
            .await;
    });
}

/// New-message notification with the `NewMessageView` include/only filters
/// and stack-level dedup.
fn notify_new_message(cortex: &Arc<Cortex>, event: &NewMessageEvent) {
    let chat_name = event
        .message
        .chat_name
        .clone()
        .unwrap_or_else(|| event.message.author.clone());
    {
        let cfg = cortex.main_cfg.read();
        if cfg.blocklist.block_new_message_notification && cortex.is_blacklisted(&chat_name) {
            return;
        }
    }

    let fresh: Vec<&Message> = event
        .stack
        .messages()
        .iter()
        .filter(|m| cortex.mark_notified(m.chat_id, m.id))
        .collect();
    if fresh.is_empty() {
        return;
    }

    let view = cortex.main_cfg.read().new_message_view.clone();
    let own_id = cortex.account().id();
    let mut included = Vec::new();
    let (mut my, mut fp, mut bot, mut other) = (false, false, false, false);
    for message in fresh {
        if message.author_id == 0 {
            if view.include_fp_messages {
                included.push(message);
                fp = true;
            }
        } else if message.by_bot {
            if view.include_bot_messages {
                included.push(message);
                bot = true;
            }
        } else if message.author_id == own_id {
            if view.include_my_messages {
                included.push(message);
                my = true;
            }
        } else {
            included.push(message);
            other = true;
        }
    }
    if included.is_empty() {
        return;
    }

    // A batch of only our own / only marketplace / only bot messages is
    // suppressed unless the matching notify-only flag asks for it.
    let single_kind = [my, fp, bot, other].iter().filter(|v| **v).count() == 1;
    if single_kind
        && ((my && !view.notify_only_my_messages)
            || (fp && !view.notify_only_fp_messages)
            || (bot && !view.notify_only_bot_messages))
    {
        return;
    }

    if included.len() == 1 {
        let text = included[0].display_text();
        if cortex.auto_response.read().matches(text) || text.starts_with(DELIVERY_TEST_PREFIX) {
            return;
        }
    }

    let mut lines = Vec::new();
    for message in &included {
        let body = match (&message.text, &message.image_link) {
            (Some(t), _) => t.clone(),
            (None, Some(link)) => format!("[image] {link}"),
            _ => String::new(),
        };
        lines.push(format!("{}: {}", message.author, body));
    }
    cortex.bridge.notify(
        NotificationKind::Message,
        format!("{chat_name} (chat {}):\n{}", event.message.chat_id, lines.join("\n")),
    );
}

fn notify_legacy_message(cortex: &Arc<Cortex>, chat: &ChatShortcut) {
    let cfg = cortex.main_cfg.read();
    if !chat.unread
        || (cfg.blocklist.block_new_message_notification && cortex.is_blacklisted(&chat.name))
    {
        return;
    }
    drop(cfg);
    if funpay_client::patterns::classify_message(&chat.last_message_text)
        != MessageType::NonSystem
    {
        return;
    }
    if cortex.auto_response.read().matches(&chat.last_message_text)
        || chat.last_message_text.starts_with(DELIVERY_TEST_PREFIX)
    {
        return;
    }
    cortex.bridge.notify(
        NotificationKind::Message,
        format!("{}: {}", chat.name, chat.last_message_text),
    );
}

fn notify_command<'a>(
    cortex: &Arc<Cortex>,
    text: &str,
    author: &str,
    source: impl FnOnce() -> MessageSource<'a>,
) {
    {
        let cfg = cortex.main_cfg.read();
        if cfg.blocklist.block_command_notification && cortex.is_blacklisted(author) {
            return;
        }
    }
    let command = bot_config::auto_response::normalize_command(text);
    let Some(rule) = cortex.auto_response.read().get(&command).cloned() else {
        return;
    };
    if !rule.telegram_notification {
        return;
    }
    let text = match &rule.notification_text {
        Some(template) => expander::format_msg_text(template, &source()),
        None => format!("{author} used the {command} command"),
    };
    cortex.bridge.notify(NotificationKind::Command, text);
}

/// `!автовыдача <key>`: consumes a one-shot key and feeds a synthetic
/// order through the new-order chain.
fn test_auto_delivery(cortex: &Arc<Cortex>, tag: &str, text: &str, chat_id: i64, chat_name: &str) {
    if !text.starts_with(DELIVERY_TEST_PREFIX) {
        return;
    }
    let Some(key) = text.split_whitespace().nth(1).map(str::to_owned) else {
        warn!("delivery test key missing");
        return;
    };
    let Some(lot_title) = cortex.consume_delivery_test(&key) else {
        warn!("invalid one-shot delivery test key");
        return;
    };

    let order = OrderShortcut {
        id: TEST_ORDER_ID.to_owned(),
        description: lot_title,
        subcategory_name: "Авто-выдача, Тест".to_owned(),
        subcategory_id: None,
        price: 0.0,
        currency: Currency::Unknown,
        buyer_username: chat_name.to_owned(),
        buyer_id: 0,
        chat_id,
        status: OrderStatus::Paid,
        date: chrono::Utc::now(),
        amount: 1,
        html: String::new(),
    };
    let event = funpay_client::events::NewOrderEvent {
        tag: tag.to_owned(),
        order,
    };
    let cortex = Arc::clone(cortex);
    let pool = cortex.pool.clone();
    pool.spawn("delivery_test", async move {
        orders::handle_new_order(&cortex, event).await;
    });
}
