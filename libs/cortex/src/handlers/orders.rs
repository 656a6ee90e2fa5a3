//! New-order chain: classification against the auto-delivery config,
//! operator notification, goods delivery and the follow-up lot-state sweep.

use std::sync::Arc;

use bot_config::DeliveryRule;
use funpay_client::events::NewOrderEvent;
use funpay_client::types::{OrderShortcut, OrderStatus};
use tracing::{error, info, warn};

use crate::control_plane::NotificationKind;
use crate::cortex::{Cortex, TEST_ORDER_ID};
use crate::expander::{self, OrderSource};
use crate::handlers::lots;
use crate::inventory;

/// Typed side-channel the chain writes as it progresses; replaces ad-hoc
/// attributes on the event object.
#[derive(Debug, Clone, Default)]
pub struct DeliveryOutcome {
    pub rule_name: Option<String>,
    pub rule: Option<DeliveryRule>,
    pub delivered: bool,
    pub delivery_text: Option<String>,
    pub goods_delivered: u32,
    /// -1 means no inventory file backs the lot (infinite stock).
    pub goods_left: i64,
    pub error: bool,
    pub error_text: Option<String>,
}

/// `OrdersListChanged` chain: refresh the tagged profile snapshot in the
/// background so the lot-state sweep has something newer than the order.
pub fn schedule_profile_refresh(cortex: &Arc<Cortex>, tag: &str) {
    let cortex = Arc::clone(cortex);
    let tag = tag.to_owned();
    let pool = cortex.pool.clone();
    pool.spawn("profile_refresh", async move {
        info!("refreshing lots after order list change");
        if cortex.refresh_current_profile(&tag, 3).await {
            lots::update_lots_states(&cortex, &tag).await;
        }
    });
}

/// The `NewOrder` chain, in order: log, classify, notify, deliver, update
/// lot states. Classification runs synchronously so everything after it
/// sees the matched rule.
pub async fn handle_new_order(cortex: &Arc<Cortex>, event: NewOrderEvent) {
    info!(order_id = %event.order.id, "new order");

    let mut outcome = DeliveryOutcome {
        goods_left: -1,
        ..DeliveryOutcome::default()
    };
    classify_order(cortex, &event.order, &mut outcome);

    notify_new_order(cortex, &event.order, &outcome);

    if should_deliver(cortex, &event.order, &outcome) {
        let cortex_task = Arc::clone(cortex);
        let order = event.order.clone();
        let pool = cortex.pool.clone();
        pool.spawn("deliver_goods", async move {
            let mut outcome = outcome;
            deliver_goods(&cortex_task, &order, &mut outcome).await;
            notify_delivery(&cortex_task, &order, &outcome);
        });
    }

    let cortex_task = Arc::clone(cortex);
    let tag = event.tag.clone();
    let pool = cortex.pool.clone();
    pool.spawn("lot_states", async move {
        lots::update_lots_states(&cortex_task, &tag).await;
    });
}

/// Attaches the auto-delivery rule matching this order, refining the lot
/// description against our own listings first.
fn classify_order(cortex: &Arc<Cortex>, order: &OrderShortcut, outcome: &mut DeliveryOutcome) {
    let mut description = order.description.clone();
    if let (Some(profile), Some(subcategory_id)) = (cortex.profile(), order.subcategory_id) {
        // The order page truncates long titles; the longest of our own lot
        // descriptions contained in it is the real title.
        for lot in profile.lots_in_subcategory(subcategory_id) {
            if let Some(composite) = lot.composite_description() {
                if order.description.contains(&composite) {
                    description = composite;
                    break;
                }
            }
        }
    }

    let auto_delivery = cortex.auto_delivery.read();
    match auto_delivery.classify(&description) {
        Some((name, rule)) => {
            info!(rule = name, "order matched an auto-delivery rule");
            outcome.rule_name = Some(name.to_owned());
            outcome.rule = Some(rule.clone());
        }
        None => {
            info!("order not present in the auto-delivery config");
        }
    }
}

fn should_deliver(cortex: &Arc<Cortex>, order: &OrderShortcut, outcome: &DeliveryOutcome) -> bool {
    let Some(rule) = &outcome.rule else {
        return false;
    };
    if !cortex.autodelivery_enabled() {
        return false;
    }
    if rule.disable {
        info!(order_id = %order.id, "auto-delivery disabled for this lot");
        return false;
    }
    let block_delivery = cortex.main_cfg.read().blocklist.block_delivery;
    if block_delivery && cortex.is_blacklisted(&order.buyer_username) {
        info!(
            order_id = %order.id,
            buyer = %order.buyer_username,
            "buyer blacklisted, delivery blocked"
        );
        return false;
    }
    true
}

/// Draws inventory (if configured), substitutes `$product` and sends. On a
/// send failure after a successful draw the lines go back to the front of
/// the file.
pub async fn deliver_goods(cortex: &Arc<Cortex>, order: &OrderShortcut, outcome: &mut DeliveryOutcome) {
    let Some(rule) = outcome.rule.clone() else {
        return;
    };

    let chat = match cortex.account().get_chat_by_name(&order.buyer_username, true).await {
        Ok(Some(chat)) => chat,
        _ if order.id == TEST_ORDER_ID => {
            // Test orders carry the originating chat directly.
            funpay_client::types::ChatShortcut {
                id: order.chat_id,
                name: order.buyer_username.clone(),
                last_message_text: String::new(),
                node_msg_id: -1,
                user_msg_id: -1,
                unread: false,
                last_by_bot: false,
                last_by_vertex: false,
                html: String::new(),
            }
        }
        _ => {
            let text = format!("no chat found for order {}, cannot deliver", order.id);
            error!(buyer = %order.buyer_username, "{text}");
            outcome.error = true;
            outcome.error_text = Some(text);
            return;
        }
    };

    let mut delivery_text =
        expander::format_order_text(&rule.response, &OrderSource::Shortcut(order));

    let mut amount: u32 = 1;
    let mut drawn: Vec<String> = Vec::new();
    if let Some(file_name) = &rule.products_file_name {
        if cortex.multidelivery_enabled() && !rule.disable_multi_delivery {
            amount = order.amount.max(1);
        }
        let path = cortex.paths.product_file(file_name);
        match inventory::draw(&path, amount as usize) {
            Ok((records, left)) => {
                outcome.goods_left = left as i64;
                delivery_text =
                    delivery_text.replace("$product", &records.join("\n").replace("\\n", "\n"));
                drawn = records;
            }
            Err(e) => {
                let text = format!("delivery failed for order #{}: {e}", order.id);
                error!("{text}");
                cortex.bridge.notify(NotificationKind::Critical, text.clone());
                outcome.error = true;
                outcome.error_text = Some(text);
                return;
            }
        }
    }

    let sent = cortex
        .send_message(chat.id, &delivery_text, Some(&order.buyer_username), None, true)
        .await;
    match sent {
        Some(messages) if !messages.is_empty() => {
            info!(order_id = %order.id, "goods delivered");
            outcome.delivered = true;
            outcome.delivery_text = Some(delivery_text);
            outcome.goods_delivered = amount;
        }
        _ => {
            error!(order_id = %order.id, "failed to send the goods message");
            outcome.error = true;
            outcome.error_text =
                Some(format!("failed to send the goods message for order {}", order.id));
            if let Some(file_name) = &rule.products_file_name {
                if !drawn.is_empty() {
                    let path = cortex.paths.product_file(file_name);
                    if let Err(e) = inventory::push_front(&path, &drawn) {
                        error!(error = %e, "failed to restore drawn records");
                    }
                }
            }
        }
    }
}

fn notify_new_order(cortex: &Arc<Cortex>, order: &OrderShortcut, outcome: &DeliveryOutcome) {
    {
        let cfg = cortex.main_cfg.read();
        if cfg.blocklist.block_new_order_notification && cortex.is_blacklisted(&order.buyer_username)
        {
            return;
        }
    }
    let delivery_info = match &outcome.rule {
        None => "lot not present in the auto-delivery config",
        Some(_) if !cortex.autodelivery_enabled() => "auto-delivery is globally off",
        Some(rule) if rule.disable => "auto-delivery is disabled for this lot",
        Some(_)
            if cortex.main_cfg.read().blocklist.block_delivery
                && cortex.is_blacklisted(&order.buyer_username) =>
        {
            "buyer is blacklisted, delivery blocked"
        }
        Some(_) => "goods will be delivered",
    };

    let cortex = Arc::clone(cortex);
    let order = order.clone();
    let delivery_info = delivery_info.to_owned();
    let pool = cortex.pool.clone();
    pool.spawn("order_notification", async move {
        let full = cortex.resolve_order(&order.id).await;
        let text = match full {
            Some(full) => format!(
                "New order #{}: {} ({}) from {} for {} {} ({} {} to receive). {}",
                order.id,
                order.description,
                order.subcategory_name,
                order.buyer_username,
                order.price,
                order.currency,
                full.sum,
                full.currency,
                delivery_info,
            ),
            None => format!(
                "New order #{}: {} ({}) from {} for {} {}. {}",
                order.id,
                order.description,
                order.subcategory_name,
                order.buyer_username,
                order.price,
                order.currency,
                delivery_info,
            ),
        };
        cortex.bridge.notify(NotificationKind::Order, text);
    });
}

fn notify_delivery(cortex: &Arc<Cortex>, order: &OrderShortcut, outcome: &DeliveryOutcome) {
    if !outcome.delivered && !outcome.error {
        return;
    }
    let text = if outcome.error {
        format!(
            "Delivery error: {}",
            outcome.error_text.as_deref().unwrap_or("unknown error")
        )
    } else {
        let left = if outcome.goods_left < 0 {
            "∞".to_owned()
        } else {
            outcome.goods_left.to_string()
        };
        format!(
            "Delivered goods for order #{} ({} item(s), {} left):\n{}",
            order.id,
            outcome.goods_delivered,
            left,
            outcome.delivery_text.as_deref().unwrap_or(""),
        )
    };
    cortex.bridge.notify(NotificationKind::Delivery, text);
}

/// `OrderStatusChanged` chain: thank-you reply, confirmation notification,
/// withdrawal forecast bookkeeping, order cache invalidation.
pub async fn handle_status_changed(cortex: &Arc<Cortex>, _tag: &str, order: &OrderShortcut) {
    cortex.invalidate_order_cache(&order.id);
    if order.status != OrderStatus::Closed {
        return;
    }
    cortex.record_withdrawal(order);
    send_thank_you(cortex, order);
    notify_confirmed(cortex, order);
}

fn send_thank_you(cortex: &Arc<Cortex>, order: &OrderShortcut) {
    let (send_reply, reply_text, watermark) = {
        let cfg = cortex.main_cfg.read();
        (
            cfg.order_confirm.send_reply,
            cfg.order_confirm.reply_text.clone(),
            cfg.order_confirm.watermark,
        )
    };
    if !send_reply || reply_text.is_empty() {
        return;
    }
    let cortex = Arc::clone(cortex);
    let order = order.clone();
    let pool = cortex.pool.clone();
    pool.spawn("thank_you", async move {
        let chat = match cortex.account().get_chat_by_name(&order.buyer_username, true).await {
            Ok(Some(chat)) => chat,
            _ => {
                warn!(buyer = %order.buyer_username, "no chat found for the thank-you reply");
                return;
            }
        };
        info!(
            order_id = %order.id,
            buyer = %order.buyer_username,
            "order confirmed, sending reply"
        );
        let text = expander::format_order_text(&reply_text, &OrderSource::Shortcut(&order));
        cortex
            .send_message(chat.id, &text, Some(&order.buyer_username), None, watermark)
            .await;
    });
}

fn notify_confirmed(cortex: &Arc<Cortex>, order: &OrderShortcut) {
    cortex.bridge.notify(
        NotificationKind::OrderConfirmed,
        format!(
            "{} confirmed order #{} ({} {})",
            order.buyer_username, order.id, order.price, order.currency
        ),
    );
}
