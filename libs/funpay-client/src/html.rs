//! Parsers for the HTML fragments the marketplace embeds in its responses.
//!
//! Selectors follow the frontend's markup as observed; there is no schema
//! to validate against, so every accessor degrades to `None`/skip rather
//! than failing the whole fragment.

use std::collections::HashMap;

use chrono::{TimeZone, Utc};
use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Selector};

use crate::error::{ClientError, Result};
use crate::patterns;
use crate::types::{
    Balance, Category, ChatShortcut, Currency, LotShortcut, Message, MessageType, OrderShortcut,
    OrderStatus, Profile, Review, Subcategory, SubcategoryType,
};

/// Marker characters prepended to outgoing texts so the bot can recognize
/// its own (and a predecessor bot's) messages in chat snapshots.
pub const BOT_MARKER: char = '\u{2061}';
pub const VERTEX_MARKER: char = '\u{2064}';

macro_rules! selector {
    ($name:ident, $css:expr) => {
        static $name: Lazy<Selector> = Lazy::new(|| Selector::parse($css).unwrap());
    };
}

selector!(CONTACT_ITEM, "a.contact-item");
selector!(CONTACT_MESSAGE, "div.contact-item-message");
selector!(MEDIA_USER_NAME, "div.media-user-name");
selector!(CHAT_MESSAGE, "div.chat-msg-item");
selector!(CHAT_MSG_TEXT, "div.chat-msg-text");
selector!(CHAT_MSG_AUTHOR, "div.media-user-name a");
selector!(CHAT_MSG_BADGE, "span.chat-msg-author-label");
selector!(CHAT_IMG_LINK, "a.chat-img-link");
selector!(SALE_ROW, "a.tc-item");
selector!(SALE_ORDER_ID, "div.tc-order");
selector!(SALE_DESC, "div.order-desc div");
selector!(SALE_PRICE, "div.tc-price");
selector!(SALE_BUYER, "div.media-user-name span");
selector!(SALE_DATE, "div.tc-date-time");
selector!(OFFER_BLOCK, "div.offer");
selector!(OFFER_TITLE_LINK, "div.offer-list-title a");
selector!(OFFER_ROW, "a.tc-item[data-offer]");
selector!(OFFER_SERVER, "div.tc-server");
selector!(OFFER_DESC, "div.tc-desc-text");
selector!(APP_DATA, "body[data-app-data]");
selector!(FORM_INPUT, "form.form-offer-editor input, form.form-offer-editor textarea");
selector!(FORM_SELECT, "form.form-offer-editor select");
selector!(SELECTED_OPTION, "option[selected]");
selector!(BALANCE_BADGE, "span.badge-balance");
selector!(ORDER_STATUS, "h1.page-header span");
selector!(ORDER_PARAM, "div.param-item");
selector!(ORDER_PARAM_NAME, "h5");
selector!(ORDER_PARAM_VALUE, "div");
selector!(REVIEW_BLOCK, "div.order-review");
selector!(REVIEW_STARS, "div.rating div");
selector!(REVIEW_TEXT, "div.review-item-text");
selector!(REVIEW_REPLY, "div.review-item-answer div.review-item-text");

fn text_of(el: ElementRef<'_>) -> String {
    el.text().collect::<String>().trim().to_owned()
}

fn attr_i64(el: ElementRef<'_>, name: &str) -> Option<i64> {
    el.value().attr(name).and_then(|v| v.parse().ok())
}

selector!(USERNAME, "div.user-link-name");
selector!(ACTIVE_SALES_BADGE, "span.badge-trade");

/// Display name from the page header, when logged in.
pub fn parse_username(page: &str) -> Option<String> {
    let doc = Html::parse_document(page);
    doc.select(&USERNAME).next().map(text_of).filter(|s| !s.is_empty())
}

/// Count of unfinished sales from the header badge.
pub fn parse_active_sales(page: &str) -> Option<u32> {
    let doc = Html::parse_document(page);
    doc.select(&ACTIVE_SALES_BADGE)
        .next()
        .and_then(|e| text_of(e).parse().ok())
}

/// `csrf-token` + `userId` from the `data-app-data` JSON blob on every page.
pub fn parse_app_data(page: &str) -> Result<(String, i64, String)> {
    let doc = Html::parse_document(page);
    let body = doc
        .select(&APP_DATA)
        .next()
        .ok_or_else(|| ClientError::Parse("app data attribute missing".to_owned()))?;
    let raw = body
        .value()
        .attr("data-app-data")
        .ok_or_else(|| ClientError::Parse("app data attribute missing".to_owned()))?;
    let data: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| ClientError::Parse(format!("app data is not JSON: {e}")))?;
    let csrf = data["csrf-token"]
        .as_str()
        .ok_or_else(|| ClientError::Parse("csrf token missing".to_owned()))?
        .to_owned();
    let user_id = data["userId"]
        .as_i64()
        .ok_or_else(|| ClientError::Parse("user id missing".to_owned()))?;
    let locale = data["locale"].as_str().unwrap_or("ru").to_owned();
    Ok((csrf, user_id, locale))
}

/// Parses the `chat_bookmarks` fragment into chat shortcuts.
///
/// The leading bot marker is stripped off the preview text and recorded as
/// `last_by_bot`/`last_by_vertex`; image placeholders are kept verbatim so
/// the caller can tell them apart from real text.
pub fn parse_contact_items(fragment: &str) -> Vec<ChatShortcut> {
    let doc = Html::parse_fragment(fragment);
    let mut chats = Vec::new();
    for item in doc.select(&CONTACT_ITEM) {
        let Some(chat_id) = attr_i64(item, "data-id") else {
            continue;
        };
        let Some(message_div) = item.select(&CONTACT_MESSAGE).next() else {
            continue;
        };
        let raw_text = text_of(message_div);
        let by_bot = raw_text.starts_with(BOT_MARKER);
        let by_vertex = raw_text.starts_with(VERTEX_MARKER);
        let cleaned = if by_bot || by_vertex {
            raw_text.chars().skip(1).collect()
        } else {
            raw_text
        };
        let name = item
            .select(&MEDIA_USER_NAME)
            .next()
            .map(text_of)
            .unwrap_or_else(|| format!("ID: {chat_id}"));
        let unread = item
            .value()
            .attr("class")
            .map(|c| c.split_whitespace().any(|c| c == "unread"))
            .unwrap_or(false);
        chats.push(ChatShortcut {
            id: chat_id,
            name,
            last_message_text: cleaned,
            node_msg_id: attr_i64(item, "data-node-msg").unwrap_or(0),
            user_msg_id: attr_i64(item, "data-user-msg").unwrap_or(0),
            unread,
            last_by_bot: by_bot,
            last_by_vertex: by_vertex,
            html: item.html(),
        });
    }
    chats
}

/// Parses one chat history fragment into messages in ascending id order.
pub fn parse_chat_messages(
    fragment: &str,
    chat_id: i64,
    chat_name: Option<&str>,
    own_id: i64,
    own_username: &str,
) -> Vec<Message> {
    let doc = Html::parse_fragment(fragment);
    let mut messages = Vec::new();
    // Author blocks repeat only when the author changes; carry the last one.
    let mut last_author: Option<(i64, String)> = None;
    let mut last_badge: Option<String> = None;
    let mut interlocutor_id: Option<i64> = None;
    for item in doc.select(&CHAT_MESSAGE) {
        let Some(id) = item
            .value()
            .attr("id")
            .and_then(|v| v.strip_prefix("message-"))
            .and_then(|v| v.parse::<i64>().ok())
        else {
            continue;
        };

        if let Some(author_link) = item.select(&CHAT_MSG_AUTHOR).next() {
            let author = text_of(author_link);
            let author_id = author_link
                .value()
                .attr("href")
                .and_then(|href| {
                    href.trim_end_matches('/')
                        .rsplit('/')
                        .next()
                        .and_then(|v| v.parse().ok())
                })
                .unwrap_or(0);
            last_author = Some((author_id, author));
            last_badge = item.select(&CHAT_MSG_BADGE).next().map(text_of);
        }
        let (author_id, author) = last_author.clone().unwrap_or((0, "FunPay".to_owned()));
        let badge = last_badge.clone().filter(|b| !b.is_empty());

        if author_id != own_id && author_id != 0 && interlocutor_id.is_none() {
            interlocutor_id = Some(author_id);
        }

        let image_link = item
            .select(&CHAT_IMG_LINK)
            .next()
            .and_then(|a| a.value().attr("href"))
            .map(str::to_owned);
        let mut text = if image_link.is_some() {
            None
        } else {
            item.select(&CHAT_MSG_TEXT).next().map(text_of)
        };

        let mut by_bot = false;
        let mut by_vertex = false;
        if let Some(t) = text.take() {
            by_bot = t.starts_with(BOT_MARKER);
            by_vertex = t.starts_with(VERTEX_MARKER);
            text = Some(if by_bot || by_vertex {
                t.chars().skip(1).collect()
            } else {
                t
            });
        }

        let kind = if author_id == 0 {
            text.as_deref()
                .map(patterns::classify_message)
                .unwrap_or(MessageType::NonSystem)
        } else {
            MessageType::NonSystem
        };
        let i_am_buyer = kind != MessageType::NonSystem
            && text
                .as_deref()
                .map(|t| t.contains(&format!(" {own_username} ")))
                .unwrap_or(false);
        let is_employee = badge.is_some() && author_id != 0 && author_id != own_id;
        let is_autoreply = badge.is_some() && !is_employee;

        messages.push(Message {
            id,
            chat_id,
            chat_name: chat_name.map(str::to_owned),
            author_id,
            author,
            text,
            image_link,
            kind,
            badge,
            is_employee,
            is_autoreply,
            by_bot,
            by_vertex,
            interlocutor_id,
            i_am_buyer,
        });
    }
    messages.sort_by_key(|m| m.id);
    messages
}

fn parse_price(raw: &str) -> (f64, Currency) {
    let symbol = raw
        .chars()
        .find(|c| matches!(c, '₽' | '$' | '€' | '¤'))
        .map(|c| c.to_string())
        .unwrap_or_default();
    let number: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .collect();
    let value = number.replace(',', ".").parse().unwrap_or(0.0);
    (value, patterns::parse_currency(&symbol))
}

selector!(STATS_BUYER, "span.badge-buyer");
selector!(STATS_SELLER, "span.badge-seller");

/// One parsed page of the sales list.
#[derive(Debug, Default)]
pub struct SalesPage {
    /// `None` on the last page.
    pub next_cursor: Option<String>,
    pub orders: Vec<OrderShortcut>,
    pub buyer_stats: u32,
    pub seller_stats: u32,
}

/// Parses the sales page into order shortcuts plus the `continue` cursor
/// and the account's own purchase/sale counters.
pub fn parse_sales(page: &str) -> SalesPage {
    let doc = Html::parse_document(page);
    let rows: Vec<ElementRef<'_>> = doc.select(&SALE_ROW).collect();
    let next_cursor = rows
        .last()
        .and_then(|el| el.value().attr("data-continue"))
        .map(str::to_owned);
    let buyer_stats = doc
        .select(&STATS_BUYER)
        .next()
        .and_then(|e| text_of(e).parse().ok())
        .unwrap_or(0);
    let seller_stats = doc
        .select(&STATS_SELLER)
        .next()
        .and_then(|e| text_of(e).parse().ok())
        .unwrap_or(0);
    let mut orders = Vec::new();
    for row in rows {
        let Some(id) = row
            .select(&SALE_ORDER_ID)
            .next()
            .map(|e| text_of(e).trim_start_matches('#').to_owned())
        else {
            continue;
        };
        let description = row.select(&SALE_DESC).next().map(text_of).unwrap_or_default();
        let subcategory_name = row
            .select(&SALE_DESC)
            .nth(1)
            .map(text_of)
            .unwrap_or_default();
        let (price, currency) = row
            .select(&SALE_PRICE)
            .next()
            .map(|e| parse_price(&text_of(e)))
            .unwrap_or((0.0, Currency::Unknown));
        let buyer_el = row.select(&SALE_BUYER).next();
        let buyer_username = buyer_el.map(text_of).unwrap_or_default();
        let buyer_id = buyer_el
            .and_then(|e| attr_i64(e, "data-href-user"))
            .unwrap_or(0);
        let chat_id = attr_i64(row, "data-node").unwrap_or(0);
        let status = match row.value().attr("class").unwrap_or("") {
            c if c.contains("warning") => OrderStatus::Refunded,
            c if c.contains("info") => OrderStatus::Paid,
            _ => OrderStatus::Closed,
        };
        let amount = row
            .select(&SALE_DESC)
            .next()
            .and_then(|e| {
                patterns::patterns()
                    .products_amount
                    .captures(&text_of(e))
                    .and_then(|c| c[1].replace(' ', "").parse().ok())
            })
            .unwrap_or(1);
        let date = row
            .select(&SALE_DATE)
            .next()
            .and_then(|e| attr_i64(e, "data-time"))
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
            .unwrap_or_else(Utc::now);
        orders.push(OrderShortcut {
            id,
            description,
            subcategory_name,
            subcategory_id: attr_i64(row, "data-subcategory"),
            price,
            currency,
            buyer_username,
            buyer_id,
            chat_id,
            status,
            date,
            amount,
            html: row.html(),
        });
    }
    SalesPage {
        next_cursor,
        orders,
        buyer_stats,
        seller_stats,
    }
}

/// Parses a public profile page into the listings snapshot.
pub fn parse_profile(page: &str, user_id: i64, username: &str) -> Profile {
    let doc = Html::parse_document(page);
    let mut profile = Profile::new(user_id, username.to_owned());
    for (position, block) in doc.select(&OFFER_BLOCK).enumerate() {
        let Some(title_link) = block.select(&OFFER_TITLE_LINK).next() else {
            continue;
        };
        let href = title_link.value().attr("href").unwrap_or("");
        // Lot list links look like /lots/<subcat>/ for common subcategories
        // and /chips/<subcat>/ for currency trading ones.
        let kind = if href.contains("/chips/") {
            SubcategoryType::Currency
        } else {
            SubcategoryType::Common
        };
        let Some(subcategory_id) = href
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .and_then(|v| v.parse::<i64>().ok())
        else {
            continue;
        };
        let fullname = text_of(title_link);
        let category_id = attr_i64(block, "data-game").unwrap_or(subcategory_id);
        let category_name = block
            .value()
            .attr("data-game-name")
            .map(str::to_owned)
            .unwrap_or_else(|| fullname.clone());
        profile.add_subcategory(Subcategory {
            id: subcategory_id,
            name: fullname.clone(),
            fullname: fullname.clone(),
            kind,
            category: Category {
                id: category_id,
                name: category_name,
                position,
            },
        });
        for row in block.select(&OFFER_ROW) {
            let Some(lot_id) = attr_i64(row, "data-offer") else {
                continue;
            };
            profile.add_lot(LotShortcut {
                id: lot_id,
                subcategory_id,
                server: row.select(&OFFER_SERVER).next().map(text_of).filter(|s| !s.is_empty()),
                description: row
                    .select(&OFFER_DESC)
                    .next()
                    .map(text_of)
                    .filter(|s| !s.is_empty()),
            });
        }
    }
    profile
}

/// Parses the lot editor form into the opaque fields bag.
pub fn parse_lot_fields(page: &str) -> HashMap<String, String> {
    let doc = Html::parse_document(page);
    let mut fields = HashMap::new();
    for input in doc.select(&FORM_INPUT) {
        let Some(name) = input.value().attr("name") else {
            continue;
        };
        match input.value().attr("type") {
            Some("checkbox") => {
                if input.value().attr("checked").is_some() {
                    fields.insert(name.to_owned(), "on".to_owned());
                }
            }
            _ => {
                let value = input
                    .value()
                    .attr("value")
                    .map(str::to_owned)
                    .unwrap_or_else(|| text_of(input));
                fields.insert(name.to_owned(), value);
            }
        }
    }
    for select in doc.select(&FORM_SELECT) {
        let Some(name) = select.value().attr("name") else {
            continue;
        };
        let value = select
            .select(&SELECTED_OPTION)
            .next()
            .and_then(|o| o.value().attr("value"))
            .unwrap_or("")
            .to_owned();
        fields.insert(name.to_owned(), value);
    }
    fields
}

/// Parses the six balance figures off a lot page sidebar.
pub fn parse_balance(page: &str) -> Balance {
    let doc = Html::parse_document(page);
    let mut balance = Balance::default();
    for badge in doc.select(&BALANCE_BADGE) {
        let (value, currency) = parse_price(&text_of(badge));
        let available = badge
            .value()
            .attr("class")
            .map(|c| c.contains("available"))
            .unwrap_or(false);
        match (currency, available) {
            (Currency::Rub, false) => balance.total_rub = value,
            (Currency::Rub, true) => balance.available_rub = value,
            (Currency::Usd, false) => balance.total_usd = value,
            (Currency::Usd, true) => balance.available_usd = value,
            (Currency::Eur, false) => balance.total_eur = value,
            (Currency::Eur, true) => balance.available_eur = value,
            _ => {}
        }
    }
    balance
}

/// Parses the full order page.
pub fn parse_order(page: &str, order_id: &str) -> crate::types::Order {
    let doc = Html::parse_document(page);
    let status = doc
        .select(&ORDER_STATUS)
        .next()
        .map(|e| {
            let cls = e.value().attr("class").unwrap_or("");
            if cls.contains("text-warning") {
                OrderStatus::Refunded
            } else if cls.contains("text-success") {
                OrderStatus::Closed
            } else {
                OrderStatus::Paid
            }
        })
        .unwrap_or(OrderStatus::Paid);

    let mut short_description = None;
    let mut sum = 0.0;
    let mut currency = Currency::Unknown;
    let mut game = None;
    let mut subcategory = None;
    let mut lot_params = Vec::new();
    let mut buyer_id = 0;
    let mut buyer_username = String::new();
    for param in doc.select(&ORDER_PARAM) {
        let Some(name) = param.select(&ORDER_PARAM_NAME).next().map(text_of) else {
            continue;
        };
        let value = param
            .select(&ORDER_PARAM_VALUE)
            .next()
            .map(text_of)
            .unwrap_or_default();
        match name.as_str() {
            "Краткое описание" | "Short description" => short_description = Some(value),
            "Сумма" | "Total" => {
                let (v, c) = parse_price(&value);
                sum = v;
                currency = c;
            }
            "Игра" | "Game" => game = Some(value),
            "Категория" | "Category" => subcategory = Some(value),
            "Покупатель" | "Buyer" => {
                buyer_username = value;
                buyer_id = param
                    .select(&CHAT_MSG_AUTHOR)
                    .next()
                    .and_then(|a| {
                        a.value().attr("href").and_then(|h| {
                            h.trim_end_matches('/').rsplit('/').next().and_then(|v| v.parse().ok())
                        })
                    })
                    .unwrap_or(0);
            }
            _ => lot_params.push((name, value)),
        }
    }

    let review = doc.select(&REVIEW_BLOCK).next().map(|block| {
        let stars = block
            .select(&REVIEW_STARS)
            .next()
            .and_then(|e| e.value().attr("class"))
            .and_then(|c| c.rsplit("rating").next().and_then(|v| v.parse().ok()))
            .unwrap_or(0);
        Review {
            stars,
            text: block.select(&REVIEW_TEXT).next().map(text_of),
            reply: block.select(&REVIEW_REPLY).next().map(text_of),
        }
    });

    let subcategory_fullname = match (&subcategory, &game) {
        (Some(s), Some(g)) => Some(format!("{s} {g}")),
        _ => None,
    };

    crate::types::Order {
        id: order_id.to_owned(),
        status,
        short_description,
        lot_params,
        sum,
        currency,
        buyer_id,
        buyer_username,
        subcategory_fullname,
        game,
        subcategory,
        review,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTACTS: &str = r#"
        <a class="contact-item unread" data-id="100" data-node-msg="500" data-user-msg="499">
          <div class="media-user-name">Alice</div>
          <div class="contact-item-message">hi there</div>
        </a>
        <a class="contact-item" data-id="101" data-node-msg="600" data-user-msg="600">
          <div class="media-user-name">Bob</div>
          <div class="contact-item-message">&#8289;Your key: X</div>
        </a>
        <a class="contact-item" data-id="102" data-node-msg="700" data-user-msg="700">
          <div class="media-user-name">Carol</div>
          <div class="contact-item-message">Изображение</div>
        </a>
    "#;

    #[test]
    fn contact_items_are_parsed_with_markers() {
        let chats = parse_contact_items(CONTACTS);
        assert_eq!(chats.len(), 3);
        assert_eq!(chats[0].id, 100);
        assert_eq!(chats[0].name, "Alice");
        assert_eq!(chats[0].node_msg_id, 500);
        assert!(chats[0].unread);
        assert!(!chats[0].last_by_bot);
        assert!(chats[1].last_by_bot);
        assert_eq!(chats[1].last_message_text, "Your key: X");
        assert_eq!(chats[2].last_message_text, "Изображение");
    }

    #[test]
    fn chat_messages_carry_author_forward() {
        let fragment = r#"
            <div class="chat-msg-item" id="message-10">
              <div class="media-user-name"><a href="/users/42/">Alice</a></div>
              <div class="chat-msg-text">first</div>
            </div>
            <div class="chat-msg-item" id="message-11">
              <div class="chat-msg-text">second</div>
            </div>
        "#;
        let messages = parse_chat_messages(fragment, 100, Some("Alice"), 1, "seller");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].author, "Alice");
        assert_eq!(messages[1].author, "Alice");
        assert_eq!(messages[1].author_id, 42);
        assert_eq!(messages[0].interlocutor_id, Some(42));
    }

    #[test]
    fn system_messages_are_classified() {
        let fragment = r#"
            <div class="chat-msg-item" id="message-20">
              <div class="media-user-name"><a href="/users/0/">FunPay</a></div>
              <div class="chat-msg-text">The buyer alice1 has paid for order #ABCD1234.</div>
            </div>
        "#;
        let messages = parse_chat_messages(fragment, 100, None, 1, "seller");
        assert_eq!(messages[0].kind, MessageType::OrderPurchased);
    }

    #[test]
    fn lot_fields_include_checked_checkboxes_only() {
        let page = r#"
            <form class="form-offer-editor">
              <input name="csrf_token" value="tok"/>
              <input type="checkbox" name="active" checked/>
              <input type="checkbox" name="auto_delivery"/>
              <textarea name="fields[summary][ru]">Gold</textarea>
            </form>
        "#;
        let fields = parse_lot_fields(page);
        assert_eq!(fields.get("csrf_token").map(String::as_str), Some("tok"));
        assert_eq!(fields.get("active").map(String::as_str), Some("on"));
        assert!(!fields.contains_key("auto_delivery"));
    }
}
