//! Variable expansion and message splitting for outgoing texts.
//!
//! Templates mix plain variables (`$username`, `$order_id`, ...) with
//! control tokens that shape the send itself: `$photo=<id>` emits an image
//! message, `$sleep=<secs>` pauses between chunks, `$new` (or a bare
//! `[a][/a]` line) forces a paragraph break. Plain text between tokens is
//! split into chunks of at most twenty lines.

use chrono::{DateTime, Local};
use funpay_client::types::{ChatShortcut, Message, Order, OrderShortcut};
use once_cell::sync::Lazy;
use regex::Regex;

const MAX_LINES_PER_MESSAGE: usize = 20;
const PARAGRAPH_MARKER: &str = "[a][/a]";

/// Invisible separator woven between characters of user-controlled names so
/// a buyer cannot smuggle a command or a template variable into our output.
const SEPARATOR: char = '\u{2063}';

static ENTITY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$photo=\d+|\$sleep=\d+(?:\.\d+)?").unwrap());

pub fn safe_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len() * 2);
    let mut chars = text.chars();
    if let Some(first) = chars.next() {
        out.push(first);
        for c in chars {
            out.push(SEPARATOR);
            out.push(c);
        }
    }
    out
}

fn month_name(month: u32) -> &'static str {
    const MONTHS: [&str; 12] = [
        "Января",
        "Февраля",
        "Марта",
        "Апреля",
        "Мая",
        "Июня",
        "Июля",
        "Августа",
        "Сентября",
        "Октября",
        "Ноября",
        "Декабря",
    ];
    MONTHS
        .get(month.saturating_sub(1) as usize)
        .copied()
        .unwrap_or(MONTHS[0])
}

struct DateVars {
    date: String,
    date_text: String,
    full_date_text: String,
    time: String,
    full_time: String,
}

fn date_vars(now: DateTime<Local>) -> DateVars {
    use chrono::Datelike;
    let date_text = format!("{} {}", now.day(), month_name(now.month()));
    DateVars {
        date: now.format("%d.%m.%Y").to_string(),
        full_date_text: format!("{date_text} {} года", now.year()),
        date_text,
        time: now.format("%H:%M").to_string(),
        full_time: now.format("%H:%M:%S").to_string(),
    }
}

/// Message-context variable source: either a fetched message or a chat
/// shortcut, whichever the triggering event carried.
pub enum MessageSource<'a> {
    Message(&'a Message),
    Chat(&'a ChatShortcut),
}

impl MessageSource<'_> {
    fn username(&self) -> &str {
        match self {
            MessageSource::Message(m) => &m.author,
            MessageSource::Chat(c) => &c.name,
        }
    }

    fn chat_name(&self) -> &str {
        match self {
            MessageSource::Message(m) => m.chat_name.as_deref().unwrap_or(&m.author),
            MessageSource::Chat(c) => &c.name,
        }
    }

    fn chat_id(&self) -> i64 {
        match self {
            MessageSource::Message(m) => m.chat_id,
            MessageSource::Chat(c) => c.id,
        }
    }

    fn text(&self) -> &str {
        match self {
            MessageSource::Message(m) => m.display_text(),
            MessageSource::Chat(c) => &c.last_message_text,
        }
    }
}

/// Expands message-context variables.
pub fn format_msg_text(template: &str, source: &MessageSource<'_>) -> String {
    let dates = date_vars(Local::now());
    template
        .replace("$full_date_text", &dates.full_date_text)
        .replace("$date_text", &dates.date_text)
        .replace("$date", &dates.date)
        .replace("$full_time", &dates.full_time)
        .replace("$time", &dates.time)
        .replace("$username", &safe_text(source.username()))
        .replace("$message_text", source.text())
        .replace("$chat_id", &source.chat_id().to_string())
        .replace("$chat_name", &safe_text(source.chat_name()))
}

/// Order-context variable source.
pub enum OrderSource<'a> {
    Shortcut(&'a OrderShortcut),
    Full(&'a Order),
}

impl OrderSource<'_> {
    fn id(&self) -> &str {
        match self {
            OrderSource::Shortcut(o) => &o.id,
            OrderSource::Full(o) => &o.id,
        }
    }

    fn buyer_username(&self) -> &str {
        match self {
            OrderSource::Shortcut(o) => &o.buyer_username,
            OrderSource::Full(o) => &o.buyer_username,
        }
    }

    fn description(&self) -> String {
        match self {
            OrderSource::Shortcut(o) => o.description.clone(),
            OrderSource::Full(o) => o.short_description.clone().unwrap_or_default(),
        }
    }

    fn params(&self) -> String {
        match self {
            OrderSource::Shortcut(_) => String::new(),
            OrderSource::Full(o) => o.lot_params_text(),
        }
    }

    fn game_and_subcategory(&self) -> (String, String, String) {
        match self {
            OrderSource::Shortcut(o) => {
                // "Gold, WoW EU" style: the tail after the last comma names
                // the game.
                match o.subcategory_name.rsplit_once(", ") {
                    Some((sub, game)) => (
                        game.to_owned(),
                        sub.to_owned(),
                        format!("{sub} {game}"),
                    ),
                    None => (String::new(), o.subcategory_name.clone(), o.subcategory_name.clone()),
                }
            }
            OrderSource::Full(o) => (
                o.game.clone().unwrap_or_default(),
                o.subcategory.clone().unwrap_or_default(),
                o.subcategory_fullname.clone().unwrap_or_default(),
            ),
        }
    }
}

/// Expands order-context variables.
pub fn format_order_text(template: &str, source: &OrderSource<'_>) -> String {
    let dates = date_vars(Local::now());
    let description = source.description();
    let params = source.params();
    let desc_and_params = if !description.is_empty() && !params.is_empty() {
        format!("{description}, {params}")
    } else {
        format!("{description}{params}")
    };
    let desc_or_params = if description.is_empty() {
        params.clone()
    } else {
        description.clone()
    };
    let (game, subcategory, fullname) = source.game_and_subcategory();

    template
        .replace("$full_date_text", &dates.full_date_text)
        .replace("$date_text", &dates.date_text)
        .replace("$date", &dates.date)
        .replace("$full_time", &dates.full_time)
        .replace("$time", &dates.time)
        .replace("$username", &safe_text(source.buyer_username()))
        .replace("$order_desc_and_params", &desc_and_params)
        .replace("$order_desc_or_params", &desc_or_params)
        .replace("$order_desc", &description)
        .replace("$order_title", &description)
        .replace("$order_params", &params)
        .replace("$order_id", source.id())
        .replace(
            "$order_link",
            &format!("https://funpay.com/orders/{}/", source.id()),
        )
        .replace("$category_fullname", &fullname)
        .replace("$category", &subcategory)
        .replace("$game", &game)
}

/// One unit of an expanded template.
#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    Text(String),
    Photo(i64),
    Sleep(f64),
}

/// Splits plain text into sendable chunks: at most twenty lines each,
/// breaking early at paragraph markers, dropping chunks that are blank.
pub fn split_text(text: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut flush = |current: &mut Vec<&str>| {
        let chunk = current.join("\n");
        let trimmed = chunk.trim();
        if !trimmed.is_empty() && trimmed != PARAGRAPH_MARKER {
            chunks.push(chunk);
        }
        current.clear();
    };
    for line in text.split('\n') {
        if line.trim() == PARAGRAPH_MARKER {
            flush(&mut current);
            continue;
        }
        current.push(line);
        if current.len() >= MAX_LINES_PER_MESSAGE {
            flush(&mut current);
        }
    }
    flush(&mut current);
    chunks
}

/// Walks a message body, extracting control tokens and chunking the plain
/// text between them.
pub fn parse_message_entities(body: &str) -> Vec<Entity> {
    let normalized: String = body
        .split('\n')
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("\n");
    let mut normalized = normalized.replace("$new", &format!("\n{PARAGRAPH_MARKER}\n"));
    while normalized.contains("\n\n") {
        normalized = normalized.replace("\n\n", &format!("\n{PARAGRAPH_MARKER}\n"));
    }

    let mut entities = Vec::new();
    let mut pos = 0;
    for m in ENTITY_RE.find_iter(&normalized) {
        let before = &normalized[pos..m.start()];
        if !before.trim().is_empty() {
            entities.extend(split_text(before).into_iter().map(Entity::Text));
        }
        let token = m.as_str();
        if let Some(raw) = token.strip_prefix("$photo=") {
            if let Ok(id) = raw.parse() {
                entities.push(Entity::Photo(id));
            }
        } else if let Some(raw) = token.strip_prefix("$sleep=") {
            if let Ok(secs) = raw.parse() {
                entities.push(Entity::Sleep(secs));
            }
        }
        pos = m.end();
    }
    let tail = &normalized[pos..];
    if !tail.trim().is_empty() {
        entities.extend(split_text(tail).into_iter().map(Entity::Text));
    }
    entities
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_template_is_identity() {
        let entities = parse_message_entities("Thanks for the order!");
        assert_eq!(entities, vec![Entity::Text("Thanks for the order!".to_owned())]);
    }

    #[test]
    fn photo_and_sleep_tokens_split_the_body() {
        let entities = parse_message_entities("Here is your key\n$photo=123\n$sleep=1.5\nEnjoy");
        assert_eq!(
            entities,
            vec![
                Entity::Text("Here is your key".to_owned()),
                Entity::Photo(123),
                Entity::Sleep(1.5),
                Entity::Text("Enjoy".to_owned()),
            ]
        );
    }

    #[test]
    fn new_token_forces_separate_messages() {
        let entities = parse_message_entities("part one$new part two");
        assert_eq!(
            entities,
            vec![
                Entity::Text("part one".to_owned()),
                Entity::Text(" part two".to_owned()),
            ]
        );
    }

    #[test]
    fn long_text_is_chunked_at_twenty_lines() {
        let text = (0..45).map(|i| format!("line{i}")).collect::<Vec<_>>().join("\n");
        let chunks = split_text(&text);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].split('\n').count(), 20);
        assert_eq!(chunks[2].split('\n').count(), 5);
    }

    #[test]
    fn blank_and_marker_chunks_are_dropped() {
        assert!(split_text("   \n\n  ").is_empty());
        assert!(split_text(PARAGRAPH_MARKER).is_empty());
    }

    #[test]
    fn safe_text_weaves_invisible_separators() {
        let woven = safe_text("abc");
        assert_eq!(woven.chars().count(), 5);
        assert_eq!(woven.chars().filter(|c| *c == '\u{2063}').count(), 2);
        assert_eq!(safe_text(""), "");
    }

    #[test]
    fn order_variables_expand_from_shortcut() {
        use chrono::Utc;
        use funpay_client::types::{Currency, OrderStatus};
        let order = OrderShortcut {
            id: "ABCD1234".to_owned(),
            description: "Gold x100".to_owned(),
            subcategory_name: "Gold, WoW EU".to_owned(),
            subcategory_id: None,
            price: 10.0,
            currency: Currency::Rub,
            buyer_username: "buyer".to_owned(),
            buyer_id: 1,
            chat_id: 2,
            status: OrderStatus::Paid,
            date: Utc::now(),
            amount: 1,
            html: String::new(),
        };
        let out = format_order_text(
            "Order $order_id ($order_title) in $game / $category",
            &OrderSource::Shortcut(&order),
        );
        assert_eq!(out, "Order ABCD1234 (Gold x100) in WoW EU / Gold");
    }

    #[test]
    fn message_variables_expand_from_chat() {
        let chat = ChatShortcut {
            id: 55,
            name: "Alice".to_owned(),
            last_message_text: "hello".to_owned(),
            node_msg_id: 1,
            user_msg_id: 1,
            unread: false,
            last_by_bot: false,
            last_by_vertex: false,
            html: String::new(),
        };
        let out = format_msg_text("[$chat_id] $message_text", &MessageSource::Chat(&chat));
        assert_eq!(out, "[55] hello");
    }
}
