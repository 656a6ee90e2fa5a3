//! Compiled regexes for system-notice classification and upstream text
//! parsing.
//!
//! The marketplace renders system notices as localized plain text; the
//! alternations below cover every locale the frontend ships and are the
//! only reliable way to classify them. Keep them byte-for-byte: the
//! upstream strings are the contract.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::types::{Currency, MessageType};

pub struct Patterns {
    pub order_purchased: Regex,
    pub order_purchased2: Regex,
    pub order_confirmed: Regex,
    pub new_feedback: Regex,
    pub feedback_changed: Regex,
    pub feedback_deleted: Regex,
    pub new_feedback_answer: Regex,
    pub order_reopened: Regex,
    pub refund: Regex,
    pub refund_by_admin: Regex,
    pub partial_refund: Regex,
    pub order_confirmed_by_admin: Regex,
    pub order_id: Regex,
    pub discord: Regex,
    pub dear_vendors: Regex,
    pub products_amount: Regex,
    pub exchange_rate: Regex,
}

static PATTERNS: Lazy<Patterns> = Lazy::new(|| Patterns {
    order_purchased: Regex::new(r"(Покупатель|The buyer) [a-zA-Z0-9]+ (оплатил заказ|has paid for order) #[A-Z0-9]{8}\.").unwrap(),
    order_purchased2: Regex::new(r"[a-zA-Z0-9]+, (не забудьте потом нажать кнопку («Подтвердить выполнение заказа»|«Подтвердить получение валюты»)\.|do not forget to press the («Confirm order fulfilment»|«Confirm currency receipt») button once you finish\.)").unwrap(),
    order_confirmed: Regex::new(r"(Покупатель|The buyer) [a-zA-Z0-9]+ (подтвердил успешное выполнение заказа|has confirmed that order) #[A-Z0-9]{8} (и отправил деньги продавцу|has been fulfilled successfully and that the seller) [a-zA-Z0-9]+( has been paid)?\.").unwrap(),
    new_feedback: Regex::new(r"(Покупатель|The buyer) [a-zA-Z0-9]+ (написал отзыв к заказу|has given feedback to the order) #[A-Z0-9]{8}\.").unwrap(),
    feedback_changed: Regex::new(r"(Покупатель|The buyer) [a-zA-Z0-9]+ (изменил отзыв к заказу|has edited their feedback to the order) #[A-Z0-9]{8}\.").unwrap(),
    feedback_deleted: Regex::new(r"(Покупатель|The buyer) [a-zA-Z0-9]+ (удалил отзыв к заказу|has deleted their feedback to the order) #[A-Z0-9]{8}\.").unwrap(),
    new_feedback_answer: Regex::new(r"(Продавец|The seller) [a-zA-Z0-9]+ (ответил на отзыв к заказу|has replied to their feedback to the order) #[A-Z0-9]{8}\.").unwrap(),
    order_reopened: Regex::new(r"(Заказ|Order) #[A-Z0-9]{8} (открыт повторно|has been reopened)\.").unwrap(),
    refund: Regex::new(r"(Продавец|The seller) [a-zA-Z0-9]+ (вернул деньги покупателю|has refunded the buyer) [a-zA-Z0-9]+ (по заказу|on order) #[A-Z0-9]{8}\.").unwrap(),
    refund_by_admin: Regex::new(r"(Администратор|The administrator) [a-zA-Z0-9]+ (вернул деньги покупателю|has refunded the buyer) [a-zA-Z0-9]+ (по заказу|on order) #[A-Z0-9]{8}\.").unwrap(),
    partial_refund: Regex::new(r"(Часть средств по заказу|A part of the funds pertaining to the order) #[A-Z0-9]{8} (возвращена покупателю|has been refunded)\.").unwrap(),
    order_confirmed_by_admin: Regex::new(r"(Администратор|The administrator) [a-zA-Z0-9]+ (подтвердил успешное выполнение заказа|has confirmed that order) #[A-Z0-9]{8} (и отправил деньги продавцу|has been fulfilled successfully and that the seller) [a-zA-Z0-9]+( has been paid)?\.").unwrap(),
    order_id: Regex::new(r"#[A-Z0-9]{8}").unwrap(),
    discord: Regex::new(r"(You can switch to|Вы можете перейти в) Discord\. (However, note that friending someone is considered a violation rules|Внимание: общение за пределами сервера FunPay считается нарушением правил)\.").unwrap(),
    dear_vendors: Regex::new(r"(Уважаемые продавцы|Dear vendors), (не доверяйте сообщениям в чате|do not rely on chat messages)! (Перед выполнением заказа всегда проверяйте наличие оплаты в разделе «Мои продажи»|Before you process an order, you should always check whether you've been paid in «My sales» section)\.").unwrap(),
    products_amount: Regex::new(r",\s(\d{1,3}(?:\s?\d{3})*)\s(шт|pcs)\.").unwrap(),
    exchange_rate: Regex::new(r"(You will receive payment in|Вы начнёте получать оплату в|Ви почнете одержувати оплату в)\s*(USD|RUB|EUR)\.\s*(Your offers prices will be calculated based on the exchange rate:|Цены ваших предложений будут пересчитаны по курсу|Ціни ваших пропозицій будуть перераховані за курсом)\s*([\d.,]+)\s*(₽|€|\$)\s*(за|for)\s*([\d.,]+)\s*(₽|€|\$)\.").unwrap(),
});

pub fn patterns() -> &'static Patterns {
    &PATTERNS
}

/// Classifies a message body into its system-notice kind.
pub fn classify_message(text: &str) -> MessageType {
    let p = patterns();
    let checks: [(&Regex, MessageType); 14] = [
        (&p.order_purchased, MessageType::OrderPurchased),
        (&p.order_purchased2, MessageType::OrderPurchased),
        (&p.order_confirmed, MessageType::OrderConfirmed),
        (&p.order_confirmed_by_admin, MessageType::OrderConfirmedByAdmin),
        (&p.order_reopened, MessageType::OrderReopened),
        (&p.refund_by_admin, MessageType::RefundByAdmin),
        (&p.refund, MessageType::Refund),
        (&p.partial_refund, MessageType::PartialRefund),
        (&p.new_feedback, MessageType::NewFeedback),
        (&p.feedback_changed, MessageType::FeedbackChanged),
        (&p.feedback_deleted, MessageType::FeedbackDeleted),
        (&p.new_feedback_answer, MessageType::NewFeedbackAnswer),
        (&p.dear_vendors, MessageType::DearVendors),
        (&p.discord, MessageType::Discord),
    ];
    for (re, kind) in checks {
        if re.is_match(text) {
            return kind;
        }
    }
    MessageType::NonSystem
}

/// Extracts the `#XXXXXXXX` order id referenced by a system notice.
pub fn find_order_id(text: &str) -> Option<String> {
    patterns()
        .order_id
        .find(text)
        .map(|m| m.as_str()[1..].to_owned())
}

/// Parses the human-readable "wait N ..." raise refusal into seconds.
///
/// The first integer in the string is N; the unit keyword picks the scale.
/// Minutes and hours are rounded down a step so the next attempt never
/// lands inside the cooldown again.
pub fn parse_wait_time(response: &str) -> u64 {
    let digits: String = response.chars().filter(|c| c.is_ascii_digit()).collect();
    let n: Option<u64> = digits.parse().ok();
    if response.contains("секунд") || response.contains("second") {
        n.unwrap_or(2)
    } else if response.contains("минут")
        || response.contains("хвилин")
        || response.contains("minute")
    {
        n.map(|n| n.saturating_sub(1)).unwrap_or(1) * 60
    } else if response.contains("час")
        || response.contains("годин")
        || response.contains("hour")
    {
        match n {
            Some(n) => ((n as f64 - 0.5) * 3600.0) as u64,
            None => 3600,
        }
    } else {
        10
    }
}

/// Maps a currency glyph to its [`Currency`].
pub fn parse_currency(symbol: &str) -> Currency {
    match symbol {
        "₽" | "¤" => Currency::Rub,
        "€" => Currency::Eur,
        "$" => Currency::Usd,
        _ => Currency::Unknown,
    }
}

/// Fixed strings the chat list uses in place of an image message.
pub const IMAGE_PLACEHOLDERS: [&str; 3] = ["Изображение", "Зображення", "Image"];

pub fn is_image_placeholder(text: &str) -> bool {
    IMAGE_PLACEHOLDERS.contains(&text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_purchase_in_both_locales() {
        let ru = "Покупатель buyer01 оплатил заказ #ABCD1234.";
        let en = "The buyer buyer01 has paid for order #ABCD1234.";
        assert_eq!(classify_message(ru), MessageType::OrderPurchased);
        assert_eq!(classify_message(en), MessageType::OrderPurchased);
    }

    #[test]
    fn classifies_feedback_notices() {
        let new = "The buyer buyer01 has given feedback to the order #DEADBEEF.";
        let edited = "Покупатель buyer01 изменил отзыв к заказу #DEADBEEF.";
        let deleted = "The buyer buyer01 has deleted their feedback to the order #DEADBEEF.";
        assert_eq!(classify_message(new), MessageType::NewFeedback);
        assert_eq!(classify_message(edited), MessageType::FeedbackChanged);
        assert_eq!(classify_message(deleted), MessageType::FeedbackDeleted);
    }

    #[test]
    fn admin_confirmation_wins_over_buyer_confirmation() {
        let text = "Администратор admin1 подтвердил успешное выполнение заказа #ABCD1234 и отправил деньги продавцу seller1.";
        assert_eq!(classify_message(text), MessageType::OrderConfirmedByAdmin);
    }

    #[test]
    fn plain_chat_is_non_system() {
        assert_eq!(classify_message("hi, is the lot available?"), MessageType::NonSystem);
    }

    #[test]
    fn order_id_is_extracted_without_hash() {
        let text = "The buyer x has paid for order #AB12CD34.";
        assert_eq!(find_order_id(text).as_deref(), Some("AB12CD34"));
        assert_eq!(find_order_id("no id here"), None);
    }

    #[test]
    fn wait_time_units() {
        assert_eq!(parse_wait_time("Подождите 30 секунд"), 30);
        assert_eq!(parse_wait_time("Please wait 3 minutes"), 120);
        assert_eq!(parse_wait_time("Подождите 3 минуты"), 120);
        assert_eq!(parse_wait_time("wait 2 hours"), 5400);
        assert_eq!(parse_wait_time("Подождите"), 10);
        assert_eq!(parse_wait_time("wait a minute"), 60);
    }

    #[test]
    fn currency_glyphs() {
        assert_eq!(parse_currency("₽"), Currency::Rub);
        assert_eq!(parse_currency("¤"), Currency::Rub);
        assert_eq!(parse_currency("$"), Currency::Usd);
        assert_eq!(parse_currency("€"), Currency::Eur);
        assert_eq!(parse_currency("£"), Currency::Unknown);
    }
}
