//! Domain types mirroring what the marketplace frontend exposes.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Currency {
    Rub,
    Usd,
    Eur,
    Unknown,
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Currency::Rub => "RUB",
            Currency::Usd => "USD",
            Currency::Eur => "EUR",
            Currency::Unknown => "?",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Paid,
    Closed,
    Refunded,
}

/// Closed set of system-notice kinds, detected by locale-insensitive
/// regexes over the normalized message text (see [`crate::patterns`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    OrderPurchased,
    OrderConfirmed,
    OrderReopened,
    Refund,
    RefundByAdmin,
    PartialRefund,
    NewFeedback,
    FeedbackChanged,
    FeedbackDeleted,
    NewFeedbackAnswer,
    OrderConfirmedByAdmin,
    DearVendors,
    Discord,
    NonSystem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubcategoryType {
    Common,
    Currency,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Category {
    pub id: i64,
    pub name: String,
    /// Position on the profile page; the raise scheduler walks categories
    /// in this order.
    pub position: usize,
}

#[derive(Debug, Clone)]
pub struct Subcategory {
    pub id: i64,
    pub name: String,
    pub fullname: String,
    pub kind: SubcategoryType,
    pub category: Category,
}

/// One row of the seller's own listing as shown on the profile page.
#[derive(Debug, Clone)]
pub struct LotShortcut {
    pub id: i64,
    pub subcategory_id: i64,
    pub server: Option<String>,
    pub description: Option<String>,
}

impl LotShortcut {
    /// Composite description used to match auto-delivery rules: the server
    /// prefix, the bare description, or both joined the way the order page
    /// renders them.
    pub fn composite_description(&self) -> Option<String> {
        match (&self.server, &self.description) {
            (Some(s), Some(d)) => Some(format!("{s}, {d}")),
            (Some(s), None) => Some(s.clone()),
            (None, Some(d)) => Some(d.clone()),
            (None, None) => None,
        }
    }
}

/// Snapshot of the seller's own listings.
#[derive(Debug, Clone, Default)]
pub struct Profile {
    pub user_id: i64,
    pub username: String,
    subcategories: HashMap<i64, Subcategory>,
    lots: Vec<LotShortcut>,
}

impl Profile {
    pub fn new(user_id: i64, username: String) -> Self {
        Self {
            user_id,
            username,
            subcategories: HashMap::new(),
            lots: Vec::new(),
        }
    }

    pub fn add_subcategory(&mut self, subcategory: Subcategory) {
        self.subcategories.insert(subcategory.id, subcategory);
    }

    pub fn add_lot(&mut self, lot: LotShortcut) {
        self.lots.push(lot);
    }

    pub fn lots(&self) -> &[LotShortcut] {
        &self.lots
    }

    pub fn is_empty(&self) -> bool {
        self.lots.is_empty()
    }

    pub fn subcategory(&self, id: i64) -> Option<&Subcategory> {
        self.subcategories.get(&id)
    }

    pub fn lot_ids(&self) -> HashSet<i64> {
        self.lots.iter().map(|l| l.id).collect()
    }

    /// Unique categories that have at least one lot, in profile order.
    pub fn categories(&self) -> Vec<Category> {
        let mut seen = HashSet::new();
        let mut out: Vec<Category> = Vec::new();
        for lot in &self.lots {
            if let Some(sub) = self.subcategories.get(&lot.subcategory_id) {
                if seen.insert(sub.category.id) {
                    out.push(sub.category.clone());
                }
            }
        }
        out.sort_by_key(|c| c.position);
        out
    }

    /// Deduplicated ids of common-type subcategories of `category_id` that
    /// currently contain at least one lot. Raises act only on these.
    pub fn common_subcategories_with_lots(&self, category_id: i64) -> Vec<i64> {
        let mut ids = BTreeMap::new();
        for lot in &self.lots {
            if let Some(sub) = self.subcategories.get(&lot.subcategory_id) {
                if sub.category.id == category_id && sub.kind == SubcategoryType::Common {
                    ids.insert(sub.id, ());
                }
            }
        }
        ids.into_keys().collect()
    }

    /// Lots whose subcategory type is common, i.e. eligible for raise and
    /// activation management.
    pub fn common_lots(&self) -> impl Iterator<Item = &LotShortcut> {
        self.lots.iter().filter(|l| {
            self.subcategories
                .get(&l.subcategory_id)
                .map(|s| s.kind == SubcategoryType::Common)
                .unwrap_or(false)
        })
    }

    /// Lots belonging to `subcategory_id`, longest composite description
    /// first (the order classification probes them in).
    pub fn lots_in_subcategory(&self, subcategory_id: i64) -> Vec<&LotShortcut> {
        let mut lots: Vec<&LotShortcut> = self
            .lots
            .iter()
            .filter(|l| l.subcategory_id == subcategory_id)
            .collect();
        lots.sort_by_key(|l| {
            std::cmp::Reverse(l.composite_description().map(|d| d.len()).unwrap_or(0))
        });
        lots
    }
}

/// One entry of the chat list fragment.
#[derive(Debug, Clone)]
pub struct ChatShortcut {
    pub id: i64,
    pub name: String,
    pub last_message_text: String,
    pub node_msg_id: i64,
    pub user_msg_id: i64,
    pub unread: bool,
    pub last_by_bot: bool,
    pub last_by_vertex: bool,
    pub html: String,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub id: i64,
    pub chat_id: i64,
    pub chat_name: Option<String>,
    pub author_id: i64,
    pub author: String,
    pub text: Option<String>,
    pub image_link: Option<String>,
    pub kind: MessageType,
    /// Non-empty badge marks auto-replies and employee notices; its
    /// presence blocks the greeting gate.
    pub badge: Option<String>,
    pub is_employee: bool,
    pub is_autoreply: bool,
    pub by_bot: bool,
    pub by_vertex: bool,
    pub interlocutor_id: Option<i64>,
    /// Whether our own account is the buyer in the order this system
    /// notice refers to.
    pub i_am_buyer: bool,
}

impl Message {
    pub fn display_text(&self) -> &str {
        self.text
            .as_deref()
            .or(self.image_link.as_deref())
            .unwrap_or("")
    }
}

#[derive(Debug, Clone)]
pub struct OrderShortcut {
    /// 8-char [A-Z0-9] order id, without the leading `#`.
    pub id: String,
    pub description: String,
    pub subcategory_name: String,
    pub subcategory_id: Option<i64>,
    pub price: f64,
    pub currency: Currency,
    pub buyer_username: String,
    pub buyer_id: i64,
    pub chat_id: i64,
    pub status: OrderStatus,
    pub date: DateTime<Utc>,
    pub amount: u32,
    pub html: String,
}

#[derive(Debug, Clone)]
pub struct Review {
    pub stars: u8,
    pub text: Option<String>,
    pub reply: Option<String>,
}

/// Full order as parsed from the order page.
#[derive(Debug, Clone)]
pub struct Order {
    pub id: String,
    pub status: OrderStatus,
    pub short_description: Option<String>,
    pub lot_params: Vec<(String, String)>,
    /// Order sum in the seller's displayed currency.
    pub sum: f64,
    pub currency: Currency,
    pub buyer_id: i64,
    pub buyer_username: String,
    pub subcategory_fullname: Option<String>,
    pub game: Option<String>,
    pub subcategory: Option<String>,
    pub review: Option<Review>,
}

impl Order {
    pub fn lot_params_text(&self) -> String {
        self.lot_params
            .iter()
            .map(|(k, v)| format!("{k}: {v}"))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Opaque form-field bag of the lot edit page. Saving it back verbatim (with
/// a changed `active` flag) is how lots are (de)activated.
#[derive(Debug, Clone)]
pub struct LotFields {
    pub lot_id: i64,
    pub fields: HashMap<String, String>,
}

impl LotFields {
    pub fn active(&self) -> bool {
        self.fields.get("active").map(|v| v == "on").unwrap_or(false)
    }

    pub fn set_active(&mut self, active: bool) {
        if active {
            self.fields.insert("active".to_owned(), "on".to_owned());
        } else {
            self.fields.remove("active");
        }
    }

    /// Disables the marketplace's own delivery checkbox. Applied once when a
    /// save bounces off the empty-secrets conflict.
    pub fn set_auto_delivery(&mut self, enabled: bool) {
        if enabled {
            self.fields
                .insert("auto_delivery".to_owned(), "on".to_owned());
        } else {
            self.fields.remove("auto_delivery");
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Balance {
    pub total_rub: f64,
    pub available_rub: f64,
    pub total_usd: f64,
    pub available_usd: f64,
    pub total_eur: f64,
    pub available_eur: f64,
}

/// Buyer/seller counters echoed in `orders_counters` long-poll objects.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrderCounters {
    pub buyer: u32,
    pub seller: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile_with_lots() -> Profile {
        let mut profile = Profile::new(1, "seller".to_owned());
        let games = Category {
            id: 10,
            name: "WoW".to_owned(),
            position: 0,
        };
        let other = Category {
            id: 20,
            name: "Dota".to_owned(),
            position: 1,
        };
        profile.add_subcategory(Subcategory {
            id: 100,
            name: "Gold".to_owned(),
            fullname: "Gold WoW".to_owned(),
            kind: SubcategoryType::Common,
            category: games.clone(),
        });
        profile.add_subcategory(Subcategory {
            id: 101,
            name: "Currency".to_owned(),
            fullname: "Currency WoW".to_owned(),
            kind: SubcategoryType::Currency,
            category: games,
        });
        profile.add_subcategory(Subcategory {
            id: 200,
            name: "Items".to_owned(),
            fullname: "Items Dota".to_owned(),
            kind: SubcategoryType::Common,
            category: other,
        });
        profile.add_lot(LotShortcut {
            id: 1,
            subcategory_id: 100,
            server: Some("EU".to_owned()),
            description: Some("Gold".to_owned()),
        });
        profile.add_lot(LotShortcut {
            id: 2,
            subcategory_id: 101,
            server: None,
            description: Some("Gold exchange".to_owned()),
        });
        profile.add_lot(LotShortcut {
            id: 3,
            subcategory_id: 200,
            server: None,
            description: Some("Arcana".to_owned()),
        });
        profile
    }

    #[test]
    fn categories_follow_profile_order() {
        let profile = profile_with_lots();
        let cats: Vec<i64> = profile.categories().iter().map(|c| c.id).collect();
        assert_eq!(cats, vec![10, 20]);
    }

    #[test]
    fn raise_targets_skip_currency_subcategories() {
        let profile = profile_with_lots();
        assert_eq!(profile.common_subcategories_with_lots(10), vec![100]);
        assert_eq!(profile.common_subcategories_with_lots(20), vec![200]);
    }

    #[test]
    fn common_lots_exclude_currency_lots() {
        let profile = profile_with_lots();
        let ids: Vec<i64> = profile.common_lots().map(|l| l.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn composite_description_prefers_server_prefix() {
        let profile = profile_with_lots();
        let lot = &profile.lots()[0];
        assert_eq!(lot.composite_description().unwrap(), "EU, Gold");
    }
}
