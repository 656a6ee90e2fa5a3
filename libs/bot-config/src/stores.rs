//! JSON setting stores under `storage/cache/`.
//!
//! Each store is a small load-or-default / mutate / save unit. Saves go
//! through the same atomic-write path as the ini configs.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{write_atomic, Result};

fn load_json<T: DeserializeOwned + Default>(path: &Path) -> T {
    if !path.exists() {
        return T::default();
    }
    match std::fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
        Err(_) => T::default(),
    }
}

fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    write_atomic(path, &json)
}

/// Buyer usernames excluded from delivery/response/notifications.
#[derive(Debug, Default)]
pub struct Blacklist {
    path: PathBuf,
    users: HashSet<String>,
}

impl Blacklist {
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let users: Vec<String> = load_json(&path);
        debug!(count = users.len(), "blacklist loaded");
        Self {
            path,
            users: users.into_iter().collect(),
        }
    }

    pub fn contains(&self, username: &str) -> bool {
        self.users.contains(username)
    }

    pub fn add(&mut self, username: String) -> Result<()> {
        self.users.insert(username);
        self.save()
    }

    pub fn remove(&mut self, username: &str) -> Result<()> {
        self.users.remove(username);
        self.save()
    }

    pub fn users(&self) -> impl Iterator<Item = &str> {
        self.users.iter().map(String::as_str)
    }

    fn save(&self) -> Result<()> {
        let mut sorted: Vec<&String> = self.users.iter().collect();
        sorted.sort();
        save_json(&self.path, &sorted)
    }
}

/// Greeting gate state: chat id -> unix time the chat was last seen.
#[derive(Debug, Default)]
pub struct OldUsers {
    path: PathBuf,
    users: HashMap<i64, i64>,
}

impl OldUsers {
    /// Loads the table, dropping entries already past the cooldown so the
    /// file does not grow without bound.
    pub fn load(path: impl Into<PathBuf>, cooldown_days: f64, now: i64) -> Self {
        let path = path.into();
        let raw: HashMap<String, i64> = load_json(&path);
        let cooldown = (cooldown_days * 86_400.0) as i64;
        let users: HashMap<i64, i64> = raw
            .into_iter()
            .filter_map(|(k, v)| k.parse::<i64>().ok().map(|k| (k, v)))
            .filter(|(_, seen)| now - seen < cooldown)
            .collect();
        Self { path, users }
    }

    pub fn last_seen(&self, chat_id: i64) -> Option<i64> {
        self.users.get(&chat_id).copied()
    }

    pub fn mark_seen(&mut self, chat_id: i64, now: i64) -> Result<()> {
        self.users.insert(chat_id, now);
        self.save()
    }

    fn save(&self) -> Result<()> {
        let raw: HashMap<String, i64> = self.users.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        save_json(&self.path, &raw)
    }
}

/// Previously used proxies, keyed by a small integer id.
#[derive(Debug, Default)]
pub struct ProxyDict {
    path: PathBuf,
    proxies: HashMap<i64, String>,
}

impl ProxyDict {
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let raw: HashMap<String, String> = load_json(&path);
        let mut proxies: HashMap<i64, String> = raw
            .into_iter()
            .filter_map(|(k, v)| k.parse().ok().map(|k: i64| (k, v)))
            .collect();

        // Duplicate proxy strings accumulate from repeated setups; keep the
        // lowest id of each.
        let mut seen = HashSet::new();
        let mut ids: Vec<i64> = proxies.keys().copied().collect();
        ids.sort();
        for id in ids {
            let value = proxies[&id].trim().to_owned();
            if !seen.insert(value) {
                proxies.remove(&id);
            }
        }
        Self { path, proxies }
    }

    pub fn contains(&self, proxy: &str) -> bool {
        self.proxies.values().any(|p| p == proxy)
    }

    pub fn add(&mut self, proxy: String) -> Result<()> {
        if self.contains(&proxy) {
            return Ok(());
        }
        let next_id = self.proxies.keys().max().copied().unwrap_or(-1) + 1;
        self.proxies.insert(next_id, proxy);
        self.save()
    }

    pub fn all(&self) -> &HashMap<i64, String> {
        &self.proxies
    }

    fn save(&self) -> Result<()> {
        let raw: HashMap<String, String> = self
            .proxies
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        save_json(&self.path, &raw)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForecastEntry {
    pub completed_at: i64,
    pub price: f64,
    pub currency: String,
}

/// Withdrawal forecast: order id -> completion record, evicted after 48 h.
#[derive(Debug, Default)]
pub struct WithdrawalForecast {
    path: PathBuf,
    entries: HashMap<String, ForecastEntry>,
}

impl WithdrawalForecast {
    pub const RETENTION_SECS: i64 = 48 * 3600;

    pub fn load(path: impl Into<PathBuf>, now: i64) -> Self {
        let path = path.into();
        let entries: HashMap<String, ForecastEntry> = load_json(&path);
        let entries = entries
            .into_iter()
            .filter(|(_, e)| now - e.completed_at < Self::RETENTION_SECS)
            .collect();
        Self { path, entries }
    }

    pub fn record(&mut self, order_id: String, entry: ForecastEntry) -> Result<()> {
        self.entries.insert(order_id, entry);
        self.save()
    }

    pub fn evict_older_than(&mut self, now: i64) -> Result<()> {
        let before = self.entries.len();
        self.entries
            .retain(|_, e| now - e.completed_at < Self::RETENTION_SECS);
        if self.entries.len() != before {
            self.save()?;
        }
        Ok(())
    }

    pub fn entries(&self) -> &HashMap<String, ForecastEntry> {
        &self.entries
    }

    fn save(&self) -> Result<()> {
        save_json(&self.path, &self.entries)
    }
}

/// Reply templates offered by the control plane.
#[derive(Debug, Default)]
pub struct AnswerTemplates {
    path: PathBuf,
    templates: Vec<String>,
}

impl AnswerTemplates {
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let templates = load_json(&path);
        Self { path, templates }
    }

    pub fn templates(&self) -> &[String] {
        &self.templates
    }

    pub fn add(&mut self, template: String) -> Result<()> {
        self.templates.push(template);
        save_json(&self.path, &self.templates)
    }

    pub fn remove(&mut self, index: usize) -> Result<()> {
        if index < self.templates.len() {
            self.templates.remove(index);
            save_json(&self.path, &self.templates)?;
        }
        Ok(())
    }
}

/// Control-plane operators allowed to drive the bot.
#[derive(Debug, Default)]
pub struct AuthorizedUsers {
    path: PathBuf,
    users: HashSet<i64>,
}

impl AuthorizedUsers {
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let users: Vec<i64> = load_json(&path);
        Self {
            path,
            users: users.into_iter().collect(),
        }
    }

    pub fn contains(&self, user_id: i64) -> bool {
        self.users.contains(&user_id)
    }

    pub fn add(&mut self, user_id: i64) -> Result<()> {
        self.users.insert(user_id);
        let mut sorted: Vec<i64> = self.users.iter().copied().collect();
        sorted.sort();
        save_json(&self.path, &sorted)
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blacklist_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blacklist.json");
        let mut bl = Blacklist::load(&path);
        bl.add("scammer".to_owned()).unwrap();
        let reloaded = Blacklist::load(&path);
        assert!(reloaded.contains("scammer"));
        assert!(!reloaded.contains("friend"));
    }

    #[test]
    fn old_users_prunes_expired_entries_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old_users.json");
        let now = 1_000_000;
        let mut users = OldUsers::load(&path, 1.0, now);
        users.mark_seen(1, now - 100).unwrap();
        users.mark_seen(2, now - 2 * 86_400).unwrap();

        let reloaded = OldUsers::load(&path, 1.0, now);
        assert_eq!(reloaded.last_seen(1), Some(now - 100));
        assert_eq!(reloaded.last_seen(2), None);
    }

    #[test]
    fn proxy_dict_deduplicates_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy_dict.json");
        std::fs::write(
            &path,
            r#"{"0": "1.1.1.1:80", "1": "1.1.1.1:80", "2": "2.2.2.2:80"}"#,
        )
        .unwrap();
        let dict = ProxyDict::load(&path);
        assert_eq!(dict.all().len(), 2);
        assert!(dict.contains("2.2.2.2:80"));
    }

    #[test]
    fn forecast_evicts_after_retention() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("withdrawal_forecast.json");
        let now = 1_000_000;
        let mut forecast = WithdrawalForecast::load(&path, now);
        forecast
            .record(
                "AAAA1111".to_owned(),
                ForecastEntry {
                    completed_at: now,
                    price: 10.0,
                    currency: "RUB".to_owned(),
                },
            )
            .unwrap();
        forecast
            .record(
                "BBBB2222".to_owned(),
                ForecastEntry {
                    completed_at: now - WithdrawalForecast::RETENTION_SECS - 1,
                    price: 5.0,
                    currency: "USD".to_owned(),
                },
            )
            .unwrap();
        forecast.evict_older_than(now).unwrap();
        assert!(forecast.entries().contains_key("AAAA1111"));
        assert!(!forecast.entries().contains_key("BBBB2222"));
    }
}
