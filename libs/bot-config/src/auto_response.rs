//! `configs/auto_response.cfg` — one section per chat command.
//!
//! A section name may be a pipe-joined alias list (`!price|!цена`); it fans
//! out into one rule per alias sharing the same response and notification
//! settings. Lookup keys are normalized: lowercased, trimmed, newlines
//! stripped.

use std::collections::HashMap;
use std::path::Path;

use ini::Ini;

use crate::{write_atomic, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoReplyRule {
    pub response: String,
    pub telegram_notification: bool,
    pub notification_text: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AutoResponseConfig {
    rules: HashMap<String, AutoReplyRule>,
    /// Raw section names as the operator wrote them, for saving back.
    raw_sections: Vec<(String, AutoReplyRule)>,
}

/// Normalizes a message into a command lookup key.
pub fn normalize_command(text: &str) -> String {
    text.replace('\n', "").trim().to_lowercase()
}

impl AutoResponseConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let ini = Ini::load_from_file(path)?;
        let mut config = Self::default();
        for (section, properties) in ini.iter() {
            let Some(section) = section else {
                continue;
            };
            let rule = AutoReplyRule {
                response: properties.get("response").unwrap_or("").to_owned(),
                telegram_notification: properties
                    .get("telegramNotification")
                    .map(|v| v.trim() == "1")
                    .unwrap_or(false),
                notification_text: properties
                    .get("notificationText")
                    .filter(|v| !v.is_empty())
                    .map(str::to_owned),
            };
            config.raw_sections.push((section.to_owned(), rule.clone()));
            for alias in section.split('|') {
                let key = normalize_command(alias);
                if !key.is_empty() {
                    config.rules.insert(key, rule.clone());
                }
            }
        }
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut ini = Ini::new();
        for (section, rule) in &self.raw_sections {
            let mut setter = ini.with_section(Some(section.clone()));
            let setter = setter.set("response", rule.response.clone()).set(
                "telegramNotification",
                if rule.telegram_notification { "1" } else { "0" },
            );
            if let Some(text) = &rule.notification_text {
                setter.set("notificationText", text.clone());
            }
        }
        let mut buf = Vec::new();
        ini.write_to(&mut buf)?;
        write_atomic(path.as_ref(), &String::from_utf8_lossy(&buf))
    }

    /// Looks a rule up by an already-normalized command key.
    pub fn get(&self, command: &str) -> Option<&AutoReplyRule> {
        self.rules.get(command)
    }

    /// Whether the given raw message text is a known command.
    pub fn matches(&self, text: &str) -> bool {
        self.rules.contains_key(&normalize_command(text))
    }

    pub fn commands(&self) -> impl Iterator<Item = &str> {
        self.rules.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.raw_sections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw_sections.is_empty()
    }

    pub fn upsert(&mut self, section: String, rule: AutoReplyRule) {
        self.raw_sections.retain(|(name, _)| name != &section);
        self.raw_sections.push((section.clone(), rule.clone()));
        for alias in section.split('|') {
            let key = normalize_command(alias);
            if !key.is_empty() {
                self.rules.insert(key, rule.clone());
            }
        }
    }

    pub fn remove(&mut self, section: &str) {
        self.raw_sections.retain(|(name, _)| name != section);
        for alias in section.split('|') {
            self.rules.remove(&normalize_command(alias));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_sections_fan_out_to_aliases() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auto_response.cfg");
        std::fs::write(
            &path,
            "[!price|!цена]\nresponse = See the lot page\ntelegramNotification = 1\n",
        )
        .unwrap();
        let config = AutoResponseConfig::load(&path).unwrap();
        assert!(config.matches("!price"));
        assert!(config.matches("!ЦЕНА"));
        assert_eq!(
            config.get("!price").unwrap().response,
            config.get("!цена").unwrap().response
        );
        assert!(config.get("!price").unwrap().telegram_notification);
    }

    #[test]
    fn lookup_key_is_normalized() {
        assert_eq!(normalize_command("  !Help\n"), "!help");
        assert_eq!(normalize_command("HI\nthere"), "hithere");
    }

    #[test]
    fn missing_file_is_an_empty_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = AutoResponseConfig::load(dir.path().join("nope.cfg")).unwrap();
        assert!(config.is_empty());
    }

    #[test]
    fn save_preserves_alias_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auto_response.cfg");
        let mut config = AutoResponseConfig::default();
        config.upsert(
            "!a|!b".to_owned(),
            AutoReplyRule {
                response: "x".to_owned(),
                telegram_notification: false,
                notification_text: None,
            },
        );
        config.save(&path).unwrap();
        let reloaded = AutoResponseConfig::load(&path).unwrap();
        assert!(reloaded.matches("!a"));
        assert!(reloaded.matches("!b"));
    }
}
