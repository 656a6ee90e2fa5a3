//! `configs/auto_delivery.cfg` — one section per lot title.

use std::collections::HashMap;
use std::path::Path;

use ini::Ini;

use crate::{write_atomic, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryRule {
    /// Outgoing text; must contain `$product` when inventory-backed.
    pub response: String,
    pub products_file_name: Option<String>,
    pub disable: bool,
    pub disable_multi_delivery: bool,
    pub disable_auto_restore: bool,
    pub disable_auto_disable: bool,
}

#[derive(Debug, Clone, Default)]
pub struct AutoDeliveryConfig {
    /// Insertion order matters: classification probes rules in file order.
    rules: Vec<(String, DeliveryRule)>,
}

impl AutoDeliveryConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let ini = Ini::load_from_file(path)?;
        let mut rules = Vec::new();
        for (section, properties) in ini.iter() {
            let Some(section) = section else {
                continue;
            };
            let flag = |key: &str| properties.get(key).map(|v| v.trim() == "1").unwrap_or(false);
            rules.push((
                section.to_owned(),
                DeliveryRule {
                    response: properties.get("response").unwrap_or("").to_owned(),
                    products_file_name: properties
                        .get("productsFileName")
                        .filter(|v| !v.is_empty())
                        .map(str::to_owned),
                    disable: flag("disable"),
                    disable_multi_delivery: flag("disableMultiDelivery"),
                    disable_auto_restore: flag("disableAutoRestore"),
                    disable_auto_disable: flag("disableAutoDisable"),
                },
            ));
        }
        Ok(Self { rules })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut ini = Ini::new();
        for (section, rule) in &self.rules {
            let flag = |v: bool| if v { "1" } else { "0" };
            let mut setter = ini.with_section(Some(section.clone()));
            let setter = setter
                .set("response", rule.response.clone())
                .set("disable", flag(rule.disable))
                .set("disableMultiDelivery", flag(rule.disable_multi_delivery))
                .set("disableAutoRestore", flag(rule.disable_auto_restore))
                .set("disableAutoDisable", flag(rule.disable_auto_disable));
            if let Some(file) = &rule.products_file_name {
                setter.set("productsFileName", file.clone());
            }
        }
        let mut buf = Vec::new();
        ini.write_to(&mut buf)?;
        write_atomic(path.as_ref(), &String::from_utf8_lossy(&buf))
    }

    pub fn get(&self, lot_title: &str) -> Option<&DeliveryRule> {
        self.rules
            .iter()
            .find(|(name, _)| name == lot_title)
            .map(|(_, rule)| rule)
    }

    /// Rule whose title occurs inside `lot_description` (lot-state sweep).
    pub fn find_containing(&self, lot_description: &str) -> Option<(&str, &DeliveryRule)> {
        self.rules
            .iter()
            .find(|(name, _)| lot_description.contains(name.as_str()))
            .map(|(name, rule)| (name.as_str(), rule))
    }

    /// Order classification: exact title match first, then prefix, then
    /// substring, each pass walking rules in file order.
    pub fn classify(&self, lot_description: &str) -> Option<(&str, &DeliveryRule)> {
        for pass in 0..3 {
            for (name, rule) in &self.rules {
                let hit = match pass {
                    0 => lot_description == name.as_str(),
                    1 => lot_description.starts_with(name.as_str()),
                    _ => lot_description.contains(name.as_str()),
                };
                if hit {
                    return Some((name.as_str(), rule));
                }
            }
        }
        None
    }

    pub fn rules(&self) -> impl Iterator<Item = (&str, &DeliveryRule)> {
        self.rules.iter().map(|(n, r)| (n.as_str(), r))
    }

    /// Whether any rule references the given inventory file; linked files
    /// must not be deleted by the control plane.
    pub fn references_file(&self, file_name: &str) -> bool {
        self.rules
            .iter()
            .any(|(_, r)| r.products_file_name.as_deref() == Some(file_name))
    }

    pub fn upsert(&mut self, lot_title: String, rule: DeliveryRule) {
        if let Some(slot) = self.rules.iter_mut().find(|(name, _)| name == &lot_title) {
            slot.1 = rule;
        } else {
            self.rules.push((lot_title, rule));
        }
    }

    pub fn remove(&mut self, lot_title: &str) {
        self.rules.retain(|(name, _)| name != lot_title);
    }

    pub fn get_map(&self) -> HashMap<String, DeliveryRule> {
        self.rules.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(titles: &[&str]) -> AutoDeliveryConfig {
        let mut config = AutoDeliveryConfig::default();
        for t in titles {
            config.upsert(
                (*t).to_owned(),
                DeliveryRule {
                    response: "Your key: $product".to_owned(),
                    ..DeliveryRule::default()
                },
            );
        }
        config
    }

    #[test]
    fn classify_prefers_exact_over_prefix_over_substring() {
        let config = config_with(&["Gold", "Gold, WoW EU", "WoW"]);
        let (name, _) = config.classify("Gold, WoW EU").unwrap();
        assert_eq!(name, "Gold, WoW EU");
        let (name, _) = config.classify("Gold, WoW RU x100").unwrap();
        assert_eq!(name, "Gold");
        let (name, _) = config.classify("Cheap WoW boost").unwrap();
        assert_eq!(name, "WoW");
        assert!(config.classify("Dota items").is_none());
    }

    #[test]
    fn round_trip_keeps_flags_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auto_delivery.cfg");
        let mut config = AutoDeliveryConfig::default();
        config.upsert(
            "Gold, WoW EU".to_owned(),
            DeliveryRule {
                response: "Your key: $product".to_owned(),
                products_file_name: Some("wow.txt".to_owned()),
                disable: false,
                disable_multi_delivery: true,
                disable_auto_restore: false,
                disable_auto_disable: false,
            },
        );
        config.save(&path).unwrap();
        let reloaded = AutoDeliveryConfig::load(&path).unwrap();
        let rule = reloaded.get("Gold, WoW EU").unwrap();
        assert_eq!(rule.products_file_name.as_deref(), Some("wow.txt"));
        assert!(rule.disable_multi_delivery);
        assert!(reloaded.references_file("wow.txt"));
        assert!(!reloaded.references_file("other.txt"));
    }
}
