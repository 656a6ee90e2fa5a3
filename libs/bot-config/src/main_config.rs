//! `configs/_main.cfg` — the operator-facing main settings file.
//!
//! Section and key names are part of the observable surface (the control
//! plane edits them by name); do not rename them.

use std::path::Path;

use ini::Ini;
use tracing::info;

use crate::{write_atomic, ConfigError, Result};

#[derive(Debug, Clone)]
pub struct FunPaySection {
    pub golden_key: String,
    pub user_agent: String,
    pub auto_raise: bool,
    pub auto_response: bool,
    pub auto_delivery: bool,
    pub multi_delivery: bool,
    pub auto_restore: bool,
    pub auto_disable: bool,
    pub old_msg_get_mode: bool,
    pub keep_sent_messages_unread: bool,
    pub locale: String,
}

#[derive(Debug, Clone)]
pub struct BlockListSection {
    pub block_delivery: bool,
    pub block_response: bool,
    pub block_new_message_notification: bool,
    pub block_new_order_notification: bool,
    pub block_command_notification: bool,
}

#[derive(Debug, Clone)]
pub struct NewMessageViewSection {
    pub include_my_messages: bool,
    pub include_fp_messages: bool,
    pub include_bot_messages: bool,
    pub notify_only_my_messages: bool,
    pub notify_only_fp_messages: bool,
    pub notify_only_bot_messages: bool,
    pub show_image_name: bool,
}

#[derive(Debug, Clone)]
pub struct GreetingsSection {
    pub send_greetings: bool,
    pub ignore_system_messages: bool,
    pub greetings_text: String,
    /// Days; fractional values are allowed.
    pub greetings_cooldown: f64,
}

#[derive(Debug, Clone)]
pub struct OrderConfirmSection {
    pub send_reply: bool,
    pub watermark: bool,
    pub reply_text: String,
}

#[derive(Debug, Clone, Default)]
pub struct ReviewReplySection {
    /// Index 0 holds the 1-star settings.
    pub star_reply: [bool; 5],
    pub star_reply_text: [String; 5],
}

impl ReviewReplySection {
    pub fn reply_for(&self, stars: u8) -> Option<&str> {
        let idx = (stars as usize).checked_sub(1)?;
        let enabled = *self.star_reply.get(idx)?;
        let text = self.star_reply_text.get(idx)?;
        (enabled && !text.is_empty()).then_some(text.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ProxySection {
    pub enable: bool,
    pub ip: String,
    pub port: String,
    pub login: String,
    pub password: String,
    pub check: bool,
    pub check_interval: u64,
}

impl ProxySection {
    pub fn is_configured(&self) -> bool {
        self.enable && !self.ip.is_empty() && !self.port.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct OtherSection {
    pub watermark: String,
    pub requests_delay: f64,
    pub language: String,
}

#[derive(Debug, Clone)]
pub struct MainConfig {
    pub funpay: FunPaySection,
    pub blocklist: BlockListSection,
    pub new_message_view: NewMessageViewSection,
    pub greetings: GreetingsSection,
    pub order_confirm: OrderConfirmSection,
    pub review_reply: ReviewReplySection,
    pub proxy: ProxySection,
    pub other: OtherSection,
}

fn get_bool(ini: &Ini, section: &str, key: &str, default: bool) -> bool {
    ini.get_from(Some(section), key)
        .map(|v| v.trim() == "1" || v.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

fn get_str(ini: &Ini, section: &str, key: &str, default: &str) -> String {
    ini.get_from(Some(section), key)
        .map(str::to_owned)
        .unwrap_or_else(|| default.to_owned())
}

fn get_f64(ini: &Ini, section: &str, key: &str, default: f64) -> f64 {
    ini.get_from(Some(section), key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Default for MainConfig {
    fn default() -> Self {
        Self {
            funpay: FunPaySection {
                golden_key: String::new(),
                user_agent: String::new(),
                auto_raise: false,
                auto_response: false,
                auto_delivery: false,
                multi_delivery: false,
                auto_restore: false,
                auto_disable: false,
                old_msg_get_mode: false,
                keep_sent_messages_unread: false,
                locale: "ru".to_owned(),
            },
            blocklist: BlockListSection {
                block_delivery: false,
                block_response: false,
                block_new_message_notification: false,
                block_new_order_notification: false,
                block_command_notification: false,
            },
            new_message_view: NewMessageViewSection {
                include_my_messages: true,
                include_fp_messages: true,
                include_bot_messages: true,
                notify_only_my_messages: false,
                notify_only_fp_messages: false,
                notify_only_bot_messages: false,
                show_image_name: true,
            },
            greetings: GreetingsSection {
                send_greetings: false,
                ignore_system_messages: false,
                greetings_text: "Hello, $username!".to_owned(),
                greetings_cooldown: 2.0,
            },
            order_confirm: OrderConfirmSection {
                send_reply: false,
                watermark: true,
                reply_text: String::new(),
            },
            review_reply: ReviewReplySection::default(),
            proxy: ProxySection {
                enable: false,
                ip: String::new(),
                port: String::new(),
                login: String::new(),
                password: String::new(),
                check: false,
                check_interval: 3600,
            },
            // The watermark starts empty: first setup must not inject any
            // default prefix into outgoing messages.
            other: OtherSection {
                watermark: String::new(),
                requests_delay: 4.0,
                language: "ru".to_owned(),
            },
        }
    }
}

impl MainConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!(path = %path.display(), "main config missing, writing defaults");
            let config = Self::default();
            config.save(path)?;
            return Ok(config);
        }
        let ini = Ini::load_from_file(path)?;
        let mut config = Self {
            funpay: FunPaySection {
                golden_key: get_str(&ini, "FunPay", "golden_key", ""),
                user_agent: get_str(&ini, "FunPay", "user_agent", ""),
                auto_raise: get_bool(&ini, "FunPay", "autoRaise", false),
                auto_response: get_bool(&ini, "FunPay", "autoResponse", false),
                auto_delivery: get_bool(&ini, "FunPay", "autoDelivery", false),
                multi_delivery: get_bool(&ini, "FunPay", "multiDelivery", false),
                auto_restore: get_bool(&ini, "FunPay", "autoRestore", false),
                auto_disable: get_bool(&ini, "FunPay", "autoDisable", false),
                old_msg_get_mode: get_bool(&ini, "FunPay", "oldMsgGetMode", false),
                keep_sent_messages_unread: get_bool(&ini, "FunPay", "keepSentMessagesUnread", false),
                locale: get_str(&ini, "FunPay", "locale", "ru"),
            },
            blocklist: BlockListSection {
                block_delivery: get_bool(&ini, "BlockList", "blockDelivery", false),
                block_response: get_bool(&ini, "BlockList", "blockResponse", false),
                block_new_message_notification: get_bool(
                    &ini,
                    "BlockList",
                    "blockNewMessageNotification",
                    false,
                ),
                block_new_order_notification: get_bool(
                    &ini,
                    "BlockList",
                    "blockNewOrderNotification",
                    false,
                ),
                block_command_notification: get_bool(
                    &ini,
                    "BlockList",
                    "blockCommandNotification",
                    false,
                ),
            },
            new_message_view: NewMessageViewSection {
                include_my_messages: get_bool(&ini, "NewMessageView", "includeMyMessages", true),
                include_fp_messages: get_bool(&ini, "NewMessageView", "includeFPMessages", true),
                include_bot_messages: get_bool(&ini, "NewMessageView", "includeBotMessages", true),
                notify_only_my_messages: get_bool(
                    &ini,
                    "NewMessageView",
                    "notifyOnlyMyMessages",
                    false,
                ),
                notify_only_fp_messages: get_bool(
                    &ini,
                    "NewMessageView",
                    "notifyOnlyFPMessages",
                    false,
                ),
                notify_only_bot_messages: get_bool(
                    &ini,
                    "NewMessageView",
                    "notifyOnlyBotMessages",
                    false,
                ),
                show_image_name: get_bool(&ini, "NewMessageView", "showImageName", true),
            },
            greetings: GreetingsSection {
                send_greetings: get_bool(&ini, "Greetings", "sendGreetings", false),
                ignore_system_messages: get_bool(&ini, "Greetings", "ignoreSystemMessages", false),
                greetings_text: get_str(&ini, "Greetings", "greetingsText", "Hello, $username!"),
                greetings_cooldown: get_f64(&ini, "Greetings", "greetingsCooldown", 2.0),
            },
            order_confirm: OrderConfirmSection {
                send_reply: get_bool(&ini, "OrderConfirm", "sendReply", false),
                watermark: get_bool(&ini, "OrderConfirm", "watermark", true),
                reply_text: get_str(&ini, "OrderConfirm", "replyText", ""),
            },
            review_reply: {
                let mut section = ReviewReplySection::default();
                for stars in 1..=5usize {
                    section.star_reply[stars - 1] =
                        get_bool(&ini, "ReviewReply", &format!("star{stars}Reply"), false);
                    section.star_reply_text[stars - 1] =
                        get_str(&ini, "ReviewReply", &format!("star{stars}ReplyText"), "");
                }
                section
            },
            proxy: ProxySection {
                enable: get_bool(&ini, "Proxy", "enable", false),
                ip: get_str(&ini, "Proxy", "ip", ""),
                port: get_str(&ini, "Proxy", "port", ""),
                login: get_str(&ini, "Proxy", "login", ""),
                password: get_str(&ini, "Proxy", "password", ""),
                check: get_bool(&ini, "Proxy", "check", false),
                check_interval: get_f64(&ini, "Proxy", "checkInterval", 3600.0) as u64,
            },
            other: OtherSection {
                watermark: get_str(&ini, "Other", "watermark", ""),
                requests_delay: get_f64(&ini, "Other", "requestsDelay", 4.0),
                language: get_str(&ini, "Other", "language", "ru"),
            },
        };
        config.other.requests_delay = config.other.requests_delay.clamp(1.0, 100.0);
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.greetings.greetings_cooldown < 0.0 {
            return Err(ConfigError::Validation(
                "greetingsCooldown must not be negative".to_owned(),
            ));
        }
        if self.proxy.enable && !self.proxy.ip.is_empty() {
            let port: Option<u16> = self.proxy.port.trim().parse().ok();
            if port.is_none() {
                return Err(ConfigError::Validation(
                    "Proxy port must be an integer in 0..65536".to_owned(),
                ));
            }
        }
        Ok(())
    }

    fn bool_str(v: bool) -> &'static str {
        if v {
            "1"
        } else {
            "0"
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut ini = Ini::new();
        ini.with_section(Some("FunPay"))
            .set("golden_key", &self.funpay.golden_key)
            .set("user_agent", &self.funpay.user_agent)
            .set("autoRaise", Self::bool_str(self.funpay.auto_raise))
            .set("autoResponse", Self::bool_str(self.funpay.auto_response))
            .set("autoDelivery", Self::bool_str(self.funpay.auto_delivery))
            .set("multiDelivery", Self::bool_str(self.funpay.multi_delivery))
            .set("autoRestore", Self::bool_str(self.funpay.auto_restore))
            .set("autoDisable", Self::bool_str(self.funpay.auto_disable))
            .set("oldMsgGetMode", Self::bool_str(self.funpay.old_msg_get_mode))
            .set(
                "keepSentMessagesUnread",
                Self::bool_str(self.funpay.keep_sent_messages_unread),
            )
            .set("locale", &self.funpay.locale);
        ini.with_section(Some("BlockList"))
            .set("blockDelivery", Self::bool_str(self.blocklist.block_delivery))
            .set("blockResponse", Self::bool_str(self.blocklist.block_response))
            .set(
                "blockNewMessageNotification",
                Self::bool_str(self.blocklist.block_new_message_notification),
            )
            .set(
                "blockNewOrderNotification",
                Self::bool_str(self.blocklist.block_new_order_notification),
            )
            .set(
                "blockCommandNotification",
                Self::bool_str(self.blocklist.block_command_notification),
            );
        ini.with_section(Some("NewMessageView"))
            .set(
                "includeMyMessages",
                Self::bool_str(self.new_message_view.include_my_messages),
            )
            .set(
                "includeFPMessages",
                Self::bool_str(self.new_message_view.include_fp_messages),
            )
            .set(
                "includeBotMessages",
                Self::bool_str(self.new_message_view.include_bot_messages),
            )
            .set(
                "notifyOnlyMyMessages",
                Self::bool_str(self.new_message_view.notify_only_my_messages),
            )
            .set(
                "notifyOnlyFPMessages",
                Self::bool_str(self.new_message_view.notify_only_fp_messages),
            )
            .set(
                "notifyOnlyBotMessages",
                Self::bool_str(self.new_message_view.notify_only_bot_messages),
            )
            .set(
                "showImageName",
                Self::bool_str(self.new_message_view.show_image_name),
            );
        ini.with_section(Some("Greetings"))
            .set("sendGreetings", Self::bool_str(self.greetings.send_greetings))
            .set(
                "ignoreSystemMessages",
                Self::bool_str(self.greetings.ignore_system_messages),
            )
            .set("greetingsText", &self.greetings.greetings_text)
            .set(
                "greetingsCooldown",
                self.greetings.greetings_cooldown.to_string(),
            );
        ini.with_section(Some("OrderConfirm"))
            .set("sendReply", Self::bool_str(self.order_confirm.send_reply))
            .set("watermark", Self::bool_str(self.order_confirm.watermark))
            .set("replyText", &self.order_confirm.reply_text);
        {
            let mut section = ini.with_section(Some("ReviewReply"));
            for stars in 1..=5usize {
                section
                    .set(
                        format!("star{stars}Reply"),
                        Self::bool_str(self.review_reply.star_reply[stars - 1]),
                    )
                    .set(
                        format!("star{stars}ReplyText"),
                        self.review_reply.star_reply_text[stars - 1].clone(),
                    );
            }
        }
        ini.with_section(Some("Proxy"))
            .set("enable", Self::bool_str(self.proxy.enable))
            .set("ip", &self.proxy.ip)
            .set("port", &self.proxy.port)
            .set("login", &self.proxy.login)
            .set("password", &self.proxy.password)
            .set("check", Self::bool_str(self.proxy.check))
            .set("checkInterval", self.proxy.check_interval.to_string());
        ini.with_section(Some("Other"))
            .set("watermark", &self.other.watermark)
            .set("requestsDelay", self.other.requests_delay.to_string())
            .set("language", &self.other.language);

        let mut buf = Vec::new();
        ini.write_to(&mut buf)?;
        let text = String::from_utf8(buf)
            .map_err(|e| ConfigError::Validation(format!("non-utf8 config output: {e}")))?;
        write_atomic(path.as_ref(), &text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("_main.cfg");
        let config = MainConfig::load(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.other.watermark, "");
        assert_eq!(config.funpay.locale, "ru");

        let reloaded = MainConfig::load(&path).unwrap();
        assert_eq!(reloaded.greetings.greetings_cooldown, 2.0);
        assert!(!reloaded.funpay.auto_raise);
    }

    #[test]
    fn requests_delay_is_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("_main.cfg");
        std::fs::write(&path, "[Other]\nrequestsDelay = 500\n").unwrap();
        let config = MainConfig::load(&path).unwrap();
        assert_eq!(config.other.requests_delay, 100.0);
    }

    #[test]
    fn review_reply_lookup_requires_toggle_and_text() {
        let mut section = ReviewReplySection::default();
        section.star_reply[4] = true;
        assert_eq!(section.reply_for(5), None);
        section.star_reply_text[4] = "thanks!".to_owned();
        assert_eq!(section.reply_for(5), Some("thanks!"));
        assert_eq!(section.reply_for(4), None);
        assert_eq!(section.reply_for(0), None);
        assert_eq!(section.reply_for(6), None);
    }

    #[test]
    fn invalid_proxy_port_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("_main.cfg");
        std::fs::write(&path, "[Proxy]\nenable = 1\nip = 1.2.3.4\nport = abc\n").unwrap();
        assert!(MainConfig::load(&path).is_err());
    }
}
