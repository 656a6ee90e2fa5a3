//! The typed facade over the marketplace.
//!
//! All operations issue plain HTTPS requests the way the web frontend does,
//! carrying the session token cookie and the CSRF token scraped off the last
//! page load. Methods are thin: retry policy belongs to the callers.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, Method, Proxy, Response, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{ClientError, Result};
use crate::html;
use crate::patterns;
use crate::types::{
    Balance, ChatShortcut, Currency, LotFields, Message, MessageType, Order, Profile,
};

const DEFAULT_BASE_URL: &str = "https://funpay.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// The long poll blocks server-side; give it headroom beyond the regular
/// request timeout.
const LONG_POLL_TIMEOUT: Duration = Duration::from_secs(65);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub ip: String,
    pub port: u16,
    pub login: Option<String>,
    pub password: Option<String>,
}

impl ProxyConfig {
    pub fn url(&self) -> String {
        match (&self.login, &self.password) {
            (Some(l), Some(p)) if !l.is_empty() => {
                format!("http://{l}:{p}@{}:{}", self.ip, self.port)
            }
            _ => format!("http://{}:{}", self.ip, self.port),
        }
    }

    /// Masks the host for log output.
    pub fn masked(&self) -> String {
        let octets: Vec<&str> = self.ip.split('.').collect();
        if octets.len() == 4 {
            format!("{}.{}.***.***", octets[0], octets[1])
        } else {
            "**.**.**.**".to_owned()
        }
    }
}

#[derive(Debug, Default)]
struct SessionState {
    phpsessid: Option<String>,
    csrf_token: Option<String>,
    user_id: Option<i64>,
    username: Option<String>,
    locale: String,
    active_sales: u32,
}

pub struct Account {
    client: Client,
    base_url: String,
    golden_key: String,
    user_agent: String,
    proxy: Option<ProxyConfig>,
    session: Mutex<SessionState>,
    /// Chat shortcuts observed by the runner, for by-name lookups.
    chats: Mutex<HashMap<i64, ChatShortcut>>,
    /// chat id -> counterparty user id, learned from fetched histories.
    interlocutor_ids: Mutex<HashMap<i64, i64>>,
}

impl Account {
    pub fn new(
        golden_key: impl Into<String>,
        user_agent: impl Into<String>,
        proxy: Option<ProxyConfig>,
    ) -> Result<Self> {
        Self::with_base_url(golden_key, user_agent, proxy, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(
        golden_key: impl Into<String>,
        user_agent: impl Into<String>,
        proxy: Option<ProxyConfig>,
        base_url: impl Into<String>,
    ) -> Result<Self> {
        let mut builder = Client::builder().timeout(REQUEST_TIMEOUT);
        if let Some(p) = &proxy {
            builder = builder.proxy(Proxy::all(p.url())?);
        }
        let client = builder.build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            golden_key: golden_key.into(),
            user_agent: user_agent.into(),
            proxy,
            session: Mutex::new(SessionState {
                locale: "ru".to_owned(),
                ..SessionState::default()
            }),
            chats: Mutex::new(HashMap::new()),
            interlocutor_ids: Mutex::new(HashMap::new()),
        })
    }

    pub fn has_token(&self) -> bool {
        !self.golden_key.is_empty()
    }

    pub fn proxy(&self) -> Option<&ProxyConfig> {
        self.proxy.as_ref()
    }

    pub fn id(&self) -> i64 {
        self.session.lock().user_id.unwrap_or(0)
    }

    pub fn username(&self) -> String {
        self.session.lock().username.clone().unwrap_or_default()
    }

    pub fn active_sales(&self) -> u32 {
        self.session.lock().active_sales
    }

    pub fn is_initiated(&self) -> bool {
        self.session.lock().user_id.is_some()
    }

    pub fn csrf_token(&self) -> String {
        self.session.lock().csrf_token.clone().unwrap_or_default()
    }

    fn cookie_header(&self) -> String {
        let session = self.session.lock();
        match &session.phpsessid {
            Some(sid) => format!("golden_key={}; PHPSESSID={sid}", self.golden_key),
            None => format!("golden_key={}", self.golden_key),
        }
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        form: Option<&[(String, String)]>,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let mut headers = HeaderMap::new();
        headers.insert(
            "cookie",
            HeaderValue::from_str(&self.cookie_header())
                .map_err(|e| ClientError::Parse(e.to_string()))?,
        );
        headers.insert(
            "user-agent",
            HeaderValue::from_str(&self.user_agent)
                .map_err(|e| ClientError::Parse(e.to_string()))?,
        );
        headers.insert("x-requested-with", HeaderValue::from_static("XMLHttpRequest"));

        let mut req = self.client.request(method, url).headers(headers);
        if let Some(form) = form {
            req = req.form(form);
        }
        if let Some(t) = timeout {
            req = req.timeout(t);
        }
        let response = req.send().await?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ClientError::Unauthorized),
            status if !status.is_success() => {
                let body = response.text().await.unwrap_or_default();
                Err(ClientError::RequestFailed {
                    status: status.as_u16(),
                    body,
                })
            }
            _ => Ok(response),
        }
    }

    fn store_phpsessid(&self, response: &Response) {
        for cookie in response.cookies() {
            if cookie.name() == "PHPSESSID" {
                self.session.lock().phpsessid = Some(cookie.value().to_owned());
            }
        }
    }

    /// Refreshes the session: reloads the landing page, re-reads the CSRF
    /// token and (optionally) rotates the session cookie. Idempotent.
    pub async fn get(&self, update_session: bool) -> Result<()> {
        let response = self.request(Method::GET, "/", None, None).await?;
        if update_session {
            self.store_phpsessid(&response);
        }
        let page = response.text().await?;
        let (csrf, user_id, locale) = html::parse_app_data(&page)?;
        if user_id == 0 {
            return Err(ClientError::Unauthorized);
        }
        let username = html::parse_username(&page);
        let active_sales = html::parse_active_sales(&page);
        let mut session = self.session.lock();
        session.csrf_token = Some(csrf);
        session.user_id = Some(user_id);
        session.locale = locale;
        if let Some(name) = username {
            session.username = Some(name);
        }
        if let Some(sales) = active_sales {
            session.active_sales = sales;
        }
        debug!(user_id, "session refreshed");
        Ok(())
    }

    /// Fetches a public profile page and parses the listings snapshot.
    pub async fn get_user(&self, user_id: i64) -> Result<Profile> {
        let response = self
            .request(Method::GET, &format!("users/{user_id}/"), None, None)
            .await?;
        let page = response.text().await?;
        let username = if user_id == self.id() {
            self.username()
        } else {
            html::parse_username(&page).unwrap_or_default()
        };
        Ok(html::parse_profile(&page, user_id, &username))
    }

    /// One page of the sales list, with the account's own buyer/seller
    /// counters. `next_cursor` is `None` on the last page.
    pub async fn get_sales(&self, cursor: Option<&str>) -> Result<html::SalesPage> {
        let path = match cursor {
            Some(c) => format!("orders/trade?continue={c}"),
            None => "orders/trade".to_owned(),
        };
        let response = self.request(Method::GET, &path, None, None).await?;
        let page = response.text().await?;
        Ok(html::parse_sales(&page))
    }

    /// Shared POST to the long-poll endpoint; also carries chat sends.
    pub async fn runner_request(
        &self,
        objects: Value,
        request: Value,
        long_poll: bool,
    ) -> Result<Value> {
        let form = [
            ("objects".to_owned(), objects.to_string()),
            ("request".to_owned(), request.to_string()),
            ("csrf_token".to_owned(), self.csrf_token()),
        ];
        let timeout = long_poll.then_some(LONG_POLL_TIMEOUT);
        let response = self
            .request(Method::POST, "runner/", Some(&form), timeout)
            .await?;
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| ClientError::Parse(format!("runner response: {e}")))
    }

    /// Batched history fetch. Returned message lists are in ascending id
    /// order; chats the response omits are absent from the map.
    pub async fn get_chat_histories(
        &self,
        chats: &[(i64, String)],
        interlocutor_ids: &[i64],
    ) -> Result<HashMap<i64, Vec<Message>>> {
        let mut objects = Vec::new();
        for (chat_id, _) in chats {
            objects.push(json!({
                "type": "chat_node",
                "id": chat_id.to_string(),
                "tag": random_tag(),
                "data": {"node": chat_id, "last_message": -1, "content": ""},
            }));
        }
        for id in interlocutor_ids {
            objects.push(json!({
                "type": "c-p-u",
                "id": id.to_string(),
                "tag": random_tag(),
                "data": false,
            }));
        }
        let response = self
            .runner_request(Value::Array(objects), Value::Bool(false), false)
            .await?;

        let names: HashMap<i64, &str> = chats.iter().map(|(id, n)| (*id, n.as_str())).collect();
        let own_id = self.id();
        let own_username = self.username();
        let mut histories = HashMap::new();
        for obj in response["objects"].as_array().into_iter().flatten() {
            if obj["type"].as_str() != Some("chat_node") {
                continue;
            }
            let Some(chat_id) = obj["id"]
                .as_str()
                .and_then(|v| v.parse::<i64>().ok())
                .or_else(|| obj["id"].as_i64())
            else {
                continue;
            };
            let Some(fragment) = obj["data"]["html"].as_str() else {
                continue;
            };
            let messages = html::parse_chat_messages(
                fragment,
                chat_id,
                names.get(&chat_id).copied(),
                own_id,
                &own_username,
            );
            if let Some(interlocutor) = messages.iter().find_map(|m| m.interlocutor_id) {
                self.interlocutor_ids.lock().insert(chat_id, interlocutor);
            }
            histories.insert(chat_id, messages);
        }
        Ok(histories)
    }

    /// Posts one text message.
    ///
    /// HTTP 400 with a "refresh the page" body is surfaced as
    /// [`ClientError::RequestFailed`]; the caller refreshes the session once
    /// and retries exactly one time.
    pub async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        chat_name: Option<&str>,
        interlocutor_id: Option<i64>,
        image_id: Option<i64>,
        leave_as_unread: bool,
    ) -> Result<Message> {
        let content = match image_id {
            Some(_) => String::new(),
            None => format!("{}{}", html::BOT_MARKER, text),
        };
        let mut data = json!({
            "node": chat_id,
            "last_message": -1,
            "content": content,
            "mark_chat_as_read": !leave_as_unread,
        });
        if let Some(image_id) = image_id {
            data["image_id"] = json!(image_id);
        }
        let request = json!({"action": "chat_message", "data": data});
        let objects = json!([{
            "type": "chat_node",
            "id": chat_id.to_string(),
            "tag": random_tag(),
            "data": {"node": chat_id, "last_message": -1, "content": ""},
        }]);
        let response = self.runner_request(objects, request, false).await?;

        if let Some(error) = response["response"]["error"].as_str() {
            if !error.is_empty() {
                return Err(ClientError::RequestFailed {
                    status: 400,
                    body: error.to_owned(),
                });
            }
        }

        let message_id = response["objects"]
            .as_array()
            .into_iter()
            .flatten()
            .filter(|o| o["type"].as_str() == Some("chat_node"))
            .filter_map(|o| o["data"]["node"]["msg"].as_i64())
            .next()
            .unwrap_or(0);

        Ok(Message {
            id: message_id,
            chat_id,
            chat_name: chat_name.map(str::to_owned),
            author_id: self.id(),
            author: self.username(),
            text: image_id.is_none().then(|| text.to_owned()),
            image_link: None,
            kind: MessageType::NonSystem,
            badge: None,
            is_employee: false,
            is_autoreply: false,
            by_bot: true,
            by_vertex: false,
            interlocutor_id,
            i_am_buyer: false,
        })
    }

    /// Posts an already-uploaded image by id. Same contract as
    /// [`Account::send_message`].
    pub async fn send_image(
        &self,
        chat_id: i64,
        image_id: i64,
        chat_name: Option<&str>,
        interlocutor_id: Option<i64>,
        leave_as_unread: bool,
    ) -> Result<Message> {
        self.send_message(
            chat_id,
            "",
            chat_name,
            interlocutor_id,
            Some(image_id),
            leave_as_unread,
        )
        .await
    }

    /// Raises every given subcategory of a category.
    pub async fn raise_lots(&self, category_id: i64, subcategory_ids: &[i64]) -> Result<()> {
        let mut form = vec![
            ("game_id".to_owned(), category_id.to_string()),
            ("csrf_token".to_owned(), self.csrf_token()),
        ];
        for id in subcategory_ids {
            form.push(("node_ids[]".to_owned(), id.to_string()));
        }
        let response = self
            .request(Method::POST, "lots/raise", Some(&form), None)
            .await?;
        let body = response.text().await?;
        let data: Value = serde_json::from_str(&body)
            .map_err(|e| ClientError::Parse(format!("raise response: {e}")))?;
        if data["error"].as_bool().unwrap_or(false) || data["error"].as_i64().unwrap_or(0) != 0 {
            let message = data["msg"].as_str().unwrap_or("").to_owned();
            let wait_time = (!message.is_empty()).then(|| patterns::parse_wait_time(&message));
            return Err(ClientError::Raise {
                wait_time,
                error_message: message,
            });
        }
        Ok(())
    }

    /// Reads the six balance figures off any public lot page of ours.
    pub async fn get_balance(&self, sample_lot_id: i64) -> Result<Balance> {
        let response = self
            .request(
                Method::GET,
                &format!("lots/offer?id={sample_lot_id}"),
                None,
                None,
            )
            .await?;
        let page = response.text().await?;
        Ok(html::parse_balance(&page))
    }

    /// Probes the currency-switch page for the displayed exchange rate.
    ///
    /// Returns `(rate, account_currency)` where `rate` converts one unit of
    /// the account's displayed currency into `target`. The displayed
    /// currency can silently change between calls, which is why the value
    /// is reported back to the caller for reconciliation.
    pub async fn get_exchange_rate(&self, target: Currency) -> Result<(f64, Currency)> {
        let cy = match target {
            Currency::Rub => "rub",
            Currency::Usd => "usd",
            Currency::Eur => "eur",
            Currency::Unknown => {
                return Err(ClientError::Parse("cannot probe unknown currency".to_owned()))
            }
        };
        let response = self
            .request(Method::GET, &format!("account/currency?cy={cy}"), None, None)
            .await?;
        let page = response.text().await?;
        let caps = patterns::patterns()
            .exchange_rate
            .captures(&page)
            .ok_or_else(|| ClientError::Parse("exchange rate banner missing".to_owned()))?;

        let left_amount = parse_decimal(&caps[4]);
        let left_currency = patterns::parse_currency(&caps[5]);
        let right_amount = parse_decimal(&caps[7]);
        let right_currency = patterns::parse_currency(&caps[8]);

        let (account_currency, account_amount, target_amount) = if right_currency == target {
            (left_currency, left_amount, right_amount)
        } else {
            (right_currency, right_amount, left_amount)
        };
        if account_amount == 0.0 {
            return Err(ClientError::Parse("zero-denominator exchange rate".to_owned()));
        }
        Ok((target_amount / account_amount, account_currency))
    }

    /// Refunds a paid order.
    pub async fn refund(&self, order_id: &str) -> Result<()> {
        let form = [
            ("id".to_owned(), order_id.to_owned()),
            ("csrf_token".to_owned(), self.csrf_token()),
        ];
        let response = self
            .request(Method::POST, "orders/refund", Some(&form), None)
            .await?;
        let body = response.text().await?;
        let data: Value = serde_json::from_str(&body)
            .map_err(|e| ClientError::Parse(format!("refund response: {e}")))?;
        if data["error"].as_bool().unwrap_or(false) || data["error"].as_i64().unwrap_or(0) != 0 {
            return Err(ClientError::RequestFailed {
                status: 200,
                body: data["msg"].as_str().unwrap_or("refund rejected").to_owned(),
            });
        }
        Ok(())
    }

    /// Reads the opaque field bag of the lot editor.
    pub async fn get_lot_fields(&self, lot_id: i64) -> Result<LotFields> {
        let response = self
            .request(
                Method::GET,
                &format!("lots/offerEdit?offer={lot_id}"),
                None,
                None,
            )
            .await?;
        let page = response.text().await?;
        let mut fields = html::parse_lot_fields(&page);
        fields.insert("csrf_token".to_owned(), self.csrf_token());
        fields.insert("offer_id".to_owned(), lot_id.to_string());
        Ok(LotFields { lot_id, fields })
    }

    /// Saves the field bag back. Field-level rejections come back as
    /// [`ClientError::LotSaving`] with the offending field names.
    pub async fn save_lot(&self, fields: &LotFields) -> Result<()> {
        let form: Vec<(String, String)> = fields
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let response = self
            .request(Method::POST, "lots/offerSave", Some(&form), None)
            .await?;
        let body = response.text().await?;
        let data: Value = serde_json::from_str(&body)
            .map_err(|e| ClientError::Parse(format!("offer save response: {e}")))?;
        if let Some(errors) = data["errors"].as_object() {
            if !errors.is_empty() {
                let errors = errors
                    .iter()
                    .map(|(k, v)| (k.clone(), v.as_str().unwrap_or("").to_owned()))
                    .collect();
                return Err(ClientError::LotSaving { errors });
            }
        }
        if data["error"].as_bool().unwrap_or(false) {
            return Err(ClientError::RequestFailed {
                status: 200,
                body: data["msg"].as_str().unwrap_or("lot save rejected").to_owned(),
            });
        }
        Ok(())
    }

    /// Posts a seller reply to an order review.
    pub async fn send_review(&self, order_id: &str, text: &str) -> Result<()> {
        let form = [
            ("orderId".to_owned(), order_id.to_owned()),
            ("text".to_owned(), text.to_owned()),
            ("csrf_token".to_owned(), self.csrf_token()),
        ];
        let response = self
            .request(Method::POST, "orders/review", Some(&form), None)
            .await?;
        let body = response.text().await?;
        if let Ok(data) = serde_json::from_str::<Value>(&body) {
            if data["error"].as_bool().unwrap_or(false) || data["error"].as_i64().unwrap_or(0) != 0
            {
                return Err(ClientError::FeedbackEditing(
                    data["msg"].as_str().unwrap_or("review rejected").to_owned(),
                ));
            }
        }
        Ok(())
    }

    /// Uploads an image for later use in chat messages; returns its id.
    pub async fn upload_image(&self, file_name: &str, bytes: Vec<u8>) -> Result<i64> {
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name.to_owned())
            .mime_str("image/png")
            .map_err(|e| ClientError::Parse(e.to_string()))?;
        let form = reqwest::multipart::Form::new().part("file", part);
        let url = format!("{}/file/addChatImage", self.base_url);
        let response = self
            .client
            .post(url)
            .header("cookie", self.cookie_header())
            .header("user-agent", self.user_agent.clone())
            .header("x-requested-with", "XMLHttpRequest")
            .multipart(form)
            .send()
            .await?;
        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(ClientError::Unauthorized)
            }
            status if !status.is_success() => {
                let body = response.text().await.unwrap_or_default();
                return Err(ClientError::RequestFailed {
                    status: status.as_u16(),
                    body,
                });
            }
            _ => {}
        }
        let data: Value = response
            .json()
            .await
            .map_err(|e| ClientError::Parse(format!("image upload response: {e}")))?;
        data["fileId"]
            .as_i64()
            .or_else(|| data["fileId"].as_str().and_then(|v| v.parse().ok()))
            .ok_or_else(|| ClientError::Parse("image id missing from upload response".to_owned()))
    }

    /// Fetches and parses the full order page.
    pub async fn get_order(&self, order_id: &str) -> Result<Order> {
        let response = self
            .request(Method::GET, &format!("orders/{order_id}/"), None, None)
            .await?;
        let page = response.text().await?;
        Ok(html::parse_order(&page, order_id))
    }

    /// Remembers chat shortcuts observed by the runner.
    pub fn add_chats(&self, new_chats: &[ChatShortcut]) {
        let mut chats = self.chats.lock();
        for chat in new_chats {
            chats.insert(chat.id, chat.clone());
        }
    }

    /// Looks a chat up by counterparty name, optionally falling back to a
    /// fresh fetch of the chat list.
    pub async fn get_chat_by_name(
        &self,
        name: &str,
        make_request: bool,
    ) -> Result<Option<ChatShortcut>> {
        if let Some(chat) = self.find_cached_chat(name) {
            return Ok(Some(chat));
        }
        if !make_request {
            return Ok(None);
        }
        let response = self.request(Method::GET, "chat/", None, None).await?;
        let page = response.text().await?;
        let chats = html::parse_contact_items(&page);
        self.add_chats(&chats);
        Ok(self.find_cached_chat(name))
    }

    fn find_cached_chat(&self, name: &str) -> Option<ChatShortcut> {
        self.chats.lock().values().find(|c| c.name == name).cloned()
    }

    pub fn interlocutor_id(&self, chat_id: i64) -> Option<i64> {
        self.interlocutor_ids.lock().get(&chat_id).copied()
    }

    pub fn known_interlocutor_ids(&self) -> Vec<i64> {
        self.interlocutor_ids.lock().values().copied().collect()
    }

    pub fn remember_interlocutor(&self, chat_id: i64, interlocutor_id: i64) {
        self.interlocutor_ids.lock().insert(chat_id, interlocutor_id);
    }

    /// Probes connectivity through the configured proxy without touching
    /// the marketplace.
    pub async fn check_proxy(&self) -> bool {
        let Some(proxy) = &self.proxy else {
            return true;
        };
        let result = self
            .client
            .get("https://api.ipify.org/")
            .timeout(Duration::from_secs(10))
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => {
                debug!(proxy = %proxy.masked(), "proxy reachable");
                true
            }
            Ok(resp) => {
                warn!(status = %resp.status(), "proxy probe rejected");
                false
            }
            Err(e) => {
                warn!(error = %e, "proxy probe failed");
                false
            }
        }
    }
}

fn parse_decimal(raw: &str) -> f64 {
    raw.replace(',', ".").replace(' ', "").parse().unwrap_or(0.0)
}

/// Opaque correlation tag for long-poll objects.
pub fn random_tag() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..10)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_url_with_and_without_auth() {
        let plain = ProxyConfig {
            ip: "10.0.0.1".to_owned(),
            port: 8080,
            login: None,
            password: None,
        };
        assert_eq!(plain.url(), "http://10.0.0.1:8080");
        let auth = ProxyConfig {
            ip: "10.0.0.1".to_owned(),
            port: 8080,
            login: Some("u".to_owned()),
            password: Some("p".to_owned()),
        };
        assert_eq!(auth.url(), "http://u:p@10.0.0.1:8080");
    }

    #[test]
    fn proxy_mask_hides_host_tail() {
        let proxy = ProxyConfig {
            ip: "203.0.113.7".to_owned(),
            port: 1080,
            login: None,
            password: None,
        };
        assert_eq!(proxy.masked(), "203.0.***.***");
    }

    #[test]
    fn random_tags_are_ten_lowercase_alnum() {
        let tag = random_tag();
        assert_eq!(tag.len(), 10);
        assert!(tag.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }
}
