//! Organizr v2 API client.
//!
//! Auth is a `Token` header carrying the API key. Responses are unwrapped
//! tolerantly: payloads may be nested under `data` (and under a
//! `tabs`/`categories`/`groups` key inside that), and older installs emit
//! legacy field names (`tabName`, `tabGroupID`, ...).

#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, Method, StatusCode};
use serde_json::{json, Value as Json};
use tracing::{debug, info};

use tabsync_core::{
    DesiredTab, RemoteApi, RemoteCategory, RemoteError, RemoteGroup, RemoteTab, TabType,
    DEFAULT_GROUP_ID,
};

pub struct OrganizrClient {
    http: Client,
    base_url: String,
}

impl OrganizrClient {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let mut token = HeaderValue::from_str(api_key).context("api key is not a valid header value")?;
        token.set_sensitive(true);
        headers.insert("Token", token);
        let http = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .context("building http client")?;
        Ok(OrganizrClient {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Issue a request and decode the JSON body, classifying failures.
    async fn send(&self, method: Method, path: &str, body: Option<Json>) -> Result<Json, RemoteError> {
        let mut req = self.http.request(method.clone(), self.url(path));
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req.send().await.map_err(|e| {
            let status = e.status().map(|s| s.as_u16());
            RemoteError::Transient {
                status,
                message: format!("{method} {path}: {e}"),
            }
        })?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if status.is_client_error() || status.is_server_error() {
            return Err(classify_status(status, format!("{method} {path}: {text}")));
        }
        if text.trim().is_empty() {
            return Ok(Json::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| RemoteError::Decode(format!("{method} {path}: {e}")))
    }
}

/// HTTP status to error class: 5xx and 429 are worth retrying, other 4xx are
/// not.
fn classify_status(status: StatusCode, message: String) -> RemoteError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RemoteError::Transient {
            status: Some(status.as_u16()),
            message,
        }
    } else {
        RemoteError::Permanent {
            status: status.as_u16(),
            message,
        }
    }
}

/// Strip the `data` envelope (and a nested collection key) from a response.
fn unwrap_data(mut v: Json, key: &str) -> Json {
    if let Some(d) = v.get_mut("data") {
        v = d.take();
    }
    if let Some(inner) = v.get_mut(key) {
        v = inner.take();
    }
    v
}

fn as_list(v: Json, key: &str) -> Vec<Json> {
    match unwrap_data(v, key) {
        Json::Array(items) => items,
        _ => Vec::new(),
    }
}

/// Integer field under any of the given keys; numeric strings count.
fn jint(raw: &Json, keys: &[&str], default: i64) -> i64 {
    for key in keys {
        match raw.get(key) {
            Some(Json::Number(n)) => return n.as_i64().unwrap_or(default),
            Some(Json::String(s)) => {
                if let Ok(v) = s.trim().parse::<i64>() {
                    return v;
                }
            }
            _ => {}
        }
    }
    default
}

fn jbool(raw: &Json, keys: &[&str], default: bool) -> bool {
    jint(raw, keys, if default { 1 } else { 0 }) == 1
}

/// Non-empty string field under any of the given keys.
fn jstr(raw: &Json, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(s) = raw.get(key).and_then(Json::as_str) {
            if !s.is_empty() {
                return Some(s.to_string());
            }
        }
    }
    None
}

fn parse_tab(raw: &Json) -> RemoteTab {
    RemoteTab {
        id: jint(raw, &["id"], 0),
        name: jstr(raw, &["name", "tab_name", "tabName"]).unwrap_or_default(),
        url: jstr(raw, &["url", "tab_url", "tabURL"]).unwrap_or_default(),
        url_local: jstr(raw, &["url_local", "tabLocalURL"]),
        ping_url: jstr(raw, &["ping_url", "pingURL"]),
        image: jstr(raw, &["image", "tab_image", "tabImage"]),
        tab_type: TabType::from_wire(jint(raw, &["type", "tab_type", "tabType"], 1)),
        group_id: jint(raw, &["group_id", "tabGroupID"], DEFAULT_GROUP_ID),
        category_id: match jint(raw, &["category_id", "tabCategoryID"], 0) {
            0 => None,
            id => Some(id),
        },
        order: match jint(raw, &["order", "tab_order", "tabOrder"], 0) {
            0 => None,
            o => Some(o),
        },
        default: jbool(raw, &["default"], false),
        active: jbool(raw, &["enabled", "active"], true),
        splash: jbool(raw, &["splash"], false),
        ping: jbool(raw, &["ping"], false),
        preload: jbool(raw, &["preload"], false),
    }
}

fn parse_category(raw: &Json) -> RemoteCategory {
    RemoteCategory {
        id: jint(raw, &["id", "category_id"], 0),
        name: jstr(raw, &["name", "category_name"]).unwrap_or_default(),
        image: jstr(raw, &["image", "icon"]),
    }
}

fn parse_group(raw: &Json) -> RemoteGroup {
    RemoteGroup {
        id: jint(raw, &["id", "group_id"], 0),
        name: jstr(raw, &["name", "group_name"]).unwrap_or_default(),
        image: jstr(raw, &["image", "icon"]),
    }
}

/// Serialize a desired tab into the dict the v2 API expects.
fn tab_payload(tab: &DesiredTab) -> Json {
    let mut payload = json!({
        "name": tab.name,
        "url": tab.url.clone().unwrap_or_default(),
        "url_local": tab.url_local.clone().unwrap_or_default(),
        "ping_url": tab.ping_url.clone().unwrap_or_default(),
        "image": tab.image.clone().unwrap_or_default(),
        "type": tab.tab_type.as_wire(),
        "group_id": tab.group_id.unwrap_or(DEFAULT_GROUP_ID),
        "category_id": tab.category_id.unwrap_or(0),
        "default": tab.default as i64,
        "enabled": tab.active as i64,
        "splash": tab.splash as i64,
        "ping": tab.ping as i64,
        "preload": tab.preload as i64,
    });
    if let Some(order) = tab.order {
        payload["order"] = order.into();
    }
    payload
}

#[async_trait::async_trait]
impl RemoteApi for OrganizrClient {
    async fn health_check(&self) -> bool {
        match self.send(Method::GET, "/api/v2/ping", None).await {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "health check failed");
                false
            }
        }
    }

    async fn list_tabs(&self) -> Result<Vec<RemoteTab>, RemoteError> {
        let body = self.send(Method::GET, "/api/v2/tabs", None).await?;
        Ok(as_list(body, "tabs").iter().map(parse_tab).collect())
    }

    async fn create_tab(&self, tab: &DesiredTab) -> Result<RemoteTab, RemoteError> {
        info!(name = %tab.name, url = ?tab.url, "creating tab");
        let body = self
            .send(Method::POST, "/api/v2/tabs", Some(tab_payload(tab)))
            .await?;
        let created = unwrap_data(body, "tab");
        match created.get("id") {
            Some(_) => Ok(RemoteTab::from_desired(jint(&created, &["id"], 0), tab)),
            None => Err(RemoteError::Decode(format!(
                "create tab {:?}: response carries no id",
                tab.name
            ))),
        }
    }

    async fn update_tab(&self, id: i64, tab: &DesiredTab) -> Result<RemoteTab, RemoteError> {
        info!(id, name = %tab.name, "updating tab");
        let mut payload = tab_payload(tab);
        payload["id"] = id.into();
        self.send(Method::PUT, &format!("/api/v2/tabs/{id}"), Some(payload))
            .await?;
        Ok(RemoteTab::from_desired(id, tab))
    }

    async fn delete_tab(&self, id: i64) -> Result<(), RemoteError> {
        info!(id, "deleting tab");
        self.send(Method::DELETE, &format!("/api/v2/tabs/{id}"), None)
            .await?;
        Ok(())
    }

    async fn list_categories(&self) -> Result<Vec<RemoteCategory>, RemoteError> {
        let body = self.send(Method::GET, "/api/v2/categories", None).await?;
        Ok(as_list(body, "categories").iter().map(parse_category).collect())
    }

    async fn create_category(
        &self,
        name: &str,
        icon: Option<&str>,
    ) -> Result<RemoteCategory, RemoteError> {
        info!(name, "creating category");
        let mut payload = json!({ "name": name });
        if let Some(icon) = icon {
            payload["image"] = icon.into();
        }
        let body = self
            .send(Method::POST, "/api/v2/categories", Some(payload))
            .await?;
        let created = unwrap_data(body, "category");
        match created.get("id") {
            Some(_) => Ok(RemoteCategory {
                id: jint(&created, &["id"], 0),
                name: name.to_string(),
                image: icon.map(str::to_string),
            }),
            None => Err(RemoteError::Decode(format!(
                "create category {name:?}: response carries no id"
            ))),
        }
    }

    async fn update_category_icon(&self, id: i64, icon: &str) -> Result<(), RemoteError> {
        self.send(
            Method::PUT,
            &format!("/api/v2/categories/{id}"),
            Some(json!({ "image": icon })),
        )
        .await?;
        Ok(())
    }

    async fn list_groups(&self) -> Result<Vec<RemoteGroup>, RemoteError> {
        let body = self.send(Method::GET, "/api/v2/groups", None).await?;
        Ok(as_list(body, "groups").iter().map(parse_group).collect())
    }

    async fn update_group_icon(&self, id: i64, icon: &str) -> Result<(), RemoteError> {
        self.send(
            Method::PUT,
            &format!("/api/v2/groups/{id}"),
            Some(json!({ "image": icon })),
        )
        .await?;
        Ok(())
    }
}
