//! Field derivation: explicit annotations first, passive fallbacks second.
//!
//! Scheme conventions follow the dashboard's usage: external URLs are https
//! (Ingress host or external-DNS hostname), local URLs are http over the
//! cluster-internal service DNS name.

use tabsync_core::annotations::{self, AnnotationSet};
use tabsync_core::{DesiredTab, SourceObject, SyncError, TabType};
use tracing::warn;

const APP_NAME_LABEL: &str = "app.kubernetes.io/name";

fn derr(obj: &SourceObject, reason: impl Into<String>) -> SyncError {
    SyncError::Derivation {
        source_key: obj.source_key(),
        reason: reason.into(),
    }
}

/// Title-case a resource or label name: separators become spaces, each word
/// gets a leading capital.
fn title_case(raw: &str) -> String {
    raw.replace(['-', '_'], " ")
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Construct the desired tab for one opted-in resource.
pub fn derive_tab(obj: &SourceObject) -> Result<DesiredTab, SyncError> {
    let ann = AnnotationSet::of(obj);

    // Name: annotation, else the conventional app label, else the resource
    // name, title-cased either way.
    let app_name = obj.label(APP_NAME_LABEL).unwrap_or(&obj.name).to_string();
    let name = match ann.get(annotations::NAME) {
        Some(explicit) => explicit.trim().to_string(),
        None => title_case(&app_name),
    };

    // External URL: annotation, else first Ingress host, else external-DNS
    // hostname. A resource without any stays eligible unless it is an iframe.
    let url = ann
        .get(annotations::URL)
        .map(str::to_string)
        .or_else(|| obj.hosts.first().map(|host| format!("https://{host}")))
        .or_else(|| {
            obj.annotation(annotations::EXTERNAL_DNS_HOSTNAME)
                .map(str::trim)
                .filter(|host| !host.is_empty())
                .map(|host| format!("https://{host}"))
        });

    // Local URL: only for resources backed by a cluster-internal address and
    // port.
    let url_local = ann.get(annotations::URL_LOCAL).map(str::to_string).or_else(|| {
        match (&obj.service_host, obj.service_port) {
            (Some(host), Some(port)) => Some(format!("http://{host}.svc.cluster.local:{port}")),
            _ => None,
        }
    });

    // Ping target (host:port, no scheme): backing service, else first host
    // over 443.
    let ping_url = ann
        .get(annotations::PING_URL)
        .map(str::to_string)
        .or_else(|| match (&obj.service_host, obj.service_port) {
            (Some(host), Some(port)) => Some(format!("{host}:{port}")),
            _ => None,
        })
        .or_else(|| obj.hosts.first().map(|host| format!("{host}:443")));

    let tab_type = ann.tab_type().map_err(|e| derr(obj, e))?;
    if tab_type == TabType::Iframe && url.is_none() {
        return Err(derr(obj, "no url could be derived for an iframe tab"));
    }

    let order = ann.int(annotations::ORDER).map_err(|e| derr(obj, e))?;
    let default = ann
        .bool(annotations::DEFAULT, false)
        .map_err(|e| derr(obj, e))?;
    let active = ann
        .bool(annotations::ACTIVE, true)
        .map_err(|e| derr(obj, e))?;
    let splash = ann
        .bool(annotations::SPLASH, false)
        .map_err(|e| derr(obj, e))?;
    let preload = ann
        .bool(annotations::PRELOAD, false)
        .map_err(|e| derr(obj, e))?;

    // Ping defaults to on whenever a target exists; with no target it is
    // forced off, overriding an explicit "true" so an empty target is never
    // probed.
    let ping_requested = ann
        .bool(annotations::PING, ping_url.is_some())
        .map_err(|e| derr(obj, e))?;
    let ping = ping_requested && ping_url.is_some();
    if ping_requested && ping_url.is_none() {
        warn!(source = %obj.source_key(), "ping requested but no ping target derivable; forcing off");
    }

    let image = tabsync_icons::resolve_tab_icon(ann.get(annotations::IMAGE), &app_name);

    let mut tab = DesiredTab::new(name, obj.source_key());
    tab.url = url;
    tab.url_local = url_local;
    tab.ping_url = ping_url;
    tab.image = image;
    tab.tab_type = tab_type;
    tab.group = ann.get(annotations::GROUP).map(str::to_string);
    tab.group_icon = ann.get(annotations::GROUP_ICON).map(str::to_string);
    tab.category = ann.get(annotations::CATEGORY).map(str::to_string);
    tab.category_icon = ann.get(annotations::CATEGORY_ICON).map(str::to_string);
    tab.order = order;
    tab.default = default;
    tab.active = active;
    tab.splash = splash;
    tab.ping = ping;
    tab.preload = preload;
    Ok(tab)
}
