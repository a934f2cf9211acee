//! Annotation surface recognized on watched resources.

use crate::{SourceObject, TabType};

/// Prefix qualifying every controller annotation.
pub const ANNOTATION_PREFIX: &str = "tabsync.dev";

/// Conventional external-DNS hostname annotation honored as a URL fallback.
pub const EXTERNAL_DNS_HOSTNAME: &str = "external-dns.alpha.kubernetes.io/hostname";

pub const ENABLED: &str = "enabled";
pub const NAME: &str = "name";
pub const URL: &str = "url";
pub const URL_LOCAL: &str = "url-local";
pub const PING_URL: &str = "ping-url";
pub const IMAGE: &str = "image";
pub const TYPE: &str = "type";
pub const GROUP: &str = "group";
pub const GROUP_ICON: &str = "group-icon";
pub const CATEGORY: &str = "category";
pub const CATEGORY_ICON: &str = "category-icon";
pub const ORDER: &str = "order";
pub const DEFAULT: &str = "default";
pub const ACTIVE: &str = "active";
pub const SPLASH: &str = "splash";
pub const PING: &str = "ping";
pub const PRELOAD: &str = "preload";

/// Fully-qualified annotation key for a short key name.
pub fn ann(key: &str) -> String {
    format!("{ANNOTATION_PREFIX}/{key}")
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

/// Typed view over the prefixed annotations of one resource.
///
/// Accessors are strict: an unparsable value is an error for the resource,
/// not a silent default.
pub struct AnnotationSet<'a> {
    obj: &'a SourceObject,
}

impl<'a> AnnotationSet<'a> {
    pub fn of(obj: &'a SourceObject) -> Self {
        AnnotationSet { obj }
    }

    /// Opt-in gate. Anything but a literal (case-insensitive) "true" is off.
    pub fn enabled(&self) -> bool {
        self.get(ENABLED)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    /// Trimmed value of a prefixed annotation; empty values read as unset.
    pub fn get(&self, key: &str) -> Option<&'a str> {
        self.obj
            .annotation(&ann(key))
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    pub fn bool(&self, key: &str, default: bool) -> Result<bool, String> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => {
                parse_bool(raw).ok_or_else(|| format!("annotation {key}: not a boolean: {raw:?}"))
            }
        }
    }

    pub fn int(&self, key: &str) -> Result<Option<i64>, String> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .parse::<i64>()
                .map(Some)
                .map_err(|_| format!("annotation {key}: not an integer: {raw:?}")),
        }
    }

    pub fn tab_type(&self) -> Result<TabType, String> {
        match self.get(TYPE) {
            None => Ok(TabType::Iframe),
            Some(raw) => TabType::parse(raw)
                .ok_or_else(|| format!("annotation {TYPE}: unknown tab type: {raw:?}")),
        }
    }
}
