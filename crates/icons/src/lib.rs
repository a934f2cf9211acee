//! Built-in icon catalog and passive icon matching.
//!
//! When no explicit image annotation is set, the derived app name is matched
//! against the catalog of tab icons the dashboard ships under
//! `plugins/images/tabs/`. `fontawesome::<icon-name>` references and full
//! URLs pass through verbatim.
//!
//! The matching rule is deterministic: normalize (lowercase, strip
//! non-alphanumerics), then exact key match, then substring containment in
//! either direction (longest key wins, ties lexicographic), then a bounded
//! fuzzy score. Test fixtures depend on this order staying stable.

#![forbid(unsafe_code)]

use fuzzy_matcher::skim::SkimMatcherV2;
use fuzzy_matcher::FuzzyMatcher;
use tracing::debug;

/// Path prefix completing bare group icon filenames.
pub const GROUP_ICON_PATH: &str = "plugins/images/groups/";
/// Path prefix completing bare category icon filenames.
pub const CATEGORY_ICON_PATH: &str = "plugins/images/categories/";

const FONTAWESOME_PREFIX: &str = "fontawesome::";

/// Minimum skim score for the last-resort fuzzy step. Scores below this are
/// coincidental subsequences, not app names.
const MIN_FUZZY_SCORE: i64 = 64;

/// Known app names (normalized) to the image string the dashboard expects.
/// Covers the common homelab apps; additions are trivial.
static CATALOG: &[(&str, &str)] = &[
    ("adguard", "plugins/images/tabs/adguard.png"),
    ("audiobookshelf", "plugins/images/tabs/audiobookshelf.png"),
    ("bazarr", "plugins/images/tabs/bazarr.png"),
    ("bitwarden", "plugins/images/tabs/bitwarden.png"),
    ("bookstack", "plugins/images/tabs/bookstack.png"),
    ("calibre", "plugins/images/tabs/calibre.png"),
    ("calibreweb", "plugins/images/tabs/calibreweb.png"),
    ("deluge", "plugins/images/tabs/deluge.png"),
    ("download", "fontawesome::download"),
    ("duplicati", "plugins/images/tabs/duplicati.png"),
    ("emby", "plugins/images/tabs/emby.png"),
    ("filebrowser", "plugins/images/tabs/filebrowser.png"),
    ("gaps", "plugins/images/tabs/gaps.png"),
    ("gitea", "plugins/images/tabs/gitea.png"),
    ("gitlab", "plugins/images/tabs/gitlab.png"),
    ("grafana", "plugins/images/tabs/grafana.png"),
    ("guacamole", "plugins/images/tabs/guacamole.png"),
    ("heimdall", "plugins/images/tabs/heimdall.png"),
    ("home", "fontawesome::home"),
    ("homeassistant", "plugins/images/tabs/homeassistant.png"),
    ("homepage", "plugins/images/tabs/homepage.png"),
    ("immich", "plugins/images/tabs/immich.png"),
    ("jackett", "plugins/images/tabs/jackett.png"),
    ("jellyfin", "plugins/images/tabs/jellyfin.png"),
    ("jenkins", "plugins/images/tabs/jenkins.png"),
    ("kavita", "plugins/images/tabs/kavita.png"),
    ("komga", "plugins/images/tabs/komga.png"),
    ("lidarr", "plugins/images/tabs/lidarr.png"),
    ("longhorn", "plugins/images/tabs/longhorn.png"),
    ("minio", "plugins/images/tabs/minio.png"),
    ("monica", "plugins/images/tabs/monica.png"),
    ("music", "fontawesome::music"),
    ("mylar", "plugins/images/tabs/mylar.png"),
    ("netdata", "plugins/images/tabs/netdata.png"),
    ("nextcloud", "plugins/images/tabs/nextcloud.png"),
    ("nginx", "plugins/images/tabs/nginx.png"),
    ("nodered", "plugins/images/tabs/nodered.png"),
    ("nzbget", "plugins/images/tabs/nzbget.png"),
    ("nzbhydra", "plugins/images/tabs/nzbhydra.png"),
    ("ombi", "plugins/images/tabs/ombi.png"),
    ("organizr", "plugins/images/tabs/organizr.png"),
    ("overseerr", "plugins/images/tabs/overseerr.png"),
    ("petio", "plugins/images/tabs/petio.png"),
    ("pihole", "plugins/images/tabs/pihole.png"),
    ("plex", "plugins/images/tabs/plex.png"),
    ("portainer", "plugins/images/tabs/portainer.png"),
    ("prowlarr", "plugins/images/tabs/prowlarr.png"),
    ("proxmox", "plugins/images/tabs/proxmox.png"),
    ("qbittorrent", "plugins/images/tabs/qbittorrent.png"),
    ("radarr", "plugins/images/tabs/radarr.png"),
    ("readarr", "plugins/images/tabs/readarr.png"),
    ("requestrr", "plugins/images/tabs/requestrr.png"),
    ("rtorrent", "plugins/images/tabs/rtorrent.png"),
    ("rutorrent", "plugins/images/tabs/rutorrent.png"),
    ("sabnzbd", "plugins/images/tabs/sabnzbd.png"),
    ("search", "fontawesome::search"),
    ("settings", "fontawesome::cog"),
    ("sonarr", "plugins/images/tabs/sonarr.png"),
    ("speedtest", "plugins/images/tabs/speedtest.png"),
    ("syncthing", "plugins/images/tabs/syncthing.png"),
    ("tautulli", "plugins/images/tabs/tautulli.png"),
    ("tdarr", "plugins/images/tabs/tdarr.png"),
    ("traefik", "plugins/images/tabs/traefik.png"),
    ("transmission", "plugins/images/tabs/transmission.png"),
    ("truenas", "plugins/images/tabs/truenas.png"),
    ("unifi", "plugins/images/tabs/unifi.png"),
    ("unraid", "plugins/images/tabs/unraid.png"),
    ("uptimekuma", "plugins/images/tabs/uptimekuma.png"),
    ("vaultwarden", "plugins/images/tabs/vaultwarden.png"),
    ("video", "fontawesome::video"),
    ("watchtower", "plugins/images/tabs/watchtower.png"),
    ("whisparr", "plugins/images/tabs/whisparr.png"),
];

/// Normalize an app name for matching: lowercase, alphanumerics only.
///
/// "Home-Assistant", "home_assistant" and "homeassistant" all normalize to
/// the same key.
pub fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn catalog_get(normalized: &str) -> Option<&'static str> {
    CATALOG
        .iter()
        .find(|(k, _)| *k == normalized)
        .map(|(_, v)| *v)
}

/// Resolve the tab icon from an explicit annotation value or a derived app
/// name. Absence of a match is valid, not an error.
pub fn resolve_tab_icon(explicit: Option<&str>, app_name: &str) -> Option<String> {
    match explicit {
        Some(value) => Some(resolve_explicit(value)),
        None => match_icon(app_name),
    }
}

/// Explicit values: URLs and fontawesome references pass through; known
/// catalog keys expand; anything else is taken as a filename.
fn resolve_explicit(value: &str) -> String {
    let v = value.trim();
    if v.starts_with("http://") || v.starts_with("https://") || v.starts_with('/') {
        return v.to_string();
    }
    if v.starts_with(FONTAWESOME_PREFIX) {
        return v.to_string();
    }
    match catalog_get(&normalize_name(v)) {
        Some(path) => path.to_string(),
        None => v.to_string(),
    }
}

/// Fuzzy-match an app name against the catalog. Returns None on no match.
pub fn match_icon(app_name: &str) -> Option<String> {
    let normalized = normalize_name(app_name);
    if normalized.is_empty() {
        return None;
    }

    if let Some(path) = catalog_get(&normalized) {
        debug!(app = %app_name, icon = %path, "icon matched exactly");
        return Some(path.to_string());
    }

    // Containment either direction: "radarrprod" contains "radarr".
    let mut candidates: Vec<&(&str, &str)> = CATALOG
        .iter()
        .filter(|(k, _)| normalized.contains(k) || k.contains(normalized.as_str()))
        .collect();
    candidates.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then(a.0.cmp(b.0)));
    if let Some((key, path)) = candidates.first() {
        debug!(app = %app_name, key = %key, icon = %path, "icon matched by containment");
        return Some(path.to_string());
    }

    // Last resort: bounded fuzzy score over catalog keys.
    let matcher = SkimMatcherV2::default();
    let mut best: Option<(i64, &str, &str)> = None;
    for &(key, path) in CATALOG {
        let score = matcher
            .fuzzy_match(key, &normalized)
            .max(matcher.fuzzy_match(&normalized, key));
        if let Some(score) = score {
            if score >= MIN_FUZZY_SCORE {
                let better = match best {
                    None => true,
                    Some((s, k, _)) => score > s || (score == s && key < k),
                };
                if better {
                    best = Some((score, key, path));
                }
            }
        }
    }
    match best {
        Some((score, key, path)) => {
            debug!(app = %app_name, key = %key, score, icon = %path, "icon matched fuzzily");
            Some(path.to_string())
        }
        None => {
            debug!(app = %app_name, "no icon match");
            None
        }
    }
}

/// Normalize a group or category icon annotation to a full path or URL.
///
/// URLs and values containing a path separator pass through; a bare filename
/// is completed with `path_prefix`.
pub fn normalize_icon_spec(value: &str, path_prefix: &str) -> String {
    let v = value.trim();
    if v.is_empty() {
        return String::new();
    }
    if v.starts_with("http://") || v.starts_with("https://") {
        return v.to_string();
    }
    if v.contains('/') {
        return v.to_string();
    }
    format!("{}{}", path_prefix, v)
}
