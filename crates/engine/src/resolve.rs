//! Identity resolution: group and category names to remote identifiers.
//!
//! Categories are created on demand, at most once per cycle per name; groups
//! are never created. Lookups are exact on the trimmed, case-sensitive name.

use rustc_hash::FxHashMap;
use tabsync_core::{DesiredTab, RemoteApi, RemoteCategory, RemoteError, RemoteGroup};
use tabsync_icons::{normalize_icon_spec, CATEGORY_ICON_PATH, GROUP_ICON_PATH};
use tracing::{debug, info, warn};

pub struct IdentityResolver {
    groups: Vec<RemoteGroup>,
    categories: Vec<RemoteCategory>,
    /// Per-cycle cache keyed by category name. Populated on first resolution,
    /// consulted before any remote create call. Discarded with the resolver
    /// at cycle end.
    resolved_categories: FxHashMap<String, i64>,
}

impl IdentityResolver {
    /// Snapshot the remote groups and categories for this cycle.
    pub async fn load(api: &dyn RemoteApi) -> Result<Self, RemoteError> {
        let groups = api.list_groups().await?;
        let categories = api.list_categories().await?;
        debug!(
            groups = groups.len(),
            categories = categories.len(),
            "loaded remote identities"
        );
        Ok(IdentityResolver {
            groups,
            categories,
            resolved_categories: FxHashMap::default(),
        })
    }

    /// Fill `group_id`/`category_id` on the tab. A missing group drops the
    /// reference with a warning; a missing category is created. Icon updates
    /// are best-effort and never fail the tab.
    pub async fn resolve(
        &mut self,
        api: &dyn RemoteApi,
        tab: &mut DesiredTab,
    ) -> Result<(), RemoteError> {
        if let Some(group_name) = tab.group.clone() {
            match self.groups.iter().find(|g| g.name.trim() == group_name) {
                Some(group) => {
                    tab.group_id = Some(group.id);
                    if let Some(icon) = &tab.group_icon {
                        let icon = normalize_icon_spec(icon, GROUP_ICON_PATH);
                        if group.image.as_deref().unwrap_or("") != icon {
                            if let Err(e) = api.update_group_icon(group.id, &icon).await {
                                warn!(group = %group_name, error = %e, "group icon update failed");
                            }
                        }
                    }
                }
                None => {
                    warn!(
                        tab = %tab.name,
                        group = %group_name,
                        "group not found; creating tab without a group (groups are never created)"
                    );
                    tab.group_id = None;
                }
            }
        }

        if let Some(category_name) = tab.category.clone() {
            let id = self.ensure_category(api, &category_name, tab.category_icon.as_deref()).await?;
            tab.category_id = Some(id);
        }
        Ok(())
    }

    async fn ensure_category(
        &mut self,
        api: &dyn RemoteApi,
        name: &str,
        icon: Option<&str>,
    ) -> Result<i64, RemoteError> {
        if let Some(&id) = self.resolved_categories.get(name) {
            return Ok(id);
        }
        let icon = icon.map(|i| normalize_icon_spec(i, CATEGORY_ICON_PATH));

        if let Some(category) = self.categories.iter().find(|c| c.name.trim() == name) {
            if let Some(icon) = &icon {
                if category.image.as_deref().unwrap_or("") != icon {
                    if let Err(e) = api.update_category_icon(category.id, icon).await {
                        warn!(category = name, error = %e, "category icon update failed");
                    }
                }
            }
            self.resolved_categories.insert(name.to_string(), category.id);
            return Ok(category.id);
        }

        // Not transactional with the tab write: if the tab create fails
        // later, the category persists and next cycle's lookup finds it.
        let created = api.create_category(name, icon.as_deref()).await?;
        info!(category = name, id = created.id, "category created");
        self.resolved_categories.insert(name.to_string(), created.id);
        Ok(created.id)
    }
}
