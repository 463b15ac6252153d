//! Open tabs over supervised connections, in the order they were opened.

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum TabError {
    #[error("tab not found: {0}")]
    NotFound(String),
}

/// A UI tab bound to a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabInfo {
    pub id: String,
    pub connection_id: String,
    pub title: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TabInfo {
    fn new(connection_id: &str, title: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            connection_id: connection_id.to_owned(),
            title: title.to_owned(),
            active: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Open tabs, kept in opening order.
#[derive(Default)]
pub struct TabRegistry {
    tabs: RwLock<Vec<TabInfo>>,
}

impl TabRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<TabInfo>> {
        self.tabs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<TabInfo>> {
        self.tabs.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens a tab for `connection_id` and makes it active.
    ///
    /// If the connection already has a tab, that tab is activated and
    /// returned instead; its title is left unchanged.
    pub fn open(&self, connection_id: &str, title: &str) -> TabInfo {
        let mut tabs = self.write();
        let index = match tabs.iter().position(|t| t.connection_id == connection_id) {
            Some(index) => {
                debug!(connection = %connection_id, tab = %tabs[index].id, "reusing existing tab");
                index
            }
            None => {
                let tab = TabInfo::new(connection_id, title);
                info!(connection = %connection_id, tab = %tab.id, "tab opened");
                tabs.push(tab);
                tabs.len() - 1
            }
        };
        set_active(&mut tabs, index);
        tabs[index].clone()
    }

    /// Closes `tab_id`. Closing the active tab activates the most recently
    /// opened remaining one.
    pub fn close(&self, tab_id: &str) -> Result<TabInfo, TabError> {
        let mut tabs = self.write();
        let index = tabs
            .iter()
            .position(|t| t.id == tab_id)
            .ok_or_else(|| TabError::NotFound(tab_id.to_owned()))?;
        let removed = tabs.remove(index);
        if removed.active {
            activate_newest(&mut tabs);
        }
        info!(tab = %tab_id, connection = %removed.connection_id, "tab closed");
        Ok(removed)
    }

    /// Makes `tab_id` the single active tab.
    pub fn activate(&self, tab_id: &str) -> Result<TabInfo, TabError> {
        let mut tabs = self.write();
        let index = tabs
            .iter()
            .position(|t| t.id == tab_id)
            .ok_or_else(|| TabError::NotFound(tab_id.to_owned()))?;
        set_active(&mut tabs, index);
        debug!(tab = %tab_id, "tab activated");
        Ok(tabs[index].clone())
    }

    pub fn active(&self) -> Option<TabInfo> {
        self.read().iter().find(|t| t.active).cloned()
    }

    pub fn get(&self, tab_id: &str) -> Option<TabInfo> {
        self.read().iter().find(|t| t.id == tab_id).cloned()
    }

    /// All tabs, newest first.
    pub fn list(&self) -> Vec<TabInfo> {
        self.read().iter().rev().cloned().collect()
    }

    pub fn by_connection(&self, connection_id: &str) -> Option<TabInfo> {
        self.read()
            .iter()
            .find(|t| t.connection_id == connection_id)
            .cloned()
    }

    /// Closes every tab bound to `connection_id`.
    pub fn remove_for_connection(&self, connection_id: &str) -> Vec<TabInfo> {
        let mut tabs = self.write();
        let (removed, kept): (Vec<TabInfo>, Vec<TabInfo>) = tabs
            .drain(..)
            .partition(|t| t.connection_id == connection_id);
        *tabs = kept;
        if removed.iter().any(|t| t.active) {
            activate_newest(&mut tabs);
        }
        if !removed.is_empty() {
            debug!(connection = %connection_id, count = removed.len(), "tabs removed for connection");
        }
        removed
    }

    /// Closes every tab. Returns how many were open.
    pub fn close_all(&self) -> usize {
        let mut tabs = self.write();
        let count = tabs.len();
        tabs.clear();
        info!(count, "all tabs closed");
        count
    }

    /// Closes every tab except `keep`, which becomes active. Returns how many
    /// were closed.
    pub fn close_others(&self, keep: &str) -> Result<usize, TabError> {
        let mut tabs = self.write();
        let index = tabs
            .iter()
            .position(|t| t.id == keep)
            .ok_or_else(|| TabError::NotFound(keep.to_owned()))?;
        let kept = tabs.swap_remove(index);
        let closed = tabs.len();
        tabs.clear();
        tabs.push(kept);
        set_active(&mut tabs, 0);
        info!(tab = %keep, closed, "other tabs closed");
        Ok(closed)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

fn set_active(tabs: &mut [TabInfo], index: usize) {
    for (i, tab) in tabs.iter_mut().enumerate() {
        tab.active = i == index;
    }
    tabs[index].updated_at = Utc::now();
}

fn activate_newest(tabs: &mut [TabInfo]) {
    if let Some(last) = tabs.len().checked_sub(1) {
        set_active(tabs, last);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active_count(reg: &TabRegistry) -> usize {
        reg.list().iter().filter(|t| t.active).count()
    }

    #[test]
    fn open_activates_new_tab() {
        let reg = TabRegistry::new();
        let a = reg.open("c1", "web");
        let b = reg.open("c2", "db");

        assert!(Uuid::parse_str(&a.id).is_ok());
        assert_ne!(a.id, b.id);
        assert_eq!(reg.active().unwrap().id, b.id);
        assert_eq!(active_count(&reg), 1);
    }

    #[test]
    fn open_reuses_tab_for_same_connection() {
        let reg = TabRegistry::new();
        let first = reg.open("c1", "web");
        reg.open("c2", "db");

        let again = reg.open("c1", "renamed");
        assert_eq!(again.id, first.id);
        assert_eq!(again.title, "web");
        assert!(again.active);
        assert_eq!(reg.len(), 2);
        assert_eq!(active_count(&reg), 1);
    }

    #[test]
    fn list_is_newest_first() {
        let reg = TabRegistry::new();
        reg.open("c1", "one");
        reg.open("c2", "two");
        reg.open("c3", "three");

        let titles: Vec<String> = reg.list().into_iter().map(|t| t.title).collect();
        assert_eq!(titles, ["three", "two", "one"]);
    }

    #[test]
    fn closing_active_tab_activates_another() {
        let reg = TabRegistry::new();
        let a = reg.open("c1", "one");
        let b = reg.open("c2", "two");
        let c = reg.open("c3", "three");

        reg.close(&c.id).unwrap();
        assert_eq!(reg.active().unwrap().id, b.id);

        reg.activate(&a.id).unwrap();
        reg.close(&b.id).unwrap();
        assert_eq!(reg.active().unwrap().id, a.id);

        reg.close(&a.id).unwrap();
        assert!(reg.active().is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn unknown_tab_errors() {
        let reg = TabRegistry::new();
        assert_eq!(
            reg.close("nope"),
            Err(TabError::NotFound("nope".into()))
        );
        assert!(reg.activate("nope").is_err());
        assert!(reg.close_others("nope").is_err());
    }

    #[test]
    fn by_connection_and_remove_for_connection() {
        let reg = TabRegistry::new();
        reg.open("c1", "one");
        let b = reg.open("c2", "two");

        assert_eq!(reg.by_connection("c2").unwrap().id, b.id);
        let removed = reg.remove_for_connection("c2");
        assert_eq!(removed.len(), 1);
        assert!(reg.by_connection("c2").is_none());
        assert_eq!(reg.active().unwrap().connection_id, "c1");
        assert!(reg.remove_for_connection("c2").is_empty());
    }

    #[test]
    fn close_others_keeps_one_active() {
        let reg = TabRegistry::new();
        let a = reg.open("c1", "one");
        reg.open("c2", "two");
        reg.open("c3", "three");

        assert_eq!(reg.close_others(&a.id).unwrap(), 2);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.active().unwrap().id, a.id);
    }

    #[test]
    fn close_all_empties() {
        let reg = TabRegistry::new();
        reg.open("c1", "one");
        reg.open("c2", "two");
        assert_eq!(reg.close_all(), 2);
        assert!(reg.active().is_none());
    }

    #[test]
    fn serializes_camel_case() {
        let reg = TabRegistry::new();
        let tab = reg.open("c1", "web");
        let json = serde_json::to_value(&tab).unwrap();
        assert_eq!(json["connectionId"], "c1");
        assert_eq!(json["active"], true);
        assert!(json.get("createdAt").is_some());
    }
}
