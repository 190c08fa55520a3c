//! Slot layout and metadata.
//!
//! Three installation trees under `<home>/mcapp-slots/slot-{0,1,2}` plus a
//! `current` symlink and per-slot metadata under `meta/`. Activation is an
//! atomic symlink swap: a temp symlink is created and renamed over
//! `current`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{GatewayError, GatewayResult};

/// Number of slots in the rotation.
pub const SLOT_COUNT: u32 = 3;

/// Per-slot metadata persisted as `meta/slot-N.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotMeta {
    pub slot: u32,
    pub version: Option<String>,
    pub status: String,
    pub deployed_at: Option<String>,
}

impl SlotMeta {
    fn empty(slot: u32) -> Self {
        Self {
            slot,
            version: None,
            status: "empty".to_string(),
            deployed_at: None,
        }
    }
}

/// The on-disk slot layout rooted at `<home>/mcapp-slots`.
#[derive(Debug, Clone)]
pub struct SlotLayout {
    root: PathBuf,
}

impl SlotLayout {
    pub fn new(home: &Path) -> Self {
        Self {
            root: home.join("mcapp-slots"),
        }
    }

    /// Layout under the current user's home.
    pub fn default_layout() -> Self {
        let home = std::env::var("HOME").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("/root"));
        Self::new(&home)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn slot_dir(&self, slot: u32) -> PathBuf {
        self.root.join(format!("slot-{slot}"))
    }

    pub fn meta_dir(&self) -> PathBuf {
        self.root.join("meta")
    }

    fn meta_file(&self, slot: u32) -> PathBuf {
        self.meta_dir().join(format!("slot-{slot}.json"))
    }

    pub fn etc_archive(&self, slot: u32) -> PathBuf {
        self.meta_dir().join(format!("slot-{slot}.etc.tar.gz"))
    }

    /// Create the slot directories.
    pub fn ensure_dirs(&self) -> GatewayResult<()> {
        std::fs::create_dir_all(self.meta_dir())?;
        for slot in 0..SLOT_COUNT {
            std::fs::create_dir_all(self.slot_dir(slot))?;
        }
        Ok(())
    }

    pub fn read_meta(&self, slot: u32) -> SlotMeta {
        let path = self.meta_file(slot);
        std::fs::read_to_string(&path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_else(|| SlotMeta::empty(slot))
    }

    pub fn write_meta(&self, meta: &SlotMeta) -> GatewayResult<()> {
        std::fs::create_dir_all(self.meta_dir())?;
        std::fs::write(
            self.meta_file(meta.slot),
            serde_json::to_string_pretty(meta)?,
        )?;
        Ok(())
    }

    /// Slot the `current` symlink points to.
    pub fn active_slot(&self) -> Option<u32> {
        let current = self.root.join("current");
        let target = std::fs::read_link(&current).ok()?;
        let name = target.file_name()?.to_str()?;
        name.strip_prefix("slot-")?.parse().ok()
    }

    /// Most recent non-active slot with a deployed version.
    pub fn rollback_slot(&self) -> Option<u32> {
        let active = self.active_slot();
        let mut candidates: Vec<(String, u32)> = (0..SLOT_COUNT)
            .filter(|slot| Some(*slot) != active)
            .filter_map(|slot| {
                let meta = self.read_meta(slot);
                match (meta.version, meta.deployed_at) {
                    (Some(_), Some(at)) => Some((at, slot)),
                    _ => None,
                }
            })
            .collect();
        candidates.sort();
        candidates.last().map(|(_, slot)| *slot)
    }

    /// Target for a new deployment: prefer empty slots, else the oldest
    /// non-active one.
    pub fn oldest_slot(&self) -> u32 {
        for slot in 0..SLOT_COUNT {
            let meta = self.read_meta(slot);
            if meta.version.is_none() {
                return slot;
            }
        }
        let active = self.active_slot();
        let mut candidates: Vec<(String, u32)> = (0..SLOT_COUNT)
            .filter(|slot| Some(*slot) != active)
            .map(|slot| {
                (
                    self.read_meta(slot).deployed_at.unwrap_or_default(),
                    slot,
                )
            })
            .collect();
        candidates.sort();
        candidates.first().map_or(0, |(_, slot)| *slot)
    }

    /// Atomically point `current` at a slot: temp symlink plus rename.
    pub fn swap_symlink(&self, slot: u32) -> GatewayResult<()> {
        let tmp = self.root.join(".current.tmp");
        let target = format!("slot-{slot}");
        let _ = std::fs::remove_file(&tmp);
        #[cfg(unix)]
        std::os::unix::fs::symlink(&target, &tmp)?;
        std::fs::rename(&tmp, self.root.join("current"))?;
        debug!(slot, "current symlink swapped");
        Ok(())
    }

    /// Version deployed in a slot, read from its version file.
    pub fn slot_version(&self, slot: u32) -> Option<String> {
        let path = self.slot_dir(slot).join("webapp").join("version.html");
        std::fs::read_to_string(path).ok().map(|v| v.trim().to_string())
    }

    /// Snapshot the system config files into the slot's archive.
    pub async fn snapshot_etc(&self, slot: u32) -> GatewayResult<()> {
        let files: Vec<&str> = [
            "/etc/mcapp/config.json",
            "/etc/systemd/system/mcapp.service",
            "/etc/systemd/system/mcapp-ble.service",
            "/etc/lighttpd/conf-available/99-mcapp.conf",
            "/etc/lighttpd/lighttpd.conf",
        ]
        .into_iter()
        .filter(|path| Path::new(path).exists())
        .collect();

        if files.is_empty() {
            return Ok(());
        }
        std::fs::create_dir_all(self.meta_dir())?;

        let archive = self.etc_archive(slot);
        let status = tokio::process::Command::new("tar")
            .arg("czf")
            .arg(&archive)
            .args(&files)
            .output()
            .await?;
        if !status.status.success() {
            return Err(GatewayError::Validation(format!(
                "etc snapshot failed: {}",
                String::from_utf8_lossy(&status.stderr)
            )));
        }
        Ok(())
    }

    /// Restore the slot's config snapshot over `/`.
    pub async fn restore_etc(&self, slot: u32) -> GatewayResult<bool> {
        let archive = self.etc_archive(slot);
        if !archive.exists() {
            return Ok(false);
        }
        let status = tokio::process::Command::new("tar")
            .arg("xzf")
            .arg(&archive)
            .arg("-C")
            .arg("/")
            .output()
            .await?;
        if !status.status.success() {
            return Err(GatewayError::Validation(format!(
                "etc restore failed: {}",
                String::from_utf8_lossy(&status.stderr)
            )));
        }
        Ok(true)
    }

    /// Metadata for all slots with statuses resolved against the symlink.
    pub fn all_slots(&self) -> Vec<SlotMeta> {
        let active = self.active_slot();
        (0..SLOT_COUNT)
            .map(|slot| {
                let mut meta = self.read_meta(slot);
                meta.slot = slot;
                meta.status = if Some(slot) == active {
                    "active".to_string()
                } else if meta.version.is_some() {
                    "available".to_string()
                } else {
                    "empty".to_string()
                };
                meta
            })
            .collect()
    }

    /// The `/api/update/slots` payload.
    pub fn overview(&self) -> Value {
        let active = self.active_slot();
        let rollback = self.rollback_slot();
        json!({
            "slots": self.all_slots(),
            "active_slot": active,
            "can_rollback": rollback.is_some(),
            "rollback_target": rollback,
        })
    }
}

/// Overview for the default layout.
pub fn slot_overview() -> Value {
    SlotLayout::default_layout().overview()
}

/// Installed version: deployed web root first, then the active slot.
pub fn installed_version() -> String {
    for path in [
        PathBuf::from("/var/www/html/webapp/version.html"),
        SlotLayout::default_layout()
            .root()
            .join("current/webapp/version.html"),
    ] {
        if let Ok(text) = std::fs::read_to_string(&path) {
            return text.trim().to_string();
        }
    }
    "not_installed".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn layout() -> (SlotLayout, TempDir) {
        let dir = TempDir::new().unwrap();
        let layout = SlotLayout::new(dir.path());
        layout.ensure_dirs().unwrap();
        (layout, dir)
    }

    fn deploy(layout: &SlotLayout, slot: u32, version: &str, at: &str) {
        layout
            .write_meta(&SlotMeta {
                slot,
                version: Some(version.to_string()),
                status: "available".to_string(),
                deployed_at: Some(at.to_string()),
            })
            .unwrap();
    }

    #[test]
    fn test_should_report_empty_meta_for_fresh_layout() {
        let (layout, _dir) = layout();
        let meta = layout.read_meta(0);
        assert_eq!(meta.status, "empty");
        assert!(meta.version.is_none());
        assert!(layout.active_slot().is_none());
    }

    #[test]
    fn test_should_swap_current_symlink_atomically() {
        let (layout, _dir) = layout();
        layout.swap_symlink(1).unwrap();
        assert_eq!(layout.active_slot(), Some(1));
        layout.swap_symlink(2).unwrap();
        assert_eq!(layout.active_slot(), Some(2));
    }

    #[test]
    fn test_should_prefer_empty_slot_for_deployment() {
        let (layout, _dir) = layout();
        deploy(&layout, 0, "v1.0", "2025-01-01T00:00:00Z");
        assert_eq!(layout.oldest_slot(), 1, "first empty slot wins");
    }

    #[test]
    fn test_should_pick_oldest_non_active_when_all_slots_used() {
        let (layout, _dir) = layout();
        deploy(&layout, 0, "v1.0", "2025-01-01T00:00:00Z");
        deploy(&layout, 1, "v1.1", "2025-02-01T00:00:00Z");
        deploy(&layout, 2, "v1.2", "2025-03-01T00:00:00Z");
        layout.swap_symlink(2).unwrap();

        assert_eq!(layout.oldest_slot(), 0);
        assert_eq!(layout.rollback_slot(), Some(1), "most recent non-active");
    }

    #[test]
    fn test_should_resolve_statuses_in_overview() {
        let (layout, _dir) = layout();
        deploy(&layout, 0, "v1.0", "2025-01-01T00:00:00Z");
        layout.swap_symlink(0).unwrap();

        let overview = layout.overview();
        assert_eq!(overview["active_slot"], 0);
        assert_eq!(overview["slots"][0]["status"], "active");
        assert_eq!(overview["slots"][1]["status"], "empty");
        assert_eq!(overview["can_rollback"], false);
    }
}
