//! Persisted device directory and schema blob cache.
//!
//! One JSON document `devices.json` keyed by serial string, plus one
//! `schema-<word0>.json` blob per device. All writes go through a
//! write-then-rename so a power cut mid-save leaves the old document intact.
//! Only the gateway task touches the files; readers get value snapshots.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{GatewayError, NodeId};

/// Heartbeat-driven `lastSeen` updates hit the filesystem at most this often
/// per device; the in-memory record is always current.
const PERSIST_DAMP_MS: u64 = 10_000;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub node_id: NodeId,
    pub name: String,
    pub last_seen: u64,
}

/// Directory entry as shipped in `deviceList` events.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceEntry {
    pub serial: String,
    #[serde(flatten)]
    pub record: DeviceRecord,
}

pub struct DeviceStore {
    dir: PathBuf,
    devices: BTreeMap<String, DeviceRecord>,
    /// Bumped on every write; cache layers key their snapshots off this.
    generation: u64,
    last_persist_ms: HashMap<String, u64>,
    dirty_schemas: HashSet<u32>,
}

impl DeviceStore {
    /// Open (or create) a store rooted at `dir`. A missing or unreadable
    /// document starts the directory empty rather than failing bring-up.
    pub fn open(dir: &Path) -> Result<Self, GatewayError> {
        fs::create_dir_all(dir)?;
        let path = dir.join("devices.json");
        let devices = match fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                log::warn!("devices.json unreadable ({e}), starting empty");
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        };
        Ok(DeviceStore {
            dir: dir.to_owned(),
            devices,
            generation: 0,
            last_persist_ms: HashMap::new(),
            dirty_schemas: HashSet::new(),
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn save(&mut self) -> Result<(), GatewayError> {
        let path = self.dir.join("devices.json");
        let tmp = self.dir.join("devices.json.tmp");
        let text = serde_json::to_string_pretty(&self.devices)
            .map_err(|e| GatewayError::Parse(e.to_string()))?;
        fs::write(&tmp, text)?;
        fs::rename(&tmp, &path)?;
        self.generation += 1;
        Ok(())
    }

    /// Record a device sighting. Idempotent under identical inputs apart
    /// from the timestamp.
    pub fn add_or_update(
        &mut self,
        serial: &str,
        node: NodeId,
        now_ms: u64,
    ) -> Result<(), GatewayError> {
        let entry = self
            .devices
            .entry(serial.to_owned())
            .or_insert_with(|| DeviceRecord {
                node_id: node,
                name: String::new(),
                last_seen: now_ms,
            });
        entry.node_id = node;
        entry.last_seen = now_ms;
        self.last_persist_ms.insert(serial.to_owned(), now_ms);
        self.save()
    }

    /// Heartbeat update by node id. Memory is always updated; the document
    /// write is damped.
    pub fn touch_node(&mut self, node: NodeId, now_ms: u64) {
        let Some((serial, record)) = self
            .devices
            .iter_mut()
            .find(|(_, r)| r.node_id == node)
            .map(|(s, r)| (s.clone(), r))
        else {
            return;
        };
        record.last_seen = now_ms;
        let last = self.last_persist_ms.get(&serial).copied().unwrap_or(0);
        if now_ms.saturating_sub(last) >= PERSIST_DAMP_MS {
            self.last_persist_ms.insert(serial, now_ms);
            if let Err(e) = self.save() {
                log::error!("failed to persist heartbeat: {e}");
            }
        }
    }

    pub fn rename(&mut self, serial: &str, name: &str) -> Result<bool, GatewayError> {
        match self.devices.get_mut(serial) {
            Some(record) => {
                record.name = name.to_owned();
                self.save()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn delete(&mut self, serial: &str) -> Result<bool, GatewayError> {
        if self.devices.remove(serial).is_none() {
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }

    pub fn find_by_node(&self, node: NodeId) -> Option<DeviceEntry> {
        self.devices
            .iter()
            .find(|(_, r)| r.node_id == node)
            .map(|(serial, record)| DeviceEntry {
                serial: serial.clone(),
                record: record.clone(),
            })
    }

    pub fn get(&self, serial: &str) -> Option<&DeviceRecord> {
        self.devices.get(serial)
    }

    pub fn list(&self) -> Vec<DeviceEntry> {
        self.devices
            .iter()
            .map(|(serial, record)| DeviceEntry {
                serial: serial.clone(),
                record: record.clone(),
            })
            .collect()
    }

    // -- schema blobs, named by the lowest serial word --

    fn schema_path(&self, word0: u32) -> PathBuf {
        self.dir.join(format!("schema-{word0:08x}.json"))
    }

    pub fn save_schema(&mut self, word0: u32, blob: &str) -> Result<(), GatewayError> {
        let path = self.schema_path(word0);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, blob)?;
        fs::rename(&tmp, &path)?;
        self.dirty_schemas.remove(&word0);
        Ok(())
    }

    /// Cached blob, unless it has been marked stale since the last save.
    pub fn load_schema(&self, word0: u32) -> Option<String> {
        if self.dirty_schemas.contains(&word0) {
            return None;
        }
        fs::read_to_string(self.schema_path(word0)).ok()
    }

    /// Deferred reload: remember that the cached blob is stale without
    /// touching the file.
    pub fn mark_schema_dirty(&mut self, word0: u32) {
        self.dirty_schemas.insert(word0);
    }

    pub fn is_schema_dirty(&self, word0: u32) -> bool {
        self.dirty_schemas.contains(&word0)
    }
}
