//! Resource records, ownership index, and platform handle assembly.
//!
//! Resource records persist like function assets (one JSON document each,
//! atomic rewrite). Runtime handles are process-lifetime only: a KV store is
//! an in-memory map created lazily the first time a record binds, and KV data
//! does not survive a restart.
//!
//! The ownership index (function id → owned resource ids) is an in-memory
//! acceleration structure; it is rebuilt by a directory scan when empty,
//! which covers process restart.

use crate::assets::mint_id;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info};

// =============================================================================
// Records
// =============================================================================

/// Kind of a bindable resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    /// In-process key/value store.
    Kv,
    /// SQL database binding (placeholder; operations are rejected).
    Sql,
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Kv => write!(f, "kv"),
            Self::Sql => write!(f, "sql"),
        }
    }
}

/// A persisted resource record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    /// UUIDv7 identifier, always server-minted.
    pub id: String,
    /// Resource kind.
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    /// Function ids permitted to bind this resource. Grows, never shrinks.
    #[serde(default)]
    pub owners: BTreeSet<String>,
    /// Free-form configuration.
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

/// Creation request, as received over HTTP.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateResource {
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    #[serde(default)]
    pub owners: BTreeSet<String>,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

// =============================================================================
// Runtime Handles
// =============================================================================

/// In-process KV store backing one `kv` resource.
#[derive(Debug, Default)]
pub struct KvStore {
    entries: RwLock<HashMap<String, Value>>,
}

impl KvStore {
    /// Stores a value, returning the previous one if any.
    pub fn put(&self, key: &str, value: Value) -> Option<Value> {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value)
    }

    /// Fetches a value.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    /// Removes a value, returning it if present.
    pub fn delete(&self, key: &str) -> Option<Value> {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key)
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// True when the store holds nothing.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// KV surface of a platform handle. Operations target the default store: the
/// owned store with the lowest resource id.
#[derive(Clone)]
pub struct KvApi {
    /// (resource id, handle), sorted by resource id.
    stores: Vec<(String, Arc<KvStore>)>,
}

impl KvApi {
    /// Resource ids of all bound KV stores.
    pub fn store_ids(&self) -> Vec<&str> {
        self.stores.iter().map(|(id, _)| id.as_str()).collect()
    }

    fn default_store(&self) -> &Arc<KvStore> {
        // Non-empty by construction; a platform without KV has no KvApi.
        &self.stores[0].1
    }

    /// Stores a value in the default store.
    pub fn put(&self, key: &str, value: Value) -> Option<Value> {
        self.default_store().put(key, value)
    }

    /// Fetches a value from the default store.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.default_store().get(key)
    }

    /// Deletes a value from the default store.
    pub fn delete(&self, key: &str) -> Option<Value> {
        self.default_store().delete(key)
    }
}

/// SQL surface of a platform handle. Placeholder: every call is rejected.
#[derive(Debug, Clone, Default)]
pub struct SqlApi;

impl SqlApi {
    /// Always fails; SQL bindings are not implemented.
    pub fn query(&self, _statement: &str) -> Result<Value> {
        Err(Error::NotSupported("sql bindings".to_string()))
    }
}

/// Per-function bundle of runtime resource bindings.
#[derive(Clone, Default)]
pub struct Platform {
    /// KV surface, present when the function owns at least one `kv` resource.
    pub kv: Option<KvApi>,
    /// SQL surface, present when the function owns at least one `sql` resource.
    pub sql: Option<SqlApi>,
}

impl Platform {
    /// True when no resource is bound at all.
    pub fn is_empty(&self) -> bool {
        self.kv.is_none() && self.sql.is_none()
    }
}

// =============================================================================
// Store
// =============================================================================

/// Directory-backed store of resource records plus runtime state.
pub struct ResourceStore {
    dir: PathBuf,
    /// function id → owned resource ids.
    index: RwLock<HashMap<String, HashSet<String>>>,
    /// resource id → lazily created KV handle.
    handles: RwLock<HashMap<String, Arc<KvStore>>>,
    /// Serializes record rewrites (attach_owner read-modify-write).
    rewrite: Mutex<()>,
}

impl ResourceStore {
    /// Opens (and creates) the store directory.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            index: RwLock::new(HashMap::new()),
            handles: RwLock::new(HashMap::new()),
            rewrite: Mutex::new(()),
        })
    }

    /// Creates a record: mints an id, persists, indexes, and (for `kv`)
    /// provisions the in-memory store.
    pub fn create(&self, req: CreateResource) -> Result<ResourceRecord> {
        let record = ResourceRecord {
            id: mint_id(),
            resource_type: req.resource_type,
            owners: req.owners,
            config: req.config,
        };
        self.persist(&record)?;

        {
            let mut index = self.index.write().unwrap_or_else(|e| e.into_inner());
            for owner in &record.owners {
                index
                    .entry(owner.clone())
                    .or_default()
                    .insert(record.id.clone());
            }
        }
        if record.resource_type == ResourceType::Kv {
            self.kv_handle(&record.id);
        }

        info!(id = %record.id, kind = %record.resource_type, "created resource");
        Ok(record)
    }

    /// Extends a record's owner set with `fn_id` and rewrites it. Owners are
    /// never removed through this API.
    pub fn attach_owner(&self, resource_id: &str, fn_id: &str) -> Result<ResourceRecord> {
        let _guard = self.rewrite.lock().unwrap_or_else(|e| e.into_inner());

        let mut record = self
            .load(resource_id)?
            .ok_or_else(|| Error::RecordNotFound(resource_id.to_string()))?;
        record.owners.insert(fn_id.to_string());
        self.persist(&record)?;

        self.index
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(fn_id.to_string())
            .or_default()
            .insert(record.id.clone());

        debug!(resource = %record.id, function = %fn_id, "attached owner");
        Ok(record)
    }

    /// Loads a record, or `None` when absent.
    pub fn load(&self, id: &str) -> Result<Option<ResourceRecord>> {
        if !id_is_safe(id) {
            return Ok(None);
        }
        let path = self.dir.join(format!("{id}.json"));
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record =
            serde_json::from_str(&text).map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(Some(record))
    }

    /// Lists all records, ordered by id.
    pub fn list(&self) -> Result<Vec<ResourceRecord>> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Ok(text) = fs::read_to_string(&path)
                && let Ok(record) = serde_json::from_str::<ResourceRecord>(&text)
            {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    /// Assembles the platform handle for a function from every record it
    /// owns. When the index is cold (fresh process), it is rebuilt by
    /// scanning the store directory first.
    pub fn platform_for_function(&self, fn_id: &str) -> Result<Platform> {
        if self
            .index
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
        {
            self.rebuild_index()?;
        }

        let owned: Vec<String> = {
            let index = self.index.read().unwrap_or_else(|e| e.into_inner());
            let mut ids: Vec<String> = index
                .get(fn_id)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default();
            ids.sort();
            ids
        };

        let mut kv_stores = Vec::new();
        let mut has_sql = false;
        for id in owned {
            let Some(record) = self.load(&id)? else {
                continue;
            };
            match record.resource_type {
                ResourceType::Kv => kv_stores.push((record.id.clone(), self.kv_handle(&record.id))),
                ResourceType::Sql => has_sql = true,
            }
        }

        Ok(Platform {
            kv: if kv_stores.is_empty() {
                None
            } else {
                Some(KvApi { stores: kv_stores })
            },
            sql: if has_sql { Some(SqlApi) } else { None },
        })
    }

    /// Rebuilds the ownership index from the persisted records.
    fn rebuild_index(&self) -> Result<()> {
        let records = self.list()?;
        let mut index = self.index.write().unwrap_or_else(|e| e.into_inner());
        if !index.is_empty() {
            return Ok(());
        }
        for record in &records {
            for owner in &record.owners {
                index
                    .entry(owner.clone())
                    .or_default()
                    .insert(record.id.clone());
            }
        }
        debug!(records = records.len(), "rebuilt ownership index");
        Ok(())
    }

    /// Returns the process-lifetime KV handle for a resource, creating it on
    /// first use.
    fn kv_handle(&self, resource_id: &str) -> Arc<KvStore> {
        self.handles
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(resource_id.to_string())
            .or_default()
            .clone()
    }

    fn persist(&self, record: &ResourceRecord) -> Result<()> {
        let json =
            serde_json::to_vec_pretty(record).map_err(|e| Error::Serialization(e.to_string()))?;
        let path = self.dir.join(format!("{}.json", record.id));

        let temp_name = format!("tmp.{}", uuid::Uuid::now_v7());
        let temp_path = path.with_extension(temp_name);
        fs::write(&temp_path, &json).map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
        fs::rename(&temp_path, &path).map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            Error::StorageWriteFailed(e.to_string())
        })?;
        Ok(())
    }
}

/// Ids become file names; restrict them to the UUID alphabet.
fn id_is_safe(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
