//! Domain store over one JSON document in a data directory.
//!
//! `domain.json` holds `{"orders": [...], "inventory": [...], "applied":
//! {"<action_id>": "<message>"}}`. An action's record changes and its applied
//! marker land in the same write, and every write replaces the file through a
//! temp file and rename, so a failed apply leaves no trace and a retried one
//! is either a replay or a first application.
//!
//! A directory that only has the older `orders.json` and `inventory.json`
//! pair is imported into `domain.json` on open.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::handlers::apply_tool;
use super::{ApplyReceipt, DomainStore};
use crate::domain::{ActionError, DomainSnapshot, InventoryItem, Order, RepairAction};

/// The single document a data directory holds.
pub const DATA_FILE: &str = "domain.json";

const LEGACY_ORDERS_FILE: &str = "orders.json";
const LEGACY_INVENTORY_FILE: &str = "inventory.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct DataFile {
    orders: Vec<Order>,
    inventory: Vec<InventoryItem>,
    #[serde(default)]
    applied: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct LegacyOrders {
    orders: Vec<Order>,
}

#[derive(Debug, Deserialize)]
struct LegacyInventory {
    inventory: Vec<InventoryItem>,
}

/// File-backed domain store.
#[derive(Debug)]
pub struct JsonFileDomainStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileDomainStore {
    /// Open an existing data directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, ActionError> {
        let dir = dir.into();
        if !dir.join(DATA_FILE).exists() {
            import_legacy(&dir)?;
        }
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    /// Create (or overwrite) a data directory from `snapshot`.
    pub fn create(dir: impl Into<PathBuf>, snapshot: &DomainSnapshot) -> Result<Self, ActionError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        write_json(
            &dir.join(DATA_FILE),
            &DataFile {
                orders: snapshot.orders.clone(),
                inventory: snapshot.inventory.clone(),
                applied: BTreeMap::new(),
            },
        )?;
        info!(dir = %dir.display(), orders = snapshot.orders.len(), "seeded domain data");
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    /// Whether `dir` already holds domain data.
    pub fn is_seeded(dir: &Path) -> bool {
        dir.join(DATA_FILE).exists() || dir.join(LEGACY_ORDERS_FILE).exists()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn read(&self) -> Result<DataFile, ActionError> {
        read_json(&self.dir.join(DATA_FILE)).await
    }
}

fn import_legacy(dir: &Path) -> Result<(), ActionError> {
    let orders_path = dir.join(LEGACY_ORDERS_FILE);
    let inventory_path = dir.join(LEGACY_INVENTORY_FILE);
    if !orders_path.exists() || !inventory_path.exists() {
        return Err(ActionError::Store(format!(
            "{} not found in {}",
            DATA_FILE,
            dir.display()
        )));
    }
    let orders: LegacyOrders = read_json_sync(&orders_path)?;
    let inventory: LegacyInventory = read_json_sync(&inventory_path)?;
    write_json(
        &dir.join(DATA_FILE),
        &DataFile {
            orders: orders.orders,
            inventory: inventory.inventory,
            applied: BTreeMap::new(),
        },
    )?;
    info!(dir = %dir.display(), "imported orders.json and inventory.json");
    Ok(())
}

fn parse_json<T: DeserializeOwned>(path: &Path, bytes: &[u8]) -> Result<T, ActionError> {
    serde_json::from_slice(bytes).map_err(|e| ActionError::Store(format!("{}: {}", path.display(), e)))
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ActionError> {
    let bytes = tokio::fs::read(path).await?;
    parse_json(path, &bytes)
}

fn read_json_sync<T: DeserializeOwned>(path: &Path) -> Result<T, ActionError> {
    let bytes = std::fs::read(path)?;
    parse_json(path, &bytes)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ActionError> {
    let dir = path
        .parent()
        .ok_or_else(|| ActionError::Store(format!("{} has no parent", path.display())))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, value)?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| ActionError::Unavailable(e.to_string()))?;
    Ok(())
}

#[async_trait]
impl DomainStore for JsonFileDomainStore {
    async fn load_orders(&self) -> Result<Vec<Order>, ActionError> {
        Ok(self.read().await?.orders)
    }

    async fn load_inventory(&self) -> Result<Vec<InventoryItem>, ActionError> {
        Ok(self.read().await?.inventory)
    }

    async fn apply(&self, action: &RepairAction) -> Result<ApplyReceipt, ActionError> {
        let _guard = self.write_lock.lock().await;
        let action_id = action.action_id.as_str().to_string();

        let mut data = self.read().await?;
        if let Some(message) = data.applied.get(&action_id) {
            debug!(action_id = %action_id, "action already applied");
            return Ok(ApplyReceipt {
                action_id,
                message: message.clone(),
                replayed: true,
            });
        }

        let message = apply_tool(&mut data.orders, &mut data.inventory, &action.tool)?;
        data.applied.insert(action_id.clone(), message.clone());
        write_json(&self.dir.join(DATA_FILE), &data)?;

        Ok(ApplyReceipt {
            action_id,
            message,
            replayed: false,
        })
    }
}
