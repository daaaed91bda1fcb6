use crate::wol::{self, MacAddress};
use lazy_static::lazy_static;
use log::{debug, info};
use prometheus::{register_int_counter_vec, IntCounterVec};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

lazy_static! {
    static ref REGISTRY_OPS: IntCounterVec = register_int_counter_vec!(
        "wolhub_registry_operations_total",
        "Successful device registry mutations by operation.",
        &["op"]
    )
    .unwrap();
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: i64,
    pub name: String,
    // Kept as submitted; validated before it is stored.
    pub mac: String,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("device {0} not found")]
    NotFound(i64),
    #[error("MAC address {0} is already registered")]
    DuplicateMac(MacAddress),
    #[error(transparent)]
    InvalidMac(#[from] wol::Error),
    #[error("failed to persist devices: {0}")]
    Io(#[from] io::Error),
    #[error("malformed device file: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Serialize, Deserialize)]
struct Store {
    // Id the next added device gets. Ids are never reused.
    #[serde(default)]
    next_id: i64,
    devices: Vec<Device>,
}

impl Default for Store {
    fn default() -> Self {
        Store {
            next_id: 1,
            devices: vec![],
        }
    }
}

impl Store {
    fn check_unique(&self, mac: MacAddress, except: Option<i64>) -> Result<(), Error> {
        let taken = self.devices.iter().any(|d| {
            Some(d.id) != except && wol::validate_and_parse(&d.mac).ok() == Some(mac)
        });
        if taken {
            Err(Error::DuplicateMac(mac))
        } else {
            Ok(())
        }
    }
}

/// The set of wakeable devices, optionally backed by a JSON file that is
/// rewritten after every change. Mutations do that file I/O synchronously
/// with the lock held; call them from a blocking thread in async code.
pub struct Registry {
    path: Option<PathBuf>,
    store: Mutex<Store>,
}

fn write_store(path: &Path, store: &Store) -> Result<(), Error> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(store)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

impl Registry {
    pub fn open(path: Option<PathBuf>) -> Result<Self, Error> {
        let mut store = Store::default();
        if let Some(p) = &path {
            match fs::read(p) {
                Ok(data) => {
                    store = serde_json::from_slice(&data)?;
                    let max_id = store.devices.iter().map(|d| d.id).max().unwrap_or(0);
                    store.next_id = store.next_id.max(max_id + 1);
                    info!("loaded {} devices from {}", store.devices.len(), p.display());
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    info!("no device file at {}, starting empty", p.display());
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(Registry {
            path,
            store: Mutex::new(store),
        })
    }

    fn lock(&self) -> MutexGuard<Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Persists `next` first so a failed write leaves memory untouched.
    fn commit(&self, store: &mut Store, next: Store, op: &str) -> Result<(), Error> {
        if let Some(path) = &self.path {
            write_store(path, &next)?;
        }
        *store = next;
        REGISTRY_OPS.with_label_values(&[op]).inc();
        Ok(())
    }

    pub fn list(&self) -> Vec<Device> {
        let mut devices = self.lock().devices.clone();
        devices.sort_by_key(|d| d.id);
        devices
    }

    pub fn get(&self, id: i64) -> Result<Device, Error> {
        self.lock()
            .devices
            .iter()
            .find(|d| d.id == id)
            .cloned()
            .ok_or(Error::NotFound(id))
    }

    pub fn add(&self, name: &str, mac: &str) -> Result<Device, Error> {
        let parsed = wol::validate_and_parse(mac)?;
        let mut store = self.lock();
        store.check_unique(parsed, None)?;

        let mut next = store.clone();
        let device = Device {
            id: next.next_id,
            name: name.to_string(),
            mac: mac.to_string(),
        };
        next.next_id += 1;
        next.devices.push(device.clone());
        self.commit(&mut store, next, "add")?;
        debug!("added device {:?}", device);
        Ok(device)
    }

    pub fn update(&self, id: i64, name: &str, mac: &str) -> Result<Device, Error> {
        let parsed = wol::validate_and_parse(mac)?;
        let mut store = self.lock();
        let pos = store
            .devices
            .iter()
            .position(|d| d.id == id)
            .ok_or(Error::NotFound(id))?;
        store.check_unique(parsed, Some(id))?;

        let mut next = store.clone();
        let device = Device {
            id,
            name: name.to_string(),
            mac: mac.to_string(),
        };
        next.devices[pos] = device.clone();
        self.commit(&mut store, next, "update")?;
        debug!("updated device {:?}", device);
        Ok(device)
    }

    /// Removes the device if present. Deleting an unknown id is not an error.
    pub fn delete(&self, id: i64) -> Result<(), Error> {
        let mut store = self.lock();
        if !store.devices.iter().any(|d| d.id == id) {
            return Ok(());
        }
        let mut next = store.clone();
        next.devices.retain(|d| d.id != id);
        self.commit(&mut store, next, "delete")?;
        debug!("deleted device {}", id);
        Ok(())
    }
}
