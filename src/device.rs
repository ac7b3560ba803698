//! The in-memory device table: identity, reachability and command state
//! for every known device.

use crate::crypto;
use crate::messages::DeviceSecret;
use crate::protocol::Version;
use std::net::Ipv4Addr;

/// One known device. Entries are created from the configuration file or
/// from discovery beacons and are never removed, only marked silent.
#[derive(Debug, Clone)]
pub struct DeviceEntry {
    /// User-assigned point name.
    pub name: String,
    /// Gateway identifier, the device's stable identity.
    pub id: String,
    /// Local AES key as configured (string form, kept for config export).
    pub key: Option<String>,
    /// Protocol version, updated from beacons.
    pub version: Version,
    /// Product key, updated from beacons.
    pub model: String,
    pub description: Option<String>,
    /// Printable address, kept in sync with `ip`.
    pub host: Option<String>,
    /// Address of the most recent beacon.
    pub ip: Option<Ipv4Addr>,
    /// Whether the device announced itself as encrypted.
    pub encrypted: bool,
    /// Wall clock of the last beacon or successful exchange; zero while
    /// silent or never seen.
    pub detected: i64,
    /// Last observed on/off state.
    pub status: bool,
    /// Last user-requested state.
    pub commanded: bool,
    /// Deadline by which `commanded` must be confirmed; zero when idle.
    pub pending: i64,
    /// Wall clock at which to auto-revert to off; zero when steady.
    pub deadline: i64,
    /// Wall clock of the last poll.
    pub last_sense: i64,
    /// Data point driving on/off; zero until resolved from the model table.
    pub control: u32,
    /// Generation of the in-flight TCP exchange, if any.
    pub exchange: Option<u64>,
}

impl DeviceEntry {
    pub fn new(name: &str, id: &str, model: &str) -> Self {
        Self {
            name: name.to_string(),
            id: id.to_string(),
            key: None,
            version: Version::default(),
            model: model.to_string(),
            description: None,
            host: None,
            ip: None,
            encrypted: false,
            detected: 0,
            status: false,
            commanded: false,
            pending: 0,
            deadline: 0,
            last_sense: 0,
            control: 0,
            exchange: None,
        }
    }

    /// The secret needed to frame traffic for this device.
    pub fn secret(&self) -> DeviceSecret {
        DeviceSecret {
            id: self.id.clone(),
            key: self.key.as_deref().map(crypto::local_key),
            version: self.version,
        }
    }

    /// Drop any command intent, adopting `status` as both the observed
    /// and the commanded state.
    pub fn reset(&mut self, status: bool) {
        self.status = status;
        self.commanded = status;
        self.pending = 0;
        self.deadline = 0;
    }
}

/// The registry of known devices, addressed by index so that callbacks
/// survive table growth during discovery.
#[derive(Debug, Default)]
pub struct DeviceTable {
    devices: Vec<DeviceEntry>,
    changed: bool,
}

impl DeviceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&DeviceEntry> {
        self.devices.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut DeviceEntry> {
        self.devices.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceEntry> {
        self.devices.iter()
    }

    pub fn search_id(&self, id: &str) -> Option<usize> {
        self.devices.iter().position(|d| d.id == id)
    }

    pub fn search_name(&self, name: &str) -> Option<usize> {
        self.devices.iter().position(|d| d.name == name)
    }

    /// Append a new entry and flag the table dirty.
    pub fn add(&mut self, name: &str, id: &str, model: &str) -> usize {
        self.devices.push(DeviceEntry::new(name, id, model));
        self.changed = true;
        self.devices.len() - 1
    }

    /// Update a string field, flagging the table dirty when the value
    /// actually changes.
    pub fn refresh_string(changed: &mut bool, store: &mut String, value: &str) {
        if store != value {
            *store = value.to_string();
            *changed = true;
        }
    }

    pub fn mark_changed(&mut self) {
        self.changed = true;
    }

    /// Report and clear the dirty flag.
    pub fn take_changed(&mut self) -> bool {
        std::mem::take(&mut self.changed)
    }
}
