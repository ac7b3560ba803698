//! Per-device control: sensing, commanded state changes, pulse timers,
//! retries and silence detection.
//!
//! The controller is a synchronous state machine over the device table.
//! It never touches a socket itself: transport work is requested through
//! [`Action`]s and completed exchanges come back as [`ExchangeOutcome`]s,
//! so the event loop owns all I/O and tests can drive the wall clock and
//! the device responses directly.

use crate::config::{ConfigFile, DeviceConfig, TuyaConfig};
use crate::device::DeviceTable;
use crate::events::{EventKind, EventLog};
use crate::messages::{Beacon, DeviceSecret};
use crate::model::ModelTable;
use crate::protocol::Version;
use log::{debug, warn};
use std::net::Ipv4Addr;
use std::str::FromStr;

/// TCP port devices listen on for query and control.
pub const TUYA_TCP_PORT: u16 = 6668;

/// Poll each reachable device this often.
const SENSE_INTERVAL: i64 = 35;
/// A device is failed after this long without a beacon or response,
/// roughly three missed senses.
const SILENCE_LIMIT: i64 = 100;
/// The periodic pass runs at most this often.
const PASS_INTERVAL: i64 = 5;
/// Confirmation window armed by a user command.
const COMMAND_WINDOW: i64 = 10;
/// Confirmation window armed by a pulse expiry.
const PULSE_OFF_WINDOW: i64 = 5;

fn onoff(state: bool) -> &'static str {
    if state {
        "on"
    } else {
        "off"
    }
}

/// What kind of exchange to run over the device's TCP port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// QUERY the current data points.
    Sense,
    /// CONTROL the on/off data point to the given state.
    Control(bool),
}

/// Everything the transport needs to run one TCP exchange.
#[derive(Debug, Clone)]
pub struct ExchangeSpec {
    pub device: usize,
    pub generation: u64,
    pub addr: Ipv4Addr,
    pub port: u16,
    pub secret: DeviceSecret,
    pub control: u32,
    pub kind: ExchangeKind,
}

/// I/O requested by the state machine, executed by the event loop.
#[derive(Debug, Clone)]
pub enum Action {
    /// Open a TCP exchange. Any previous exchange for the same device has
    /// already been closed by an accompanying [`Action::Close`].
    Open(ExchangeSpec),
    /// Tear down the device's in-flight exchange, if any.
    Close { device: usize },
}

/// Terminal report of one TCP exchange. Matched against the device's
/// current generation so responses from a superseded socket are ignored
/// even if the device's address changed mid-exchange.
#[derive(Debug, Clone)]
pub struct ExchangeOutcome {
    pub device: usize,
    pub generation: u64,
    /// Observed value of the control data point, when a STATUS or QUERY
    /// response carried one.
    pub observed: Option<bool>,
}

/// The device controller: one instance owns the device table, the model
/// table and the event journal.
pub struct Controller {
    devices: DeviceTable,
    models: ModelTable,
    events: EventLog,
    next_generation: u64,
    last_pass: i64,
}

impl Default for Controller {
    fn default() -> Self {
        Self::new()
    }
}

impl Controller {
    pub fn new() -> Self {
        Self {
            devices: DeviceTable::new(),
            models: ModelTable::new(),
            events: EventLog::new(),
            next_generation: 0,
            last_pass: -PASS_INTERVAL,
        }
    }

    // ---------------------------------------------------------------
    // Read accessors (the HTTP façade contract)
    // ---------------------------------------------------------------

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn device_name(&self, index: usize) -> Option<&str> {
        self.devices.get(index).map(|d| d.name.as_str())
    }

    /// Last observed on/off state.
    pub fn get(&self, index: usize) -> bool {
        self.devices.get(index).is_some_and(|d| d.status)
    }

    /// Last user-requested on/off state.
    pub fn commanded(&self, index: usize) -> bool {
        self.devices.get(index).is_some_and(|d| d.commanded)
    }

    /// Pulse deadline, zero when steady.
    pub fn deadline(&self, index: usize) -> i64 {
        self.devices.get(index).map_or(0, |d| d.deadline)
    }

    /// A failure description, or `None` while the device is healthy.
    pub fn failure(&self, index: usize) -> Option<&'static str> {
        match self.devices.get(index) {
            Some(d) if d.detected == 0 => Some("silent"),
            _ => None,
        }
    }

    pub fn devices(&self) -> &DeviceTable {
        &self.devices
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// True when either table changed since the last call; the caller is
    /// expected to persist the live config.
    pub fn take_changed(&mut self) -> bool {
        let devices = self.devices.take_changed();
        let models = self.models.take_changed();
        devices || models
    }

    // ---------------------------------------------------------------
    // Commands
    // ---------------------------------------------------------------

    /// Record a desired state for a device. With `pulse > 0` the on state
    /// auto-reverts to off after that many seconds. Returns `false` when
    /// the device index is unknown, `true` once the request is recorded
    /// (whether or not a command could be sent right away).
    pub fn set(
        &mut self,
        index: usize,
        state: bool,
        pulse: u32,
        cause: Option<&str>,
        now: i64,
        actions: &mut Vec<Action>,
    ) -> bool {
        let start_control = {
            let Some(entry) = self.devices.get_mut(index) else {
                return false;
            };
            let comment = cause.map(|c| format!(" ({c})")).unwrap_or_default();
            if state && pulse > 0 {
                entry.deadline = now + i64::from(pulse);
                self.events.push(
                    now,
                    &entry.name,
                    EventKind::Set,
                    format!("{} for {} seconds{}", onoff(state), pulse, comment),
                );
            } else {
                entry.deadline = 0;
                self.events.push(
                    now,
                    &entry.name,
                    EventKind::Set,
                    format!("{}{}", onoff(state), comment),
                );
            }
            entry.commanded = state;
            if entry.pending != 0 {
                // A command is already in flight, only the bookkeeping moved.
                return true;
            }
            entry.pending = now + COMMAND_WINDOW;
            entry.detected != 0
        };
        if start_control {
            self.start_exchange(index, ExchangeKind::Control(state), now, actions);
        }
        true
    }

    // ---------------------------------------------------------------
    // Discovery input
    // ---------------------------------------------------------------

    /// Merge one beacon into the table. Unknown devices are inserted as
    /// placeholders named `new_N` and flag the table dirty.
    pub fn beacon(&mut self, beacon: &Beacon, source: Ipv4Addr, now: i64) {
        let index = match self.devices.search_id(&beacon.gw_id) {
            Some(i) => i,
            None => {
                let name = format!("new_{}", self.devices.len());
                self.devices.add(&name, &beacon.gw_id, &beacon.product_key)
            }
        };

        let mut dirty = false;
        {
            let entry = self.devices.get_mut(index).expect("index just resolved");

            // Model, version, address and the encryption flag come from the
            // device itself and overwrite whatever was stored.
            DeviceTable::refresh_string(&mut dirty, &mut entry.model, &beacon.product_key);
            if let Some(v) = beacon.version.as_deref() {
                match Version::from_str(v) {
                    Ok(version) => {
                        if entry.version != version {
                            entry.version = version;
                            dirty = true;
                        }
                    }
                    Err(_) => warn!("device {}: beacon with version '{}'", entry.name, v),
                }
            }
            if let Some(encrypt) = beacon.encrypt {
                entry.encrypted = encrypt;
            }
            if entry.ip != Some(source) {
                entry.ip = Some(source);
                entry.host = Some(source.to_string());
                dirty = true;
            }

            if entry.detected == 0 {
                self.events.push(
                    now,
                    &entry.name,
                    EventKind::Detected,
                    format!("address {source}"),
                );
                entry.last_sense = 0; // force an immediate query
            }
            entry.detected = now;
        };

        if dirty {
            self.devices.mark_changed();
        }
    }

    // ---------------------------------------------------------------
    // Exchange results
    // ---------------------------------------------------------------

    /// Fold the terminal report of a TCP exchange back into the table.
    pub fn outcome(&mut self, outcome: &ExchangeOutcome, now: i64) {
        let current = {
            let Some(entry) = self.devices.get_mut(outcome.device) else {
                return;
            };
            if entry.exchange != Some(outcome.generation) {
                debug!(
                    "device {}: stale exchange result (generation {})",
                    entry.name, outcome.generation
                );
                return;
            }
            entry.exchange = None;
            true
        };
        if current {
            if let Some(observed) = outcome.observed {
                self.status_update(outcome.device, observed, now);
            }
        }
    }

    /// Apply one observed value of the control data point.
    fn status_update(&mut self, index: usize, observed: bool, now: i64) {
        let Some(entry) = self.devices.get_mut(index) else {
            return;
        };
        if entry.pending != 0 && observed == entry.commanded {
            self.events.push(
                now,
                &entry.name,
                EventKind::Confirmed,
                format!("from {} to {}", onoff(entry.status), onoff(observed)),
            );
            entry.pending = 0;
            entry.status = observed;
        } else if observed != entry.status {
            // The device was commanded by someone else: adopt its state.
            self.events.push(
                now,
                &entry.name,
                EventKind::Changed,
                format!("from {} to {}", onoff(entry.status), onoff(observed)),
            );
            entry.commanded = observed;
            entry.pending = 0;
            entry.status = observed;
        }
        entry.detected = now;
    }

    // ---------------------------------------------------------------
    // Periodic pass
    // ---------------------------------------------------------------

    /// Called once per second by the event loop; the body runs at most
    /// every five seconds. One pass applies, in order: silence detection,
    /// sense scheduling, pulse expiry, retry/timeout.
    pub fn tick(&mut self, now: i64) -> Vec<Action> {
        let mut actions = Vec::new();
        if now < self.last_pass + PASS_INTERVAL {
            return actions;
        }
        self.last_pass = now;

        for index in 0..self.devices.len() {
            self.silence_pass(index, now, &mut actions);
            self.sense_pass(index, now, &mut actions);
            self.pulse_pass(index, now);
            self.retry_pass(index, now, &mut actions);
        }
        actions
    }

    fn silence_pass(&mut self, index: usize, now: i64, actions: &mut Vec<Action>) {
        let entry = self.devices.get_mut(index).expect("index in range");
        if entry.detected > 0 && now - entry.detected > SILENCE_LIMIT {
            self.events.push(
                now,
                &entry.name,
                EventKind::Silent,
                format!(
                    "address {}",
                    entry.host.as_deref().unwrap_or("unknown")
                ),
            );
            if entry.exchange.take().is_some() {
                actions.push(Action::Close { device: index });
            }
            entry.reset(false);
            entry.detected = 0;
        }
    }

    fn sense_pass(&mut self, index: usize, now: i64, actions: &mut Vec<Action>) {
        let due = {
            let entry = self.devices.get_mut(index).expect("index in range");
            if now < entry.last_sense + SENSE_INTERVAL {
                return;
            }
            entry.last_sense = now;
            let due = entry.pending == 0 && entry.ip.is_some();
            if due && entry.exchange.take().is_some() {
                // A leftover socket from the previous cycle never answered.
                actions.push(Action::Close { device: index });
            }
            due
        };
        if due {
            self.start_exchange(index, ExchangeKind::Sense, now, actions);
        }
    }

    fn pulse_pass(&mut self, index: usize, now: i64) {
        let entry = self.devices.get_mut(index).expect("index in range");
        if entry.deadline > 0 && now >= entry.deadline {
            self.events
                .push(now, &entry.name, EventKind::Reset, "end of pulse");
            entry.commanded = false;
            entry.pending = now + PULSE_OFF_WINDOW;
            entry.deadline = 0;
        }
    }

    fn retry_pass(&mut self, index: usize, now: i64, actions: &mut Vec<Action>) {
        let resend = {
            let entry = self.devices.get_mut(index).expect("index in range");
            if entry.status == entry.commanded {
                return;
            }
            if entry.pending > now {
                if entry.detected == 0 {
                    return;
                }
                self.events
                    .push(now, &entry.name, EventKind::Retry, onoff(entry.commanded));
                Some(entry.commanded)
            } else if entry.pending != 0 {
                // The confirmation window elapsed: give up on this intent.
                self.events.push(now, &entry.name, EventKind::Timeout, "");
                if entry.exchange.take().is_some() {
                    actions.push(Action::Close { device: index });
                }
                let status = entry.status;
                entry.reset(status);
                None
            } else {
                None
            }
        };
        if let Some(state) = resend {
            self.start_exchange(index, ExchangeKind::Control(state), now, actions);
        }
    }

    /// Open a fresh exchange if the device is addressable and controllable.
    /// Skipped silently when the control data point is unresolved or the
    /// key is missing; the operator has to supply the mapping first.
    fn start_exchange(
        &mut self,
        index: usize,
        kind: ExchangeKind,
        _now: i64,
        actions: &mut Vec<Action>,
    ) {
        let control = {
            let Some(entry) = self.devices.get(index) else {
                return;
            };
            if entry.control > 0 {
                entry.control
            } else {
                self.models.control(&entry.model)
            }
        };
        if control == 0 {
            return;
        }

        self.next_generation += 1;
        let generation = self.next_generation;

        let entry = self.devices.get_mut(index).expect("index in range");
        entry.control = control;
        let Some(addr) = entry.ip else {
            return;
        };
        let secret = entry.secret();
        if secret.key.is_none() {
            debug!("device {}: no local key, skipping exchange", entry.name);
            return;
        }
        if entry.exchange.take().is_some() {
            actions.push(Action::Close { device: index });
        }
        entry.exchange = Some(generation);

        actions.push(Action::Open(ExchangeSpec {
            device: index,
            generation,
            addr,
            port: TUYA_TCP_PORT,
            secret,
            control,
            kind,
        }));
    }

    // ---------------------------------------------------------------
    // Configuration
    // ---------------------------------------------------------------

    /// Merge a configuration blob into the live tables. The configured
    /// name, key and description are authoritative; model, version and
    /// address keep following the device's own beacons. Each refreshed
    /// device drops its transient command state.
    pub fn apply_config(&mut self, config: &TuyaConfig) -> Vec<Action> {
        let mut actions = Vec::new();

        for model in &config.models {
            self.models.refresh(model);
        }

        for device in &config.devices {
            let index = match self.devices.search_id(&device.id) {
                Some(i) => i,
                None => self.devices.add(
                    &device.name,
                    &device.id,
                    device.model.as_deref().unwrap_or(""),
                ),
            };
            let mut dirty = false;
            {
                let entry = self.devices.get_mut(index).expect("index just resolved");
                DeviceTable::refresh_string(&mut dirty, &mut entry.name, &device.name);
                if entry.model.is_empty() {
                    if let Some(model) = device.model.as_deref() {
                        DeviceTable::refresh_string(&mut dirty, &mut entry.model, model);
                    }
                }
                if entry.key != device.key {
                    entry.key = device.key.clone();
                    dirty = true;
                }
                if entry.description != device.description {
                    entry.description = device.description.clone();
                    dirty = true;
                }
                // The model mapping may have moved; resolve again lazily.
                entry.control = 0;
                let status = entry.status;
                entry.reset(status);
                if entry.exchange.take().is_some() {
                    actions.push(Action::Close { device: index });
                }
            }
            if dirty {
                self.devices.mark_changed();
            }
        }
        actions
    }

    /// Snapshot of the live tables in the persisted config shape.
    pub fn live_config(&self) -> ConfigFile {
        let devices = self
            .devices
            .iter()
            .map(|entry| DeviceConfig {
                name: entry.name.clone(),
                id: entry.id.clone(),
                model: (!entry.model.is_empty()).then(|| entry.model.clone()),
                key: entry.key.clone(),
                host: entry.host.clone(),
                description: entry.description.clone(),
            })
            .collect();
        ConfigFile {
            tuya: TuyaConfig {
                devices,
                models: self.models.live_config(),
            },
        }
    }
}
