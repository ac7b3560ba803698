//! Compose the JSON payloads sent to devices and interpret the ones that
//! come back (beacons and dps reports).

use crate::error::{Result, TuyaError};
use crate::protocol::{pack_frame, CommandType, Version};
use serde::Deserialize;
use serde_json::Value;

/// What it takes to talk to one device: its gateway identifier, the
/// 16-byte local AES key and the protocol version it speaks.
#[derive(Debug, Clone)]
pub struct DeviceSecret {
    pub id: String,
    pub key: Option<[u8; 16]>,
    pub version: Version,
}

impl DeviceSecret {
    pub fn new(id: &str, key: Option<[u8; 16]>, version: Version) -> Self {
        Self {
            id: id.to_string(),
            key,
            version,
        }
    }
}

/// The on/off command payload. `uid` equals `devId` on single-point units
/// and `t` is the host's wall clock, carried as a string.
pub fn control_payload(id: &str, dp: u32, value: bool, now: i64) -> Vec<u8> {
    format!(
        r#"{{"devId":"{id}","uid":"{id}","t":"{now}","dps":{{"{dp}":{value}}}}}"#
    )
    .into_bytes()
}

/// The state query payload.
pub fn query_payload(id: &str, now: i64) -> Vec<u8> {
    format!(r#"{{"devId":"{id}","uid":"{id}","t":"{now}"}}"#).into_bytes()
}

/// Build a ready-to-send CONTROL frame for one data point.
pub fn control_frame(
    secret: &DeviceSecret,
    seqno: u32,
    dp: u32,
    value: bool,
    now: i64,
) -> Result<Vec<u8>> {
    let key = secret.key.as_ref().ok_or(TuyaError::MissingKey)?;
    pack_frame(
        key,
        secret.version,
        CommandType::Control,
        seqno,
        &control_payload(&secret.id, dp, value, now),
    )
}

/// Build a ready-to-send QUERY frame.
pub fn query_frame(secret: &DeviceSecret, seqno: u32, now: i64) -> Result<Vec<u8>> {
    let key = secret.key.as_ref().ok_or(TuyaError::MissingKey)?;
    pack_frame(
        key,
        secret.version,
        CommandType::Query,
        seqno,
        &query_payload(&secret.id, now),
    )
}

/// A discovery broadcast announcing a device. The `ip` field inside the
/// payload is advisory; the authoritative address is the datagram source.
#[derive(Debug, Clone, Deserialize)]
pub struct Beacon {
    #[serde(rename = "gwId")]
    pub gw_id: String,
    #[serde(rename = "productKey")]
    pub product_key: String,
    #[serde(default)]
    pub encrypt: Option<bool>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
}

/// Parse a decoded beacon payload. Unknown fields are ignored; `gwId` and
/// `productKey` are required.
pub fn parse_beacon(payload: &[u8]) -> Result<Beacon> {
    Ok(serde_json::from_slice(payload)?)
}

/// Pull `dps.<dp>` out of a STATUS or QUERY response and require it to be
/// a boolean.
pub fn extract_dps_bool(payload: &[u8], dp: u32) -> Result<bool> {
    let value: Value = serde_json::from_slice(payload)?;
    let state = value
        .get("dps")
        .and_then(|d| d.get(dp.to_string()))
        .ok_or(TuyaError::InvalidPayload)?;
    state.as_bool().ok_or(TuyaError::InvalidPayload)
}
