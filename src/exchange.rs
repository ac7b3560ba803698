//! One short-lived TCP exchange with a device: connect, send a single
//! QUERY or CONTROL frame, then read frames until one reports the control
//! data point.
//!
//! The CONTROL echo (same command code) is discarded: devices answer it
//! with stale values. Confirmation comes from a subsequent STATUS on the
//! same socket or from the next scheduled QUERY. The exchange has no read
//! timeout of its own; the controller cancels it when the next sense
//! cycle or the pending window takes over.

use crate::controller::{ExchangeKind, ExchangeOutcome, ExchangeSpec};
use crate::error::{Result, TuyaError};
use crate::messages;
use crate::protocol::{self, CommandType, HEADER_LEN, MAX_FRAME};
use byteorder::{BigEndian, ByteOrder};
use log::debug;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// How many bytes to scan for a frame prefix before giving up on a
/// desynchronized stream.
const PREFIX_SCAN_LIMIT: usize = 1024;

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Run one exchange to completion and report the outcome. Cancellation
/// closes the socket without reporting; the controller has already moved
/// on from this generation.
pub async fn run(
    spec: ExchangeSpec,
    token: CancellationToken,
    results: mpsc::Sender<ExchangeOutcome>,
) {
    let observed = tokio::select! {
        _ = token.cancelled() => return,
        result = drive(&spec) => match result {
            Ok(observed) => observed,
            Err(e) => {
                debug!("device {} exchange failed: {e}", spec.secret.id);
                None
            }
        },
    };
    let _ = results
        .send(ExchangeOutcome {
            device: spec.device,
            generation: spec.generation,
            observed,
        })
        .await;
}

async fn drive(spec: &ExchangeSpec) -> Result<Option<bool>> {
    let addr = SocketAddr::from((spec.addr, spec.port));
    let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| TuyaError::Timeout)?
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::ConnectionRefused => TuyaError::ConnectionFailed,
            _ => TuyaError::Io(e.to_string()),
        })?;

    let now = unix_now();
    let frame = match spec.kind {
        ExchangeKind::Sense => messages::query_frame(&spec.secret, 0, now)?,
        ExchangeKind::Control(state) => {
            messages::control_frame(&spec.secret, 0, spec.control, state, now)?
        }
    };
    debug!(
        "sending {:?} to {} ({} bytes): {}",
        spec.kind,
        spec.secret.id,
        frame.len(),
        hex::encode(&frame)
    );
    timeout(CONNECT_TIMEOUT, stream.write_all(&frame))
        .await
        .map_err(|_| TuyaError::Timeout)??;

    read_report(&mut stream, spec).await
}

/// Read frames until one terminates the exchange. CONTROL echoes keep the
/// socket open; any other frame ends it, reporting the control data point
/// when a STATUS or QUERY response carried it.
async fn read_report(stream: &mut TcpStream, spec: &ExchangeSpec) -> Result<Option<bool>> {
    let key = spec.secret.key.as_ref();
    loop {
        let packet = match read_frame(stream).await? {
            Some(packet) => packet,
            None => return Ok(None), // peer closed
        };
        let msg = match protocol::unpack_frame(&packet, key, Some(spec.secret.version)) {
            Ok(msg) => msg,
            Err(e) => {
                // Drop the frame, keep the connection for the next one.
                debug!("device {}: undecodable frame: {e}", spec.secret.id);
                continue;
            }
        };
        match CommandType::from_u32(msg.cmd) {
            Some(CommandType::Control) => {
                // The command echo lies about the state; wait for a report.
                debug!("device {}: control echo discarded", spec.secret.id);
            }
            Some(CommandType::Status) | Some(CommandType::Query) => {
                if msg.payload.len() <= 4 {
                    continue;
                }
                return Ok(match messages::extract_dps_bool(&msg.payload, spec.control) {
                    Ok(value) => Some(value),
                    Err(e) => {
                        debug!(
                            "device {}: no usable dps.{} in report: {e}",
                            spec.secret.id, spec.control
                        );
                        None
                    }
                });
            }
            _ => return Ok(None),
        }
    }
}

/// Read one full frame, scanning for the prefix to resynchronize after
/// noise. `Ok(None)` means the peer closed the connection cleanly.
pub async fn read_frame(stream: &mut TcpStream) -> Result<Option<Vec<u8>>> {
    let mut word = [0u8; 4];
    match stream.read_exact(&mut word).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let mut scanned = 0;
    while BigEndian::read_u32(&word) != protocol::PREFIX {
        if scanned >= PREFIX_SCAN_LIMIT {
            return Ok(None);
        }
        word.rotate_left(1);
        match stream.read_u8().await {
            Ok(byte) => word[3] = byte,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        scanned += 1;
    }

    let mut header = [0u8; HEADER_LEN];
    header[..4].copy_from_slice(&word);
    match stream.read_exact(&mut header[4..]).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let length = BigEndian::read_u32(&header[12..16]) as usize;
    if length > MAX_FRAME {
        return Err(TuyaError::InvalidPayload);
    }
    let mut packet = vec![0u8; HEADER_LEN + length];
    packet[..HEADER_LEN].copy_from_slice(&header);
    match stream.read_exact(&mut packet[HEADER_LEN..]).await {
        Ok(_) => Ok(Some(packet)),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e.into()),
    }
}
