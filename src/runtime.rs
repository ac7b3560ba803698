//! The daemon's cooperative event loop. One task multiplexes the two UDP
//! discovery sockets, the one second tick, the results of in-flight TCP
//! exchanges and the HTTP façade's mailbox. All controller state lives on
//! this task; the façade talks to it through [`ControllerHandle`].

use crate::config::{self, ConfigFile};
use crate::controller::{Action, Controller, ExchangeOutcome};
use crate::discovery;
use crate::error::{Result, TuyaError};
use crate::exchange;
use log::{debug, info, warn};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const MAILBOX_DEPTH: usize = 32;

/// A request posted from outside the loop (the HTTP façade).
pub enum Request {
    Status {
        reply: oneshot::Sender<Value>,
    },
    Set {
        point: String,
        state: bool,
        pulse: u32,
        cause: Option<String>,
        reply: oneshot::Sender<bool>,
    },
    GetConfig {
        reply: oneshot::Sender<ConfigFile>,
    },
    PutConfig {
        blob: String,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Cheap clonable handle into the event loop's mailbox.
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<Request>,
}

impl ControllerHandle {
    /// Create a handle and the receiving end for [`run`].
    pub fn new() -> (Self, mpsc::Receiver<Request>) {
        let (tx, rx) = mpsc::channel(MAILBOX_DEPTH);
        (Self { tx }, rx)
    }

    async fn ask<T>(
        &self,
        request: Request,
        reply: oneshot::Receiver<T>,
    ) -> Result<T> {
        self.tx
            .send(request)
            .await
            .map_err(|_| TuyaError::Io("controller loop is gone".into()))?;
        reply
            .await
            .map_err(|_| TuyaError::Io("controller loop dropped the request".into()))
    }

    pub async fn status(&self) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        self.ask(Request::Status { reply: tx }, rx).await
    }

    /// Returns whether any point matched.
    pub async fn set(
        &self,
        point: &str,
        state: bool,
        pulse: u32,
        cause: Option<String>,
    ) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.ask(
            Request::Set {
                point: point.to_string(),
                state,
                pulse,
                cause,
                reply: tx,
            },
            rx,
        )
        .await
    }

    pub async fn config(&self) -> Result<ConfigFile> {
        let (tx, rx) = oneshot::channel();
        self.ask(Request::GetConfig { reply: tx }, rx).await
    }

    pub async fn update_config(&self, blob: String) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.ask(Request::PutConfig { blob, reply: tx }, rx).await?
    }
}

/// The live `/tuya/status` document.
pub fn status_doc(controller: &Controller, now: i64) -> Value {
    let mut points = serde_json::Map::new();
    for entry in controller.devices().iter() {
        let state = if entry.detected == 0 {
            "silent"
        } else if entry.status {
            "on"
        } else {
            "off"
        };
        let mut point = serde_json::Map::new();
        point.insert("state".into(), state.into());
        point.insert(
            "command".into(),
            if entry.commanded { "on" } else { "off" }.into(),
        );
        if entry.deadline > 0 {
            point.insert("pulse".into(), entry.deadline.into());
        }
        point.insert("gear".into(), "light".into());
        points.insert(entry.name.clone(), Value::Object(point));
    }
    json!({
        "host": hostname(),
        "timestamp": now,
        "control": { "status": Value::Object(points) },
    })
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

struct Runtime {
    controller: Controller,
    config_path: PathBuf,
    exchanges: HashMap<usize, (u64, CancellationToken)>,
    results_tx: mpsc::Sender<ExchangeOutcome>,
}

impl Runtime {
    /// Execute the I/O the state machine asked for.
    fn perform(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Close { device } => {
                    if let Some((_, token)) = self.exchanges.remove(&device) {
                        token.cancel();
                    }
                }
                Action::Open(spec) => {
                    if let Some((_, token)) = self.exchanges.remove(&spec.device) {
                        token.cancel();
                    }
                    let token = CancellationToken::new();
                    self.exchanges
                        .insert(spec.device, (spec.generation, token.clone()));
                    tokio::spawn(exchange::run(spec, token, self.results_tx.clone()));
                }
            }
        }
    }

    fn handle_datagram(&mut self, port: u16, datagram: &[u8], source: SocketAddr, now: i64) {
        let IpAddr::V4(source) = source.ip() else {
            return;
        };
        match discovery::decode_beacon(port, datagram) {
            Ok(beacon) => self.controller.beacon(&beacon, source, now),
            Err(e) => debug!("dropping datagram from {source} on port {port}: {e}"),
        }
    }

    fn handle_outcome(&mut self, outcome: ExchangeOutcome, now: i64) {
        if let Some((generation, _)) = self.exchanges.get(&outcome.device) {
            if *generation == outcome.generation {
                self.exchanges.remove(&outcome.device);
            }
        }
        self.controller.outcome(&outcome, now);
    }

    fn handle_request(&mut self, request: Request, now: i64) {
        match request {
            Request::Status { reply } => {
                let _ = reply.send(status_doc(&self.controller, now));
            }
            Request::Set {
                point,
                state,
                pulse,
                cause,
                reply,
            } => {
                let mut actions = Vec::new();
                let mut found = false;
                for index in 0..self.controller.device_count() {
                    let matches = point == "all"
                        || self.controller.device_name(index) == Some(point.as_str());
                    if matches {
                        found = true;
                        self.controller
                            .set(index, state, pulse, cause.as_deref(), now, &mut actions);
                    }
                }
                self.perform(actions);
                let _ = reply.send(found);
            }
            Request::GetConfig { reply } => {
                let _ = reply.send(self.controller.live_config());
            }
            Request::PutConfig { blob, reply } => {
                let result = config::parse(&blob).map(|parsed| {
                    let actions = self.controller.apply_config(&parsed.tuya);
                    self.perform(actions);
                    self.save();
                });
                let _ = reply.send(result);
            }
        }
    }

    /// Persist the live tables whenever discovery or a reload touched them.
    fn save_if_changed(&mut self) {
        if self.controller.take_changed() {
            self.save();
        }
    }

    fn save(&mut self) {
        let snapshot = self.controller.live_config();
        if let Err(e) = config::save(&self.config_path, &snapshot) {
            warn!("cannot save configuration: {e}");
        }
    }
}

async fn recv_beacon(
    socket: Option<&UdpSocket>,
    buf: &mut [u8],
) -> std::io::Result<(usize, SocketAddr)> {
    match socket {
        Some(socket) => socket.recv_from(buf).await,
        None => std::future::pending().await,
    }
}

/// Run the event loop until the request mailbox closes. Startup fails
/// only when neither discovery port can be bound.
pub async fn run(config_path: PathBuf, mut requests: mpsc::Receiver<Request>) -> Result<()> {
    let plain = match discovery::bind(discovery::PLAIN_PORT) {
        Ok(socket) => Some(socket),
        Err(e) => {
            warn!("cannot bind discovery port {}: {e}", discovery::PLAIN_PORT);
            None
        }
    };
    let encrypted = match discovery::bind(discovery::ENCRYPTED_PORT) {
        Ok(socket) => Some(socket),
        Err(e) => {
            warn!(
                "cannot bind discovery port {}: {e}",
                discovery::ENCRYPTED_PORT
            );
            None
        }
    };
    if plain.is_none() && encrypted.is_none() {
        return Err(TuyaError::Io("no discovery port could be bound".into()));
    }

    let mut controller = Controller::new();
    let loaded = config::load(&config_path)?;
    controller.apply_config(&loaded.tuya);
    // The load itself is not a change worth writing back.
    let _ = controller.take_changed();

    let (results_tx, mut results_rx) = mpsc::channel(MAILBOX_DEPTH);
    let mut runtime = Runtime {
        controller,
        config_path,
        exchanges: HashMap::new(),
        results_tx,
    };

    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut plain_buf = vec![0u8; 2048];
    let mut encrypted_buf = vec![0u8; 2048];

    info!("controller loop started");
    loop {
        tokio::select! {
            received = recv_beacon(plain.as_ref(), &mut plain_buf) => {
                if let Ok((len, source)) = received {
                    let now = exchange::unix_now();
                    let datagram = plain_buf[..len].to_vec();
                    runtime.handle_datagram(discovery::PLAIN_PORT, &datagram, source, now);
                }
            }
            received = recv_beacon(encrypted.as_ref(), &mut encrypted_buf) => {
                if let Ok((len, source)) = received {
                    let now = exchange::unix_now();
                    let datagram = encrypted_buf[..len].to_vec();
                    runtime.handle_datagram(discovery::ENCRYPTED_PORT, &datagram, source, now);
                }
            }
            _ = tick.tick() => {
                let now = exchange::unix_now();
                let actions = runtime.controller.tick(now);
                runtime.perform(actions);
                runtime.save_if_changed();
            }
            outcome = results_rx.recv() => {
                if let Some(outcome) = outcome {
                    runtime.handle_outcome(outcome, exchange::unix_now());
                }
            }
            request = requests.recv() => {
                match request {
                    Some(request) => runtime.handle_request(request, exchange::unix_now()),
                    None => {
                        info!("controller loop stopping");
                        return Ok(());
                    }
                }
            }
        }
    }
}
