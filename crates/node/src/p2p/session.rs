//! One outbound peer connection: handshake, liveness, header requests.

use std::net::SocketAddr;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use pulse_consensus::BlockHash;
use pulse_primitives::BlockHeader;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, timeout, MissedTickBehavior};

use super::wire::{self, FrameError};

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
pub const HEADER_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const PING_INTERVAL: Duration = Duration::from_secs(30);
pub const PONG_TIMEOUT: Duration = Duration::from_secs(60);
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

const MISBEHAVIOR_MALFORMED_HEADERS: u32 = 20;
const MISBEHAVIOR_MALFORMED_MESSAGE: u32 = 10;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    Dialing,
    HandshakeSent,
    VersionAckReceived,
    Ready,
    Syncing,
    Idle,
    Banned,
    Closed,
}

#[derive(Debug)]
pub enum SessionEvent {
    Ready {
        addr: SocketAddr,
        best_height: i32,
        user_agent: String,
        services: u64,
    },
    Headers {
        addr: SocketAddr,
        headers: Vec<BlockHeader>,
        solicited: bool,
        elapsed: Duration,
        bytes: usize,
    },
    HeadersTimeout {
        addr: SocketAddr,
    },
    Addr {
        addr: SocketAddr,
        addrs: Vec<SocketAddr>,
    },
    GetHeaders {
        addr: SocketAddr,
        locator: Vec<BlockHash>,
        stop: BlockHash,
    },
    GetAddr {
        addr: SocketAddr,
    },
    Misbehaving {
        addr: SocketAddr,
        score: u32,
        reason: String,
    },
    Disconnected {
        addr: SocketAddr,
        reason: String,
        banned: bool,
    },
}

#[derive(Debug)]
pub enum SessionCommand {
    RequestHeaders {
        locator: Vec<BlockHash>,
        stop: BlockHash,
    },
    SendHeaders {
        headers: Vec<BlockHeader>,
    },
    SendAddr {
        addrs: Vec<SocketAddr>,
    },
}

pub struct SessionHandle {
    pub addr: SocketAddr,
    commands: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    /// True when the command was enqueued; a full queue means the session
    /// is wedged and the coordinator will rotate it out.
    pub fn request_headers(&self, locator: Vec<BlockHash>, stop: BlockHash) -> bool {
        self.commands
            .try_send(SessionCommand::RequestHeaders { locator, stop })
            .is_ok()
    }

    pub fn send_headers(&self, headers: Vec<BlockHeader>) -> bool {
        self.commands
            .try_send(SessionCommand::SendHeaders { headers })
            .is_ok()
    }

    pub fn send_addr(&self, addrs: Vec<SocketAddr>) -> bool {
        self.commands
            .try_send(SessionCommand::SendAddr { addrs })
            .is_ok()
    }
}

pub fn spawn_session(
    addr: SocketAddr,
    magic: [u8; 4],
    max_payload: usize,
    start_height: i32,
    events: mpsc::Sender<SessionEvent>,
    shutdown: watch::Receiver<bool>,
) -> SessionHandle {
    let (command_tx, command_rx) = mpsc::channel(4);
    tokio::spawn(run_session(
        addr,
        magic,
        max_payload,
        start_height,
        events,
        command_rx,
        shutdown,
    ));
    SessionHandle {
        addr,
        commands: command_tx,
    }
}

#[derive(Debug)]
pub struct RemoteInfo {
    pub version: i32,
    pub services: u64,
    pub user_agent: String,
    pub start_height: i32,
}

/// Order-independent version/verack exchange on a fresh connection.
pub async fn handshake<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    magic: [u8; 4],
    max_payload: usize,
    start_height: i32,
) -> Result<RemoteInfo, String> {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0);
    let payload = wire::build_version(start_height, rand::random(), timestamp);
    wire::write_frame(stream, magic, "version", &payload)
        .await
        .map_err(|err| err.to_string())?;

    let mut remote = None;
    let mut got_verack = false;
    while remote.is_none() || !got_verack {
        let (command, payload) = wire::read_frame(stream, magic, max_payload)
            .await
            .map_err(|err| err.to_string())?;
        match command.as_str() {
            "version" => {
                let version = wire::parse_version(&payload)?;
                wire::write_frame(stream, magic, "verack", &[])
                    .await
                    .map_err(|err| err.to_string())?;
                remote = Some(RemoteInfo {
                    version: version.version,
                    services: version.services,
                    user_agent: version.user_agent,
                    start_height: version.start_height,
                });
            }
            "verack" => {
                got_verack = true;
            }
            "ping" => {
                wire::write_frame(stream, magic, "pong", &payload)
                    .await
                    .map_err(|err| err.to_string())?;
            }
            _ => {}
        }
    }
    Ok(remote.expect("loop exits with version"))
}

async fn run_session(
    addr: SocketAddr,
    magic: [u8; 4],
    max_payload: usize,
    start_height: i32,
    events: mpsc::Sender<SessionEvent>,
    commands: mpsc::Receiver<SessionCommand>,
    shutdown: watch::Receiver<bool>,
) {
    pulse_log::log_debug!("session {addr}: {:?}", SessionState::Dialing);
    let stream = match timeout(DIAL_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            let _ = events
                .send(SessionEvent::Disconnected {
                    addr,
                    reason: err.to_string(),
                    banned: false,
                })
                .await;
            return;
        }
        Err(_) => {
            let _ = events
                .send(SessionEvent::Disconnected {
                    addr,
                    reason: "dial timed out".to_string(),
                    banned: false,
                })
                .await;
            return;
        }
    };

    let (reason, banned) = drive(
        addr, stream, magic, max_payload, start_height, &events, commands, shutdown,
    )
    .await;
    let state = if banned {
        SessionState::Banned
    } else {
        SessionState::Closed
    };
    pulse_log::log_debug!("session {addr}: {state:?} ({reason})");
    let _ = events
        .send(SessionEvent::Disconnected {
            addr,
            reason,
            banned,
        })
        .await;
}

#[allow(clippy::too_many_arguments)]
async fn drive(
    addr: SocketAddr,
    mut stream: TcpStream,
    magic: [u8; 4],
    max_payload: usize,
    start_height: i32,
    events: &mpsc::Sender<SessionEvent>,
    mut commands: mpsc::Receiver<SessionCommand>,
    mut shutdown: watch::Receiver<bool>,
) -> (String, bool) {
    pulse_log::log_debug!("session {addr}: {:?}", SessionState::HandshakeSent);
    let remote = match timeout(
        HANDSHAKE_TIMEOUT,
        handshake(&mut stream, magic, max_payload, start_height),
    )
    .await
    {
        Ok(Ok(remote)) => remote,
        Ok(Err(err)) => return (format!("handshake failed: {err}"), true),
        Err(_) => return ("handshake timed out".to_string(), false),
    };
    pulse_log::log_debug!("session {addr}: {:?}", SessionState::VersionAckReceived);

    if remote.version < pulse_consensus::constants::MIN_PEER_PROTOCOL_VERSION {
        return (
            format!("obsolete protocol version {}", remote.version),
            false,
        );
    }

    pulse_log::log_debug!("session {addr}: {:?}", SessionState::Ready);
    pulse_log::log_info!(
        "peer {addr} ready: height {} agent {:?}",
        remote.start_height,
        remote.user_agent
    );
    if events
        .send(SessionEvent::Ready {
            addr,
            best_height: remote.start_height,
            user_agent: remote.user_agent,
            services: remote.services,
        })
        .await
        .is_err()
    {
        return ("coordinator gone".to_string(), false);
    }

    let (read_half, write_half) = stream.into_split();

    // Writer task: serializes every outgoing frame behind a queue.
    let (write_tx, mut write_rx) = mpsc::channel::<(String, Vec<u8>)>(16);
    let writer = tokio::spawn(async move {
        let mut write_half = write_half;
        while let Some((command, payload)) = write_rx.recv().await {
            let write =
                wire::write_frame(&mut write_half, magic, &command, &payload);
            match timeout(WRITE_TIMEOUT, write).await {
                Ok(Ok(_)) => {}
                Ok(Err(_)) | Err(_) => break,
            }
        }
    });

    // Reader task: frame reads are not cancellation-safe, so they live off
    // the select loop and arrive through a channel.
    let (frame_tx, mut frame_rx) = mpsc::channel::<Result<(String, Vec<u8>), FrameError>>(16);
    let reader = tokio::spawn(async move {
        let mut read_half = read_half;
        loop {
            match wire::read_frame(&mut read_half, magic, max_payload).await {
                Ok(frame) => {
                    if frame_tx.send(Ok(frame)).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    let _ = frame_tx.send(Err(err)).await;
                    break;
                }
            }
        }
    });

    let mut ping_timer = interval(PING_INTERVAL);
    ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping_timer.reset();
    let mut maintenance = interval(Duration::from_secs(1));
    maintenance.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut last_activity = Instant::now();
    let mut pending_request: Option<Instant> = None;

    let outcome = loop {
        tokio::select! {
            _ = shutdown.changed() => {
                break ("shutdown".to_string(), false);
            }
            command = commands.recv() => {
                let Some(command) = command else {
                    break ("coordinator gone".to_string(), false);
                };
                match command {
                    SessionCommand::RequestHeaders { locator, stop } => {
                        if pending_request.is_some() {
                            pulse_log::log_debug!(
                                "session {addr}: header request already outstanding"
                            );
                            continue;
                        }
                        pulse_log::log_debug!("session {addr}: {:?}", SessionState::Syncing);
                        let payload = wire::build_getheaders(&locator, &stop);
                        if write_tx.send(("getheaders".to_string(), payload)).await.is_err() {
                            break ("write side closed".to_string(), false);
                        }
                        pending_request = Some(Instant::now());
                    }
                    SessionCommand::SendHeaders { headers } => {
                        let payload = wire::build_headers(&headers);
                        if write_tx.send(("headers".to_string(), payload)).await.is_err() {
                            break ("write side closed".to_string(), false);
                        }
                    }
                    SessionCommand::SendAddr { addrs } => {
                        let now = SystemTime::now()
                            .duration_since(UNIX_EPOCH)
                            .map(|elapsed| elapsed.as_secs() as u32)
                            .unwrap_or(0);
                        let payload = wire::build_addr(&addrs, now);
                        if write_tx.send(("addr".to_string(), payload)).await.is_err() {
                            break ("write side closed".to_string(), false);
                        }
                    }
                }
            }
            _ = ping_timer.tick() => {
                if last_activity.elapsed() > PONG_TIMEOUT {
                    break ("ping timeout".to_string(), false);
                }
                let payload = wire::build_ping(rand::random());
                if write_tx.send(("ping".to_string(), payload)).await.is_err() {
                    break ("write side closed".to_string(), false);
                }
            }
            _ = maintenance.tick() => {
                if let Some(started) = pending_request {
                    if started.elapsed() > HEADER_REQUEST_TIMEOUT {
                        pending_request = None;
                        let _ = events.send(SessionEvent::HeadersTimeout { addr }).await;
                    }
                }
            }
            frame = frame_rx.recv() => {
                let Some(frame) = frame else {
                    break ("read side closed".to_string(), false);
                };
                let (command, payload) = match frame {
                    Ok(frame) => frame,
                    Err(FrameError::Io(reason)) => break (reason, false),
                    Err(FrameError::Protocol(reason)) => break (reason, true),
                };
                last_activity = Instant::now();
                match handle_message(
                    addr,
                    &command,
                    payload,
                    &mut pending_request,
                    events,
                    &write_tx,
                )
                .await
                {
                    MessageOutcome::Continue => {}
                    MessageOutcome::Close(reason, banned) => break (reason, banned),
                }
            }
        }
    };

    reader.abort();
    writer.abort();
    outcome
}

enum MessageOutcome {
    Continue,
    Close(String, bool),
}

async fn handle_message(
    addr: SocketAddr,
    command: &str,
    payload: Vec<u8>,
    pending_request: &mut Option<Instant>,
    events: &mpsc::Sender<SessionEvent>,
    write_tx: &mpsc::Sender<(String, Vec<u8>)>,
) -> MessageOutcome {
    match command {
        "headers" => match wire::parse_headers(&payload) {
            Ok(headers) => {
                let (solicited, elapsed) = match pending_request.take() {
                    Some(started) => (true, started.elapsed()),
                    None => (false, Duration::ZERO),
                };
                if !solicited {
                    pulse_log::log_debug!("session {addr}: {:?}", SessionState::Idle);
                }
                let bytes = payload.len();
                let _ = events
                    .send(SessionEvent::Headers {
                        addr,
                        headers,
                        solicited,
                        elapsed,
                        bytes,
                    })
                    .await;
                MessageOutcome::Continue
            }
            Err(reason) => {
                // 0x01 = REJECT_MALFORMED.
                let _ = write_tx
                    .send((
                        "reject".to_string(),
                        wire::build_reject("headers", 0x01, "malformed"),
                    ))
                    .await;
                let _ = events
                    .send(SessionEvent::Misbehaving {
                        addr,
                        score: MISBEHAVIOR_MALFORMED_HEADERS,
                        reason: format!("malformed headers: {reason}"),
                    })
                    .await;
                MessageOutcome::Continue
            }
        },
        "ping" => {
            // Echo the nonce back whole.
            if wire::parse_ping(&payload).is_ok() {
                let _ = write_tx.send(("pong".to_string(), payload)).await;
            }
            MessageOutcome::Continue
        }
        "pong" => MessageOutcome::Continue,
        "getheaders" => match wire::parse_getheaders(&payload) {
            Ok(request) => {
                let _ = events
                    .send(SessionEvent::GetHeaders {
                        addr,
                        locator: request.locator,
                        stop: request.stop,
                    })
                    .await;
                MessageOutcome::Continue
            }
            Err(reason) => {
                let _ = events
                    .send(SessionEvent::Misbehaving {
                        addr,
                        score: MISBEHAVIOR_MALFORMED_MESSAGE,
                        reason: format!("malformed getheaders: {reason}"),
                    })
                    .await;
                MessageOutcome::Continue
            }
        },
        "addr" => match wire::parse_addr(&payload) {
            Ok(addrs) => {
                if !addrs.is_empty() {
                    let _ = events.send(SessionEvent::Addr { addr, addrs }).await;
                }
                MessageOutcome::Continue
            }
            Err(reason) => {
                let _ = events
                    .send(SessionEvent::Misbehaving {
                        addr,
                        score: MISBEHAVIOR_MALFORMED_MESSAGE,
                        reason: format!("malformed addr: {reason}"),
                    })
                    .await;
                MessageOutcome::Continue
            }
        },
        "getaddr" => {
            let _ = events.send(SessionEvent::GetAddr { addr }).await;
            MessageOutcome::Continue
        }
        "reject" => {
            if let Ok(reject) = wire::parse_reject(&payload) {
                pulse_log::log_debug!(
                    "peer {addr} rejected {:?}: {} ({:#x})",
                    reject.message,
                    reject.reason,
                    reject.code
                );
            }
            MessageOutcome::Continue
        }
        // A header-only peer never asked for block or transaction data.
        "block" | "tx" => MessageOutcome::Close(format!("forbidden message {command:?}"), true),
        // A second version message is a protocol violation.
        "version" => MessageOutcome::Close("duplicate version message".to_string(), true),
        _ => {
            pulse_log::log_trace!("session {addr}: ignoring {command:?}");
            MessageOutcome::Continue
        }
    }
}
