//! WebTransport front door
//!
//! Accepts connections, reads JSON commands from the control stream and
//! routes them to the broker. Holds no state of its own.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::time::interval;
use tracing::{error, info, warn};
use wtransport::endpoint::IncomingSession;
use wtransport::stream::{RecvStream, SendStream};
use wtransport::{Endpoint, Identity, ServerConfig};

use crate::broker::RelayBroker;
use crate::commands::{cmd, Heartbeat, Request, Response};
use crate::config::Config;
use crate::error::{codes, RelayError};
use crate::mailer::{MailTransport, SmtpRelay};
use crate::metrics::InMemoryCounters;

pub async fn run_server(config: Config) -> Result<()> {
    config.validate().map_err(RelayError::Config)?;

    let start_time = SystemTime::now();
    let transport = Arc::new(SmtpRelay::new(config.relay_timeout()));
    let broker = Arc::new(RelayBroker::from_config(
        &config,
        transport,
        Arc::new(InMemoryCounters::new()),
    ));

    // TLS identity and WebTransport endpoint
    let identity = Identity::load_pemfiles(&config.cert_path, &config.key_path)
        .await
        .map_err(|e| RelayError::Tls(e.to_string()))?;
    let server_config = ServerConfig::builder()
        .with_bind_default(config.port)
        .with_identity(&identity)
        .max_idle_timeout(Some(Duration::from_secs(60)))?
        .keep_alive_interval(Some(Duration::from_secs(10)))
        .build();

    let endpoint = Endpoint::server(server_config)?;
    info!(
        domain = %config.domain,
        ttl_hours = config.session_ttl_hours,
        "RelayPass server running on https://{}",
        config.bind_addr()
    );

    loop {
        let incoming: IncomingSession = endpoint.accept().await;
        let broker = Arc::clone(&broker);
        let hb_interval = config.heartbeat_interval;

        tokio::spawn(async move {
            if let Err(e) = handle_connection(incoming, broker, hb_interval, start_time).await {
                error!("Connection error: {:?}", e);
            }
        });
    }
}

fn make_pong_response(start_time: SystemTime) -> String {
    let now = SystemTime::now();
    let uptime = now
        .duration_since(start_time)
        .unwrap_or(Duration::from_secs(0))
        .as_secs();

    let now_utc: DateTime<Utc> = now.into();

    Response::ok(cmd::PONG)
        .with_msg("PONG")
        .with_data(json!({ "server_time": now_utc.to_rfc3339(), "uptime": uptime }))
        .to_json()
}

async fn handle_connection<T: MailTransport>(
    incoming: IncomingSession,
    broker: Arc<RelayBroker<T>>,
    hb_interval: u64,
    start_time: SystemTime,
) -> Result<()> {
    let session_request = incoming.await?;
    let remote = session_request.remote_address();
    let connection = session_request.accept().await?;
    info!(%remote, "connection accepted");

    let (send, recv) = connection.accept_bi().await?;
    if let Err(e) = handle_control_stream(send, recv, broker, hb_interval, start_time).await {
        warn!("Control stream ended: {:?}", e);
    }

    info!(%remote, "connection closed");
    Ok(())
}

async fn handle_control_stream<T: MailTransport>(
    mut send: SendStream,
    mut recv: RecvStream,
    broker: Arc<RelayBroker<T>>,
    hb_interval: u64,
    start_time: SystemTime,
) -> Result<()> {
    let mut heartbeat = interval(Duration::from_secs(hb_interval.max(1)));
    let mut framer = CommandFramer::default();
    let mut buf = [0u8; 8192];

    'control: loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if let Err(e) = send.write_all(line(Heartbeat::new().to_json()).as_bytes()).await {
                    warn!("Failed to send heartbeat: {:?}", e);
                    break;
                }
            }

            result = recv.read(&mut buf) => {
                let n = match result {
                    Ok(Some(n)) if n > 0 => n,
                    Ok(_) => break,
                    Err(e) => {
                        warn!("Read error: {:?}", e);
                        break;
                    }
                };

                for frame in framer.push(&buf[..n]) {
                    let response = match frame {
                        Frame::Command(text) => process_command(&text, &broker, start_time).await,
                        Frame::Oversized => {
                            warn!(limit = MAX_COMMAND_BYTES, "Command exceeds size limit");
                            Response::err("PARSE", "Command too large", codes::INVALID_FORMAT)
                                .to_json()
                        }
                    };
                    if send.write_all(line(response).as_bytes()).await.is_err() {
                        break 'control;
                    }
                }
            }
        }
    }

    Ok(())
}

/// Largest command accepted on the control stream, newline excluded
pub const MAX_COMMAND_BYTES: usize = 1024 * 1024;

fn line(mut json: String) -> String {
    json.push('\n');
    json
}

/// One unit produced by [`CommandFramer`]
#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    Command(String),
    Oversized,
}

/// Splits the control stream into newline-terminated commands.
///
/// A command may arrive across several reads and one read may carry several
/// commands. Blank lines and non-UTF-8 lines are dropped.
#[derive(Debug, Default)]
pub struct CommandFramer {
    pending: Vec<u8>,
    discarding: bool,
}

impl CommandFramer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let (head, tail) = rest.split_at(pos);
            rest = &tail[1..];

            if self.discarding {
                // Tail of an oversized command; already reported.
                self.discarding = false;
                continue;
            }
            if self.pending.len() + head.len() > MAX_COMMAND_BYTES {
                self.pending.clear();
                frames.push(Frame::Oversized);
                continue;
            }

            self.pending.extend_from_slice(head);
            let raw = std::mem::take(&mut self.pending);
            match String::from_utf8(raw) {
                Ok(text) if text.trim().is_empty() => {}
                Ok(text) => frames.push(Frame::Command(text.trim().to_string())),
                Err(_) => warn!("Non-UTF8 command dropped"),
            }
        }

        if !self.discarding {
            if self.pending.len() + rest.len() > MAX_COMMAND_BYTES {
                self.pending.clear();
                self.discarding = true;
                frames.push(Frame::Oversized);
            } else {
                self.pending.extend_from_slice(rest);
            }
        }

        frames
    }
}

/// Route one JSON command to the broker and render the reply
pub async fn process_command<T: MailTransport>(
    text: &str,
    broker: &RelayBroker<T>,
    start_time: SystemTime,
) -> String {
    let req = match Request::from_json(text) {
        Ok(r) => r,
        Err(e) => {
            return Response::err("PARSE", &format!("Invalid JSON: {e}"), codes::MALFORMED_JSON)
                .to_json();
        }
    };

    let command = req.cmd.to_uppercase();

    match command.as_str() {
        cmd::AUTH => {
            let result = match req.issue_request() {
                Ok(issue) => broker.issue_session(issue).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(issued) => Response::ok("AUTH_OK")
                    .with_msg(&issued.message)
                    .with_data(json!(issued))
                    .to_json(),
                Err(e) => Response::from_error(cmd::AUTH, &e).to_json(),
            }
        }
        cmd::SEND => {
            let bearer = match req.bearer() {
                Ok(Some(bearer)) => bearer,
                Ok(None) => {
                    return Response::err(cmd::SEND, "Authorization required", codes::AUTH_REQUIRED)
                        .to_json();
                }
                Err(e) => return Response::from_error(cmd::SEND, &e).to_json(),
            };
            let result = match req.dispatch_request() {
                Ok(send) => broker.dispatch(Some(&bearer), &send).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(outcome) => Response::ok("SEND_OK")
                    .with_msg(&outcome.message)
                    .with_data(json!(outcome))
                    .to_json(),
                Err(e) => Response::from_error(cmd::SEND, &e).to_json(),
            }
        }
        cmd::STATS => Response::ok(cmd::STATS)
            .with_data(json!(broker.stats()))
            .to_json(),
        cmd::PING => make_pong_response(start_time),
        _ => Response::err("UNKNOWN", &format!("Unknown command: {command}"), codes::UNKNOWN_COMMAND)
            .to_json(),
    }
}

// ============================================================================
// TESTS
// ============================================================================
