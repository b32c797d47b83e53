//! Guest-agent channel: line-delimited JSON request/response over the
//! hypervisor's vsock, plus the daemon's periodic network query loop.
//!
//! Every request is one line `{"execute": "<verb>", "arguments": {..}?}`;
//! every response one line `{"return": ..}` or
//! `{"error": {"class": .., "desc": ..}}`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_vsock::{VsockAddr, VsockStream};

use crate::config::{NetworkInfo, NetworkInterface};
use crate::engine::VsockEndpoint;
use crate::store;

/// Guest-side CID the agent listens on.
pub const GUEST_AGENT_CID: u32 = 3;
/// Agent port inside the guest.
pub const GUEST_AGENT_PORT: u32 = 9001;

/// Timeout for `guest-ping`.
pub const PING_TIMEOUT: Duration = Duration::from_secs(2);
/// Timeout for `guest-network-get-interfaces`.
pub const INTERFACES_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum GuestAgentError {
    #[error("guest agent is not connected")]
    NotConnected,

    #[error("guest agent request timed out")]
    Timeout,

    #[error("unexpected guest agent response: {0}")]
    InvalidResponse(String),

    #[error("guest agent error: {0}")]
    AgentError(String),

    #[error("failed to encode guest agent request: {0}")]
    EncodingError(String),

    #[error("failed to decode guest agent response: {0}")]
    DecodingError(String),
}

#[derive(Debug, Deserialize)]
struct AgentResponse {
    #[serde(rename = "return", default)]
    ret: Option<Value>,
    #[serde(default)]
    error: Option<AgentResponseError>,
}

#[derive(Debug, Deserialize)]
struct AgentResponseError {
    #[serde(default)]
    class: String,
    #[serde(default)]
    desc: String,
}

pub struct GuestAgentClient {
    endpoint: VsockEndpoint,
    stream: Option<VsockStream>,
    /// Bytes received past the last newline, kept for the next response.
    pending: Vec<u8>,
}

impl GuestAgentClient {
    pub fn new(endpoint: VsockEndpoint) -> Self {
        Self {
            endpoint,
            stream: None,
            pending: Vec::new(),
        }
    }

    /// Establish the vsock connection. Idempotent.
    pub async fn connect(&mut self) -> Result<(), GuestAgentError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let addr = VsockAddr::new(self.endpoint.cid, self.endpoint.port);
        let stream = VsockStream::connect(addr)
            .await
            .map_err(|_| GuestAgentError::NotConnected)?;
        self.stream = Some(stream);
        self.pending.clear();
        Ok(())
    }

    pub fn disconnect(&mut self) {
        self.stream = None;
        self.pending.clear();
    }

    /// One request/response exchange, raced against `timeout`. The losing
    /// side is cancelled; on timeout the connection is reset so the next
    /// call starts clean.
    async fn send_command(
        &mut self,
        verb: &str,
        arguments: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, GuestAgentError> {
        if self.stream.is_none() {
            return Err(GuestAgentError::NotConnected);
        }

        let mut request = json!({ "execute": verb });
        if let Some(args) = arguments {
            request["arguments"] = args;
        }
        let mut line = serde_json::to_string(&request)
            .map_err(|e| GuestAgentError::EncodingError(e.to_string()))?;
        line.push('\n');

        let exchange = async {
            let stream = self.stream.as_mut().expect("checked above");
            stream
                .write_all(line.as_bytes())
                .await
                .map_err(|_| GuestAgentError::NotConnected)?;

            // Accumulate until the first newline.
            loop {
                if let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = self.pending.drain(..=pos).collect();
                    return Ok(line);
                }
                let mut buf = [0u8; 4096];
                let n = stream
                    .read(&mut buf)
                    .await
                    .map_err(|_| GuestAgentError::NotConnected)?;
                if n == 0 {
                    return Err(GuestAgentError::NotConnected);
                }
                self.pending.extend_from_slice(&buf[..n]);
            }
        };

        let raced = tokio::time::timeout(timeout, exchange).await;
        let line = match raced {
            Ok(result) => result?,
            Err(_) => {
                self.disconnect();
                return Err(GuestAgentError::Timeout);
            }
        };

        decode_response(&line)
    }

    /// `guest-ping`: true iff the agent answered without an error.
    pub async fn ping(&mut self) -> bool {
        self.send_command("guest-ping", None, PING_TIMEOUT)
            .await
            .is_ok()
    }

    /// `guest-network-get-interfaces`.
    pub async fn get_network_interfaces(
        &mut self,
    ) -> Result<Vec<NetworkInterface>, GuestAgentError> {
        let value = self
            .send_command("guest-network-get-interfaces", None, INTERFACES_TIMEOUT)
            .await?;
        serde_json::from_value(value).map_err(|e| GuestAgentError::DecodingError(e.to_string()))
    }
}

/// Parse one response line into its `return` payload.
fn decode_response(line: &[u8]) -> Result<Value, GuestAgentError> {
    let response: AgentResponse = serde_json::from_slice(line)
        .map_err(|e| GuestAgentError::DecodingError(e.to_string()))?;

    if let Some(error) = response.error {
        if !error.desc.is_empty() {
            return Err(GuestAgentError::AgentError(error.desc));
        }
        if !error.class.is_empty() {
            return Err(GuestAgentError::AgentError(error.class));
        }
    }
    Ok(response.ret.unwrap_or(Value::Null))
}

// ── Periodic network query ───────────────────────────────

/// Delays (from daemon start) of the initial query attempts.
const INITIAL_ATTEMPT_DELAYS: [u64; 4] = [5, 10, 15, 20];
/// Steady-state poll interval.
const POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Query the agent for network state and persist it for `vm ip` / `vm ssh`.
///
/// Runs until `exit` is set. All failures are logged at debug and retried;
/// the guest may simply not be up yet.
pub async fn run_periodic_query(endpoint: VsockEndpoint, vm_name: String, exit: Arc<AtomicBool>) {
    let mut client = GuestAgentClient::new(endpoint);

    // Initial burst: the guest usually gets an address within seconds of
    // boot; bail out to the slow poll after the first success.
    for delay in INITIAL_ATTEMPT_DELAYS {
        tracing::debug!(delay, "scheduling initial guest network query");
        if sleep_unless_exit(Duration::from_secs(5), &exit).await {
            return;
        }
        if query_once(&mut client, &vm_name).await {
            break;
        }
    }

    loop {
        if sleep_unless_exit(POLL_INTERVAL, &exit).await {
            return;
        }
        query_once(&mut client, &vm_name).await;
    }
}

/// Sleep in short slices so the exit flag stays responsive; true = exit.
async fn sleep_unless_exit(total: Duration, exit: &AtomicBool) -> bool {
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if exit.load(Ordering::Relaxed) {
            return true;
        }
        let step = remaining.min(Duration::from_millis(500));
        tokio::time::sleep(step).await;
        remaining -= step;
    }
    exit.load(Ordering::Relaxed)
}

/// One ping + interfaces attempt; persists on success.
async fn query_once(client: &mut GuestAgentClient, vm_name: &str) -> bool {
    if let Err(err) = client.connect().await {
        tracing::debug!(%err, "guest agent not reachable yet");
        return false;
    }
    if !client.ping().await {
        tracing::debug!("guest agent ping failed");
        return false;
    }
    match client.get_network_interfaces().await {
        Ok(interfaces) => {
            let info = NetworkInfo {
                interfaces,
                queried_at: chrono::Utc::now(),
            };
            if let Err(err) = store::save_network_info(vm_name, &info) {
                tracing::debug!(%err, "failed to persist network info");
                return false;
            }
            tracing::debug!(
                primary = info.primary_ipv4().unwrap_or("none"),
                "guest network info updated"
            );
            true
        }
        Err(err) => {
            tracing::debug!(%err, "guest network query failed");
            false
        }
    }
}
