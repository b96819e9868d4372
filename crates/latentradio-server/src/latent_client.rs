//! Line-protocol RPC wrapper around the optional external latent
//! encode/decode process. Every request carries a
//! client-assigned monotonic id; the child echoes it back on one
//! newline-delimited JSON line. On timeout or process exit, all pending
//! requests fail with `backend-unavailable` and the child is respawned
//! behind a capped exponential backoff — the wire framing itself is
//! newline-delimited JSON rather than the length-prefixed binary framing
//! used for the old daemon socket, since this is a line-oriented child
//! process, not a persistent multi-client connection.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use latentradio_proto::config::LatentConfig;
use latentradio_proto::errors::{ErrorKind, Outcome};
use latentradio_proto::track::FeatureVector;

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
struct RpcRequest {
    id: u64,
    method: &'static str,
    params: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    id: u64,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

enum ActorMessage {
    Call {
        method: &'static str,
        params: serde_json::Value,
        reply: oneshot::Sender<Outcome<serde_json::Value>>,
    },
}

/// Handle shared by every caller; the actual child process and its pending
/// request table live in a single background task (`run_actor`) so writes
/// to stdin never interleave across concurrent calls.
#[derive(Clone)]
pub struct LatentClient {
    tx: mpsc::Sender<ActorMessage>,
    enabled: bool,
    availability: watch::Receiver<bool>,
}

impl LatentClient {
    pub fn spawn(config: LatentConfig) -> Self {
        let enabled = config.enabled;
        let (tx, rx) = mpsc::channel(64);
        let (avail_tx, avail_rx) = watch::channel(false);
        if enabled {
            tokio::spawn(run_actor(config, rx, avail_tx));
        }
        Self { tx, enabled, availability: avail_rx }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Cheap, lock-free liveness check: true only while a child process is
    /// currently spawned and believed healthy. Falls to false the moment the
    /// child exits or a write fails, before the respawn-with-backoff loop
    /// reconnects — this is what lets direction search drop the `latent`
    /// family immediately after the subprocess dies, without waiting on a
    /// round trip through it.
    pub fn is_available(&self) -> bool {
        self.enabled && *self.availability.borrow()
    }

    async fn call(&self, method: &'static str, params: serde_json::Value) -> Outcome<serde_json::Value> {
        if !self.enabled {
            return Err(ErrorKind::BackendUnavailable);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(ActorMessage::Call {
                method,
                params,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            return Err(ErrorKind::BackendUnavailable);
        }
        reply_rx.await.unwrap_or(Err(ErrorKind::BackendUnavailable))
    }

    pub async fn encode(&self, features: &FeatureVector) -> Outcome<Vec<f64>> {
        let params = serde_json::json!({ "features": features_to_map(features) });
        let value = self.call("encode", params).await?;
        parse_vec(value)
    }

    pub async fn decode(&self, latent: &[f64]) -> Outcome<FeatureVector> {
        let params = serde_json::json!({ "latent": latent });
        let value = self.call("decode", params).await?;
        parse_feature_vector(value)
    }

    pub async fn interpolate(&self, a: &[f64], b: &[f64], steps: usize) -> Outcome<Vec<Vec<f64>>> {
        let params = serde_json::json!({ "a": a, "b": b, "steps": steps });
        let value = self.call("interpolate", params).await?;
        let frames: Vec<Vec<f64>> = serde_json::from_value(value)
            .map_err(|e| ErrorKind::InvalidArgument(e.to_string()))?;
        Ok(frames)
    }

    pub async fn flow(&self, base: &[f64], direction: &[f64], amount: f64) -> Outcome<FeatureVector> {
        let params = serde_json::json!({ "base": base, "direction": direction, "amount": amount });
        let value = self.call("flow", params).await?;
        parse_feature_vector(value)
    }
}

fn features_to_map(features: &FeatureVector) -> HashMap<String, f64> {
    features.iter().map(|(k, v)| (k.clone(), *v)).collect()
}

fn parse_vec(value: serde_json::Value) -> Outcome<Vec<f64>> {
    serde_json::from_value(value).map_err(|e| ErrorKind::InvalidArgument(e.to_string()))
}

fn parse_feature_vector(value: serde_json::Value) -> Outcome<FeatureVector> {
    let map: HashMap<String, f64> =
        serde_json::from_value(value).map_err(|e| ErrorKind::InvalidArgument(e.to_string()))?;
    Ok(FeatureVector::from_map(map))
}

struct RunningChild {
    child: Child,
    stdin: tokio::process::ChildStdin,
}

fn spawn_child(config: &LatentConfig) -> std::io::Result<RunningChild> {
    let mut command = Command::new(&config.binary_path);
    command
        .args(&config.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    let mut child = command.spawn()?;
    let stdin = child.stdin.take().expect("piped stdin");
    Ok(RunningChild { child, stdin })
}

/// Owns the child process exclusively: the only task that writes to its
/// stdin or reads its stdout, so request/response interleaving is never a
/// concern. Restarts the child with capped exponential backoff whenever it
/// exits or a write fails, failing every request queued in the meantime.
async fn run_actor(config: LatentConfig, mut rx: mpsc::Receiver<ActorMessage>, avail_tx: watch::Sender<bool>) {
    let mut backoff = INITIAL_BACKOFF;
    let mut next_id: u64 = 1;
    let mut pending: HashMap<u64, oneshot::Sender<Outcome<serde_json::Value>>> = HashMap::new();

    'outer: loop {
        let _ = avail_tx.send(false);
        let running = match spawn_child(&config) {
            Ok(r) => {
                backoff = INITIAL_BACKOFF;
                info!(binary = %config.binary_path.display(), "latent service started");
                let _ = avail_tx.send(true);
                r
            }
            Err(e) => {
                warn!(error = %e, backoff_ms = backoff.as_millis(), "failed to spawn latent service, backing off");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
        };

        let RunningChild { mut child, mut stdin } = running;
        let stdout = child.stdout.take().expect("piped stdout");
        let mut lines = BufReader::new(stdout).lines();

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(ActorMessage::Call { method, params, reply }) = msg else {
                        let _ = child.start_kill();
                        break 'outer;
                    };
                    let id = next_id;
                    next_id += 1;
                    let request = RpcRequest { id, method, params };
                    let mut line = match serde_json::to_vec(&request) {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            let _ = reply.send(Err(ErrorKind::InvalidArgument(e.to_string())));
                            continue;
                        }
                    };
                    line.push(b'\n');
                    if stdin.write_all(&line).await.is_err() {
                        let _ = reply.send(Err(ErrorKind::BackendUnavailable));
                        let _ = child.start_kill();
                        break;
                    }
                    pending.insert(id, reply);

                    let request_timeout = Duration::from_millis(config.request_timeout_ms);
                    tokio::select! {
                        line_result = timeout(request_timeout, lines.next_line()) => {
                            match line_result {
                                Ok(Ok(Some(text))) => dispatch_response(&mut pending, &text),
                                Ok(Ok(None)) => {
                                    fail_all_pending(&mut pending);
                                    break;
                                }
                                Ok(Err(_)) => {
                                    fail_all_pending(&mut pending);
                                    let _ = child.start_kill();
                                    break;
                                }
                                Err(_) => {
                                    if let Some(sender) = pending.remove(&id) {
                                        let _ = sender.send(Err(ErrorKind::BackendUnavailable));
                                    }
                                }
                            }
                        }
                    }
                }
                status = child.wait() => {
                    debug!(?status, "latent service exited");
                    fail_all_pending(&mut pending);
                    break;
                }
            }
        }
    }
}

fn dispatch_response(
    pending: &mut HashMap<u64, oneshot::Sender<Outcome<serde_json::Value>>>,
    line: &str,
) {
    let Ok(response) = serde_json::from_str::<RpcResponse>(line) else {
        return;
    };
    if let Some(sender) = pending.remove(&response.id) {
        let outcome = match response.error {
            Some(message) => Err(ErrorKind::InvalidArgument(message)),
            None => response.result.ok_or(ErrorKind::BackendUnavailable),
        };
        let _ = sender.send(outcome);
    }
}

fn fail_all_pending(pending: &mut HashMap<u64, oneshot::Sender<Outcome<serde_json::Value>>>) {
    for (_, sender) in pending.drain() {
        let _ = sender.send(Err(ErrorKind::BackendUnavailable));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_client_fails_fast_without_spawning() {
        let config = LatentConfig {
            enabled: false,
            ..LatentConfig::default()
        };
        let client = LatentClient::spawn(config);
        assert!(!client.is_enabled());
        assert!(!client.is_available());
    }

    #[test]
    fn features_to_map_round_trips_components() {
        let mut fv = FeatureVector::new();
        fv.set("rhythmic_tempo", 120.0);
        let map = features_to_map(&fv);
        assert_eq!(map.get("rhythmic_tempo"), Some(&120.0));
    }
}
