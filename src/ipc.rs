//! Request/reply RPC over presence pub/sub
//!
//! Requests travel as JSON tuples `[requestId, method, args]` where a `null`
//! method is the process inbox's dedicated create-room path. Replies travel
//! as `[ok, value]` on a channel derived from the request id; a requester
//! that timed out has already unsubscribed, so late replies are dropped by
//! the substrate.

use crate::error::{IpcError, Result};
use crate::presence::Presence;
use crate::types::{ClientOptions, ProcessId, SessionId};
use crate::utils::generate_request_id;
use anyhow::anyhow;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Process-wide inbox channel, receives create-room requests.
pub fn process_channel(process_id: &str) -> String {
    format!("p:{}", process_id)
}

/// Per-room inbox channel, receives method invocations for that room.
pub fn room_channel(room_id: &str) -> String {
    format!("${}", room_id)
}

/// Reply channel for one in-flight request.
pub fn reply_channel(request_id: &str) -> String {
    format!("ipc:{}", request_id)
}

/// Method invocations addressable on a room inbox. The set is closed:
/// extension points are new variants, not new method strings.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomCall {
    ReserveSeat {
        session_id: SessionId,
        options: ClientOptions,
    },
    HasReservedSeat {
        session_id: SessionId,
    },
    /// Property read; answered without invoking anything on the room.
    RoomId,
    Disconnect,
}

impl RoomCall {
    /// Wire method name, kept stable for backend compatibility.
    pub fn method(&self) -> &'static str {
        match self {
            RoomCall::ReserveSeat { .. } => "_reserveSeat",
            RoomCall::HasReservedSeat { .. } => "hasReservedSeat",
            RoomCall::RoomId => "roomId",
            RoomCall::Disconnect => "disconnect",
        }
    }

    /// Wire argument list. Property reads carry no arguments.
    pub fn args(&self) -> Value {
        match self {
            RoomCall::ReserveSeat {
                session_id,
                options,
            } => json!([session_id, options]),
            RoomCall::HasReservedSeat { session_id } => json!([session_id]),
            RoomCall::RoomId | RoomCall::Disconnect => Value::Null,
        }
    }

    /// Decode an incoming wire pair. Unknown methods are rejected rather
    /// than dispatched dynamically.
    pub fn from_wire(method: &str, args: &Value) -> Result<RoomCall> {
        match method {
            "_reserveSeat" => {
                let session_id = args
                    .get(0)
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow!("_reserveSeat requires a session id"))?
                    .to_string();
                let options = args
                    .get(1)
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                Ok(RoomCall::ReserveSeat {
                    session_id,
                    options,
                })
            }
            "hasReservedSeat" => {
                let session_id = args
                    .get(0)
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow!("hasReservedSeat requires a session id"))?
                    .to_string();
                Ok(RoomCall::HasReservedSeat { session_id })
            }
            "roomId" => Ok(RoomCall::RoomId),
            "disconnect" => Ok(RoomCall::Disconnect),
            other => Err(IpcError::Remote {
                message: format!("unknown room method \"{}\"", other),
            }
            .into()),
        }
    }
}

/// Subscribe on `channel` and serve requests until the channel is
/// unsubscribed. Each request is handed to `dispatch` as
/// `(method, args)`; its outcome is published on the reply channel.
pub async fn subscribe_ipc<F, Fut>(
    presence: Arc<dyn Presence>,
    process_id: ProcessId,
    channel: String,
    dispatch: F,
) -> Result<()>
where
    F: Fn(Option<String>, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    let mut subscription = presence.subscribe(&channel).await?;
    tokio::spawn(async move {
        while let Some(raw) = subscription.recv().await {
            let (request_id, method, args) = match parse_request(&raw) {
                Ok(parts) => parts,
                Err(error) => {
                    warn!(channel = %channel, "discarding malformed IPC request: {}", error);
                    continue;
                }
            };
            let reply = match dispatch(method, args).await {
                Ok(value) => json!([true, value]),
                Err(error) => json!([false, error.to_string()]),
            };
            if let Err(error) = presence
                .publish(&reply_channel(&request_id), &reply.to_string())
                .await
            {
                warn!(
                    channel = %channel,
                    process_id = %process_id,
                    "failed to publish IPC reply: {}", error
                );
            }
        }
        debug!(channel = %channel, "IPC dispatch loop ended");
    });
    Ok(())
}

/// Publish a request on `channel` and race the reply against `timeout`.
///
/// A `null` method selects the receiver's default dispatch (room creation on
/// process inboxes). On timeout the transient reply subscription is dropped
/// and the call fails with [`IpcError::Timeout`]; retries are the caller's
/// responsibility.
pub async fn request_from_ipc(
    presence: &Arc<dyn Presence>,
    channel: &str,
    method: Option<&str>,
    args: Value,
    timeout: Duration,
) -> Result<Value> {
    let request_id = generate_request_id();
    let reply = reply_channel(&request_id);
    let mut subscription = presence.subscribe(&reply).await?;

    let request = json!([request_id, method, args]).to_string();
    presence.publish(channel, &request).await?;

    let outcome = tokio::time::timeout(timeout, subscription.recv()).await;
    if let Err(error) = presence.unsubscribe(&reply).await {
        debug!(channel = %reply, "failed to drop reply subscription: {}", error);
    }

    match outcome {
        Ok(Some(raw)) => parse_reply(&raw),
        Ok(None) => Err(IpcError::Transport {
            message: format!("reply channel {} closed before a reply arrived", reply),
        }
        .into()),
        Err(_) => Err(IpcError::Timeout(timeout).into()),
    }
}

fn parse_request(raw: &str) -> Result<(String, Option<String>, Value)> {
    let value: Value = serde_json::from_str(raw)?;
    let parts = value
        .as_array()
        .ok_or_else(|| anyhow!("IPC request is not a tuple"))?;
    let request_id = parts
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("IPC request is missing its id"))?
        .to_string();
    let method = match parts.get(1) {
        None | Some(Value::Null) => None,
        Some(Value::String(method)) => Some(method.clone()),
        Some(other) => return Err(anyhow!("IPC method must be a string, got {}", other)),
    };
    let args = parts.get(2).cloned().unwrap_or(Value::Null);
    Ok((request_id, method, args))
}

fn parse_reply(raw: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(raw)?;
    let parts = value
        .as_array()
        .ok_or_else(|| anyhow!("IPC reply is not a tuple"))?;
    let ok = parts
        .first()
        .and_then(Value::as_bool)
        .ok_or_else(|| anyhow!("IPC reply is missing its status"))?;
    let payload = parts.get(1).cloned().unwrap_or(Value::Null);
    if ok {
        Ok(payload)
    } else {
        Err(IpcError::Remote {
            message: payload
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| payload.to_string()),
        }
        .into())
    }
}
