//! Request/response correlation over the broker.
//!
//! A call subscribes to its per-call result topic before publishing the
//! request, so no reply can be lost to a subscribe race. The target first
//! acknowledges receipt, then delivers the result; a missing acknowledgement
//! is only a diagnostic, the call keeps waiting until the result timeout
//! expires. Late replies after a timeout are dropped silently.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::warn;

use volt_protocol::{CmdFailure, CmdOrigin, CmdReply, CmdRequest};

use crate::client::BrokerClient;
use crate::queue::Handler;
use crate::transport::Qos;
use crate::SubscriptionToken;

/// Failure of a single call. Never fatal to the caller's process.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("command '{cmd}' on '{target}' timed out after {timeout:?}")]
    Timeout {
        cmd: String,
        target: String,
        timeout: Duration,
    },
    #[error("command '{cmd}' failed remotely: {kind}: {message}")]
    Remote {
        cmd: String,
        kind: String,
        message: String,
    },
    #[error("cannot decode reply to command '{cmd}': {reason}")]
    Decode { cmd: String, reason: String },
    #[error("broker shut down while waiting for command '{cmd}'")]
    Shutdown { cmd: String },
    #[error("invalid call to command '{cmd}': {reason}")]
    Validation { cmd: String, reason: String },
}

/// Payload check hooks, wired up from the interface schemas when schema
/// validation is enabled.
pub type PayloadCheck = Arc<dyn Fn(&str, &Value) -> Result<(), String> + Send + Sync>;

/// Issues commands to other modules on behalf of one implementation.
pub struct RpcClient {
    client: Arc<BrokerClient>,
    prefix: String,
    origin: CmdOrigin,
    counter: AtomicU64,
    ack_timeout: Duration,
    res_timeout: Duration,
    args_check: Option<PayloadCheck>,
    result_check: Option<PayloadCheck>,
}

impl RpcClient {
    pub fn new(
        client: Arc<BrokerClient>,
        origin: CmdOrigin,
        ack_timeout: Duration,
        res_timeout: Duration,
    ) -> Self {
        let prefix = client.internal_prefix().to_string();
        Self {
            client,
            prefix,
            origin,
            counter: AtomicU64::new(0),
            ack_timeout,
            res_timeout,
            args_check: None,
            result_check: None,
        }
    }

    /// Enables argument/result validation.
    pub fn with_validation(mut self, args_check: PayloadCheck, result_check: PayloadCheck) -> Self {
        self.args_check = Some(args_check);
        self.result_check = Some(result_check);
        self
    }

    /// Calls `cmd` on `(target_module, target_impl)` and awaits the result.
    pub async fn call(
        &self,
        target_module: &str,
        target_impl: &str,
        cmd: &str,
        args: Value,
    ) -> Result<Value, RpcError> {
        if let Some(check) = &self.args_check {
            check(cmd, &args).map_err(|reason| RpcError::Validation {
                cmd: cmd.to_string(),
                reason,
            })?;
        }

        let id = self.counter.fetch_add(1, Ordering::Relaxed).to_string();
        let result_topic = volt_topics::cmd_result(
            &self.prefix,
            &self.origin.module_id,
            &self.origin.impl_id,
            cmd,
            &id,
        );
        let request_topic =
            volt_topics::cmd_request(&self.prefix, target_module, target_impl, cmd);

        // subscribe before publishing so the reply cannot be lost
        let (tx, mut rx) = mpsc::channel::<Value>(8);
        let handler: Handler = Arc::new(move |_topic, payload| {
            let _ = tx.try_send(payload.clone());
        });
        let token = self
            .client
            .register_handler(&result_topic, handler, Qos::ExactlyOnce);

        let request = CmdRequest {
            id: id.clone(),
            origin: self.origin.clone(),
            args,
        };
        self.client.publish(
            &request_topic,
            &serde_json::to_value(&request).unwrap_or(Value::Null),
            Qos::ExactlyOnce,
        );

        let target = format!("{target_module}/{target_impl}");
        let outcome = self.await_reply(cmd, &target, &id, &mut rx).await;
        self.client.unregister_handler(token);
        outcome
    }

    async fn await_reply(
        &self,
        cmd: &str,
        target: &str,
        id: &str,
        rx: &mut mpsc::Receiver<Value>,
    ) -> Result<Value, RpcError> {
        let start = Instant::now();
        let deadline = start + self.res_timeout;
        let ack_deadline = start + self.ack_timeout.min(self.res_timeout);
        let mut ack_pending = true;

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(RpcError::Timeout {
                    cmd: cmd.to_string(),
                    target: target.to_string(),
                    timeout: self.res_timeout,
                });
            }
            let until = if ack_pending && ack_deadline > now {
                ack_deadline
            } else {
                deadline
            };

            match tokio::time::timeout_at(until, rx.recv()).await {
                Err(_) => {
                    if ack_pending && Instant::now() >= ack_deadline {
                        ack_pending = false;
                        warn!(
                            cmd,
                            target,
                            timeout = ?self.ack_timeout,
                            "command not acknowledged in time, still waiting for the result"
                        );
                        continue;
                    }
                    return Err(RpcError::Timeout {
                        cmd: cmd.to_string(),
                        target: target.to_string(),
                        timeout: self.res_timeout,
                    });
                }
                Ok(None) => {
                    return Err(RpcError::Shutdown {
                        cmd: cmd.to_string(),
                    })
                }
                Ok(Some(payload)) => {
                    let reply: CmdReply =
                        serde_json::from_value(payload).map_err(|e| RpcError::Decode {
                            cmd: cmd.to_string(),
                            reason: e.to_string(),
                        })?;
                    if reply.id() != id {
                        // stale reply from an earlier call; drop silently
                        continue;
                    }
                    match reply {
                        CmdReply::Ack { .. } => {
                            ack_pending = false;
                        }
                        CmdReply::Result { result, .. } => {
                            if let Some(check) = &self.result_check {
                                check(cmd, &result).map_err(|reason| RpcError::Decode {
                                    cmd: cmd.to_string(),
                                    reason,
                                })?;
                            }
                            return Ok(result);
                        }
                        CmdReply::Error { error, .. } => {
                            return Err(RpcError::Remote {
                                cmd: cmd.to_string(),
                                kind: error.kind,
                                message: error.message,
                            })
                        }
                    }
                }
            }
        }
    }
}

/// Registers a command handler for one implementation: decodes requests,
/// acknowledges them, runs `f` and publishes the result or error envelope.
///
/// The manager itself never provides commands; this is the callee half of the
/// wire contract, shared by module-side bindings and the tests.
pub fn provide_cmd<F>(
    client: &Arc<BrokerClient>,
    module_id: &str,
    impl_id: &str,
    cmd: &str,
    f: F,
) -> SubscriptionToken
where
    F: Fn(Value) -> Result<Value, CmdFailure> + Send + Sync + 'static,
{
    let prefix = client.internal_prefix().to_string();
    let request_topic = volt_topics::cmd_request(&prefix, module_id, impl_id, cmd);
    let publisher = client.clone();
    let cmd_name = cmd.to_string();

    let handler: Handler = Arc::new(move |topic, payload| {
        let request: CmdRequest = match serde_json::from_value(payload.clone()) {
            Ok(request) => request,
            Err(e) => {
                warn!(topic, error = %e, "dropping malformed command request");
                return;
            }
        };
        let result_topic = volt_topics::cmd_result(
            &prefix,
            &request.origin.module_id,
            &request.origin.impl_id,
            &cmd_name,
            &request.id,
        );
        publisher.publish(
            &result_topic,
            &json!({ "id": request.id, "ack": true }),
            Qos::ExactlyOnce,
        );
        let reply = match f(request.args) {
            Ok(result) => json!({ "id": request.id, "result": result }),
            Err(failure) => json!({ "id": request.id, "error": failure }),
        };
        publisher.publish(&result_topic, &reply, Qos::ExactlyOnce);
    });

    client.register_handler(&request_topic, handler, Qos::ExactlyOnce)
}
