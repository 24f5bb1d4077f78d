//! The error bus: raise/clear with deduplication and global fanout.
//!
//! Two views share one active-errors database keyed by `(type, sub_type,
//! origin)`: the producer view publishes raises and clears onto the broker,
//! the subscriber view observes every raise/clear that survives type
//! validation and deduplication. Per identity and episode, subscribers see
//! exactly one raise followed by exactly one clear.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{error, warn};

use volt_protocol::{ErrorIdentity, ErrorInstance, ErrorTypeMap};

use crate::client::BrokerClient;
use crate::queue::Handler;
use crate::transport::Qos;
use crate::SubscriptionToken;

/// Callback invoked for raised or cleared errors.
pub type ErrorCallback = Arc<dyn Fn(&ErrorInstance) + Send + Sync>;

struct ErrorSubscription {
    on_raise: ErrorCallback,
    on_clear: ErrorCallback,
}

/// Global error bus attached to the broker.
pub struct ErrorBus {
    client: Arc<BrokerClient>,
    prefix: String,
    types: ErrorTypeMap,
    active: Arc<Mutex<HashMap<ErrorIdentity, ErrorInstance>>>,
    subscribers: Arc<Mutex<Vec<ErrorSubscription>>>,
    tokens: Mutex<Vec<SubscriptionToken>>,
}

impl ErrorBus {
    /// Registers the raise/clear fanout handlers on the broker.
    pub fn attach(client: Arc<BrokerClient>, types: ErrorTypeMap) -> Arc<Self> {
        let prefix = client.internal_prefix().to_string();
        let active: Arc<Mutex<HashMap<ErrorIdentity, ErrorInstance>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let subscribers: Arc<Mutex<Vec<ErrorSubscription>>> = Arc::new(Mutex::new(Vec::new()));

        let raise_handler: Handler = {
            let types = types.clone();
            let active = active.clone();
            let subscribers = subscribers.clone();
            Arc::new(move |topic, payload| {
                let Some(instance) = decode(topic, payload) else {
                    return;
                };
                if !types.contains(&instance.error_type) {
                    error!(
                        error_type = %instance.error_type,
                        "error type is not defined, ignoring raise"
                    );
                    return;
                }
                {
                    let mut active = active.lock().expect("error database poisoned");
                    if active.contains_key(&instance.identity()) {
                        error!(
                            error_type = %instance.error_type,
                            sub_type = %instance.sub_type,
                            "error is already raised, ignoring new raise"
                        );
                        return;
                    }
                    active.insert(instance.identity(), instance.clone());
                }
                for subscription in snapshot(&subscribers) {
                    (subscription.on_raise)(&instance);
                }
            })
        };

        let clear_handler: Handler = {
            let types = types.clone();
            let active = active.clone();
            let subscribers = subscribers.clone();
            Arc::new(move |topic, payload| {
                let Some(instance) = decode(topic, payload) else {
                    return;
                };
                if !types.contains(&instance.error_type) {
                    error!(
                        error_type = %instance.error_type,
                        "error type is not defined, ignoring clear"
                    );
                    return;
                }
                let removed = {
                    let mut active = active.lock().expect("error database poisoned");
                    active.remove(&instance.identity())
                };
                match removed {
                    None => {
                        error!(
                            error_type = %instance.error_type,
                            sub_type = %instance.sub_type,
                            "error is not raised, ignoring clear"
                        );
                    }
                    Some(_) => {
                        for subscription in snapshot(&subscribers) {
                            (subscription.on_clear)(&instance);
                        }
                    }
                }
            })
        };

        let raise_token = client.register_handler(
            &volt_topics::error_raise_all(&prefix),
            raise_handler,
            Qos::ExactlyOnce,
        );
        let clear_token = client.register_handler(
            &volt_topics::error_clear_all(&prefix),
            clear_handler,
            Qos::ExactlyOnce,
        );

        Arc::new(Self {
            client,
            prefix,
            types,
            active,
            subscribers,
            tokens: Mutex::new(vec![raise_token, clear_token]),
        })
    }

    /// Observes every raise and clear that passes validation.
    pub fn subscribe_all(&self, on_raise: ErrorCallback, on_clear: ErrorCallback) {
        self.subscribers
            .lock()
            .expect("subscriber list poisoned")
            .push(ErrorSubscription { on_raise, on_clear });
    }

    /// Producer view: publishes a raise unless the identity is already
    /// active.
    pub fn raise(&self, instance: ErrorInstance) {
        if !self.types.contains(&instance.error_type) {
            error!(
                error_type = %instance.error_type,
                "error type is not defined, not raising"
            );
            return;
        }
        {
            let active = self.active.lock().expect("error database poisoned");
            if active.contains_key(&instance.identity()) {
                error!(
                    error_type = %instance.error_type,
                    sub_type = %instance.sub_type,
                    "error is already raised, not raising again"
                );
                return;
            }
        }
        let topic = volt_topics::error_raise(
            &self.prefix,
            &instance.origin.module_id,
            &instance.origin.impl_id,
        );
        match serde_json::to_value(&instance) {
            Ok(payload) => self.client.publish(&topic, &payload, Qos::ExactlyOnce),
            Err(e) => error!(error = %e, "cannot encode error instance"),
        }
    }

    /// Producer view: publishes a clear for an active identity; a clear with
    /// no matching raise is a logged no-op.
    pub fn clear(&self, instance: ErrorInstance) {
        {
            let active = self.active.lock().expect("error database poisoned");
            if !active.contains_key(&instance.identity()) {
                error!(
                    error_type = %instance.error_type,
                    sub_type = %instance.sub_type,
                    "error is not raised, not clearing"
                );
                return;
            }
        }
        let topic = volt_topics::error_clear(
            &self.prefix,
            &instance.origin.module_id,
            &instance.origin.impl_id,
        );
        match serde_json::to_value(&instance) {
            Ok(payload) => self.client.publish(&topic, &payload, Qos::ExactlyOnce),
            Err(e) => error!(error = %e, "cannot encode error instance"),
        }
    }

    /// Copy of the currently active errors.
    pub fn active(&self) -> Vec<ErrorInstance> {
        self.active
            .lock()
            .expect("error database poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Unregisters the fanout handlers. Called during shutdown, before the
    /// broker stops.
    pub fn detach(&self) {
        let tokens: Vec<SubscriptionToken> =
            self.tokens.lock().expect("token list poisoned").drain(..).collect();
        for token in tokens {
            self.client.unregister_handler(token);
        }
    }
}

fn decode(topic: &str, payload: &serde_json::Value) -> Option<ErrorInstance> {
    match serde_json::from_value(payload.clone()) {
        Ok(instance) => Some(instance),
        Err(e) => {
            warn!(topic, error = %e, "dropping malformed error instance");
            None
        }
    }
}

/// Copies the subscriber list out so fanout runs without holding the lock.
fn snapshot(subscribers: &Mutex<Vec<ErrorSubscription>>) -> Vec<ErrorSubscription> {
    subscribers
        .lock()
        .expect("subscriber list poisoned")
        .iter()
        .map(|s| ErrorSubscription {
            on_raise: s.on_raise.clone(),
            on_clear: s.on_clear.clone(),
        })
        .collect()
}
