//! The startup barrier.
//!
//! Every participating module gets a handler on its ready topic before any
//! child is spawned. When the last pending module reports ready, the global
//! ready signal is published exactly once. Standalone modules are spawned by
//! the operator but still count towards the barrier; once only standalone
//! modules are missing, that is reported to the status sink.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use volt_bus::{BrokerClient, Handler, Qos, SubscriptionToken};

use crate::status_fifo::{self, StatusFifo};

#[derive(Default)]
struct BarrierState {
    ready: BTreeMap<String, bool>,
    standalone: BTreeSet<String>,
    waiting_reported: bool,
    global_published: bool,
}

pub struct StartupBarrier {
    client: Arc<BrokerClient>,
    prefix: String,
    status: StatusFifo,
    state: Arc<Mutex<BarrierState>>,
    tokens: Mutex<Vec<SubscriptionToken>>,
    all_ready: watch::Sender<bool>,
}

impl StartupBarrier {
    pub fn new(client: Arc<BrokerClient>, status: StatusFifo) -> Arc<Self> {
        let prefix = client.internal_prefix().to_string();
        let (all_ready, _) = watch::channel(false);
        Arc::new(Self {
            client,
            prefix,
            status,
            state: Arc::new(Mutex::new(BarrierState::default())),
            tokens: Mutex::new(Vec::new()),
            all_ready,
        })
    }

    /// Observes the one-shot global-ready edge.
    pub fn watch_all_ready(&self) -> watch::Receiver<bool> {
        self.all_ready.subscribe()
    }

    /// Adds a module to the pending set and registers its ready handler.
    /// Must run before the module's process is spawned.
    pub fn register(&self, module_id: &str, standalone: bool) {
        {
            let mut state = self.state.lock().expect("barrier state poisoned");
            state.ready.insert(module_id.to_string(), false);
            if standalone {
                state.standalone.insert(module_id.to_string());
            }
        }

        let state = self.state.clone();
        let client = self.client.clone();
        let prefix = self.prefix.clone();
        let status = self.status.clone();
        let all_ready = self.all_ready.clone();
        let id = module_id.to_string();
        let handler: Handler = Arc::new(move |_topic, payload| {
            let Some(value) = payload.as_bool() else {
                warn!(module_id = %id, %payload, "dropping non-boolean ready payload");
                return;
            };
            debug!(module_id = %id, value, "module ready signal received");
            Self::on_ready(&state, &client, &prefix, &status, &all_ready, &id, value);
        });

        let topic = volt_topics::module_ready(&self.prefix, module_id);
        let token = self.client.register_handler(&topic, handler, Qos::ExactlyOnce);
        self.tokens.lock().expect("token list poisoned").push(token);
    }

    fn on_ready(
        state: &Mutex<BarrierState>,
        client: &BrokerClient,
        prefix: &str,
        status: &StatusFifo,
        all_ready: &watch::Sender<bool>,
        module_id: &str,
        value: bool,
    ) {
        let mut state = state.lock().expect("barrier state poisoned");
        let standalone_total = state.standalone.len();
        let is_standalone = state.standalone.contains(module_id);
        let Some(entry) = state.ready.get_mut(module_id) else {
            // ready signal during teardown; the table is already cleared
            return;
        };
        if *entry && value {
            debug!(module_id, "duplicate ready signal ignored");
            return;
        }
        *entry = value;
        if is_standalone && value {
            info!(module_id, "standalone module initialized");
        }

        let total = state.ready.len();
        let ready_count = state.ready.values().filter(|ready| **ready).count();

        if ready_count == total {
            if !state.global_published {
                state.global_published = true;
                status.update(status_fifo::ALL_MODULES_STARTED);
                info!("all modules initialized, runtime up and running");
                client.publish(&volt_topics::global_ready(prefix), &json!(true), Qos::ExactlyOnce);
                let _ = all_ready.send(true);
            }
        } else if standalone_total > 0
            && !state.waiting_reported
            && ready_count == total - standalone_total
        {
            let all_managed_ready = state
                .ready
                .iter()
                .filter(|(id, _)| !state.standalone.contains(*id))
                .all(|(_, ready)| *ready);
            if all_managed_ready {
                state.waiting_reported = true;
                info!("managed modules are ready, waiting for standalone modules");
                status.update(status_fifo::WAITING_FOR_STANDALONE_MODULES);
            }
        }
    }

    /// Clears the pending table and unregisters every ready handler. Runs
    /// before children are signalled during teardown, so no handler can fire
    /// into a dying fleet.
    pub fn deregister_all(&self) {
        {
            let mut state = self.state.lock().expect("barrier state poisoned");
            state.ready.clear();
            state.standalone.clear();
        }
        let tokens: Vec<SubscriptionToken> =
            self.tokens.lock().expect("token list poisoned").drain(..).collect();
        for token in tokens {
            self.client.unregister_handler(token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tokio::sync::mpsc;
    use tokio::time::{sleep, timeout, Duration};
    use volt_bus::{LocalHub, StopMode};

    struct Setup {
        client: Arc<BrokerClient>,
        barrier: Arc<StartupBarrier>,
        status_file: std::path::PathBuf,
        global_ready: mpsc::UnboundedReceiver<Value>,
        _dir: tempfile::TempDir,
    }

    async fn setup() -> Setup {
        let hub = LocalHub::new();
        let client = BrokerClient::local(&hub, "volt", StopMode::Drain);
        assert!(client.connect().await);
        client.spawn_main_loop();

        let dir = tempfile::tempdir().unwrap();
        let status_file = dir.path().join("status");
        std::fs::write(&status_file, "").unwrap();
        let status = StatusFifo::create_from_path(status_file.to_str().unwrap());

        let (tx, rx) = mpsc::unbounded_channel();
        let handler: Handler = Arc::new(move |_topic, payload| {
            let _ = tx.send(payload.clone());
        });
        client.register_handler(&volt_topics::global_ready("volt"), handler, Qos::ExactlyOnce);

        let barrier = StartupBarrier::new(client.clone(), status);
        Setup {
            client,
            barrier,
            status_file,
            global_ready: rx,
            _dir: dir,
        }
    }

    fn publish_ready(client: &BrokerClient, module_id: &str) {
        client.publish(
            &volt_topics::module_ready("volt", module_id),
            &json!(true),
            Qos::ExactlyOnce,
        );
    }

    #[tokio::test]
    async fn global_ready_fires_once_after_all_modules() {
        let mut setup = setup().await;
        setup.barrier.register("a", false);
        setup.barrier.register("b", false);

        publish_ready(&setup.client, "a");
        sleep(Duration::from_millis(50)).await;
        assert!(setup.global_ready.try_recv().is_err());

        publish_ready(&setup.client, "b");
        let payload = timeout(Duration::from_secs(1), setup.global_ready.recv())
            .await
            .expect("global ready not published")
            .unwrap();
        assert_eq!(payload, json!(true));

        // duplicates stay idempotent, the signal is not republished
        publish_ready(&setup.client, "a");
        publish_ready(&setup.client, "b");
        sleep(Duration::from_millis(50)).await;
        assert!(setup.global_ready.try_recv().is_err());

        let status = std::fs::read_to_string(&setup.status_file).unwrap();
        assert_eq!(status, "ALL_MODULES_STARTED\n");

        setup.client.stop().await;
    }

    #[tokio::test]
    async fn standalone_modules_are_awaited_and_reported() {
        let mut setup = setup().await;
        setup.barrier.register("a", false);
        setup.barrier.register("b", false);
        setup.barrier.register("s", true);

        publish_ready(&setup.client, "a");
        publish_ready(&setup.client, "b");
        sleep(Duration::from_millis(100)).await;

        let status = std::fs::read_to_string(&setup.status_file).unwrap();
        assert_eq!(status, "WAITING_FOR_STANDALONE_MODULES\n");
        assert!(setup.global_ready.try_recv().is_err());

        publish_ready(&setup.client, "s");
        timeout(Duration::from_secs(1), setup.global_ready.recv())
            .await
            .expect("global ready not published")
            .unwrap();

        let status = std::fs::read_to_string(&setup.status_file).unwrap();
        assert_eq!(status, "WAITING_FOR_STANDALONE_MODULES\nALL_MODULES_STARTED\n");

        setup.client.stop().await;
    }

    #[tokio::test]
    async fn watch_observes_the_ready_edge() {
        let setup = setup().await;
        setup.barrier.register("a", false);
        let mut watcher = setup.barrier.watch_all_ready();
        assert!(!*watcher.borrow());

        publish_ready(&setup.client, "a");
        timeout(Duration::from_secs(1), watcher.changed())
            .await
            .expect("ready edge not observed")
            .unwrap();
        assert!(*watcher.borrow());

        setup.client.stop().await;
    }

    #[tokio::test]
    async fn ready_after_deregistration_is_ignored() {
        let mut setup = setup().await;
        setup.barrier.register("a", false);
        setup.barrier.deregister_all();

        publish_ready(&setup.client, "a");
        sleep(Duration::from_millis(50)).await;
        assert!(setup.global_ready.try_recv().is_err());

        setup.client.stop().await;
    }
}
