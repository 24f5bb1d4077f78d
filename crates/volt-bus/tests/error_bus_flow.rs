use std::sync::{Arc, Mutex};

use tokio::time::{sleep, Duration};
use volt_bus::errors::ErrorBus;
use volt_bus::{BrokerClient, LocalHub, StopMode};
use volt_protocol::{ErrorInstance, ErrorOrigin, ErrorSeverity, ErrorTypeMap};

fn known_types() -> ErrorTypeMap {
    let mut types = ErrorTypeMap::default();
    types.insert("evse/CommunicationFault", "Lost contact with the hardware");
    types.insert("evse/OverTemperature", "Thermal limit exceeded");
    types
}

fn fault(message: &str) -> ErrorInstance {
    ErrorInstance::new(
        "evse/CommunicationFault",
        "can0",
        ErrorOrigin {
            module_id: "evse".into(),
            impl_id: "main".into(),
        },
        message,
        ErrorSeverity::High,
    )
}

struct Recorder {
    events: Arc<Mutex<Vec<(String, String)>>>,
}

impl Recorder {
    fn attach(bus: &ErrorBus) -> Arc<Mutex<Vec<(String, String)>>> {
        let events: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let on_raise = {
            let events = events.clone();
            Arc::new(move |e: &ErrorInstance| {
                events.lock().unwrap().push(("raise".into(), e.error_type.clone()));
            })
        };
        let on_clear = {
            let events = events.clone();
            Arc::new(move |e: &ErrorInstance| {
                events.lock().unwrap().push(("clear".into(), e.error_type.clone()));
            })
        };
        bus.subscribe_all(on_raise, on_clear);
        events
    }
}

async fn setup() -> (Arc<BrokerClient>, Arc<ErrorBus>) {
    let hub = LocalHub::new();
    let client = BrokerClient::local(&hub, "volt", StopMode::Drain);
    assert!(client.connect().await);
    client.spawn_main_loop();
    let bus = ErrorBus::attach(client.clone(), known_types());
    (client, bus)
}

#[tokio::test]
async fn raise_then_clear_fans_out_once_each() {
    let (client, bus) = setup().await;
    let events = Recorder::attach(&bus);

    let error = fault("bus off");
    bus.raise(error.clone());
    sleep(Duration::from_millis(50)).await;
    assert_eq!(bus.active().len(), 1);

    bus.clear(error);
    sleep(Duration::from_millis(50)).await;
    assert!(bus.active().is_empty());

    assert_eq!(
        *events.lock().unwrap(),
        vec![
            ("raise".to_string(), "evse/CommunicationFault".to_string()),
            ("clear".to_string(), "evse/CommunicationFault".to_string()),
        ]
    );

    client.stop().await;
}

#[tokio::test]
async fn duplicate_raise_is_ignored() {
    let (client, bus) = setup().await;
    let events = Recorder::attach(&bus);

    let error = fault("first");
    bus.raise(error.clone());
    sleep(Duration::from_millis(50)).await;

    // same identity, different message and uuid
    bus.raise(fault("second"));
    sleep(Duration::from_millis(50)).await;

    assert_eq!(bus.active().len(), 1);
    assert_eq!(events.lock().unwrap().len(), 1);

    client.stop().await;
}

#[tokio::test]
async fn clear_without_matching_raise_is_a_no_op() {
    let (client, bus) = setup().await;
    let events = Recorder::attach(&bus);

    bus.clear(fault("never raised"));
    sleep(Duration::from_millis(50)).await;

    assert!(events.lock().unwrap().is_empty());
    assert!(bus.active().is_empty());

    client.stop().await;
}

#[tokio::test]
async fn unknown_error_type_is_never_delivered() {
    let (client, bus) = setup().await;
    let events = Recorder::attach(&bus);

    let unknown = ErrorInstance::new(
        "evse/NotDeclared",
        "",
        ErrorOrigin {
            module_id: "evse".into(),
            impl_id: "main".into(),
        },
        "bogus",
        ErrorSeverity::Low,
    );
    bus.raise(unknown.clone());
    sleep(Duration::from_millis(50)).await;

    // even a raise injected directly over the broker is dropped
    client.publish(
        &volt_topics::error_raise("volt", "evse", "main"),
        &serde_json::to_value(&unknown).unwrap(),
        volt_bus::Qos::ExactlyOnce,
    );
    sleep(Duration::from_millis(50)).await;

    assert!(events.lock().unwrap().is_empty());
    assert!(bus.active().is_empty());

    client.stop().await;
}

#[tokio::test]
async fn identities_are_tracked_independently() {
    let (client, bus) = setup().await;
    let events = Recorder::attach(&bus);

    let comm = fault("bus off");
    let heat = ErrorInstance::new(
        "evse/OverTemperature",
        "",
        ErrorOrigin {
            module_id: "evse".into(),
            impl_id: "main".into(),
        },
        "too hot",
        ErrorSeverity::Medium,
    );

    bus.raise(comm.clone());
    bus.raise(heat.clone());
    sleep(Duration::from_millis(50)).await;
    assert_eq!(bus.active().len(), 2);

    bus.clear(comm);
    sleep(Duration::from_millis(50)).await;
    assert_eq!(bus.active().len(), 1);
    assert_eq!(bus.active()[0].error_type, "evse/OverTemperature");

    assert_eq!(events.lock().unwrap().len(), 3);

    client.stop().await;
}
