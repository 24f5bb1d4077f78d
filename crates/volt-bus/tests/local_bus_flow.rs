use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use volt_bus::{BrokerClient, LocalHub, Qos, StopMode};

fn collector() -> (volt_bus::Handler, mpsc::UnboundedReceiver<(String, Value)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler: volt_bus::Handler = Arc::new(move |topic, payload| {
        let _ = tx.send((topic.to_string(), payload.clone()));
    });
    (handler, rx)
}

#[tokio::test]
async fn publish_reaches_matching_subscription() {
    let hub = LocalHub::new();
    let client = BrokerClient::local(&hub, "volt", StopMode::Drain);
    assert!(client.connect().await);
    client.spawn_main_loop();

    let (handler, mut rx) = collector();
    let _token = client.register_handler("volt/modules/m/ready", handler, Qos::ExactlyOnce);

    client.publish("volt/modules/m/ready", &json!(true), Qos::ExactlyOnce);

    let (topic, payload) = timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("delivery timed out")
        .unwrap();
    assert_eq!(topic, "volt/modules/m/ready");
    assert_eq!(payload, json!(true));

    client.stop().await;
}

#[tokio::test]
async fn wildcard_subscription_sees_all_modules() {
    let hub = LocalHub::new();
    let client = BrokerClient::local(&hub, "volt", StopMode::Drain);
    assert!(client.connect().await);
    client.spawn_main_loop();

    let (handler, mut rx) = collector();
    let _token = client.register_handler("volt/modules/+/ready", handler, Qos::ExactlyOnce);

    client.publish("volt/modules/a/ready", &json!(true), Qos::ExactlyOnce);
    client.publish("volt/modules/b/ready", &json!(true), Qos::ExactlyOnce);
    client.publish("volt/other", &json!(1), Qos::ExactlyOnce);

    let mut seen = Vec::new();
    for _ in 0..2 {
        let (topic, _) = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("delivery timed out")
            .unwrap();
        seen.push(topic);
    }
    assert_eq!(seen, vec!["volt/modules/a/ready", "volt/modules/b/ready"]);
    assert!(rx.try_recv().is_err());

    client.stop().await;
}

#[tokio::test]
async fn messages_keep_publication_order_per_topic() {
    let hub = LocalHub::new();
    let client = BrokerClient::local(&hub, "volt", StopMode::Drain);
    assert!(client.connect().await);
    client.spawn_main_loop();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let handler: volt_bus::Handler = {
        let seen = seen.clone();
        Arc::new(move |_, payload| seen.lock().unwrap().push(payload.as_u64().unwrap()))
    };
    let _token = client.register_handler("volt/modules/m/main/var/v", handler, Qos::ExactlyOnce);

    for n in 0..50u64 {
        client.publish("volt/modules/m/main/var/v", &json!(n), Qos::ExactlyOnce);
    }

    client.stop().await;
    assert_eq!(*seen.lock().unwrap(), (0..50).collect::<Vec<_>>());
}

#[tokio::test]
async fn two_handlers_on_one_topic_both_receive_in_order() {
    let hub = LocalHub::new();
    let client = BrokerClient::local(&hub, "volt", StopMode::Drain);
    assert!(client.connect().await);
    client.spawn_main_loop();

    let order = Arc::new(Mutex::new(Vec::new()));
    for tag in ["first", "second"] {
        let order = order.clone();
        let handler: volt_bus::Handler = Arc::new(move |_, _| order.lock().unwrap().push(tag));
        let _token = client.register_handler("volt/t", handler, Qos::ExactlyOnce);
    }

    client.publish("volt/t", &json!(1), Qos::ExactlyOnce);
    client.stop().await;

    assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
}

#[tokio::test]
async fn unregistered_handler_stops_receiving() {
    let hub = LocalHub::new();
    let client = BrokerClient::local(&hub, "volt", StopMode::Drain);
    assert!(client.connect().await);
    client.spawn_main_loop();

    let (handler, mut rx) = collector();
    let token = client.register_handler("volt/t", handler, Qos::ExactlyOnce);

    client.publish("volt/t", &json!(1), Qos::ExactlyOnce);
    assert!(timeout(Duration::from_secs(1), rx.recv()).await.is_ok());

    client.unregister_handler(token);
    client.publish("volt/t", &json!(2), Qos::ExactlyOnce);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());

    client.stop().await;
}

#[tokio::test]
async fn malformed_internal_payload_is_counted_and_dropped() {
    let hub = LocalHub::new();
    let client = BrokerClient::local(&hub, "volt", StopMode::Drain);
    assert!(client.connect().await);
    client.spawn_main_loop();

    let (handler, mut rx) = collector();
    let _token = client.register_handler("volt/t", handler, Qos::ExactlyOnce);

    client.publish_raw("volt/t", "{not json".to_string(), Qos::ExactlyOnce);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(rx.try_recv().is_err());
    assert_eq!(client.stats().protocol_errors, 1);

    client.stop().await;
}

#[tokio::test]
async fn external_topics_deliver_raw_strings() {
    let hub = LocalHub::new();
    let client = BrokerClient::local(&hub, "volt", StopMode::Drain);
    assert!(client.connect().await);
    client.spawn_main_loop();

    let (handler, mut rx) = collector();
    let _token = client.register_handler("external/t", handler, Qos::AtMostOnce);

    client.publish_raw("external/t", "plain text".to_string(), Qos::AtMostOnce);

    let (_, payload) = timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("delivery timed out")
        .unwrap();
    assert_eq!(payload, json!("plain text"));

    client.stop().await;
}

#[tokio::test]
async fn two_clients_on_one_hub_exchange_messages() {
    let hub = LocalHub::new();
    let manager = BrokerClient::local(&hub, "volt", StopMode::Drain);
    let module = BrokerClient::local(&hub, "volt", StopMode::Drain);
    assert!(manager.connect().await);
    assert!(module.connect().await);
    manager.spawn_main_loop();
    module.spawn_main_loop();

    let (handler, mut rx) = collector();
    let _token = manager.register_handler("volt/modules/m/ready", handler, Qos::ExactlyOnce);

    module.publish("volt/modules/m/ready", &json!(true), Qos::ExactlyOnce);

    assert!(timeout(Duration::from_secs(1), rx.recv()).await.is_ok());

    manager.stop().await;
    module.stop().await;
}
