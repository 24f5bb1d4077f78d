use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use volt_bus::rpc::{provide_cmd, RpcClient, RpcError};
use volt_bus::{BrokerClient, LocalHub, StopMode};
use volt_protocol::{CmdFailure, CmdOrigin};

fn origin() -> CmdOrigin {
    CmdOrigin {
        module_id: "caller".into(),
        impl_id: "main".into(),
    }
}

async fn hub_client(hub: &LocalHub) -> Arc<BrokerClient> {
    let client = BrokerClient::local(hub, "volt", StopMode::Drain);
    assert!(client.connect().await);
    client.spawn_main_loop();
    client
}

#[tokio::test]
async fn echo_round_trip_returns_identical_json() {
    let hub = LocalHub::new();
    let client = hub_client(&hub).await;

    let _provider = provide_cmd(&client, "echoer", "main", "echo", Ok);

    let rpc = RpcClient::new(
        client.clone(),
        origin(),
        Duration::from_millis(500),
        Duration::from_secs(2),
    );
    let args = json!({"nested": {"list": [1, 2, 3], "text": "payload"}});
    let result = rpc.call("echoer", "main", "echo", args.clone()).await.unwrap();
    assert_eq!(result, args);

    client.stop().await;
}

#[tokio::test]
async fn remote_error_is_surfaced() {
    let hub = LocalHub::new();
    let client = hub_client(&hub).await;

    let _provider = provide_cmd(&client, "broken", "main", "explode", |_| {
        Err(CmdFailure {
            kind: "HardwareFault".into(),
            message: "relay stuck".into(),
        })
    });

    let rpc = RpcClient::new(
        client.clone(),
        origin(),
        Duration::from_millis(500),
        Duration::from_secs(2),
    );
    let err = rpc.call("broken", "main", "explode", json!({})).await.unwrap_err();
    match err {
        RpcError::Remote { kind, message, .. } => {
            assert_eq!(kind, "HardwareFault");
            assert_eq!(message, "relay stuck");
        }
        other => panic!("expected remote error, got {other:?}"),
    }

    client.stop().await;
}

#[tokio::test]
async fn call_to_absent_target_times_out_within_tolerance() {
    let hub = LocalHub::new();
    let client = hub_client(&hub).await;

    let res_timeout = Duration::from_millis(400);
    let rpc = RpcClient::new(
        client.clone(),
        origin(),
        Duration::from_millis(100),
        res_timeout,
    );

    let started = std::time::Instant::now();
    let err = rpc.call("ghost", "main", "noop", json!({})).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, RpcError::Timeout { .. }), "got {err:?}");
    assert!(elapsed >= res_timeout, "returned too early: {elapsed:?}");
    assert!(
        elapsed < res_timeout * 2,
        "returned far too late: {elapsed:?}"
    );

    client.stop().await;
}

#[tokio::test]
async fn two_calls_to_one_target_complete_independently() {
    let hub = LocalHub::new();
    let client = hub_client(&hub).await;

    let _provider = provide_cmd(&client, "adder", "main", "add", |args| {
        let a = args["a"].as_i64().unwrap_or(0);
        let b = args["b"].as_i64().unwrap_or(0);
        Ok(json!(a + b))
    });

    let rpc = Arc::new(RpcClient::new(
        client.clone(),
        origin(),
        Duration::from_millis(500),
        Duration::from_secs(2),
    ));

    let first = {
        let rpc = rpc.clone();
        tokio::spawn(async move { rpc.call("adder", "main", "add", json!({"a": 1, "b": 2})).await })
    };
    let second = {
        let rpc = rpc.clone();
        tokio::spawn(async move { rpc.call("adder", "main", "add", json!({"a": 3, "b": 4})).await })
    };

    assert_eq!(first.await.unwrap().unwrap(), json!(3));
    assert_eq!(second.await.unwrap().unwrap(), json!(7));

    client.stop().await;
}

#[tokio::test]
async fn argument_validation_rejects_before_publishing() {
    let hub = LocalHub::new();
    let client = hub_client(&hub).await;

    let rpc = RpcClient::new(
        client.clone(),
        origin(),
        Duration::from_millis(500),
        Duration::from_secs(2),
    )
    .with_validation(
        Arc::new(|_cmd, args: &Value| {
            if args.get("value").is_some_and(Value::is_i64) {
                Ok(())
            } else {
                Err("'value' must be an integer".into())
            }
        }),
        Arc::new(|_cmd, _result: &Value| Ok(())),
    );

    let err = rpc
        .call("any", "main", "set", json!({"value": "nope"}))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Validation { .. }), "got {err:?}");
    // nothing was published for the rejected call
    assert_eq!(client.stats().published, 0);

    client.stop().await;
}

#[tokio::test]
async fn broker_shutdown_cancels_pending_call() {
    let hub = LocalHub::new();
    let client = hub_client(&hub).await;

    let rpc = RpcClient::new(
        client.clone(),
        origin(),
        Duration::from_secs(5),
        Duration::from_secs(30),
    );

    let call = tokio::spawn({
        let client = client.clone();
        async move {
            let outcome = rpc.call("ghost", "main", "noop", json!({})).await;
            drop(client);
            outcome
        }
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    client.stop().await;

    let err = tokio::time::timeout(Duration::from_secs(2), call)
        .await
        .expect("call did not observe shutdown")
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, RpcError::Shutdown { .. }), "got {err:?}");
}
