//! RPC session tests over a raw duplex pipe: call/response correlation,
//! notifications, cancellation, and failure envelopes.

use std::time::Duration;

use flowersec::frame;
use flowersec::observer::ObserverCell;
use flowersec::rpc::{self, CallError, ErrorBody, Router, RpcConfig};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn attach_pair(
    server_router: Router,
    client_router: Router,
) -> (rpc::RpcClient, rpc::RpcClient, CancellationToken) {
    let token = CancellationToken::new();
    let (cio, sio) = tokio::io::duplex(256 * 1024);
    let (client, _ctask) = rpc::attach(
        frame::framed(cio, frame::DEFAULT_MAX_FRAME),
        client_router.into_shared(),
        RpcConfig::default(),
        ObserverCell::default(),
        &token,
    );
    let (server, _stask) = rpc::attach(
        frame::framed(sio, frame::DEFAULT_MAX_FRAME),
        server_router.into_shared(),
        RpcConfig::default(),
        ObserverCell::default(),
        &token,
    );
    (client, server, token)
}

#[tokio::test]
async fn call_round_trip() {
    let mut router = Router::new();
    router.register(1, |_payload: Value| async move { Ok(json!({"ok": true})) });
    let (client, _server, _token) = attach_pair(router, Router::new());

    let out = client.call(1, json!({})).await.unwrap();
    assert_eq!(out, json!({"ok": true}));
}

#[tokio::test]
async fn unknown_type_id_yields_structured_error() {
    let (client, _server, _token) = attach_pair(Router::new(), Router::new());
    let err = client.call(42, json!({})).await.unwrap_err();
    match err {
        CallError::Rpc(body) => assert_eq!(body.code, rpc::CODE_UNKNOWN_TYPE_ID),
        other => panic!("expected rpc error, got {other:?}"),
    }
}

#[tokio::test]
async fn handler_errors_travel_back() {
    let mut router = Router::new();
    router.register(9, |_p: Value| async move {
        Err::<Value, _>(ErrorBody::new("teapot").with_message("cannot brew"))
    });
    let (client, _server, _token) = attach_pair(router, Router::new());

    match client.call(9, json!({})).await.unwrap_err() {
        CallError::Rpc(body) => {
            assert_eq!(body.code, "teapot");
            assert_eq!(body.message.as_deref(), Some("cannot brew"));
        }
        other => panic!("expected rpc error, got {other:?}"),
    }
}

async fn panicking_handler(_p: Value) -> Result<Value, ErrorBody> {
    panic!("handler bug")
}

#[tokio::test]
async fn panicking_handler_becomes_internal_error() {
    let mut router = Router::new();
    router.register(3, panicking_handler);
    let (client, _server, _token) = attach_pair(router, Router::new());

    match client.call(3, json!({})).await.unwrap_err() {
        CallError::Rpc(body) => assert_eq!(body.code, rpc::CODE_INTERNAL_ERROR),
        other => panic!("expected rpc error, got {other:?}"),
    }
}

#[tokio::test]
async fn notify_reaches_subscriber_quickly() {
    let (client, server, _token) = attach_pair(Router::new(), Router::new());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _sub = client.on_notify(2, move |payload| {
        let _ = tx.send(payload);
    });

    server.notify(2, json!({"hello": "world"})).await.unwrap();

    let got = tokio::time::timeout(Duration::from_millis(100), rx.recv())
        .await
        .expect("notification within 100ms")
        .expect("payload");
    assert_eq!(got, json!({"hello": "world"}));
}

#[tokio::test]
async fn unsubscribe_is_immediate() {
    let (client, server, _token) = attach_pair(Router::new(), Router::new());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let sub = client.on_notify(2, move |payload| {
        let _ = tx.send(payload);
    });
    sub.unsubscribe();

    server.notify(2, json!(1)).await.unwrap();
    // Give the frame time to arrive; nothing may be delivered.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn multiple_subscribers_and_order() {
    let (client, server, _token) = attach_pair(Router::new(), Router::new());

    let (tx_a, mut rx_a) = mpsc::unbounded_channel();
    let (tx_b, mut rx_b) = mpsc::unbounded_channel();
    let _sub_a = client.on_notify(5, move |p| {
        let _ = tx_a.send(p);
    });
    let _sub_b = client.on_notify(5, move |p| {
        let _ = tx_b.send(p);
    });

    for i in 0..10 {
        server.notify(5, json!(i)).await.unwrap();
    }
    for i in 0..10 {
        assert_eq!(rx_a.recv().await.unwrap(), json!(i));
        assert_eq!(rx_b.recv().await.unwrap(), json!(i));
    }
}

#[tokio::test]
async fn close_cancels_outstanding_calls() {
    let mut router = Router::new();
    router.register(7, |_p: Value| async move {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(Value::Null)
    });
    let (client, _server, _token) = attach_pair(router, Router::new());

    let caller = client.clone();
    let pending = tokio::spawn(async move { caller.call(7, json!({})).await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    client.close();
    let outcome = tokio::time::timeout(Duration::from_millis(500), pending)
        .await
        .expect("cancellation must be prompt")
        .unwrap();
    assert!(outcome.unwrap_err().is_canceled());
}

#[tokio::test]
async fn per_call_timeout_applies() {
    let mut router = Router::new();
    router.register(8, |_p: Value| async move {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(Value::Null)
    });
    let (client, _server, _token) = attach_pair(router, Router::new());

    let err = client
        .call_with_timeout(8, json!({}), Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    match err {
        CallError::Transport(e) => {
            assert_eq!(e.code, flowersec::error::ErrorCode::Timeout)
        }
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn responses_complete_out_of_order() {
    let mut router = Router::new();
    router.register(10, |_p: Value| async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        Ok(json!("slow"))
    });
    router.register(11, |_p: Value| async move { Ok(json!("fast")) });
    let (client, _server, _token) = attach_pair(router, Router::new());

    let slow_client = client.clone();
    let slow = tokio::spawn(async move { slow_client.call(10, json!({})).await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    let fast = client.call(11, json!({})).await.unwrap();
    assert_eq!(fast, json!("fast"));
    assert_eq!(slow.await.unwrap().unwrap(), json!("slow"));
}

#[tokio::test]
async fn both_directions_call_on_one_stream() {
    let mut server_router = Router::new();
    server_router.register(1, |_p: Value| async move { Ok(json!("from server handler")) });
    let mut client_router = Router::new();
    client_router.register(2, |_p: Value| async move { Ok(json!("from client handler")) });

    let (client, server, _token) = attach_pair(server_router, client_router);

    assert_eq!(
        client.call(1, json!({})).await.unwrap(),
        json!("from server handler")
    );
    assert_eq!(
        server.call(2, json!({})).await.unwrap(),
        json!("from client handler")
    );
}
