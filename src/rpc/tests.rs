//! RPC Transport Tests
//!
//! Exercises the call/register surface over real loopback sockets:
//! typed arity coverage, out-of-order completion, unknown-method handling,
//! and disconnect propagation to outstanding calls.

use super::{RpcClient, RpcServer};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};

async fn start_server() -> Arc<RpcServer> {
    let server = RpcServer::bind("127.0.0.1", 0).await.expect("bind server");
    server.start();
    server
}

async fn connect_client(server: &RpcServer) -> RpcClient {
    let client = RpcClient::connect("127.0.0.1", server.port())
        .await
        .expect("connect client");
    client.start();
    client
}

// ============================================================
// TYPED CALL SURFACE
// ============================================================

#[tokio::test]
async fn call_all_arities() {
    let server = start_server().await;
    server.register("addArgs0", || async { 11i64 });
    server.register("addArgs1", |a: i64| async move { a + 1 });
    server.register("addArgs2", |a: i64, b: i64| async move { a + b });
    server.register("addArgs3", |a: i64, b: i64, c: i64| async move { a + b + c });
    server.register("addArgs4", |a: i64, b: i64, c: i64, d: i64| async move {
        a + b + c + d
    });
    server.register(
        "addArgs5",
        |a: i64, b: i64, c: i64, d: i64, e: i64| async move { a + b + c + d + e },
    );

    let client = connect_client(&server).await;

    assert_eq!(client.call::<i64, _>("addArgs0", ()).await, 11);
    assert_eq!(client.call::<i64, _>("addArgs1", (1i64,)).await, 2);
    assert_eq!(client.call::<i64, _>("addArgs2", (3i64, 4i64)).await, 7);
    assert_eq!(client.call::<i64, _>("addArgs3", (1i64, 2i64, 3i64)).await, 6);
    assert_eq!(
        client.call::<i64, _>("addArgs4", (1i64, 2i64, 3i64, 4i64)).await,
        10
    );
    assert_eq!(
        client
            .call::<i64, _>("addArgs5", (1i64, 2i64, 3i64, 4i64, 5i64))
            .await,
        15
    );
}

#[tokio::test]
async fn call_with_strings_and_blobs() {
    let server = start_server().await;
    server.register("toUpper", |s: String| async move { s.to_uppercase() });
    server.register("sum", |values: Vec<i64>| async move {
        values.iter().sum::<i64>()
    });
    server.register("echoBlob", |blob: Vec<u8>| async move { blob });

    let client = connect_client(&server).await;

    assert_eq!(
        client
            .call::<String, _>("toUpper", ("string".to_string(),))
            .await,
        "STRING"
    );
    assert_eq!(
        client.call::<i64, _>("sum", (vec![1i64, 2, 3, 4, 5],)).await,
        15
    );
    let blob = vec![0u8, 1, 2, 255];
    assert_eq!(
        client.call::<Vec<u8>, _>("echoBlob", (blob.clone(),)).await,
        blob
    );
}

#[tokio::test]
#[should_panic(expected = "registered twice")]
async fn duplicate_registration_panics() {
    let server = RpcServer::bind("127.0.0.1", 0).await.unwrap();
    server.register("dup", || async { 0i64 });
    server.register("dup", || async { 1i64 });
}

// ============================================================
// ORDERING AND MULTIPLEXING
// ============================================================

#[tokio::test]
async fn responses_complete_out_of_order() {
    let server = start_server().await;
    server.register("slow", || async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        1u32
    });
    server.register("fast", || async { 2u32 });

    let client = connect_client(&server).await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let slow_client = client.clone();
    let slow_tx = tx.clone();
    tokio::spawn(async move {
        let value = slow_client.call::<u32, _>("slow", ()).await;
        let _ = slow_tx.send(("slow", value));
    });
    // Give the slow request a head start on the wire.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let fast_client = client.clone();
    tokio::spawn(async move {
        let value = fast_client.call::<u32, _>("fast", ()).await;
        let _ = tx.send(("fast", value));
    });

    let first = rx.recv().await.expect("first completion");
    let second = rx.recv().await.expect("second completion");
    assert_eq!(first, ("fast", 2), "the fast call must not wait for the slow one");
    assert_eq!(second, ("slow", 1));
}

#[tokio::test]
async fn many_concurrent_calls_all_match() {
    let server = start_server().await;
    server.register("double", |v: u64| async move { v * 2 });

    let client = connect_client(&server).await;
    let mut handles = Vec::new();
    for v in 0..64u64 {
        let client = client.clone();
        handles.push(tokio::spawn(
            async move { client.call::<u64, _>("double", (v,)).await },
        ));
    }
    for (v, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.await.unwrap(), v as u64 * 2);
    }
}

// ============================================================
// FAILURE PATHS
// ============================================================

#[tokio::test]
async fn unknown_method_disconnects_and_resolves_sentinel() {
    let server = start_server().await;
    server.register("known", || async { 1i64 });

    let client = connect_client(&server).await;
    let disconnected = Arc::new(Notify::new());
    let notify = disconnected.clone();
    client.set_disconnect_callback(move || notify.notify_one());

    let value = client.call::<String, _>("missingFunc", ()).await;
    assert_eq!(value, String::default(), "sentinel for a dropped call");

    tokio::time::timeout(Duration::from_secs(2), disconnected.notified())
        .await
        .expect("server must drop the connection on an unknown method");
    assert!(!client.is_connected());
}

#[tokio::test]
async fn server_shutdown_fails_outstanding_calls() {
    let server = start_server().await;
    server.register("hang", || async {
        tokio::time::sleep(Duration::from_secs(60)).await;
        7u64
    });

    let client = connect_client(&server).await;
    let call_client = client.clone();
    let outstanding =
        tokio::spawn(async move { call_client.call::<u64, _>("hang", ()).await });

    // Let the request reach the server, then tear the server down.
    tokio::time::sleep(Duration::from_millis(100)).await;
    server.shutdown();

    let value = tokio::time::timeout(Duration::from_secs(2), outstanding)
        .await
        .expect("outstanding call must resolve on disconnect")
        .unwrap();
    assert_eq!(value, 0, "failure sentinel is the default value");
}

#[tokio::test]
async fn client_disconnect_fails_outstanding_calls() {
    let server = start_server().await;
    server.register("hang", || async {
        tokio::time::sleep(Duration::from_secs(60)).await;
        true
    });

    let client = connect_client(&server).await;
    let fired = Arc::new(AtomicBool::new(false));
    let flag = fired.clone();
    client.set_disconnect_callback(move || flag.store(true, Ordering::SeqCst));

    let call_client = client.clone();
    let outstanding =
        tokio::spawn(async move { call_client.call::<bool, _>("hang", ()).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    client.disconnect().await;
    let value = tokio::time::timeout(Duration::from_secs(2), outstanding)
        .await
        .expect("call resolves after disconnect")
        .unwrap();
    assert!(!value);
    assert!(fired.load(Ordering::SeqCst), "disconnect callback fires once");

    // Calls after disconnect resolve to the sentinel immediately.
    assert!(!client.call::<bool, _>("hang", ()).await);
}

#[tokio::test]
async fn accept_callback_owns_the_connection() {
    let server = RpcServer::bind("127.0.0.1", 0).await.unwrap();
    server.register("ping", || async { true });

    let (conn_tx, mut conn_rx) = mpsc::unbounded_channel();
    server.set_accept_callback(move |conn| {
        conn.start();
        let _ = conn_tx.send(conn);
    });
    server.start();

    let client = connect_client(&server).await;
    assert!(client.call::<bool, _>("ping", ()).await);

    let conn = tokio::time::timeout(Duration::from_secs(2), conn_rx.recv())
        .await
        .unwrap()
        .expect("accept callback received the connection");

    let disconnected = Arc::new(Notify::new());
    let notify = disconnected.clone();
    client.set_disconnect_callback(move || notify.notify_one());

    // The application owns the connection now; dropping it closes the socket.
    drop(conn);
    tokio::time::timeout(Duration::from_secs(2), disconnected.notified())
        .await
        .expect("dropping the server-side handle disconnects the client");
}
