//! End-to-end relay tests over real TCP with a scripted bridge peer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};

use voxrelay::bridge::codec;
use voxrelay::bridge::protocol::{
    ChatMessage, ChatResponseFrame, FileResponseFrame, Frame, RegisterFrame,
};
use voxrelay::bridge::{listener, BridgeRegistry};
use voxrelay::relay::{self, RelayError};

const TOKEN: &str = "test-token";

async fn start_server() -> (Arc<BridgeRegistry>, SocketAddr) {
    let registry = Arc::new(BridgeRegistry::new());
    let socket = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(listener::run(socket, registry.clone(), TOKEN.to_string()));
    (registry, addr)
}

async fn connect_bridge(addr: SocketAddr, name: &str) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let register = Frame::Register(RegisterFrame {
        name: name.to_string(),
        token: TOKEN.to_string(),
    });
    codec::write_frame(&mut stream, &register).await.unwrap();
    stream
}

async fn wait_for_instances(registry: &BridgeRegistry, expected: usize) {
    for _ in 0..200 {
        if registry.len() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("registry never reached {expected} instance(s)");
}

fn user_message(content: &str) -> Vec<ChatMessage> {
    vec![ChatMessage {
        role: "user".to_string(),
        content: content.to_string(),
    }]
}

fn delta(request_id: &str, delta: &str, done: bool) -> Frame {
    Frame::ChatResponse(ChatResponseFrame {
        request_id: request_id.to_string(),
        delta: delta.to_string(),
        done,
    })
}

async fn expect_chat_request(bridge: &mut TcpStream) -> String {
    match codec::read_frame(bridge).await.unwrap() {
        Frame::ChatRequest(req) => req.request_id,
        other => panic!("expected chat_request, got {other:?}"),
    }
}

#[tokio::test]
async fn test_happy_path_streams_deltas_in_order() {
    let (registry, addr) = start_server().await;
    let mut bridge = connect_bridge(addr, "b1").await;
    wait_for_instances(&registry, 1).await;
    let instance_id = registry.list()[0].id.clone();

    let mut output = relay::spawn_relay(
        registry.clone(),
        instance_id,
        "req-happy".to_string(),
        user_message("hi"),
        String::new(),
    );

    let request_id = expect_chat_request(&mut bridge).await;
    assert_eq!(request_id, "req-happy");

    codec::write_frame(&mut bridge, &delta("req-happy", "he", false))
        .await
        .unwrap();
    codec::write_frame(&mut bridge, &delta("req-happy", "llo", false))
        .await
        .unwrap();
    codec::write_frame(&mut bridge, &delta("req-happy", "", true))
        .await
        .unwrap();

    assert_eq!(output.deltas.recv().await.unwrap(), "he");
    assert_eq!(output.deltas.recv().await.unwrap(), "llo");
    // `done` closes the delta stream.
    assert!(output.deltas.recv().await.is_none());
}

#[tokio::test]
async fn test_file_events_delivered_after_done() {
    let (registry, addr) = start_server().await;
    let mut bridge = connect_bridge(addr, "b1").await;
    wait_for_instances(&registry, 1).await;
    let instance_id = registry.list()[0].id.clone();

    let mut output = relay::spawn_relay(
        registry.clone(),
        instance_id,
        "req-file".to_string(),
        user_message("draw me a chart"),
        String::new(),
    );
    expect_chat_request(&mut bridge).await;

    codec::write_frame(&mut bridge, &delta("req-file", "done!", true))
        .await
        .unwrap();

    // Artifact materializes a little after the reply text ends.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let file = Frame::FileResponse(FileResponseFrame {
        request_id: "req-file".to_string(),
        url: "/files/chart.png".to_string(),
        filename: "chart.png".to_string(),
        size: 1234,
    });
    codec::write_frame(&mut bridge, &file).await.unwrap();

    assert_eq!(output.deltas.recv().await.unwrap(), "done!");
    assert!(output.deltas.recv().await.is_none());

    let event = output.files.recv().await.unwrap();
    assert_eq!(event.filename, "chart.png");
    assert_eq!(event.size, 1234);
}

#[tokio::test]
async fn test_bridge_crash_mid_stream_surfaces_disconnect() {
    let (registry, addr) = start_server().await;
    let mut bridge = connect_bridge(addr, "b1").await;
    wait_for_instances(&registry, 1).await;
    let instance_id = registry.list()[0].id.clone();

    let mut output = relay::spawn_relay(
        registry.clone(),
        instance_id,
        "req-crash".to_string(),
        user_message("hi"),
        String::new(),
    );
    expect_chat_request(&mut bridge).await;

    codec::write_frame(&mut bridge, &delta("req-crash", "he", false))
        .await
        .unwrap();
    assert_eq!(output.deltas.recv().await.unwrap(), "he");

    drop(bridge);

    let err = tokio::time::timeout(Duration::from_secs(1), output.errors.recv())
        .await
        .expect("disconnect must surface within a second")
        .unwrap();
    assert!(matches!(err, RelayError::BridgeDisconnected));
    assert_eq!(err.to_string(), "bridge disconnected");

    wait_for_instances(&registry, 0).await;
}

#[tokio::test]
async fn test_concurrent_requests_are_isolated() {
    let (registry, addr) = start_server().await;
    let mut bridge = connect_bridge(addr, "b1").await;
    wait_for_instances(&registry, 1).await;
    let instance_id = registry.list()[0].id.clone();

    let mut first = relay::spawn_relay(
        registry.clone(),
        instance_id.clone(),
        "req-a".to_string(),
        user_message("one"),
        String::new(),
    );
    let mut second = relay::spawn_relay(
        registry.clone(),
        instance_id,
        "req-b".to_string(),
        user_message("two"),
        String::new(),
    );

    // Both requests land on the same session, in either order.
    let mut seen = vec![
        expect_chat_request(&mut bridge).await,
        expect_chat_request(&mut bridge).await,
    ];
    seen.sort();
    assert_eq!(seen, vec!["req-a".to_string(), "req-b".to_string()]);

    // Interleave replies addressed to different requests.
    codec::write_frame(&mut bridge, &delta("req-b", "beta", false))
        .await
        .unwrap();
    codec::write_frame(&mut bridge, &delta("req-a", "alpha", false))
        .await
        .unwrap();

    assert_eq!(first.deltas.recv().await.unwrap(), "alpha");
    assert_eq!(second.deltas.recv().await.unwrap(), "beta");
    assert!(first.deltas.try_recv().is_err());
    assert!(second.deltas.try_recv().is_err());
}

#[tokio::test]
async fn test_unknown_instance_fails_fast() {
    let (registry, _addr) = start_server().await;

    let mut output = relay::spawn_relay(
        registry,
        "nope".to_string(),
        "req-x".to_string(),
        user_message("hi"),
        String::new(),
    );

    let err = output.errors.recv().await.unwrap();
    assert!(matches!(err, RelayError::InstanceNotFound));
}

#[tokio::test]
async fn test_chat_error_frame_terminates_request() {
    let (registry, addr) = start_server().await;
    let mut bridge = connect_bridge(addr, "b1").await;
    wait_for_instances(&registry, 1).await;
    let instance_id = registry.list()[0].id.clone();

    let mut output = relay::spawn_relay(
        registry.clone(),
        instance_id,
        "req-err".to_string(),
        user_message("hi"),
        String::new(),
    );
    expect_chat_request(&mut bridge).await;

    let error = Frame::ChatError(voxrelay::bridge::protocol::ChatErrorFrame {
        request_id: "req-err".to_string(),
        error: "model exploded".to_string(),
    });
    codec::write_frame(&mut bridge, &error).await.unwrap();

    let err = output.errors.recv().await.unwrap();
    assert_eq!(err.to_string(), "chat error: model exploded");
}

#[tokio::test]
async fn test_wrong_token_never_registers() {
    let (registry, addr) = start_server().await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let register = Frame::Register(RegisterFrame {
        name: "intruder".to_string(),
        token: "wrong".to_string(),
    });
    codec::write_frame(&mut stream, &register).await.unwrap();

    // The server closes the connection without servicing it.
    let read = tokio::time::timeout(Duration::from_secs(2), codec::read_frame(&mut stream)).await;
    assert!(matches!(read, Ok(Err(_))));
    assert_eq!(registry.len(), 0);
}

#[tokio::test]
async fn test_first_frame_must_be_register() {
    let (registry, addr) = start_server().await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    codec::write_frame(&mut stream, &Frame::Heartbeat)
        .await
        .unwrap();

    let read = tokio::time::timeout(Duration::from_secs(2), codec::read_frame(&mut stream)).await;
    assert!(matches!(read, Ok(Err(_))));
    assert_eq!(registry.len(), 0);
}

#[tokio::test]
async fn test_heartbeat_keeps_session_listed() {
    let (registry, addr) = start_server().await;
    let mut bridge = connect_bridge(addr, "b1").await;
    wait_for_instances(&registry, 1).await;

    codec::write_frame(&mut bridge, &Frame::Heartbeat)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let list = registry.list();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].name, "b1");
}
