use std::sync::Mutex;

use super::*;
use crate::stream::{IncompleteReason, StreamEvent, StreamSubscription};
use frames::Frame;
use serde_json::json;
use tokio::io::DuplexStream;
use tokio_tungstenite::tungstenite::protocol::Role;

const IDLE: Duration = Duration::from_millis(500);
const SWEEP: Duration = Duration::from_millis(100);

fn idle_channel() -> Arc<Channel> {
    Arc::new(Channel::new(&ClientConfig {
        stream_idle_timeout: IDLE,
        stream_sweep_interval: SWEEP,
        ..ClientConfig::default()
    }))
}

fn collect_streams(channel: &Channel) -> (Arc<Mutex<Vec<StreamEvent>>>, StreamSubscription) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let sub = channel
        .streams()
        .subscribe(move |event| sink.lock().expect("events").push(event.clone()));
    (events, sub)
}

async fn socket_pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
    let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
    (client, server)
}

async fn send_chunk(server: &mut WebSocketStream<DuplexStream>, stream_id: &str, chunk: &str, is_final: bool) {
    let frame = Frame::chunk("partialMessage", stream_id, json!(chunk), is_final);
    let text = frames::encode_frame(&frame).expect("encode");
    server.send(Message::Text(text.into())).await.expect("server send");
}

fn ended_idle(events: &Mutex<Vec<StreamEvent>>, expected_text: &str) -> bool {
    matches!(
        events.lock().expect("events").last(),
        Some(StreamEvent::Incomplete { result, reason: IncompleteReason::Idle }) if result.text() == expected_text
    )
}

#[tokio::test(start_paused = true)]
async fn reader_sweep_reports_idle_stream_on_live_link() {
    let channel = idle_channel();
    let (events, _sub) = collect_streams(&channel);
    let (client_ws, mut server_ws) = socket_pair().await;
    let _link = spawn_link(Arc::clone(&channel), client_ws, SWEEP);

    send_chunk(&mut server_ws, "answer-1", "Hel", false).await;
    tokio::time::sleep(IDLE * 4).await;

    assert!(ended_idle(&events, "Hel"));
    assert_eq!(channel.streams().open_streams(), 0);
    assert!(channel.is_connected());
}

#[tokio::test(start_paused = true)]
async fn reader_sweep_keeps_active_stream_open() {
    let channel = idle_channel();
    let (events, _sub) = collect_streams(&channel);
    let (client_ws, mut server_ws) = socket_pair().await;
    let _link = spawn_link(Arc::clone(&channel), client_ws, SWEEP);

    for chunk in ["a", "b", "c", "d"] {
        send_chunk(&mut server_ws, "answer-1", chunk, false).await;
        tokio::time::sleep(IDLE / 2).await;
    }
    assert!(channel.streams().is_open("answer-1"));

    send_chunk(&mut server_ws, "answer-1", "e", true).await;
    tokio::time::sleep(SWEEP).await;
    assert!(matches!(
        events.lock().expect("events").last(),
        Some(StreamEvent::Complete(result)) if result.text() == "abcde"
    ));
}

#[tokio::test(start_paused = true)]
async fn idle_stream_is_still_reported_after_link_closes() {
    let channel = idle_channel();
    let (events, _sub) = collect_streams(&channel);
    let (client_ws, mut server_ws) = socket_pair().await;
    let link = spawn_link(Arc::clone(&channel), client_ws, SWEEP);

    send_chunk(&mut server_ws, "answer-1", "Hel", false).await;
    server_ws.close(None).await.expect("server close");
    link.closed().await;

    assert!(!channel.is_connected());
    assert!(channel.streams().is_open("answer-1"));

    tokio::time::sleep(IDLE * 4).await;
    assert!(ended_idle(&events, "Hel"));
    assert_eq!(channel.streams().open_streams(), 0);
}
