use std::sync::Mutex;

use super::*;
use serde_json::json;

fn collecting(aggregator: &StreamAggregator) -> (Arc<Mutex<Vec<StreamEvent>>>, StreamSubscription) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let sub = aggregator.subscribe(move |event| sink.lock().expect("events").push(event.clone()));
    (events, sub)
}

#[test]
fn partial_then_final_yields_one_complete_result() {
    let aggregator = StreamAggregator::new(Duration::from_secs(30), true);
    let (events, _sub) = collecting(&aggregator);

    assert_eq!(aggregator.append("s1", "aiOutput", json!("a"), false), 1);
    assert!(aggregator.is_open("s1"));
    assert_eq!(aggregator.append("s1", "aiOutput", json!("b"), true), 2);
    assert!(!aggregator.is_open("s1"));

    let events = events.lock().expect("events");
    assert_eq!(events.len(), 2);
    assert!(matches!(
        &events[0],
        StreamEvent::Partial { stream_id, chunk, received: 1, .. } if stream_id == "s1" && *chunk == json!("a")
    ));
    let StreamEvent::Complete(result) = &events[1] else {
        panic!("expected completion, got {:?}", events[1]);
    };
    assert_eq!(result.kind, "aiOutput");
    assert_eq!(result.text(), "ab");
}

#[test]
fn partials_can_be_suppressed() {
    let aggregator = StreamAggregator::new(Duration::from_secs(30), false);
    let (events, _sub) = collecting(&aggregator);

    aggregator.append("s1", "aiOutput", json!("a"), false);
    aggregator.append("s1", "aiOutput", json!("b"), false);
    assert!(events.lock().expect("events").is_empty());

    aggregator.append("s1", "aiOutput", json!("c"), true);
    let events = events.lock().expect("events");
    assert!(matches!(&events[..], [StreamEvent::Complete(r)] if r.text() == "abc"));
}

#[test]
fn single_final_chunk_completes_immediately() {
    let aggregator = StreamAggregator::new(Duration::from_secs(30), true);
    let (events, _sub) = collecting(&aggregator);

    aggregator.append("s1", "aiOutput", json!({"tokens": 3}), true);
    let events = events.lock().expect("events");
    assert!(matches!(&events[..], [StreamEvent::Complete(r)] if r.chunks == vec![json!({"tokens": 3})]));
    assert_eq!(aggregator.open_streams(), 0);
}

#[test]
fn interleaved_streams_stay_separate() {
    let aggregator = StreamAggregator::new(Duration::from_secs(30), false);
    let (events, _sub) = collecting(&aggregator);

    aggregator.append("x", "aiOutput", json!("1"), false);
    aggregator.append("y", "aiOutput", json!("A"), false);
    aggregator.append("x", "aiOutput", json!("2"), false);
    aggregator.append("y", "aiOutput", json!("B"), true);
    aggregator.append("x", "aiOutput", json!("3"), true);

    let texts: Vec<String> = events
        .lock()
        .expect("events")
        .iter()
        .filter_map(|event| match event {
            StreamEvent::Complete(result) => Some(format!("{}={}", result.stream_id, result.text())),
            _ => None,
        })
        .collect();
    assert_eq!(texts, vec!["y=AB", "x=123"]);
}

#[test]
fn idle_stream_is_discarded_as_incomplete() {
    let aggregator = StreamAggregator::new(Duration::from_millis(500), true);
    let (events, _sub) = collecting(&aggregator);

    aggregator.append("s1", "aiOutput", json!("a"), false);
    assert_eq!(aggregator.sweep_idle(Instant::now()), 0);
    assert_eq!(aggregator.sweep_idle(Instant::now() + Duration::from_secs(1)), 1);
    assert!(!aggregator.is_open("s1"));

    let events = events.lock().expect("events");
    assert!(matches!(
        events.last(),
        Some(StreamEvent::Incomplete { result, reason: IncompleteReason::Idle }) if result.text() == "a"
    ));
}

#[test]
fn chunk_after_idle_eviction_starts_fresh_stream() {
    let aggregator = StreamAggregator::new(Duration::from_millis(10), false);
    aggregator.append("s1", "aiOutput", json!("old"), false);
    aggregator.sweep_idle(Instant::now() + Duration::from_secs(1));

    let (events, _sub) = collecting(&aggregator);
    aggregator.append("s1", "aiOutput", json!("new"), true);
    let events = events.lock().expect("events");
    assert!(matches!(&events[..], [StreamEvent::Complete(r)] if r.text() == "new"));
}

#[test]
fn new_generation_discards_older_streams() {
    let aggregator = StreamAggregator::new(Duration::from_secs(30), false);
    let (events, _sub) = collecting(&aggregator);

    aggregator.advance_generation(1);
    aggregator.append("old", "aiOutput", json!("a"), false);
    assert_eq!(aggregator.advance_generation(2), 1);
    aggregator.append("new", "aiOutput", json!("b"), false);

    assert!(!aggregator.is_open("old"));
    assert!(aggregator.is_open("new"));
    let events = events.lock().expect("events");
    assert!(matches!(
        &events[..],
        [StreamEvent::Incomplete { reason: IncompleteReason::Superseded, .. }]
    ));
}

#[test]
fn panicking_listener_does_not_block_others() {
    let aggregator = StreamAggregator::new(Duration::from_secs(30), true);
    let _boom = aggregator.subscribe(|_event| panic!("listener failure"));
    let (events, _sub) = collecting(&aggregator);

    aggregator.append("s1", "aiOutput", json!("a"), true);
    assert_eq!(events.lock().expect("events").len(), 1);
}

#[test]
fn dropped_subscription_stops_delivery() {
    let aggregator = StreamAggregator::new(Duration::from_secs(30), true);
    let (events, sub) = collecting(&aggregator);
    drop(sub);

    aggregator.append("s1", "aiOutput", json!("a"), true);
    assert!(events.lock().expect("events").is_empty());
}

#[test]
fn text_renders_non_string_chunks_as_json() {
    let result = StreamResult {
        stream_id: "s".to_owned(),
        kind: "k".to_owned(),
        chunks: vec![json!("n="), json!(3)],
    };
    assert_eq!(result.text(), "n=3");
}
