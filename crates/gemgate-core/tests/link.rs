use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use gemgate_core::{AgentLink, LinkEvent, QueueError, QueueFrame};
use gemgate_protocol::control::{AgentCommand, ControlFrame};

const SHORT_GRACE: Duration = Duration::from_millis(50);

fn connect(link: &std::sync::Arc<AgentLink>) -> (u64, mpsc::Receiver<String>) {
    let (tx, rx) = mpsc::channel(16);
    let id = link.accept(tx);
    (id, rx)
}

#[tokio::test]
async fn frames_route_to_their_queue_in_order() {
    let link = AgentLink::new(SHORT_GRACE);
    let (_id, _rx) = connect(&link);
    let queue = link.open_queue("r1");

    link.route_frame(r#"{"event_type":"response_headers","request_id":"r1","status":200,"headers":{"content-type":"application/json"}}"#);
    link.route_frame(r#"{"event_type":"chunk","request_id":"r1","data":"hello"}"#);
    link.route_frame(r#"{"event_type":"stream_close","request_id":"r1"}"#);

    match queue.dequeue(Duration::from_millis(100)).await.unwrap() {
        QueueFrame::ResponseHeaders { status, headers } => {
            assert_eq!(status, 200);
            assert_eq!(
                headers.get("content-type").map(String::as_str),
                Some("application/json")
            );
        }
        other => panic!("unexpected frame {other:?}"),
    }
    assert_eq!(
        queue.dequeue(Duration::from_millis(100)).await.unwrap(),
        QueueFrame::Chunk("hello".to_string())
    );
    assert_eq!(
        queue.dequeue(Duration::from_millis(100)).await.unwrap(),
        QueueFrame::StreamEnd
    );
}

#[tokio::test]
async fn unknown_ids_and_garbage_are_dropped() {
    let link = AgentLink::new(SHORT_GRACE);
    let (_id, _rx) = connect(&link);
    let queue = link.open_queue("known");

    link.route_frame(r#"{"event_type":"chunk","request_id":"other","data":"x"}"#);
    link.route_frame("not json at all");
    assert_eq!(
        queue.dequeue(Duration::from_millis(50)).await.unwrap_err(),
        QueueError::Timeout
    );
}

#[tokio::test]
async fn reconnect_within_grace_preserves_queues() {
    let link = AgentLink::new(SHORT_GRACE);
    let (id, _rx) = connect(&link);
    let queue = link.open_queue("r1");

    link.connection_closed(id);
    assert!(!link.has_live_connection());

    tokio::time::sleep(Duration::from_millis(10)).await;
    let (_id2, _rx2) = connect(&link);
    assert!(link.has_live_connection());

    // Well past the original grace deadline the queue must still be live.
    tokio::time::sleep(SHORT_GRACE + Duration::from_millis(20)).await;
    link.route_frame(r#"{"event_type":"chunk","request_id":"r1","data":"still here"}"#);
    assert_eq!(
        queue.dequeue(Duration::from_millis(100)).await.unwrap(),
        QueueFrame::Chunk("still here".to_string())
    );
}

#[tokio::test]
async fn grace_expiry_closes_queues_and_broadcasts() {
    let link = AgentLink::new(SHORT_GRACE);
    let mut events = link.subscribe();
    let (id, _rx) = connect(&link);
    assert_eq!(
        timeout(Duration::from_millis(100), events.recv())
            .await
            .unwrap()
            .unwrap(),
        LinkEvent::Connected
    );

    let queue = link.open_queue("r1");
    link.connection_closed(id);

    let event = timeout(SHORT_GRACE * 4, events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event, LinkEvent::ConnectionLost);
    assert_eq!(
        queue.dequeue(Duration::from_millis(50)).await.unwrap_err(),
        QueueError::Closed
    );
}

#[tokio::test]
async fn stale_close_from_replaced_connection_is_ignored() {
    let link = AgentLink::new(SHORT_GRACE);
    let (old_id, _old_rx) = connect(&link);
    let (_new_id, _new_rx) = connect(&link);

    link.connection_closed(old_id);
    assert!(link.has_live_connection());

    let queue = link.open_queue("r1");
    tokio::time::sleep(SHORT_GRACE + Duration::from_millis(20)).await;
    assert!(!queue.is_closed());
}

#[tokio::test]
async fn descriptors_and_cancels_reach_the_connection() {
    let link = AgentLink::new(SHORT_GRACE);
    let (_id, mut rx) = connect(&link);

    link.send_cancel("r9").await.unwrap();
    let text = timeout(Duration::from_millis(100), rx.recv())
        .await
        .unwrap()
        .unwrap();
    let decoded: AgentCommand = serde_json::from_str(&text).unwrap();
    assert!(matches!(
        decoded,
        AgentCommand::Control(ControlFrame::CancelRequest { request_id }) if request_id == "r9"
    ));
}

#[tokio::test]
async fn session_switch_resolves_on_agent_ack() {
    let link = AgentLink::new(SHORT_GRACE);
    let (_id, mut rx) = connect(&link);

    let ack = link
        .begin_session_switch(3, serde_json::json!({"cookies": []}))
        .await
        .unwrap();

    // The switch frame went out on the wire.
    let text = timeout(Duration::from_millis(100), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(text.contains("switch_session"));

    link.route_frame(r#"{"event_type":"session_ready","index":3}"#);
    assert_eq!(
        timeout(Duration::from_millis(100), ack).await.unwrap().unwrap(),
        Ok(3)
    );
}

#[tokio::test]
async fn session_switch_failure_propagates_message() {
    let link = AgentLink::new(SHORT_GRACE);
    let (_id, mut _rx) = connect(&link);

    let ack = link
        .begin_session_switch(4, serde_json::json!({}))
        .await
        .unwrap();
    link.route_frame(
        r#"{"event_type":"session_error","index":4,"message":"storage state has no cookies array"}"#,
    );
    let result = timeout(Duration::from_millis(100), ack).await.unwrap().unwrap();
    assert_eq!(
        result.unwrap_err(),
        "storage state has no cookies array".to_string()
    );
}
