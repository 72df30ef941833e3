#![forbid(unsafe_code)]

use std::time::Duration;

use agora_domain::{MessageText, PublicMessage, SessionId, now_millis};
use tokio::time::timeout;

use crate::server::events::OutboundEvent;
use crate::server::hub::{BroadcastReport, ConnectionHub, ConnectionHubConfig, DeliveryError, HubItem};

fn sid(s: &str) -> SessionId {
	SessionId::new(s).expect("valid SessionId")
}

fn mk_message(from: &str, text: &str) -> OutboundEvent {
	OutboundEvent::ReceiveMessage(PublicMessage::new(
		sid(from),
		MessageText::new(text).expect("valid text"),
		now_millis(),
	))
}

fn hub(capacity: usize) -> ConnectionHub {
	ConnectionHub::new(ConnectionHubConfig {
		subscriber_queue_capacity: capacity,
		debug_logs: false,
	})
}

fn text_of(item: HubItem) -> String {
	match item {
		HubItem::Event(ev) => match *ev {
			OutboundEvent::ReceiveMessage(m) => m.text.as_str().to_string(),
			other => panic!("expected ReceiveMessage, got: {other:?}"),
		},
		other => panic!("expected Event item, got: {other:?}"),
	}
}

#[tokio::test]
async fn send_to_reaches_only_the_addressed_connection() {
	let hub = hub(16);
	let mut rx_a = hub.attach(sid("a")).await;
	let mut rx_b = hub.attach(sid("b")).await;

	hub.send_to(&sid("b"), mk_message("a", "for-b")).await.expect("deliver");

	let got_unexpected = timeout(Duration::from_millis(50), rx_a.recv()).await;
	assert!(got_unexpected.is_err(), "connection a unexpectedly received a unicast for b");

	let item = timeout(Duration::from_millis(250), rx_b.recv())
		.await
		.expect("expected to receive within timeout")
		.expect("channel open");
	assert_eq!(text_of(item), "for-b");
}

#[tokio::test]
async fn send_to_all_reaches_every_live_connection() {
	let hub = hub(16);
	let mut rxs = vec![
		hub.attach(sid("a")).await,
		hub.attach(sid("b")).await,
		hub.attach(sid("c")).await,
	];

	let report = hub.send_to_all(mk_message("a", "hello")).await;
	assert_eq!(
		report,
		BroadcastReport {
			delivered: 3,
			dropped: 0
		}
	);

	for rx in &mut rxs {
		let item = timeout(Duration::from_millis(250), rx.recv())
			.await
			.expect("expected to receive within timeout")
			.expect("channel open");
		assert_eq!(text_of(item), "hello");
		assert!(rx.try_recv().is_err(), "expected exactly one item");
	}
}

#[tokio::test]
async fn dropped_receivers_are_not_connected() {
	let hub = hub(16);

	{
		let _rx = hub.attach(sid("a")).await;
	}

	assert!(!hub.is_connected(&sid("a")).await);
	assert_eq!(hub.connection_count().await, 0);
	assert_eq!(
		hub.send_to(&sid("a"), mk_message("b", "x")).await,
		Err(DeliveryError::NotConnected(sid("a")))
	);

	let report = hub.send_to_all(mk_message("b", "y")).await;
	assert_eq!(report.delivered, 0);
}

#[tokio::test]
async fn detach_removes_connection() {
	let hub = hub(16);
	let _rx = hub.attach(sid("a")).await;
	assert!(hub.is_connected(&sid("a")).await);

	assert!(hub.detach(&sid("a")).await);
	assert!(!hub.detach(&sid("a")).await);
	assert!(!hub.is_connected(&sid("a")).await);
}

#[tokio::test]
async fn bounded_queue_drops_and_emits_lagged_marker() {
	let hub = hub(1);
	let mut rx = hub.attach(sid("a")).await;

	hub.send_to_all(mk_message("x", "a-1")).await;
	let report = hub.send_to_all(mk_message("x", "a-2")).await;
	assert_eq!(report.dropped, 1);
	assert_eq!(
		hub.send_to(&sid("a"), mk_message("x", "a-3")).await,
		Err(DeliveryError::QueueFull(sid("a")))
	);

	let first = timeout(Duration::from_millis(250), rx.recv())
		.await
		.expect("expected first item")
		.expect("channel open");
	assert_eq!(text_of(first), "a-1");

	// Room for exactly one more item: the event goes in, the marker waits.
	hub.send_to_all(mk_message("x", "a-4")).await;
	let second = rx.recv().await.expect("channel open");
	assert_eq!(text_of(second), "a-4");

	hub.send_to_all(mk_message("x", "a-5")).await;
	let third = rx.recv().await.expect("channel open");
	assert_eq!(text_of(third), "a-5");
}

#[tokio::test]
async fn lagged_marker_follows_event_when_queue_has_room() {
	let hub = hub(4);
	let mut rx = hub.attach(sid("a")).await;

	for i in 0..6 {
		hub.send_to_all(mk_message("x", &format!("m{i}"))).await;
	}

	for i in 0..4 {
		assert_eq!(text_of(rx.recv().await.expect("channel open")), format!("m{i}"));
	}

	hub.send_to_all(mk_message("x", "after")).await;
	assert_eq!(text_of(rx.recv().await.expect("channel open")), "after");
	match rx.recv().await.expect("channel open") {
		HubItem::Lagged { dropped } => assert_eq!(dropped, 2),
		other => panic!("expected Lagged marker, got: {other:?}"),
	}
}
