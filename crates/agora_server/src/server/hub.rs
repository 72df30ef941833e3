#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use agora_domain::SessionId;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use crate::server::engine::Gateway;
use crate::server::events::OutboundEvent;

/// Registry of live connections and their bounded outbound queues.
#[derive(Debug, Clone)]
pub struct ConnectionHub {
	inner: Arc<Mutex<HashMap<SessionId, Subscriber>>>,
	cfg: ConnectionHubConfig,
}

/// Configuration for `ConnectionHub`.
#[derive(Debug, Clone)]
pub struct ConnectionHubConfig {
	/// Maximum number of queued items per connection.
	pub subscriber_queue_capacity: usize,

	pub debug_logs: bool,
}

impl Default for ConnectionHubConfig {
	fn default() -> Self {
		Self {
			subscriber_queue_capacity: 256,
			debug_logs: false,
		}
	}
}

/// Items emitted on a connection's queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubItem {
	Event(Box<OutboundEvent>),

	/// Items were dropped because the queue was full.
	Lagged { dropped: u64 },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
	#[error("session is not connected: {0}")]
	NotConnected(SessionId),
	#[error("outbound queue full for session: {0}")]
	QueueFull(SessionId),
}

/// Outcome of a broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
	pub delivered: usize,
	pub dropped: usize,
}

#[derive(Debug)]
struct Subscriber {
	tx: mpsc::Sender<HubItem>,
	pending_lag: u64,
}

enum Offer {
	Delivered,
	Full,
	Closed,
}

impl Subscriber {
	fn offer(&mut self, item: HubItem) -> Offer {
		match self.tx.try_send(item) {
			Ok(()) => {
				if self.pending_lag > 0
					&& self
						.tx
						.try_send(HubItem::Lagged {
							dropped: self.pending_lag,
						})
						.is_ok()
				{
					self.pending_lag = 0;
				}
				Offer::Delivered
			}
			Err(mpsc::error::TrySendError::Full(_)) => {
				self.pending_lag = self.pending_lag.saturating_add(1);
				Offer::Full
			}
			Err(mpsc::error::TrySendError::Closed(_)) => Offer::Closed,
		}
	}
}

impl ConnectionHub {
	pub fn new(cfg: ConnectionHubConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(HashMap::new())),
			cfg,
		}
	}

	/// Register a live connection and return its outbound queue.
	///
	/// Re-attaching an id replaces the previous queue.
	pub async fn attach(&self, id: SessionId) -> mpsc::Receiver<HubItem> {
		let (tx, rx) = mpsc::channel(self.cfg.subscriber_queue_capacity.max(1));

		let mut inner = self.inner.lock().await;
		prune_closed(&mut inner);
		inner.insert(id.clone(), Subscriber { tx, pending_lag: 0 });

		if self.cfg.debug_logs {
			debug!(session = %id, connections = inner.len(), "hub: attached");
		}

		rx
	}

	/// Returns true if the id was attached.
	pub async fn detach(&self, id: &SessionId) -> bool {
		let mut inner = self.inner.lock().await;
		let removed = inner.remove(id).is_some();

		if self.cfg.debug_logs && removed {
			debug!(session = %id, connections = inner.len(), "hub: detached");
		}

		removed
	}

	pub async fn is_connected(&self, id: &SessionId) -> bool {
		let inner = self.inner.lock().await;
		inner.get(id).is_some_and(|s| !s.tx.is_closed())
	}

	pub async fn connection_count(&self) -> usize {
		let inner = self.inner.lock().await;
		inner.values().filter(|s| !s.tx.is_closed()).count()
	}

	/// Enqueue an event for one connection.
	pub async fn send_to(&self, id: &SessionId, event: OutboundEvent) -> Result<(), DeliveryError> {
		let mut inner = self.inner.lock().await;
		let Some(sub) = inner.get_mut(id) else {
			return Err(DeliveryError::NotConnected(id.clone()));
		};

		match sub.offer(HubItem::Event(Box::new(event))) {
			Offer::Delivered => Ok(()),
			Offer::Full => {
				metrics::counter!("agora_hub_dropped_total").increment(1);
				Err(DeliveryError::QueueFull(id.clone()))
			}
			Offer::Closed => {
				inner.remove(id);
				Err(DeliveryError::NotConnected(id.clone()))
			}
		}
	}

	/// Enqueue an event for every live connection without waiting on any of them.
	pub async fn send_to_all(&self, event: OutboundEvent) -> BroadcastReport {
		let mut inner = self.inner.lock().await;
		let mut report = BroadcastReport::default();
		let mut closed = false;

		for sub in inner.values_mut() {
			match sub.offer(HubItem::Event(Box::new(event.clone()))) {
				Offer::Delivered => report.delivered += 1,
				Offer::Full => report.dropped += 1,
				Offer::Closed => closed = true,
			}
		}

		if closed {
			prune_closed(&mut inner);
		}

		if report.dropped > 0 {
			metrics::counter!("agora_hub_dropped_total").increment(report.dropped as u64);
			if self.cfg.debug_logs {
				debug!(
					dropped = report.dropped,
					kind = event.kind(),
					"hub: dropped due to full connection queues"
				);
			}
		}

		report
	}
}

fn prune_closed(inner: &mut HashMap<SessionId, Subscriber>) {
	inner.retain(|_, s| !s.tx.is_closed());
}

#[async_trait::async_trait]
impl Gateway for ConnectionHub {
	async fn attach(&self, id: SessionId) -> mpsc::Receiver<HubItem> {
		ConnectionHub::attach(self, id).await
	}

	async fn detach(&self, id: &SessionId) -> bool {
		ConnectionHub::detach(self, id).await
	}

	async fn is_connected(&self, id: &SessionId) -> bool {
		ConnectionHub::is_connected(self, id).await
	}

	async fn send_to(&self, id: &SessionId, event: OutboundEvent) -> Result<(), DeliveryError> {
		ConnectionHub::send_to(self, id, event).await
	}

	async fn send_to_all(&self, event: OutboundEvent) -> BroadcastReport {
		ConnectionHub::send_to_all(self, event).await
	}
}
