#![forbid(unsafe_code)]

use std::sync::Arc;

use agora_domain::{
	DisplayName, MessageText, PublicMessage, RosterEntry, SessionId, ValidationError, Whisper, now_millis,
};
use agora_protocol::codes;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::server::directory::SessionDirectory;
use crate::server::events::{InboundEvent, OutboundEvent};
use crate::server::history::{HistoryService, StoreError};
use crate::server::hub::{BroadcastReport, DeliveryError, HubItem};
use crate::util::time::not_before;

/// Delivery seam between the routing engine and whatever owns the connections.
#[async_trait::async_trait]
pub trait Gateway: Send + Sync {
	/// Register a live connection and return its outbound queue.
	async fn attach(&self, id: SessionId) -> mpsc::Receiver<HubItem>;

	async fn detach(&self, id: &SessionId) -> bool;

	async fn is_connected(&self, id: &SessionId) -> bool;

	async fn send_to(&self, id: &SessionId, event: OutboundEvent) -> Result<(), DeliveryError>;

	async fn send_to_all(&self, event: OutboundEvent) -> BroadcastReport;
}

/// Behaviour switches for the routing engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
	/// Forget a session's display name when its connection closes.
	pub remove_on_disconnect: bool,

	/// Also deliver a whisper back to its sender.
	pub echo_whispers: bool,
}

impl Default for EngineConfig {
	fn default() -> Self {
		Self {
			remove_on_disconnect: true,
			echo_whispers: false,
		}
	}
}

#[derive(Debug, Error)]
pub enum EngineError {
	#[error("validation failed: {0}")]
	Validation(#[from] ValidationError),

	#[error("unknown recipient: {0}")]
	UnknownRecipient(String),

	#[error("{0}")]
	StoreUnavailable(String),

	#[error("whisper not delivered to {0}: outbound queue full")]
	DeliveryFailed(String),
}

impl EngineError {
	/// Wire error code for this failure.
	pub fn code(&self) -> &'static str {
		match self {
			EngineError::Validation(_) => codes::VALIDATION_ERROR,
			EngineError::UnknownRecipient(_) => codes::UNKNOWN_RECIPIENT,
			EngineError::StoreUnavailable(_) => codes::STORE_UNAVAILABLE,
			EngineError::DeliveryFailed(_) => codes::DELIVERY_FAILED,
		}
	}
}

impl From<StoreError> for EngineError {
	fn from(e: StoreError) -> Self {
		EngineError::StoreUnavailable(e.to_string())
	}
}

/// Outcome of `RoutingEngine::on_connect`.
#[derive(Debug)]
pub struct Joined {
	/// Outbound queue for the new connection, already holding `History` and `Users`.
	pub events: mpsc::Receiver<HubItem>,
	pub result: Result<(), EngineError>,
}

/// Decides which sessions receive which events and keeps history and the directory current.
pub struct RoutingEngine {
	history: HistoryService,
	directory: SessionDirectory,
	gateway: Arc<dyn Gateway>,
	cfg: EngineConfig,

	/// Held across timestamp, append and fan-out. Stores the last assigned timestamp.
	publish: Mutex<Option<DateTime<Utc>>>,
}

impl RoutingEngine {
	pub fn new(
		history: HistoryService,
		directory: SessionDirectory,
		gateway: Arc<dyn Gateway>,
		cfg: EngineConfig,
	) -> Self {
		Self {
			history,
			directory,
			gateway,
			cfg,
			publish: Mutex::new(None),
		}
	}

	pub fn directory(&self) -> &SessionDirectory {
		&self.directory
	}

	pub fn history(&self) -> &HistoryService {
		&self.history
	}

	/// A connection was established: attach it, record presence, then queue history and the roster.
	///
	/// Holds the publish lock throughout: every message is either in the snapshot or queued
	/// after `History`, never both. The queue is returned even when the history read fails.
	pub async fn on_connect(&self, id: &SessionId) -> Joined {
		let _publish = self.publish.lock().await;

		let events = self.gateway.attach(id.clone()).await;
		self.directory.register(id).await;

		let history = match self.history.snapshot().await {
			Ok(h) => h,
			Err(e) => {
				return Joined {
					events,
					result: Err(self.reject(id, e.into())),
				};
			}
		};

		self.unicast(id, OutboundEvent::History(history)).await;
		self.unicast(id, OutboundEvent::Users(self.roster().await)).await;

		debug!(session = %id, "session joined");
		Joined { events, result: Ok(()) }
	}

	pub async fn on_disconnect(&self, id: &SessionId) {
		self.gateway.detach(id).await;
		if self.cfg.remove_on_disconnect {
			self.directory.remove(id).await;
		}
		debug!(session = %id, "session left");
	}

	/// Dispatch one inbound request from `id`.
	pub async fn handle(&self, id: &SessionId, event: InboundEvent) -> Result<(), EngineError> {
		match event {
			InboundEvent::SaveName { name } => self.save_name(id, name).await,
			InboundEvent::SendMessage { text } => self.send_message(id, text).await.map(|_| ()),
			InboundEvent::SendWhisper { destination, text } => {
				self.send_whisper(id, destination, text).await.map(|_| ())
			}
		}
	}

	/// Set the caller's display name and send it the updated roster.
	pub async fn save_name(&self, id: &SessionId, name: impl Into<String>) -> Result<(), EngineError> {
		let name = DisplayName::new(name).map_err(|e| self.reject(id, e.into()))?;

		self.directory.set_name(id, name.clone()).await;
		metrics::counter!("agora_names_total").increment(1);
		info!(session = %id, name = %name, "display name saved");

		self.unicast(id, OutboundEvent::Users(self.roster().await)).await;
		Ok(())
	}

	/// Record a public message and broadcast it to every live connection, sender included.
	pub async fn send_message(&self, id: &SessionId, text: impl Into<String>) -> Result<PublicMessage, EngineError> {
		let text = MessageText::new(text).map_err(|e| self.reject(id, e.into()))?;

		let mut last = self.publish.lock().await;
		let date = not_before(*last, now_millis());
		let msg = PublicMessage::new(id.clone(), text, date);

		if let Err(e) = self.history.append(&msg).await {
			warn!(session = %id, error = %e, "public message not recorded");
			return Err(self.reject(id, e.into()));
		}
		*last = Some(date);

		let report = self.gateway.send_to_all(OutboundEvent::ReceiveMessage(msg.clone())).await;
		drop(last);

		metrics::counter!("agora_messages_total").increment(1);
		debug!(
			session = %id,
			delivered = report.delivered,
			dropped = report.dropped,
			"public message broadcast"
		);

		Ok(msg)
	}

	/// Deliver a private message to exactly one live connection.
	///
	/// A full recipient queue fails the request with `DeliveryFailed`; the recipient gets a
	/// lag marker once its queue drains.
	pub async fn send_whisper(
		&self,
		id: &SessionId,
		destination: impl Into<String>,
		text: impl Into<String>,
	) -> Result<Whisper, EngineError> {
		let text = MessageText::new(text).map_err(|e| self.reject(id, e.into()))?;
		let destination = destination.into();

		let to = match SessionId::new(destination.clone()) {
			Ok(to) => to,
			Err(_) => return Err(self.reject(id, EngineError::UnknownRecipient(destination))),
		};
		if !self.gateway.is_connected(&to).await {
			return Err(self.reject(id, EngineError::UnknownRecipient(destination)));
		}

		let from_name = match self.directory.display_name(id).await {
			Some(name) => String::from(name),
			None => id.as_str().to_string(),
		};

		let whisper = Whisper {
			from: id.clone(),
			to: to.clone(),
			from_name,
			text,
			date: now_millis(),
		};

		match self.gateway.send_to(&to, OutboundEvent::ReceiveWhisper(whisper.clone())).await {
			Ok(()) => {}
			Err(DeliveryError::NotConnected(_)) => {
				return Err(self.reject(id, EngineError::UnknownRecipient(to.into_string())));
			}
			Err(DeliveryError::QueueFull(_)) => {
				debug!(session = %id, to = %to, "whisper dropped: recipient queue full");
				return Err(self.reject(id, EngineError::DeliveryFailed(to.into_string())));
			}
		}

		if self.cfg.echo_whispers && to != *id {
			self.unicast(id, OutboundEvent::ReceiveWhisper(whisper.clone())).await;
		}

		metrics::counter!("agora_whispers_total").increment(1);
		Ok(whisper)
	}

	async fn roster(&self) -> Vec<RosterEntry> {
		self.directory.list_all().await.iter().map(RosterEntry::from).collect()
	}

	async fn unicast(&self, id: &SessionId, event: OutboundEvent) {
		let kind = event.kind();
		if let Err(e) = self.gateway.send_to(id, event).await {
			debug!(session = %id, kind, error = %e, "unicast not delivered");
		}
	}

	fn reject(&self, id: &SessionId, err: EngineError) -> EngineError {
		metrics::counter!("agora_requests_rejected_total", "reason" => err.code()).increment(1);
		debug!(session = %id, code = err.code(), error = %err, "request rejected");
		err
	}
}
