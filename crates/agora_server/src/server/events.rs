#![forbid(unsafe_code)]

use agora_domain::{PublicMessage, RosterEntry, Whisper};
use agora_protocol::pb;

/// Requests a connection can make of the routing engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
	SaveName { name: String },
	SendMessage { text: String },
	SendWhisper { destination: String, text: String },
}

/// Events the routing engine asks the gateway to deliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundEvent {
	/// Recent public messages, oldest first.
	History(Vec<PublicMessage>),
	Users(Vec<RosterEntry>),
	ReceiveMessage(PublicMessage),
	ReceiveWhisper(Whisper),
}

impl OutboundEvent {
	pub fn kind(&self) -> &'static str {
		match self {
			OutboundEvent::History(_) => "history",
			OutboundEvent::Users(_) => "users",
			OutboundEvent::ReceiveMessage(_) => "receive_message",
			OutboundEvent::ReceiveWhisper(_) => "receive_whisper",
		}
	}

	pub fn into_wire(self) -> pb::envelope::Msg {
		match self {
			OutboundEvent::History(messages) => pb::envelope::Msg::History(pb::History {
				messages: messages.iter().map(pb::Message::from).collect(),
			}),
			OutboundEvent::Users(entries) => pb::envelope::Msg::Users(pb::Users {
				users: entries.iter().map(pb::UserEntry::from).collect(),
			}),
			OutboundEvent::ReceiveMessage(msg) => pb::envelope::Msg::ReceiveMessage(pb::ReceiveMessage {
				message: Some(pb::Message::from(&msg)),
			}),
			OutboundEvent::ReceiveWhisper(w) => pb::envelope::Msg::ReceiveWhisper(pb::ReceiveWhisper {
				whisper: Some(pb::WhisperBody::from(&w)),
			}),
		}
	}
}

/// Map a decoded client envelope payload to an engine request.
///
/// `Ok(None)` means the payload is valid but handled by the gateway itself
/// (`Hello`, `Ping`). Server-only payloads are an error.
pub fn inbound_from_wire(msg: pb::envelope::Msg) -> Result<Option<InboundEvent>, &'static str> {
	use pb::envelope::Msg;

	match msg {
		Msg::SaveName(m) => Ok(Some(InboundEvent::SaveName { name: m.name })),
		Msg::SendMessage(m) => Ok(Some(InboundEvent::SendMessage { text: m.text })),
		Msg::SendWhisper(m) => {
			if m.destination_session_id.is_empty() {
				return Err("send_whisper without destination_session_id");
			}
			Ok(Some(InboundEvent::SendWhisper {
				destination: m.destination_session_id,
				text: m.text,
			}))
		}
		Msg::Hello(_) | Msg::Ping(_) => Ok(None),
		Msg::Welcome(_)
		| Msg::History(_)
		| Msg::Users(_)
		| Msg::ReceiveMessage(_)
		| Msg::ReceiveWhisper(_)
		| Msg::Error(_)
		| Msg::Lagged(_)
		| Msg::Pong(_) => Err("server-only message sent by client"),
	}
}
