#![forbid(unsafe_code)]

pub mod framing;
pub mod pb;

pub use framing::{
	DEFAULT_MAX_FRAME_SIZE, FRAME_PREFIX_LEN, FrameDecoder, FramingError, decode_frame, encode_frame, encode_frame_default,
	frame_len_from_payload_len, try_decode_frame_from_buffer,
};

use agora_domain::{PublicMessage, RosterEntry, Whisper, format_date};

/// Current protocol version written into `pb::Envelope.version`.
pub const PROTOCOL_VERSION: u32 = 1;

/// ALPN identifier negotiated on the QUIC handshake.
pub const ALPN: &[u8] = b"agora-v1";

/// Error codes carried in `pb::Error.code`.
pub mod codes {
	pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
	pub const UNKNOWN_RECIPIENT: &str = "UNKNOWN_RECIPIENT";
	pub const STORE_UNAVAILABLE: &str = "STORE_UNAVAILABLE";
	pub const DELIVERY_FAILED: &str = "DELIVERY_FAILED";
	pub const MALFORMED_PAYLOAD: &str = "MALFORMED_PAYLOAD";
	pub const UNSUPPORTED_VERSION: &str = "UNSUPPORTED_VERSION";
}

/// Wrap a message into a versioned envelope.
pub fn envelope(request_id: impl Into<String>, msg: pb::envelope::Msg) -> pb::Envelope {
	pb::Envelope {
		version: PROTOCOL_VERSION,
		request_id: request_id.into(),
		msg: Some(msg),
	}
}

/// Short name of an envelope's payload for logs and metrics labels.
pub fn msg_kind(msg: Option<&pb::envelope::Msg>) -> &'static str {
	use pb::envelope::Msg;

	match msg {
		Some(Msg::Hello(_)) => "hello",
		Some(Msg::SaveName(_)) => "save_name",
		Some(Msg::SendMessage(_)) => "send_message",
		Some(Msg::SendWhisper(_)) => "send_whisper",
		Some(Msg::Ping(_)) => "ping",
		Some(Msg::Welcome(_)) => "welcome",
		Some(Msg::History(_)) => "history",
		Some(Msg::Users(_)) => "users",
		Some(Msg::ReceiveMessage(_)) => "receive_message",
		Some(Msg::ReceiveWhisper(_)) => "receive_whisper",
		Some(Msg::Error(_)) => "error",
		Some(Msg::Lagged(_)) => "lagged",
		Some(Msg::Pong(_)) => "pong",
		None => "empty",
	}
}

impl From<&PublicMessage> for pb::Message {
	fn from(m: &PublicMessage) -> Self {
		Self {
			session: m.session.as_str().to_string(),
			text: m.text.as_str().to_string(),
			date: format_date(&m.date),
		}
	}
}

impl From<&RosterEntry> for pb::UserEntry {
	fn from(e: &RosterEntry) -> Self {
		Self {
			session_id: e.session_id.as_str().to_string(),
			name: e.name.clone(),
		}
	}
}

impl From<&Whisper> for pb::WhisperBody {
	fn from(w: &Whisper) -> Self {
		Self {
			from_name: w.from_name.clone(),
			text: w.text.as_str().to_string(),
			date: format_date(&w.date),
			from_session_id: w.from.as_str().to_string(),
		}
	}
}
