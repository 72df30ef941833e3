//! Bindings for `proto/agora.proto` (`agora.v1`).
//!
//! Kept in prost derive form so the crate builds without protoc. Edit the schema first,
//! then mirror the change here; `tests/schema_tests.rs` checks the oneof tags agree.

/// Envelope wrapping every message on the control stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
	#[prost(uint32, tag = "1")]
	pub version: u32,
	/// Client-chosen correlation id, echoed on errors.
	#[prost(string, tag = "2")]
	pub request_id: ::prost::alloc::string::String,
	#[prost(
		oneof = "envelope::Msg",
		tags = "10, 11, 12, 13, 14, 20, 21, 22, 23, 24, 25, 26, 27"
	)]
	pub msg: ::core::option::Option<envelope::Msg>,
}

pub mod envelope {
	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Msg {
		// client -> server
		#[prost(message, tag = "10")]
		Hello(super::Hello),
		#[prost(message, tag = "11")]
		SaveName(super::SaveName),
		#[prost(message, tag = "12")]
		SendMessage(super::SendMessage),
		#[prost(message, tag = "13")]
		SendWhisper(super::SendWhisper),
		#[prost(message, tag = "14")]
		Ping(super::Ping),

		// server -> client
		#[prost(message, tag = "20")]
		Welcome(super::Welcome),
		#[prost(message, tag = "21")]
		History(super::History),
		#[prost(message, tag = "22")]
		Users(super::Users),
		#[prost(message, tag = "23")]
		ReceiveMessage(super::ReceiveMessage),
		#[prost(message, tag = "24")]
		ReceiveWhisper(super::ReceiveWhisper),
		#[prost(message, tag = "25")]
		Error(super::Error),
		#[prost(message, tag = "26")]
		Lagged(super::Lagged),
		#[prost(message, tag = "27")]
		Pong(super::Pong),
	}
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Hello {
	#[prost(string, tag = "1")]
	pub client_name: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SaveName {
	#[prost(string, tag = "1")]
	pub name: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SendMessage {
	#[prost(string, tag = "1")]
	pub text: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SendWhisper {
	#[prost(string, tag = "1")]
	pub destination_session_id: ::prost::alloc::string::String,
	#[prost(string, tag = "2")]
	pub text: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ping {
	#[prost(int64, tag = "1")]
	pub client_time_unix_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Welcome {
	/// Identity assigned to this connection.
	#[prost(string, tag = "1")]
	pub session_id: ::prost::alloc::string::String,
	#[prost(string, tag = "2")]
	pub server_name: ::prost::alloc::string::String,
	#[prost(int64, tag = "3")]
	pub server_time_unix_ms: i64,
	#[prost(uint32, tag = "4")]
	pub max_frame_bytes: u32,
}

/// Public message: `{ session, Text, Date }`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Message {
	#[prost(string, tag = "1")]
	pub session: ::prost::alloc::string::String,
	#[prost(string, tag = "2")]
	pub text: ::prost::alloc::string::String,
	/// RFC 3339 UTC with milliseconds.
	#[prost(string, tag = "3")]
	pub date: ::prost::alloc::string::String,
}

/// Recent public messages, oldest first.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct History {
	#[prost(message, repeated, tag = "1")]
	pub messages: ::prost::alloc::vec::Vec<Message>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UserEntry {
	#[prost(string, tag = "1")]
	pub session_id: ::prost::alloc::string::String,
	#[prost(string, tag = "2")]
	pub name: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Users {
	#[prost(message, repeated, tag = "1")]
	pub users: ::prost::alloc::vec::Vec<UserEntry>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReceiveMessage {
	#[prost(message, optional, tag = "1")]
	pub message: ::core::option::Option<Message>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WhisperBody {
	#[prost(string, tag = "1")]
	pub from_name: ::prost::alloc::string::String,
	#[prost(string, tag = "2")]
	pub text: ::prost::alloc::string::String,
	#[prost(string, tag = "3")]
	pub date: ::prost::alloc::string::String,
	#[prost(string, tag = "4")]
	pub from_session_id: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReceiveWhisper {
	#[prost(message, optional, tag = "1")]
	pub whisper: ::core::option::Option<WhisperBody>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Error {
	#[prost(string, tag = "1")]
	pub code: ::prost::alloc::string::String,
	#[prost(string, tag = "2")]
	pub message: ::prost::alloc::string::String,
	#[prost(string, tag = "3")]
	pub request_id: ::prost::alloc::string::String,
}

/// Outbound events were dropped because the client fell behind.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Lagged {
	#[prost(uint64, tag = "1")]
	pub dropped: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Pong {
	#[prost(int64, tag = "1")]
	pub client_time_unix_ms: i64,
	#[prost(int64, tag = "2")]
	pub server_time_unix_ms: i64,
}
