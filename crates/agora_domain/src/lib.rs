#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum length of a message body, in Unicode scalar values.
pub const MAX_TEXT_CHARS: usize = 500;

/// Maximum length of a display name, in Unicode scalar values.
pub const MAX_NAME_CHARS: usize = 64;

/// Errors for validating user-supplied values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
	#[error("message text must not be empty")]
	EmptyText,
	#[error("message text too long: len={len} max={max}")]
	TextTooLong { len: usize, max: usize },
	#[error("display name must not be empty")]
	EmptyName,
	#[error("display name too long: len={len} max={max}")]
	NameTooLong { len: usize, max: usize },
	#[error("session id must not be empty")]
	EmptyId,
}

/// Transport-assigned connection identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
	/// Wrap an existing token. Rejects empty or whitespace-only values.
	pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ValidationError::EmptyId);
		}
		Ok(Self(id))
	}

	/// Allocate a fresh random identity.
	pub fn generate() -> Self {
		Self(uuid::Uuid::new_v4().to_string())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for SessionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for SessionId {
	type Err = ValidationError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		SessionId::new(s.to_string())
	}
}

/// Validated body of a public message or whisper.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MessageText(String);

impl MessageText {
	pub fn new(text: impl Into<String>) -> Result<Self, ValidationError> {
		let text = text.into();
		if text.trim().is_empty() {
			return Err(ValidationError::EmptyText);
		}

		let len = text.chars().count();
		if len > MAX_TEXT_CHARS {
			return Err(ValidationError::TextTooLong {
				len,
				max: MAX_TEXT_CHARS,
			});
		}

		Ok(Self(text))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl TryFrom<String> for MessageText {
	type Error = ValidationError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		MessageText::new(value)
	}
}

impl From<MessageText> for String {
	fn from(value: MessageText) -> Self {
		value.0
	}
}

impl fmt::Display for MessageText {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Validated, trimmed display name chosen by a client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DisplayName(String);

impl DisplayName {
	pub fn new(name: impl Into<String>) -> Result<Self, ValidationError> {
		let name = name.into();
		let name = name.trim();
		if name.is_empty() {
			return Err(ValidationError::EmptyName);
		}

		let len = name.chars().count();
		if len > MAX_NAME_CHARS {
			return Err(ValidationError::NameTooLong {
				len,
				max: MAX_NAME_CHARS,
			});
		}

		Ok(Self(name.to_string()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl TryFrom<String> for DisplayName {
	type Error = ValidationError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		DisplayName::new(value)
	}
}

impl From<DisplayName> for String {
	fn from(value: DisplayName) -> Self {
		value.0
	}
}

impl fmt::Display for DisplayName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Current time truncated to millisecond precision (the resolution of `Date` on the wire).
pub fn now_millis() -> DateTime<Utc> {
	Utc::now().trunc_subsecs(3)
}

/// Format a timestamp as RFC 3339 UTC with milliseconds (`2024-05-01T12:00:00.000Z`).
pub fn format_date(date: &DateTime<Utc>) -> String {
	date.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Parse an RFC 3339 timestamp into UTC.
pub fn parse_date(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
	DateTime::parse_from_rfc3339(s).map(|d| d.with_timezone(&Utc))
}

mod iso_millis {
	use chrono::{DateTime, Utc};
	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(date: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
		s.serialize_str(&super::format_date(date))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
		let raw = String::deserialize(d)?;
		super::parse_date(&raw).map_err(serde::de::Error::custom)
	}
}

/// A public message as recorded in history and broadcast to every connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicMessage {
	pub session: SessionId,
	#[serde(rename = "Text")]
	pub text: MessageText,
	#[serde(rename = "Date", with = "iso_millis")]
	pub date: DateTime<Utc>,
}

impl PublicMessage {
	pub fn new(session: SessionId, text: MessageText, date: DateTime<Utc>) -> Self {
		Self { session, text, date }
	}
}

/// Record format of a history entry in the backing store: `{"Message": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
	#[serde(rename = "Message")]
	pub message: PublicMessage,
}

impl From<PublicMessage> for StoredMessage {
	fn from(message: PublicMessage) -> Self {
		Self { message }
	}
}

/// A private message addressed to exactly one live connection. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Whisper {
	pub from: SessionId,
	pub to: SessionId,
	#[serde(rename = "fromName")]
	pub from_name: String,
	pub text: MessageText,
	#[serde(with = "iso_millis")]
	pub date: DateTime<Utc>,
}

/// A known session and its optional display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
	pub id: SessionId,
	pub display_name: Option<DisplayName>,
}

impl Session {
	/// Name shown to other users: the display name, or the id when unset.
	pub fn label(&self) -> &str {
		match &self.display_name {
			Some(name) => name.as_str(),
			None => self.id.as_str(),
		}
	}
}

/// One roster line as delivered in a `users` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
	#[serde(rename = "sessionId")]
	pub session_id: SessionId,
	pub name: String,
}

impl From<&Session> for RosterEntry {
	fn from(session: &Session) -> Self {
		Self {
			session_id: session.id.clone(),
			name: session.label().to_string(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn message_text_bounds() {
		assert_eq!(MessageText::new(""), Err(ValidationError::EmptyText));
		assert_eq!(MessageText::new("   \n"), Err(ValidationError::EmptyText));
		assert!(MessageText::new("a".repeat(MAX_TEXT_CHARS)).is_ok());
		assert_eq!(
			MessageText::new("a".repeat(MAX_TEXT_CHARS + 1)),
			Err(ValidationError::TextTooLong {
				len: MAX_TEXT_CHARS + 1,
				max: MAX_TEXT_CHARS
			})
		);
	}

	#[test]
	fn message_text_counts_scalar_values_not_bytes() {
		let text = "é".repeat(MAX_TEXT_CHARS);
		assert!(text.len() > MAX_TEXT_CHARS);
		assert!(MessageText::new(text).is_ok());
	}

	#[test]
	fn display_name_is_trimmed() {
		let name = DisplayName::new("  Alice ").unwrap();
		assert_eq!(name.as_str(), "Alice");
		assert_eq!(DisplayName::new(" \t"), Err(ValidationError::EmptyName));
		assert!(DisplayName::new("x".repeat(MAX_NAME_CHARS + 1)).is_err());
	}

	#[test]
	fn rejects_empty_session_id() {
		assert!(SessionId::new("").is_err());
		assert!("  ".parse::<SessionId>().is_err());
		assert_ne!(SessionId::generate(), SessionId::generate());
	}

	#[test]
	fn stored_message_uses_record_field_names() {
		let date = parse_date("2024-05-01T12:00:00.250Z").unwrap();
		let msg = PublicMessage::new(SessionId::new("abc").unwrap(), MessageText::new("hi").unwrap(), date);
		let json = serde_json::to_value(StoredMessage::from(msg.clone())).unwrap();

		assert_eq!(json["Message"]["session"], "abc");
		assert_eq!(json["Message"]["Text"], "hi");
		assert_eq!(json["Message"]["Date"], "2024-05-01T12:00:00.250Z");

		let back: StoredMessage = serde_json::from_value(json).unwrap();
		assert_eq!(back.message, msg);
	}

	#[test]
	fn stored_message_with_invalid_text_fails_to_parse() {
		let raw = r#"{"Message":{"session":"abc","Text":"","Date":"2024-05-01T12:00:00.000Z"}}"#;
		assert!(serde_json::from_str::<StoredMessage>(raw).is_err());
	}

	#[test]
	fn roster_entry_falls_back_to_id() {
		let id = SessionId::new("s-1").unwrap();
		let unnamed = Session {
			id: id.clone(),
			display_name: None,
		};
		assert_eq!(RosterEntry::from(&unnamed).name, "s-1");

		let named = Session {
			id,
			display_name: Some(DisplayName::new("Bob").unwrap()),
		};
		assert_eq!(RosterEntry::from(&named).name, "Bob");
	}
}
