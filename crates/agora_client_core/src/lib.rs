#![forbid(unsafe_code)]

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use agora_domain::{MessageText, PublicMessage, SessionId, Whisper, parse_date};
use agora_protocol::{DEFAULT_MAX_FRAME_SIZE, FrameDecoder, FramingError, PROTOCOL_VERSION, encode_frame, pb};
use anyhow::Context as _;
use quinn::{ClientConfig as QuinnClientConfig, Endpoint, TransportConfig, VarInt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// How the client authenticates the server certificate.
#[derive(Debug, Clone)]
pub enum ServerTrust {
	/// Trust exactly this DER certificate (the server's dev self-signed cert).
	Pinned(Vec<u8>),
	/// Skip verification. Local development only.
	InsecureDev,
}

/// Client session configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
	pub server_addr: SocketAddr,

	/// TLS server name (SNI).
	pub server_name: String,

	/// Reported to the server in `Hello`.
	pub client_name: String,

	pub trust: ServerTrust,

	pub max_frame_bytes: usize,

	/// Timeout for connect + handshake.
	pub connect_timeout: Duration,
}

impl Default for ClientConfig {
	fn default() -> Self {
		Self {
			server_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 18300)),
			server_name: "localhost".to_string(),
			client_name: format!("agora-client-core/{}", env!("CARGO_PKG_VERSION")),
			trust: ServerTrust::InsecureDev,
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			connect_timeout: Duration::from_secs(15),
		}
	}
}

/// Errors for client core operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientCoreError {
	/// QUIC endpoint setup failed.
	#[error("failed to create QUIC endpoint: {0}")]
	Endpoint(String),

	/// Connection establishment failed.
	#[error("failed to connect: {0}")]
	Connect(String),

	#[error(transparent)]
	Framing(#[from] FramingError),

	/// Unexpected message ordering, type or content.
	#[error("protocol error: {0}")]
	Protocol(String),

	#[error("io error: {0}")]
	Io(String),

	/// The session's event stream has ended.
	#[error("session closed")]
	Closed,

	#[error("error: {0}")]
	Other(String),
}

impl From<anyhow::Error> for ClientCoreError {
	fn from(e: anyhow::Error) -> Self {
		ClientCoreError::Other(format!("{e:#}"))
	}
}

/// A roster line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
	pub session_id: String,
	pub name: String,
}

/// Events pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
	/// Recent public messages, oldest first.
	History(Vec<PublicMessage>),
	Users(Vec<User>),
	Message(PublicMessage),
	Whisper(Whisper),
	Error {
		code: String,
		message: String,
		request_id: String,
	},
	Lagged {
		dropped: u64,
	},
	Pong {
		client_time_unix_ms: i64,
		server_time_unix_ms: i64,
	},
}

/// A connected chat session.
pub struct ClientSession {
	conn: quinn::Connection,
	control_send: quinn::SendStream,
	events: mpsc::UnboundedReceiver<Result<ServerEvent, ClientCoreError>>,
	session_id: SessionId,
	max_frame_bytes: usize,
	next_request: u64,
	_endpoint: Endpoint,
}

impl ClientSession {
	/// Connect, send `Hello` and wait for `Welcome`.
	pub async fn connect(cfg: ClientConfig) -> Result<(Self, pb::Welcome), ClientCoreError> {
		let endpoint = make_client_endpoint().map_err(|e| ClientCoreError::Endpoint(format!("{e:#}")))?;
		let quinn_cfg = make_client_config(&cfg.trust).map_err(|e| ClientCoreError::Endpoint(format!("{e:#}")))?;
		let connect_timeout = cfg.connect_timeout;

		let connecting = endpoint
			.connect_with(quinn_cfg, cfg.server_addr, &cfg.server_name)
			.map_err(|e| {
				ClientCoreError::Connect(format!(
					"connect_with({}, sni={}): {e}",
					cfg.server_addr, cfg.server_name
				))
			})?;

		let conn = match tokio::time::timeout(connect_timeout, connecting).await {
			Ok(Ok(c)) => c,
			Ok(Err(e)) => return Err(ClientCoreError::Connect(format!("{}: {e}", cfg.server_addr))),
			Err(_) => {
				return Err(ClientCoreError::Connect(format!(
					"connect timeout after {connect_timeout:?} ({})",
					cfg.server_addr
				)));
			}
		};

		info!(remote = %conn.remote_address(), "connected");

		let (mut control_send, mut control_recv) = tokio::time::timeout(connect_timeout, conn.open_bi())
			.await
			.map_err(|_| ClientCoreError::Io(format!("timeout opening control stream after {connect_timeout:?}")))?
			.map_err(|e| ClientCoreError::Io(format!("open_bi(control) failed: {e}")))?;

		let hello = agora_protocol::envelope(
			"",
			pb::envelope::Msg::Hello(pb::Hello {
				client_name: cfg.client_name,
			}),
		);
		write_envelope(&mut control_send, &hello, cfg.max_frame_bytes)
			.await
			.map_err(|e| ClientCoreError::Io(format!("send Hello failed: {e}")))?;

		let mut decoder = FrameDecoder::new(cfg.max_frame_bytes);
		let welcome_env = tokio::time::timeout(connect_timeout, read_one_envelope(&mut control_recv, &mut decoder))
			.await
			.map_err(|_| ClientCoreError::Protocol(format!("timeout waiting for Welcome after {connect_timeout:?}")))??;

		let welcome = match welcome_env.msg {
			Some(pb::envelope::Msg::Welcome(w)) => w,
			Some(pb::envelope::Msg::Error(e)) => {
				return Err(ClientCoreError::Protocol(format!("{}: {}", e.code, e.message)));
			}
			other => {
				return Err(ClientCoreError::Protocol(format!("expected Welcome, got {other:?}")));
			}
		};

		let session_id = SessionId::new(welcome.session_id.clone())
			.map_err(|e| ClientCoreError::Protocol(format!("invalid session id in Welcome: {e}")))?;

		debug!(
			session = %session_id,
			server_name = %welcome.server_name,
			max_frame_bytes = welcome.max_frame_bytes,
			"received Welcome"
		);

		let max_frame_bytes = (welcome.max_frame_bytes as usize).min(cfg.max_frame_bytes);
		let (events_tx, events) = mpsc::unbounded_channel();
		tokio::spawn(run_event_reader(control_recv, decoder, session_id.clone(), events_tx));

		let session = Self {
			conn,
			control_send,
			events,
			session_id,
			max_frame_bytes,
			next_request: 1,
			_endpoint: endpoint,
		};

		Ok((session, welcome))
	}

	/// Identity the server assigned to this connection.
	pub fn session_id(&self) -> &SessionId {
		&self.session_id
	}

	/// Returns the request id echoed on any error reply.
	pub async fn save_name(&mut self, name: impl Into<String>) -> Result<String, ClientCoreError> {
		self.send(pb::envelope::Msg::SaveName(pb::SaveName { name: name.into() })).await
	}

	pub async fn send_message(&mut self, text: impl Into<String>) -> Result<String, ClientCoreError> {
		self.send(pb::envelope::Msg::SendMessage(pb::SendMessage { text: text.into() }))
			.await
	}

	pub async fn send_whisper(
		&mut self,
		destination_session_id: impl Into<String>,
		text: impl Into<String>,
	) -> Result<String, ClientCoreError> {
		self.send(pb::envelope::Msg::SendWhisper(pb::SendWhisper {
			destination_session_id: destination_session_id.into(),
			text: text.into(),
		}))
		.await
	}

	/// The matching `Pong` arrives through `next_event`.
	pub async fn ping(&mut self, client_time_unix_ms: i64) -> Result<String, ClientCoreError> {
		self.send(pb::envelope::Msg::Ping(pb::Ping { client_time_unix_ms })).await
	}

	/// Wait for the next server event.
	pub async fn next_event(&mut self) -> Result<ServerEvent, ClientCoreError> {
		match self.events.recv().await {
			Some(result) => result,
			None => Err(ClientCoreError::Closed),
		}
	}

	pub fn close(&self, code: u32, reason: &str) {
		self.conn.close(VarInt::from_u32(code), reason.as_bytes());
	}

	async fn send(&mut self, msg: pb::envelope::Msg) -> Result<String, ClientCoreError> {
		let request_id = format!("r{}", self.next_request);
		self.next_request += 1;

		let env = agora_protocol::envelope(request_id.clone(), msg);
		write_envelope(&mut self.control_send, &env, self.max_frame_bytes).await?;
		Ok(request_id)
	}
}

async fn run_event_reader(
	mut recv: quinn::RecvStream,
	mut decoder: FrameDecoder,
	own_id: SessionId,
	events_tx: mpsc::UnboundedSender<Result<ServerEvent, ClientCoreError>>,
) {
	let mut tmp = [0u8; 8192];

	loop {
		loop {
			let item = match decoder.next_frame::<pb::Envelope>() {
				Ok(Some(env)) => match event_from_envelope(env, &own_id) {
					Ok(Some(ev)) => Ok(ev),
					Ok(None) => continue,
					Err(e) => Err(e),
				},
				Ok(None) => break,
				Err(e) => {
					let _ = events_tx.send(Err(ClientCoreError::Framing(e)));
					return;
				}
			};

			if events_tx.send(item).is_err() {
				return;
			}
		}

		match recv.read(&mut tmp).await {
			Ok(Some(n)) => decoder.extend(&tmp[..n]),
			Ok(None) => {
				info!("control stream closed");
				return;
			}
			Err(e) => {
				let _ = events_tx.send(Err(ClientCoreError::Io(e.to_string())));
				return;
			}
		}
	}
}

fn parse_message(m: pb::Message) -> Result<PublicMessage, ClientCoreError> {
	let session = SessionId::new(m.session).map_err(|e| ClientCoreError::Protocol(format!("message session: {e}")))?;
	let text = MessageText::new(m.text).map_err(|e| ClientCoreError::Protocol(format!("message text: {e}")))?;
	let date = parse_date(&m.date).map_err(|e| ClientCoreError::Protocol(format!("message date {:?}: {e}", m.date)))?;
	Ok(PublicMessage::new(session, text, date))
}

/// Convert a server envelope into a typed event. `Ok(None)` for payloads a client ignores.
pub fn event_from_envelope(env: pb::Envelope, own_id: &SessionId) -> Result<Option<ServerEvent>, ClientCoreError> {
	use pb::envelope::Msg;

	if env.version != PROTOCOL_VERSION {
		return Err(ClientCoreError::Protocol(format!(
			"unsupported protocol version {}",
			env.version
		)));
	}

	let Some(msg) = env.msg else {
		return Ok(None);
	};

	let ev = match msg {
		Msg::History(h) => ServerEvent::History(h.messages.into_iter().map(parse_message).collect::<Result<_, _>>()?),
		Msg::Users(u) => ServerEvent::Users(
			u.users
				.into_iter()
				.map(|e| User {
					session_id: e.session_id,
					name: e.name,
				})
				.collect(),
		),
		Msg::ReceiveMessage(r) => {
			let m = r
				.message
				.ok_or_else(|| ClientCoreError::Protocol("receive_message without message".to_string()))?;
			ServerEvent::Message(parse_message(m)?)
		}
		Msg::ReceiveWhisper(r) => {
			let w = r
				.whisper
				.ok_or_else(|| ClientCoreError::Protocol("receive_whisper without whisper".to_string()))?;
			let from = SessionId::new(w.from_session_id)
				.map_err(|e| ClientCoreError::Protocol(format!("whisper sender: {e}")))?;
			let text = MessageText::new(w.text).map_err(|e| ClientCoreError::Protocol(format!("whisper text: {e}")))?;
			let date =
				parse_date(&w.date).map_err(|e| ClientCoreError::Protocol(format!("whisper date {:?}: {e}", w.date)))?;
			ServerEvent::Whisper(Whisper {
				from,
				to: own_id.clone(),
				from_name: w.from_name,
				text,
				date,
			})
		}
		Msg::Error(e) => ServerEvent::Error {
			code: e.code,
			message: e.message,
			request_id: e.request_id,
		},
		Msg::Lagged(l) => ServerEvent::Lagged { dropped: l.dropped },
		Msg::Pong(p) => ServerEvent::Pong {
			client_time_unix_ms: p.client_time_unix_ms,
			server_time_unix_ms: p.server_time_unix_ms,
		},
		other => {
			warn!("unexpected message on control stream: {:?}", agora_protocol::msg_kind(Some(&other)));
			return Ok(None);
		}
	};

	Ok(Some(ev))
}

async fn write_envelope(
	send: &mut quinn::SendStream,
	env: &pb::Envelope,
	max_frame_bytes: usize,
) -> Result<(), ClientCoreError> {
	let frame = encode_frame(env, max_frame_bytes).map_err(ClientCoreError::Framing)?;
	send.write_all(&frame).await.map_err(|e| ClientCoreError::Io(e.to_string()))?;
	Ok(())
}

async fn read_one_envelope(recv: &mut quinn::RecvStream, decoder: &mut FrameDecoder) -> Result<pb::Envelope, ClientCoreError> {
	let mut tmp = [0u8; 8192];

	loop {
		if let Some(env) = decoder.next_frame::<pb::Envelope>()? {
			return Ok(env);
		}

		let n = match recv.read(&mut tmp).await {
			Ok(Some(n)) => n,
			Ok(None) => {
				return Err(ClientCoreError::Protocol(
					"stream closed before receiving full message".to_string(),
				));
			}
			Err(e) => return Err(ClientCoreError::Io(e.to_string())),
		};

		decoder.extend(&tmp[..n]);
	}
}

fn make_client_endpoint() -> anyhow::Result<Endpoint> {
	let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
	Endpoint::client(addr).context("create client endpoint")
}

fn make_client_config(trust: &ServerTrust) -> anyhow::Result<QuinnClientConfig> {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

	let mut tls = match trust {
		ServerTrust::Pinned(cert_der) => {
			let mut roots = rustls::RootCertStore::empty();
			roots
				.add(rustls::pki_types::CertificateDer::from(cert_der.clone()))
				.context("add pinned server certificate")?;
			rustls::ClientConfig::builder()
				.with_root_certificates(roots)
				.with_no_client_auth()
		}
		ServerTrust::InsecureDev => {
			let mut tls = rustls::ClientConfig::builder()
				.with_root_certificates(rustls::RootCertStore::empty())
				.with_no_client_auth();
			tls.dangerous().set_certificate_verifier(Arc::new(NoVerifier));
			tls
		}
	};
	tls.alpn_protocols = vec![agora_protocol::ALPN.to_vec()];

	let quic_tls = quinn::crypto::rustls::QuicClientConfig::try_from(tls)?;
	let mut cfg = QuinnClientConfig::new(Arc::new(quic_tls));

	let mut transport = TransportConfig::default();
	transport.max_concurrent_bidi_streams(VarInt::from_u32(0));
	transport.max_concurrent_uni_streams(VarInt::from_u32(0));
	transport.keep_alive_interval(Some(Duration::from_secs(10)));
	cfg.transport_config(Arc::new(transport));

	Ok(cfg)
}

#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
	fn verify_server_cert(
		&self,
		_end_entity: &rustls::pki_types::CertificateDer<'_>,
		_intermediates: &[rustls::pki_types::CertificateDer<'_>],
		_server_name: &rustls::pki_types::ServerName<'_>,
		_ocsp_response: &[u8],
		_now: rustls::pki_types::UnixTime,
	) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
		Ok(rustls::client::danger::ServerCertVerified::assertion())
	}

	fn verify_tls12_signature(
		&self,
		_message: &[u8],
		_cert: &rustls::pki_types::CertificateDer<'_>,
		_dss: &rustls::DigitallySignedStruct,
	) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
		Err(rustls::Error::General("TLS1.2 not supported".into()))
	}

	fn verify_tls13_signature(
		&self,
		_message: &[u8],
		_cert: &rustls::pki_types::CertificateDer<'_>,
		_dss: &rustls::DigitallySignedStruct,
	) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
		Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
	}

	fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
		vec![
			rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
			rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
			rustls::SignatureScheme::RSA_PSS_SHA256,
			rustls::SignatureScheme::RSA_PSS_SHA384,
			rustls::SignatureScheme::RSA_PSS_SHA512,
			rustls::SignatureScheme::ED25519,
		]
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn own() -> SessionId {
		SessionId::new("me").unwrap()
	}

	#[test]
	fn default_config_is_local() {
		let cfg = ClientConfig::default();
		assert_eq!(cfg.server_addr.port(), 18300);
		assert_eq!(cfg.server_name, "localhost");
		assert!(cfg.max_frame_bytes > 0);
	}

	#[test]
	fn whisper_envelope_becomes_typed_event() {
		let env = agora_protocol::envelope(
			"",
			pb::envelope::Msg::ReceiveWhisper(pb::ReceiveWhisper {
				whisper: Some(pb::WhisperBody {
					from_name: "Alice".to_string(),
					text: "psst".to_string(),
					date: "2024-05-01T12:00:00.000Z".to_string(),
					from_session_id: "a".to_string(),
				}),
			}),
		);

		let Some(ServerEvent::Whisper(w)) = event_from_envelope(env, &own()).unwrap() else {
			panic!("expected whisper");
		};
		assert_eq!(w.from_name, "Alice");
		assert_eq!(w.from.as_str(), "a");
		assert_eq!(w.to, own());
	}

	#[test]
	fn bad_message_date_is_a_protocol_error() {
		let env = agora_protocol::envelope(
			"",
			pb::envelope::Msg::History(pb::History {
				messages: vec![pb::Message {
					session: "a".to_string(),
					text: "hi".to_string(),
					date: "yesterday".to_string(),
				}],
			}),
		);
		assert!(matches!(
			event_from_envelope(env, &own()),
			Err(ClientCoreError::Protocol(_))
		));
	}

	#[test]
	fn errors_keep_request_id() {
		let env = agora_protocol::envelope(
			"r3",
			pb::envelope::Msg::Error(pb::Error {
				code: "UNKNOWN_RECIPIENT".to_string(),
				message: "unknown recipient: ghost".to_string(),
				request_id: "r3".to_string(),
			}),
		);
		match event_from_envelope(env, &own()).unwrap() {
			Some(ServerEvent::Error { code, request_id, .. }) => {
				assert_eq!(code, "UNKNOWN_RECIPIENT");
				assert_eq!(request_id, "r3");
			}
			other => panic!("unexpected event: {other:?}"),
		}
	}

	#[test]
	fn client_payloads_from_server_are_ignored() {
		let env = agora_protocol::envelope("", pb::envelope::Msg::Ping(pb::Ping { client_time_unix_ms: 1 }));
		assert!(event_from_envelope(env, &own()).unwrap().is_none());
	}
}
