use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use agora_client_core::{ClientConfig, ClientSession, ServerEvent, ServerTrust};
use agora_protocol::{DEFAULT_MAX_FRAME_SIZE, FrameDecoder, PROTOCOL_VERSION, codes, encode_frame, pb};
use agora_server::AgoraServer;
use agora_server::config::ServerConfig;

const STEP: Duration = Duration::from_secs(5);

async fn start_server() -> (SocketAddr, Vec<u8>) {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

	let mut cfg = ServerConfig::default();
	cfg.server.bind = SocketAddr::from(([127, 0, 0, 1], 0));

	let server = AgoraServer::bind(&cfg).await.expect("bind server");
	let addr = server.local_addr().expect("local addr");
	let cert = server.dev_cert_der().expect("dev cert").to_vec();

	tokio::spawn(server.run());
	(addr, cert)
}

async fn join(addr: SocketAddr, cert: &[u8], client_name: &str) -> ClientSession {
	let cfg = ClientConfig {
		server_addr: addr,
		server_name: "localhost".to_string(),
		client_name: client_name.to_string(),
		trust: ServerTrust::Pinned(cert.to_vec()),
		..ClientConfig::default()
	};
	let (session, welcome) = ClientSession::connect(cfg).await.expect("connect");
	assert_eq!(welcome.session_id, session.session_id().as_str());
	session
}

async fn next(session: &mut ClientSession) -> ServerEvent {
	tokio::time::timeout(STEP, session.next_event())
		.await
		.expect("timed out waiting for server event")
		.expect("event stream failed")
}

#[tokio::test]
async fn two_clients_chat_and_whisper() {
	let (addr, cert) = start_server().await;

	let mut alice = join(addr, &cert, "alice-test").await;
	assert_eq!(next(&mut alice).await, ServerEvent::History(vec![]));
	let ServerEvent::Users(users) = next(&mut alice).await else {
		panic!("expected roster");
	};
	assert_eq!(users.len(), 1);

	let mut bob = join(addr, &cert, "bob-test").await;
	assert_eq!(next(&mut bob).await, ServerEvent::History(vec![]));
	let ServerEvent::Users(users) = next(&mut bob).await else {
		panic!("expected roster");
	};
	assert_eq!(users.len(), 2);

	alice.save_name("Alice").await.unwrap();
	let ServerEvent::Users(users) = next(&mut alice).await else {
		panic!("expected roster after save_name");
	};
	assert!(users.iter().any(|u| u.session_id == alice.session_id().as_str() && u.name == "Alice"));

	let alice_id = alice.session_id().clone();
	alice.send_message("hello everyone").await.unwrap();
	for session in [&mut alice, &mut bob] {
		let ServerEvent::Message(m) = next(session).await else {
			panic!("expected public message");
		};
		assert_eq!(m.text.as_str(), "hello everyone");
		assert_eq!(m.session, alice_id);
	}

	bob.save_name("Bob").await.unwrap();
	assert!(matches!(next(&mut bob).await, ServerEvent::Users(_)));

	bob.send_whisper(alice_id.as_str(), "just for you").await.unwrap();
	let ServerEvent::Whisper(w) = next(&mut alice).await else {
		panic!("expected whisper");
	};
	assert_eq!(w.from_name, "Bob");
	assert_eq!(w.from, *bob.session_id());
	assert_eq!(w.text.as_str(), "just for you");

	let mut carol = join(addr, &cert, "carol-test").await;
	let ServerEvent::History(history) = next(&mut carol).await else {
		panic!("expected history");
	};
	assert_eq!(history.len(), 1);
	assert_eq!(history[0].text.as_str(), "hello everyone");
}

#[tokio::test]
async fn unknown_recipient_is_reported_with_request_id() {
	let (addr, cert) = start_server().await;

	let mut client = join(addr, &cert, "lonely").await;
	assert!(matches!(next(&mut client).await, ServerEvent::History(_)));
	assert!(matches!(next(&mut client).await, ServerEvent::Users(_)));

	let request_id = client.send_whisper("nobody-here", "hello?").await.unwrap();
	match next(&mut client).await {
		ServerEvent::Error {
			code,
			request_id: echoed,
			..
		} => {
			assert_eq!(code, agora_protocol::codes::UNKNOWN_RECIPIENT);
			assert_eq!(echoed, request_id);
		}
		other => panic!("unexpected event: {other:?}"),
	}

	let request_id = client.send_message("   ").await.unwrap();
	match next(&mut client).await {
		ServerEvent::Error {
			code,
			request_id: echoed,
			..
		} => {
			assert_eq!(code, agora_protocol::codes::VALIDATION_ERROR);
			assert_eq!(echoed, request_id);
		}
		other => panic!("unexpected event: {other:?}"),
	}

	let sent_at = 1_700_000_000_000;
	client.ping(sent_at).await.unwrap();
	match next(&mut client).await {
		ServerEvent::Pong {
			client_time_unix_ms, ..
		} => assert_eq!(client_time_unix_ms, sent_at),
		other => panic!("unexpected event: {other:?}"),
	}
}

/// A control stream driven frame by frame, for payloads the client library never sends.
struct RawControl {
	_endpoint: quinn::Endpoint,
	_conn: quinn::Connection,
	send: quinn::SendStream,
	recv: quinn::RecvStream,
	decoder: FrameDecoder,
}

impl RawControl {
	async fn connect(addr: SocketAddr, cert: &[u8]) -> Self {
		let mut roots = rustls::RootCertStore::empty();
		roots
			.add(rustls::pki_types::CertificateDer::from(cert.to_vec()))
			.expect("pin dev cert");
		let mut tls = rustls::ClientConfig::builder()
			.with_root_certificates(roots)
			.with_no_client_auth();
		tls.alpn_protocols = vec![agora_protocol::ALPN.to_vec()];
		let quic_tls = quinn::crypto::rustls::QuicClientConfig::try_from(tls).expect("quic tls config");

		let mut endpoint = quinn::Endpoint::client(SocketAddr::from(([127, 0, 0, 1], 0))).expect("client endpoint");
		endpoint.set_default_client_config(quinn::ClientConfig::new(Arc::new(quic_tls)));

		let conn = endpoint
			.connect(addr, "localhost")
			.expect("start connect")
			.await
			.expect("connect");
		let (send, recv) = conn.open_bi().await.expect("open control stream");

		let mut raw = Self {
			_endpoint: endpoint,
			_conn: conn,
			send,
			recv,
			decoder: FrameDecoder::new(DEFAULT_MAX_FRAME_SIZE),
		};

		raw.send_envelope(agora_protocol::envelope(
			"",
			pb::envelope::Msg::Hello(pb::Hello {
				client_name: "raw-test".to_string(),
			}),
		))
		.await;

		assert!(matches!(raw.next().await.msg, Some(pb::envelope::Msg::Welcome(_))));
		assert!(matches!(raw.next().await.msg, Some(pb::envelope::Msg::History(_))));
		assert!(matches!(raw.next().await.msg, Some(pb::envelope::Msg::Users(_))));
		raw
	}

	async fn send_envelope(&mut self, env: pb::Envelope) {
		let frame = encode_frame(&env, DEFAULT_MAX_FRAME_SIZE).expect("encode");
		self.send_bytes(&frame).await;
	}

	async fn send_bytes(&mut self, bytes: &[u8]) {
		self.send.write_all(bytes).await.expect("write");
	}

	async fn next(&mut self) -> pb::Envelope {
		tokio::time::timeout(STEP, async {
			let mut tmp = [0u8; 8192];
			loop {
				if let Some(env) = self.decoder.next_frame::<pb::Envelope>().expect("decode") {
					return env;
				}
				let n = self.recv.read(&mut tmp).await.expect("read").expect("stream open");
				self.decoder.extend(&tmp[..n]);
			}
		})
		.await
		.expect("timed out waiting for server frame")
	}

	async fn expect_error(&mut self) -> pb::Error {
		match self.next().await.msg {
			Some(pb::envelope::Msg::Error(e)) => e,
			other => panic!("expected error, got: {other:?}"),
		}
	}

	async fn assert_still_served(&mut self) {
		self.send_envelope(agora_protocol::envelope(
			"ping",
			pb::envelope::Msg::Ping(pb::Ping { client_time_unix_ms: 42 }),
		))
		.await;
		let env = self.next().await;
		assert_eq!(env.request_id, "ping");
		assert!(matches!(env.msg, Some(pb::envelope::Msg::Pong(p)) if p.client_time_unix_ms == 42));
	}
}

#[tokio::test]
async fn undecodable_frame_is_rejected_and_connection_stays_usable() {
	let (addr, cert) = start_server().await;
	let mut raw = RawControl::connect(addr, &cert).await;

	raw.send_bytes(&[0, 0, 0, 3, 0xff, 0xff, 0xff]).await;
	let err = raw.expect_error().await;
	assert_eq!(err.code, codes::MALFORMED_PAYLOAD);

	raw.assert_still_served().await;
}

#[tokio::test]
async fn server_only_payload_from_client_is_malformed() {
	let (addr, cert) = start_server().await;
	let mut raw = RawControl::connect(addr, &cert).await;

	raw.send_envelope(agora_protocol::envelope(
		"r1",
		pb::envelope::Msg::Lagged(pb::Lagged { dropped: 3 }),
	))
	.await;
	let err = raw.expect_error().await;
	assert_eq!(err.code, codes::MALFORMED_PAYLOAD);
	assert_eq!(err.request_id, "r1");

	raw.assert_still_served().await;
}

#[tokio::test]
async fn wrong_envelope_version_after_hello_is_unsupported() {
	let (addr, cert) = start_server().await;
	let mut raw = RawControl::connect(addr, &cert).await;

	raw.send_envelope(pb::Envelope {
		version: PROTOCOL_VERSION + 1,
		request_id: "r2".to_string(),
		msg: Some(pb::envelope::Msg::SendMessage(pb::SendMessage {
			text: "from the future".to_string(),
		})),
	})
	.await;
	let err = raw.expect_error().await;
	assert_eq!(err.code, codes::UNSUPPORTED_VERSION);
	assert_eq!(err.request_id, "r2");

	raw.assert_still_served().await;
}

#[tokio::test]
async fn empty_envelope_is_malformed() {
	let (addr, cert) = start_server().await;
	let mut raw = RawControl::connect(addr, &cert).await;

	raw.send_envelope(pb::Envelope {
		version: PROTOCOL_VERSION,
		request_id: "r3".to_string(),
		msg: None,
	})
	.await;
	let err = raw.expect_error().await;
	assert_eq!(err.code, codes::MALFORMED_PAYLOAD);
	assert_eq!(err.request_id, "r3");
}
