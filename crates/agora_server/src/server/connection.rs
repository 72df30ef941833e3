#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use agora_domain::SessionId;
use agora_protocol::{FrameDecoder, FramingError, PROTOCOL_VERSION, codes, encode_frame, envelope, msg_kind, pb};
use anyhow::{Context as _, anyhow};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::server::engine::RoutingEngine;
use crate::server::events::inbound_from_wire;
use crate::server::hub::HubItem;
use crate::util::time::unix_ms_now;

/// Per-connection settings shared by every accepted connection.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	/// Reported to clients in `Welcome`.
	pub server_name: String,
	pub max_frame_bytes: usize,
	/// How long a new connection may take to send `Hello`.
	pub hello_timeout: Duration,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			server_name: "agora".to_string(),
			max_frame_bytes: agora_protocol::DEFAULT_MAX_FRAME_SIZE,
			hello_timeout: Duration::from_secs(10),
		}
	}
}

/// Shared services a connection needs.
#[derive(Clone)]
pub struct ConnectionContext {
	pub engine: Arc<RoutingEngine>,
	pub settings: ConnectionSettings,
}

/// What the reader task hands to the connection loop.
#[derive(Debug)]
enum Inbound {
	Envelope(pb::Envelope),
	/// A complete frame whose payload did not decode.
	Malformed(String),
}

pub async fn handle_connection(conn_id: u64, connection: quinn::Connection, ctx: ConnectionContext) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("agora_server_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("agora_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let max_frame_bytes = ctx.settings.max_frame_bytes;
	let (mut control_send, mut control_recv) =
		connection.accept_bi().await.context("accept control bidirectional stream")?;

	let (in_tx, mut in_rx) = mpsc::unbounded_channel::<Inbound>();
	let reader_task = tokio::spawn(async move {
		let mut decoder = FrameDecoder::new(max_frame_bytes);
		let mut tmp = [0u8; 8192];

		loop {
			let n = match control_recv.read(&mut tmp).await {
				Ok(Some(n)) => n,
				Ok(None) => return Ok::<(), anyhow::Error>(()),
				Err(e) => return Err(anyhow!(e).context("control stream read failed")),
			};

			metrics::counter!("agora_server_bytes_in_total").increment(n as u64);
			decoder.extend(&tmp[..n]);

			loop {
				let item = match decoder.next_frame::<pb::Envelope>() {
					Ok(Some(env)) => {
						metrics::counter!("agora_server_envelopes_in_total").increment(1);
						Inbound::Envelope(env)
					}
					Ok(None) => break,
					Err(FramingError::Decode(e)) => {
						metrics::counter!("agora_server_decode_errors_total").increment(1);
						Inbound::Malformed(e.to_string())
					}
					Err(e) => {
						metrics::counter!("agora_server_decode_errors_total").increment(1);
						return Err(anyhow!(e).context("failed to decode control frame"));
					}
				};

				if in_tx.send(item).is_err() {
					return Ok(());
				}
			}
		}
	});

	let hello = match tokio::time::timeout(ctx.settings.hello_timeout, wait_for_hello(&mut in_rx)).await {
		Ok(Ok(hello)) => hello,
		Ok(Err(HelloRejected::Version(version))) => {
			let _ = send_envelope(
				&mut control_send,
				error_envelope(
					"",
					codes::UNSUPPORTED_VERSION,
					format!("server speaks protocol version {PROTOCOL_VERSION}, client sent {version}"),
				),
				max_frame_bytes,
			)
			.await;
			reader_task.abort();
			return Err(anyhow!("unsupported protocol version {version}"));
		}
		Ok(Err(HelloRejected::Closed)) => {
			reader_task.abort();
			return Err(anyhow!("connection closed before Hello"));
		}
		Err(_) => {
			reader_task.abort();
			return Err(anyhow!("timed out waiting for Hello"));
		}
	};

	let session_id = SessionId::generate();
	info!(
		conn_id,
		session = %session_id,
		client_name = %hello.client_name,
		remote = %connection.remote_address(),
		"received Hello"
	);
	metrics::counter!("agora_server_hello_total").increment(1);

	send_envelope(
		&mut control_send,
		envelope(
			"",
			pb::envelope::Msg::Welcome(pb::Welcome {
				session_id: session_id.as_str().to_string(),
				server_name: ctx.settings.server_name.clone(),
				server_time_unix_ms: unix_ms_now(),
				max_frame_bytes: max_frame_bytes as u32,
			}),
		),
		max_frame_bytes,
	)
	.await?;

	let joined = ctx.engine.on_connect(&session_id).await;

	let (direct_tx, direct_rx) = mpsc::unbounded_channel::<pb::Envelope>();
	if let Err(e) = joined.result {
		warn!(conn_id, session = %session_id, error = %e, "join state not delivered");
		let _ = direct_tx.send(error_envelope("", e.code(), e.to_string()));
	}
	let writer_task = tokio::spawn(run_writer(conn_id, control_send, joined.events, direct_rx, max_frame_bytes));

	while let Some(item) = in_rx.recv().await {
		let env = match item {
			Inbound::Envelope(env) => env,
			Inbound::Malformed(reason) => {
				debug!(conn_id, session = %session_id, reason = %reason, "malformed frame");
				let _ = direct_tx.send(error_envelope("", codes::MALFORMED_PAYLOAD, reason));
				continue;
			}
		};

		let request_id = env.request_id;
		if env.version != PROTOCOL_VERSION {
			let _ = direct_tx.send(error_envelope(
				&request_id,
				codes::UNSUPPORTED_VERSION,
				format!("unsupported protocol version {}", env.version),
			));
			continue;
		}

		let Some(msg) = env.msg else {
			let _ = direct_tx.send(error_envelope(&request_id, codes::MALFORMED_PAYLOAD, "empty envelope"));
			continue;
		};

		let kind = msg_kind(Some(&msg));
		match msg {
			pb::envelope::Msg::Ping(p) => {
				let _ = direct_tx.send(envelope(
					request_id,
					pb::envelope::Msg::Pong(pb::Pong {
						client_time_unix_ms: p.client_time_unix_ms,
						server_time_unix_ms: unix_ms_now(),
					}),
				));
			}
			pb::envelope::Msg::Hello(_) => {
				debug!(conn_id, session = %session_id, "ignoring repeated Hello");
			}
			other => match inbound_from_wire(other) {
				Ok(Some(event)) => {
					if let Err(e) = ctx.engine.handle(&session_id, event).await {
						let _ = direct_tx.send(error_envelope(&request_id, e.code(), e.to_string()));
					}
				}
				Ok(None) => {}
				Err(reason) => {
					debug!(conn_id, session = %session_id, kind, "rejected client payload");
					let _ = direct_tx.send(error_envelope(&request_id, codes::MALFORMED_PAYLOAD, reason));
				}
			},
		}
	}

	ctx.engine.on_disconnect(&session_id).await;
	drop(direct_tx);

	let reader_result = reader_task.await;
	let _ = writer_task.await;
	info!(conn_id, session = %session_id, "connection closed");

	match reader_result {
		Ok(result) => result,
		Err(e) => Err(anyhow!(e).context("reader task panicked")),
	}
}

enum HelloRejected {
	Version(u32),
	Closed,
}

async fn wait_for_hello(in_rx: &mut mpsc::UnboundedReceiver<Inbound>) -> Result<pb::Hello, HelloRejected> {
	while let Some(item) = in_rx.recv().await {
		let Inbound::Envelope(env) = item else { continue };
		if let Some(pb::envelope::Msg::Hello(h)) = env.msg {
			if env.version != PROTOCOL_VERSION {
				return Err(HelloRejected::Version(env.version));
			}
			return Ok(h);
		}
	}
	Err(HelloRejected::Closed)
}

/// Drain replies and hub deliveries onto the control stream until both sources close.
async fn run_writer(
	conn_id: u64,
	mut send: quinn::SendStream,
	mut hub_rx: mpsc::Receiver<HubItem>,
	mut direct_rx: mpsc::UnboundedReceiver<pb::Envelope>,
	max_frame_bytes: usize,
) {
	let mut hub_open = true;
	let mut direct_open = true;

	while hub_open || direct_open {
		let env = tokio::select! {
			biased;
			d = direct_rx.recv(), if direct_open => match d {
				Some(env) => env,
				None => {
					direct_open = false;
					continue;
				}
			},
			h = hub_rx.recv(), if hub_open => match h {
				Some(HubItem::Event(ev)) => envelope("", ev.into_wire()),
				Some(HubItem::Lagged { dropped }) => {
					metrics::counter!("agora_server_lagged_total").increment(1);
					envelope("", pb::envelope::Msg::Lagged(pb::Lagged { dropped }))
				}
				None => {
					hub_open = false;
					continue;
				}
			},
		};

		if let Err(e) = send_envelope(&mut send, env, max_frame_bytes).await {
			debug!(conn_id, error = %e, "control stream write failed; stopping writer");
			return;
		}
	}

	let _ = send.finish();
}

fn error_envelope(request_id: &str, code: &str, message: impl Into<String>) -> pb::Envelope {
	envelope(
		request_id,
		pb::envelope::Msg::Error(pb::Error {
			code: code.to_string(),
			message: message.into(),
			request_id: request_id.to_string(),
		}),
	)
}

async fn send_envelope(send: &mut quinn::SendStream, env: pb::Envelope, max_frame_bytes: usize) -> anyhow::Result<()> {
	let frame = encode_frame(&env, max_frame_bytes).map_err(|e| anyhow!(e))?;
	metrics::counter!("agora_server_envelopes_out_total").increment(1);
	metrics::counter!("agora_server_bytes_out_total").increment(frame.len() as u64);

	send.write_all(&frame).await.context("stream write")?;
	Ok(())
}
