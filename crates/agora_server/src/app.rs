#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use quinn::Endpoint;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::quic::config::QuicServerConfig;
use crate::server::connection::{ConnectionContext, ConnectionSettings, handle_connection};
use crate::server::directory::SessionDirectory;
use crate::server::engine::RoutingEngine;
use crate::server::health::HealthState;
use crate::server::history::{HistoryService, PersistentHistoryBackend};
use crate::server::hub::{ConnectionHub, ConnectionHubConfig};

/// A bound server: QUIC endpoint plus the shared chat state behind it.
pub struct AgoraServer {
	endpoint: Endpoint,
	dev_cert_der: Option<Vec<u8>>,
	ctx: ConnectionContext,
	health: HealthState,
}

impl AgoraServer {
	/// Open the history store, bind the QUIC endpoint and wire the engine to the hub.
	pub async fn bind(cfg: &ServerConfig) -> anyhow::Result<Self> {
		let history = if cfg.persistence.enabled {
			let Some(database_url) = cfg.persistence.database_url.as_deref() else {
				return Err(anyhow!("persistence enabled but no database_url configured"));
			};
			let backend = PersistentHistoryBackend::connect(database_url).await?;
			info!(list_key = %cfg.history.list_key, "history: persistent backend");
			HistoryService::new_persistent(backend, cfg.history.clone())
		} else {
			info!(list_key = %cfg.history.list_key, "history: in-memory backend");
			HistoryService::new_in_memory(cfg.history.clone())
		};

		let retained = history.snapshot().await.context("initial history read")?.len();
		info!(retained, max_len = cfg.history.max_len, "history store ready");

		let hub = ConnectionHub::new(ConnectionHubConfig {
			subscriber_queue_capacity: cfg.server.subscriber_queue_capacity,
			debug_logs: false,
		});
		let directory = SessionDirectory::new();
		let engine = Arc::new(RoutingEngine::new(
			history,
			directory.clone(),
			Arc::new(hub.clone()),
			cfg.sessions.clone(),
		));

		let quic_cfg = QuicServerConfig::new(cfg.server.bind);
		let (endpoint, dev_cert_der) =
			if let (Some(cert_path), Some(key_path)) = (cfg.server.tls_cert_path.as_deref(), cfg.server.tls_key_path.as_deref()) {
				info!(cert = %cert_path.display(), key = %key_path.display(), "loading TLS cert/key");
				(quic_cfg.bind_endpoint_with_tls(cert_path, key_path)?, None)
			} else {
				let (endpoint, cert_der) = quic_cfg.bind_dev_endpoint()?;
				info!(cert_der_len = cert_der.len(), "using dev self-signed certificate");
				(endpoint, Some(cert_der))
			};

		let health = HealthState::new(hub, directory);

		Ok(Self {
			endpoint,
			dev_cert_der,
			ctx: ConnectionContext {
				engine,
				settings: ConnectionSettings {
					max_frame_bytes: cfg.server.max_frame_bytes,
					..ConnectionSettings::default()
				},
			},
			health,
		})
	}

	pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
		self.endpoint.local_addr().context("endpoint local address")
	}

	/// DER certificate when running with a generated dev certificate.
	pub fn dev_cert_der(&self) -> Option<&[u8]> {
		self.dev_cert_der.as_deref()
	}

	pub fn health(&self) -> HealthState {
		self.health.clone()
	}

	pub fn engine(&self) -> Arc<RoutingEngine> {
		Arc::clone(&self.ctx.engine)
	}

	/// Accept connections until the endpoint is closed.
	pub async fn run(self) -> anyhow::Result<()> {
		info!(bind = %self.local_addr()?, "agora_server: QUIC endpoint ready");
		self.health.mark_ready();

		let mut next_conn_id: u64 = 1;

		while let Some(incoming) = self.endpoint.accept().await {
			let conn_id = next_conn_id;
			next_conn_id += 1;
			metrics::counter!("agora_server_connections_total").increment(1);

			let ctx = self.ctx.clone();
			tokio::spawn(async move {
				match incoming.await {
					Ok(connection) => {
						info!(conn_id, remote = %connection.remote_address(), "accepted connection");
						if let Err(e) = handle_connection(conn_id, connection, ctx).await {
							warn!(conn_id, error = %e, "connection handler exited with error");
						}
					}
					Err(e) => {
						warn!(conn_id, error = %e, "failed to establish QUIC connection");
					}
				}
			});
		}

		Ok(())
	}
}
