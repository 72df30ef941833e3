#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use agora_domain::{DisplayName, Session, SessionId};
use tokio::sync::RwLock;

/// Live mapping from connection identity to its chosen display name.
#[derive(Debug, Clone, Default)]
pub struct SessionDirectory {
	inner: Arc<RwLock<HashMap<SessionId, Option<DisplayName>>>>,
}

impl SessionDirectory {
	pub fn new() -> Self {
		Self::default()
	}

	/// Record presence for `id`. An existing name is kept.
	pub async fn register(&self, id: &SessionId) {
		let mut inner = self.inner.write().await;
		inner.entry(id.clone()).or_insert(None);
		metrics::gauge!("agora_directory_sessions").set(inner.len() as f64);
	}

	/// Upsert the display name. Last write wins.
	pub async fn set_name(&self, id: &SessionId, name: DisplayName) {
		let mut inner = self.inner.write().await;
		inner.insert(id.clone(), Some(name));
		metrics::gauge!("agora_directory_sessions").set(inner.len() as f64);
	}

	pub async fn display_name(&self, id: &SessionId) -> Option<DisplayName> {
		self.inner.read().await.get(id).cloned().flatten()
	}

	/// Every known session, named or not, ordered by id.
	pub async fn list_all(&self) -> Vec<Session> {
		let inner = self.inner.read().await;
		let mut out = inner
			.iter()
			.map(|(id, name)| Session {
				id: id.clone(),
				display_name: name.clone(),
			})
			.collect::<Vec<_>>();
		out.sort_by(|a, b| a.id.cmp(&b.id));
		out
	}

	/// Returns true if the session was known.
	pub async fn remove(&self, id: &SessionId) -> bool {
		let mut inner = self.inner.write().await;
		let removed = inner.remove(id).is_some();
		metrics::gauge!("agora_directory_sessions").set(inner.len() as f64);
		removed
	}

	pub async fn len(&self) -> usize {
		self.inner.read().await.len()
	}

	pub async fn is_empty(&self) -> bool {
		self.inner.read().await.is_empty()
	}
}
