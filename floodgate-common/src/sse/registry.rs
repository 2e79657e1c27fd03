//! Stream registry keyed by stream id

use super::stream::EventStream;
use crate::config::StreamConfig;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Derive a stream id from an optional session and the request path
///
/// Streams are scoped per session when one is supplied, so two sessions
/// watching the same path do not share a log.
pub fn stream_id(session: Option<&str>, path: &str) -> String {
    match session.map(str::trim).filter(|s| !s.is_empty()) {
        Some(session) => format!("{session}{path}"),
        None => path.to_string(),
    }
}

/// Thread-safe map from stream id to stream
pub struct StreamRegistry {
    config: StreamConfig,
    streams: DashMap<String, Arc<EventStream>>,
}

impl StreamRegistry {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config,
            streams: DashMap::new(),
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Return the stream registered under `id`, creating it if absent
    ///
    /// A registered stream that is already stopping is replaced by a fresh
    /// one, since it no longer accepts events.
    pub fn create_stream(&self, id: &str) -> Arc<EventStream> {
        match self.streams.entry(id.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_stopping() {
                    info!(stream = %id, "Replacing stopped event stream");
                    occupied.insert(EventStream::new(id, self.config.clone()));
                }
                Arc::clone(occupied.get())
            }
            Entry::Vacant(vacant) => {
                info!(stream = %id, "Created event stream");
                Arc::clone(vacant.insert(EventStream::new(id, self.config.clone())).value())
            }
        }
    }

    pub fn get_stream(&self, id: &str) -> Option<Arc<EventStream>> {
        self.streams.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Stop and unregister a stream; `false` if no such stream
    pub fn remove_stream(&self, id: &str) -> bool {
        match self.streams.remove(id) {
            Some((_, stream)) => {
                stream.stop();
                info!(stream = %id, "Removed event stream");
                true
            }
            None => false,
        }
    }

    /// Stop and unregister `stream` only if it is still the registered one
    pub fn remove_if_current(&self, stream: &Arc<EventStream>) -> bool {
        let removed = self
            .streams
            .remove_if(stream.id(), |_, registered| Arc::ptr_eq(registered, stream))
            .is_some();
        if removed {
            stream.stop();
            info!(stream = %stream.id(), "Removed idle event stream");
        }
        removed
    }

    /// Stop and unregister every stream
    pub fn close(&self) {
        for id in self.stream_ids() {
            self.remove_stream(&id);
        }
    }

    /// Gracefully stop every stream concurrently, then unregister them
    pub async fn close_gracefully(&self, timeout: Duration) {
        let streams: Vec<Arc<EventStream>> = self
            .stream_ids()
            .into_iter()
            .filter_map(|id| self.streams.remove(&id).map(|(_, stream)| stream))
            .collect();
        if streams.is_empty() {
            return;
        }

        info!(count = streams.len(), ?timeout, "Gracefully closing event streams");
        join_all(streams.iter().map(|stream| stream.graceful_stop(timeout))).await;
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn stream_ids(&self) -> Vec<String> {
        self.streams.iter().map(|entry| entry.key().clone()).collect()
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new(StreamConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_id_derivation() {
        assert_eq!(stream_id(Some("abc"), "/events/x"), "abc/events/x");
        assert_eq!(stream_id(None, "/events/x"), "/events/x");
        assert_eq!(stream_id(Some("  "), "/events/x"), "/events/x");
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let registry = StreamRegistry::default();
        let a = registry.create_stream("s");
        let b = registry.create_stream("s");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_stopped_stream_replaced_on_create() {
        let registry = StreamRegistry::default();
        let a = registry.create_stream("s");
        a.stop();
        let b = registry.create_stream("s");
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(!b.is_stopping());
    }

    #[tokio::test]
    async fn test_remove_stops_stream() {
        let registry = StreamRegistry::default();
        let stream = registry.create_stream("s");
        assert!(registry.remove_stream("s"));
        assert!(stream.is_stopping());
        assert!(registry.get_stream("s").is_none());
        assert!(!registry.remove_stream("s"));
    }

    #[tokio::test]
    async fn test_remove_if_current_ignores_replacement() {
        let registry = StreamRegistry::default();
        let old = registry.create_stream("s");
        old.stop();
        let current = registry.create_stream("s");

        assert!(!registry.remove_if_current(&old));
        assert!(registry.get_stream("s").is_some());
        assert!(registry.remove_if_current(&current));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_close_stops_all() {
        let registry = StreamRegistry::default();
        let a = registry.create_stream("a");
        let b = registry.create_stream("b");
        registry.close();
        assert!(registry.is_empty());
        assert!(a.is_stopping() && b.is_stopping());
    }
}
