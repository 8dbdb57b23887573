//! Per-generation build artifact cache.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use serde::Serialize;

use crate::backend::{Backend, BackendError};
use crate::generation::{Generation, GenerationId};

/// The compiled build a generation serves from.
#[derive(Debug, Clone, Serialize)]
pub struct Artifact {
    /// Identifier reported by the backend for this build.
    pub build_id: String,
    /// Base URL requests bound to this artifact are forwarded to.
    pub base_url: String,
    pub loaded_at: SystemTime,
}

impl Artifact {
    pub fn new(build_id: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            build_id: build_id.into(),
            base_url: base_url.into(),
            loaded_at: SystemTime::now(),
        }
    }
}

/// Memoizes artifacts by generation.
///
/// Concurrent `get` calls for a generation that is not cached yet may each
/// load it; the coordinator avoids that by loading once during swap setup,
/// before the generation is visible to anyone else.
pub struct ArtifactCache {
    backend: Arc<dyn Backend>,
    entries: Mutex<HashMap<GenerationId, Arc<Artifact>>>,
}

impl ArtifactCache {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached artifact for `generation`, loading it on a miss.
    pub async fn get(&self, generation: &Generation) -> Result<Arc<Artifact>, BackendError> {
        let cached = self.entries.lock().get(&generation.id()).cloned();
        if let Some(artifact) = cached {
            return Ok(artifact);
        }

        let loaded = self.backend.load_artifact(generation.endpoint()).await?;
        let artifact = generation.set_artifact(Arc::new(loaded));
        self.entries
            .lock()
            .entry(generation.id())
            .or_insert_with(|| artifact.clone());

        tracing::debug!(
            generation = %generation.id(),
            build_id = %artifact.build_id,
            "Artifact loaded"
        );
        Ok(artifact)
    }

    /// Drop the entry for a closed generation.
    pub fn evict(&self, id: GenerationId) -> Option<Arc<Artifact>> {
        self.entries.lock().remove(&id)
    }

    pub fn contains(&self, id: GenerationId) -> bool {
        self.entries.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Endpoint;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingBackend {
        loads: AtomicUsize,
    }

    #[async_trait]
    impl Backend for CountingBackend {
        async fn provision(&self, _generation: GenerationId) -> Result<Endpoint, BackendError> {
            Ok(Endpoint::new("127.0.0.1:1".parse().unwrap()))
        }

        async fn load_artifact(&self, endpoint: &Endpoint) -> Result<Artifact, BackendError> {
            let n = self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(Artifact::new(format!("build-{n}"), endpoint.base_url()))
        }

        async fn teardown(&self, _endpoint: &Endpoint) -> Result<(), BackendError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_get_loads_once() {
        let backend = Arc::new(CountingBackend {
            loads: AtomicUsize::new(0),
        });
        let cache = ArtifactCache::new(backend.clone());
        let gen = Generation::new(GenerationId(1), Endpoint::new("127.0.0.1:4000".parse().unwrap()));

        let first = cache.get(&gen).await.unwrap();
        let second = cache.get(&gen).await.unwrap();

        assert_eq!(first.build_id, "build-0");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(backend.loads.load(Ordering::SeqCst), 1);
        assert_eq!(gen.artifact().unwrap().build_id, "build-0");
    }

    #[tokio::test]
    async fn test_evict_removes_entry() {
        let backend = Arc::new(CountingBackend {
            loads: AtomicUsize::new(0),
        });
        let cache = ArtifactCache::new(backend);
        let gen = Generation::new(GenerationId(7), Endpoint::new("127.0.0.1:4000".parse().unwrap()));

        cache.get(&gen).await.unwrap();
        assert!(cache.contains(GenerationId(7)));
        assert!(cache.evict(GenerationId(7)).is_some());
        assert!(cache.evict(GenerationId(7)).is_none());
        assert!(cache.is_empty());
    }
}
