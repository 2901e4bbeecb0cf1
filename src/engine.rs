//! The engine: two shared worker pools plus a lazily-built, cached set of
//! iopx trees.
//!
//! `fast`/`slow` are `threadpool::ThreadPool` instances under the default
//! `parallel` feature; under `serial` they collapse to inline execution, a
//! per-process choice between dispatching work onto a pool or running it
//! inline.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::backends::{BackupServiceAdapter, ClusteredFsAdapter};
use crate::error::DmResult;
use crate::iopx::{FdCache, Iopx, Meta, MetaTtl, Perf};
use crate::location::Product;

#[cfg(feature = "parallel")]
struct WorkPool(threadpool::ThreadPool);
#[cfg(feature = "serial")]
struct WorkPool;

impl WorkPool {
    #[cfg(feature = "parallel")]
    fn new(size: usize) -> Self {
        Self(threadpool::ThreadPool::new(size.max(1)))
    }
    #[cfg(feature = "serial")]
    fn new(_size: usize) -> Self {
        Self
    }

    #[cfg(feature = "parallel")]
    fn execute(&self, job: impl FnOnce() + Send + 'static) {
        self.0.execute(job);
    }
    #[cfg(feature = "serial")]
    fn execute(&self, job: impl FnOnce() + Send + 'static) {
        job();
    }

    #[cfg(feature = "parallel")]
    fn join(&self) {
        self.0.join();
    }
    #[cfg(feature = "serial")]
    fn join(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Source,
    Sink,
}

/// Backend-specific construction parameters for a tree's leaf adapter.
#[derive(Clone)]
pub enum BackendConfig {
    ClusteredFs { root: PathBuf, sharding_enabled: bool },
    BackupService { argument_string: String, root: PathBuf },
}

impl BackendConfig {
    fn product(&self) -> Product {
        match self {
            Self::ClusteredFs { .. } => Product::ClusteredFs,
            Self::BackupService { .. } => Product::BackupService,
        }
    }

    fn build(&self) -> DmResult<Arc<dyn Iopx>> {
        match self {
            Self::ClusteredFs { root, sharding_enabled } => {
                Ok(ClusteredFsAdapter::new(root.clone(), *sharding_enabled)? as Arc<dyn Iopx>)
            }
            Self::BackupService { argument_string, root } => {
                Ok(BackupServiceAdapter::new(argument_string, root.clone())? as Arc<dyn Iopx>)
            }
        }
    }
}

/// Given to the tree builder: which layers to stack above the backend.
#[derive(Clone)]
pub struct TreeConfig {
    pub store: String,
    pub backend: BackendConfig,
    pub fast: bool,
    pub meta_cache: bool,
    pub meta_ttl: MetaTtl,
    pub fd_cache: bool,
    pub fd_cache_size: usize,
}

impl TreeConfig {
    pub fn plain(store: impl Into<String>, backend: BackendConfig) -> Self {
        Self {
            store: store.into(),
            backend,
            fast: true,
            meta_cache: false,
            meta_ttl: MetaTtl::default(),
            fd_cache: false,
            fd_cache_size: 8,
        }
    }

    /// Backup-service restore trees always enable fdcache and meta.
    pub fn restore(store: impl Into<String>, backend: BackendConfig, fd_cache_size: usize) -> Self {
        Self {
            store: store.into(),
            backend,
            fast: true,
            meta_cache: true,
            meta_ttl: MetaTtl::default(),
            fd_cache: true,
            fd_cache_size,
        }
    }
}

type TreeKey = (Product, String, Role);

pub struct Engine {
    fast: WorkPool,
    slow: WorkPool,
    trees: Mutex<HashMap<TreeKey, Arc<dyn Iopx>>>,
}

static ENGINE: OnceLock<Arc<Engine>> = OnceLock::new();

impl Engine {
    fn new() -> Self {
        let workers = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
        Self { fast: WorkPool::new(workers), slow: WorkPool::new(workers), trees: Mutex::new(HashMap::new()) }
    }

    /// A single process-wide engine, constructed on first use.
    pub fn global() -> Arc<Engine> {
        ENGINE.get_or_init(|| Arc::new(Engine::new())).clone()
    }

    pub fn post(&self, fast: bool, job: impl FnOnce() + Send + 'static) {
        if fast {
            self.fast.execute(job);
        } else {
            self.slow.execute(job);
        }
    }

    pub fn stop(&self) {
        self.fast.join();
        self.slow.join();
    }

    /// Builds (or returns the cached) tree for `(product, store, role)`.
    pub fn tree(&self, role: Role, cfg: TreeConfig) -> DmResult<Arc<dyn Iopx>> {
        let key: TreeKey = (cfg.backend.product(), cfg.store.clone(), role);
        if let Some(tree) = self.trees.lock().get(&key).cloned() {
            return Ok(tree);
        }
        let mut node = cfg.backend.build()?;
        if cfg.fd_cache {
            node = FdCache::new(node, cfg.fd_cache_size) as Arc<dyn Iopx>;
        }
        if cfg.meta_cache {
            node = Meta::new(node, cfg.meta_ttl) as Arc<dyn Iopx>;
        }
        node = Perf::new(node) as Arc<dyn Iopx>;
        self.trees.lock().insert(key, node.clone());
        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tree_is_cached_per_product_store_role() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new();
        let cfg = TreeConfig::plain(
            "vol1",
            BackendConfig::ClusteredFs { root: dir.path().to_path_buf(), sharding_enabled: false },
        );
        let a = engine.tree(Role::Source, cfg.clone()).unwrap();
        let b = engine.tree(Role::Source, cfg).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
