//! The attribute cache (`meta`): a key/value cache of extended attributes
//! keyed by `<uuid>.<attr-name>`, backed by a memcache-shaped daemon
//! discovered from the store's host set.
//!
//! The real memcache-daemon wire protocol is an external collaborator out
//! of scope; [`MetaCacheClient`] is the seam a caller plugs a real client
//! into, keeping backend-specific behavior behind a trait rather than
//! hard-coding one implementation.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use log::debug;

use super::Iopx;
use crate::error::DmResult;
use crate::flags::XAttrFlags;
use crate::handle::FileHandle;
use crate::location::Location;

pub trait MetaCacheClient: Send + Sync {
    fn get(&self, key: &str) -> Option<Vec<u8>>;
    fn set(&self, key: &str, value: Vec<u8>, ttl: Duration);
    fn remove(&self, key: &str);
}

/// In-process fallback cache client, used when no daemon-backed client is
/// supplied. Entries expire lazily on read, honoring each entry's own TTL.
#[derive(Default)]
pub struct LocalMetaCache {
    entries: Mutex<HashMap<String, (Vec<u8>, Instant, Duration)>>,
}

impl LocalMetaCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl MetaCacheClient for LocalMetaCache {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((value, inserted, ttl)) if inserted.elapsed() < *ttl => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        self.entries.lock().insert(key.to_string(), (value, Instant::now(), ttl));
    }

    fn remove(&self, key: &str) {
        self.entries.lock().remove(key);
    }
}

/// Configurable TTL; default 10 days for restore trees.
#[derive(Debug, Clone, Copy)]
pub struct MetaTtl(pub Duration);

impl Default for MetaTtl {
    fn default() -> Self {
        Self(Duration::from_secs(10 * 24 * 3600))
    }
}

pub struct Meta {
    child: Arc<dyn Iopx>,
    ttl: MetaTtl,
    client_factory: Box<dyn Fn(&[String]) -> Arc<dyn MetaCacheClient> + Send + Sync>,
    /// Discovered and connected once, not per op: a single session object
    /// shared across threads makes a per-call thread-local connection
    /// unnecessary here.
    client: OnceLock<Arc<dyn MetaCacheClient>>,
}

fn cache_key(uuid: &crate::location::Uuid, name: &str) -> String {
    format!("{}.{}", uuid.to_hex_string(), name)
}

impl Meta {
    pub fn new(child: Arc<dyn Iopx>, ttl: MetaTtl) -> Arc<Self> {
        Self::with_client_factory(child, ttl, |_hosts| LocalMetaCache::new() as Arc<dyn MetaCacheClient>)
    }

    pub fn with_client_factory(
        child: Arc<dyn Iopx>,
        ttl: MetaTtl,
        factory: impl Fn(&[String]) -> Arc<dyn MetaCacheClient> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            child,
            ttl,
            client_factory: Box::new(factory),
            client: OnceLock::new(),
        })
    }

    fn client(&self) -> DmResult<&Arc<dyn MetaCacheClient>> {
        if self.client.get().is_none() {
            let hosts = self.child.gethosts()?;
            debug!("meta: discovered {} cache host(s)", hosts.len());
            let _ = self.client.set((self.client_factory)(&hosts));
        }
        Ok(self.client.get().expect("client initialized above"))
    }
}

impl Iopx for Meta {
    fn name(&self) -> &'static str {
        "meta"
    }

    fn child(&self) -> Option<&Arc<dyn Iopx>> {
        Some(&self.child)
    }

    fn fgetxattr(&self, handle: &FileHandle, name: &str) -> DmResult<Vec<u8>> {
        let key = cache_key(&handle.location().uuid, name);
        if let Some(value) = self.client()?.get(&key) {
            return Ok(value);
        }
        let value = self.child.fgetxattr(handle, name)?;
        self.client()?.set(&key, value.clone(), self.ttl.0);
        Ok(value)
    }

    fn getxattr(&self, loc: &Location, name: &str) -> DmResult<Vec<u8>> {
        let key = cache_key(&loc.uuid, name);
        if let Some(value) = self.client()?.get(&key) {
            return Ok(value);
        }
        let value = self.child.getxattr(loc, name)?;
        self.client()?.set(&key, value.clone(), self.ttl.0);
        Ok(value)
    }

    fn fsetxattr(&self, handle: &FileHandle, name: &str, value: &[u8], flags: XAttrFlags) -> DmResult<()> {
        self.child.fsetxattr(handle, name, value, flags)?;
        self.client()?.set(&cache_key(&handle.location().uuid, name), value.to_vec(), self.ttl.0);
        Ok(())
    }

    fn setxattr(&self, loc: &Location, name: &str, value: &[u8], flags: XAttrFlags) -> DmResult<()> {
        self.child.setxattr(loc, name, value, flags)?;
        self.client()?.set(&cache_key(&loc.uuid, name), value.to_vec(), self.ttl.0);
        Ok(())
    }

    fn fremovexattr(&self, handle: &FileHandle, name: &str) -> DmResult<()> {
        self.child.fremovexattr(handle, name)?;
        self.client()?.remove(&cache_key(&handle.location().uuid, name));
        Ok(())
    }

    fn removexattr(&self, loc: &Location, name: &str) -> DmResult<()> {
        self.child.removexattr(loc, name)?;
        self.client()?.remove(&cache_key(&loc.uuid, name));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::{Product, Uuid};
    use std::sync::Mutex as StdMutex;

    struct RecordingBackend {
        gets: StdMutex<u32>,
    }
    impl Iopx for RecordingBackend {
        fn name(&self) -> &'static str { "backend" }
        fn child(&self) -> Option<&Arc<dyn Iopx>> { None }
        fn gethosts(&self) -> DmResult<Vec<String>> {
            Ok(vec!["cache1".to_string()])
        }
        fn getxattr(&self, _loc: &Location, name: &str) -> DmResult<Vec<u8>> {
            *self.gets.lock().unwrap() += 1;
            Ok(format!("value-for-{name}").into_bytes())
        }
        fn removexattr(&self, _loc: &Location, _name: &str) -> DmResult<()> {
            Ok(())
        }
    }

    #[test]
    fn getxattr_populates_then_hits_cache() {
        let backend = Arc::new(RecordingBackend { gets: StdMutex::new(0) });
        let meta = Meta::new(backend.clone(), MetaTtl::default());
        let loc = Location::new(Product::ClusteredFs, "vol1", "/a").with_uuid(Uuid([3; 16]));

        let first = meta.getxattr(&loc, "user.tag").unwrap();
        let second = meta.getxattr(&loc, "user.tag").unwrap();
        assert_eq!(first, second);
        assert_eq!(*backend.gets.lock().unwrap(), 1, "second get must be served from cache");
    }

    #[test]
    fn removexattr_drops_cache_entry() {
        let backend = Arc::new(RecordingBackend { gets: StdMutex::new(0) });
        let meta = Meta::new(backend.clone(), MetaTtl::default());
        let loc = Location::new(Product::ClusteredFs, "vol1", "/a").with_uuid(Uuid([4; 16]));

        meta.getxattr(&loc, "user.tag").unwrap();
        meta.removexattr(&loc, "user.tag").unwrap();
        meta.getxattr(&loc, "user.tag").unwrap();
        assert_eq!(*backend.gets.lock().unwrap(), 2, "after removal, next get must miss cache");
    }
}
