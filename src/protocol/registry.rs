use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use lru::LruCache;
use parking_lot::Mutex;

use crate::protocol::messages::Routable;
use crate::protocol::version::{Version, VersionSpec};

/// Encodes and decodes one routable type's body for one wire format
/// generation. Factories are registered per version spec; the repository
/// resolves the right one per request version.
pub trait RoutableFactory: Send + Sync {
    fn encode_body(&self, routable: &Routable, out: &mut BytesMut) -> bool;
    fn decode_body(&self, data: &mut Bytes) -> Option<Routable>;
}

pub type FactoryRef = Arc<dyn RoutableFactory>;

#[derive(Default)]
struct VersionMap {
    factories: BTreeMap<VersionSpec, FactoryRef>,
}

impl VersionMap {
    fn put(&mut self, spec: VersionSpec, factory: FactoryRef) -> bool {
        self.factories.insert(spec, factory).is_some()
    }

    /// The factory registered under the greatest spec not above `version`.
    fn get(&self, version: &Version) -> Option<FactoryRef> {
        self.factories
            .range(..=VersionSpec::from(*version))
            .next_back()
            .map(|(_, factory)| factory.clone())
    }
}

struct CachedFactory {
    factory: FactoryRef,
    generation: u64,
}

struct Inner {
    types: HashMap<u32, VersionMap>,
    cache: LruCache<(Version, u32), CachedFactory>,
    generation: u64,
}

/// Process-wide registry mapping `(routable type, version)` to a factory,
/// with a memoising cache. Registration bumps a generation counter
/// instead of clearing the cache, so concurrent readers see a monotone
/// view; stale entries are replaced on their next lookup.
pub struct RoutableRepository {
    inner: Mutex<Inner>,
}

const CACHE_CAPACITY: usize = 256;

impl Default for RoutableRepository {
    fn default() -> Self {
        RoutableRepository::new()
    }
}

impl RoutableRepository {
    pub fn new() -> Self {
        RoutableRepository {
            inner: Mutex::new(Inner {
                types: HashMap::new(),
                cache: LruCache::new(NonZeroUsize::new(CACHE_CAPACITY).expect("nonzero")),
                generation: 0,
            }),
        }
    }

    pub fn put_factory(&self, spec: VersionSpec, type_id: u32, factory: FactoryRef) {
        let mut inner = self.inner.lock();
        inner.types.entry(type_id).or_default().put(spec, factory);
        inner.generation += 1;
    }

    fn get_factory(&self, version: &Version, type_id: u32) -> Option<FactoryRef> {
        let mut inner = self.inner.lock();
        let generation = inner.generation;
        if let Some(cached) = inner.cache.get(&(*version, type_id)) {
            if cached.generation == generation {
                return Some(cached.factory.clone());
            }
        }
        let factory = inner.types.get(&type_id)?.get(version)?;
        inner.cache.put(
            (*version, type_id),
            CachedFactory { factory: factory.clone(), generation },
        );
        Some(factory)
    }

    /// Resolve without decoding anything; used by tests and diagnostics.
    pub fn lookup(&self, version: &Version, type_id: u32) -> Option<FactoryRef> {
        self.get_factory(version, type_id)
    }

    /// Frame and encode: `u8 priority | u32 type | body` for messages,
    /// `u8 priority | body` for replies. Failures log and yield `None`.
    pub fn encode(&self, version: &Version, routable: &Routable) -> Option<Vec<u8>> {
        let type_id = routable.type_id();
        let factory = match self.get_factory(version, type_id) {
            Some(factory) => factory,
            None => {
                log::error!(
                    "No routable factory found for routable type {} (version {})",
                    type_id,
                    version
                );
                return None;
            }
        };
        // The factory runs outside the registry lock.
        let mut out = BytesMut::with_capacity(64);
        out.put_u8(routable.priority());
        if matches!(routable, Routable::Message(_)) {
            out.put_u32(type_id);
        }
        if !factory.encode_body(routable, &mut out) {
            log::error!(
                "Routable factory failed to serialize routable of type {} (version {})",
                type_id,
                version
            );
            return None;
        }
        Some(out.to_vec())
    }

    /// Decode a framed message.
    pub fn decode_message(&self, version: &Version, data: &[u8]) -> Option<Routable> {
        if data.is_empty() {
            log::error!("Received empty byte array for deserialization");
            return None;
        }
        if data.len() < 5 {
            log::error!("Message frame of {} bytes is too short", data.len());
            return None;
        }
        let mut buf = Bytes::copy_from_slice(data);
        let priority = buf.get_u8();
        let type_id = buf.get_u32();
        self.decode_with(version, type_id, priority, buf)
    }

    /// Decode a framed reply; the expected reply type comes from the
    /// session, not the wire.
    pub fn decode_reply(&self, version: &Version, reply_type: u32, data: &[u8]) -> Option<Routable> {
        if data.is_empty() {
            log::error!("Received empty byte array for deserialization");
            return None;
        }
        let mut buf = Bytes::copy_from_slice(data);
        let priority = buf.get_u8();
        self.decode_with(version, reply_type, priority, buf)
    }

    fn decode_with(
        &self,
        version: &Version,
        type_id: u32,
        priority: u8,
        mut buf: Bytes,
    ) -> Option<Routable> {
        let factory = match self.get_factory(version, type_id) {
            Some(factory) => factory,
            None => {
                log::error!(
                    "No routable factory found for routable type {} (version {})",
                    type_id,
                    version
                );
                return None;
            }
        };
        match factory.decode_body(&mut buf) {
            Some(mut routable) => {
                routable.set_priority(priority);
                Some(routable)
            }
            None => {
                log::error!(
                    "Routable factory failed to deserialize routable of type {} (version {})",
                    type_id,
                    version
                );
                None
            }
        }
    }

    /// Types decodable at a version.
    pub fn routable_types(&self, version: &Version) -> Vec<u32> {
        let inner = self.inner.lock();
        let mut out: Vec<u32> = inner
            .types
            .iter()
            .filter(|(_, map)| map.get(version).is_some())
            .map(|(type_id, _)| *type_id)
            .collect();
        out.sort_unstable();
        out
    }
}
