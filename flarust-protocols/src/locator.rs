//! Method locator: §4.3.
//!
//! One global [`MethodLocator`] maps protocol-specific method keys (a method
//! full name, `(magic, cmd)`, `"/service/method"`, ...) to resolved
//! [`MethodDescriptor`]s. Each protocol driver is its own *tag type*
//! ([`ProtocolTag`]) with an associated `Key` type, so `FlareStd` and
//! `Svrkit` keep entirely separate tables even though both ultimately index
//! into the same locator.
//!
//! The write side (`register_method`, `add_service`) takes an exclusive
//! lock. The read side (`try_get_method_desc`) is the hot path: every
//! mutation bumps a per-protocol version counter, and each thread keeps its
//! own snapshot of the key→descriptor map, refreshed only when its cached
//! version falls behind. A lookup on a thread with a fresh snapshot never
//! touches the shared lock at all.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

/// A compile-time tag identifying one wire protocol's method-key space.
pub trait ProtocolTag: 'static {
    /// The shape of a method key for this protocol: a method full name
    /// string, `(u16, u16)` for Svrkit's `(magic, cmd)`, etc.
    type Key: Eq + Hash + Clone + Send + Sync + 'static;
}

/// A decoded service method, resolved by the locator. Request/response
/// (de)serialization is type-erased via `decode_request`/`encode_response`
/// so the locator itself never needs to know concrete prost message types;
/// generated service code supplies these closures at registration time.
pub struct MethodDescriptor {
    pub full_name: String,
    pub service_full_name: String,
    pub method_name: String,
    pub is_stream: bool,
    pub decode_request: Box<dyn Fn(&[u8]) -> Result<Box<dyn Any + Send>, prost::DecodeError> + Send + Sync>,
    pub encode_response: Box<dyn Fn(&(dyn Any + Send)) -> Vec<u8> + Send + Sync>,
}

impl std::fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodDescriptor").field("full_name", &self.full_name).finish()
    }
}

/// A service's set of methods, as added/removed from the locator as one
/// unit via `add_service`/`delete_service`.
pub struct ServiceDescriptor {
    pub full_name: String,
    pub methods: Vec<Arc<MethodDescriptor>>,
}

struct ProtocolTable<K> {
    version: AtomicU64,
    by_key: RwLock<HashMap<K, Arc<MethodDescriptor>>>,
    by_name: RwLock<HashMap<String, K>>,
}

impl<K: Eq + Hash + Clone> ProtocolTable<K> {
    fn new() -> Self {
        Self {
            version: AtomicU64::new(0),
            by_key: RwLock::new(HashMap::new()),
            by_name: RwLock::new(HashMap::new()),
        }
    }
}

struct CachedSnapshot {
    version: u64,
    map: Box<dyn Any>,
}

thread_local! {
    static LOCAL_CACHE: RefCell<HashMap<TypeId, CachedSnapshot>> = RefCell::new(HashMap::new());
}

type ProviderCallback = Arc<dyn Fn(&ServiceDescriptor) + Send + Sync>;

struct ServiceRegistration {
    desc: Arc<ServiceDescriptor>,
    refcount: usize,
}

/// The global registry. Obtain the process-wide instance via
/// [`MethodLocator::global`]; protocol drivers and generated service code
/// never construct one directly.
pub struct MethodLocator {
    tables: RwLock<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
    services: RwLock<HashMap<String, ServiceRegistration>>,
    providers: RwLock<Vec<(ProviderCallback, ProviderCallback)>>,
}

impl Default for MethodLocator {
    fn default() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            services: RwLock::new(HashMap::new()),
            providers: RwLock::new(Vec::new()),
        }
    }
}

impl MethodLocator {
    pub fn global() -> &'static MethodLocator {
        static INSTANCE: OnceLock<MethodLocator> = OnceLock::new();
        INSTANCE.get_or_init(MethodLocator::default)
    }

    pub fn new() -> Self {
        Self::default()
    }

    fn table<P: ProtocolTag>(&self) -> Arc<ProtocolTable<P::Key>> {
        let tid = TypeId::of::<P>();
        if let Some(boxed) = self.tables.read().get(&tid) {
            return boxed.downcast_ref::<Arc<ProtocolTable<P::Key>>>().unwrap().clone();
        }
        let mut tables = self.tables.write();
        let entry = tables
            .entry(tid)
            .or_insert_with(|| Box::new(Arc::new(ProtocolTable::<P::Key>::new())));
        entry.downcast_ref::<Arc<ProtocolTable<P::Key>>>().unwrap().clone()
    }

    /// Registers `desc` under `key` for protocol `P`. A duplicate key or a
    /// duplicate method full name is a program error: both indicate two
    /// methods were wired to the same slot, which can only be a bug in the
    /// caller (generated service registration code, or a hand-written
    /// provider callback).
    pub fn register_method<P: ProtocolTag>(&self, desc: Arc<MethodDescriptor>, key: P::Key) {
        let table = self.table::<P>();
        let mut by_key = table.by_key.write();
        let mut by_name = table.by_name.write();
        assert!(!by_key.contains_key(&key), "duplicate method key registered for {}", desc.full_name);
        assert!(
            !by_name.contains_key(&desc.full_name),
            "duplicate method full name registered: {}",
            desc.full_name
        );
        by_name.insert(desc.full_name.clone(), key.clone());
        by_key.insert(key, desc);
        table.version.fetch_add(1, Ordering::Release);
    }

    pub fn deregister_method<P: ProtocolTag>(&self, full_name: &str) {
        let table = self.table::<P>();
        let mut by_name = table.by_name.write();
        if let Some(key) = by_name.remove(full_name) {
            table.by_key.write().remove(&key);
            table.version.fetch_add(1, Ordering::Release);
        }
    }

    /// The hot path. Refreshes this thread's cached snapshot of protocol
    /// `P`'s key→descriptor map only if it has fallen behind the shared
    /// version counter.
    pub fn try_get_method_desc<P: ProtocolTag>(&self, key: &P::Key) -> Option<Arc<MethodDescriptor>> {
        let table = self.table::<P>();
        let current = table.version.load(Ordering::Acquire);
        let tid = TypeId::of::<P>();

        let snapshot: Arc<HashMap<P::Key, Arc<MethodDescriptor>>> = LOCAL_CACHE.with(|cache| {
            let mut cache = cache.borrow_mut();
            let stale = match cache.get(&tid) {
                Some(s) => s.version != current,
                None => true,
            };
            if stale {
                let snap: Arc<HashMap<P::Key, Arc<MethodDescriptor>>> = Arc::new(table.by_key.read().clone());
                cache.insert(tid, CachedSnapshot { version: current, map: Box::new(snap.clone()) });
                snap
            } else {
                cache.get(&tid).unwrap().map.downcast_ref::<Arc<HashMap<P::Key, Arc<MethodDescriptor>>>>().unwrap().clone()
            }
        });

        snapshot.get(key).cloned()
    }

    /// Registers a provider callback pair, invoked for every method of a
    /// service the first time it's added / the last time it's removed. Each
    /// protocol driver calls this once at startup to opt into service
    /// registration; the callback inspects the method (and its
    /// protocol-specific options) to decide a key, then calls
    /// `register_method::<P>`.
    pub fn register_method_provider(
        &self,
        add: impl Fn(&ServiceDescriptor) + Send + Sync + 'static,
        remove: impl Fn(&ServiceDescriptor) + Send + Sync + 'static,
    ) {
        self.providers.write().push((Arc::new(add), Arc::new(remove)));
    }

    pub fn add_service(&self, desc: Arc<ServiceDescriptor>) {
        let first;
        {
            let mut services = self.services.write();
            let entry = services
                .entry(desc.full_name.clone())
                .or_insert_with(|| ServiceRegistration { desc: desc.clone(), refcount: 0 });
            entry.refcount += 1;
            first = entry.refcount == 1;
        }
        if first {
            for (add_cb, _) in self.providers.read().iter() {
                add_cb(&desc);
            }
        }
    }

    pub fn delete_service(&self, full_name: &str) {
        let removed = {
            let mut services = self.services.write();
            match services.get_mut(full_name) {
                Some(entry) => {
                    entry.refcount -= 1;
                    if entry.refcount == 0 {
                        let desc = services.remove(full_name).unwrap().desc;
                        Some(desc)
                    } else {
                        None
                    }
                }
                None => None,
            }
        };
        if let Some(desc) = removed {
            for (_, remove_cb) in self.providers.read().iter() {
                remove_cb(&desc);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestTag;
    impl ProtocolTag for TestTag {
        type Key = String;
    }

    fn mk_method(name: &str) -> Arc<MethodDescriptor> {
        Arc::new(MethodDescriptor {
            full_name: name.to_string(),
            service_full_name: "Test".into(),
            method_name: name.rsplit('.').next().unwrap().to_string(),
            is_stream: false,
            decode_request: Box::new(|_| Err(prost::DecodeError::new("unused in test"))),
            encode_response: Box::new(|_| Vec::new()),
        })
    }

    #[test]
    fn register_and_lookup() {
        let locator = MethodLocator::new();
        let desc = mk_method("Test.Echo");
        locator.register_method::<TestTag>(desc.clone(), "Test.Echo".to_string());
        let found = locator.try_get_method_desc::<TestTag>(&"Test.Echo".to_string()).unwrap();
        assert_eq!(found.full_name, "Test.Echo");
    }

    #[test]
    fn deregister_removes_lookup() {
        let locator = MethodLocator::new();
        let desc = mk_method("Test.Echo2");
        locator.register_method::<TestTag>(desc, "Test.Echo2".to_string());
        locator.deregister_method::<TestTag>("Test.Echo2");
        assert!(locator.try_get_method_desc::<TestTag>(&"Test.Echo2".to_string()).is_none());
    }

    #[test]
    fn add_delete_service_invokes_providers_once() {
        let locator = Arc::new(MethodLocator::new());
        let added = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let removed = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let (a1, r1) = (added.clone(), removed.clone());
        locator.register_method_provider(
            move |_svc| {
                a1.fetch_add(1, Ordering::SeqCst);
            },
            move |_svc| {
                r1.fetch_add(1, Ordering::SeqCst);
            },
        );

        let svc = Arc::new(ServiceDescriptor { full_name: "Test".into(), methods: vec![] });
        locator.add_service(svc.clone());
        locator.add_service(svc.clone()); // second add: refcount 2, no new callback
        assert_eq!(added.load(Ordering::SeqCst), 1);

        locator.delete_service("Test"); // refcount 1: still registered
        assert_eq!(removed.load(Ordering::SeqCst), 0);
        locator.delete_service("Test"); // refcount 0: provider notified
        assert_eq!(removed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cache_converges_after_write() {
        let locator = MethodLocator::new();
        assert!(locator.try_get_method_desc::<TestTag>(&"X".to_string()).is_none());
        let desc = mk_method("X");
        locator.register_method::<TestTag>(desc, "X".to_string());
        // Same thread, next read observes the new version immediately.
        assert!(locator.try_get_method_desc::<TestTag>(&"X".to_string()).is_some());
    }
}
