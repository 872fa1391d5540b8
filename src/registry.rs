//! Keyed cache of long-lived resources with idle eviction.
//!
//! An [`IdleRegistry`] maps keys to shared resources (usually spawner
//! servers). Every lookup refreshes the entry's activity time; a background
//! evictor thread stops and removes entries whose idle budget ran out. The
//! evictor's polling interval follows the shortest idle budget present, so
//! a registry holding only long-lived entries wakes rarely and an empty
//! registry does not wake at all until something is inserted.
//!
//! ```text
//!  lookup_or_add ─┐                      ┌──────────────────────────┐
//!  delete ────────┼─▶ Mutex<State> ◀────│ evictor: wait_timeout     │
//!  clear ─────────┘      │  notify       │ (interval) → scan → stop │
//!                        └──────────────▶└──────────────────────────┘
//! ```

use std::borrow::Borrow;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use nix::sys::signal::SigSet;
use tracing::{debug, trace, warn};

use crate::config::RegistryConfig;
use crate::error::{Error, Result};

/// Something the registry can hold: it has an idle budget and can be
/// stopped.
pub trait IdleResource: Send + Sync + 'static {
    /// `None` or zero means the resource is never evicted for idleness.
    fn max_idle_time(&self) -> Option<Duration>;

    fn is_started(&self) -> bool;

    fn stop(&self) -> Result<()>;
}

/// Time source for idle accounting.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
}

/// The monotonic system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to. Useful for exercising eviction
/// without sleeping.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

thread_local! {
    /// Registries whose factory is currently running on this thread.
    static ACTIVE_FACTORIES: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Marks a registry as populating on this thread for the guard's lifetime.
struct FactoryScope {
    id: usize,
}

impl FactoryScope {
    fn enter(id: usize) -> Self {
        ACTIVE_FACTORIES.with(|active| active.borrow_mut().push(id));
        Self { id }
    }

    fn check(id: usize) -> Result<()> {
        if ACTIVE_FACTORIES.with(|active| active.borrow().contains(&id)) {
            Err(Error::RegistryReentered)
        } else {
            Ok(())
        }
    }
}

impl Drop for FactoryScope {
    fn drop(&mut self) {
        ACTIVE_FACTORIES.with(|active| {
            let mut active = active.borrow_mut();
            if let Some(pos) = active.iter().rposition(|id| *id == self.id) {
                active.remove(pos);
            }
        });
    }
}

struct Entry<R> {
    resource: Arc<R>,
    last_activity: Instant,
}

struct State<K, R> {
    entries: HashMap<K, Entry<R>>,
    /// Current evictor interval; `None` when no entry has an idle budget.
    interval: Option<Duration>,
    /// When the evictor scans next. Wakeups only ever move it earlier, so
    /// a steady stream of inserts cannot postpone a scan.
    next_scan: Option<Instant>,
    closed: bool,
}

struct Shared<K, R> {
    state: Mutex<State<K, R>>,
    wakeup: Condvar,
    config: RegistryConfig,
    clock: Arc<dyn Clock>,
}

impl<K, R> Shared<K, R>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + 'static,
    R: IdleResource,
{
    fn lock(&self) -> MutexGuard<'_, State<K, R>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Recompute the polling interval and wake the evictor.
    fn reschedule(&self, state: &mut State<K, R>) {
        state.interval = state
            .entries
            .values()
            .filter_map(|entry| idle_budget(&*entry.resource))
            .min()
            .map(|shortest| self.config.interval_for(shortest));
        let now = self.clock.now();
        state.next_scan = match (state.interval, state.next_scan) {
            (None, _) => None,
            (Some(interval), Some(current)) => Some(current.min(now + interval)),
            (Some(interval), None) => Some(now + interval),
        };
        self.wakeup.notify_all();
    }

    /// Remove every entry whose idle budget has run out.
    fn take_expired(&self, state: &mut State<K, R>) -> Vec<(K, Arc<R>)> {
        let now = self.clock.now();
        let expired: Vec<K> = state
            .entries
            .iter()
            .filter(|(_, entry)| match idle_budget(&*entry.resource) {
                Some(budget) => now.saturating_duration_since(entry.last_activity) >= budget,
                None => false,
            })
            .map(|(key, _)| key.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|key| {
                let entry = state.entries.remove(&key)?;
                Some((key, entry.resource))
            })
            .collect()
    }
}

fn idle_budget<R: IdleResource>(resource: &R) -> Option<Duration> {
    resource.max_idle_time().filter(|budget| !budget.is_zero())
}

fn stop_quietly<K: fmt::Debug, R: IdleResource>(key: &K, resource: &R) {
    if resource.is_started()
        && let Err(e) = resource.stop()
    {
        warn!(?key, error = %e, "Failed to stop registry entry");
    }
}

/// Thread-safe keyed cache with a background idle evictor.
pub struct IdleRegistry<K, R>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + 'static,
    R: IdleResource,
{
    shared: Arc<Shared<K, R>>,
    evictor: Mutex<Option<JoinHandle<()>>>,
}

impl<K, R> IdleRegistry<K, R>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + 'static,
    R: IdleResource,
{
    pub fn new(config: RegistryConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: RegistryConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                entries: HashMap::new(),
                interval: None,
                next_scan: None,
                closed: false,
            }),
            wakeup: Condvar::new(),
            config,
            clock,
        });

        let evictor_shared = Arc::clone(&shared);
        let evictor = thread::Builder::new()
            .name("idle-evictor".into())
            .spawn(move || evictor_loop(evictor_shared))?;

        Ok(Self {
            shared,
            evictor: Mutex::new(Some(evictor)),
        })
    }

    fn id(&self) -> usize {
        Arc::as_ptr(&self.shared) as *const () as usize
    }

    /// Return the entry for `key`, refreshing its activity time, or build
    /// one with `factory` and insert it.
    ///
    /// The registry lock is held while `factory` runs, so concurrent callers
    /// asking for the same key wait and then share the one instance. A
    /// failing factory leaves the registry unchanged. Calling back into this
    /// registry from inside `factory` fails with
    /// [`Error::RegistryReentered`].
    pub fn lookup_or_add<F>(&self, key: K, factory: F) -> Result<Arc<R>>
    where
        F: FnOnce() -> Result<R>,
    {
        FactoryScope::check(self.id())?;
        let mut state = self.shared.lock();
        if state.closed {
            return Err(Error::RegistryClosed);
        }

        if let Some(entry) = state.entries.get_mut(&key) {
            entry.last_activity = self.shared.clock.now();
            return Ok(Arc::clone(&entry.resource));
        }

        let resource = {
            let _scope = FactoryScope::enter(self.id());
            Arc::new(factory()?)
        };
        trace!(?key, "Registry entry created");
        state.entries.insert(
            key,
            Entry {
                resource: Arc::clone(&resource),
                last_activity: self.shared.clock.now(),
            },
        );
        self.shared.reschedule(&mut state);
        Ok(resource)
    }

    /// Remove `key`, stopping its resource if it is running. Returns whether
    /// the key was present.
    pub fn delete<Q>(&self, key: &Q) -> Result<bool>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.remove_where(key, |_| true)
    }

    /// Like [`delete`](Self::delete), but only when `key` still maps to
    /// `resource`. An entry that was replaced in the meantime is left alone.
    pub fn delete_if_same<Q>(&self, key: &Q, resource: &Arc<R>) -> Result<bool>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.remove_where(key, |current| Arc::ptr_eq(current, resource))
    }

    fn remove_where<Q>(&self, key: &Q, matches: impl FnOnce(&Arc<R>) -> bool) -> Result<bool>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        FactoryScope::check(self.id())?;
        let removed = {
            let mut state = self.shared.lock();
            if state.closed {
                return Err(Error::RegistryClosed);
            }
            let removed = match state.entries.get(key) {
                Some(entry) if matches(&entry.resource) => state.entries.remove(key),
                _ => None,
            };
            if removed.is_some() {
                self.shared.reschedule(&mut state);
            }
            removed
        };

        match removed {
            Some(entry) => {
                if entry.resource.is_started() {
                    entry.resource.stop()?;
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Stop and remove every entry.
    pub fn clear(&self) -> Result<()> {
        FactoryScope::check(self.id())?;
        let drained: Vec<(K, Entry<R>)> = {
            let mut state = self.shared.lock();
            if state.closed {
                return Err(Error::RegistryClosed);
            }
            let drained = state.entries.drain().collect();
            self.shared.reschedule(&mut state);
            drained
        };
        for (key, entry) in drained {
            stop_quietly(&key, &*entry.resource);
        }
        Ok(())
    }

    /// Run one eviction scan now and return the keys that were evicted.
    pub fn evict_idle(&self) -> Result<Vec<K>> {
        FactoryScope::check(self.id())?;
        let expired = {
            let mut state = self.shared.lock();
            if state.closed {
                return Err(Error::RegistryClosed);
            }
            let expired = self.shared.take_expired(&mut state);
            if !expired.is_empty() {
                self.shared.reschedule(&mut state);
            }
            expired
        };
        Ok(expired
            .into_iter()
            .map(|(key, resource)| {
                debug!(?key, "Evicting idle registry entry");
                stop_quietly(&key, &*resource);
                key
            })
            .collect())
    }

    /// Stop the evictor, stop every entry and refuse further changes.
    /// Calling it again does nothing.
    pub fn cleanup(&self) -> Result<()> {
        FactoryScope::check(self.id())?;
        let handle = self
            .evictor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return Ok(());
        };

        {
            let mut state = self.shared.lock();
            state.closed = true;
            state.next_scan = None;
            self.shared.wakeup.notify_all();
        }
        if handle.join().is_err() {
            warn!("Registry evictor thread panicked");
        }

        let drained: Vec<(K, Entry<R>)> = self.shared.lock().entries.drain().collect();
        for (key, entry) in drained {
            stop_quietly(&key, &*entry.resource);
        }
        Ok(())
    }

    /// Current evictor interval; `None` while no entry has an idle budget.
    pub fn poll_interval(&self) -> Option<Duration> {
        self.shared.lock().interval
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shared.lock().entries.contains_key(key)
    }

    pub fn get<Q>(&self, key: &Q) -> Option<Arc<R>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shared
            .lock()
            .entries
            .get(key)
            .map(|entry| Arc::clone(&entry.resource))
    }

    pub fn len(&self) -> usize {
        self.shared.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.lock().entries.is_empty()
    }

    pub fn keys(&self) -> Vec<K> {
        self.shared.lock().entries.keys().cloned().collect()
    }

    /// Snapshot of all entries. Does not refresh activity times.
    pub fn entries(&self) -> Vec<(K, Arc<R>)> {
        self.shared
            .lock()
            .entries
            .iter()
            .map(|(key, entry)| (key.clone(), Arc::clone(&entry.resource)))
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }
}

impl<K, R> Drop for IdleRegistry<K, R>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + 'static,
    R: IdleResource,
{
    fn drop(&mut self) {
        let _ = self.cleanup();
    }
}

fn evictor_loop<K, R>(shared: Arc<Shared<K, R>>)
where
    K: Eq + Hash + Clone + fmt::Debug + Send + 'static,
    R: IdleResource,
{
    // Signals belong to the thread running the server main loop.
    let _ = SigSet::all().thread_block();

    let mut state = shared.lock();
    while !state.closed {
        let Some(next_scan) = state.next_scan else {
            state = shared
                .wakeup
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
            continue;
        };
        let now = shared.clock.now();
        if now < next_scan {
            state = shared
                .wakeup
                .wait_timeout(state, next_scan - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
            continue;
        }

        let expired = shared.take_expired(&mut state);
        state.next_scan = None;
        shared.reschedule(&mut state);
        if expired.is_empty() {
            continue;
        }
        drop(state);
        for (key, resource) in &expired {
            debug!(?key, "Evicting idle registry entry");
            stop_quietly(key, &**resource);
        }
        drop(expired);
        state = shared.lock();
    }
    trace!("Registry evictor exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Debug)]
    struct Fake {
        idle: Option<Duration>,
        running: AtomicBool,
        stops: Arc<AtomicUsize>,
    }

    impl Fake {
        fn new(idle: Option<Duration>) -> Self {
            Self::counted(idle, Arc::new(AtomicUsize::new(0)))
        }

        fn counted(idle: Option<Duration>, stops: Arc<AtomicUsize>) -> Self {
            Self {
                idle,
                running: AtomicBool::new(true),
                stops,
            }
        }
    }

    impl IdleResource for Fake {
        fn max_idle_time(&self) -> Option<Duration> {
            self.idle
        }

        fn is_started(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        fn stop(&self) -> Result<()> {
            self.running.store(false, Ordering::SeqCst);
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn manual() -> (Arc<ManualClock>, IdleRegistry<&'static str, Fake>) {
        let clock = Arc::new(ManualClock::new());
        let registry =
            IdleRegistry::with_clock(RegistryConfig::default(), clock.clone() as Arc<dyn Clock>)
                .unwrap();
        (clock, registry)
    }

    #[test]
    fn test_lookup_returns_existing() {
        let (_, registry) = manual();
        let first = registry
            .lookup_or_add("a", || Ok(Fake::new(None)))
            .unwrap();
        let second = registry
            .lookup_or_add("a", || panic!("factory must not run for a cached key"))
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_factory_failure_leaves_registry_unchanged() {
        let (_, registry) = manual();
        let err = registry
            .lookup_or_add("a", || Err(Error::Protocol("boom".into())))
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(registry.is_empty());
        assert_eq!(registry.poll_interval(), None);
    }

    #[test]
    fn test_eviction_respects_individual_budgets() {
        let (clock, registry) = manual();
        let short = registry
            .lookup_or_add("short", || Ok(Fake::new(Some(Duration::from_secs(5)))))
            .unwrap();
        registry
            .lookup_or_add("long", || Ok(Fake::new(Some(Duration::from_secs(30)))))
            .unwrap();

        let interval = registry.poll_interval().unwrap();
        let config = RegistryConfig::default();
        assert!(interval <= Duration::from_secs(5) + config.slack);
        assert!(interval >= config.min_interval);

        clock.advance(Duration::from_secs(5));
        assert_eq!(registry.evict_idle().unwrap(), vec!["short"]);
        assert!(!short.is_started());
        assert!(registry.contains_key("long"));

        let interval = registry.poll_interval().unwrap();
        assert_eq!(interval, Duration::from_secs(30) + config.slack);
    }

    #[test]
    fn test_lookup_refreshes_activity() {
        let (clock, registry) = manual();
        registry
            .lookup_or_add("a", || Ok(Fake::new(Some(Duration::from_secs(5)))))
            .unwrap();
        clock.advance(Duration::from_secs(4));
        registry.lookup_or_add("a", || unreachable!()).unwrap();
        clock.advance(Duration::from_secs(4));
        assert!(registry.evict_idle().unwrap().is_empty());
        clock.advance(Duration::from_secs(1));
        assert_eq!(registry.evict_idle().unwrap(), vec!["a"]);
    }

    #[test]
    fn test_zero_or_unset_budget_never_evicted() {
        let (clock, registry) = manual();
        registry
            .lookup_or_add("zero", || Ok(Fake::new(Some(Duration::ZERO))))
            .unwrap();
        registry
            .lookup_or_add("unset", || Ok(Fake::new(None)))
            .unwrap();
        assert_eq!(registry.poll_interval(), None);

        clock.advance(Duration::from_secs(86_400 * 365));
        assert!(registry.evict_idle().unwrap().is_empty());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_concurrent_lookup_runs_factory_once() {
        let registry: Arc<IdleRegistry<&'static str, Fake>> =
            Arc::new(IdleRegistry::new(RegistryConfig::default()).unwrap());
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let calls = Arc::clone(&calls);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    registry
                        .lookup_or_add("shared", || {
                            calls.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(50));
                            Ok(Fake::new(None))
                        })
                        .unwrap()
                })
            })
            .collect();

        let instances: Vec<Arc<Fake>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(instances.iter().all(|i| Arc::ptr_eq(i, &instances[0])));
    }

    #[test]
    fn test_reentrant_factory_fails_fast() {
        let (_, registry) = manual();
        let err = registry
            .lookup_or_add("outer", || {
                registry
                    .lookup_or_add("inner", || Ok(Fake::new(None)))
                    .map(|_| Fake::new(None))
            })
            .unwrap_err();
        assert!(matches!(err, Error::RegistryReentered));
        assert!(registry.is_empty());

        // The scope is gone once the factory returns.
        registry
            .lookup_or_add("after", || Ok(Fake::new(None)))
            .unwrap();
    }

    #[test]
    fn test_delete_and_clear_stop_resources() {
        let (_, registry) = manual();
        let stops = Arc::new(AtomicUsize::new(0));
        for key in ["a", "b", "c"] {
            let stops = Arc::clone(&stops);
            registry
                .lookup_or_add(key, || Ok(Fake::counted(None, stops)))
                .unwrap();
        }

        assert!(registry.delete("a").unwrap());
        assert!(!registry.delete("a").unwrap());
        assert_eq!(stops.load(Ordering::SeqCst), 1);

        registry.clear().unwrap();
        assert_eq!(stops.load(Ordering::SeqCst), 3);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_delete_if_same_spares_a_replacement() {
        let (_, registry) = manual();
        let stops = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&stops);
        let failed = registry
            .lookup_or_add("a", || Ok(Fake::counted(None, counted)))
            .unwrap();

        // Someone else already replaced the failed entry.
        registry.delete("a").unwrap();
        let replacement = registry
            .lookup_or_add("a", || Ok(Fake::new(None)))
            .unwrap();
        assert_eq!(stops.load(Ordering::SeqCst), 1);

        assert!(!registry.delete_if_same("a", &failed).unwrap());
        assert!(replacement.is_started());
        assert!(registry.contains_key("a"));

        assert!(registry.delete_if_same("a", &replacement).unwrap());
        assert!(!replacement.is_started());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_cleanup_is_idempotent_and_closes() {
        let (_, registry) = manual();
        let stops = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&stops);
        registry
            .lookup_or_add("a", || Ok(Fake::counted(None, counted)))
            .unwrap();

        registry.cleanup().unwrap();
        registry.cleanup().unwrap();
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert!(registry.is_closed());

        assert!(matches!(
            registry.lookup_or_add("b", || Ok(Fake::new(None))),
            Err(Error::RegistryClosed)
        ));
        assert!(matches!(registry.delete("a"), Err(Error::RegistryClosed)));
        assert!(matches!(registry.clear(), Err(Error::RegistryClosed)));
    }

    #[test]
    fn test_background_evictor_removes_idle_entries() {
        let config = RegistryConfig {
            min_interval: Duration::from_millis(10),
            max_interval: Duration::from_secs(1),
            slack: Duration::from_millis(10),
        };
        let registry: IdleRegistry<&'static str, Fake> = IdleRegistry::new(config).unwrap();
        let entry = registry
            .lookup_or_add("a", || Ok(Fake::new(Some(Duration::from_millis(50)))))
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while registry.contains_key("a") && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!registry.contains_key("a"));
        assert!(!entry.is_started());
        assert_eq!(registry.poll_interval(), None);
    }

    #[test]
    fn test_evictor_scans_while_entries_keep_arriving() {
        let config = RegistryConfig {
            min_interval: Duration::from_millis(10),
            max_interval: Duration::from_secs(1),
            slack: Duration::from_millis(10),
        };
        let registry: IdleRegistry<String, Fake> = IdleRegistry::new(config).unwrap();
        registry
            .lookup_or_add("idle".to_string(), || {
                Ok(Fake::new(Some(Duration::from_millis(100))))
            })
            .unwrap();

        // Inserts arrive faster than the idle budget.
        let deadline = Instant::now() + Duration::from_secs(3);
        let mut n = 0;
        while registry.contains_key("idle") && Instant::now() < deadline {
            registry
                .lookup_or_add(format!("busy-{}", n), || Ok(Fake::new(None)))
                .unwrap();
            n += 1;
            thread::sleep(Duration::from_millis(20));
        }
        assert!(!registry.contains_key("idle"));
        assert!(registry.contains_key("busy-0"));
    }

    #[test]
    fn test_drop_stops_entries() {
        let stops = Arc::new(AtomicUsize::new(0));
        {
            let (_, registry) = manual();
            let counted = Arc::clone(&stops);
            registry
                .lookup_or_add("a", || Ok(Fake::counted(None, counted)))
                .unwrap();
        }
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }
}
