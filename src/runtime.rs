//! The runtime context: every registry, the agenda and the worker pool.
//!
//! Several runtimes may live in one process. Objects and zones of one
//! runtime must not be stored into another.

use std::{
    cell::RefCell,
    ops::Deref,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Instant,
};

use parking_lot::Mutex;
use thread_local::ThreadLocal;

use crate::{
    agenda::{Agenda, AgendaStats, Priority, TaskletInfo},
    error::{Result, RuntimeError},
    gc_roots::RootSet,
    heap::{
        full_gc::{run_collection, GcStats},
        heuristics::{Heuristics, StaticHeuristics},
        mark::Marker,
        registry::{RegistryStats, ZoneRegistry},
        safepoint::{Safepoint, StopOutcome},
        thread::{Mutator, SafeRegion},
        zone::{ZoneData, ZoneRef},
    },
    options::RuntimeOptions,
    system::{
        class::{self, ClassInfo},
        closure::{CallContext, MagicGetter, NativeFn},
        object::{ObjectId, ObjectRef},
        payload::SymbolInfo,
        store::ObjectStore,
        value::{Value, ValueDisplay},
    },
    threading::{self, MAX_WORKERS},
};

/// Classes every runtime boots with. They survive every collection.
pub struct Predefined {
    pub object: ObjectRef,
    pub class: ObjectRef,
    pub symbol: ObjectRef,
    pub tasklet: ObjectRef,
    pub mutable_set: ObjectRef,
    pub mutable_vector: ObjectRef,
    pub environment: ObjectRef,
    pub closure_connector: ObjectRef,
}

impl Predefined {
    fn all(&self) -> [&ObjectRef; 8] {
        [
            &self.object,
            &self.class,
            &self.symbol,
            &self.tasklet,
            &self.mutable_set,
            &self.mutable_vector,
            &self.environment,
            &self.closure_connector,
        ]
    }

    pub fn mark(&self, marker: &mut Marker) {
        for object in self.all() {
            marker.mark_object(object);
        }
    }
}

pub struct Runtime {
    options: RuntimeOptions,
    safepoint: Arc<Safepoint>,
    zones: ZoneRegistry,
    objects: ObjectStore,
    roots: RootSet,
    agenda: Agenda,
    heuristics: Box<dyn Heuristics>,
    predefined: Predefined,
    current: ThreadLocal<RefCell<Option<Arc<Mutator>>>>,
    gc_count: AtomicUsize,
    pool: Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    pub fn new(options: RuntimeOptions) -> Arc<Self> {
        let safepoint = Arc::new(Safepoint::new());
        let objects = ObjectStore::new(safepoint.clone());
        let predefined = Self::bootstrap(&objects);

        let rt = Arc::new(Self {
            options,
            zones: ZoneRegistry::new(options.initial_zones),
            objects,
            roots: RootSet::new(),
            agenda: Agenda::new(safepoint.clone()),
            heuristics: Box::new(StaticHeuristics::new(
                options.gc_threshold,
                options.guaranteed_gc_interval(),
            )),
            safepoint,
            predefined,
            current: ThreadLocal::new(),
            gc_count: AtomicUsize::new(0),
            pool: Mutex::new(Vec::new()),
        });

        for class in rt.predefined.all() {
            let name = class::class_name(class).unwrap_or_default();
            if let Err(err) = rt.roots.bind_symbol(&name, class) {
                panic!("cannot register predefined class {:?}: {}", name, err);
            }
        }
        log::debug!(target: "gc", "Runtime created: {}", rt.options);
        rt
    }

    fn bootstrap(objects: &ObjectStore) -> Predefined {
        let class = objects.create(None, None);
        class.set_class_unchecked(&class);
        let object = objects.create(Some(&class), None);
        object.install_payload(Box::new(ClassInfo::new("object", None)));
        class.install_payload(Box::new(ClassInfo::new("class", Some(object.clone()))));

        let make = |name: &str| {
            let c = objects.create(Some(&class), None);
            c.install_payload(Box::new(ClassInfo::new(name, Some(object.clone()))));
            c
        };

        Predefined {
            symbol: make("symbol"),
            tasklet: make("tasklet"),
            mutable_set: make("mutable_set"),
            mutable_vector: make("mutable_vector"),
            environment: make("environment"),
            closure_connector: make("closure_connector"),
            object,
            class,
        }
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    pub fn safepoint(&self) -> &Safepoint {
        &self.safepoint
    }

    pub fn zones(&self) -> &ZoneRegistry {
        &self.zones
    }

    pub fn objects(&self) -> &ObjectStore {
        &self.objects
    }

    pub fn roots(&self) -> &RootSet {
        &self.roots
    }

    pub fn agenda(&self) -> &Agenda {
        &self.agenda
    }

    pub fn heuristics(&self) -> &dyn Heuristics {
        &*self.heuristics
    }

    pub fn predefined(&self) -> &Predefined {
        &self.predefined
    }

    pub(crate) fn next_gc_id(&self) -> usize {
        self.gc_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Number of collections run so far.
    pub fn gc_count(&self) -> usize {
        self.gc_count.load(Ordering::Acquire)
    }

    /// Registers a new zone holding `data`. Crossing the allocation
    /// threshold requests a collection, which runs at the next safepoint.
    pub fn allocate<T: ZoneData>(&self, data: T) -> ZoneRef<T> {
        let (zone, allocated) = {
            let _gate = self.safepoint.enter_mutation();
            self.zones.allocate(data)
        };
        if !self.safepoint.is_requested() && self.heuristics.should_start_gc(allocated) {
            self.request_collection();
        }
        zone
    }

    pub fn zone_stats(&self) -> RegistryStats {
        self.zones.stats()
    }

    // Objects

    pub fn create(&self, class: Option<&ObjectRef>, space: Option<&ObjectRef>) -> ObjectRef {
        let _gate = self.safepoint.enter_mutation();
        let class = class.unwrap_or(&self.predefined.object);
        self.objects.create(Some(class), space)
    }

    pub fn find(&self, id: ObjectId) -> Option<ObjectRef> {
        self.objects.find(id)
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Keys of the attributes of `object` as a set value.
    pub fn attr_keys(&self, object: &ObjectRef) -> Value {
        Value::set(self, object.attr_key_list())
    }

    pub fn get_attr(&self, object: &ObjectRef, key: &ObjectRef) -> Value {
        let mutator = self.current_mutator();
        let cx = CallContext::new(self, mutator.as_deref(), None);
        object.get_attr(key, &cx)
    }

    pub fn put_attr(&self, object: &ObjectRef, key: &ObjectRef, value: Value) -> Result<()> {
        object.put_attr(key, value)
    }

    // Roots and symbols

    pub fn add_root(&self, object: &ObjectRef) -> bool {
        self.roots.add(object)
    }

    pub fn remove_root(&self, object: &ObjectRef) -> bool {
        self.roots.remove(object)
    }

    pub fn is_root(&self, object: &ObjectRef) -> bool {
        self.roots.contains(object)
    }

    pub fn list_roots(&self) -> Vec<ObjectRef> {
        self.roots.list()
    }

    /// Returns the symbol named `name`, creating it if needed.
    pub fn register_symbol(&self, name: &str) -> Result<ObjectRef> {
        self.with_mutator(|_| {
            self.roots.intern_with(name, || {
                let symbol = self.create(Some(&self.predefined.symbol), None);
                symbol.install_payload(Box::new(SymbolInfo {
                    name: name.to_string(),
                }));
                symbol
            })
        })
    }

    /// Binds `name` to an arbitrary object, returning the previous binding.
    pub fn bind_symbol(&self, name: &str, object: &ObjectRef) -> Result<Option<ObjectRef>> {
        self.roots.bind_symbol(name, object)
    }

    pub fn unregister_symbol(&self, name: &str) -> Option<ObjectRef> {
        self.roots.unbind_symbol(name)
    }

    pub fn find_symbol(&self, name: &str) -> Option<ObjectRef> {
        self.roots.find_symbol(name)
    }

    pub fn symbol_name(&self, object: &ObjectRef) -> Option<String> {
        self.roots.symbol_name(object)
    }

    pub fn list_symbols(&self) -> Vec<String> {
        self.roots.list_symbols()
    }

    // Classes

    /// Creates a class. Without `superclass` the class derives from `object`.
    pub fn make_class(&self, name: &str, superclass: Option<&ObjectRef>) -> Result<ObjectRef> {
        let superclass = superclass.unwrap_or(&self.predefined.object);
        if !class::is_class(superclass) {
            return Err(RuntimeError::NotAClass(superclass.id()));
        }
        let class = self.with_mutator(|_| {
            let class = self.create(Some(&self.predefined.class), None);
            class.install_payload(Box::new(ClassInfo::new(name, Some(superclass.clone()))));
            class
        });
        Ok(class)
    }

    pub fn is_subclass_of(&self, class: &ObjectRef, superclass: &ObjectRef) -> bool {
        class::is_subclass_of(class, superclass)
    }

    pub fn is_instance_of(&self, object: &ObjectRef, class: &ObjectRef) -> bool {
        class::is_instance_of(object, class)
    }

    pub fn set_superclass(&self, class: &ObjectRef, superclass: Option<&ObjectRef>) -> Result<()> {
        class::set_superclass(class, superclass)
    }

    // Closures

    /// Creates a closure connector whose applying function is `body`.
    pub fn define_native<F>(&self, name: &str, body: F) -> ObjectRef
    where
        F: Fn(&CallContext<'_>, &[Value], &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        self.with_mutator(|_| {
            let connector = self.create(Some(&self.predefined.closure_connector), None);
            connector.set_applier(Some(Arc::new(NativeFn::new(name, body))));
            connector
        })
    }

    /// Makes `key` a magic attribute: reading it on any object calls `getter`.
    pub fn set_magic_getter(&self, key: &ObjectRef, getter: impl MagicGetter + 'static) {
        key.set_magic_getter(Some(Arc::new(getter)));
    }

    pub fn apply(&self, closure: &Value, args: &[Value]) -> Result<Value> {
        let mutator = self.current_mutator();
        let cx = CallContext::new(self, mutator.as_deref(), None);
        closure.apply(&cx, args)
    }

    // Tasklets

    pub fn make_tasklet(&self, closure: Value, obsolescence: Option<Instant>, permanent: bool) -> ObjectRef {
        self.with_mutator(|_| {
            let tasklet = self.create(Some(&self.predefined.tasklet), None);
            tasklet.install_payload(Box::new(TaskletInfo::new(closure, obsolescence, permanent)));
            tasklet
        })
    }

    /// Creates a one-shot tasklet running `closure` and schedules it.
    pub fn add_tasklet(&self, priority: Priority, closure: Value) -> ObjectRef {
        self.with_mutator(|_| {
            let tasklet = self.make_tasklet(closure, None, false);
            self.agenda.push(priority, tasklet.clone());
            tasklet
        })
    }

    /// Queues `tasklet`, moving it if it is already queued.
    pub fn schedule_tasklet(&self, priority: Priority, tasklet: &ObjectRef) -> Result<()> {
        if !tasklet.has_payload::<TaskletInfo>() {
            return Err(RuntimeError::NotATasklet(tasklet.id()));
        }
        self.agenda.push(priority, tasklet.clone());
        Ok(())
    }

    pub fn remove_tasklet(&self, tasklet: &ObjectRef) -> bool {
        self.agenda.remove(tasklet)
    }

    pub fn tasklet_priority(&self, tasklet: &ObjectRef) -> Option<Priority> {
        self.agenda.priority_of(tasklet)
    }

    pub fn queue_len(&self, priority: Priority) -> usize {
        self.agenda.queue_len(priority)
    }

    pub fn pending_count(&self) -> usize {
        self.agenda.pending_count()
    }

    pub fn agenda_stats(&self) -> AgendaStats {
        self.agenda.stats()
    }

    // Worker pool

    /// Starts workers until the pool has `workers` threads (default from
    /// the options, at most [`MAX_WORKERS`]).
    pub fn run_pool(self: &Arc<Self>, workers: Option<usize>) {
        let wanted = workers.unwrap_or(self.options.workers).clamp(1, MAX_WORKERS);
        self.agenda.set_stopping(false);
        let mut pool = self.pool.lock();
        if pool.len() >= wanted {
            return;
        }
        let first = pool.len();
        let mutator = self.current_mutator();
        let _idle = mutator.as_deref().map(|m| SafeRegion::new(&self.safepoint, m));
        let spawned = threading::spawn_workers(self, first, wanted - first);
        pool.extend(spawned);
        log::info!(target: "agenda", "Worker pool running with {} thread(s)", pool.len());
    }

    /// Stops every worker after its current tasklet and waits for them.
    pub fn stop_pool(&self) {
        let handles = std::mem::take(&mut *self.pool.lock());
        if handles.is_empty() {
            return;
        }
        self.agenda.set_stopping(true);
        self.agenda.wake_all();

        let mutator = self.current_mutator();
        let _idle = mutator.as_deref().map(|m| SafeRegion::new(&self.safepoint, m));
        let count = handles.len();
        for handle in handles {
            if handle.join().is_err() {
                log::error!(target: "agenda", "A worker exited by panicking");
            }
        }
        self.agenda.set_stopping(false);
        log::info!(target: "agenda", "Worker pool stopped ({} thread(s))", count);
    }

    pub fn pool_size(&self) -> usize {
        self.pool.lock().len()
    }

    // Collection

    /// Asks for a collection. It runs at the next safepoint of any
    /// attached thread, or on the next [`Runtime::collect`].
    pub fn request_collection(&self) {
        if self.safepoint.request() {
            log::debug!(target: "gc", "Collection requested");
        }
        self.agenda.wake_all();
    }

    /// Runs a collection on the calling thread, or waits for the one
    /// already in progress, and returns its statistics.
    ///
    /// Only roots, symbols, queued tasklets and the frames of attached
    /// threads keep things alive. A [`Value`] or [`ObjectRef`] held only in a
    /// Rust local is not seen: its zones are deregistered and the object is
    /// reclaimed, and marking it in a later collection panics. Store such
    /// values in a [`Frame`](crate::Frame) slot or root them first.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread holds an object guard.
    pub fn collect(&self) -> GcStats {
        self.safepoint.request();
        let mutator = self.current_mutator();
        self.collect_as(mutator.as_deref())
    }

    fn collect_as(&self, mutator: Option<&Mutator>) -> GcStats {
        match self.safepoint.stop_the_world(mutator) {
            StopOutcome::Stopped(world) => {
                let stats = run_collection(self, &world);
                world.finish(stats.clone());
                self.heuristics.record_cycle_end();
                self.agenda.flush_deferred();
                self.agenda.wake_all();
                stats
            }
            StopOutcome::Joined(stats) => stats.unwrap_or_default(),
        }
    }

    /// Collects if a collection was requested. Attached threads must call
    /// this regularly while running long operations.
    pub fn safepoint_poll(&self) {
        if self.safepoint.is_requested() {
            let mutator = self.current_mutator();
            self.collect_as(mutator.as_deref());
        }
    }

    pub fn is_collecting(&self) -> bool {
        self.safepoint.is_collecting()
    }

    /// Heap mutations and tasklet runs observed during a pause.
    pub fn violations(&self) -> usize {
        self.safepoint.violations()
    }

    // Threads

    /// Attaches the calling thread as a mutator until the returned handle
    /// is dropped.
    ///
    /// # Panics
    ///
    /// Panics if the thread is already attached to this runtime.
    pub fn attach_current_thread(&self, name: impl Into<String>) -> MutatorHandle<'_> {
        let slot = self.current.get_or(|| RefCell::new(None));
        assert!(
            slot.borrow().is_none(),
            "thread {:?} is already attached",
            std::thread::current().name()
        );
        let mutator = Arc::new(Mutator::new(name));
        self.safepoint.register(mutator.clone());
        *slot.borrow_mut() = Some(mutator.clone());
        log::trace!(target: "gc", "Attached {}", mutator.name());
        MutatorHandle { rt: self, mutator }
    }

    pub fn current_mutator(&self) -> Option<Arc<Mutator>> {
        self.current.get().and_then(|slot| slot.borrow().clone())
    }

    /// Runs `f` as a running mutator so that no collection starts before
    /// it returns. Unattached threads are attached for the duration.
    fn with_mutator<R>(&self, f: impl FnOnce(&Mutator) -> R) -> R {
        match self.current_mutator() {
            Some(mutator) => f(&mutator),
            None => {
                let handle = self.attach_current_thread("transient");
                f(&handle)
            }
        }
    }

    /// Formats `value` with the configured depth ceiling.
    pub fn display<'v>(&self, value: &'v Value) -> ValueDisplay<'v> {
        value.display(self.options.print_depth)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        // Break reference cycles between objects.
        self.objects.reclaim_all();
    }
}

/// A thread's attachment to a runtime.
pub struct MutatorHandle<'rt> {
    rt: &'rt Runtime,
    mutator: Arc<Mutator>,
}

impl<'rt> MutatorHandle<'rt> {
    /// Marks this mutator idle until the guard is dropped.
    pub fn safe_region(&self) -> SafeRegion<'_> {
        SafeRegion::new(&self.rt.safepoint, &self.mutator)
    }

    pub fn runtime(&self) -> &'rt Runtime {
        self.rt
    }

    /// Calling context for applying closures on this thread.
    pub fn context(&self) -> CallContext<'_> {
        CallContext::new(self.rt, Some(&*self.mutator), None)
    }
}

impl Deref for MutatorHandle<'_> {
    type Target = Mutator;

    fn deref(&self) -> &Mutator {
        &self.mutator
    }
}

impl Drop for MutatorHandle<'_> {
    fn drop(&mut self) {
        self.rt.safepoint.unregister(&self.mutator);
        if let Some(slot) = self.rt.current.get() {
            slot.borrow_mut().take();
        }
        log::trace!(target: "gc", "Detached {}", self.mutator.name());
    }
}
