use std::{
    collections::{hash_map::DefaultHasher, HashSet},
    hash::{Hash, Hasher},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        mpsc, Arc, Weak,
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use crate::{
    heap::{mark::Marker, thread::Frame},
    system::{
        class::{self, ClassInfo},
        payload::{Environment, Payload},
        ObjectId,
    },
    CallContext, ObjectRef, Priority, Runtime, RuntimeError, RuntimeOptions, Value,
};

fn runtime() -> Arc<Runtime> {
    Runtime::new(RuntimeOptions::default().with_workers(2))
}

fn noop(rt: &Runtime) -> ObjectRef {
    rt.define_native("noop", |_cx, _closed, _args| Ok(Value::Empty))
}

/// Polls `done` from an unattached thread until it holds or `timeout` expires.
fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while !done() {
        if start.elapsed() > timeout {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    true
}

#[test]
fn test_end_to_end_collection() {
    let rt = runtime();
    let c1 = rt.make_class("C1", None).unwrap();
    let name = rt.register_symbol("name").unwrap();

    let a = rt.create(Some(&c1), None);
    a.put_attr(&name, Value::string(&rt, "x")).unwrap();
    let b = rt.create(None, None);
    b.append_component(Value::object(&a));
    rt.add_root(&b);

    let (a_id, b_id, c1_id) = (a.id(), b.id(), c1.id());
    drop((a, c1));

    let stats = rt.collect();
    assert_eq!(stats.gc_id, 1);
    assert_eq!(stats.reclaimed_objects, 0);
    let a = rt.find(a_id).expect("component of a root survives");
    assert!(rt.find(b_id).is_some());
    assert_eq!(a.attr(&name).as_str(), Some("x"));
    assert!(rt.is_instance_of(&a, &rt.find(c1_id).unwrap()));
    drop(a);

    assert!(rt.remove_root(&b));
    let stats = rt.collect();
    assert!(stats.reclaimed_objects >= 3);
    assert!(rt.find(a_id).is_none());
    assert!(rt.find(b_id).is_none());
    assert!(rt.find(c1_id).is_none());
    assert!(b.is_reclaimed());
    assert_eq!(b.nb_components(), 0);

    // Symbols and predefined classes are never collected.
    assert_eq!(rt.find_symbol("name"), Some(name));
    assert!(rt.find(rt.predefined().tasklet.id()).is_some());
    assert_eq!(rt.gc_count(), 2);
    assert_eq!(rt.violations(), 0);
}

#[test]
fn test_zones_follow_reachability() {
    let rt = runtime();
    let holder = rt.create(None, None);
    rt.add_root(&holder);
    holder.append_component(Value::string(&rt, "kept"));
    let _garbage = Value::string(&rt, "dropped");
    let before = rt.zones().len();

    let stats = rt.collect();
    assert_eq!(stats.reclaimed_zones, 1);
    assert_eq!(rt.zones().len(), before - 1);
    assert_eq!(rt.zones().allocated_bytes(), 0);
    assert_eq!(holder.component(0).as_str(), Some("kept"));
}

#[test]
fn test_priority_ordering() {
    let rt = runtime();
    let f = noop(&rt);
    let low = rt.add_tasklet(Priority::Low, Value::closure(&rt, &f, vec![]));
    let high = rt.add_tasklet(Priority::High, Value::closure(&rt, &f, vec![]));
    let normal = rt.add_tasklet(Priority::Normal, Value::closure(&rt, &f, vec![]));

    assert_eq!(rt.pending_count(), 3);
    assert_eq!(rt.tasklet_priority(&low), Some(Priority::Low));
    assert_eq!(rt.agenda().fetch_next(), Some(high));
    assert_eq!(rt.agenda().fetch_next(), Some(normal));
    assert_eq!(rt.agenda().fetch_next(), Some(low));
    assert_eq!(rt.agenda().fetch_next(), None);
}

#[test]
fn test_pending_tasklets_survive_collection() {
    let rt = runtime();
    let f = noop(&rt);
    let t = rt.add_tasklet(Priority::Normal, Value::closure(&rt, &f, vec![Value::int(1)]));
    let (t_id, f_id) = (t.id(), f.id());

    rt.collect();
    assert!(rt.find(t_id).is_some());
    assert!(rt.find(f_id).is_some());

    assert!(rt.remove_tasklet(&t));
    rt.collect();
    assert!(rt.find(t_id).is_none());
    assert!(rt.find(f_id).is_none());
}

#[test]
fn test_schedule_rejects_non_tasklets() {
    let rt = runtime();
    let plain = rt.create(None, None);
    assert_eq!(
        rt.schedule_tasklet(Priority::High, &plain),
        Err(RuntimeError::NotATasklet(plain.id()))
    );
    assert_eq!(rt.pending_count(), 0);
}

#[test]
fn test_pause_barrier() {
    const TASKLETS: usize = 400;

    let rt = Runtime::new(
        RuntimeOptions::default()
            .with_workers(4)
            .with_gc_threshold(64 * 1024),
    );
    let ran_during_pause = Arc::new(AtomicUsize::new(0));

    let flag = ran_during_pause.clone();
    let work = rt.define_native("work", move |cx, _closed, _args| {
        let rt = cx.runtime();
        if rt.safepoint().is_stopped() {
            flag.fetch_add(1, Ordering::SeqCst);
        }
        let mut frame = cx.frame("work", 1);
        let node = rt.create(None, None);
        frame.set_object(0, &node);
        for i in 0..32 {
            node.append_component(Value::string(rt, &format!("component {}", i)));
        }
        rt.safepoint_poll();
        if rt.safepoint().is_stopped() {
            flag.fetch_add(1, Ordering::SeqCst);
        }
        assert_eq!(node.nb_components(), 32);
        Ok(Value::Empty)
    });
    rt.add_root(&work);

    let main = rt.attach_current_thread("main");
    rt.run_pool(None);
    assert_eq!(rt.pool_size(), 4);
    for i in 0..TASKLETS {
        let mut frame = Frame::new(&main, "submit", 1);
        let closure = Value::closure(&rt, &work, vec![]);
        frame.set(0, closure.clone());
        rt.add_tasklet(Priority::ALL[i % 3], closure);
        drop(frame);
        if i % 50 == 0 {
            rt.collect();
        }
    }

    {
        let _idle = main.safe_region();
        assert!(wait_until(Duration::from_secs(30), || {
            let stats = rt.agenda_stats();
            stats.executed + stats.failed == TASKLETS
        }));
    }
    rt.collect();
    rt.stop_pool();
    drop(main);

    let stats = rt.agenda_stats();
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.executed, TASKLETS);
    assert_eq!(ran_during_pause.load(Ordering::SeqCst), 0);
    assert_eq!(rt.violations(), 0);
    assert!(rt.gc_count() >= TASKLETS / 50);
}

/// Schedules its tasklet from inside the mark phase, while the world is
/// stopped. It does not mark the tasklet itself.
struct ScheduleOnMark {
    rt: Weak<Runtime>,
    tasklet: Mutex<Option<ObjectRef>>,
}

impl Payload for ScheduleOnMark {
    crate::payload_kind!("schedule_on_mark");

    fn mark(&self, _marker: &mut Marker) {
        let tasklet = self.tasklet.lock().take();
        if let (Some(rt), Some(tasklet)) = (self.rt.upgrade(), tasklet) {
            assert!(rt.safepoint().is_stopped());
            rt.schedule_tasklet(Priority::Normal, &tasklet).unwrap();
        }
    }
}

#[test]
fn test_scheduling_during_pause_is_deferred() {
    let rt = runtime();
    let f = noop(&rt);
    let tasklet = rt.make_tasklet(Value::closure(&rt, &f, vec![]), None, false);
    drop(f);

    let carrier = rt.create(None, None);
    carrier.put_payload(ScheduleOnMark {
        rt: Arc::downgrade(&rt),
        tasklet: Mutex::new(Some(tasklet.clone())),
    })
    .unwrap();
    rt.add_root(&carrier);

    rt.collect();
    assert_eq!(rt.agenda_stats().deferred, 1);
    assert!(!tasklet.is_reclaimed());
    assert!(rt.find(tasklet.id()).is_some());
    assert_eq!(rt.tasklet_priority(&tasklet), Some(Priority::Normal));
    assert_eq!(rt.violations(), 0);

    // The deferred tasklet runs normally once the pause is over.
    rt.run_pool(Some(1));
    assert!(wait_until(Duration::from_secs(10), || rt.agenda_stats().executed == 1));
    rt.stop_pool();
}

#[test]
fn test_obsolete_tasklet_closure_is_not_marked() {
    let rt = runtime();
    let connector = noop(&rt);
    let closure = Value::closure(&rt, &connector, vec![Value::string(&rt, "captured")]);
    let tasklet = rt.make_tasklet(closure, Some(Instant::now()), false);
    rt.schedule_tasklet(Priority::High, &tasklet).unwrap();
    let connector_id = connector.id();
    drop(connector);

    rt.collect();
    assert!(rt.find(tasklet.id()).is_some());
    assert!(rt.find(connector_id).is_none());

    rt.run_pool(Some(1));
    assert!(wait_until(Duration::from_secs(10), || rt.agenda_stats().skipped_obsolete == 1));
    rt.stop_pool();
    assert_eq!(rt.agenda_stats().executed, 0);
    assert_eq!(rt.agenda_stats().failed, 0);
}

#[test]
fn test_permanent_tasklet_stays_pinned() {
    let rt = runtime();
    let f = noop(&rt);
    let tasklet = rt.make_tasklet(Value::closure(&rt, &f, vec![]), None, true);
    rt.schedule_tasklet(Priority::Low, &tasklet).unwrap();

    rt.run_pool(Some(1));
    assert!(wait_until(Duration::from_secs(10), || rt.agenda_stats().executed == 1));
    rt.stop_pool();

    assert!(rt.agenda().is_pinned(&tasklet));
    rt.collect();
    assert!(rt.find(tasklet.id()).is_some());

    assert!(rt.remove_tasklet(&tasklet));
    rt.collect();
    assert!(rt.find(tasklet.id()).is_none());
}

#[test]
fn test_tasklet_failures_are_isolated() {
    let rt = runtime();
    let failing = rt.define_native("failing", |_cx, _closed, _args| {
        Err(RuntimeError::failure("expected failure"))
    });
    let panicking = rt.define_native("panicking", |cx, _closed, _args| {
        let _frame = cx.frame("panicking", 1);
        panic!("expected panic")
    });
    let counter = Arc::new(AtomicUsize::new(0));
    let c = counter.clone();
    let counting = rt.define_native("counting", move |_cx, _closed, _args| {
        c.fetch_add(1, Ordering::SeqCst);
        Ok(Value::Empty)
    });

    rt.add_tasklet(Priority::High, Value::closure(&rt, &failing, vec![]));
    rt.add_tasklet(Priority::High, Value::closure(&rt, &panicking, vec![]));
    rt.add_tasklet(Priority::Normal, Value::closure(&rt, &counting, vec![]));
    rt.add_tasklet(Priority::Low, Value::closure(&rt, &counting, vec![]));

    rt.run_pool(Some(1));
    assert!(wait_until(Duration::from_secs(10), || {
        let stats = rt.agenda_stats();
        stats.executed + stats.failed == 4
    }));
    rt.stop_pool();

    let stats = rt.agenda_stats();
    assert_eq!(stats.failed, 2);
    assert_eq!(stats.executed, 2);
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[test]
fn test_frames_keep_locals_alive() {
    let rt = runtime();
    let main = rt.attach_current_thread("main");

    let id = {
        let mut frame = Frame::new(&main, "outer", 1);
        let object = rt.create(None, None);
        frame.set_object(0, &object);
        let slot = frame.push(Value::string(&rt, "local"));
        assert_eq!(slot, 1);
        assert_eq!(main.backtrace(), vec!["outer"]);

        let stats = rt.collect();
        assert_eq!(stats.reclaimed_objects, 0);
        assert!(rt.find(object.id()).is_some());
        assert_eq!(frame.get(1).as_str(), Some("local"));
        object.id()
    };

    assert_eq!(main.depth(), 0);
    rt.collect();
    assert!(rt.find(id).is_none());
    assert_eq!(rt.violations(), 0);
}

#[test]
#[should_panic(expected = "out of order")]
fn test_frames_must_pop_in_order() {
    let rt = runtime();
    let main = rt.attach_current_thread("main");
    let outer = Frame::new(&main, "outer", 0);
    let _inner = Frame::new(&main, "inner", 0);
    drop(outer);
}

#[test]
fn test_magic_getter() {
    let rt = runtime();
    let key = rt.register_symbol("answer").unwrap();
    rt.set_magic_getter(&key, |value: &Value, _key: &ObjectRef, _cx: &CallContext<'_>| {
        match value.as_object() {
            Some(object) => Value::int(object.nb_components() as i64 + 42),
            None => Value::Empty,
        }
    });

    let object = rt.create(None, None);
    assert_eq!(rt.get_attr(&object, &key), Value::int(42));
    object.append_component(Value::int(0));
    assert_eq!(rt.get_attr(&object, &key), Value::int(43));
    assert_eq!(
        rt.put_attr(&object, &key, Value::int(1)),
        Err(RuntimeError::MagicAttribute(key.id()))
    );
    assert_eq!(object.nb_attrs(), 0);
}

#[test]
fn test_closure_application() {
    let rt = runtime();
    let add = rt.define_native("add", |_cx, closed, args| {
        let total = closed
            .iter()
            .chain(args.iter())
            .map(|v| v.as_int().ok_or_else(|| RuntimeError::failure("add expects integers")))
            .sum::<Result<i64, RuntimeError>>()?;
        Ok(Value::int(total))
    });
    let pair = rt.define_native("pair", |cx, _closed, args| {
        cx.check_arity("pair", args, 2)?;
        Ok(Value::deque(cx.runtime(), args.iter().cloned()))
    });

    let add1 = Value::closure(&rt, &add, vec![Value::int(1)]);
    assert_eq!(rt.apply(&add1, &[]), Ok(Value::int(1)));
    assert_eq!(rt.apply(&add1, &[Value::int(2), Value::int(3)]), Ok(Value::int(6)));
    let five: Vec<Value> = (1..=5).map(Value::int).collect();
    assert_eq!(rt.apply(&add1, &five), Ok(Value::int(16)));
    assert!(rt.apply(&add1, &[Value::Empty]).is_err());

    let pair = Value::closure(&rt, &pair, vec![]);
    assert_eq!(pair.len(), 0);
    assert_eq!(
        rt.apply(&pair, &[Value::int(1)]),
        Err(RuntimeError::BadArity {
            name: "pair".to_string(),
            expected: 2,
            got: 1
        })
    );
    assert_eq!(rt.apply(&pair, &[Value::int(1), Value::int(2)]).unwrap().len(), 2);

    let plain = rt.create(None, None);
    let not_callable = Value::closure(&rt, &plain, vec![]);
    assert_eq!(
        rt.apply(&not_callable, &[]),
        Err(RuntimeError::NotCallable(plain.id()))
    );
    assert!(rt.apply(&Value::int(3), &[]).is_err());
}

#[test]
fn test_class_cycles_rejected() {
    let rt = runtime();
    let a = rt.make_class("a", None).unwrap();
    let b = rt.make_class("b", Some(&a)).unwrap();
    let c = rt.make_class("c", Some(&b)).unwrap();

    assert_eq!(
        rt.set_superclass(&a, Some(&c)),
        Err(RuntimeError::CyclicClass {
            subclass: a.id(),
            superclass: c.id()
        })
    );
    assert!(rt.is_subclass_of(&c, &a));
    assert!(!rt.is_subclass_of(&a, &c));

    let instance = rt.create(Some(&c), None);
    assert!(rt.is_instance_of(&instance, &a));
    assert!(rt.is_instance_of(&instance, &rt.predefined().object));
    assert!(!rt.is_instance_of(&instance, &rt.predefined().class));

    assert_eq!(
        rt.make_class("d", Some(&instance)),
        Err(RuntimeError::NotAClass(instance.id()))
    );
    assert_eq!(
        instance.set_class(&instance),
        Err(RuntimeError::NotAClass(instance.id()))
    );
}

#[test]
fn test_object_ids_are_unique() {
    let rt = runtime();
    let ids: HashSet<ObjectId> = (0..10_000).map(|_| rt.create(None, None).id()).collect();
    assert_eq!(ids.len(), 10_000);

    let object = rt.create(None, None);
    let text = object.id().to_string();
    assert_eq!(text.len(), 23);
    assert_eq!(text.parse::<ObjectId>(), Ok(object.id()));
    assert_eq!(rt.find(text.parse().unwrap()), Some(object));
}

#[test]
fn test_attributes_and_mtime() {
    let rt = runtime();
    let key = rt.register_symbol("color").unwrap();
    let other = rt.register_symbol("size").unwrap();
    let object = rt.create(None, None);

    let t0 = object.mtime();
    object.put_attr(&key, Value::string(&rt, "red")).unwrap();
    let t1 = object.mtime();
    object.put_attr(&other, Value::int(3)).unwrap();
    let t2 = object.mtime();
    assert!(t0 <= t1 && t1 <= t2);

    assert_eq!(object.attr(&key).as_str(), Some("red"));
    assert_eq!(object.nb_attrs(), 2);
    assert_eq!(rt.attr_keys(&object), Value::set(&rt, vec![key.clone(), other.clone()]));

    object.put_attr(&key, Value::Empty).unwrap();
    assert_eq!(object.attr(&key), Value::Empty);
    assert_eq!(object.nb_attrs(), 1);
    assert!(object.mtime() >= t2);

    assert_eq!(object.remove_attr(&other), Value::int(3));
    assert_eq!(object.nb_attrs(), 0);
}

#[test]
fn test_components() {
    let rt = runtime();
    let object = rt.create(None, None);
    for i in 0..4 {
        object.append_component(Value::int(i));
    }
    assert_eq!(object.component(-1), Value::int(3));
    object.put_component(-1, Value::int(30)).unwrap();
    assert_eq!(object.component(3), Value::int(30));
    assert_eq!(
        object.put_component(4, Value::int(0)),
        Err(RuntimeError::ComponentIndex { index: 4, len: 4 })
    );
    object.truncate_components(2);
    assert_eq!(object.components(), vec![Value::int(0), Value::int(1)]);
    assert_eq!(object.component(5), Value::Empty);
}

#[test]
fn test_set_construction_is_idempotent() {
    let rt = runtime();
    let objects: Vec<ObjectRef> = (0..5).map(|_| rt.create(None, None)).collect();
    let forward = Value::set(&rt, objects.iter().cloned());
    let backward = Value::set(&rt, objects.iter().rev().cloned().chain(objects.iter().cloned()));

    assert_eq!(forward.len(), 5);
    assert_eq!(forward, backward);

    let hash = |v: &Value| {
        let mut hasher = DefaultHasher::new();
        v.hash(&mut hasher);
        hasher.finish()
    };
    assert_eq!(hash(&forward), hash(&backward));
    for pair in forward.iter().collect::<Vec<_>>().windows(2) {
        assert!(pair[0].as_object().unwrap().id() < pair[1].as_object().unwrap().id());
    }
}

#[test]
fn test_depth_limited_formatting() {
    let rt = Runtime::new(RuntimeOptions::default().with_print_depth(2));
    let mut value = Value::int(0);
    for _ in 0..4 {
        value = Value::deque(&rt, vec![value]);
    }
    assert_eq!(rt.display(&value).to_string(), "deque[deque[…]]");
    assert_eq!(value.display(5).to_string(), "deque[deque[deque[deque[0]]]]");
}

#[test]
fn test_symbols() {
    let rt = runtime();
    for name in ["object", "class", "symbol", "tasklet", "closure_connector"] {
        assert!(rt.find_symbol(name).is_some(), "{} is predefined", name);
    }
    assert!(rt.list_roots().is_empty());

    let s = rt.register_symbol("alpha").unwrap();
    assert_eq!(rt.register_symbol("alpha").unwrap(), s);
    assert_eq!(rt.symbol_name(&s).as_deref(), Some("alpha"));
    assert!(rt.list_symbols().contains(&"alpha".to_string()));
    assert!(matches!(
        rt.register_symbol("9lives"),
        Err(RuntimeError::InvalidSymbolName(_))
    ));

    let id = s.id();
    assert_eq!(rt.unregister_symbol("alpha"), Some(s));
    rt.collect();
    assert!(rt.find(id).is_none());
}

#[test]
fn test_collection_from_several_threads() {
    let rt = runtime();
    let done = Arc::new(AtomicBool::new(false));

    std::thread::scope(|s| {
        for i in 0..3 {
            let rt = &rt;
            let done = done.clone();
            s.spawn(move || {
                let me = rt.attach_current_thread(format!("external-{}", i));
                let mut frame = Frame::new(&me, "loop", 1);
                let mut n = 0;
                while !done.load(Ordering::Acquire) || n < 50 {
                    let object = rt.create(None, None);
                    frame.set_object(0, &object);
                    object.append_component(Value::string(rt, "payload"));
                    if n % 10 == 0 {
                        rt.collect();
                    } else {
                        rt.safepoint_poll();
                    }
                    assert_eq!(object.nb_components(), 1);
                    n += 1;
                }
            });
        }
        for _ in 0..10 {
            rt.collect();
        }
        done.store(true, Ordering::Release);
    });

    assert_eq!(rt.violations(), 0);
    assert!(!rt.is_collecting());
}

#[test]
fn test_deep_hierarchies_are_walked_fully() {
    let rt = runtime();
    let base = rt.make_class("c0", None).unwrap();
    let speak = rt.register_symbol("speak").unwrap();
    class::define_method(&base, &speak, Value::int(7)).unwrap();

    let mut leaf = base.clone();
    for i in 1..1100 {
        leaf = rt.make_class(&format!("c{}", i), Some(&leaf)).unwrap();
    }
    assert!(rt.is_subclass_of(&leaf, &rt.predefined().object));
    assert!(rt.is_subclass_of(&leaf, &base));
    assert!(!rt.is_subclass_of(&base, &leaf));
    assert_eq!(class::method_lookup(&leaf, &speak), Value::int(7));
    let instance = rt.create(Some(&leaf), None);
    assert!(rt.is_instance_of(&instance, &base));

    let x = rt.register_symbol("x").unwrap();
    let global = rt.create(Some(&rt.predefined().environment), None);
    global.put_payload(Environment::new(None)).unwrap();
    global.payload_mut(|env: &mut Environment| env.bind(x.clone(), Value::int(1)));
    let mut env = global.clone();
    for _ in 0..1100 {
        let child = rt.create(Some(&rt.predefined().environment), None);
        child.put_payload(Environment::new(Some(env))).unwrap();
        env = child;
    }
    assert_eq!(Environment::find(&env, &x), Value::int(1));
}

#[test]
fn test_payload_links_reject_cycles() {
    let rt = runtime();
    let object = rt.predefined().object.clone();
    let a = rt.make_class("a", None).unwrap();
    let b = rt.make_class("b", Some(&a)).unwrap();

    assert_eq!(
        a.put_payload(ClassInfo::new("a", Some(b.clone()))).err(),
        Some(RuntimeError::CyclicClass {
            subclass: a.id(),
            superclass: b.id()
        })
    );
    assert!(a.put_payload(ClassInfo::new("a", Some(a.clone()))).is_err());
    assert!(a
        .put_boxed_payload(Box::new(ClassInfo::new("a", Some(b.clone()))))
        .is_err());
    assert_eq!(class::superclass_of(&a), Some(object.clone()));
    assert!(rt.is_subclass_of(&b, &object));

    // A link that closes no cycle replaces the previous payload.
    let previous = b.put_payload(ClassInfo::new("b", None)).unwrap();
    assert_eq!(previous.map(|p| p.kind()), Some("class"));
    assert!(!rt.is_subclass_of(&b, &a));
    a.put_payload(ClassInfo::new("a", Some(b.clone()))).unwrap();
    assert!(rt.is_subclass_of(&a, &b));

    let global = rt.create(Some(&rt.predefined().environment), None);
    global.put_payload(Environment::new(None)).unwrap();
    let local = rt.create(Some(&rt.predefined().environment), None);
    local.put_payload(Environment::new(Some(global.clone()))).unwrap();
    assert!(matches!(
        global.put_payload(Environment::new(Some(local.clone()))),
        Err(RuntimeError::CyclicClass { .. })
    ));
    assert_eq!(
        global.payload_ref(|env: &Environment| env.parent().cloned()),
        Some(None)
    );
}

#[test]
fn test_collection_waits_for_object_guard() {
    let rt = runtime();
    let target = rt.create(None, None);
    let key = rt.create(None, None);
    rt.add_root(&target);
    let stored = Arc::new(AtomicBool::new(false));
    let (locked_tx, locked_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel();

    let holder = {
        let (rt, target, key, stored) = (rt.clone(), target.clone(), key.clone(), stored.clone());
        std::thread::spawn(move || {
            let guard = target.lock();
            assert_eq!(rt.safepoint().held_guards(), 1);
            locked_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(200));
            target.put_attr(&key, Value::int(1)).unwrap();
            stored.store(true, Ordering::Release);
            drop(guard);
            assert_eq!(rt.safepoint().held_guards(), 0);
        })
    };

    locked_rx.recv().unwrap();
    let collector = {
        let (rt, stored) = (rt.clone(), stored.clone());
        std::thread::spawn(move || {
            rt.collect();
            done_tx.send(stored.load(Ordering::Acquire)).unwrap();
        })
    };

    assert_eq!(done_rx.recv_timeout(Duration::from_secs(10)), Ok(true));
    holder.join().unwrap();
    collector.join().unwrap();
    assert_eq!(target.attr(&key), Value::int(1));
    assert!(!key.is_reclaimed());
    assert_eq!(rt.violations(), 0);
}

#[test]
#[should_panic(expected = "while holding 1 object guard")]
fn test_collect_under_object_guard_panics() {
    let rt = runtime();
    let target = rt.create(None, None);
    let _guard = target.lock();
    rt.collect();
}

/// Checks that `target` does not change while the collector traces it.
struct WatchDuringMark {
    target: ObjectRef,
    stable: Arc<AtomicBool>,
    marks: Arc<AtomicUsize>,
}

impl Payload for WatchDuringMark {
    crate::payload_kind!("watch_during_mark");

    fn mark(&self, marker: &mut Marker) {
        let before = self.target.nb_components();
        std::thread::sleep(Duration::from_millis(20));
        if self.target.nb_components() != before {
            self.stable.store(false, Ordering::Release);
        }
        self.marks.fetch_add(1, Ordering::AcqRel);
        marker.mark_object(&self.target);
    }
}

#[test]
fn test_unattached_mutations_wait_for_pause() {
    let rt = runtime();
    let target = rt.create(None, None);
    let stable = Arc::new(AtomicBool::new(true));
    let marks = Arc::new(AtomicUsize::new(0));
    let carrier = rt.create(None, None);
    carrier
        .put_payload(WatchDuringMark {
            target: target.clone(),
            stable: stable.clone(),
            marks: marks.clone(),
        })
        .unwrap();
    rt.add_root(&carrier);

    let stop = AtomicBool::new(false);
    let appended = std::thread::scope(|s| {
        let mutator = s.spawn(|| {
            let mut n: i64 = 0;
            while !stop.load(Ordering::Acquire) {
                target.append_component(Value::int(n));
                n += 1;
                std::thread::sleep(Duration::from_micros(50));
            }
            n as usize
        });
        for _ in 0..5 {
            rt.collect();
        }
        stop.store(true, Ordering::Release);
        mutator.join().unwrap()
    });

    assert_eq!(marks.load(Ordering::Acquire), 5);
    assert!(stable.load(Ordering::Acquire));
    assert_eq!(target.nb_components(), appended);
    assert_eq!(rt.violations(), 0);
}
