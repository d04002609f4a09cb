use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::{Duration, Instant},
};

use refrt::{Frame, Priority, Runtime, RuntimeError, RuntimeOptions, Value};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn main() {
    env_logger::init();

    let options = RuntimeOptions::from_env();
    let rt = Runtime::new(options);
    println!("{}", options);

    let store = rt.make_class("store", None).expect("class");
    let root = rt.create(Some(&store), None);
    rt.add_root(&root);

    let work = rt.define_native("fill", move |cx, closed, _args| {
        let rt = cx.runtime();
        let target = closed
            .first()
            .and_then(Value::as_object)
            .ok_or_else(|| RuntimeError::failure("fill expects a target object"))?;
        let mut frame = cx.frame("fill", 1);
        let item = rt.create(None, None);
        frame.set_object(0, &item);
        for i in 0..64 {
            item.append_component(Value::string(rt, &format!("item-{}", i)));
        }
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        if n % 16 == 0 {
            target.append_component(Value::object(&item));
        }
        Ok(Value::Empty)
    });
    rt.add_root(&work);

    let main = rt.attach_current_thread("main");
    rt.run_pool(None);
    let start = Instant::now();
    for i in 0..2048 {
        let priority = Priority::ALL[i % 3];
        let mut frame = Frame::new(&main, "submit", 1);
        let closure = Value::closure(&rt, &work, vec![Value::object(&root)]);
        frame.set(0, closure.clone());
        rt.add_tasklet(priority, closure);
        drop(frame);
        if i % 512 == 511 {
            rt.request_collection();
            rt.safepoint_poll();
        }
    }

    {
        let _idle = main.safe_region();
        while rt.agenda_stats().executed + rt.agenda_stats().failed < 2048 {
            std::thread::sleep(Duration::from_millis(10));
        }
    }
    let stats = rt.collect();
    rt.stop_pool();
    drop(main);

    println!("{}", stats);
    println!("agenda: {}", rt.agenda_stats());
    println!("zones: {}", rt.zone_stats());
    println!(
        "{} object(s) live, {} kept under the root, {} collection(s), {} zone allocation(s), {} ms",
        rt.object_count(),
        root.nb_components(),
        rt.gc_count(),
        rt.zones().total_allocations(),
        start.elapsed().as_millis()
    );
}
