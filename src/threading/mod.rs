//! Worker pool driving the agenda.

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
    thread::JoinHandle,
    time::Duration,
};

use crate::{
    agenda::TaskletInfo,
    heap::thread::{Frame, Mutator},
    runtime::Runtime,
    sync::monitor::Monitor,
    system::{closure::CallContext, object::ObjectRef},
};

/// Upper bound on the number of worker threads.
pub const MAX_WORKERS: usize = 64;

/// How long an idle worker sleeps before polling for a periodic collection.
const WORK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Spawns `count` workers and returns once all of them are attached.
pub(crate) fn spawn_workers(rt: &Arc<Runtime>, first_index: usize, count: usize) -> Vec<JoinHandle<()>> {
    let started = Arc::new(Monitor::new(0usize));
    let mut handles = Vec::with_capacity(count);

    for index in first_index..first_index + count {
        let rt = rt.clone();
        let started = started.clone();
        let handle = std::thread::Builder::new()
            .name(format!("refrt-worker-{}", index))
            .spawn(move || worker_loop(rt, index, started))
            .unwrap_or_else(|e| panic!("failed to spawn worker {}: {}", index, e));
        handles.push(handle);
    }

    // Wait for workers to be actually attached.
    let mut ml = started.lock();
    ml.wait_while(|n| *n < count);
    handles
}

fn worker_loop(rt: Arc<Runtime>, index: usize, started: Arc<Monitor<usize>>) {
    let mutator = rt.attach_current_thread(format!("worker-{}", index));
    {
        let mut ml = started.lock();
        *ml += 1;
    }
    drop(started);
    log::debug!(target: "agenda", "{} started", mutator.name());

    let agenda = rt.agenda();
    loop {
        rt.safepoint_poll();
        if agenda.is_stopping() {
            break;
        }
        if rt.heuristics().should_start_periodic_gc() {
            rt.request_collection();
            continue;
        }

        match agenda.fetch_next() {
            Some(tasklet) => run_tasklet(&rt, &mutator, &tasklet),
            None => {
                let _idle = mutator.safe_region();
                agenda.wait_for_work(WORK_POLL_INTERVAL);
            }
        }
    }

    log::debug!(target: "agenda", "{} stopped", mutator.name());
}

/// Runs one fetched tasklet on the calling worker. Failures are logged,
/// counted and isolated.
pub(crate) fn run_tasklet(rt: &Runtime, mutator: &Mutator, tasklet: &ObjectRef) {
    let mut frame = Frame::new(mutator, "run_tasklet", 2);
    frame.set_object(0, tasklet);

    let info = tasklet.payload_ref(|info: &TaskletInfo| (info.closure().clone(), info.is_obsolete(), info.is_permanent()));
    let (closure, obsolete, permanent) = match info {
        Some(info) => info,
        None => {
            log::warn!(target: "agenda", "{} is not a tasklet, dropping it", tasklet);
            return;
        }
    };

    let agenda = rt.agenda();
    if obsolete {
        agenda.record_obsolete();
        log::debug!(target: "agenda", "Skipping obsolete tasklet {}", tasklet);
        return;
    }
    frame.set(1, closure.clone());

    if rt.safepoint().is_stopped() {
        rt.safepoint().record_violation("Tasklet execution");
    }

    let cx = CallContext::new(rt, Some(mutator), Some(tasklet));
    match catch_unwind(AssertUnwindSafe(|| closure.apply(&cx, &[]))) {
        Ok(Ok(_)) => agenda.record_executed(),
        Ok(Err(err)) => {
            agenda.record_failed();
            log::error!(target: "agenda", "Tasklet {} failed on {}: {}", tasklet, mutator.name(), err);
        }
        Err(panic) => {
            agenda.record_failed();
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            log::error!(target: "agenda", "Tasklet {} panicked on {}: {}", tasklet, mutator.name(), message);
        }
    }

    if permanent {
        agenda.pin(tasklet);
    }
}
