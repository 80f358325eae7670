use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use tracing::info;

use crate::job::{Dispatcher, JobEngine, NoopExecutor};

use super::config::ServiceConfig;

pub(super) struct DispatcherControl {
    stop: Arc<AtomicBool>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl DispatcherControl {
    pub(super) fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub(super) fn stop_and_join(&mut self) {
        self.stop();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Starts the configured number of dispatcher threads against the shared
/// engine. Workers coordinate only through the store, so adding processes
/// behaves the same as adding threads here.
pub(super) fn start_dispatcher_threads(
    config: &ServiceConfig,
    engine: Arc<JobEngine>,
) -> DispatcherControl {
    let stop = Arc::new(AtomicBool::new(false));
    let mut handles = Vec::with_capacity(config.dispatcher_workers);
    for index in 0..config.dispatcher_workers {
        let worker_id = format!(
            "worker-{}-{}-{:04x}",
            std::process::id(),
            index,
            rand::random::<u16>()
        );
        info!("starting dispatcher {}", worker_id);
        let engine = engine.clone();
        let stop = stop.clone();
        let poll_interval = config.dispatcher_poll_interval;
        let handle = thread::spawn(move || {
            let dispatcher = Dispatcher::new(engine, NoopExecutor, worker_id);
            dispatcher.run_loop(poll_interval, &stop);
        });
        handles.push(handle);
    }
    DispatcherControl { stop, handles }
}
