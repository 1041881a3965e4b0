use coffre_core::config::Config;
use coffre_core::events::{dispatch, EventBus, StdioRenderer};
use coffre_core::platform::paths;
use coffre_core::scheduler::{Scheduler, SchedulerCtx};
use coffre_types::{CoffreError, Result};

use crate::signal;

pub(crate) fn run(config: Config, key_file: Option<&str>) -> Result<i32> {
    if config.tasks.is_empty() {
        return Err(CoffreError::Config(
            "no tasks configured; nothing to schedule".into(),
        ));
    }

    let key_from_file = match key_file {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| CoffreError::Config(format!("cannot read key file {path}: {e}")))?;
            Some(contents.trim_end().to_string())
        }
        None => None,
    };

    let (bus, rx) = EventBus::new();
    let renderer_thread = std::thread::spawn(move || {
        dispatch(rx, |_| Box::new(StdioRenderer));
    });

    let scheduler = Scheduler::new(SchedulerCtx {
        config,
        cache_dir: paths::cache_dir(),
        key_from_file,
        shutdown: signal::shutdown_flag(),
        events: Some(bus),
    });
    let result = scheduler.run();

    // Drop the last bus handle so the renderer drains and exits.
    drop(scheduler);
    let _ = renderer_thread.join();
    result.map(|_| 0)
}
