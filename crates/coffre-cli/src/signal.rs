use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

static SHUTDOWN: OnceLock<Arc<AtomicBool>> = OnceLock::new();

/// The process-wide shutdown flag, shared with daemon/scheduler loops.
pub fn shutdown_flag() -> Arc<AtomicBool> {
    Arc::clone(SHUTDOWN.get_or_init(|| Arc::new(AtomicBool::new(false))))
}

/// Install signal handlers for cooperative shutdown.
///
/// First signal raises the flag and restores the default handler so a
/// second signal terminates immediately.
pub fn install_signal_handlers() {
    shutdown_flag();
    // Safety: the handler only stores an atomic bool and restores the
    // default disposition.
    unsafe {
        libc::signal(
            libc::SIGTERM,
            signal_handler as *const () as libc::sighandler_t,
        );
        libc::signal(
            libc::SIGINT,
            signal_handler as *const () as libc::sighandler_t,
        );
    }
}

extern "C" fn signal_handler(sig: libc::c_int) {
    if let Some(flag) = SHUTDOWN.get() {
        flag.store(true, Ordering::SeqCst);
    }
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
    }
}
