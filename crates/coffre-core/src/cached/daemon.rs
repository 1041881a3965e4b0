//! The state-coalescing daemon: one process per host that owns state
//! rebuilds, serializing them per repository and multiplexing many
//! repositories. Idle-teardown closes the listener once the last
//! connection has been gone for the configured delay.

use std::collections::HashMap;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::mpsc::{RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use serde_bytes::ByteBuf;
use uuid::Uuid;

use coffre_protocol::{RequestPkt, ResponsePkt, PROTOCOL_VERSION};
use coffre_types::{CoffreError, Mac, Result};

use crate::repo::{self, Configuration, Repository};
use crate::storage;

/// Default delay before tearing down an idle daemon.
pub const DEFAULT_TEARDOWN: Duration = Duration::from_secs(5);

/// How often blocked loops re-check their stop conditions.
const POLL_INTERVAL: Duration = Duration::from_millis(25);
const JOB_POLL_INTERVAL: Duration = Duration::from_millis(100);

struct JobReq {
    state_id: Mac,
    reply: SyncSender<std::result::Result<(), String>>,
}

type Registry = Arc<Mutex<HashMap<Uuid, SyncSender<JobReq>>>>;

/// The `cached` daemon.
pub struct Cached {
    cache_dir: PathBuf,
    socket_path: PathBuf,
    teardown: Duration,
    registry: Registry,
    /// Raised when the daemon is going away; job threads watch it.
    stopping: Arc<AtomicBool>,
}

impl Cached {
    pub fn new(cache_dir: &Path, teardown: Duration) -> Cached {
        Cached {
            cache_dir: cache_dir.to_path_buf(),
            socket_path: super::socket_path(cache_dir),
            teardown,
            registry: Arc::new(Mutex::new(HashMap::new())),
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bind the socket and serve until `shutdown` is raised or the idle
    /// teardown fires. Returns an error when another daemon is already
    /// running or the socket cannot be bound.
    pub fn listen_and_serve(&self, shutdown: Arc<AtomicBool>) -> Result<()> {
        if std::env::var_os("COFFRE_AGENTLESS").is_some() {
            return Err(CoffreError::Config(
                "cached can not be started when COFFRE_AGENTLESS is set".into(),
            ));
        }

        std::fs::create_dir_all(&self.cache_dir)?;

        // The self-lock serializes concurrent daemon startups; the probe
        // connect detects a daemon that is already serving.
        let self_lock = SelfLock::acquire(&self.self_lock_path())
            .map_err(|_| CoffreError::FailedToLock("failed to obtain lock".into()))?;
        if UnixStream::connect(&self.socket_path).is_ok() {
            drop(self_lock);
            return Err(CoffreError::Other("cached already running".into()));
        }
        let _ = std::fs::remove_file(&self.socket_path);

        let listener = UnixListener::bind(&self.socket_path)
            .map_err(|e| CoffreError::Other(format!("failed to bind the socket: {e}")))?;
        restrict_socket_mode(&self.socket_path)?;
        drop(self_lock);

        listener.set_nonblocking(true)?;
        tracing::info!("cached listening on {}", self.socket_path.display());

        let inflight = Arc::new(AtomicI64::new(0));
        let next_id = Arc::new(AtomicI64::new(0));
        let closing = Arc::new(AtomicBool::new(false));

        let result = self.accept_loop(&listener, &shutdown, &inflight, &next_id, &closing);

        self.stopping.store(true, Ordering::SeqCst);
        let _ = std::fs::remove_file(&self.socket_path);
        result
    }

    fn accept_loop(
        &self,
        listener: &UnixListener,
        shutdown: &Arc<AtomicBool>,
        inflight: &Arc<AtomicI64>,
        next_id: &Arc<AtomicI64>,
        closing: &Arc<AtomicBool>,
    ) -> Result<()> {
        loop {
            if shutdown.load(Ordering::SeqCst) {
                return Ok(());
            }
            if closing.load(Ordering::SeqCst) {
                tracing::info!("cached idle for {:?}, tearing down", self.teardown);
                return Ok(());
            }

            match listener.accept() {
                Ok((conn, _addr)) => {
                    conn.set_nonblocking(false)?;
                    inflight.fetch_add(1, Ordering::SeqCst);

                    let daemon = self.clone_refs();
                    let inflight = Arc::clone(inflight);
                    let next_id = Arc::clone(next_id);
                    let closing = Arc::clone(closing);
                    let teardown = self.teardown;
                    std::thread::spawn(move || {
                        let my_id = next_id.fetch_add(1, Ordering::SeqCst) + 1;

                        daemon.handle_client(conn);

                        let n = inflight.fetch_sub(1, Ordering::SeqCst) - 1;
                        if n == 0 {
                            std::thread::sleep(teardown);
                            if next_id.load(Ordering::SeqCst) == my_id
                                && inflight.load(Ordering::SeqCst) == 0
                            {
                                closing.store(true, Ordering::SeqCst);
                            }
                        }
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(e) => return Err(CoffreError::Io(e)),
            }
        }
    }

    fn clone_refs(&self) -> Cached {
        Cached {
            cache_dir: self.cache_dir.clone(),
            socket_path: self.socket_path.clone(),
            teardown: self.teardown,
            registry: Arc::clone(&self.registry),
            stopping: Arc::clone(&self.stopping),
        }
    }

    fn self_lock_path(&self) -> PathBuf {
        let mut name = self
            .socket_path
            .file_name()
            .unwrap_or_default()
            .to_os_string();
        name.push(".cached-lock");
        self.socket_path.with_file_name(name)
    }

    /// Serve one connection: handshake, one request, one response.
    fn handle_client(&self, conn: UnixStream) {
        let writer = match conn.try_clone() {
            Ok(w) => Arc::new(Mutex::new(w)),
            Err(e) => {
                tracing::warn!("client setup failed: {e}");
                return;
            }
        };
        let mut de = match conn.try_clone() {
            Ok(rd) => rmp_serde::Deserializer::new(rd),
            Err(e) => {
                tracing::warn!("client setup failed: {e}");
                return;
            }
        };

        // Handshake: the client speaks first, then we answer with ours.
        // Version comparison is the client's job.
        if ByteBuf::deserialize(&mut de).is_err() {
            return;
        }
        {
            let ours = ByteBuf::from(PROTOCOL_VERSION.as_bytes().to_vec());
            let w = writer.lock().unwrap();
            if rmp_serde::encode::write(&mut &*w, &ours).is_err() {
                return;
            }
        }

        let req = match RequestPkt::deserialize(&mut de) {
            Ok(req) => req,
            Err(e) => {
                tracing::warn!("client disconnected during initial request: {e}");
                return;
            }
        };

        // Keep decoding in the background solely to detect the client
        // going away while its job is queued or running.
        let client_gone = Arc::new(AtomicBool::new(false));
        {
            let client_gone = Arc::clone(&client_gone);
            std::thread::spawn(move || loop {
                if serde::de::IgnoredAny::deserialize(&mut de).is_err() {
                    client_gone.store(true, Ordering::SeqCst);
                    return;
                }
            });
        }

        tracing::info!("cached rebuild request for {}", req.repo_id);

        let outcome = self.dispatch(&req, &client_gone);
        let resp = match outcome {
            Some(Ok(())) => ResponsePkt::ok(),
            Some(Err(msg)) => ResponsePkt::failure(msg),
            // Client went away; its result is discarded, no response.
            None => return,
        };

        if !client_gone.load(Ordering::SeqCst) {
            let w = writer.lock().unwrap();
            if let Err(e) = rmp_serde::encode::write_named(&mut &*w, &resp) {
                tracing::warn!("client write error: {e}");
            }
        }
    }

    /// Enqueue the request on its repository's job queue and await the
    /// reply. `None` means the client disconnected and no response should
    /// be sent.
    fn dispatch(
        &self,
        req: &RequestPkt,
        client_gone: &Arc<AtomicBool>,
    ) -> Option<std::result::Result<(), String>> {
        let queue = {
            let mut registry = self.registry.lock().unwrap();
            match registry.get(&req.repo_id) {
                Some(tx) => Ok(tx.clone()),
                None => match self.start_job(req) {
                    Ok(tx) => {
                        registry.insert(req.repo_id, tx.clone());
                        Ok(tx)
                    }
                    Err(e) => Err(e.to_string()),
                },
            }
        };

        let queue = match queue {
            Ok(q) => q,
            Err(msg) => return Some(Err(msg)),
        };

        let (reply_tx, reply_rx) = std::sync::mpsc::sync_channel(1);
        let job = JobReq {
            state_id: req.state_id,
            reply: reply_tx,
        };
        if queue.send(job).is_err() {
            return Some(Err("cached job queue closed".into()));
        }

        if req.fire_and_forget {
            // The job is accepted and will run; acknowledge right away.
            return Some(Ok(()));
        }

        loop {
            match reply_rx.recv_timeout(JOB_POLL_INTERVAL) {
                Ok(result) => return Some(result),
                Err(RecvTimeoutError::Timeout) => {
                    if client_gone.load(Ordering::SeqCst) {
                        tracing::warn!(
                            "client for {} disconnected, discarding job result",
                            req.repo_id
                        );
                        return None;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Some(Err("cached job aborted".into()));
                }
            }
        }
    }

    /// Open the repository named by the request and launch its job
    /// thread. Any failure here happens before the queue is published, so
    /// no registry entry is created.
    fn start_job(&self, req: &RequestPkt) -> Result<SyncSender<JobReq>> {
        let (store, serialized) = storage::open_store(&req.store_config)
            .map_err(|e| CoffreError::Other(format!("failed to open storage: {e}")))?;

        let configuration = Configuration::from_wrapped_bytes(&serialized)?;
        let secret = repo::resolve_secret(&configuration, &req.store_config, &req.secret)
            .map_err(|e| match e {
                CoffreError::KeyVerification => e,
                other => CoffreError::Other(format!("failed to setup secret: {other}")),
            })?;

        if req.repo_id != configuration.repository_id {
            return Err(CoffreError::UuidMismatch {
                requested: req.repo_id,
                actual: configuration.repository_id,
            });
        }

        let repository =
            Repository::open_no_rebuild(store, &serialized, secret, &self.cache_dir)?;

        let (tx, rx) = std::sync::mpsc::sync_channel::<JobReq>(1);
        let registry = Arc::clone(&self.registry);
        let stopping = Arc::clone(&self.stopping);
        let repo_id = configuration.repository_id;

        std::thread::spawn(move || {
            loop {
                match rx.recv_timeout(JOB_POLL_INTERVAL) {
                    Ok(job) => {
                        let result = if job.state_id.is_zero() {
                            repository.rebuild_state()
                        } else {
                            repository.ingest_state_file(job.state_id)
                        };
                        // The waiter may have given up (fire-and-forget or
                        // disconnect); a failed send is fine.
                        let _ = job.reply.send(result.map_err(|e| e.to_string()));
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        if stopping.load(Ordering::SeqCst) {
                            break;
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }

            // No more jobs for this repository; unregister ourselves.
            registry.lock().unwrap().remove(&repo_id);
        });

        Ok(tx)
    }
}

fn restrict_socket_mode(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::Permissions::from_mode(0o600);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

/// Exclusive advisory lock guarding daemon startup. Unlike the client
/// spawn lock, the file itself is left in place on release.
struct SelfLock {
    file: std::fs::File,
}

impl SelfLock {
    fn acquire(path: &Path) -> Result<SelfLock> {
        use std::os::fd::AsRawFd;
        use std::os::unix::fs::OpenOptionsExt;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(path)
            .map_err(|e| CoffreError::FailedToLock(format!("{}: {e}", path.display())))?;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc != 0 {
            let e = std::io::Error::last_os_error();
            return Err(CoffreError::FailedToLock(format!("{}: {e}", path.display())));
        }
        Ok(SelfLock { file })
    }
}

impl Drop for SelfLock {
    fn drop(&mut self) {
        use std::os::fd::AsRawFd;
        unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
    }
}
