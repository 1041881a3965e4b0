//! Client side of the state-coalescing daemon: socket dialing with
//! auto-spawn under a file lock, the versioned handshake, and the
//! one-request/one-response exchange.

pub mod daemon;

use std::collections::BTreeMap;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_bytes::ByteBuf;
use uuid::Uuid;

use coffre_protocol::{RequestPkt, ResponsePkt, PROTOCOL_VERSION};
use coffre_types::{CoffreError, Mac, Result};

/// Maximum connect attempts before giving up on auto-spawn.
const SPAWN_MAX_ATTEMPTS: u32 = 1000;
/// Pause between connect attempts.
const SPAWN_RETRY_DELAY: Duration = Duration::from_millis(5);

/// Everything a client call needs: where the socket lives, the caller's
/// pre-derived secret (may be empty), and an optional cancellation flag
/// that closes the connection when raised.
#[derive(Clone)]
pub struct ClientCtx {
    pub cache_dir: PathBuf,
    pub secret: Vec<u8>,
    pub shutdown: Option<Arc<AtomicBool>>,
    /// Program to spawn when the daemon is absent. Defaults to the
    /// current executable, run with the `cached` subcommand.
    pub spawn_program: Option<PathBuf>,
}

impl ClientCtx {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        ClientCtx {
            cache_dir: cache_dir.into(),
            secret: Vec::new(),
            shutdown: None,
            spawn_program: None,
        }
    }

    pub fn with_secret(mut self, secret: Vec<u8>) -> Self {
        self.secret = secret;
        self
    }

    pub fn with_shutdown(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }
}

/// Path of the daemon socket under a cache directory.
pub fn socket_path(cache_dir: &Path) -> PathBuf {
    cache_dir.join("cached.sock")
}

/// Ask the daemon for a full state rebuild, waiting for completion.
pub fn rebuild_state_from_cached(
    ctx: &ClientCtx,
    repo_id: Uuid,
    store_config: &BTreeMap<String, String>,
) -> Result<i32> {
    let t0 = Instant::now();
    let res = rebuild_state_request(
        ctx,
        &RequestPkt {
            secret: ctx.secret.clone(),
            repo_id,
            store_config: store_config.clone(),
            fire_and_forget: false,
            state_id: Mac::ZERO,
        },
    );
    tracing::trace!(
        target: "cached",
        "rebuild from cached (store={repo_id}): {:?}",
        t0.elapsed()
    );
    res
}

/// Ask the daemon for a full rebuild, optionally without waiting for it.
pub fn rebuild_state_from_store(
    ctx: &ClientCtx,
    repo_id: Uuid,
    store_config: &BTreeMap<String, String>,
    fire_and_forget: bool,
) -> Result<i32> {
    let t0 = Instant::now();
    let res = rebuild_state_request(
        ctx,
        &RequestPkt {
            secret: ctx.secret.clone(),
            repo_id,
            store_config: store_config.clone(),
            fire_and_forget,
            state_id: Mac::ZERO,
        },
    );
    tracing::trace!(
        target: "cached",
        "rebuild from store (store={repo_id}): {:?}",
        t0.elapsed()
    );
    res
}

/// Ask the daemon to ingest one state file instead of a full rebuild.
pub fn rebuild_state_from_state_file(
    ctx: &ClientCtx,
    state_id: Mac,
    repo_id: Uuid,
    store_config: &BTreeMap<String, String>,
    fire_and_forget: bool,
) -> Result<i32> {
    let t0 = Instant::now();
    let res = rebuild_state_request(
        ctx,
        &RequestPkt {
            secret: ctx.secret.clone(),
            repo_id,
            store_config: store_config.clone(),
            fire_and_forget,
            state_id,
        },
    );
    tracing::trace!(
        target: "cached",
        "rebuild from local statefile (file={state_id}, store={repo_id}): {:?}",
        t0.elapsed()
    );
    res
}

fn rebuild_state_request(ctx: &ClientCtx, req: &RequestPkt) -> Result<i32> {
    let mut client = Client::connect(ctx, false)?;

    // When a cancellation flag is wired up, a watcher closes the stream
    // so a pending response decode unblocks.
    let done = Arc::new(AtomicBool::new(false));
    let watcher = ctx.shutdown.as_ref().map(|shutdown| {
        let shutdown = Arc::clone(shutdown);
        let done = Arc::clone(&done);
        let stream = client.stream.try_clone();
        std::thread::spawn(move || {
            let stream = match stream {
                Ok(s) => s,
                Err(_) => return,
            };
            while !done.load(Ordering::SeqCst) {
                if shutdown.load(Ordering::SeqCst) {
                    let _ = stream.shutdown(std::net::Shutdown::Both);
                    return;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
        })
    });

    let result = client.call(ctx, req);

    done.store(true, Ordering::SeqCst);
    if let Some(watcher) = watcher {
        let _ = watcher.join();
    }
    result
}

#[derive(Debug)]
struct Client {
    stream: UnixStream,
    de: rmp_serde::Deserializer<rmp_serde::decode::ReadReader<UnixStream>>,
}

impl Client {
    /// Dial the daemon socket, spawning the daemon under the spawn lock
    /// if nothing is listening yet.
    fn connect(ctx: &ClientCtx, ignore_version: bool) -> Result<Client> {
        let socket = socket_path(&ctx.cache_dir);
        let mut lock: Option<SpawnLock> = None;
        let mut spawned = false;
        let mut attempt: u32 = 0;

        let stream = loop {
            match UnixStream::connect(&socket) {
                Ok(stream) => break stream,
                Err(_) => {}
            }

            attempt += 1;
            if attempt > SPAWN_MAX_ATTEMPTS {
                return Err(CoffreError::FailedToRunAgent);
            }

            if lock.is_none() {
                let lock_path = lock_file_path(&socket);
                lock = Some(SpawnLock::acquire(&lock_path)?);
                // Always retry at least once, even though we got the
                // lock: another client could have taken the lock, started
                // the daemon and released the lock between our connect
                // and our flock.
                continue;
            }

            if !spawned {
                spawn_daemon(ctx)?;
                spawned = true;
            }

            std::thread::sleep(SPAWN_RETRY_DELAY);
        };

        // The daemon is confirmed reachable; only now release the spawn
        // lock so racing clients cannot double-spawn.
        drop(lock);

        let de = rmp_serde::Deserializer::new(stream.try_clone()?);
        let mut client = Client { stream, de };
        client.handshake(ignore_version)?;
        Ok(client)
    }

    fn handshake(&mut self, ignore_version: bool) -> Result<()> {
        let ours = ByteBuf::from(PROTOCOL_VERSION.as_bytes().to_vec());
        rmp_serde::encode::write(&mut &self.stream, &ours)?;

        let theirs = ByteBuf::deserialize(&mut self.de)?;
        if !ignore_version && theirs != ours {
            return Err(CoffreError::WrongVersion(
                String::from_utf8_lossy(&theirs).into_owned(),
            ));
        }
        Ok(())
    }

    /// Send one request and decode exactly one response.
    fn call(&mut self, ctx: &ClientCtx, req: &RequestPkt) -> Result<i32> {
        rmp_serde::encode::write_named(&mut &self.stream, req)?;

        match ResponsePkt::deserialize(&mut self.de) {
            Ok(resp) => {
                if resp.err.is_empty() {
                    Ok(resp.exit_code)
                } else {
                    Err(CoffreError::Other(resp.err))
                }
            }
            Err(e) => {
                if let Some(shutdown) = &ctx.shutdown {
                    if shutdown.load(Ordering::SeqCst) {
                        return Err(CoffreError::Interrupted);
                    }
                }
                Err(CoffreError::Other(format!("failed to decode response: {e}")))
            }
        }
    }
}

fn lock_file_path(socket: &Path) -> PathBuf {
    let mut name = socket.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    socket.with_file_name(name)
}

fn spawn_daemon(ctx: &ClientCtx) -> Result<()> {
    let program = match &ctx.spawn_program {
        Some(p) => p.clone(),
        None => std::env::current_exe()
            .map_err(|e| CoffreError::Other(format!("failed to get executable: {e}")))?,
    };
    Command::new(&program).arg("cached").spawn().map_err(|e| {
        tracing::warn!("failed to start cached via {}: {e}", program.display());
        CoffreError::FailedToRunAgent
    })?;
    Ok(())
}

/// Exclusive advisory lock on the client spawn-lock file. Dropping the
/// guard releases the lock and removes the file.
struct SpawnLock {
    file: std::fs::File,
    path: PathBuf,
}

impl SpawnLock {
    fn acquire(path: &Path) -> Result<SpawnLock> {
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
        Ok(SpawnLock {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for SpawnLock {
    fn drop(&mut self) {
        use std::os::fd::AsRawFd;
        unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        let _ = std::fs::remove_file(&self.path);
    }
}
