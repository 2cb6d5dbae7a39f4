//! The parent process: binds the listening socket once, then maintains a
//! fixed-width pool of preforked workers and supervises their lifetimes.
//! The parent never accepts a connection itself and holds no per-connection
//! state; `worker::run` is where the real work happens.

use std::collections::HashSet;
use std::net::TcpListener as StdTcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{error, info, warn};
use nix::sys::signal::{self, SigHandler, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

use crate::worker::{self, WorkerConfig};

/// Pause after each successful fork, damping restart storms if workers
/// die quickly (e.g. a bad `--helo` upstream that the client immediately
/// disconnects from).
const FORK_BACKOFF: Duration = Duration::from_millis(100);

pub struct Pool {
    pub listen_addr: String,
    pub width: usize,
    pub worker_config: WorkerConfig,
}

impl Pool {
    /// Binds the listening socket and runs the supervision loop until a
    /// termination signal is received, at which point every live worker is
    /// sent TERM and this function returns `Ok(())`.
    pub fn run(self) -> Result<()> {
        let listener = StdTcpListener::bind(&self.listen_addr)
            .with_context(|| format!("failed to bind {}", self.listen_addr))?;
        info!("proxy listening on {}", self.listen_addr);

        let term = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&term))
            .context("failed to register SIGTERM handler")?;
        signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&term))
            .context("failed to register SIGINT handler")?;

        let mut registry: HashSet<Pid> = HashSet::new();

        loop {
            if term.load(Ordering::SeqCst) {
                self.broadcast_term(&registry);
                info!("parent shut down after termination signal");
                return Ok(());
            }

            if registry.len() < self.width {
                match self.spawn_worker(&listener)? {
                    Some(pid) => {
                        registry.insert(pid);
                        thread::sleep(FORK_BACKOFF);
                    }
                    None => unreachable!("child branch exits the process before returning"),
                }
                continue;
            }

            match waitpid(None, Some(WaitPidFlag::empty())) {
                Ok(WaitStatus::Exited(pid, code)) => {
                    info!("worker {} exited with status {}", pid, code);
                    registry.remove(&pid);
                }
                Ok(WaitStatus::Signaled(pid, sig, _)) => {
                    warn!("worker {} killed by signal {:?}", pid, sig);
                    registry.remove(&pid);
                }
                Ok(_) => {}
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(e).context("waitpid failed"),
            }
        }
    }

    /// Forks one worker. In the parent, returns the child's pid. In the
    /// child, runs the worker loop to completion and exits the process —
    /// this function never returns `Ok(None)` to a live process.
    fn spawn_worker(&self, listener: &StdTcpListener) -> Result<Option<Pid>> {
        // Safety: between fork and exec/exit the child only calls
        // async-signal-safe code paths until `worker::run` establishes its
        // own runtime; no locks are held across the fork.
        match unsafe { fork() }.context("fork failed")? {
            ForkResult::Parent { child } => Ok(Some(child)),
            ForkResult::Child => {
                // The child inherits the parent's flag-setting SIGTERM/SIGINT
                // handlers, which only flip an `AtomicBool` nobody here reads.
                // Reset both to the default disposition so the parent's
                // broadcast on shutdown actually kills this process.
                unsafe {
                    let _ = signal::signal(Signal::SIGTERM, SigHandler::SigDfl);
                    let _ = signal::signal(Signal::SIGINT, SigHandler::SigDfl);
                }
                let code = match worker::run(listener, &self.worker_config) {
                    Ok(()) => 0,
                    Err(e) => {
                        error!("worker exiting after fatal error: {:#}", e);
                        1
                    }
                };
                std::process::exit(code);
            }
        }
    }

    fn broadcast_term(&self, registry: &HashSet<Pid>) {
        for pid in registry {
            if let Err(e) = signal::kill(*pid, Signal::SIGTERM) {
                warn!("failed to signal worker {}: {}", pid, e);
            }
        }
    }
}
