//! Child process handle and two-phase shutdown

use std::io;
use std::process::{Child, ExitStatus};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Process groups led by tunnel children that have not been stopped yet
static LIVE_GROUPS: Mutex<Vec<u32>> = Mutex::new(Vec::new());

/// Signals sent during shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// SIGTERM
    Terminate,
    /// SIGKILL
    Kill,
}

/// Process operations needed to stop a background child
///
/// Implemented by [`ChildProcess`]; tests substitute a scripted fake.
pub trait ManagedProcess {
    fn id(&self) -> u32;

    /// Non-blocking exit check
    fn try_status(&mut self) -> io::Result<Option<ExitStatus>>;

    /// Signal the whole process group
    fn signal_group(&mut self, signal: StopSignal) -> io::Result<()>;

    /// Signal only the child
    fn signal_child(&mut self, signal: StopSignal) -> io::Result<()>;

    /// Block until the process has exited
    fn wait(&mut self) -> io::Result<ExitStatus>;
}

/// How a shutdown finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    AlreadyExited,
    Graceful,
    Forced,
}

/// Stop `process`: terminate, wait up to `grace`, then kill
///
/// Group signalling is tried first; when it fails the child alone is
/// signalled.
pub fn shutdown(
    process: &mut dyn ManagedProcess,
    grace: Duration,
    poll: Duration,
) -> io::Result<Shutdown> {
    if process.try_status()?.is_some() {
        return Ok(Shutdown::AlreadyExited);
    }

    send(process, StopSignal::Terminate)?;

    let deadline = Instant::now() + grace;
    loop {
        if process.try_status()?.is_some() {
            return Ok(Shutdown::Graceful);
        }
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep(poll.min(deadline - now));
    }

    tracing::warn!(
        "Process {} did not exit within {:?}, killing",
        process.id(),
        grace
    );
    send(process, StopSignal::Kill)?;
    process.wait()?;
    Ok(Shutdown::Forced)
}

fn send(process: &mut dyn ManagedProcess, signal: StopSignal) -> io::Result<()> {
    match process.signal_group(signal) {
        Ok(()) => Ok(()),
        Err(e) => {
            tracing::debug!(
                "Group {:?} failed for {} ({}), signalling child",
                signal,
                process.id(),
                e
            );
            process.signal_child(signal)
        }
    }
}

/// Record a child that leads its own process group
pub fn register_group(pgid: u32) {
    LIVE_GROUPS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(pgid);
}

/// Forget a group once its leader has been stopped
pub fn unregister_group(pgid: u32) {
    LIVE_GROUPS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .retain(|&g| g != pgid);
}

/// Groups registered and not yet stopped
pub fn registered_groups() -> Vec<u32> {
    LIVE_GROUPS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Stop every registered group without going through its owner
///
/// For signal handlers: the process is about to exit and the owning
/// handles will never be dropped. Each group gets SIGTERM, its leader is
/// reaped or killed once `grace` has passed, and any members left in the
/// group are killed.
///
/// # Returns
/// Number of groups stopped
#[cfg(unix)]
pub fn stop_registered_groups(grace: Duration) -> usize {
    use nix::sys::signal::{Signal, killpg};
    use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
    use nix::unistd::Pid;

    let groups = std::mem::take(&mut *LIVE_GROUPS.lock().unwrap_or_else(PoisonError::into_inner));
    for &pgid in &groups {
        let _ = killpg(Pid::from_raw(pgid as i32), Signal::SIGTERM);
    }

    let deadline = Instant::now() + grace;
    for &pgid in &groups {
        let leader = Pid::from_raw(pgid as i32);
        loop {
            // ECHILD: already reaped by its owner
            match waitpid(leader, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {}
                _ => break,
            }
            if Instant::now() >= deadline {
                let _ = killpg(leader, Signal::SIGKILL);
                let _ = waitpid(leader, None);
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        let _ = killpg(leader, Signal::SIGKILL);
    }
    groups.len()
}

#[cfg(not(unix))]
pub fn stop_registered_groups(_grace: Duration) -> usize {
    let groups = std::mem::take(&mut *LIVE_GROUPS.lock().unwrap_or_else(PoisonError::into_inner));
    groups.len()
}

/// A spawned child that leads its own process group
#[derive(Debug)]
pub struct ChildProcess {
    child: Child,
}

impl ChildProcess {
    pub fn new(child: Child) -> Self {
        Self { child }
    }
}

impl ManagedProcess for ChildProcess {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn try_status(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    #[cfg(unix)]
    fn signal_group(&mut self, signal: StopSignal) -> io::Result<()> {
        use nix::unistd::{Pid, getpgid};

        let pid = Pid::from_raw(self.child.id() as i32);
        let pgid = getpgid(Some(pid)).map_err(nix_to_io)?;
        nix::sys::signal::killpg(pgid, to_nix(signal)).map_err(nix_to_io)
    }

    #[cfg(not(unix))]
    fn signal_group(&mut self, _signal: StopSignal) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "process groups are not supported on this platform",
        ))
    }

    #[cfg(unix)]
    fn signal_child(&mut self, signal: StopSignal) -> io::Result<()> {
        let pid = nix::unistd::Pid::from_raw(self.child.id() as i32);
        match nix::sys::signal::kill(pid, to_nix(signal)) {
            // Exited between the check and the signal.
            Err(nix::errno::Errno::ESRCH) => Ok(()),
            other => other.map_err(nix_to_io),
        }
    }

    #[cfg(not(unix))]
    fn signal_child(&mut self, _signal: StopSignal) -> io::Result<()> {
        self.child.kill()
    }

    fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait()
    }
}

#[cfg(unix)]
fn to_nix(signal: StopSignal) -> nix::sys::signal::Signal {
    match signal {
        StopSignal::Terminate => nix::sys::signal::Signal::SIGTERM,
        StopSignal::Kill => nix::sys::signal::Signal::SIGKILL,
    }
}

#[cfg(unix)]
fn nix_to_io(errno: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(errno as i32)
}
