//! Bastion tunnel lifecycle
//!
//! [`TunnelManager`] owns at most one background `az network bastion tunnel`
//! process. `start` returns once the local port accepts connections; `stop`
//! tears down the whole process group. [`TunnelSession`] ties the tunnel to
//! a scope so it is stopped on every exit path, including unwinding.
//! Running tunnels are also recorded by process group so a signal handler
//! can stop them with [`stop_registered_groups`].

pub mod process;

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::{
    ConfigError, ENV_AZURE_RESOURCE_GROUP_NAME, ENV_AZURE_SUBSCRIPTION_ID, ENV_VM_NAME,
    PipelineConfig, require,
};
use crate::infra::find_executable;
pub use process::{
    ChildProcess, ManagedProcess, Shutdown, StopSignal, registered_groups, shutdown,
    stop_registered_groups,
};

/// Output lines kept for error reports
const OUTPUT_TAIL_LINES: usize = 200;

/// Wait for output readers to reach EOF after the child exits
const DRAIN_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Upper bound on a single connect attempt while polling
const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(1);

/// Error type for tunnel operations
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Tunnel program is not on `PATH`
    #[error("'{0}' not found in PATH; install the Azure CLI to open a bastion tunnel.")]
    BinaryNotFound(String),

    #[error("Failed to start tunnel: {0}")]
    Spawn(String),

    #[error("Tunnel is already running")]
    AlreadyRunning,

    /// Child exited before the local port opened
    #[error("Tunnel process exited with status {status} before the port opened.\n{output}")]
    Exited { status: String, output: String },

    #[error("Tunnel did not open {host}:{port} within {timeout:?}")]
    PortTimeout {
        host: String,
        port: u16,
        timeout: Duration,
    },

    #[error("Failed to stop tunnel: {0}")]
    Stop(String),
}

/// Result type for tunnel operations
pub type TunnelResult<T> = Result<T, TunnelError>;

/// Lifecycle state of a [`TunnelManager`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Idle,
    Starting,
    Up,
    Stopping,
}

/// Everything needed to launch and reach one tunnel
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub program: String,
    pub bastion_name: String,
    pub resource_group: String,
    pub target_resource_id: String,
    pub resource_port: u16,
    pub local_host: String,
    pub local_port: u16,
    pub extra_args: Vec<String>,
    pub startup_timeout: Duration,
    pub health_check_timeout: Duration,
    pub stop_grace: Duration,
    pub poll_interval: Duration,
}

impl TunnelConfig {
    /// Build from configuration; the target is the configured VM
    pub fn from_config(config: &PipelineConfig) -> TunnelResult<Self> {
        let azure = &config.azure;
        let subscription = require(&azure.subscription_id, ENV_AZURE_SUBSCRIPTION_ID)?;
        let resource_group = require(&azure.resource_group, ENV_AZURE_RESOURCE_GROUP_NAME)?;
        let vm_name = require(&azure.vm_name, ENV_VM_NAME)?;
        let tunnel = &config.tunnel;

        Ok(Self {
            program: tunnel.program.clone(),
            bastion_name: tunnel.bastion_name.clone(),
            resource_group: resource_group.to_string(),
            target_resource_id: format!(
                "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Compute/virtualMachines/{}",
                subscription, resource_group, vm_name
            ),
            resource_port: tunnel.resource_port,
            local_host: tunnel.local_host.clone(),
            local_port: config.tunnel_local_port(),
            extra_args: tunnel.extra_args.clone(),
            startup_timeout: tunnel.startup_timeout(),
            health_check_timeout: tunnel.health_check_timeout(),
            stop_grace: tunnel.stop_grace(),
            poll_interval: tunnel.poll_interval(),
        })
    }

    pub fn command_args(&self) -> Vec<String> {
        let mut args: Vec<String> = ["network", "bastion", "tunnel"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.extend([
            "--name".to_string(),
            self.bastion_name.clone(),
            "--resource-group".to_string(),
            self.resource_group.clone(),
            "--target-resource-id".to_string(),
            self.target_resource_id.clone(),
            "--resource-port".to_string(),
            self.resource_port.to_string(),
            "--port".to_string(),
            self.local_port.to_string(),
        ]);
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

struct TunnelHandle {
    process: ChildProcess,
    output: Arc<Mutex<VecDeque<String>>>,
    drains: Vec<JoinHandle<()>>,
}

/// Owner of the background tunnel process
pub struct TunnelManager {
    config: TunnelConfig,
    state: TunnelState,
    handle: Option<TunnelHandle>,
}

impl TunnelManager {
    pub fn new(config: TunnelConfig) -> Self {
        Self {
            config,
            state: TunnelState::Idle,
            handle: None,
        }
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Launch the tunnel and wait for its local port
    ///
    /// Fails fast if the child exits first. On any failure the child is
    /// stopped and no handle is kept.
    pub fn start(&mut self) -> TunnelResult<()> {
        if self.handle.is_some() {
            return Err(TunnelError::AlreadyRunning);
        }
        let executable = find_executable(&self.config.program)
            .ok_or_else(|| TunnelError::BinaryNotFound(self.config.program.clone()))?;

        self.state = TunnelState::Starting;
        tracing::info!(
            "Starting bastion tunnel {} -> {}:{}",
            self.config.bastion_name,
            self.config.local_host,
            self.config.local_port
        );

        let mut command = Command::new(executable);
        command
            .args(self.config.command_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.state = TunnelState::Idle;
                return Err(TunnelError::Spawn(e.to_string()));
            }
        };

        process::register_group(child.id());

        let output = Arc::new(Mutex::new(VecDeque::new()));
        let mut drains = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            drains.push(spawn_drain(stdout, Arc::clone(&output)));
        }
        if let Some(stderr) = child.stderr.take() {
            drains.push(spawn_drain(stderr, Arc::clone(&output)));
        }

        let mut handle = TunnelHandle {
            process: ChildProcess::new(child),
            output,
            drains,
        };

        match self.wait_until_ready(&mut handle) {
            Ok(()) => {
                tracing::info!(
                    "Tunnel up on {}:{} (pid {})",
                    self.config.local_host,
                    self.config.local_port,
                    handle.process.id()
                );
                self.handle = Some(handle);
                self.state = TunnelState::Up;
                Ok(())
            }
            Err(e) => {
                if let Err(stop_err) = teardown(handle, &self.config) {
                    tracing::warn!("Cleanup after failed start: {}", stop_err);
                }
                self.state = TunnelState::Idle;
                Err(e)
            }
        }
    }

    fn wait_until_ready(&self, handle: &mut TunnelHandle) -> TunnelResult<()> {
        let deadline = Instant::now() + self.config.startup_timeout;
        loop {
            match handle.process.try_status() {
                Ok(Some(status)) => {
                    // Let the drains reach EOF so the report holds the final lines.
                    join_drains(std::mem::take(&mut handle.drains));
                    return Err(TunnelError::Exited {
                        status: status
                            .code()
                            .map(|c| c.to_string())
                            .unwrap_or_else(|| status.to_string()),
                        output: output_tail(&handle.output),
                    });
                }
                Ok(None) => {}
                Err(e) => return Err(TunnelError::Spawn(e.to_string())),
            }

            if port_open(
                &self.config.local_host,
                self.config.local_port,
                CONNECT_ATTEMPT_TIMEOUT,
            ) {
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(TunnelError::PortTimeout {
                    host: self.config.local_host.clone(),
                    port: self.config.local_port,
                    timeout: self.config.startup_timeout,
                });
            }
            std::thread::sleep(self.config.poll_interval.min(deadline - now));
        }
    }

    /// Stop the tunnel; a no-op when none is running
    ///
    /// The handle is cleared even if stopping fails.
    pub fn stop(&mut self) -> TunnelResult<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        self.state = TunnelState::Stopping;
        tracing::info!("Stopping bastion tunnel (pid {})", handle.process.id());
        let result = teardown(handle, &self.config);
        self.state = TunnelState::Idle;
        result
    }

    /// Whether the local end accepts connections
    pub fn health_check(&self) -> bool {
        port_open(
            &self.config.local_host,
            self.config.local_port,
            self.config.health_check_timeout,
        )
    }

    /// Start the tunnel for the lifetime of the returned guard
    pub fn open(&mut self) -> TunnelResult<TunnelSession<'_>> {
        self.start()?;
        Ok(TunnelSession { manager: self })
    }

    /// Run `f` with the tunnel up, stopping it afterwards
    pub fn with_tunnel<T, E, F>(&mut self, f: F) -> Result<T, E>
    where
        F: FnOnce(&TunnelConfig) -> Result<T, E>,
        E: From<TunnelError>,
    {
        let session = self.open()?;
        let result = f(session.config());
        session.close()?;
        result
    }
}

impl Drop for TunnelManager {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!("{}", e);
        }
    }
}

/// Scope guard for a running tunnel
pub struct TunnelSession<'a> {
    manager: &'a mut TunnelManager,
}

impl TunnelSession<'_> {
    pub fn config(&self) -> &TunnelConfig {
        self.manager.config()
    }

    pub fn health_check(&self) -> bool {
        self.manager.health_check()
    }

    /// Stop now and report any failure
    pub fn close(self) -> TunnelResult<()> {
        let mut session = std::mem::ManuallyDrop::new(self);
        session.manager.stop()
    }
}

impl Drop for TunnelSession<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.manager.stop() {
            tracing::warn!("{}", e);
        }
    }
}

/// Single TCP connect attempt
pub fn port_open(host: &str, port: u16, timeout: Duration) -> bool {
    let Ok(addrs) = (host, port).to_socket_addrs() else {
        return false;
    };
    addrs
        .into_iter()
        .any(|addr| TcpStream::connect_timeout(&addr, timeout).is_ok())
}

fn spawn_drain<R: Read + Send + 'static>(
    reader: R,
    sink: Arc<Mutex<VecDeque<String>>>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        for line in BufReader::new(reader).lines() {
            let Ok(line) = line else { break };
            tracing::info!(target: "tunnel", "{}", line);
            if let Ok(mut tail) = sink.lock() {
                if tail.len() == OUTPUT_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        }
    })
}

fn output_tail(output: &Mutex<VecDeque<String>>) -> String {
    output
        .lock()
        .map(|tail| tail.iter().cloned().collect::<Vec<_>>().join("\n"))
        .unwrap_or_default()
}

/// Join drain threads, abandoning any still blocked after a short wait
///
/// A surviving grandchild can hold the pipes open indefinitely.
fn join_drains(drains: Vec<JoinHandle<()>>) {
    let deadline = Instant::now() + DRAIN_JOIN_TIMEOUT;
    while Instant::now() < deadline && !drains.iter().all(|d| d.is_finished()) {
        std::thread::sleep(Duration::from_millis(10));
    }
    for drain in drains.into_iter().filter(|d| d.is_finished()) {
        let _ = drain.join();
    }
}

fn teardown(mut handle: TunnelHandle, config: &TunnelConfig) -> TunnelResult<()> {
    let result = shutdown(&mut handle.process, config.stop_grace, config.poll_interval);
    process::unregister_group(handle.process.id());
    let outcome = result.map_err(|e| TunnelError::Stop(e.to_string()))?;
    tracing::debug!("Tunnel shutdown: {:?}", outcome);

    join_drains(handle.drains);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn azure_config() -> PipelineConfig {
        let mut config = PipelineConfig::new();
        config.azure.subscription_id = Some("sub".to_string());
        config.azure.resource_group = Some("rg".to_string());
        config.azure.vm_name = Some("jump".to_string());
        config
    }

    #[test]
    fn test_command_args() {
        let tunnel = TunnelConfig::from_config(&azure_config()).unwrap();
        assert_eq!(
            tunnel.command_args(),
            vec![
                "network",
                "bastion",
                "tunnel",
                "--name",
                "bastion-host",
                "--resource-group",
                "rg",
                "--target-resource-id",
                "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Compute/virtualMachines/jump",
                "--resource-port",
                "5432",
                "--port",
                "5438",
            ]
        );
    }

    #[test]
    fn test_missing_vm_names_key() {
        let mut config = azure_config();
        config.azure.vm_name = None;
        let err = TunnelConfig::from_config(&config).unwrap_err();
        assert!(matches!(
            err,
            TunnelError::Config(ConfigError::MissingKey(ref k)) if k == "VM_NAME"
        ));
    }

    #[test]
    fn test_stop_without_start_is_noop() {
        let mut manager = TunnelManager::new(TunnelConfig::from_config(&azure_config()).unwrap());
        manager.stop().unwrap();
        manager.stop().unwrap();
        assert_eq!(manager.state(), TunnelState::Idle);
        assert!(!manager.is_running());
    }

    #[test]
    fn test_missing_binary() {
        let mut config = TunnelConfig::from_config(&azure_config()).unwrap();
        config.program = "no-such-az-binary-xyz".to_string();
        let mut manager = TunnelManager::new(config);
        assert!(matches!(
            manager.start(),
            Err(TunnelError::BinaryNotFound(_))
        ));
        assert_eq!(manager.state(), TunnelState::Idle);
    }

    #[test]
    fn test_port_open_against_listener() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(port_open("127.0.0.1", port, Duration::from_secs(1)));
        drop(listener);
        assert!(!port_open("127.0.0.1", port, Duration::from_millis(200)));
    }
}
