//! Tunnel lifecycle tests against scripted stand-ins for the tunnel binary

#![cfg(unix)]

use std::net::TcpListener;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use degustation_pipeline::tunnel::{TunnelConfig, TunnelError, TunnelManager, TunnelState};
use tempfile::TempDir;

fn write_script(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("fake-az");
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// A port nothing is listening on
fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn tunnel_config(program: &Path, port: u16, startup_timeout: Duration) -> TunnelConfig {
    TunnelConfig {
        program: program.to_string_lossy().into_owned(),
        bastion_name: "bastion-host".to_string(),
        resource_group: "rg".to_string(),
        target_resource_id:
            "/subscriptions/s/resourceGroups/rg/providers/Microsoft.Compute/virtualMachines/vm"
                .to_string(),
        resource_port: 5432,
        local_host: "127.0.0.1".to_string(),
        local_port: port,
        extra_args: Vec::new(),
        startup_timeout,
        health_check_timeout: Duration::from_secs(3),
        stop_grace: Duration::from_secs(2),
        poll_interval: Duration::from_millis(50),
    }
}

#[test]
fn test_unreachable_bastion_fails_fast() {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "echo 'ERROR: bastion unreachable' >&2\nexit 1");
    let mut manager =
        TunnelManager::new(tunnel_config(&script, closed_port(), Duration::from_secs(30)));

    let started = Instant::now();
    let err = manager.start().unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(10));

    match err {
        TunnelError::Exited { status, output } => {
            assert_eq!(status, "1");
            assert!(output.contains("bastion unreachable"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!manager.is_running());
    assert_eq!(manager.state(), TunnelState::Idle);
}

#[test]
fn test_start_timeout_leaves_no_handle() {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "exec sleep 30");
    let port = closed_port();
    let mut manager = TunnelManager::new(tunnel_config(&script, port, Duration::from_millis(500)));

    let started = Instant::now();
    let err = manager.start().unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(matches!(
        err,
        TunnelError::PortTimeout { port: p, .. } if p == port
    ));
    assert!(!manager.is_running());

    // Stopping afterwards is a no-op
    manager.stop().unwrap();
}

#[test]
fn test_stop_without_start() {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "exit 0");
    let mut manager =
        TunnelManager::new(tunnel_config(&script, closed_port(), Duration::from_secs(1)));
    manager.stop().unwrap();
    assert_eq!(manager.state(), TunnelState::Idle);
}

#[test]
fn test_session_stops_tunnel_on_drop() {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "exec sleep 30");
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let mut manager = TunnelManager::new(tunnel_config(&script, port, Duration::from_secs(5)));

    {
        let session = manager.open().unwrap();
        assert!(session.health_check());
    }

    assert!(!manager.is_running());
    assert_eq!(manager.state(), TunnelState::Idle);
}

#[test]
fn test_with_tunnel_stops_after_error() {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "exec sleep 30");
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let mut manager = TunnelManager::new(tunnel_config(&script, port, Duration::from_secs(5)));

    let result: Result<(), TunnelError> = manager.with_tunnel(|config| {
        assert_eq!(config.local_port, port);
        Err(TunnelError::Spawn("work failed".to_string()))
    });

    assert!(result.is_err());
    assert!(!manager.is_running());
}

#[test]
fn test_second_start_rejected() {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "exec sleep 30");
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let mut manager = TunnelManager::new(tunnel_config(&script, port, Duration::from_secs(5)));

    manager.start().unwrap();
    assert_eq!(manager.state(), TunnelState::Up);
    assert!(matches!(manager.start(), Err(TunnelError::AlreadyRunning)));
    manager.stop().unwrap();
    assert!(!manager.is_running());
}
