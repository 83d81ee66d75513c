//! CLI integration tests for `tcpee`.
//!
//! These tests invoke the compiled `tcpee` binary as a subprocess and
//! verify its behavior end-to-end. Each test operates in an isolated temp
//! directory. Tests that need real sockets skip themselves when the
//! environment denies binding to localhost.

#![allow(clippy::unwrap_used)]

use std::fs;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::Path;
use std::process::{Command, Output};
use std::time::Duration;

use tempfile::TempDir;

/// Path to the compiled `tcpee` binary, injected by Cargo at compile time.
const TCPEE: &str = env!("CARGO_BIN_EXE_tcpee");

/// Invoke `tcpee` with the given arguments and return the full Output.
fn run_tcpee(cwd: &Path, args: &[&str]) -> Output {
    Command::new(TCPEE)
        .args(args)
        .current_dir(cwd)
        .env_remove("TCPEE_LOG") // keep test output clean
        .output()
        .unwrap_or_else(|e| panic!("Failed to spawn tcpee binary: {e}"))
}

/// Assert that the command exited with a non-zero status and return stderr.
#[track_caller]
fn expect_failure(out: &Output) -> String {
    assert!(
        !out.status.success(),
        "Expected tcpee to fail but it succeeded\nstdout: {}\nstderr: {}",
        String::from_utf8_lossy(&out.stdout),
        String::from_utf8_lossy(&out.stderr),
    );
    String::from_utf8_lossy(&out.stderr).into_owned()
}

fn listener_or_skip() -> Option<TcpListener> {
    match TcpListener::bind("127.0.0.1:0") {
        Ok(listener) => Some(listener),
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => None,
        Err(err) => panic!("Failed to bind TCP listener for test: {err}"),
    }
}

/// Get a free port by binding to port 0 and dropping the listener.
fn free_addr() -> Option<SocketAddr> {
    let listener = listener_or_skip()?;
    Some(listener.local_addr().unwrap())
}

/// Echo server on its own threads, serving any number of connections.
fn spawn_echo() -> Option<SocketAddr> {
    let listener = listener_or_skip()?;
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        for conn in listener.incoming() {
            let Ok(mut conn) = conn else { return };
            std::thread::spawn(move || {
                let mut buf = [0u8; 1024];
                loop {
                    match conn.read(&mut buf) {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if conn.write_all(&buf[..n]).is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    Some(addr)
}

// ============================================================================
// Usage and configuration errors
// ============================================================================

#[test]
fn test_unknown_flag_exits_one() {
    let dir = TempDir::new().unwrap();
    let out = run_tcpee(dir.path(), &["--bogus"]);
    assert_eq!(out.status.code(), Some(1));
}

#[test]
fn test_missing_config_file_exits_one() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("absent.conf");
    let out = run_tcpee(dir.path(), &["--config", missing.to_str().unwrap()]);
    assert_eq!(out.status.code(), Some(1));
    let stderr = expect_failure(&out);
    assert!(
        stderr.contains("absent.conf"),
        "Expected the config path in stderr, got: {stderr}"
    );
}

#[test]
fn test_malformed_duration_exits_one() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("tcpee.conf");
    fs::write(
        &config,
        "[web]\nclient-timeout = \"eventually\"\nproxy = [\"127.0.0.1:1 -> 127.0.0.1:2\"]\n",
    )
    .unwrap();

    let out = run_tcpee(dir.path(), &["-c", config.to_str().unwrap()]);
    assert_eq!(out.status.code(), Some(1));
    let stderr = expect_failure(&out);
    assert!(
        stderr.contains("client-timeout"),
        "Expected the offending key in stderr, got: {stderr}"
    );
}

#[test]
fn test_malformed_route_exits_one() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("tcpee.conf");
    fs::write(&config, "[web]\nproxy = [\"127.0.0.1:1 => 127.0.0.1:2\"]\n").unwrap();

    let out = run_tcpee(dir.path(), &["-c", config.to_str().unwrap()]);
    assert_eq!(out.status.code(), Some(1));
    let stderr = expect_failure(&out);
    assert!(
        stderr.contains("src -> dst"),
        "Expected route format hint in stderr, got: {stderr}"
    );
}

#[test]
fn test_unknown_config_key_exits_one() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("tcpee.conf");
    fs::write(&config, "[web]\nspeed = \"maximum\"\n").unwrap();

    let out = run_tcpee(dir.path(), &["-c", config.to_str().unwrap()]);
    assert_eq!(out.status.code(), Some(1));
}

// ============================================================================
// End-to-end forwarding
// ============================================================================

#[test]
fn test_binary_proxies_echo_traffic() {
    let Some(echo_addr) = spawn_echo() else { return };
    let Some(front_addr) = free_addr() else { return };

    let dir = TempDir::new().unwrap();
    let config = dir.path().join("tcpee.conf");
    fs::write(
        &config,
        format!("[echo]\nproxy = [\"{front_addr} -> {echo_addr}\"]\n"),
    )
    .unwrap();

    let mut child = Command::new(TCPEE)
        .args(["--config", config.to_str().unwrap()])
        .current_dir(dir.path())
        .env_remove("TCPEE_LOG")
        .spawn()
        .unwrap();

    // Wait for the front-end listener to come up.
    let mut stream = None;
    for _ in 0..40 {
        match TcpStream::connect(front_addr) {
            Ok(conn) => {
                stream = Some(conn);
                break;
            }
            Err(_) => std::thread::sleep(Duration::from_millis(50)),
        }
    }
    let Some(mut stream) = stream else {
        let _ = child.kill();
        let _ = child.wait();
        panic!("proxy front-end never came up on {front_addr}");
    };

    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    stream.write_all(b"ping\n").unwrap();
    let mut reply = [0u8; 5];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"ping\n");

    let _ = child.kill();
    let _ = child.wait();
}
