//! Integration tests for peer process discovery through `/proc`.
//!
//! These tests spawn real child processes with a `WINEPREFIX` and look them up
//! the same way a session looks up a running wineserver.

use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use uuid::Uuid;
use winecell::system::{HelperProcessLocator, PeerEnvironmentReader, ProcfsReader};

/// Child killed when the test ends.
struct Peer(Child);

impl Peer {
    fn spawn(prefix: &Path, extra: &[(&str, &str)]) -> Self {
        let child = Command::new("sleep")
            .arg("30")
            .env("WINEPREFIX", prefix)
            .envs(extra.iter().copied())
            .stdin(Stdio::null())
            .spawn()
            .expect("failed to spawn peer");
        Self(child)
    }

    fn pid(&self) -> u32 {
        self.0.id()
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

/// Waits until the peer has exec'd and shows up under its new name.
fn wait_for_name(reader: &ProcfsReader, name: &str, pid: u32) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if reader.pids_named(name).contains(&pid) {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("process {pid} never showed up as {name}");
}

fn unique_prefix() -> std::path::PathBuf {
    std::env::temp_dir().join(format!("winecell-test-prefix-{}", Uuid::new_v4()))
}

// =============================================================================
// Discovery Tests
// =============================================================================

/// A peer for the prefix is found and its environment captured.
#[test]
fn test_locate_real_peer() {
    let prefix = unique_prefix();
    let reader = ProcfsReader::new();
    let peer = Peer::spawn(&prefix, &[("WINEFSYNC", "0"), ("PROTON_NO_ESYNC", "1")]);
    wait_for_name(&reader, "sleep", peer.pid());

    let handle = HelperProcessLocator::new(&reader)
        .with_helper_name("sleep")
        .locate(&prefix)
        .expect("peer not found");

    assert_eq!(handle.pid, peer.pid());
    assert_eq!(handle.prefix, prefix);
    assert_eq!(handle.environment.get("WINEFSYNC"), Some("0"));
    assert_eq!(handle.environment.get("PROTON_NO_ESYNC"), Some("1"));
}

/// Peers for other prefixes are never returned.
#[test]
fn test_other_prefix_not_matched() {
    let reader = ProcfsReader::new();
    let peer = Peer::spawn(&unique_prefix(), &[]);
    wait_for_name(&reader, "sleep", peer.pid());

    let found = HelperProcessLocator::new(&reader)
        .with_helper_name("sleep")
        .locate(&unique_prefix());
    assert!(found.is_none());
}

/// The process treated as self is skipped.
#[test]
fn test_self_is_excluded() {
    let prefix = unique_prefix();
    let reader = ProcfsReader::new();
    let peer = Peer::spawn(&prefix, &[]);
    wait_for_name(&reader, "sleep", peer.pid());

    let found = HelperProcessLocator::new(&reader)
        .with_helper_name("sleep")
        .with_self_pid(peer.pid())
        .locate(&prefix);
    assert!(found.is_none());
}

/// With two peers for one prefix the lower PID wins.
#[test]
fn test_lowest_pid_wins() {
    let prefix = unique_prefix();
    let reader = ProcfsReader::new();
    let first = Peer::spawn(&prefix, &[("WINEFSYNC", "0")]);
    let second = Peer::spawn(&prefix, &[("WINEFSYNC", "1")]);
    wait_for_name(&reader, "sleep", first.pid());
    wait_for_name(&reader, "sleep", second.pid());

    let handle = HelperProcessLocator::new(&reader)
        .with_helper_name("sleep")
        .locate(&prefix)
        .expect("peer not found");
    assert_eq!(handle.pid, first.pid().min(second.pid()));
}

/// A peer that exits is no longer found.
#[test]
fn test_exited_peer_is_gone() {
    let prefix = unique_prefix();
    let reader = ProcfsReader::new();
    let peer = Peer::spawn(&prefix, &[]);
    wait_for_name(&reader, "sleep", peer.pid());
    drop(peer);

    let found = HelperProcessLocator::new(&reader)
        .with_helper_name("sleep")
        .locate(&prefix);
    assert!(found.is_none());
}

/// Reading the command line of a real process.
#[test]
fn test_command_line_of_real_process() {
    let reader = ProcfsReader::new();
    let peer = Peer::spawn(&unique_prefix(), &[]);
    wait_for_name(&reader, "sleep", peer.pid());

    let argv = reader.command_line(peer.pid()).expect("no command line");
    assert_eq!(argv.last().map(String::as_str), Some("30"));
    assert!(reader.command_line(u32::MAX).is_none());
}
