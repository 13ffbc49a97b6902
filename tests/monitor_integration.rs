//! End-to-end tests for the supervisor facade.
//!
//! These spawn real children, so they are Unix-only and skip themselves
//! when a helper binary is missing from the host.

#![cfg(unix)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use watchbox::types::MonitorError;
use watchbox::{spawn, IoEndpoint, SpawnRequest};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn have(binary: &str) -> bool {
    Path::new(binary).exists()
}

fn quiet_request(command: &str, args: &[&str]) -> SpawnRequest {
    let mut req = SpawnRequest::new(command);
    req.args = args.iter().map(|s| s.to_string()).collect();
    req.stdin = IoEndpoint::Null;
    req.stdout = IoEndpoint::Null;
    req.stderr = IoEndpoint::Null;
    req.poll_interval_ms = 10;
    req
}

#[test]
fn true_reports_clean_exit() {
    init_logging();
    if !have("/bin/true") {
        return;
    }

    let handle = spawn(quiet_request("/bin/true", &[])).unwrap();
    assert!(handle.pid() > 0);

    let record = handle.into_result().unwrap();
    assert_eq!(record.exit_code, Some(0));
    assert!(!record.timed_out);
    assert!(!record.memory_limit_exceeded);
    assert!(!record.stopped);
    assert!(!record.spawn_error);
}

#[test]
fn false_reports_exit_one() {
    init_logging();
    if !have("/bin/false") {
        return;
    }

    let record = spawn(quiet_request("/bin/false", &[]))
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(record.exit_code, Some(1));
    assert!(!record.timed_out && !record.memory_limit_exceeded && !record.stopped);
}

#[test]
fn exit_codes_round_trip() {
    init_logging();
    if !have("/bin/sh") {
        return;
    }

    let record = spawn(quiet_request("/bin/sh", &["-c", "exit 42"]))
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(record.exit_code, Some(42));
    assert_eq!(record.term_signal, None);
}

#[test]
fn busy_loop_hits_the_cpu_limit() {
    init_logging();
    if !have("/bin/sh") {
        return;
    }

    let mut req = quiet_request("/bin/sh", &["-c", "while :; do :; done"]);
    req.cpu_time_limit_ms = 500;

    let started = Instant::now();
    let record = spawn(req).unwrap().into_result().unwrap();

    assert!(record.timed_out, "expected a time-limit verdict: {:?}", record);
    assert_eq!(record.exit_code, None);
    assert!(!record.memory_limit_exceeded);
    assert!(!record.stopped);
    assert!(record.elapsed_cpu_ms >= 500, "cpu={}ms", record.elapsed_cpu_ms);
    // The loop must act within the poll cadence, not at the wall net.
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn allocator_hits_the_memory_limit() {
    init_logging();
    if !(have("/bin/dd") || have("/usr/bin/dd")) {
        return;
    }

    let limit = 64 * 1024 * 1024;
    let mut req = quiet_request(
        "dd",
        &["if=/dev/zero", "of=/dev/null", "bs=256M", "count=1000"],
    );
    req.memory_limit_bytes = limit;

    let record = spawn(req).unwrap().into_result().unwrap();
    assert!(
        record.memory_limit_exceeded,
        "expected a memory-limit verdict: {:?}",
        record
    );
    assert_eq!(record.exit_code, None);
    assert!(!record.timed_out);
    assert!(!record.stopped);
    assert!(record.peak_memory_bytes >= limit, "peak={}", record.peak_memory_bytes);
}

#[test]
fn cancellation_stops_a_sleeping_child() {
    init_logging();
    if !have("/bin/sleep") {
        return;
    }

    let handle = spawn(quiet_request("/bin/sleep", &["5"])).unwrap();
    let canceler = handle.canceler();

    std::thread::sleep(Duration::from_millis(100));
    let started = Instant::now();
    assert!(canceler.cancel(), "monitor should still be watching");

    let record = handle.into_result().unwrap();
    assert!(record.stopped, "expected a cancellation verdict: {:?}", record);
    assert_eq!(record.exit_code, None);
    assert!(!record.timed_out && !record.memory_limit_exceeded);
    // Bounded by the poll interval plus the reap, not by the sleep.
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[test]
fn cancel_after_natural_exit_is_a_noop() {
    init_logging();
    if !have("/bin/true") {
        return;
    }

    let handle = spawn(quiet_request("/bin/true", &[])).unwrap();
    std::thread::sleep(Duration::from_millis(300));

    assert!(!handle.cancel(), "monitor already finished");
    let record = handle.into_result().unwrap();
    assert_eq!(record.exit_code, Some(0));
    assert!(!record.stopped);
    assert!(!record.timed_out);
}

#[test]
fn repeated_cancellations_collapse_to_one_kill() {
    init_logging();
    if !have("/bin/sleep") {
        return;
    }

    let handle = spawn(quiet_request("/bin/sleep", &["5"])).unwrap();
    let canceler = handle.canceler();
    std::thread::sleep(Duration::from_millis(50));

    canceler.cancel();
    canceler.cancel();
    canceler.cancel();

    let record = handle.into_result().unwrap();
    assert!(record.stopped);
    // Once the monitor is done every further cancel is inert.
    assert!(!canceler.cancel());
}

#[test]
fn external_sigkill_reports_raw_signal() {
    init_logging();
    if !have("/bin/sh") {
        return;
    }

    let record = spawn(quiet_request("/bin/sh", &["-c", "kill -9 $$"]))
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(record.exit_code, None);
    assert_eq!(record.term_signal, Some(9));
    // Unattributable external kill: no cause flag may be invented.
    assert!(!record.timed_out && !record.memory_limit_exceeded && !record.stopped);
}

#[test]
fn zero_limits_mean_no_limits() {
    init_logging();
    if !have("/bin/sleep") {
        return;
    }

    // Sleeps longer than any default interval; with both limits at 0
    // nothing may kill it, including the wall-clock net.
    let record = spawn(quiet_request("/bin/sleep", &["0.3"]))
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(record.exit_code, Some(0));
    assert!(!record.timed_out && !record.memory_limit_exceeded && !record.stopped);
}

#[test]
fn unknown_binary_fails_before_a_future_exists() {
    init_logging();
    let err = spawn(quiet_request("/no/such/binary", &[])).unwrap_err();
    match err {
        MonitorError::Spawn(msg) => assert!(msg.contains("/no/such/binary"), "{}", msg),
        other => panic!("expected a spawn error, got {:?}", other),
    }
}

#[test]
fn bad_cwd_fails_before_a_future_exists() {
    init_logging();
    if !have("/bin/true") {
        return;
    }

    let mut req = quiet_request("/bin/true", &[]);
    req.cwd = Some("/no/such/directory".into());
    assert!(matches!(spawn(req), Err(MonitorError::Spawn(_))));
}

#[test]
fn unserved_endpoint_fails_before_a_future_exists() {
    init_logging();
    if !have("/bin/true") {
        return;
    }

    let mut req = quiet_request("/bin/true", &[]);
    req.stdout = IoEndpoint::Named("/tmp/watchbox-no-listener.sock".to_string());
    assert!(matches!(spawn(req), Err(MonitorError::EndpointConnect(_))));
}

#[test]
fn spawn_notification_fires_before_the_result() {
    init_logging();
    if !have("/bin/true") {
        return;
    }

    let seen = Arc::new(AtomicBool::new(false));
    let flag = seen.clone();

    let mut req = quiet_request("/bin/true", &[]);
    req.on_spawn = Some(Box::new(move || {
        flag.store(true, Ordering::SeqCst);
    }));

    let record = spawn(req).unwrap().into_result().unwrap();
    assert_eq!(record.exit_code, Some(0));
    assert!(seen.load(Ordering::SeqCst));
}

#[test]
fn named_endpoint_streams_child_output() {
    init_logging();
    if !have("/bin/sh") {
        return;
    }

    use std::io::Read;
    use std::os::unix::net::UnixListener;

    let sock = std::env::temp_dir().join(format!("watchbox-out-{}.sock", std::process::id()));
    let _ = std::fs::remove_file(&sock);
    let listener = UnixListener::bind(&sock).unwrap();

    let mut req = quiet_request("/bin/sh", &["-c", "echo hello; pwd"]);
    req.cwd = Some("/tmp".into());
    req.stdout = IoEndpoint::Named(sock.to_string_lossy().into_owned());

    let handle = spawn(req).unwrap();

    let (mut stream, _) = listener.accept().unwrap();
    let mut output = String::new();
    stream.read_to_string(&mut output).unwrap();

    let record = handle.into_result().unwrap();
    assert_eq!(record.exit_code, Some(0));

    let mut lines = output.lines();
    assert_eq!(lines.next(), Some("hello"));
    // /tmp may resolve through a symlink on some hosts.
    assert!(lines.next().unwrap_or_default().contains("tmp"));

    let _ = std::fs::remove_file(&sock);
}

#[test]
fn concurrent_spawns_do_not_interfere() {
    init_logging();
    if !have("/bin/sh") {
        return;
    }

    let handles: Vec<_> = (0..4)
        .map(|i| {
            spawn(quiet_request(
                "/bin/sh",
                &["-c", &format!("exit {}", 10 + i)],
            ))
            .unwrap()
        })
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        let record = handle.into_result().unwrap();
        assert_eq!(record.exit_code, Some(10 + i as i32));
    }
}
