//! Lifecycle Integration Tests for Carbonsink
//!
//! Drive the supervisor through start, stop, rollback and run-loop scenarios
//! against real sockets and a scratch data directory.

use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use carbonsink::{App, AppError, AppState, ConfigError, ReceiverError};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

// =============================================================================
// Test Helpers
// =============================================================================

struct Listeners<'a> {
    tcp: Option<&'a str>,
    udp: Option<&'a str>,
    pickle: Option<&'a str>,
}

fn listener_yaml(name: &str, listen: Option<&str>) -> String {
    match listen {
        Some(addr) => format!("{name}:\n  listen: \"{addr}\"\n"),
        None => format!("{name}:\n  enabled: false\n"),
    }
}

/// Write a config file into `dir` and return its path.
fn write_config(dir: &Path, listeners: Listeners<'_>, common: &str) -> PathBuf {
    let path = dir.join("carbonsink.yaml");
    let yaml = format!(
        "common:\n  metric-prefix: it\n  metric-interval: 1h\n{common}\
         data:\n  path: {}\n  file-interval: 100ms\n\
         clickhouse:\n  url: http://127.0.0.1:1/\n{}{}{}",
        dir.join("data").display(),
        listener_yaml("tcp", listeners.tcp),
        listener_yaml("udp", listeners.udp),
        listener_yaml("pickle", listeners.pickle),
    );
    std::fs::write(&path, yaml).expect("Failed to write config");
    path
}

fn tcp_only(dir: &Path) -> Arc<App> {
    App::new(write_config(
        dir,
        Listeners {
            tcp: Some("127.0.0.1:0"),
            udp: None,
            pickle: None,
        },
        "",
    ))
}

/// A port that was free a moment ago.
fn free_port() -> u16 {
    let listener = StdTcpListener::bind("127.0.0.1:0").expect("Failed to bind random port");
    listener.local_addr().expect("Failed to get local addr").port()
}

// =============================================================================
// Startup
// =============================================================================

#[tokio::test]
async fn test_tcp_only_start_and_stop() {
    let dir = tempfile::tempdir().unwrap();
    let app = tcp_only(dir.path());

    app.start().await.expect("start failed");
    let status = app.status().await;
    assert_eq!(status.state, AppState::Running);
    assert!(status.writer && status.uploader && status.collector);
    assert!(status.tcp);
    assert!(!status.udp);
    assert!(!status.pickle);
    assert!(status.exit_pending);

    app.stop().await;
    let status = app.status().await;
    assert_eq!(status.state, AppState::Stopped);
    assert!(!status.writer && !status.uploader && !status.collector);
    assert!(!status.tcp && !status.udp && !status.pickle);
    assert!(!status.exit_pending);
}

#[tokio::test]
async fn test_all_receivers_start() {
    let dir = tempfile::tempdir().unwrap();
    let app = App::new(write_config(
        dir.path(),
        Listeners {
            tcp: Some("127.0.0.1:0"),
            udp: Some("127.0.0.1:0"),
            pickle: Some("127.0.0.1:0"),
        },
        "",
    ));

    app.start().await.unwrap();
    let status = app.status().await;
    assert!(status.tcp && status.udp && status.pickle);
    app.stop().await;
}

#[tokio::test]
async fn test_points_reach_data_directory() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let listen = format!("127.0.0.1:{port}");
    let app = App::new(write_config(
        dir.path(),
        Listeners {
            tcp: Some(&listen),
            udp: None,
            pickle: None,
        },
        "",
    ));
    app.start().await.unwrap();

    let addr: SocketAddr = listen.parse().unwrap();
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"integration.test.metric 42 1500000000\n")
        .await
        .unwrap();
    stream.shutdown().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    app.stop().await;

    let needle = b"integration.test.metric";
    let found = std::fs::read_dir(dir.path().join("data"))
        .unwrap()
        .filter_map(|entry| std::fs::read(entry.ok()?.path()).ok())
        .any(|body| body.windows(needle.len()).any(|w| w == needle));
    assert!(found, "point was not written to the data directory");
}

#[tokio::test]
async fn test_receiver_bind_failure_rolls_back() {
    let dir = tempfile::tempdir().unwrap();
    let occupied = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let occupied_addr = occupied.local_addr().unwrap().to_string();
    let tcp_port = free_port();
    let tcp_listen = format!("127.0.0.1:{tcp_port}");

    let app = App::new(write_config(
        dir.path(),
        Listeners {
            tcp: Some(&tcp_listen),
            udp: None,
            pickle: Some(&occupied_addr),
        },
        "",
    ));

    let err = app.start().await.unwrap_err();
    assert!(matches!(err, AppError::Receiver(ReceiverError::Bind { .. })));

    let status = app.status().await;
    assert_eq!(status.state, AppState::Stopped);
    assert!(!status.writer && !status.uploader && !status.collector);
    assert!(!status.tcp && !status.udp && !status.pickle);
    assert!(!status.exit_pending);

    // The tcp receiver started before the failure and must have released its port.
    let rebound = StdTcpListener::bind(&tcp_listen);
    assert!(rebound.is_ok(), "tcp port still in use after rollback");

    // A failed start leaves run_loop with nothing to wait for.
    tokio::time::timeout(Duration::from_secs(1), app.run_loop())
        .await
        .expect("run_loop blocked after failed start");
}

#[tokio::test]
async fn test_config_error_leaves_nothing_running() {
    let dir = tempfile::tempdir().unwrap();
    let app = App::new(write_config(
        dir.path(),
        Listeners {
            tcp: Some("127.0.0.1:0"),
            udp: None,
            pickle: None,
        },
        "  metric-endpoint: ftp://example.com:1\n",
    ));

    let err = app.start().await.unwrap_err();
    match err {
        AppError::Config(ConfigError::UnsupportedEndpointScheme { scheme, .. }) => {
            assert_eq!(scheme, "ftp");
        }
        other => panic!("unexpected error: {other}"),
    }

    let status = app.status().await;
    assert_eq!(status.state, AppState::Unconfigured);
    assert!(!status.writer && !status.tcp && !status.exit_pending);
    assert!(app.config().await.is_none());
}

#[tokio::test]
async fn test_missing_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let app = App::new(dir.path().join("absent.yaml"));
    let err = app.start().await.unwrap_err();
    assert!(matches!(err, AppError::Config(ConfigError::IoError(_))));
}

#[tokio::test]
async fn test_restart_after_stop() {
    let dir = tempfile::tempdir().unwrap();
    let app = tcp_only(dir.path());

    for _ in 0..3 {
        app.start().await.unwrap();
        assert_eq!(app.status().await.state, AppState::Running);
        app.stop().await;
        assert_eq!(app.status().await.state, AppState::Stopped);
    }
}

// =============================================================================
// Shutdown
// =============================================================================

#[tokio::test]
async fn test_stop_twice() {
    let dir = tempfile::tempdir().unwrap();
    let app = tcp_only(dir.path());
    app.start().await.unwrap();

    app.stop().await;
    app.stop().await;
    assert_eq!(app.status().await.state, AppState::Stopped);
}

#[tokio::test]
async fn test_stop_before_start() {
    let dir = tempfile::tempdir().unwrap();
    let app = tcp_only(dir.path());
    app.stop().await;
    assert_eq!(app.status().await.state, AppState::Unconfigured);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_stops() {
    let dir = tempfile::tempdir().unwrap();
    let app = tcp_only(dir.path());
    app.start().await.unwrap();

    let stops: Vec<_> = (0..8)
        .map(|_| {
            let app = Arc::clone(&app);
            tokio::spawn(async move { app.stop().await })
        })
        .collect();
    for stop in stops {
        stop.await.expect("stop panicked");
    }

    let status = app.status().await;
    assert_eq!(status.state, AppState::Stopped);
    assert!(!status.exit_pending);
}

// =============================================================================
// Run loop
// =============================================================================

#[tokio::test]
async fn test_run_loop_returns_when_not_running() {
    let dir = tempfile::tempdir().unwrap();
    let app = tcp_only(dir.path());

    tokio::time::timeout(Duration::from_secs(1), app.run_loop())
        .await
        .expect("run_loop blocked before start");

    app.start().await.unwrap();
    app.stop().await;
    tokio::time::timeout(Duration::from_secs(1), app.run_loop())
        .await
        .expect("run_loop blocked after stop");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_run_loop_blocks_until_stop() {
    let dir = tempfile::tempdir().unwrap();
    let app = tcp_only(dir.path());
    app.start().await.unwrap();

    let waiter = {
        let app = Arc::clone(&app);
        tokio::spawn(async move { app.run_loop().await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!waiter.is_finished(), "run_loop returned while running");

    app.stop().await;
    tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("run_loop did not return after stop")
        .unwrap();
}

#[tokio::test]
async fn test_clear_tree_cache_is_forwarded() {
    let dir = tempfile::tempdir().unwrap();
    let app = tcp_only(dir.path());

    // No uploader yet.
    tokio::time::timeout(Duration::from_secs(1), app.clear_tree_exists_cache())
        .await
        .expect("clear blocked before start");
    assert_eq!(app.status().await.state, AppState::Unconfigured);

    app.start().await.unwrap();
    tokio::time::timeout(Duration::from_secs(1), app.clear_tree_exists_cache())
        .await
        .expect("clear blocked while running");

    let mut cache_size = None;
    tokio::time::timeout(Duration::from_secs(1), app.stats(&mut |name: &str, value: f64| {
        if name == "uploader.treeCacheSize" {
            cache_size = Some(value);
        }
    }))
    .await
    .expect("stats blocked after clear");
    assert_eq!(cache_size, Some(0.0));

    tokio::time::timeout(Duration::from_secs(2), app.stop())
        .await
        .expect("stop blocked after clear");
    assert_eq!(app.status().await.state, AppState::Stopped);
}
