//! Multi-client end-to-end scenarios over the control channel.
//!
//! Each test starts an in-process daemon on a tempdir socket and
//! drives it with real socket clients through the client-side codec,
//! so the full path (codec, connection task, broker, registry,
//! simulated source) is exercised. Abrupt client death is modeled by
//! dropping the client's stream without sending `quit`.

use std::path::Path;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tempfile::TempDir;
use tokio::net::UnixStream;
use tokio_util::codec::Framed;

use frameline_daemon::broker::StatusSnapshot;
use frameline_daemon::control::codec::ReplyCodec;
use frameline_daemon::source::{SimulatedConfig, SimulatedSource};
use frameline_daemon::{Daemon, DaemonConfig};

/// Lag tolerated between a channel rupture and state convergence.
const RUPTURE_LAG: Duration = Duration::from_millis(5);

struct Fixture {
    daemon: Daemon,
    _dir: TempDir,
}

impl Fixture {
    async fn start() -> Self {
        Self::start_with_source(SimulatedConfig {
            frame_interval: Duration::from_millis(1),
            ..SimulatedConfig::default()
        })
        .await
    }

    async fn start_with_source(source_config: SimulatedConfig) -> Self {
        let dir = TempDir::new().expect("tempdir");
        let source = SimulatedSource::open(source_config).expect("source opens");
        let daemon = Daemon::spawn(
            DaemonConfig {
                control_pipe: dir.path().join("control.sock"),
                nsm_prefix: "frameline-test-nsm".to_owned(),
                intro_nsm: "frameline-test-intro".to_owned(),
                enable_test_control: true,
            },
            Box::new(source),
        )
        .expect("daemon spawns");
        Self { daemon, _dir: dir }
    }

    async fn client(&self) -> TestClient {
        TestClient::connect(self.daemon.socket_path()).await
    }

    async fn shutdown(self) {
        self.daemon.shutdown().await;
    }
}

struct TestClient {
    framed: Framed<UnixStream, ReplyCodec>,
}

impl TestClient {
    async fn connect(path: &Path) -> Self {
        let stream = UnixStream::connect(path).await.expect("client connects");
        let mut client = Self {
            framed: Framed::new(stream, ReplyCodec),
        };
        // Connection sanity check, as every client does on launch.
        assert_eq!(client.command("ping").await, "ping-ok");
        client
    }

    async fn command(&mut self, command: &str) -> String {
        self.framed
            .send(command.to_owned())
            .await
            .expect("command sent");
        self.framed
            .next()
            .await
            .expect("reply present")
            .expect("reply decodes")
    }

    async fn register(&mut self, args: &str) -> String {
        self.command(&format!("register {args}")).await
    }

    async fn status(&mut self) -> StatusSnapshot {
        let payload = self.command("status").await;
        serde_json::from_str(&payload).expect("status parses")
    }

    async fn quit(mut self) {
        assert_eq!(self.command("quit").await, "quit-ok");
        // Orderly close: server shuts the stream after quit-ok.
        let _ = self.framed.next().await;
    }

    /// Abrupt termination: the stream is torn down with no quit.
    fn murder(self) {
        drop(self.framed);
    }
}

// Status defaults with no clients connected: no streamed pids, both
// parameters at their defaults.
#[tokio::test]
async fn status_defaults() {
    let fixture = Fixture::start().await;
    let mut monitor = fixture.client().await;

    let status = monitor.status().await;
    assert_eq!(status.nsm_streamed_pids, Vec::<u32>::new());
    assert_eq!(status.telemetry_period_ms, 16);
    assert_eq!(status.etw_flush_period_ms, 1000);

    monitor.quit().await;
    fixture.shutdown().await;
}

// Telemetry period arbitration: the oldest still-connected session
// with a request wins; reversion follows connect order, ending at the
// default.
#[tokio::test]
async fn telemetry_first_writer_wins() {
    let fixture = Fixture::start().await;
    let mut monitor = fixture.client().await;

    let mut a = fixture.client().await;
    assert_eq!(a.register("--telemetry-period-ms 63").await, "register-ok");
    assert_eq!(monitor.status().await.telemetry_period_ms, 63);

    let mut b = fixture.client().await;
    assert_eq!(b.register("--telemetry-period-ms 135").await, "register-ok");
    assert_eq!(monitor.status().await.telemetry_period_ms, 63);

    let mut c = fixture.client().await;
    assert_eq!(c.register("--telemetry-period-ms 36").await, "register-ok");
    assert_eq!(monitor.status().await.telemetry_period_ms, 63);

    a.quit().await;
    assert_eq!(monitor.status().await.telemetry_period_ms, 135);

    b.quit().await;
    assert_eq!(monitor.status().await.telemetry_period_ms, 36);

    c.quit().await;
    assert_eq!(monitor.status().await.telemetry_period_ms, 16);

    monitor.quit().await;
    fixture.shutdown().await;
}

// Flush period arbitration: the smallest request wins; reversion
// recomputes the minimum, ending at the default.
#[tokio::test]
async fn flush_smallest_wins() {
    let fixture = Fixture::start().await;
    let mut monitor = fixture.client().await;

    let mut a = fixture.client().await;
    assert_eq!(a.register("--etw-flush-period-ms 50").await, "register-ok");
    assert_eq!(monitor.status().await.etw_flush_period_ms, 50);

    let mut b = fixture.client().await;
    assert_eq!(b.register("--etw-flush-period-ms 65").await, "register-ok");
    assert_eq!(monitor.status().await.etw_flush_period_ms, 50);

    let mut c = fixture.client().await;
    assert_eq!(c.register("--etw-flush-period-ms 35").await, "register-ok");
    assert_eq!(monitor.status().await.etw_flush_period_ms, 35);

    c.quit().await;
    assert_eq!(monitor.status().await.etw_flush_period_ms, 50);

    b.quit().await;
    assert_eq!(monitor.status().await.etw_flush_period_ms, 50);

    a.quit().await;
    assert_eq!(monitor.status().await.etw_flush_period_ms, 1000);

    monitor.quit().await;
    fixture.shutdown().await;
}

// Abrupt termination reverts parameters within the tolerated rupture
// lag, in connect order.
#[tokio::test]
async fn abrupt_termination_reverts_by_age() {
    let fixture = Fixture::start().await;
    let mut monitor = fixture.client().await;

    let mut a = fixture.client().await;
    assert_eq!(a.register("--telemetry-period-ms 63").await, "register-ok");
    let mut b = fixture.client().await;
    assert_eq!(b.register("--telemetry-period-ms 135").await, "register-ok");
    let c = {
        let mut c = fixture.client().await;
        assert_eq!(c.register("--telemetry-period-ms 36").await, "register-ok");
        c
    };
    assert_eq!(monitor.status().await.telemetry_period_ms, 63);

    // Kill C without notice: A is still the oldest requester.
    c.murder();
    tokio::time::sleep(RUPTURE_LAG).await;
    assert_eq!(monitor.status().await.telemetry_period_ms, 63);

    // Kill A: B is now the oldest remaining requester.
    a.murder();
    tokio::time::sleep(RUPTURE_LAG).await;
    assert_eq!(monitor.status().await.telemetry_period_ms, 135);

    b.murder();
    tokio::time::sleep(RUPTURE_LAG).await;
    assert_eq!(monitor.status().await.telemetry_period_ms, 16);

    monitor.quit().await;
    fixture.shutdown().await;
}

// A pid stays streamed while any session references it and is
// untracked when the last referring session closes.
#[tokio::test]
async fn untrack_on_close() {
    let fixture = Fixture::start().await;
    let mut monitor = fixture.client().await;

    let mut c1 = fixture.client().await;
    assert_eq!(c1.register("--process-id 4100").await, "register-ok");
    let mut c2 = fixture.client().await;
    assert_eq!(c2.register("--process-id 4100").await, "register-ok");
    assert_eq!(monitor.status().await.nsm_streamed_pids, vec![4100]);

    c1.quit().await;
    assert_eq!(monitor.status().await.nsm_streamed_pids, vec![4100]);

    c2.quit().await;
    assert_eq!(monitor.status().await.nsm_streamed_pids, Vec::<u32>::new());

    monitor.quit().await;
    fixture.shutdown().await;
}

// Same as above, with both clients dying abruptly.
#[tokio::test]
async fn untrack_on_murder() {
    let fixture = Fixture::start().await;
    let mut monitor = fixture.client().await;

    let c1 = {
        let mut c = fixture.client().await;
        assert_eq!(c.register("--process-id 4200").await, "register-ok");
        c
    };
    let c2 = {
        let mut c = fixture.client().await;
        assert_eq!(c.register("--process-id 4200").await, "register-ok");
        c
    };
    assert_eq!(monitor.status().await.nsm_streamed_pids, vec![4200]);

    c1.murder();
    tokio::time::sleep(RUPTURE_LAG).await;
    assert_eq!(monitor.status().await.nsm_streamed_pids, vec![4200]);

    c2.murder();
    tokio::time::sleep(RUPTURE_LAG).await;
    assert_eq!(monitor.status().await.nsm_streamed_pids, Vec::<u32>::new());

    monitor.quit().await;
    fixture.shutdown().await;
}

// Out-of-range registration parameters are rejected before affecting
// state and surface through err-check.
#[tokio::test]
async fn out_of_range_registration() {
    let fixture = Fixture::start().await;
    let mut monitor = fixture.client().await;

    let mut low = fixture.client().await;
    assert_eq!(
        low.register("--telemetry-period-ms 3 --test-expect-error")
            .await,
        "register-ok"
    );
    assert_eq!(low.command("err-check").await, "err-check-ok:OUT_OF_RANGE");

    let mut high = fixture.client().await;
    assert_eq!(
        high.register("--telemetry-period-ms 6000 --test-expect-error")
            .await,
        "register-ok"
    );
    assert_eq!(high.command("err-check").await, "err-check-ok:OUT_OF_RANGE");

    let mut flush = fixture.client().await;
    assert_eq!(
        flush
            .register("--etw-flush-period-ms 1500 --test-expect-error")
            .await,
        "register-ok"
    );
    assert_eq!(flush.command("err-check").await, "err-check-ok:OUT_OF_RANGE");

    // None of the rejected requests reached arbitration.
    let status = monitor.status().await;
    assert_eq!(status.telemetry_period_ms, 16);
    assert_eq!(status.etw_flush_period_ms, 1000);

    let mut clean = fixture.client().await;
    assert_eq!(clean.register("--telemetry-period-ms 63").await, "register-ok");
    assert_eq!(clean.command("err-check").await, "err-check-ok:OK");

    for client in [low, high, flush, clean] {
        client.quit().await;
    }
    monitor.quit().await;
    fixture.shutdown().await;
}

// A streaming client reads gathered frame rows back.
#[tokio::test]
async fn record_frames() {
    let fixture = Fixture::start().await;

    let mut client = fixture.client().await;
    assert_eq!(
        client
            .register("--process-id 4300 --run-time 1.15 --etw-flush-period-ms 8")
            .await,
        "register-ok"
    );

    let mut frames = Vec::new();
    for _ in 0..60 {
        tokio::time::sleep(Duration::from_millis(25)).await;
        let payload = client.command("get-frames").await;
        let body: serde_json::Value = serde_json::from_str(&payload).expect("frames parse");
        assert_eq!(body["status"], "get-frames-ok");
        frames.extend(body["frames"].as_array().expect("frames array").clone());
        if frames.len() >= 20 {
            break;
        }
    }
    assert!(frames.len() >= 20, "only {} frames gathered", frames.len());

    // Rows carry the gathered metric fields.
    let row = frames[0].as_object().expect("row object");
    assert_eq!(row["application"], "presenter.exe");
    assert!(row.contains_key("cpuFrameTime"));
    assert!(row.contains_key("droppedFrames"));
    // Displayed rows carry a finite display latency; dropped rows null.
    let displayed: Vec<_> = frames
        .iter()
        .filter(|f| f["droppedFrames"] == serde_json::Value::Bool(false))
        .collect();
    assert!(!displayed.is_empty());
    assert!(displayed[0]["displayLatency"].as_f64().is_some());

    client.quit().await;
    fixture.shutdown().await;
}

// Several clients streaming the same pid all read frames.
#[tokio::test]
async fn multi_client_stress() {
    let fixture = Fixture::start().await;

    let mut clients = Vec::new();
    for _ in 0..8 {
        let mut client = fixture.client().await;
        assert_eq!(
            client
                .register("--process-id 4400 --etw-flush-period-ms 8")
                .await,
            "register-ok"
        );
        clients.push(client);
    }

    tokio::time::sleep(Duration::from_millis(200)).await;

    for client in &mut clients {
        let payload = client.command("get-frames").await;
        let body: serde_json::Value = serde_json::from_str(&payload).expect("frames parse");
        let count = body["frames"].as_array().expect("frames array").len();
        assert!(count >= 20, "client read only {count} frames");
    }

    for client in clients {
        client.quit().await;
    }
    fixture.shutdown().await;
}
