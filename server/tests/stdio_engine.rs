//! Drives `StdioEngine` against a scripted stand-in server.
#![cfg(unix)]

use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use omnilink_server::events::names;
use omnilink_server::{
    EngineDeps, EngineEvent, Engine, EventSink, HostKind, HostResolvers, LaunchTarget,
    LaunchTargetKind, Platform, ProcessTree, RequestError, ServerOptions, ServerState,
    StartError, StartRequest, StdioEngine, SystemProcessTree, TreeFut,
};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

/// Announces itself, then answers every request by echoing its command.
/// `/fail` gets an error response and `/hang` gets none.
const ECHO_SERVER: &str = r#"
echo 'Starting fake server'
echo '{"Type":"event","Event":"started","Body":null}'
while IFS= read -r line; do
  seq=$(printf '%s' "$line" | sed -n 's/.*"Seq":\([0-9]*\).*/\1/p')
  cmd=$(printf '%s' "$line" | sed -n 's/.*"Command":"\([^"]*\)".*/\1/p')
  case "$cmd" in
    /fail) printf '{"Type":"response","Request_seq":%s,"Command":"%s","Success":false,"Message":"no such symbol","Body":null}\n' "$seq" "$cmd" ;;
    /hang) ;;
    *) printf '{"Type":"response","Request_seq":%s,"Command":"%s","Success":true,"Body":{"Echo":"%s","Seq":%s}}\n' "$seq" "$cmd" "$cmd" "$seq" ;;
  esac
done
"#;

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<EngineEvent>>,
}

impl RecordingSink {
    fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl EventSink for RecordingSink {
    fn post(&self, event: EngineEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Real process table that remembers the order pids were signalled in.
#[derive(Default)]
struct RecordingTree {
    signalled: Mutex<Vec<u32>>,
}

impl ProcessTree for RecordingTree {
    fn snapshot(&self) -> TreeFut<'_, Vec<(u32, u32)>> {
        SystemProcessTree.snapshot()
    }

    fn terminate(&self, pid: u32) -> io::Result<()> {
        self.signalled.lock().unwrap().push(pid);
        SystemProcessTree.terminate(pid)
    }

    fn kill_tree(&self, pid: u32) -> TreeFut<'_, ()> {
        SystemProcessTree.kill_tree(pid)
    }
}

struct Fixture {
    engine: StdioEngine,
    sink: Arc<RecordingSink>,
    tree: Arc<RecordingTree>,
    workspace: tempfile::TempDir,
}

fn fixture(timeout_secs: u64) -> Fixture {
    let sink = Arc::new(RecordingSink::default());
    let tree = Arc::new(RecordingTree::default());
    let options = ServerOptions {
        path: Some(String::from("/bin/sh")),
        host: HostKind::Direct,
        project_load_timeout: timeout_secs,
        ..ServerOptions::default()
    };
    let deps = EngineDeps {
        resolvers: HostResolvers::default(),
        tree: tree.clone(),
        sink: sink.clone(),
        platform: Platform::Posix,
    };
    Fixture {
        engine: StdioEngine::new(options, deps),
        sink,
        tree,
        workspace: tempfile::tempdir().unwrap(),
    }
}

fn start_request(workspace: &Path, script: &str) -> StartRequest {
    StartRequest {
        cwd: workspace.to_path_buf(),
        args: vec![String::from("-c"), script.to_string(), String::from("fake-server")],
        target: LaunchTarget::new(
            LaunchTargetKind::Folder,
            workspace.to_path_buf(),
            workspace.to_path_buf(),
            "workspace",
        ),
    }
}

fn sent_requests(sink: &RecordingSink) -> usize {
    sink.events()
        .iter()
        .filter(|event| matches!(event, EngineEvent::RequestSent { .. }))
        .count()
}

#[tokio::test]
async fn request_round_trip() {
    let f = fixture(10);
    f.engine
        .start(start_request(f.workspace.path(), ECHO_SERVER))
        .await
        .unwrap();
    assert_eq!(f.engine.state(), ServerState::Started);

    let body = f
        .engine
        .make_request("/typelookup", Some(json!({ "Line": 3 })), None)
        .await
        .unwrap();
    assert_eq!(body["Echo"], "/typelookup");

    let (a, b) = tokio::join!(
        f.engine.make_request("/findusages", None, None),
        f.engine.make_request("/codecheck", None, None),
    );
    assert_eq!(a.unwrap()["Echo"], "/findusages");
    assert_eq!(b.unwrap()["Echo"], "/codecheck");

    f.engine.stop().await.unwrap();
    assert_eq!(f.engine.state(), ServerState::Stopped);
}

#[tokio::test]
async fn failed_response_rejects_only_that_request() {
    let f = fixture(10);
    f.engine
        .start(start_request(f.workspace.path(), ECHO_SERVER))
        .await
        .unwrap();

    let err = f.engine.make_request("/fail", None, None).await.unwrap_err();
    assert_eq!(
        err,
        RequestError::Failed {
            command: String::from("/fail"),
            message: String::from("no such symbol"),
        }
    );
    assert!(f.engine.make_request("/quickinfo", None, None).await.is_ok());

    f.engine.stop().await.unwrap();
}

#[tokio::test]
async fn typed_request_decodes_body() {
    #[derive(serde::Deserialize)]
    struct Echo {
        #[serde(rename = "Echo")]
        echo: String,
    }

    let f = fixture(10);
    let engine: Box<dyn Engine> = Box::new(f.engine);
    engine
        .start(start_request(f.workspace.path(), ECHO_SERVER))
        .await
        .unwrap();

    let echo: Echo = engine.request("/signatureHelp", None, None).await.unwrap();
    assert_eq!(echo.echo, "/signatureHelp");
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn startup_timeout_names_setting_and_sends_nothing() {
    let f = fixture(1);
    let engine = Arc::new(f.engine);

    let pending = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            // Give start() time to reach the Starting state.
            sleep(Duration::from_millis(200)).await;
            engine.make_request("/projects", None, None).await
        })
    };

    let err = engine
        .start(start_request(f.workspace.path(), "exec sleep 30"))
        .await
        .unwrap_err();
    assert!(matches!(err, StartError::Timeout { .. }));
    assert!(err.to_string().contains("project_load_timeout"));
    assert_eq!(engine.state(), ServerState::Stopped);

    let queued = pending.await.unwrap();
    assert!(matches!(
        queued,
        Err(RequestError::ServerStopped { .. } | RequestError::NotRunning)
    ));
    assert_eq!(sent_requests(&f.sink), 0);
}

#[tokio::test]
async fn stop_signals_descendants_before_root() {
    let f = fixture(10);
    let script = format!("sleep 30 &\nsleep 30 &\n{ECHO_SERVER}");
    f.engine
        .start(start_request(f.workspace.path(), &script))
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _stop = f.engine.subscribe(
        names::SERVER_STOP,
        Arc::new(move |_: &Value| {
            let _ = tx.send(());
        }),
    );

    f.engine.stop().await.unwrap();
    assert!(rx.try_recv().is_ok());

    let signalled = f.tree.signalled.lock().unwrap().clone();
    assert!(signalled.len() >= 3, "signalled: {signalled:?}");
    let root = *signalled.last().unwrap();
    assert!(!signalled[..signalled.len() - 1].contains(&root));
    assert!(f
        .sink
        .events()
        .iter()
        .all(|event| !matches!(event, EngineEvent::UnexpectedExit { .. })));
}

#[tokio::test]
async fn stop_is_idempotent() {
    let f = fixture(10);
    f.engine.stop().await.unwrap();
    f.engine
        .start(start_request(f.workspace.path(), ECHO_SERVER))
        .await
        .unwrap();
    f.engine.stop().await.unwrap();
    f.engine.stop().await.unwrap();
    assert_eq!(f.engine.state(), ServerState::Stopped);
    assert_eq!(
        f.engine.make_request("/x", None, None).await.unwrap_err(),
        RequestError::NotRunning
    );
}

#[tokio::test]
async fn stop_rejects_outstanding_requests() {
    let f = fixture(10);
    let engine = Arc::new(f.engine);
    engine
        .start(start_request(f.workspace.path(), ECHO_SERVER))
        .await
        .unwrap();

    let hanging = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.make_request("/hang", None, None).await })
    };
    while sent_requests(&f.sink) == 0 {
        sleep(Duration::from_millis(10)).await;
    }

    engine.stop().await.unwrap();
    assert_eq!(
        hanging.await.unwrap().unwrap_err(),
        RequestError::ServerStopped {
            command: String::from("/hang")
        }
    );
}

#[tokio::test]
async fn cancelling_pending_request_rejects_it_but_in_flight_keeps_waiting() {
    let f = fixture(10);
    let engine = Arc::new(f.engine);
    engine
        .start(start_request(f.workspace.path(), ECHO_SERVER))
        .await
        .unwrap();

    // Two unanswered requests fill the deferred queue.
    let in_flight_token = CancellationToken::new();
    let in_flight = {
        let engine = Arc::clone(&engine);
        let token = in_flight_token.clone();
        tokio::spawn(async move { engine.make_request("/hang", None, Some(token)).await })
    };
    let _other = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.make_request("/hang", None, None).await })
    };
    while sent_requests(&f.sink) < 2 {
        sleep(Duration::from_millis(10)).await;
    }

    let pending_token = CancellationToken::new();
    let pending = {
        let engine = Arc::clone(&engine);
        let token = pending_token.clone();
        tokio::spawn(async move { engine.make_request("/hang", None, Some(token)).await })
    };
    sleep(Duration::from_millis(100)).await;
    pending_token.cancel();
    assert_eq!(
        pending.await.unwrap().unwrap_err(),
        RequestError::Cancelled {
            command: String::from("/hang")
        }
    );

    in_flight_token.cancel();
    sleep(Duration::from_millis(200)).await;
    assert!(!in_flight.is_finished());
    assert_eq!(sent_requests(&f.sink), 2);

    engine.stop().await.unwrap();
    assert_eq!(
        in_flight.await.unwrap().unwrap_err(),
        RequestError::ServerStopped {
            command: String::from("/hang")
        }
    );
}

#[tokio::test]
async fn stop_while_starting_does_not_wait_for_load_timeout() {
    let f = fixture(5);
    let engine = Arc::new(f.engine);

    let starting = {
        let engine = Arc::clone(&engine);
        let request = start_request(f.workspace.path(), "exec sleep 30");
        tokio::spawn(async move { engine.start(request).await })
    };
    sleep(Duration::from_millis(300)).await;
    assert_eq!(engine.state(), ServerState::Starting);

    let began = Instant::now();
    engine.stop().await.unwrap();
    let elapsed = began.elapsed();
    assert!(elapsed < Duration::from_secs(2), "stop took {elapsed:?}");

    let err = starting.await.unwrap().unwrap_err();
    assert!(matches!(err, StartError::Stopped));
    assert_eq!(engine.state(), ServerState::Stopped);
    assert_eq!(sent_requests(&f.sink), 0);
}

#[tokio::test]
async fn unexpected_exit_is_reported() {
    let f = fixture(10);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _exited = f.engine.subscribe(
        names::SERVER_EXITED,
        Arc::new(move |body: &Value| {
            let _ = tx.send(body.clone());
        }),
    );

    let script = r#"echo '{"Type":"event","Event":"started","Body":null}'
read -r line
exit 3"#;
    f.engine
        .start(start_request(f.workspace.path(), script))
        .await
        .unwrap();

    let err = f.engine.make_request("/hang", None, None).await.unwrap_err();
    assert!(matches!(err, RequestError::ServerStopped { .. }));

    let body = timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(body["code"], 3);
    assert_eq!(f.engine.state(), ServerState::Stopped);
    assert!(f
        .sink
        .events()
        .iter()
        .any(|event| matches!(event, EngineEvent::UnexpectedExit { code: Some(3) })));
}

#[tokio::test]
async fn wait_for_initialize_and_stdout_text() {
    let f = fixture(10);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _stdout = f.engine.subscribe(
        names::STDOUT,
        Arc::new(move |body: &Value| {
            let _ = tx.send(body.clone());
        }),
    );

    f.engine
        .start(start_request(f.workspace.path(), ECHO_SERVER))
        .await
        .unwrap();
    f.engine.wait_for_initialize().await;

    assert_eq!(rx.recv().await.unwrap(), Value::from("Starting fake server"));
    f.engine.stop().await.unwrap();
}

#[tokio::test]
async fn second_start_is_rejected() {
    let f = fixture(10);
    f.engine
        .start(start_request(f.workspace.path(), ECHO_SERVER))
        .await
        .unwrap();
    let err = f
        .engine
        .start(start_request(f.workspace.path(), ECHO_SERVER))
        .await
        .unwrap_err();
    assert!(matches!(err, StartError::AlreadyRunning));
    f.engine.stop().await.unwrap();
}
