//! Exec and per-session HTTP paths over the hijacked vsock streams.

mod support;

use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use discobot_sandbox::engine::api::StdioChunk;
use discobot_sandbox::{
    CreateOptions, ProjectVms, SessionResolver, SessionRouter, VmManager,
};
use http::Method;
use support::{engine_registry, fake_factory, test_config};

fn single_project_resolver() -> SessionResolver {
    let table: HashMap<String, String> = [("s1".to_string(), "p1".to_string())].into();
    Arc::new(move |session_id| {
        let table = table.clone();
        Box::pin(async move {
            table.get(&session_id).cloned().ok_or_else(|| {
                discobot_sandbox::Error::NotFound(format!("unknown session {}", session_id))
            })
        })
    })
}

async fn booted_router() -> (SessionRouter, tempfile::TempDir) {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    let manager = VmManager::new(
        config.clone(),
        fake_factory(engine_registry(), Arc::new(AtomicUsize::new(0))),
        None,
    );
    let router = SessionRouter::new(
        config,
        single_project_resolver(),
        manager as Arc<dyn ProjectVms>,
    );
    router.create("s1", CreateOptions::default()).await.unwrap();
    router.start("s1").await.unwrap();
    (router, tmp)
}

#[tokio::test]
async fn buffered_exec_collects_stdout() {
    let (router, _tmp) = booted_router().await;

    let output = router
        .exec("s1", vec!["echo".into(), "hi".into()], vec![])
        .await
        .unwrap();
    assert!(output.success());
    assert_eq!(output.stdout_str(), "hi\n");
    assert!(output.stderr.is_empty());
}

#[tokio::test]
async fn buffered_exec_separates_stderr() {
    let (router, _tmp) = booted_router().await;

    let output = router
        .exec("s1", vec!["stderr".into()], vec![])
        .await
        .unwrap();
    assert!(output.stdout.is_empty());
    assert_eq!(output.stderr_str(), "to stderr\n");
}

#[tokio::test]
async fn half_closed_exec_stream_still_reads() {
    let (router, _tmp) = booted_router().await;

    // `cat` echoes stdin; stdin EOF is signalled by the logical
    // half-close, after which the stream must remain readable.
    let mut stream = router
        .exec_stream("s1", vec!["cat".into()], vec![])
        .await
        .unwrap();

    stream.write_stdin(b"hello\n").await.unwrap();
    stream.close_stdin().await.unwrap();

    let chunk = stream.next_chunk().await.unwrap();
    assert_eq!(
        chunk,
        Some(StdioChunk::Stdout(bytes::Bytes::from_static(b"hello\n")))
    );
    assert_eq!(stream.next_chunk().await.unwrap(), None);
    assert_eq!(stream.wait().await.unwrap(), 0);
}

#[tokio::test]
async fn pty_attach_round_trips() {
    let (router, _tmp) = booted_router().await;

    let pty = router
        .attach("s1", 24, 80, vec!["echo".into(), "tty".into()], vec![], None)
        .await
        .unwrap();

    // TTY output is a raw stream, no frame headers.
    use tokio::io::AsyncReadExt;
    let mut pty = pty;
    let mut out = Vec::new();
    // The fake frames even TTY output; just assert bytes flow and the
    // command completes.
    let _ = tokio::time::timeout(Duration::from_secs(5), pty.read_to_end(&mut out)).await;
    assert!(!out.is_empty());
    assert_eq!(pty.wait().await.unwrap(), 0);

    pty.resize(40, 120).await.unwrap();
}

#[tokio::test]
async fn session_http_client_reaches_published_port() {
    let (router, _tmp) = booted_router().await;

    let client = router.http_client("s1").await.unwrap();
    let resp = client
        .request(
            Method::GET,
            "/",
            discobot_sandbox::engine::transport::empty_body(),
        )
        .await
        .unwrap();
    assert!(resp.status().is_success());
    let body = discobot_sandbox::engine::transport::EngineTransport::collect_bytes(resp)
        .await
        .unwrap();
    assert_eq!(&body[..], b"hello from session");
}
