//! Workers draining the queue end to end.

use std::time::Duration;

use razorbus::{CommandStatus, CommandStore, MemoryStore, MessageQueue, RuntimeConfig};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::TestBus;
use crate::support::helpers::{
    DEFAULT_TEST_TIMEOUT, create_command, init_test_tracing, test_runtime_config, wait_until,
};
use crate::support::repo::{RepoCatalog, RepoHandler, RepoOperation};

/// Spawn the bus workers; the returned sender stops them.
fn spawn_workers(t: &TestBus) -> (oneshot::Sender<()>, JoinHandle<razorbus::Result<()>>) {
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let bus = t.bus.clone();
    let handle = tokio::spawn(async move {
        bus.run(async move {
            let _ = shutdown_rx.await;
        })
        .await
    });
    (shutdown_tx, handle)
}

#[tokio::test(flavor = "multi_thread")]
async fn workers_retry_until_success() -> anyhow::Result<()> {
    init_test_tracing();
    let store = MemoryStore::new();
    let handler =
        RepoHandler::new(RepoCatalog::with(&["centos"]), store.clone()).failing_operations(3);
    let t = TestBus::with_handler(store, handler);
    let command = create_command(&t.store, "create-repo").await?;
    t.publish(
        "centos",
        Some(&command),
        RepoOperation::MakeTheRepoAccessible("http://mirror/centos.iso".into()),
    )
    .await?;

    let (shutdown, handle) = spawn_workers(&t);

    let store = t.store.clone();
    wait_until(DEFAULT_TEST_TIMEOUT, || async {
        let stored = store.find_command(command.id).await?;
        Ok(stored.filter(|c| c.status == CommandStatus::Finished))
    })
    .await?;

    assert_eq!(t.handler.invocations().len(), 4);
    assert!(t.handler.catalog.get("centos").unwrap().accessible);
    assert!(t.queued_bodies().await?.is_empty());

    let _ = shutdown.send(());
    handle.await??;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_workers_process_each_message_once() -> anyhow::Result<()> {
    init_test_tracing();
    let repos: Vec<String> = (0..20).map(|i| format!("repo-{i}")).collect();
    let names: Vec<&str> = repos.iter().map(String::as_str).collect();
    let store = MemoryStore::new();
    let handler = RepoHandler::new(RepoCatalog::with(&names), store.clone());
    let bus = razorbus::Bus::builder(store.clone())
        .register(handler.clone())
        .config(RuntimeConfig {
            workers: 4,
            ..test_runtime_config()
        })
        .build()?;
    let t = TestBus {
        store,
        bus,
        handler,
    };
    for name in &names {
        t.publish(name, None, RepoOperation::Refresh).await?;
    }

    let (shutdown, handle) = spawn_workers(&t);

    wait_until(DEFAULT_TEST_TIMEOUT, || async {
        Ok(t.queued_bodies().await?.is_empty().then_some(()))
    })
    .await?;

    let mut seen: Vec<String> = t.handler.invocations().into_iter().map(|i| i.repo).collect();
    seen.sort();
    let mut expected = repos.clone();
    expected.sort();
    assert_eq!(seen, expected);

    let _ = shutdown.send(());
    handle.await??;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_completes_promptly() -> anyhow::Result<()> {
    let t = TestBus::new(&["centos"]);
    let (shutdown, handle) = spawn_workers(&t);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let _ = shutdown.send(());

    tokio::time::timeout(Duration::from_secs(2), handle).await???;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn not_found_is_acknowledged_without_requeue() -> anyhow::Result<()> {
    let t = TestBus::new(&[]);
    let command = create_command(&t.store, "create-repo").await?;
    t.publish(
        "missing",
        Some(&command),
        RepoOperation::MakeTheRepoAccessible("http://mirror/x.iso".into()),
    )
    .await?;

    let (shutdown, handle) = spawn_workers(&t);

    let store = t.store.clone();
    let failed = wait_until(DEFAULT_TEST_TIMEOUT, || async {
        let stored = store.find_command(command.id).await?;
        Ok(stored.filter(|c| c.status == CommandStatus::Failed))
    })
    .await?;

    assert!(failed.error.is_empty());
    wait_until(DEFAULT_TEST_TIMEOUT, || async {
        Ok(t.queued_bodies().await?.is_empty().then_some(()))
    })
    .await?;

    let _ = shutdown.send(());
    handle.await??;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn workers_acknowledge_empty_and_garbage_bodies() -> anyhow::Result<()> {
    let t = TestBus::new(&["centos"]);
    t.store.publish_body(None).await;
    t.store.publish_body(Some(serde_json::json!({}))).await;
    t.store
        .publish_body(Some(serde_json::json!("not a message")))
        .await;

    let (shutdown, handle) = spawn_workers(&t);

    wait_until(DEFAULT_TEST_TIMEOUT, || async {
        let drained = t.store.pending_messages().await?.is_empty();
        Ok(drained.then_some(()))
    })
    .await?;
    assert!(t.handler.invocations().is_empty());

    let _ = shutdown.send(());
    handle.await??;
    Ok(())
}
