use std::time::Duration;

use razorbus::{
    CommandId, CommandStatus, CommandStore, DeadLetterQuery, ErrorRecord, ExceptionRecord,
    Message, MessageQueue, NewCommand, PgStore, Store, UnitOfWork,
};
use serde_json::json;
use test_utils::db_test;
use time::OffsetDateTime;

use crate::support::helpers::create_command;

const LOCK: Duration = Duration::from_secs(30);

fn message(name: &str, command: Option<CommandId>) -> Message {
    Message {
        class: "Razor::Data::Repo".into(),
        instance: json!({ "name": name }),
        message: "refresh".into(),
        arguments: vec![],
        command: command.map(CommandId::to_reference),
        retries: None,
        exceptions: vec![],
    }
}

fn record(message: &str) -> ErrorRecord {
    ErrorRecord::from_exception(
        ExceptionRecord::new("MirrorError", message),
        OffsetDateTime::now_utc(),
    )
}

db_test!(commit_makes_commands_and_messages_visible, |pool| {
    let store = PgStore::new(pool.clone());

    let mut uow = store.begin().await?;
    let command = uow
        .create_command(NewCommand::new("create-repo", json!({ "name": "centos" })))
        .await?;
    uow.enqueue(message("centos", Some(command.id))).await?;

    assert!(store.pending_messages().await?.is_empty());
    uow.commit().await?;

    let stored = store.find_command(command.id).await?.unwrap();
    assert_eq!(stored.status, CommandStatus::Pending);
    assert_eq!(stored.params, json!({ "name": "centos" }));
    assert_eq!(store.pending_messages().await?.len(), 1);
    Ok(())
});

db_test!(dropped_unit_of_work_rolls_back, |pool| {
    let store = PgStore::new(pool.clone());

    let id = {
        let mut uow = store.begin().await?;
        let command = uow
            .create_command(NewCommand::new("create-repo", json!({})))
            .await?;
        uow.enqueue(message("centos", Some(command.id))).await?;
        command.id
    };

    assert!(store.find_command(id).await?.is_none());
    assert!(store.pending_messages().await?.is_empty());
    Ok(())
});

db_test!(transitions_apply_to_the_stored_row, |pool| {
    let store = PgStore::new(pool.clone());
    let command = create_command(&store, "create-repo").await?;

    assert!(store.begin_command(command.id).await?);
    assert!(!store.begin_command(command.id).await?);
    assert!(store.finish_command(command.id, false).await?);
    // Terminal states are final.
    assert!(!store.cancel_command(command.id).await?);
    assert!(!store.finish_command(command.id, true).await?);

    let stored = store.find_command(command.id).await?.unwrap();
    assert_eq!(stored.status, CommandStatus::Failed);
    assert!(stored.finished_at.is_some());

    let missing = store.finish_command(CommandId::new(9999), false).await;
    assert!(matches!(missing, Err(razorbus::Error::CommandNotFound(_))));
    Ok(())
});

db_test!(cancel_from_pending_and_running, |pool| {
    let store = PgStore::new(pool.clone());
    let pending = create_command(&store, "a").await?;
    let running = create_command(&store, "b").await?;
    store.begin_command(running.id).await?;

    assert!(store.cancel_command(pending.id).await?);
    assert!(store.cancel_command(running.id).await?);
    assert!(!store.begin_command(pending.id).await?);

    for id in [pending.id, running.id] {
        let stored = store.find_command(id).await?.unwrap();
        assert!(stored.is_cancelled());
    }
    Ok(())
});

db_test!(exceptions_are_write_once_per_attempt, |pool| {
    let store = PgStore::new(pool.clone());
    let command = create_command(&store, "create-repo").await?;

    assert!(store
        .add_command_exception(command.id, record("first"), Some(1))
        .await?);
    assert!(!store
        .add_command_exception(command.id, record("second"), Some(1))
        .await?);
    // Without an attempt number the record goes after the highest slot.
    assert!(store
        .add_command_exception(command.id, record("appended"), None)
        .await?);

    let stored = store.find_command(command.id).await?.unwrap();
    assert_eq!(stored.error.len(), 2);
    assert_eq!(stored.error[&1].message, "first");
    assert_eq!(stored.error[&2].message, "appended");
    Ok(())
});

db_test!(claim_leases_until_ack, |pool| {
    let store = PgStore::new(pool.clone());
    let id = store.publish(&message("centos", None), Duration::ZERO).await?;

    let delivery = store.claim("w1", LOCK).await?.unwrap();
    assert_eq!(delivery.id, id);
    assert!(store.claim("w2", LOCK).await?.is_none());

    store.ack(id).await?;
    assert!(store.pending_messages().await?.is_empty());
    Ok(())
});

db_test!(expired_lease_is_claimable_again, |pool| {
    let store = PgStore::new(pool.clone());
    let id = store.publish(&message("centos", None), Duration::ZERO).await?;

    store.claim("w1", Duration::from_millis(10)).await?.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let again = store.claim("w2", LOCK).await?.unwrap();
    assert_eq!(again.id, id);
    Ok(())
});

db_test!(delayed_messages_are_not_claimable_early, |pool| {
    let store = PgStore::new(pool.clone());
    store
        .publish(&message("later", None), Duration::from_secs(3600))
        .await?;
    let now = store.publish(&message("now", None), Duration::ZERO).await?;

    let delivery = store.claim("w1", LOCK).await?.unwrap();
    assert_eq!(delivery.id, now);
    assert!(store.claim("w1", LOCK).await?.is_none());
    assert_eq!(store.pending_messages().await?.len(), 2);
    Ok(())
});

db_test!(concurrent_claims_never_share_a_delivery, |pool| {
    let store = PgStore::new(pool.clone());
    for i in 0..10 {
        store
            .publish(&message(&format!("repo-{i}"), None), Duration::ZERO)
            .await?;
    }

    let claims = (0..10).map(|i| {
        let store = store.clone();
        tokio::spawn(async move { store.claim(&format!("w{i}"), LOCK).await })
    });
    let mut ids = Vec::new();
    for claim in claims.collect::<Vec<_>>() {
        if let Some(delivery) = claim.await?? {
            ids.push(delivery.id);
        }
    }

    let total = ids.len();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), total);
    Ok(())
});

db_test!(dead_letters_can_be_queried_and_retried, |pool| {
    let store = PgStore::new(pool.clone());
    let command = create_command(&store, "create-repo").await?;
    let mut failed = message("centos", Some(command.id));
    failed.retries = Some(5);
    failed.exceptions = vec![ExceptionRecord::new("MirrorError", "mirror unreachable")];

    let id = store.dead_letter(&failed, "exceeded 4 retries").await?;
    store.dead_letter(&message("other", None), "gave up").await?;

    let by_command = store
        .fetch_dead_letters(&DeadLetterQuery::new().command(command.id))
        .await?;
    assert_eq!(by_command.len(), 1);
    assert_eq!(by_command[0].id, id);
    assert_eq!(by_command[0].message, failed);

    let limited = store
        .fetch_dead_letters(&DeadLetterQuery::new().class("Razor::Data::Repo").limit(1))
        .await?;
    assert_eq!(limited.len(), 1);

    assert!(store.retry_dead_letter(id).await?);
    assert!(!store.retry_dead_letter(id).await?);

    let delivery = store.claim("w1", LOCK).await?.unwrap();
    let requeued: Message = serde_json::from_value(delivery.body.unwrap())?;
    assert_eq!(requeued.retries, None);
    assert_eq!(requeued.exceptions, failed.exceptions);
    Ok(())
});

db_test!(domain_writes_share_the_unit_of_work, |pool| {
    let store = PgStore::new(pool.clone());
    // Already applied by the harness; running again is a no-op.
    store.migrate().await?;
    sqlx::query("CREATE TABLE repos (name TEXT PRIMARY KEY)")
        .execute(store.pool())
        .await?;

    {
        let mut uow = store.begin().await?;
        sqlx::query("INSERT INTO repos (name) VALUES ('centos')")
            .execute(&mut **uow.transaction())
            .await?;
        uow.enqueue(message("centos", None)).await?;
    }
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM repos")
        .fetch_one(store.pool())
        .await?;
    assert_eq!(count, 0);
    assert!(store.pending_messages().await?.is_empty());

    let mut uow = store.begin().await?;
    sqlx::query("INSERT INTO repos (name) VALUES ('centos')")
        .execute(&mut **uow.transaction())
        .await?;
    uow.enqueue(message("centos", None)).await?;
    uow.commit().await?;

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM repos")
        .fetch_one(store.pool())
        .await?;
    assert_eq!(count, 1);
    assert_eq!(store.pending_messages().await?.len(), 1);
    Ok(())
});

db_test!(requeue_swaps_the_claimed_row_once, |pool| {
    let store = PgStore::new(pool.clone());
    store.publish(&message("centos", None), Duration::ZERO).await?;
    let delivery = store.claim("w1", LOCK).await?.unwrap();

    let mut retried = message("centos", None);
    retried.retries = Some(1);
    let id = store
        .requeue(delivery.id, &retried, Duration::ZERO)
        .await?
        .unwrap();
    assert!(
        store
            .requeue(delivery.id, &retried, Duration::ZERO)
            .await?
            .is_none()
    );

    let pending = store.pending_messages().await?;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, id);
    let body: Message = serde_json::from_value(pending[0].body.clone().unwrap())?;
    assert_eq!(body.retries, Some(1));
    Ok(())
});

db_test!(dead_letter_delivery_moves_the_row_once, |pool| {
    let store = PgStore::new(pool.clone());
    let command = create_command(&store, "create-repo").await?;
    let failed = message("centos", Some(command.id));
    store.publish(&failed, Duration::ZERO).await?;
    let delivery = store.claim("w1", LOCK).await?.unwrap();

    assert!(
        store
            .dead_letter_delivery(delivery.id, &failed, "exceeded 0 retries")
            .await?
            .is_some()
    );
    assert!(
        store
            .dead_letter_delivery(delivery.id, &failed, "exceeded 0 retries")
            .await?
            .is_none()
    );

    assert!(store.pending_messages().await?.is_empty());
    let dead = store
        .fetch_dead_letters(&DeadLetterQuery::new().command(command.id))
        .await?;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].reason, "exceeded 0 retries");
    Ok(())
});
