use razorbus::{Argument, Error, Message, Store, UnitOfWork};
use serde_json::json;

use crate::TestBus;
use crate::support::helpers::create_command;
use crate::support::repo::RepoOperation;

#[tokio::test]
async fn publish_records_class_key_and_arguments() -> anyhow::Result<()> {
    let t = TestBus::new(&["centos"]);

    t.publish(
        "centos",
        None,
        RepoOperation::UnpackImage("http://mirror/centos.iso".into(), 3),
    )
    .await?;

    let body = t.take_only_message().await?;
    assert_eq!(
        body,
        json!({
            "class": "Razor::Data::Repo",
            "instance": { "name": "centos" },
            "message": "unpack",
            "arguments": ["http://mirror/centos.iso", 3],
        })
    );
    Ok(())
}

#[tokio::test]
async fn command_is_stored_apart_from_arguments() -> anyhow::Result<()> {
    let t = TestBus::new(&["centos"]);
    let command = create_command(&t.store, "create-repo").await?;

    t.publish(
        "centos",
        Some(&command),
        RepoOperation::MakeTheRepoAccessible("http://mirror/centos.iso".into()),
    )
    .await?;

    let message: Message = serde_json::from_value(t.take_only_message().await?)?;
    assert_eq!(message.command, Some(json!({ "id": command.id.get() })));
    assert_eq!(message.arguments, vec![json!("http://mirror/centos.iso")]);
    assert_eq!(message.retries, None);
    assert!(message.exceptions.is_empty());
    Ok(())
}

#[tokio::test]
async fn publish_raw_lifts_leading_command() -> anyhow::Result<()> {
    let t = TestBus::new(&["centos"]);
    let command = create_command(&t.store, "create-repo").await?;

    let mut uow = t.store.begin().await?;
    t.bus
        .publish_raw(
            &mut uow,
            "Razor::Data::Repo",
            json!({ "name": "centos" }),
            "make_the_repo_accessible",
            vec![Argument::from(&command), Argument::value(&"http://mirror/c.iso")?],
        )
        .await?;
    uow.commit().await?;

    let message: Message = serde_json::from_value(t.take_only_message().await?)?;
    assert_eq!(message.command, Some(command.reference()));
    assert_eq!(message.arguments, vec![json!("http://mirror/c.iso")]);
    Ok(())
}

#[tokio::test]
async fn publish_raw_rejects_arity_mismatch() -> anyhow::Result<()> {
    let t = TestBus::new(&["centos"]);
    let command = create_command(&t.store, "create-repo").await?;
    let mut uow = t.store.begin().await?;

    // The command does not count towards the arity.
    let result = t
        .bus
        .publish_raw(
            &mut uow,
            "Razor::Data::Repo",
            json!({ "name": "centos" }),
            "make_the_repo_accessible",
            vec![Argument::from(&command)],
        )
        .await;
    assert!(matches!(
        result,
        Err(Error::ArityMismatch {
            expected: 1,
            actual: 0,
            ..
        })
    ));

    let result = t
        .bus
        .publish_raw(
            &mut uow,
            "Razor::Data::Repo",
            json!({ "name": "centos" }),
            "refresh",
            vec![json!(true).into()],
        )
        .await;
    assert!(matches!(
        result,
        Err(Error::ArityMismatch {
            expected: 0,
            actual: 1,
            ..
        })
    ));

    let result = t
        .bus
        .publish_raw(
            &mut uow,
            "Razor::Data::Repo",
            json!({ "name": "centos" }),
            "destroy",
            vec![],
        )
        .await;
    assert!(matches!(result, Err(Error::UnknownOperation { .. })));

    uow.commit().await?;
    assert!(t.queued_bodies().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn publish_raw_rejects_unknown_and_malformed_classes() -> anyhow::Result<()> {
    let t = TestBus::new(&["centos"]);
    let mut uow = t.store.begin().await?;

    let result = t
        .bus
        .publish_raw(
            &mut uow,
            "Razor::Data::Node",
            json!({ "id": 1 }),
            "refresh",
            vec![],
        )
        .await;
    assert!(matches!(result, Err(Error::UnknownClass(class)) if class == "Razor::Data::Node"));

    let result = t
        .bus
        .publish_raw(
            &mut uow,
            "Razor::Data::Repo::Mirror",
            json!({ "name": "centos" }),
            "refresh",
            vec![],
        )
        .await;
    assert!(matches!(result, Err(Error::InvalidClassName(_))));
    Ok(())
}

#[tokio::test]
async fn command_after_first_argument_is_rejected() -> anyhow::Result<()> {
    let t = TestBus::new(&["centos"]);
    let command = create_command(&t.store, "create-repo").await?;
    let mut uow = t.store.begin().await?;

    let result = t
        .bus
        .publish_raw(
            &mut uow,
            "Razor::Data::Repo",
            json!({ "name": "centos" }),
            "unpack",
            vec![json!("http://mirror/c.iso").into(), Argument::from(&command)],
        )
        .await;
    assert!(matches!(result, Err(Error::MisplacedCommand(1))));
    Ok(())
}

#[tokio::test]
async fn rolled_back_publish_is_never_delivered() -> anyhow::Result<()> {
    let t = TestBus::new(&["centos"]);

    {
        let mut uow = t.store.begin().await?;
        t.bus
            .publish(
                &mut uow,
                &crate::Repo::new("centos"),
                None,
                RepoOperation::Refresh,
            )
            .await?;
        // dropped without commit
    }

    assert!(t.queued_bodies().await?.is_empty());
    Ok(())
}
