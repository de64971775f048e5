//! A small repo catalog with a handler whose failures can be scripted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::bail;
use async_trait::async_trait;
use razorbus::{
    Command, CommandId, CommandStatus, CommandStore, DataObject, DispatchContext, ErrorRecord,
    ExceptionRecord, MessageHandler, Operation,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, PartialEq)]
pub struct Repo {
    pub name: String,
    pub iso_url: Option<String>,
    pub accessible: bool,
}

impl Repo {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            iso_url: None,
            accessible: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoKey {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Operation)]
pub enum RepoOperation {
    MakeTheRepoAccessible(String),
    #[operation(rename = "unpack")]
    UnpackImage(String, u32),
    Refresh,
}

impl DataObject for Repo {
    type Key = RepoKey;
    type Operation = RepoOperation;

    const NAME: &'static str = "Repo";

    fn key(&self) -> RepoKey {
        RepoKey {
            name: self.name.clone(),
        }
    }
}

/// Domain table the handler reads and writes.
#[derive(Clone, Default)]
pub struct RepoCatalog {
    repos: Arc<Mutex<HashMap<String, Repo>>>,
}

impl RepoCatalog {
    pub fn with(repos: &[&str]) -> Self {
        let catalog = Self::default();
        for name in repos {
            catalog.insert(Repo::new(name));
        }
        catalog
    }

    pub fn insert(&self, repo: Repo) {
        self.repos.lock().unwrap().insert(repo.name.clone(), repo);
    }

    pub fn remove(&self, name: &str) -> Option<Repo> {
        self.repos.lock().unwrap().remove(name)
    }

    pub fn get(&self, name: &str) -> Option<Repo> {
        self.repos.lock().unwrap().get(name).cloned()
    }
}

/// One call to [`RepoHandler::invoke`], as observed by the handler.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub repo: String,
    pub operation: RepoOperation,
    pub command: Option<CommandId>,
    pub command_status: Option<CommandStatus>,
    pub retries: u32,
}

/// Handler for [`Repo`] with scripted lookup and operation failures.
///
/// A successful `make_the_repo_accessible` finishes its command, and a
/// failed operation records its error on the command, the way a real
/// provisioning handler reports progress.
#[derive(Clone)]
pub struct RepoHandler<S> {
    pub catalog: RepoCatalog,
    commands: S,
    lookup_failures: Arc<AtomicUsize>,
    operation_failures: Arc<AtomicUsize>,
    record_errors: bool,
    invocations: Arc<Mutex<Vec<Invocation>>>,
}

impl<S: CommandStore> RepoHandler<S> {
    pub fn new(catalog: RepoCatalog, commands: S) -> Self {
        Self {
            catalog,
            commands,
            lookup_failures: Arc::default(),
            operation_failures: Arc::default(),
            record_errors: false,
            invocations: Arc::default(),
        }
    }

    /// Fail the next `count` lookups.
    pub fn failing_lookups(self, count: usize) -> Self {
        self.lookup_failures.store(count, Ordering::SeqCst);
        self
    }

    /// Fail the next `count` operations.
    pub fn failing_operations(self, count: usize) -> Self {
        self.operation_failures.store(count, Ordering::SeqCst);
        self
    }

    /// Record failed attempts on the command's error map.
    pub fn recording_errors(mut self) -> Self {
        self.record_errors = true;
        self
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap().clone()
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl<S: CommandStore> MessageHandler for RepoHandler<S> {
    type Object = Repo;
    type Error = anyhow::Error;

    async fn find(&self, key: &RepoKey) -> anyhow::Result<Option<Repo>> {
        if take_one(&self.lookup_failures) {
            bail!("repo catalog unavailable");
        }
        Ok(self.catalog.get(&key.name))
    }

    async fn invoke(
        &self,
        mut repo: Repo,
        command: Option<Command>,
        operation: RepoOperation,
        ctx: &DispatchContext,
    ) -> anyhow::Result<()> {
        self.invocations.lock().unwrap().push(Invocation {
            repo: repo.name.clone(),
            operation: operation.clone(),
            command: command.as_ref().map(|c| c.id),
            command_status: command.as_ref().map(|c| c.status),
            retries: ctx.retries,
        });

        if take_one(&self.operation_failures) {
            if let Some(command) = &command {
                if self.record_errors {
                    let record = ErrorRecord::from_exception(
                        ExceptionRecord::new("MirrorError", "mirror unreachable"),
                        OffsetDateTime::now_utc(),
                    );
                    self.commands
                        .add_command_exception(command.id, record, Some(ctx.attempt()))
                        .await?;
                }
            }
            bail!("mirror unreachable");
        }

        match operation {
            RepoOperation::MakeTheRepoAccessible(url) => {
                repo.iso_url = Some(url);
                repo.accessible = true;
                self.catalog.insert(repo);
                if let Some(command) = command {
                    self.commands.finish_command(command.id, true).await?;
                }
            }
            RepoOperation::UnpackImage(url, _) => {
                repo.iso_url = Some(url);
                self.catalog.insert(repo);
            }
            RepoOperation::Refresh => {}
        }
        Ok(())
    }
}
