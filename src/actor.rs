//! A single-writer actor owning a node's [`ReplicaStore`].
//!
//! Every inbound envelope for a node goes through this actor, so the
//! whole read-merge-persist cycle is applied atomically and in actual
//! arrival order, regardless of how many connection tasks feed it.

use anyhow::{Context, Result};
use tokio::sync::oneshot;
use tracing::{debug, error, error_span, trace};

use crate::{
    proto::{Meeting, MeetingId, NodeId},
    store::{MergeOutcome, ReplicaStore},
};

const ACTION_CAP: usize = 64;

#[derive(derive_more::Debug, derive_more::Display)]
enum Action {
    #[display("Merge")]
    Merge {
        meeting: Meeting,
        #[debug("reply")]
        reply: oneshot::Sender<Result<MergeOutcome>>,
    },
    #[display("Get")]
    Get {
        id: MeetingId,
        #[debug("reply")]
        reply: oneshot::Sender<Option<Meeting>>,
    },
    #[display("Meetings")]
    Meetings {
        #[debug("reply")]
        reply: oneshot::Sender<Vec<Meeting>>,
    },
    #[display("Shutdown")]
    Shutdown {
        #[debug("reply")]
        reply: oneshot::Sender<ReplicaStore>,
    },
}

/// Clonable handle to a node's store actor.
#[derive(Debug, Clone)]
pub struct StoreHandle {
    owner: NodeId,
    tx: flume::Sender<Action>,
}

impl StoreHandle {
    /// Spawns the actor thread for `store` and returns its handle.
    ///
    /// The actor stops when [`StoreHandle::shutdown`] is called or every
    /// handle has been dropped.
    pub fn spawn(store: ReplicaStore) -> StoreHandle {
        let (tx, rx) = flume::bounded(ACTION_CAP);
        let owner = store.owner().clone();
        let span = error_span!("store", owner = %owner);
        std::thread::Builder::new()
            .name(format!("store-{owner}"))
            .spawn(move || {
                let _enter = span.enter();
                let actor = StoreActor { store, rx };
                actor.run();
            })
            .expect("failed to spawn store actor thread");
        StoreHandle { owner, tx }
    }

    /// The node this store belongs to.
    pub fn owner(&self) -> &NodeId {
        &self.owner
    }

    /// Merges one envelope, returning what it did to the store.
    pub async fn merge(&self, meeting: Meeting) -> Result<MergeOutcome> {
        let (reply, rx) = oneshot::channel();
        self.send(Action::Merge { meeting, reply }).await?;
        rx.await.context("store actor dropped the reply")?
    }

    /// Returns the live record for `id`, if held.
    pub async fn get(&self, id: MeetingId) -> Result<Option<Meeting>> {
        let (reply, rx) = oneshot::channel();
        self.send(Action::Get { id, reply }).await?;
        rx.await.context("store actor dropped the reply")
    }

    /// All live records held by this node.
    pub async fn meetings(&self) -> Result<Vec<Meeting>> {
        let (reply, rx) = oneshot::channel();
        self.send(Action::Meetings { reply }).await?;
        rx.await.context("store actor dropped the reply")
    }

    /// Stops the actor and hands the store back.
    pub async fn shutdown(self) -> Result<ReplicaStore> {
        let (reply, rx) = oneshot::channel();
        self.send(Action::Shutdown { reply }).await?;
        rx.await.context("store actor dropped the reply")
    }

    async fn send(&self, action: Action) -> Result<()> {
        self.tx
            .send_async(action)
            .await
            .context("store actor is gone")
    }
}

struct StoreActor {
    store: ReplicaStore,
    rx: flume::Receiver<Action>,
}

impl StoreActor {
    fn run(mut self) {
        while let Ok(action) = self.rx.recv() {
            trace!(%action, "processing action");
            match action {
                Action::Merge { meeting, reply } => {
                    let res = self.store.merge(meeting);
                    if let Err(err) = &res {
                        error!("merge failed: {err:#}");
                    }
                    reply.send(res).ok();
                }
                Action::Get { id, reply } => {
                    reply.send(self.store.get(&id).cloned()).ok();
                }
                Action::Meetings { reply } => {
                    reply.send(self.store.meetings().cloned().collect()).ok();
                }
                Action::Shutdown { reply } => {
                    debug!("store actor shutting down");
                    reply.send(self.store).ok();
                    return;
                }
            }
        }
        debug!("all store handles dropped, stopping");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use time::macros::datetime;

    use super::*;

    fn sample(organizer: &str, invitee: &str) -> Meeting {
        Meeting::new(
            "Sync",
            NodeId::new(organizer),
            BTreeSet::from([NodeId::new(invitee)]),
            "Room 2",
            datetime!(2026-09-02 09:00:00),
            datetime!(2026-09-02 09:30:00),
        )
    }

    #[tokio::test]
    async fn merge_get_list_through_handle() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = ReplicaStore::open(NodeId::new("Bob_Smith"), dir.path().join("bob.txt"))?;
        let handle = StoreHandle::spawn(store);

        let meeting = sample("Alice_White", "Bob_Smith");
        assert_eq!(handle.merge(meeting.clone()).await?, MergeOutcome::Inserted);
        assert_eq!(handle.get(meeting.id).await?, Some(meeting.clone()));
        assert_eq!(handle.meetings().await?, vec![meeting.clone()]);

        let store = handle.shutdown().await?;
        assert_eq!(store.get(&meeting.id), Some(&meeting));
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_merges_are_serialized() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = ReplicaStore::open(NodeId::new("Bob_Smith"), dir.path().join("bob.txt"))?;
        let handle = StoreHandle::spawn(store);

        let base = sample("Alice_White", "Bob_Smith");
        let mut tasks = tokio::task::JoinSet::new();
        for version in 0..16u64 {
            let handle = handle.clone();
            let mut envelope = base.clone();
            envelope.last_modified = version;
            tasks.spawn(async move { handle.merge(envelope).await });
        }
        while let Some(res) = tasks.join_next().await {
            res??;
        }

        let held = handle.get(base.id).await?.expect("meeting must be held");
        assert_eq!(held.last_modified, 15);
        Ok(())
    }
}
