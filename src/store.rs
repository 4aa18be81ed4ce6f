//! A node's durable replica of meeting records and the merge rules that
//! keep replicas convergent.
//!
//! Envelopes may arrive out of order, duplicated, or not at all. The
//! merge is last-write-wins on the per-meeting logical clock, with
//! asymmetric tombstone semantics: a tombstone purges the record only at
//! the invitees it lists, and never at the organizer. The organizer's
//! own copy therefore survives even a full deletion it issued itself;
//! see DESIGN.md for the open product question around that rule.

use std::{
    collections::BTreeMap,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::proto::{Meeting, MeetingId, NodeId};

/// What merging one envelope did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum MergeOutcome {
    /// The meeting was not held before and is now live.
    #[display("inserted")]
    Inserted,
    /// An existing live record was overwritten.
    #[display("updated")]
    Updated,
    /// A tombstone purged this node's copy.
    #[display("removed")]
    Removed,
    /// The envelope carried an older logical clock and was discarded.
    #[display("stale")]
    Stale,
    /// The envelope did not apply here (tombstone not addressed to this
    /// node, or addressed to the organizer).
    #[display("ignored")]
    Ignored,
}

/// Durable per-node set of meeting records, at most one per id.
///
/// Purged meetings keep their tombstone in the map and on disk, marked
/// deleted and invisible to reads. The retained logical clock keeps
/// rejecting stale pre-deletion envelopes, so a purged meeting cannot be
/// resurrected by an older write; a strictly newer live envelope (a
/// re-invite) still lands normally.
#[derive(Debug)]
pub struct ReplicaStore {
    owner: NodeId,
    path: PathBuf,
    records: BTreeMap<MeetingId, Meeting>,
}

impl ReplicaStore {
    /// Opens the store for `owner`, loading any existing records from
    /// `path`. A missing file is an empty store.
    ///
    /// The file is a sequence of envelope blocks separated by a blank
    /// line. Blocks that fail to decode are logged and skipped; legacy
    /// blocks without `ID`/`DELETED` lines load with defaults.
    pub fn open(owner: NodeId, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut records = BTreeMap::new();
        match std::fs::read_to_string(&path) {
            Ok(content) => {
                for block in content.split("\n\n").map(str::trim).filter(|b| !b.is_empty()) {
                    match Meeting::decode(block) {
                        Ok(meeting) => {
                            records.insert(meeting.id, meeting);
                        }
                        Err(err) => {
                            warn!(owner = %owner, "skipping undecodable store block: {err}")
                        }
                    }
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read store file {}", path.display()))
            }
        }
        debug!(owner = %owner, records = records.len(), "opened replica store");
        Ok(Self {
            owner,
            path,
            records,
        })
    }

    /// The node this store belongs to.
    pub fn owner(&self) -> &NodeId {
        &self.owner
    }

    /// Path of the durable file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the live record for `id`, if this node holds one.
    pub fn get(&self, id: &MeetingId) -> Option<&Meeting> {
        self.records.get(id).filter(|meeting| !meeting.deleted)
    }

    /// All live records, ordered by id.
    pub fn meetings(&self) -> impl Iterator<Item = &Meeting> {
        self.records.values().filter(|meeting| !meeting.deleted)
    }

    /// Merges one incoming envelope and persists the store if its state
    /// changed. Applying the identical envelope twice is a no-op the
    /// second time.
    pub fn merge(&mut self, incoming: Meeting) -> Result<MergeOutcome> {
        let id = incoming.id;
        let (outcome, changed) = self.apply(incoming);
        debug!(id = %id.fmt_short(), owner = %self.owner, %outcome, "merged envelope");
        if changed {
            self.persist()?;
        }
        Ok(outcome)
    }

    /// The merge state machine. Returns the outcome and whether the
    /// durable state must be rewritten.
    fn apply(&mut self, incoming: Meeting) -> (MergeOutcome, bool) {
        // A tombstone purges this node only if the node is listed in the
        // tombstone's own invitee set and is not the organizer.
        let purges_owner = incoming.deleted
            && incoming.invitees.contains(&self.owner)
            && self.owner != incoming.organizer;

        let prior = self
            .records
            .get(&incoming.id)
            .map(|held| (held.last_modified, held.deleted));

        match prior {
            // Stale write: strictly older than what we hold, discard.
            Some((last_modified, _)) if incoming.last_modified < last_modified => {
                (MergeOutcome::Stale, false)
            }
            Some((_, was_deleted)) => {
                if !incoming.deleted {
                    // Later-or-equal live record wins outright, ties
                    // favor the incoming envelope.
                    let outcome = if was_deleted {
                        MergeOutcome::Inserted
                    } else {
                        MergeOutcome::Updated
                    };
                    self.records.insert(incoming.id, incoming);
                    (outcome, true)
                } else if purges_owner {
                    let outcome = if was_deleted {
                        MergeOutcome::Ignored
                    } else {
                        MergeOutcome::Removed
                    };
                    self.records.insert(incoming.id, incoming);
                    (outcome, true)
                } else {
                    // The organizer keeps its copy, and a tombstone that
                    // does not list this node leaves the record for the
                    // corrective envelope to overwrite.
                    (MergeOutcome::Ignored, false)
                }
            }
            None if !incoming.deleted => {
                self.records.insert(incoming.id, incoming);
                (MergeOutcome::Inserted, true)
            }
            None if purges_owner => {
                // Nothing to purge yet, but remember the tombstone so an
                // out-of-order create cannot materialize the meeting
                // after its deletion.
                self.records.insert(incoming.id, incoming);
                (MergeOutcome::Ignored, true)
            }
            None => (MergeOutcome::Ignored, false),
        }
    }

    /// Rewrites the whole durable file through a temp file and an atomic
    /// rename, so a crash mid-write leaves the previous file intact.
    fn persist(&self) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut blocks = Vec::with_capacity(self.records.len());
        for meeting in self.records.values() {
            blocks.push(meeting.encode()?);
        }
        let mut content = blocks.join("\n\n");
        content.push('\n');

        let mut tmp = NamedTempFile::new_in(dir)
            .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
        tmp.write_all(content.as_bytes())
            .context("failed to write store contents")?;
        tmp.persist(&self.path)
            .map_err(|err| err.error)
            .with_context(|| format!("failed to replace store file {}", self.path.display()))?;
        Ok(())
    }
}
