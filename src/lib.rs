//! Replicated meeting records over a central router.
//!
//! Independent participants ("nodes") each keep a private durable copy
//! of the meeting records that concern them. Every mutation is encoded
//! as a flat `KEY=value` envelope and submitted to a central router,
//! which computes the audience (organizer plus invitees, read from the
//! envelope itself) and fans the envelope out to each addressee,
//! fire-and-forget. No node ever queries another directly.
//!
//! Each node merges incoming envelopes into its replica with
//! last-write-wins conflict resolution on a per-meeting logical clock,
//! converging despite unordered, duplicated or partially delivered
//! envelopes. Tombstones are asymmetric: a `deleted=true` envelope
//! purges the record only at the invitees it lists, and never at the
//! organizer, whose copy of a meeting survives even its full deletion.
//!
//! The protocol is eventually consistent, best-effort, at-most-once:
//! there are no retries, no ordering guarantees and no backpressure.

#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod actor;
pub mod config;
pub mod directory;
pub mod net;
pub mod proto;
pub mod router;
pub mod store;

pub use actor::StoreHandle;
pub use directory::{Directory, NodeAddr};
pub use proto::{DecodeError, Meeting, MeetingId, NodeId};
pub use router::{Delivery, Router, Transport};
pub use store::{MergeOutcome, ReplicaStore};
