//! Meeting records and the flat text envelope they travel in.
//!
//! The envelope is one `KEY=value` line per field, newline separated,
//! with no trailing sentinel: the message boundary is end of
//! transmission. Decoding is order-independent and tolerates historical
//! envelopes that predate the `ID` and `DELETED` lines.

use std::{collections::BTreeSet, fmt, fmt::Write, str::FromStr};

use anyhow::Result;
use rand::Rng;
use time::{format_description::BorrowedFormatItem, macros::format_description, PrimitiveDateTime};

/// Timestamp layout for the `START` and `END` lines (seconds precision).
static TS_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");

/// Identifier of a participant node, e.g. `Alice_White`.
///
/// Node identity is a plain name; turning a name into a delivery address
/// is the directory's job, see [`crate::directory`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::Display)]
#[display("{_0}")]
pub struct NodeId(String);

impl NodeId {
    /// Creates a node id from a participant name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The raw participant name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Globally unique meeting identifier, assigned once at creation.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MeetingId([u8; 16]);

impl MeetingId {
    /// Generates a fresh random id.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill(&mut bytes);
        Self(bytes)
    }

    /// The raw id bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Short hex prefix for log output.
    pub fn fmt_short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for MeetingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for MeetingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MeetingId({})", hex::encode(self.0))
    }
}

impl FromStr for MeetingId {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| DecodeError::InvalidId)?;
        let bytes: [u8; 16] = bytes.try_into().map_err(|_| DecodeError::InvalidId)?;
        Ok(Self(bytes))
    }
}

/// Failure to decode an envelope.
///
/// A failed decode means the whole envelope is unusable: callers drop it
/// and never apply it partially.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The envelope contained no lines at all.
    #[error("envelope is empty")]
    Empty,
    /// A mandatory line was missing.
    #[error("missing {0} line")]
    MissingField(&'static str),
    /// A `START` or `END` line did not parse as a timestamp.
    #[error("invalid timestamp in {field} line")]
    InvalidTimestamp {
        /// The offending line's key.
        field: &'static str,
        /// Parse failure reported by the timestamp parser.
        #[source]
        source: time::error::Parse,
    },
    /// The `LAST_MODIFIED` line did not parse as a sequence value.
    #[error("invalid LAST_MODIFIED line")]
    InvalidVersion,
    /// The `DELETED` line was neither `true` nor `false`.
    #[error("invalid DELETED line")]
    InvalidFlag,
    /// The `ID` line was not a valid hex id.
    #[error("invalid ID line")]
    InvalidId,
}

/// A meeting record, the unit of replication.
///
/// Two records with the same [`MeetingId`] held at different nodes are
/// the same logical meeting; the merge rules in [`crate::store`] make
/// their visible state converge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Meeting {
    /// Immutable, globally unique identity.
    pub id: MeetingId,
    /// Subject line.
    pub topic: String,
    /// The node that created the meeting. Immutable after creation.
    pub organizer: NodeId,
    /// Invited nodes, organizer excluded by convention.
    pub invitees: BTreeSet<NodeId>,
    /// Where the meeting takes place.
    pub location: String,
    /// Scheduled start.
    pub start_time: PrimitiveDateTime,
    /// Scheduled end.
    pub end_time: PrimitiveDateTime,
    /// Per-meeting logical clock, bumped on every mutation. The sole
    /// conflict-resolution key.
    pub last_modified: u64,
    /// Tombstone marker. A `true` envelope removes the record at the
    /// invitees it lists, and only there.
    pub deleted: bool,
}

impl Meeting {
    /// Creates a fresh meeting with a new id and logical clock zero.
    pub fn new(
        topic: impl Into<String>,
        organizer: NodeId,
        invitees: BTreeSet<NodeId>,
        location: impl Into<String>,
        start_time: PrimitiveDateTime,
        end_time: PrimitiveDateTime,
    ) -> Self {
        Self {
            id: MeetingId::generate(),
            topic: topic.into(),
            organizer,
            invitees,
            location: location.into(),
            start_time,
            end_time,
            last_modified: 0,
            deleted: false,
        }
    }

    /// The logical clock value a mutation superseding this record must
    /// carry.
    pub fn next_version(&self) -> u64 {
        self.last_modified + 1
    }

    /// Serializes the record into its wire envelope.
    pub fn encode(&self) -> Result<String> {
        let mut out = String::new();
        writeln!(out, "ID={}", self.id)?;
        writeln!(out, "TOPIC={}", self.topic)?;
        writeln!(out, "ORGANIZER={}", self.organizer)?;
        writeln!(out, "LOCATION={}", self.location)?;
        writeln!(out, "START={}", self.start_time.format(TS_FORMAT)?)?;
        writeln!(out, "END={}", self.end_time.format(TS_FORMAT)?)?;
        writeln!(out, "LAST_MODIFIED={}", self.last_modified)?;
        writeln!(out, "DELETED={}", self.deleted)?;
        let invitees: Vec<&str> = self.invitees.iter().map(NodeId::as_str).collect();
        write!(out, "INVITED={}", invitees.join(","))?;
        Ok(out)
    }

    /// Parses a wire envelope back into a record.
    ///
    /// Lines are matched by key prefix in any order; unknown lines are
    /// ignored. An envelope without an `ID` line is a legacy record and
    /// is assigned a fresh id, so legacy records can never be matched
    /// against a tombstone by identity. A missing `DELETED` line means
    /// `false`.
    pub fn decode(input: &str) -> Result<Self, DecodeError> {
        let mut id = None;
        let mut topic = None;
        let mut organizer = None;
        let mut location = None;
        let mut start_time = None;
        let mut end_time = None;
        let mut last_modified = None;
        let mut deleted = None;
        let mut invitees = None;

        for line in input.lines() {
            let line = line.trim_end_matches('\r');
            if let Some(value) = line.strip_prefix("ID=") {
                id = Some(value.parse::<MeetingId>()?);
            } else if let Some(value) = line.strip_prefix("TOPIC=") {
                topic = Some(value.to_string());
            } else if let Some(value) = line.strip_prefix("ORGANIZER=") {
                organizer = Some(NodeId::new(value));
            } else if let Some(value) = line.strip_prefix("LOCATION=") {
                location = Some(value.to_string());
            } else if let Some(value) = line.strip_prefix("START=") {
                start_time = Some(parse_timestamp("START", value)?);
            } else if let Some(value) = line.strip_prefix("END=") {
                end_time = Some(parse_timestamp("END", value)?);
            } else if let Some(value) = line.strip_prefix("LAST_MODIFIED=") {
                last_modified = Some(value.trim().parse().map_err(|_| DecodeError::InvalidVersion)?);
            } else if let Some(value) = line.strip_prefix("DELETED=") {
                deleted = Some(value.trim().parse().map_err(|_| DecodeError::InvalidFlag)?);
            } else if let Some(value) = line.strip_prefix("INVITED=") {
                invitees = Some(
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|name| !name.is_empty())
                        .map(NodeId::new)
                        .collect::<BTreeSet<_>>(),
                );
            }
        }

        if input.trim().is_empty() {
            return Err(DecodeError::Empty);
        }

        Ok(Self {
            // Legacy envelope: mint a fresh identity on first load.
            id: id.unwrap_or_else(MeetingId::generate),
            topic: topic.ok_or(DecodeError::MissingField("TOPIC"))?,
            organizer: organizer.ok_or(DecodeError::MissingField("ORGANIZER"))?,
            invitees: invitees.ok_or(DecodeError::MissingField("INVITED"))?,
            location: location.ok_or(DecodeError::MissingField("LOCATION"))?,
            start_time: start_time.ok_or(DecodeError::MissingField("START"))?,
            end_time: end_time.ok_or(DecodeError::MissingField("END"))?,
            last_modified: last_modified.ok_or(DecodeError::MissingField("LAST_MODIFIED"))?,
            deleted: deleted.unwrap_or(false),
        })
    }
}

fn parse_timestamp(field: &'static str, value: &str) -> Result<PrimitiveDateTime, DecodeError> {
    PrimitiveDateTime::parse(value.trim(), TS_FORMAT)
        .map_err(|source| DecodeError::InvalidTimestamp { field, source })
}
