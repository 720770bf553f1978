//! The mutation model.
//!
//! A [`Mutation`] is one immutable, atomic state change observed on an
//! upstream system. Exactly one variant is populated, and a mutation
//! carries enough information to be applied deterministically no matter
//! when it is replayed. Mutations are produced by the sync engine (or a
//! tail stream) and consumed by the corpus; they are never modified
//! after creation.

use std::fmt;
use std::io;
use std::str::FromStr;

use crate::git::Oid;
use crate::wire;
use crate::wire::{Decode, Encode};

/// Identifies a project on an upstream system, e.g. `example/tooling`.
///
/// The same identifier namespaces issues, review changes and
/// repositories: upstreams are expected to agree on project naming.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProjectId(String);

impl ProjectId {
    /// The organization or host part, e.g. `example` in `example/tooling`.
    pub fn origin(&self) -> &str {
        self.0.split_once('/').map(|(o, _)| o).unwrap_or_default()
    }

    /// The repository or project part, e.g. `tooling` in `example/tooling`.
    pub fn name(&self) -> &str {
        self.0.split_once('/').map(|(_, n)| n).unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(thiserror::Error, Debug)]
#[error("invalid project id `{0}`: expected `origin/name`")]
pub struct ProjectIdError(String);

impl FromStr for ProjectId {
    type Err = ProjectIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((origin, name)) if !origin.is_empty() && !name.is_empty() => {
                Ok(Self(s.to_owned()))
            }
            _ => Err(ProjectIdError(s.to_owned())),
        }
    }
}

impl TryFrom<String> for ProjectId {
    type Error = ProjectIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_str(&s)
    }
}

impl From<ProjectId> for String {
    fn from(id: ProjectId) -> Self {
        id.0
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Seconds since the Unix epoch, as reported by an upstream system.
///
/// Mutations carry upstream timestamps, never local clock readings, so
/// that replay is independent of when it happens.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(pub i64);

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A user identity on an upstream system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    /// Stable upstream-assigned id.
    pub id: u64,
    /// Current login or display name. May change over time; the id is
    /// what identifies the actor.
    pub login: String,
}

/// The lifecycle state of a review change.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReviewStatus {
    Open,
    Merged,
    Abandoned,
}

/// A delta observed on an issue tracker.
///
/// Optional fields are "no change"; set-valued fields carry the labels
/// and assignees added or removed since the previous observation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IssueDelta {
    pub project: Option<ProjectId>,
    pub number: u32,
    pub created: Option<Timestamp>,
    pub updated: Option<Timestamp>,
    pub author: Option<Actor>,
    pub title: Option<String>,
    pub body: Option<String>,
    pub closed: Option<bool>,
    pub labels_added: Vec<String>,
    pub labels_removed: Vec<String>,
    pub assignees_added: Vec<Actor>,
    pub assignees_removed: Vec<u64>,
}

/// A delta observed on a code-review system.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReviewDelta {
    pub project: Option<ProjectId>,
    pub change: u32,
    pub created: Option<Timestamp>,
    pub updated: Option<Timestamp>,
    pub owner: Option<Actor>,
    pub subject: Option<String>,
    pub status: Option<ReviewStatus>,
    /// Latest patchset number, if it advanced.
    pub patchset: Option<u32>,
}

/// One commit, pre-parsed by the producer.
///
/// Raw object parsing happens upstream of the corpus; by the time a
/// commit reaches the mutation log it is structured data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub id: Oid,
    pub parents: Vec<Oid>,
    pub author: String,
    pub author_time: Timestamp,
    pub committer: String,
    pub commit_time: Timestamp,
    pub message: String,
}

/// A ref (branch or tag) moving to a new target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefUpdate {
    /// Fully qualified name, e.g. `refs/heads/main`.
    pub name: String,
    pub target: Oid,
}

/// A delta observed on version-control history: a newly indexed commit,
/// ref movements, or both.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GitDelta {
    pub project: Option<ProjectId>,
    pub commit: Option<CommitInfo>,
    pub refs: Vec<RefUpdate>,
}

/// One atomic state change. The closed variant set over the upstream
/// domains the corpus mirrors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Issue(IssueDelta),
    Review(ReviewDelta),
    Git(GitDelta),
}

impl Mutation {
    /// The project this mutation belongs to, if well-formed.
    pub fn project(&self) -> Option<&ProjectId> {
        match self {
            Self::Issue(d) => d.project.as_ref(),
            Self::Review(d) => d.project.as_ref(),
            Self::Git(d) => d.project.as_ref(),
        }
    }
}

// Variant tags on the wire. Appending new variants is fine; renumbering
// existing ones would corrupt every log in existence.
const MUTATION_ISSUE: u8 = 1;
const MUTATION_REVIEW: u8 = 2;
const MUTATION_GIT: u8 = 3;

const STATUS_OPEN: u8 = 1;
const STATUS_MERGED: u8 = 2;
const STATUS_ABANDONED: u8 = 3;

impl Encode for ProjectId {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        self.0.encode(writer)
    }
}

impl Decode for ProjectId {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, wire::Error> {
        // Not validated here: structural validation is the corpus's
        // job, and a decode must accept whatever an append accepted.
        Ok(Self(String::decode(reader)?))
    }
}

impl Encode for Timestamp {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        self.0.encode(writer)
    }
}

impl Decode for Timestamp {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, wire::Error> {
        Ok(Self(i64::decode(reader)?))
    }
}

impl Encode for Actor {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        Ok(self.id.encode(writer)? + self.login.encode(writer)?)
    }
}

impl Decode for Actor {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, wire::Error> {
        Ok(Self {
            id: u64::decode(reader)?,
            login: String::decode(reader)?,
        })
    }
}

impl Encode for ReviewStatus {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        match self {
            Self::Open => STATUS_OPEN,
            Self::Merged => STATUS_MERGED,
            Self::Abandoned => STATUS_ABANDONED,
        }
        .encode(writer)
    }
}

impl Decode for ReviewStatus {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, wire::Error> {
        match u8::decode(reader)? {
            STATUS_OPEN => Ok(Self::Open),
            STATUS_MERGED => Ok(Self::Merged),
            STATUS_ABANDONED => Ok(Self::Abandoned),
            other => Err(wire::Error::UnknownReviewStatus(other)),
        }
    }
}

impl Encode for IssueDelta {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut n = 0;

        n += self.project.encode(writer)?;
        n += self.number.encode(writer)?;
        n += self.created.encode(writer)?;
        n += self.updated.encode(writer)?;
        n += self.author.encode(writer)?;
        n += self.title.encode(writer)?;
        n += self.body.encode(writer)?;
        n += self.closed.encode(writer)?;
        n += self.labels_added.encode(writer)?;
        n += self.labels_removed.encode(writer)?;
        n += self.assignees_added.encode(writer)?;
        n += self.assignees_removed.encode(writer)?;

        Ok(n)
    }
}

impl Decode for IssueDelta {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, wire::Error> {
        Ok(Self {
            project: Option::decode(reader)?,
            number: u32::decode(reader)?,
            created: Option::decode(reader)?,
            updated: Option::decode(reader)?,
            author: Option::decode(reader)?,
            title: Option::decode(reader)?,
            body: Option::decode(reader)?,
            closed: Option::decode(reader)?,
            labels_added: Vec::decode(reader)?,
            labels_removed: Vec::decode(reader)?,
            assignees_added: Vec::decode(reader)?,
            assignees_removed: Vec::decode(reader)?,
        })
    }
}

impl Encode for ReviewDelta {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut n = 0;

        n += self.project.encode(writer)?;
        n += self.change.encode(writer)?;
        n += self.created.encode(writer)?;
        n += self.updated.encode(writer)?;
        n += self.owner.encode(writer)?;
        n += self.subject.encode(writer)?;
        n += self.status.encode(writer)?;
        n += self.patchset.encode(writer)?;

        Ok(n)
    }
}

impl Decode for ReviewDelta {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, wire::Error> {
        Ok(Self {
            project: Option::decode(reader)?,
            change: u32::decode(reader)?,
            created: Option::decode(reader)?,
            updated: Option::decode(reader)?,
            owner: Option::decode(reader)?,
            subject: Option::decode(reader)?,
            status: Option::decode(reader)?,
            patchset: Option::decode(reader)?,
        })
    }
}

impl Encode for CommitInfo {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut n = 0;

        n += self.id.encode(writer)?;
        n += self.parents.encode(writer)?;
        n += self.author.encode(writer)?;
        n += self.author_time.encode(writer)?;
        n += self.committer.encode(writer)?;
        n += self.commit_time.encode(writer)?;
        n += self.message.encode(writer)?;

        Ok(n)
    }
}

impl Decode for CommitInfo {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, wire::Error> {
        Ok(Self {
            id: Oid::decode(reader)?,
            parents: Vec::decode(reader)?,
            author: String::decode(reader)?,
            author_time: Timestamp::decode(reader)?,
            committer: String::decode(reader)?,
            commit_time: Timestamp::decode(reader)?,
            message: String::decode(reader)?,
        })
    }
}

impl Encode for RefUpdate {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        Ok(self.name.encode(writer)? + self.target.encode(writer)?)
    }
}

impl Decode for RefUpdate {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, wire::Error> {
        Ok(Self {
            name: String::decode(reader)?,
            target: Oid::decode(reader)?,
        })
    }
}

impl Encode for GitDelta {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut n = 0;

        n += self.project.encode(writer)?;
        n += self.commit.encode(writer)?;
        n += self.refs.encode(writer)?;

        Ok(n)
    }
}

impl Decode for GitDelta {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, wire::Error> {
        Ok(Self {
            project: Option::decode(reader)?,
            commit: Option::decode(reader)?,
            refs: Vec::decode(reader)?,
        })
    }
}

impl Encode for Mutation {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        match self {
            Self::Issue(d) => Ok(MUTATION_ISSUE.encode(writer)? + d.encode(writer)?),
            Self::Review(d) => Ok(MUTATION_REVIEW.encode(writer)? + d.encode(writer)?),
            Self::Git(d) => Ok(MUTATION_GIT.encode(writer)? + d.encode(writer)?),
        }
    }
}

impl Decode for Mutation {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, wire::Error> {
        match u8::decode(reader)? {
            MUTATION_ISSUE => Ok(Self::Issue(IssueDelta::decode(reader)?)),
            MUTATION_REVIEW => Ok(Self::Review(ReviewDelta::decode(reader)?)),
            MUTATION_GIT => Ok(Self::Git(GitDelta::decode(reader)?)),
            other => Err(wire::Error::UnknownMutationType(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{deserialize, serialize};

    #[test]
    fn test_project_id_parts() {
        let id = ProjectId::from_str("example/tooling").unwrap();

        assert_eq!(id.origin(), "example");
        assert_eq!(id.name(), "tooling");

        assert!(ProjectId::from_str("no-slash").is_err());
        assert!(ProjectId::from_str("/name").is_err());
        assert!(ProjectId::from_str("origin/").is_err());
    }

    #[test]
    fn test_issue_mutation_codec() {
        let m = Mutation::Issue(IssueDelta {
            project: Some("example/tooling".parse().unwrap()),
            number: 42,
            created: Some(Timestamp(1700000000)),
            updated: Some(Timestamp(1700000100)),
            author: Some(Actor {
                id: 7,
                login: "amy".to_owned(),
            }),
            title: Some("flaky builder".to_owned()),
            closed: Some(false),
            labels_added: vec!["release-blocker".to_owned()],
            ..Default::default()
        });
        let bytes = serialize(&m);

        assert_eq!(deserialize::<Mutation>(&bytes).unwrap(), m);
    }

    #[test]
    fn test_unknown_variant_tag() {
        let err = deserialize::<Mutation>(&[9]).unwrap_err();

        assert!(matches!(err, wire::Error::UnknownMutationType(9)));
    }
}
