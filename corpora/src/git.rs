//! Version-control sub-store: the commit graph and refs.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use crate::corpus::ApplyError;
use crate::intern::Intern;
use crate::mutation::{GitDelta, ProjectId, Timestamp};
use crate::singleflight;
use crate::wire;
use crate::wire::{Decode, Encode};

/// A commit object id (SHA-1).
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Oid([u8; 20]);

impl Oid {
    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

#[derive(thiserror::Error, Debug)]
#[error("invalid object id `{0}`")]
pub struct OidError(String);

impl FromStr for Oid {
    type Err = OidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 40 {
            return Err(OidError(s.to_owned()));
        }
        let mut bytes = [0; 20];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| OidError(s.to_owned()))?;
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Encode for Oid {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        self.0.encode(writer)
    }
}

impl Decode for Oid {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, wire::Error> {
        Ok(Self(<[u8; 20]>::decode(reader)?))
    }
}

/// A commit node. Parents always point backward in history, so the
/// graph is acyclic by construction.
#[derive(Debug, Clone)]
pub struct Commit {
    pub id: Oid,
    pub parents: Vec<Oid>,
    /// Interned author identity, e.g. `Anne Author <anne@example.com>`.
    pub author: Arc<str>,
    pub author_time: Timestamp,
    pub committer: Arc<str>,
    pub commit_time: Timestamp,
    pub message: String,
}

/// Errors returned to read-API callers. The corpus itself is unaffected
/// by these.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum QueryError {
    #[error("unknown commit `{0}`")]
    UnknownCommit(Oid),
    #[error("unknown ref `{name}` in project `{project}`")]
    UnknownRef { project: ProjectId, name: String },
}

/// The commit-graph store: hash-keyed commits plus per-project refs.
pub struct GitStore {
    commits: HashMap<Oid, Commit>,
    refs: BTreeMap<ProjectId, BTreeMap<Arc<str>, Oid>>,
    /// Memoized ancestor queries, valid for the current graph only;
    /// cleared whenever a commit is added.
    memo: Mutex<HashMap<(Oid, Oid), bool>>,
    flights: singleflight::Group<(Oid, Oid), bool>,
}

impl Default for GitStore {
    fn default() -> Self {
        Self {
            commits: HashMap::new(),
            refs: BTreeMap::new(),
            memo: Mutex::new(HashMap::new()),
            flights: singleflight::Group::new(),
        }
    }
}

impl GitStore {
    /// Apply one git delta. Idempotent: re-applying the same delta
    /// leaves the store unchanged. Requires the corpus exclusive lock.
    pub(crate) fn apply(&mut self, delta: &GitDelta, intern: &mut Intern) -> Result<(), ApplyError> {
        let project = delta
            .project
            .as_ref()
            .ok_or(ApplyError::MissingProject)?
            .clone();

        if delta.commit.is_none() && delta.refs.is_empty() {
            return Err(ApplyError::EmptyDelta);
        }
        if let Some(info) = &delta.commit {
            // Commits are immutable; the first version wins and
            // redelivery is a no-op.
            if !self.commits.contains_key(&info.id) {
                self.commits.insert(
                    info.id,
                    Commit {
                        id: info.id,
                        parents: info.parents.clone(),
                        author: intern.intern(&info.author),
                        author_time: info.author_time,
                        committer: intern.intern(&info.committer),
                        commit_time: info.commit_time,
                        message: info.message.clone(),
                    },
                );
                self.memo.lock().unwrap().clear();
            }
        }
        for update in &delta.refs {
            if update.name.is_empty() {
                return Err(ApplyError::EmptyRefName);
            }
            let name = intern.intern(&update.name);
            self.refs
                .entry(project.clone())
                .or_default()
                .insert(name, update.target);
        }
        Ok(())
    }

    /// Look up a commit by id.
    pub fn commit(&self, id: &Oid) -> Option<&Commit> {
        self.commits.get(id)
    }

    /// Number of indexed commits.
    pub fn len(&self) -> usize {
        self.commits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }

    /// Resolve a ref name within a project.
    pub fn reference(&self, project: &ProjectId, name: &str) -> Result<Oid, QueryError> {
        self.refs
            .get(project)
            .and_then(|refs| refs.get(name))
            .copied()
            .ok_or_else(|| QueryError::UnknownRef {
                project: project.clone(),
                name: name.to_owned(),
            })
    }

    /// All refs of a project, in name order.
    pub fn references<'a>(
        &'a self,
        project: &ProjectId,
    ) -> impl Iterator<Item = (&'a str, Oid)> + 'a {
        self.refs
            .get(project)
            .into_iter()
            .flatten()
            .map(|(name, oid)| (name.as_ref(), *oid))
    }

    /// Whether `ancestor` is a strict ancestor of `commit`, i.e.
    /// reachable through one or more parent edges. A commit is never
    /// its own strict ancestor.
    ///
    /// The traversal is iterative: history depth is unbounded and not
    /// ours to trust with the call stack. Repeat queries are memoized
    /// for the current graph, and concurrent identical queries share
    /// one traversal.
    pub fn has_ancestor(&self, commit: Oid, ancestor: Oid) -> Result<bool, QueryError> {
        let start = self
            .commits
            .get(&commit)
            .ok_or(QueryError::UnknownCommit(commit))?;

        if let Some(cached) = self.memo.lock().unwrap().get(&(commit, ancestor)) {
            return Ok(*cached);
        }
        let found = self.flights.run((commit, ancestor), || {
            let mut queue: VecDeque<Oid> = start.parents.iter().copied().collect();
            let mut visited: HashSet<Oid> = HashSet::new();

            while let Some(id) = queue.pop_front() {
                if id == ancestor {
                    return true;
                }
                if !visited.insert(id) {
                    continue;
                }
                // Parents of commits we haven't indexed yet simply end
                // the walk on that branch.
                if let Some(c) = self.commits.get(&id) {
                    queue.extend(c.parents.iter().copied());
                }
            }
            false
        });
        self.memo.lock().unwrap().insert((commit, ancestor), found);

        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::{CommitInfo, RefUpdate};

    fn oid(n: u8) -> Oid {
        Oid::from_bytes([n; 20])
    }

    fn commit_delta(project: &str, id: Oid, parents: Vec<Oid>) -> GitDelta {
        GitDelta {
            project: Some(project.parse().unwrap()),
            commit: Some(CommitInfo {
                id,
                parents,
                author: "Anne Author <anne@example.com>".to_owned(),
                author_time: Timestamp(1700000000),
                committer: "Bob Committer <bob@example.com>".to_owned(),
                commit_time: Timestamp(1700000001),
                message: "commit".to_owned(),
            }),
            refs: Vec::new(),
        }
    }

    fn store_with_chain(len: u8) -> GitStore {
        let mut store = GitStore::default();
        let mut intern = Intern::new();

        for n in 1..=len {
            let parents = if n == 1 { vec![] } else { vec![oid(n - 1)] };
            store
                .apply(&commit_delta("example/tooling", oid(n), parents), &mut intern)
                .unwrap();
        }
        store
    }

    #[test]
    fn test_oid_hex_round_trip() {
        let id: Oid = "0101010101010101010101010101010101010101".parse().unwrap();

        assert_eq!(id, oid(1));
        assert_eq!(id.to_string(), "0101010101010101010101010101010101010101");
        assert!("zz".parse::<Oid>().is_err());
    }

    #[test]
    fn test_ancestry_chain() {
        let store = store_with_chain(3);

        assert!(store.has_ancestor(oid(3), oid(2)).unwrap());
        assert!(store.has_ancestor(oid(3), oid(1)).unwrap());
        assert!(!store.has_ancestor(oid(1), oid(3)).unwrap());
    }

    #[test]
    fn test_not_own_ancestor() {
        let store = store_with_chain(2);

        assert!(!store.has_ancestor(oid(1), oid(1)).unwrap());
        assert!(!store.has_ancestor(oid(2), oid(2)).unwrap());
    }

    #[test]
    fn test_unknown_commit_is_query_error() {
        let store = store_with_chain(1);

        assert_eq!(
            store.has_ancestor(oid(9), oid(1)),
            Err(QueryError::UnknownCommit(oid(9)))
        );
    }

    #[test]
    fn test_ancestry_transitive_on_random_dag() {
        let mut store = GitStore::default();
        let mut intern = Intern::new();
        let mut rng = fastrand::Rng::with_seed(0xc0ffee);

        // Parents always point at lower-numbered commits, so the graph
        // is a DAG by construction.
        for n in 1..=60u8 {
            let mut parents = Vec::new();
            for _ in 0..rng.usize(0..3.min(n as usize)) {
                parents.push(oid(rng.u8(1..n)));
            }
            store
                .apply(&commit_delta("example/tooling", oid(n), parents), &mut intern)
                .unwrap();
        }
        for _ in 0..200 {
            let x = oid(rng.u8(1..=60));
            let y = oid(rng.u8(1..=60));
            let z = oid(rng.u8(1..=60));

            if store.has_ancestor(x, y).unwrap() && store.has_ancestor(y, z).unwrap() {
                assert!(store.has_ancestor(x, z).unwrap());
            }
            assert!(!store.has_ancestor(x, x).unwrap());
        }
    }

    #[test]
    fn test_memo_is_invalidated_by_new_commits() {
        let mut store = store_with_chain(2);
        let mut intern = Intern::new();

        // Prime the memo cache.
        assert!(store.has_ancestor(oid(2), oid(1)).unwrap());

        store
            .apply(
                &commit_delta("example/tooling", oid(3), vec![oid(2)]),
                &mut intern,
            )
            .unwrap();

        assert!(store.has_ancestor(oid(3), oid(1)).unwrap());
    }

    #[test]
    fn test_refs() {
        let mut store = GitStore::default();
        let mut intern = Intern::new();
        let project: ProjectId = "example/tooling".parse().unwrap();

        store
            .apply(&commit_delta("example/tooling", oid(1), vec![]), &mut intern)
            .unwrap();
        store
            .apply(
                &GitDelta {
                    project: Some(project.clone()),
                    commit: None,
                    refs: vec![RefUpdate {
                        name: "refs/heads/main".to_owned(),
                        target: oid(1),
                    }],
                },
                &mut intern,
            )
            .unwrap();

        assert_eq!(store.reference(&project, "refs/heads/main"), Ok(oid(1)));
        assert!(matches!(
            store.reference(&project, "refs/heads/nope"),
            Err(QueryError::UnknownRef { .. })
        ));
        assert_eq!(store.references(&project).count(), 1);

        // Refs are keyed per project: another project resolves its own
        // names only.
        let other: ProjectId = "example/website".parse().unwrap();
        assert!(store.reference(&other, "refs/heads/main").is_err());
        assert_eq!(store.references(&other).count(), 0);
    }

    #[test]
    fn test_commit_delta_is_idempotent() {
        let mut store = GitStore::default();
        let mut intern = Intern::new();
        let delta = commit_delta("example/tooling", oid(1), vec![]);

        store.apply(&delta, &mut intern).unwrap();
        store.apply(&delta, &mut intern).unwrap();

        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_empty_delta_is_malformed() {
        let mut store = GitStore::default();
        let mut intern = Intern::new();
        let delta = GitDelta {
            project: Some("example/tooling".parse().unwrap()),
            commit: None,
            refs: Vec::new(),
        };

        assert!(matches!(
            store.apply(&delta, &mut intern),
            Err(ApplyError::EmptyDelta)
        ));
    }
}
