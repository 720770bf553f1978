//! Issue-tracker sub-store.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::corpus::ApplyError;
use crate::intern::Intern;
use crate::mutation::{IssueDelta, ProjectId, Timestamp};

/// An actor as stored in the corpus, with its login interned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredActor {
    pub id: u64,
    pub login: Arc<str>,
}

/// One issue, as currently known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    pub number: u32,
    pub created: Timestamp,
    /// Upstream timestamp of the newest delta applied. Deltas older
    /// than this are stale and ignored.
    pub updated: Timestamp,
    pub author: Option<StoredActor>,
    pub title: String,
    pub body: String,
    pub closed: bool,
    pub labels: BTreeSet<Arc<str>>,
    /// Assignees keyed by upstream id; the login is the interned
    /// current name.
    pub assignees: BTreeMap<u64, Arc<str>>,
}

impl Issue {
    fn new(number: u32, created: Timestamp) -> Self {
        Self {
            number,
            created,
            updated: Timestamp::default(),
            author: None,
            title: String::new(),
            body: String::new(),
            closed: false,
            labels: BTreeSet::new(),
            assignees: BTreeMap::new(),
        }
    }
}

/// All issues, per project.
#[derive(Debug, Default)]
pub struct IssueStore {
    issues: BTreeMap<ProjectId, BTreeMap<u32, Issue>>,
}

impl IssueStore {
    /// Apply one issue delta. Idempotent; requires the corpus
    /// exclusive lock.
    pub(crate) fn apply(&mut self, delta: &IssueDelta, intern: &mut Intern) -> Result<(), ApplyError> {
        let project = delta
            .project
            .as_ref()
            .ok_or(ApplyError::MissingProject)?
            .clone();

        if delta.number == 0 {
            return Err(ApplyError::MissingNumber);
        }
        let issue = self
            .issues
            .entry(project)
            .or_default()
            .entry(delta.number)
            .or_insert_with(|| Issue::new(delta.number, delta.created.unwrap_or_default()));

        if let Some(updated) = delta.updated {
            // A delta carrying data older than what we already applied
            // is stale; drop it. Equal timestamps are redeliveries of
            // the same observation and fall through to the idempotent
            // field updates below.
            if updated < issue.updated {
                return Ok(());
            }
            issue.updated = updated;
        }
        if let Some(author) = &delta.author {
            issue.author = Some(StoredActor {
                id: author.id,
                login: intern.intern(&author.login),
            });
        }
        if let Some(title) = &delta.title {
            issue.title = title.clone();
        }
        if let Some(body) = &delta.body {
            issue.body = body.clone();
        }
        if let Some(closed) = delta.closed {
            issue.closed = closed;
        }
        for label in &delta.labels_added {
            issue.labels.insert(intern.intern(label));
        }
        for label in &delta.labels_removed {
            issue.labels.remove(label.as_str());
        }
        for assignee in &delta.assignees_added {
            issue
                .assignees
                .insert(assignee.id, intern.intern(&assignee.login));
        }
        for id in &delta.assignees_removed {
            issue.assignees.remove(id);
        }
        Ok(())
    }

    /// Look up one issue.
    pub fn issue(&self, project: &ProjectId, number: u32) -> Option<&Issue> {
        self.issues.get(project)?.get(&number)
    }

    /// All issues of a project, in issue-number order.
    pub fn project_issues(&self, project: &ProjectId) -> impl Iterator<Item = &Issue> {
        self.issues.get(project).into_iter().flatten().map(|(_, i)| i)
    }

    /// Total number of issues across projects.
    pub fn len(&self) -> usize {
        self.issues.values().map(|m| m.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::Actor;

    fn delta(number: u32) -> IssueDelta {
        IssueDelta {
            project: Some("example/tooling".parse().unwrap()),
            number,
            ..Default::default()
        }
    }

    #[test]
    fn test_create_and_update() {
        let mut store = IssueStore::default();
        let mut intern = Intern::new();
        let project: ProjectId = "example/tooling".parse().unwrap();

        store
            .apply(
                &IssueDelta {
                    created: Some(Timestamp(100)),
                    updated: Some(Timestamp(100)),
                    title: Some("flaky builder".to_owned()),
                    author: Some(Actor {
                        id: 7,
                        login: "amy".to_owned(),
                    }),
                    ..delta(1)
                },
                &mut intern,
            )
            .unwrap();
        store
            .apply(
                &IssueDelta {
                    updated: Some(Timestamp(200)),
                    closed: Some(true),
                    ..delta(1)
                },
                &mut intern,
            )
            .unwrap();

        let issue = store.issue(&project, 1).unwrap();
        assert_eq!(issue.title, "flaky builder");
        assert_eq!(issue.created, Timestamp(100));
        assert_eq!(issue.updated, Timestamp(200));
        assert!(issue.closed);
    }

    #[test]
    fn test_stale_delta_is_ignored() {
        let mut store = IssueStore::default();
        let mut intern = Intern::new();
        let project: ProjectId = "example/tooling".parse().unwrap();

        store
            .apply(
                &IssueDelta {
                    updated: Some(Timestamp(200)),
                    title: Some("current".to_owned()),
                    ..delta(1)
                },
                &mut intern,
            )
            .unwrap();
        store
            .apply(
                &IssueDelta {
                    updated: Some(Timestamp(100)),
                    title: Some("stale".to_owned()),
                    ..delta(1)
                },
                &mut intern,
            )
            .unwrap();

        assert_eq!(store.issue(&project, 1).unwrap().title, "current");
    }

    #[test]
    fn test_labels_and_assignees() {
        let mut store = IssueStore::default();
        let mut intern = Intern::new();
        let project: ProjectId = "example/tooling".parse().unwrap();

        store
            .apply(
                &IssueDelta {
                    labels_added: vec!["bug".to_owned(), "release-blocker".to_owned()],
                    assignees_added: vec![Actor {
                        id: 7,
                        login: "amy".to_owned(),
                    }],
                    ..delta(1)
                },
                &mut intern,
            )
            .unwrap();
        store
            .apply(
                &IssueDelta {
                    labels_removed: vec!["bug".to_owned()],
                    assignees_removed: vec![7],
                    ..delta(1)
                },
                &mut intern,
            )
            .unwrap();

        let issue = store.issue(&project, 1).unwrap();
        assert_eq!(
            issue.labels.iter().map(|l| l.as_ref()).collect::<Vec<_>>(),
            vec!["release-blocker"]
        );
        assert!(issue.assignees.is_empty());
    }

    #[test]
    fn test_missing_number_is_malformed() {
        let mut store = IssueStore::default();
        let mut intern = Intern::new();

        assert!(matches!(
            store.apply(&delta(0), &mut intern),
            Err(ApplyError::MissingNumber)
        ));
        assert!(matches!(
            store.apply(
                &IssueDelta {
                    project: None,
                    number: 1,
                    ..Default::default()
                },
                &mut intern
            ),
            Err(ApplyError::MissingProject)
        ));
    }
}
