//! Code-review sub-store.

use std::collections::BTreeMap;

use crate::corpus::ApplyError;
use crate::intern::Intern;
use crate::issues::StoredActor;
use crate::mutation::{ProjectId, ReviewDelta, ReviewStatus, Timestamp};

/// One review change, as currently known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Review {
    pub change: u32,
    pub created: Timestamp,
    pub updated: Timestamp,
    pub owner: Option<StoredActor>,
    pub subject: String,
    pub status: ReviewStatus,
    pub patchset: u32,
}

impl Review {
    fn new(change: u32, created: Timestamp) -> Self {
        Self {
            change,
            created,
            updated: Timestamp::default(),
            owner: None,
            subject: String::new(),
            status: ReviewStatus::Open,
            patchset: 0,
        }
    }
}

/// All review changes, per project.
#[derive(Debug, Default)]
pub struct ReviewStore {
    changes: BTreeMap<ProjectId, BTreeMap<u32, Review>>,
}

impl ReviewStore {
    /// Apply one review delta. Idempotent; requires the corpus
    /// exclusive lock.
    pub(crate) fn apply(&mut self, delta: &ReviewDelta, intern: &mut Intern) -> Result<(), ApplyError> {
        let project = delta
            .project
            .as_ref()
            .ok_or(ApplyError::MissingProject)?
            .clone();

        if delta.change == 0 {
            return Err(ApplyError::MissingNumber);
        }
        let review = self
            .changes
            .entry(project)
            .or_default()
            .entry(delta.change)
            .or_insert_with(|| Review::new(delta.change, delta.created.unwrap_or_default()));

        if let Some(updated) = delta.updated {
            if updated < review.updated {
                return Ok(());
            }
            review.updated = updated;
        }
        if let Some(owner) = &delta.owner {
            review.owner = Some(StoredActor {
                id: owner.id,
                login: intern.intern(&owner.login),
            });
        }
        if let Some(subject) = &delta.subject {
            review.subject = subject.clone();
        }
        if let Some(status) = delta.status {
            review.status = status;
        }
        if let Some(patchset) = delta.patchset {
            // Patchsets only advance.
            review.patchset = review.patchset.max(patchset);
        }
        Ok(())
    }

    /// Look up one review change.
    pub fn change(&self, project: &ProjectId, change: u32) -> Option<&Review> {
        self.changes.get(project)?.get(&change)
    }

    /// All changes of a project, in change-number order.
    pub fn project_changes(&self, project: &ProjectId) -> impl Iterator<Item = &Review> {
        self.changes.get(project).into_iter().flatten().map(|(_, r)| r)
    }

    /// Total number of changes across projects.
    pub fn len(&self) -> usize {
        self.changes.values().map(|m| m.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
