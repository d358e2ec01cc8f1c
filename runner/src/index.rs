
use crate::{
    job::{Job, JobId},
    outputs::OutputSpec,
};
use std::{collections::BTreeMap, fmt};
use tracing::{debug, trace, warn};

/// An already registered output overlapping a candidate output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub owner: JobId,
    pub existing: OutputSpec,
    pub candidate: OutputSpec,
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "output {} overlaps {} of open job {}",
            self.candidate, self.existing, self.owner
        )
    }
}

/// Declared outputs of all open jobs, mapped to the job owning them.
///
/// Derived from the open set and never persisted on its own; registered
/// outputs are pairwise non-overlapping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConflictIndex {
    owners: BTreeMap<OutputSpec, JobId>,
}

impl ConflictIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// build the index of a set of open jobs
    pub fn from_jobs<'a, I: IntoIterator<Item = &'a Job>>(jobs: I) -> Self {
        let mut index = Self::new();

        for job in jobs {
            index.track(job);
        }

        debug!(outputs = index.owners.len(), "Built conflict index");

        index
    }

    /// first registered output overlapping any of `candidate`
    pub fn check(&self, candidate: &[OutputSpec]) -> Result<(), Conflict> {
        for output in candidate {
            trace!(output = %output, "Checking for overlap");

            if let Some((existing, owner)) = self
                .owners
                .iter()
                .find(|(existing, _)| existing.overlaps(output))
            {
                return Err(Conflict {
                    owner: owner.clone(),
                    existing: existing.clone(),
                    candidate: output.clone(),
                });
            }
        }

        Ok(())
    }

    /// Register `candidate` for `owner` if it overlaps nothing, leaving the
    /// index untouched otherwise.
    pub fn check_and_register(
        &mut self,
        owner: &JobId,
        candidate: &[OutputSpec],
    ) -> Result<(), Conflict> {
        self.check(candidate)?;

        for output in candidate {
            self.owners.insert(output.clone(), owner.clone());
        }

        Ok(())
    }

    /// Register the outputs of a job history already records as open.
    ///
    /// Overlaps with other open jobs are logged and registered all the same.
    pub fn track(&mut self, job: &Job) {
        if let Err(conflict) = self.check_and_register(&job.job_id, &job.declared_outputs) {
            warn!(job_id = %job.job_id, "Recorded open job overlaps another one: {conflict}");

            for output in job.declared_outputs.iter() {
                self.owners.insert(output.clone(), job.job_id.clone());
            }
        }
    }

    /// drop every output owned by `owner`
    pub fn release(&mut self, owner: &JobId) {
        self.owners.retain(|_, registered| registered != owner);
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}
