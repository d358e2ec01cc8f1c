//! Local SQLite materialisation of the open set.
//!
//! Purely a shortcut around replaying the whole history: the cache remembers
//! the head it was built from and is only trusted while that is still the
//! head of the log. It can be deleted at any time.

#[cfg(test)]
mod cache_test;

use crate::{
    job::{CommitId, Job},
    reconcile::OpenSet,
};
use parking_lot::{lock_api::ArcMutexGuard, FairMutex, RawFairMutex};
use rusqlite::{params, Connection, OptionalExtension};
use std::{path::Path, sync::Arc};
use thiserror::Error;
use tracing::{debug, error, info};
use tracing_unwrap::ResultExt;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache database failed")]
    SQLite(#[from] rusqlite::Error),
    #[error("Cache was built at {cached:?} but history is at {actual:?}")]
    Stale {
        cached: Option<CommitId>,
        actual: Option<CommitId>,
    },
    #[error("Cache holds no open set yet")]
    Missing,
    #[error("Cached job {job_id} is malformed")]
    Malformed {
        job_id: String,
        #[source]
        source: serde_json::Error,
    },
}

pub const SQL_SCHEMA: [&str; 2] = [
    "create table if not exists meta (
    id integer primary key check (id = 0),
    head text
);",
    "create table if not exists open_jobs (
    position integer primary key,
    job_id text not null,
    schedule_commit text not null unique,
    job text not null
);",
];
pub const SQL_SCHEMA_NUMBER: usize = SQL_SCHEMA.len();

/// Transparent, thread safe wrapper over `InnerCache`
#[derive(Debug, Clone)]
pub struct SharedCache(Arc<FairMutex<InnerCache>>);

#[derive(Debug)]
pub struct InnerCache {
    connection: Connection,
}

impl SharedCache {
    pub fn new(inner: InnerCache) -> Self {
        Self(Arc::new(FairMutex::new(inner)))
    }

    fn lock(&self) -> ArcMutexGuard<RawFairMutex, InnerCache> {
        self.0.lock_arc()
    }

    pub fn open(path: &Path) -> Result<Self, CacheError> {
        Ok(Self::new(InnerCache::open(path)?))
    }

    pub fn in_memory() -> Result<Self, CacheError> {
        Ok(Self::new(InnerCache::init(Connection::open_in_memory()?)?))
    }

    pub fn load(&self, actual: Option<&CommitId>) -> Result<OpenSet, CacheError> {
        self.lock().load(actual)
    }

    pub fn store(&self, open: &OpenSet) -> Result<(), CacheError> {
        self.lock().store(open)
    }

    pub fn invalidate(&self) -> Result<(), CacheError> {
        self.lock().invalidate()
    }

    /// close the connection, must hold the last handle
    pub fn close(self) -> Result<(), CacheError> {
        Arc::try_unwrap(self.0).unwrap_or_log().into_inner().close()
    }
}

impl InnerCache {
    pub fn open(path: &Path) -> Result<Self, CacheError> {
        debug!(path = ?path, "Opening cache");

        Self::init(Connection::open(path)?)
    }

    fn init(connection: Connection) -> Result<Self, CacheError> {
        let mut counter = 1;

        for table in SQL_SCHEMA {
            match connection.execute(table, []) {
                Ok(_) => debug!("Applied SQL schema ({counter}/{SQL_SCHEMA_NUMBER})"),
                Err(error) => {
                    error!(error = ?error, table = table, "Failed to apply SQL schema ({counter}/{SQL_SCHEMA_NUMBER}): {error}");

                    return Err(CacheError::SQLite(error));
                }
            };

            counter += 1;
        }

        Ok(Self { connection })
    }

    fn cached_head(&self) -> Result<Option<Option<CommitId>>, CacheError> {
        Ok(self
            .connection
            .prepare_cached("select head from meta where id = 0")?
            .query_row([], |row| row.get::<_, Option<String>>(0))
            .optional()?
            .map(|head| head.map(CommitId::new)))
    }

    /// The cached open set, if it was built from `actual`
    pub fn load(&self, actual: Option<&CommitId>) -> Result<OpenSet, CacheError> {
        let cached = self.cached_head()?.ok_or(CacheError::Missing)?;

        if cached.as_ref() != actual {
            return Err(CacheError::Stale {
                cached,
                actual: actual.cloned(),
            });
        }

        let rows = self
            .connection
            .prepare_cached("select job_id, job from open_jobs order by position")?
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .try_fold(Vec::new(), |mut init, result| {
                init.push(result?);

                Ok::<Vec<(String, String)>, CacheError>(init)
            })?;

        let jobs = rows
            .into_iter()
            .map(|(job_id, job)| {
                serde_json::from_str::<Job>(&job)
                    .map_err(|source| CacheError::Malformed { job_id, source })
            })
            .collect::<Result<Vec<_>, _>>()?;

        debug!(jobs = jobs.len(), head = ?cached, "Loaded open jobs from cache");

        Ok(OpenSet::new(cached, jobs))
    }

    /// Replace the cached open set with `open`
    pub fn store(&self, open: &OpenSet) -> Result<(), CacheError> {
        // NOTE: single connection per cache, no nested transactions possible
        let mut tx = self.connection.unchecked_transaction()?;
        tx.set_drop_behavior(rusqlite::DropBehavior::Rollback);

        tx.execute("delete from open_jobs", [])?;
        tx.prepare_cached("insert or replace into meta (id, head) values (0, ?)")?
            .execute(params![open.head().map(CommitId::as_str)])?;

        for (position, job) in open.jobs().iter().enumerate() {
            let serialized = serde_json::to_string(job).map_err(|source| CacheError::Malformed {
                job_id: job.job_id.to_string(),
                source,
            })?;

            tx.prepare_cached(
                "insert into open_jobs
                 (position, job_id, schedule_commit, job)
                 values (?, ?, ?, ?)",
            )?
            .execute(params![
                position as i64,
                job.job_id.as_str(),
                job.schedule_commit.as_str(),
                serialized
            ])?;
        }
        tx.commit()?;

        debug!(jobs = open.len(), head = ?open.head(), "Stored open jobs in cache");

        Ok(())
    }

    pub fn invalidate(&self) -> Result<(), CacheError> {
        self.connection.execute("delete from meta", [])?;
        self.connection.execute("delete from open_jobs", [])?;

        info!("Invalidated cache");

        Ok(())
    }

    pub fn close(mut self) -> Result<(), CacheError> {
        let mut counter = 0;
        while let Err((connection, error)) = self.connection.close() {
            counter += 1;
            self.connection = connection;
            error!(error = ?error, "Failed to close cache connection: {error}, trying again {counter}/3");

            if counter == 3 {
                return Err(CacheError::SQLite(error));
            }
        }

        debug!("Closed cache connection");

        Ok(())
    }
}
