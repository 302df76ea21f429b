// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of emberfeed.
//
// emberfeed is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// emberfeed is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with emberfeed.  If not,
// see <http://www.gnu.org/licenses/>.

//! # warmer
//!
//! Lazy, cache-aside population of the ranked sets.
//!
//! A set is either *warm* (present in the cache, kept current by the popularity machinery) or
//! *cold* (absent; to be rebuilt wholesale from the relational store on next access). This module
//! provides the one transition: cold → warm.
//!
//! There is deliberately no single-flight guard here. Two callers racing on the same cold set
//! will both run the loader & both [load](emberfeed_cache::store::Backend::load); since each load
//! replaces the set's contents with a fresh read of the authoritative store, the last writer
//! leaves the same contents the first did. Paying for an occasional duplicate read is simpler
//! than coordinating, and correctness only needs idempotence.
//!
//! A set that loads empty is *still marked warm*. Otherwise every reader of a legitimately-empty
//! set would re-run the loader-- the thundering herd this module exists to prevent.

use std::{future::Future, sync::Arc};

use snafu::{ResultExt, Snafu};
use tracing::debug;

use emberfeed_cache::{
    store::Backend as CacheBackend,
    types::{Member, SetName},
};

use crate::{
    counter_add,
    metrics::{self, Instruments, Sort},
    storage,
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("While warming {set}, the cache failed: {source}"))]
    Cache {
        set: SetName,
        source: emberfeed_cache::store::Error,
    },
    #[snafu(display("While warming {set}, the loader failed: {source}"))]
    Loader {
        set: SetName,
        source: storage::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { metrics::Registration::new("cache.warmups", Sort::IntegralCounter) }

/// The cold → warm transition, as an explicit component
///
/// Holds its cache handle explicitly; construct one per application (they're cheap) & hand it to
/// whoever reads ranked sets.
#[derive(Clone)]
pub struct CacheWarmer {
    cache: Arc<dyn CacheBackend + Send + Sync>,
    instruments: Arc<Instruments>,
}

impl CacheWarmer {
    pub fn new(
        cache: Arc<dyn CacheBackend + Send + Sync>,
        instruments: Arc<Instruments>,
    ) -> CacheWarmer {
        CacheWarmer { cache, instruments }
    }
    /// If `set` is cold, run `loader` against the authoritative store & bulk-load the result,
    /// marking the set warm even when the loader came back empty. A failure (of the loader or of
    /// the cache) leaves the set cold; the caller decides whether to degrade or give up. No
    /// retries here.
    pub async fn ensure_warm<F, Fut>(&self, set: &SetName, loader: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = storage::Result<Vec<(f64, Member)>>>,
    {
        if self.cache.exists(set).await.context(CacheSnafu { set: set.clone() })? {
            return Ok(());
        }
        debug!("Heating up cache for {set}");
        let entries = loader().await.context(LoaderSnafu { set: set.clone() })?;
        if entries.is_empty() {
            debug!("Nothing to cache for {set}; marking it warm regardless");
        }
        self.cache
            .load(set, &entries)
            .await
            .context(CacheSnafu { set: set.clone() })?;
        counter_add!(self.instruments, "cache.warmups", 1, &[]);
        Ok(())
    }
    /// [ensure_warm](CacheWarmer::ensure_warm) for a plain membership set.
    pub async fn ensure_members_warm<F, Fut>(&self, set: &SetName, loader: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = storage::Result<Vec<Member>>>,
    {
        if self.cache.exists(set).await.context(CacheSnafu { set: set.clone() })? {
            return Ok(());
        }
        debug!("Heating up cache for {set}");
        let members = loader().await.context(LoaderSnafu { set: set.clone() })?;
        self.cache
            .load_members(set, &members)
            .await
            .context(CacheSnafu { set: set.clone() })?;
        counter_add!(self.instruments, "cache.warmups", 1, &[]);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use emberfeed_cache::memory::Memory as MemoryCache;

    fn warmer() -> (CacheWarmer, Arc<MemoryCache>) {
        let cache = Arc::new(MemoryCache::new());
        (
            CacheWarmer::new(cache.clone(), Arc::new(Instruments::new("emberfeed"))),
            cache,
        )
    }

    #[tokio::test]
    async fn warms_once() {
        let (warmer, cache) = warmer();
        let set = SetName::from("user:1:posts");
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            warmer
                .ensure_warm(&set, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(vec![(1.0, Member::new(7)), (0.0, Member::new(8))])
                })
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            cache.range_by_score_desc(&set, 0, 9).await.unwrap(),
            vec![Member::new(7), Member::new(8)]
        );
    }

    #[tokio::test]
    async fn empty_is_warm() {
        let (warmer, cache) = warmer();
        let set = SetName::from("tag:crickets:posts");
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            warmer
                .ensure_warm(&set, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Vec::new())
                })
                .await
                .unwrap();
        }
        // One loader call; after that the empty set is a cache hit.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.exists(&set).await.unwrap());
        assert_eq!(cache.cardinality(&set).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn concurrent_racers_converge() {
        let (warmer, cache) = warmer();
        let set = SetName::from("user:2:posts");
        let calls = Arc::new(AtomicUsize::new(0));

        // All tasks see the set cold & all run the loader; the point is that the final contents
        // are exactly what a single warm-up would have produced.
        let tasks = (0..8)
            .map(|_| {
                let warmer = warmer.clone();
                let set = set.clone();
                let calls = calls.clone();
                tokio::spawn(async move {
                    warmer
                        .ensure_warm(&set, || async {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                            Ok(vec![(2.0, Member::new(1)), (1.0, Member::new(2))])
                        })
                        .await
                })
            })
            .collect::<Vec<_>>();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert!(calls.load(Ordering::SeqCst) >= 1);
        assert_eq!(
            cache.range_by_score_desc(&set, 0, 9).await.unwrap(),
            vec![Member::new(1), Member::new(2)]
        );
        assert_eq!(cache.cardinality(&set).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn loader_failure_leaves_cold() {
        let (warmer, cache) = warmer();
        let set = SetName::from("user:3:posts");

        let result = warmer
            .ensure_warm(&set, || async {
                Err(storage::Error::backend(std::io::Error::other("db down")))
            })
            .await;
        assert!(matches!(result, Err(Error::Loader { .. })));
        assert!(!cache.exists(&set).await.unwrap());
    }
}
