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

//! # feed
//!
//! The discovery feed: mostly the most popular users, leavened with a random sample so the same
//! dozen celebrities don't monopolize every page.
//!
//! Each page of ten is seven ranked slots & three random ones, the randoms sitting after the
//! seventh ranked entry of their block; the ratio holds for every full block of ten, with only a
//! final partial block allowed to deviate. The random sample is drawn oversized & any id already
//! present among the page's popular ids is discarded, so a page never shows the same user twice.
//! A sparse instance simply yields short pages-- never padding, never an error.
//!
//! The reported total is the cardinality of the global popularity set. When the random pool runs
//! dry that over- or under-counts what's actually reachable by paging; this is a known, accepted
//! approximation & deliberately not "fixed".

use std::{collections::HashSet, sync::Arc};

use snafu::{prelude::*, Snafu};
use tracing::warn;

use emberfeed_cache::{store::Backend as CacheBackend, types::Member};

use crate::{
    counter_add,
    entities::{all_users_key, users_by_popularity_key, UserId},
    metrics::{self, Instruments, Sort},
    ranked::{RankedQuery, UserView},
    storage::{self, Backend as StorageBackend},
    warmer::CacheWarmer,
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{source}"))]
    Ranked { source: crate::ranked::Error },
    #[snafu(display("Storage error: {source}"))]
    Storage { source: storage::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////

/// Pages can be no larger than this
pub const MAX_PAGE_SIZE: usize = 250;

/// Random slots per block of ten
const RANDOM_PER_TEN: usize = 3;

/// Oversampling factor for the random draw, to survive collisions with the popular window
const OVERSAMPLE: usize = 2;

/// One page of the discovery feed
#[derive(Clone, Debug)]
pub struct FeedPage {
    /// Cardinality of the global popularity set (see the module docs for the sense in which
    /// this is approximate)
    pub total: u64,
    pub users: Vec<UserView>,
}

/// Where the random slots sit: after every seventh popular entry, up to three randoms; once the
/// popular sequence is exhausted, whatever randoms remain go at the tail.
fn interleave(popular: &[Member], random: &[Member]) -> Vec<Member> {
    let mut out = Vec::with_capacity(popular.len() + random.len());
    let mut random = random.iter();
    for (i, member) in popular.iter().enumerate() {
        out.push(*member);
        if (i + 1) % (10 - RANDOM_PER_TEN) == 0 {
            out.extend(random.by_ref().take(RANDOM_PER_TEN));
        }
    }
    out.extend(random);
    out
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          FeedComposer                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { metrics::Registration::new("feed.pages.served", Sort::IntegralCounter) }

pub struct FeedComposer {
    storage: Arc<dyn StorageBackend + Send + Sync>,
    cache: Arc<dyn CacheBackend + Send + Sync>,
    warmer: CacheWarmer,
    ranked: Arc<RankedQuery>,
    instruments: Arc<Instruments>,
}

impl FeedComposer {
    pub fn new(
        storage: Arc<dyn StorageBackend + Send + Sync>,
        cache: Arc<dyn CacheBackend + Send + Sync>,
        warmer: CacheWarmer,
        ranked: Arc<RankedQuery>,
        instruments: Arc<Instruments>,
    ) -> FeedComposer {
        FeedComposer {
            storage,
            cache,
            warmer,
            ranked,
            instruments,
        }
    }

    /// Compose page `page` (zero-based) of the discovery feed, `page_size` entries to the page
    /// (capped at [MAX_PAGE_SIZE]).
    pub async fn compose(
        &self,
        page: usize,
        page_size: usize,
        viewer: Option<&UserId>,
    ) -> Result<FeedPage> {
        let page_size = std::cmp::min(page_size, MAX_PAGE_SIZE);
        if page_size == 0 {
            return Ok(FeedPage {
                total: self.total().await?,
                users: Vec::new(),
            });
        }
        let random_count = page_size / 10 * RANDOM_PER_TEN;
        let popular_slots = page_size - random_count;

        // The popular window for this page, from the global ranking (RankedQuery handles
        // warm-up & the degraded path).
        let storage = self.storage.clone();
        let popular = self
            .ranked
            .ranked_ids(
                &users_by_popularity_key(),
                page * popular_slots,
                (page + 1) * popular_slots - 1,
                || {
                    let storage = storage.clone();
                    async move {
                        Ok(storage
                            .all_users()
                            .await?
                            .into_iter()
                            .map(|user| (user.popularity, Member::from(user.id)))
                            .collect())
                    }
                },
            )
            .await
            .context(RankedSnafu)?;

        // An empty popular window means we've paged past the data; returning an empty page (and
        // not padding it with randoms) is what lets a paginating client terminate.
        if popular.is_empty() {
            return Ok(FeedPage {
                total: self.total().await?,
                users: Vec::new(),
            });
        }

        // The random draw: oversampled, minus anybody already in the popular window, truncated.
        // If the pool can't be had (cache down), the page just runs popular-only.
        let random = if random_count > 0 {
            match self.random_sample(random_count, &popular).await {
                Ok(random) => random,
                Err(err) => {
                    warn!("No random pool for this page: {err}");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let ids = interleave(&popular, &random);
        let users = self
            .ranked
            .compose_users(&ids, viewer)
            .await
            .context(RankedSnafu)?;
        counter_add!(self.instruments, "feed.pages.served", 1, &[]);
        Ok(FeedPage {
            total: self.total().await?,
            users,
        })
    }

    async fn random_sample(
        &self,
        random_count: usize,
        popular: &[Member],
    ) -> std::result::Result<Vec<Member>, Box<dyn std::error::Error + Send + Sync>> {
        let key = all_users_key();
        let storage = self.storage.clone();
        self.warmer
            .ensure_members_warm(&key, || async move {
                Ok(storage
                    .all_users()
                    .await?
                    .into_iter()
                    .map(|user| Member::from(user.id))
                    .collect())
            })
            .await?;
        let taken = popular.iter().collect::<HashSet<&Member>>();
        Ok(self
            .cache
            .random_members(&key, OVERSAMPLE * random_count)
            .await?
            .into_iter()
            .filter(|member| !taken.contains(member))
            .take(random_count)
            .collect())
    }

    /// The feed's reported total; falls back to a relational count if the cache is out.
    async fn total(&self) -> Result<u64> {
        match self.cache.cardinality(&users_by_popularity_key()).await {
            Ok(total) => Ok(total),
            Err(err) => {
                warn!("Couldn't read the global set's cardinality: {err}; counting rows");
                Ok(self.storage.all_users().await.context(StorageSnafu)?.len() as u64)
            }
        }
    }
}

#[cfg(test)]
mod check_interleave {
    use super::*;

    fn members(ids: std::ops::Range<u64>) -> Vec<Member> {
        ids.map(Member::new).collect()
    }

    #[test]
    fn full_page() {
        // 7 popular (1..8), 3 random (100..103): randoms sit after the seventh.
        let page = interleave(&members(1..8), &members(100..103));
        assert_eq!(
            page.iter().map(|m| m.get()).collect::<Vec<u64>>(),
            vec![1, 2, 3, 4, 5, 6, 7, 100, 101, 102]
        );
    }

    #[test]
    fn two_blocks() {
        let page = interleave(&members(1..15), &members(100..106));
        let raw = page.iter().map(|m| m.get()).collect::<Vec<u64>>();
        assert_eq!(
            raw,
            vec![1, 2, 3, 4, 5, 6, 7, 100, 101, 102, 8, 9, 10, 11, 12, 13, 14, 103, 104, 105]
        );
    }

    #[test]
    fn random_pool_runs_dry() {
        let page = interleave(&members(1..15), &members(100..101));
        assert_eq!(page.len(), 15);
        assert_eq!(page[7].get(), 100); // the one random we had, in its slot
    }

    #[test]
    fn popular_runs_dry() {
        // Leftover randoms go at the tail rather than being dropped.
        let page = interleave(&members(1..4), &members(100..103));
        assert_eq!(
            page.iter().map(|m| m.get()).collect::<Vec<u64>>(),
            vec![1, 2, 3, 100, 101, 102]
        );
    }

    #[test]
    fn no_pools_no_page() {
        assert!(interleave(&[], &[]).is_empty());
    }
}
