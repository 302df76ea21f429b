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

//! # popularity
//!
//! The update protocol keeping the relational counters & the cached ranked sets in agreement.
//!
//! ## The choke point
//!
//! Every domain operation that affects a ranking-- posting, deleting, voting, following,
//! unfollowing-- goes through [PopularityLedger], as an ordinary method call made by the request
//! handler *after* its own validation. Nothing updates a counter or a cached set from anywhere
//! else; ordering & failure handling are visible right here rather than buried in storage-layer
//! hooks.
//!
//! ## Failure discipline
//!
//! Within each operation the relational store commits first. Cache updates follow & are
//! *non-fatal*: every cached set can be rebuilt from the relational store, so on a cache failure
//! we log, leave the set to be rebuilt (or merely stale until its next update), & let the
//! operation succeed. A relational failure, by contrast, propagates: the event is considered
//! unprocessed & may be retried wholesale-- counter updates are atomic deltas, so the math is
//! commutative with whatever else happened in the meantime.
//!
//! ## Cold sets stay cold
//!
//! Incremental updates only touch sets that are already warm (with one exception: creating a
//! post warms its owner's & tags' sets first, since we're about to read them anyway). A cold set
//! needs no maintenance-- its next warm-up reads the relational store, which this module just
//! finished updating.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use snafu::{prelude::*, Backtrace};
use tracing::{debug, info, warn};

use emberfeed_cache::{
    store::Backend as CacheBackend,
    types::{Member, SetName},
};

use crate::{
    background_tasks::{self, Context, DeliverNotification, Sender, Task, TaskQueue},
    counter_add,
    entities::{
        all_users_key, default_lifetime, extract_hashtags, extract_mentions,
        users_by_popularity_key, Post, PostId, Tagname, User, UserId, Username, Vote,
    },
    metrics::{self, Instruments, Sort},
    notifications::{crossed_milestone, Event, Notification},
    storage::{self, Backend as StorageBackend},
    warmer::CacheWarmer,
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{source}"))]
    Post { source: crate::entities::Error },
    #[snafu(display("Storage error: {source}"))]
    Storage { source: storage::Error },
    #[snafu(display("There is no post with id {id}"))]
    UnknownPost { id: PostId, backtrace: Backtrace },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        vote arithmetic                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

fn polarity_counts(polarity: Option<bool>) -> (i64, i64) {
    match polarity {
        Some(true) => (1, 0),
        Some(false) => (0, 1),
        None => (0, 0),
    }
}

/// The (voted_count, downvoted_count) adjustment for a polarity transition
///
/// Computed as the difference of the counter contributions of the new & old polarities, which
/// covers all nine transitions: e.g. unset → up is (+1, 0), up → down is (−1, +1), down → unset
/// is (0, −1), anything → itself is (0, 0).
pub fn vote_count_deltas(old: Option<bool>, new: Option<bool>) -> (i64, i64) {
    let (old_up, old_down) = polarity_counts(old);
    let (new_up, new_down) = polarity_counts(new);
    (new_up - old_up, new_down - old_down)
}

/// Rank-set entries for a batch of posts, ready for a bulk load
pub fn rank_entries(posts: &[Post]) -> Vec<(f64, Member)> {
    posts
        .iter()
        .map(|post| (post.popularity() as f64, Member::from(post.id)))
        .collect()
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       PopularityLedger                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { metrics::Registration::new("ledger.users.registered", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("ledger.posts.created", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("ledger.posts.deleted", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("ledger.votes.cast", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("ledger.follows.created", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("ledger.follows.destroyed", Sort::IntegralCounter) }

/// What [cast_vote](PopularityLedger::cast_vote) leaves behind
#[derive(Clone, Copy, Debug)]
pub struct VoteReceipt {
    pub vote: Vote,
    pub voted_count: u32,
    pub downvoted_count: u32,
}

pub struct PopularityLedger {
    storage: Arc<dyn StorageBackend + Send + Sync>,
    cache: Arc<dyn CacheBackend + Send + Sync>,
    warmer: CacheWarmer,
    tasks: Arc<TaskQueue<Context>>,
    instruments: Arc<Instruments>,
}

impl PopularityLedger {
    pub fn new(
        storage: Arc<dyn StorageBackend + Send + Sync>,
        cache: Arc<dyn CacheBackend + Send + Sync>,
        warmer: CacheWarmer,
        tasks: Arc<TaskQueue<Context>>,
        instruments: Arc<Instruments>,
    ) -> PopularityLedger {
        PopularityLedger {
            storage,
            cache,
            warmer,
            tasks,
            instruments,
        }
    }

    /// Create a user & (best-effort) admit them to the global user sets.
    pub async fn register_user(&self, username: &Username) -> Result<User> {
        let user = self
            .storage
            .add_user(username)
            .await
            .context(StorageSnafu)?;

        // Only if the global sets are warm; a cold set's next warm-up will pick the row up from
        // the store.
        self.if_warm(&all_users_key(), |cache, key| async move {
            cache.add_members(&key, &[Member::from(user.id)]).await
        })
        .await;
        self.if_warm(&users_by_popularity_key(), |cache, key| async move {
            cache
                .upsert(&key, user.popularity, Member::from(user.id))
                .await
        })
        .await;

        info!("Registered user {} ({})", user.username, user.id);
        counter_add!(self.instruments, "ledger.users.registered", 1, &[]);
        Ok(user)
    }

    /// Create a post: tag rows & counters, the owner's popularity, the ranked sets, mention
    /// notifications. Anonymous posts (`owner` = `None`) rank under [UserId::ANONYMOUS].
    pub async fn create_post(&self, owner: Option<UserId>, text: &str) -> Result<Post> {
        Post::check_text(text).context(PostSnafu)?;
        let tags = extract_hashtags(text);

        // Tag rows first; two posts racing to introduce the same tag must both land, so creation
        // is create-if-absent.
        for tag in &tags {
            self.storage
                .create_tag_if_absent(tag)
                .await
                .context(StorageSnafu)?;
        }

        let post = self
            .storage
            .add_post(owner, text, &tags, default_lifetime())
            .await
            .context(StorageSnafu)?;
        let ranking_owner = post.ranking_owner();

        self.storage
            .adjust_user_popularity(&ranking_owner, 1.0)
            .await
            .context(StorageSnafu)?;
        for tag in &tags {
            self.storage
                .adjust_tag_total_posts(tag, 1)
                .await
                .context(StorageSnafu)?;
        }

        // Relational state is settled; everything from here down is best-effort cache & fan-out.

        let score = post.popularity() as f64;
        let owner_key = ranking_owner.posts_key();
        if self.warm_posts_by_owner(&ranking_owner).await {
            self.log_cache(
                &owner_key,
                self.cache
                    .upsert(&owner_key, score, Member::from(post.id))
                    .await,
            );
        }
        self.if_warm(&users_by_popularity_key(), |cache, key| async move {
            cache
                .increment_score(&key, Member::from(ranking_owner), 1.0)
                .await
                .map(|_| ())
        })
        .await;
        for tag in &tags {
            let tag_key = tag.posts_key();
            if self.warm_posts_by_tag(tag).await {
                self.log_cache(
                    &tag_key,
                    self.cache
                        .upsert(&tag_key, score, Member::from(post.id))
                        .await,
                );
            }
        }

        for mentioned in extract_mentions(text) {
            match self.storage.user_for_name(mentioned.as_ref()).await {
                Ok(Some(user)) => {
                    self.notify(Notification {
                        user: user.id,
                        message: "You were mentioned in a post".to_owned(),
                        event: Event::MentionedInPost { post: post.id },
                    })
                    .await
                }
                Ok(None) => debug!("Mentioned user {mentioned} doesn't exist; skipping"),
                Err(err) => warn!("Couldn't resolve mentioned user {mentioned}: {err}"),
            }
        }

        counter_add!(self.instruments, "ledger.posts.created", 1, &[]);
        Ok(post)
    }

    /// Destroy a post, removing it from its owner's set & from every tag set it belonged to.
    /// Returns the removed post, or `None` if there was nothing to remove (deleting twice is
    /// safe-- the expiry sweep & an impatient user may race).
    pub async fn delete_post(&self, id: &PostId) -> Result<Option<Post>> {
        let post = match self.storage.delete_post(id).await.context(StorageSnafu)? {
            Some(post) => post,
            None => return Ok(None),
        };
        let ranking_owner = post.ranking_owner();

        self.storage
            .adjust_user_popularity(&ranking_owner, -1.0)
            .await
            .context(StorageSnafu)?;
        for tag in &post.tags {
            self.storage
                .adjust_tag_total_posts(tag, -1)
                .await
                .context(StorageSnafu)?;
        }

        let member = Member::from(post.id);
        let owner_key = ranking_owner.posts_key();
        self.log_cache(&owner_key, self.cache.remove(&owner_key, member).await);
        for tag in &post.tags {
            let tag_key = tag.posts_key();
            self.log_cache(&tag_key, self.cache.remove(&tag_key, member).await);
        }
        self.if_warm(&users_by_popularity_key(), |cache, key| async move {
            cache
                .increment_score(&key, Member::from(ranking_owner), -1.0)
                .await
                .map(|_| ())
        })
        .await;

        counter_add!(self.instruments, "ledger.posts.deleted", 1, &[]);
        Ok(Some(post))
    }

    /// Record `voter`'s polarity on a post & adjust every affected counter by the *transition*,
    /// not a flat increment. An upvote buys the post five more minutes; a downvote costs it ten.
    pub async fn cast_vote(
        &self,
        voter: &UserId,
        post: &PostId,
        is_positive: Option<bool>,
    ) -> Result<VoteReceipt> {
        let row = self
            .storage
            .get_post(post)
            .await
            .context(StorageSnafu)?
            .context(UnknownPostSnafu { id: *post })?;

        let old = self
            .storage
            .set_vote(voter, post, is_positive)
            .await
            .context(StorageSnafu)?;
        let (d_voted, d_downvoted) = vote_count_deltas(old, is_positive);
        if (d_voted, d_downvoted) != (0, 0) {
            self.storage
                .adjust_post_counters(post, d_voted, d_downvoted)
                .await
                .context(StorageSnafu)?;
        }
        match is_positive {
            Some(true) => self
                .storage
                .shift_post_expiry(post, chrono::Duration::minutes(5))
                .await
                .context(StorageSnafu)?,
            Some(false) => self
                .storage
                .shift_post_expiry(post, chrono::Duration::minutes(-10))
                .await
                .context(StorageSnafu)?,
            None => (),
        }

        let score_delta = (d_voted - d_downvoted) as f64;
        if score_delta != 0.0 {
            let member = Member::from(*post);
            // The owner's set, plus every *warm* tag set this post appears in. Cold sets are
            // left alone; their next rebuild reads the counters we just wrote.
            let owner_key = row.ranking_owner().posts_key();
            self.if_warm(&owner_key, |cache, key| async move {
                cache.increment_score(&key, member, score_delta).await.map(|_| ())
            })
            .await;
            for tag in &row.tags {
                let tag_key = tag.posts_key();
                self.if_warm(&tag_key, |cache, key| async move {
                    cache.increment_score(&key, member, score_delta).await.map(|_| ())
                })
                .await;
            }
        }

        let voted_count = (row.voted_count as i64 + d_voted).max(0) as u32;
        let downvoted_count = (row.downvoted_count as i64 + d_downvoted).max(0) as u32;
        if let (Some(owner), Some(milestone)) = (
            row.owner,
            crossed_milestone(row.voted_count, voted_count),
        ) {
            self.notify(Notification {
                user: owner,
                message: format!("Your post reached {milestone} votes"),
                event: Event::VotesReached {
                    post: *post,
                    milestone,
                },
            })
            .await;
        }

        counter_add!(self.instruments, "ledger.votes.cast", 1, &[]);
        Ok(VoteReceipt {
            vote: Vote {
                user: *voter,
                post: *post,
                is_positive,
            },
            voted_count,
            downvoted_count,
        })
    }

    /// Record `follower` following `followee`; returns false if the edge already existed (in
    /// which case nothing changes-- following twice is not twice as flattering).
    pub async fn follow(&self, follower: &UserId, followee: &UserId) -> Result<bool> {
        if !self
            .storage
            .add_follow(follower, followee)
            .await
            .context(StorageSnafu)?
        {
            return Ok(false);
        }
        self.storage
            .adjust_user_popularity(followee, 1.0)
            .await
            .context(StorageSnafu)?;

        let stamp = Utc::now().timestamp() as f64;
        let followee = *followee;
        let follower = *follower;
        self.if_warm(&users_by_popularity_key(), |cache, key| async move {
            cache
                .increment_score(&key, Member::from(followee), 1.0)
                .await
                .map(|_| ())
        })
        .await;
        self.if_warm(&followee.followers_key(), |cache, key| async move {
            cache.upsert(&key, stamp, Member::from(follower)).await
        })
        .await;
        self.if_warm(&follower.followees_key(), |cache, key| async move {
            cache.upsert(&key, stamp, Member::from(followee)).await
        })
        .await;

        self.notify(Notification {
            user: followee,
            message: format!("User {follower} started following you"),
            event: Event::StartedFollow { follower },
        })
        .await;

        counter_add!(self.instruments, "ledger.follows.created", 1, &[]);
        Ok(true)
    }

    /// Destroy the follow edge; the mirror image of [follow](PopularityLedger::follow).
    pub async fn unfollow(&self, follower: &UserId, followee: &UserId) -> Result<bool> {
        if !self
            .storage
            .remove_follow(follower, followee)
            .await
            .context(StorageSnafu)?
        {
            return Ok(false);
        }
        self.storage
            .adjust_user_popularity(followee, -1.0)
            .await
            .context(StorageSnafu)?;

        let followee = *followee;
        let follower = *follower;
        self.if_warm(&users_by_popularity_key(), |cache, key| async move {
            cache
                .increment_score(&key, Member::from(followee), -1.0)
                .await
                .map(|_| ())
        })
        .await;
        self.if_warm(&followee.followers_key(), |cache, key| async move {
            cache.remove(&key, Member::from(follower)).await
        })
        .await;
        self.if_warm(&follower.followees_key(), |cache, key| async move {
            cache.remove(&key, Member::from(followee)).await
        })
        .await;

        counter_add!(self.instruments, "ledger.follows.destroyed", 1, &[]);
        Ok(true)
    }

    // Internal helpers

    /// Warm the owner's post set; returns whether the set is usable. A warm-up failure is a
    /// cache problem, & cache problems don't fail ledger operations.
    async fn warm_posts_by_owner(&self, owner: &UserId) -> bool {
        let storage = self.storage.clone();
        let owner = *owner;
        let outcome = self
            .warmer
            .ensure_warm(&owner.posts_key(), || async move {
                let now = Utc::now();
                Ok(rank_entries(&storage.posts_by_owner(&owner, &now).await?))
            })
            .await;
        match outcome {
            Ok(()) => true,
            Err(err) => {
                warn!("Couldn't warm {}: {err}", owner.posts_key());
                false
            }
        }
    }

    async fn warm_posts_by_tag(&self, tag: &Tagname) -> bool {
        let storage = self.storage.clone();
        let tag = tag.clone();
        let key = tag.posts_key();
        let outcome = self
            .warmer
            .ensure_warm(&key, || async move {
                let now = Utc::now();
                Ok(rank_entries(&storage.posts_by_tag(&tag, &now).await?))
            })
            .await;
        match outcome {
            Ok(()) => true,
            Err(err) => {
                warn!("Couldn't warm {key}: {err}");
                false
            }
        }
    }

    /// Run `op` against the cache only if `key` is already warm; all failures are logged &
    /// swallowed.
    async fn if_warm<F, Fut>(&self, key: &SetName, op: F)
    where
        F: FnOnce(Arc<dyn CacheBackend + Send + Sync>, SetName) -> Fut,
        Fut: std::future::Future<Output = emberfeed_cache::store::Result<()>>,
    {
        match self.cache.exists(key).await {
            Ok(true) => {
                let outcome = op(self.cache.clone(), key.clone()).await;
                self.log_cache(key, outcome);
            }
            Ok(false) => (),
            Err(err) => warn!("Couldn't probe {key}: {err}; skipping the cache update"),
        }
    }

    fn log_cache(&self, key: &SetName, outcome: emberfeed_cache::store::Result<()>) {
        if let Err(err) = outcome {
            warn!("Cache update on {key} failed: {err}; the set will be stale until rebuilt");
        }
    }

    async fn notify(&self, notification: Notification) {
        if let Err(err) = self.tasks.send(DeliverNotification { notification }).await {
            warn!("Failed to enqueue a notification: {err}");
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       the expiry sweep                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Delete every expired post, through the ledger so each one is scrubbed from its ranked sets
///
/// Enqueue one of these periodically; each run derives its work-list from the store, so a missed
/// or repeated run is harmless.
pub struct SweepExpiredPosts;

#[async_trait]
impl Task<Context> for SweepExpiredPosts {
    async fn exec(self: Box<Self>, context: Context) -> background_tasks::Result<()> {
        let now = Utc::now();
        let expired = context
            .storage
            .expired_posts(&now)
            .await
            .map_err(background_tasks::Error::new)?;
        if expired.is_empty() {
            return Ok(());
        }
        info!("Removing {} expired posts", expired.len());
        for post in expired {
            debug!("Deleting expired post {}", post.id);
            context
                .ledger
                .delete_post(&post.id)
                .await
                .map_err(background_tasks::Error::new)?;
        }
        Ok(())
    }
    fn timeout(&self) -> Option<std::time::Duration> {
        Some(std::time::Duration::from_secs(60))
    }
}

#[cfg(test)]
mod check_vote_deltas {
    use super::*;

    // The full transition table, spelled out; re-voting adjusts by the difference, so any path
    // through the states leaves the counters where a direct jump would have.
    #[test]
    fn exhaustive() {
        let expected = [
            (None, None, (0, 0)),
            (None, Some(true), (1, 0)),
            (None, Some(false), (0, 1)),
            (Some(true), None, (-1, 0)),
            (Some(true), Some(true), (0, 0)),
            (Some(true), Some(false), (-1, 1)),
            (Some(false), None, (0, -1)),
            (Some(false), Some(true), (1, -1)),
            (Some(false), Some(false), (0, 0)),
        ];
        for (old, new, deltas) in expected {
            assert_eq!(vote_count_deltas(old, new), deltas, "{old:?} -> {new:?}");
        }
    }

    #[test]
    fn transitions_compose() {
        // Walking every polarity pair in sequence nets out to the counts of the final state.
        let states = [None, Some(true), Some(false)];
        for first in states {
            for second in states {
                let (mut up, mut down) = (0i64, 0i64);
                let (d1, d2) = vote_count_deltas(None, first);
                up += d1;
                down += d2;
                let (d1, d2) = vote_count_deltas(first, second);
                up += d1;
                down += d2;
                assert_eq!((up, down), polarity_counts(second));
            }
        }
    }
}
