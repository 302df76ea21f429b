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

//! # storage
//!
//! Abstractions for the emberfeed relational storage layer.
//!
//! The relational store is the authoritative one; every cached set is derived from it. Two
//! properties of this contract carry the consistency story:
//!
//! - the `adjust_*` methods are *atomic counter deltas* (`counter = counter + δ`), never
//!   read-modify-write, so concurrent writers can't lose updates;
//! - the `posts_by_*` range queries return rows ordered by popularity descending with ties broken
//!   by id descending-- the same order the cache engines produce-- so a rebuilt set is
//!   indistinguishable from one that stayed warm.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use snafu::{Backtrace, Snafu};

use crate::entities::{FollowEdge, Post, PostId, Tag, Tagname, User, UserId, Username};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Storage backend error: {source}"))]
    Backend {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
        backtrace: Backtrace,
    },
    #[snafu(display("There is no post with id {id}"))]
    NoSuchPost { id: PostId, backtrace: Backtrace },
    #[snafu(display("There is no user with id {id}"))]
    NoSuchUser { id: UserId, backtrace: Backtrace },
    #[snafu(display("The username {username} is already claimed"))]
    UsernameClaimed {
        username: Username,
        backtrace: Backtrace,
    },
}

impl Error {
    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error::Backend {
            source: Box::new(err),
            backtrace: Backtrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Object-safe trait abstracting over the relational storage backend
///
/// Batched lookups (`get_posts_by_ids` & friends) quietly skip ids with no corresponding row;
/// the caller decides whether that's interesting. (For the ranked-read path it isn't: an id in a
/// cached set but not in the store is just a deletion that hasn't been reconciled yet.)
#[async_trait]
pub trait Backend {
    // users

    /// Create a user; assigns the id. Fails with [Error::UsernameClaimed] on a duplicate name.
    async fn add_user(&self, username: &Username) -> Result<User>;
    /// Retrieve a [User] by textual username; `None` means no user by that name.
    async fn user_for_name(&self, name: &str) -> Result<Option<User>>;
    /// Batched user lookup; rows come back in no particular order, absent ids are skipped.
    async fn get_users_by_ids(&self, ids: &[UserId]) -> Result<Vec<User>>;
    /// Every user; the warm-up loader for the global user sets.
    async fn all_users(&self) -> Result<Vec<User>>;
    /// `popularity = popularity + delta`, atomically.
    async fn adjust_user_popularity(&self, id: &UserId, delta: f64) -> Result<()>;

    // posts

    /// Create a post; assigns the id & stamps `created_at`/`expires_at`.
    async fn add_post(
        &self,
        owner: Option<UserId>,
        text: &str,
        tags: &[Tagname],
        lifetime: Duration,
    ) -> Result<Post>;
    async fn get_post(&self, id: &PostId) -> Result<Option<Post>>;
    /// Batched post lookup; absent ids are skipped.
    async fn get_posts_by_ids(&self, ids: &[PostId]) -> Result<Vec<Post>>;
    /// Remove the row (votes & pins go with it); returns the removed post so the caller can
    /// clean up derived state. `None` if there was nothing to delete.
    async fn delete_post(&self, id: &PostId) -> Result<Option<Post>>;
    /// Live (unexpired as-of `now`) posts filed under `owner`, ordered popularity descending,
    /// ties by id descending. Anonymous posts are filed under [UserId::ANONYMOUS].
    async fn posts_by_owner(&self, owner: &UserId, now: &DateTime<Utc>) -> Result<Vec<Post>>;
    /// Live posts carrying `tag`, same ordering contract as [posts_by_owner](Backend::posts_by_owner).
    async fn posts_by_tag(&self, tag: &Tagname, now: &DateTime<Utc>) -> Result<Vec<Post>>;
    /// Posts whose `expires_at` has passed; the sweep's work-list.
    async fn expired_posts(&self, now: &DateTime<Utc>) -> Result<Vec<Post>>;
    /// `voted_count += d_voted; downvoted_count += d_downvoted`, atomically, saturating at zero.
    async fn adjust_post_counters(
        &self,
        id: &PostId,
        d_voted: i64,
        d_downvoted: i64,
    ) -> Result<()>;
    /// `expires_at += delta`, atomically (`delta` may be negative).
    async fn shift_post_expiry(&self, id: &PostId, delta: Duration) -> Result<()>;

    // votes

    /// Upsert the (user, post) vote record to `is_positive` & return the *previous* polarity
    /// (`None` covers both "no record yet" and "record with no polarity"-- the transition
    /// arithmetic treats them identically).
    async fn set_vote(
        &self,
        user: &UserId,
        post: &PostId,
        is_positive: Option<bool>,
    ) -> Result<Option<bool>>;
    /// `user`'s recorded polarity for each of `posts` (absent records are simply missing keys).
    async fn votes_by_user(
        &self,
        user: &UserId,
        posts: &[PostId],
    ) -> Result<HashMap<PostId, Option<bool>>>;

    // follows

    /// Record `follower` following `followee`. Returns false (and changes nothing) if the edge
    /// already existed.
    async fn add_follow(&self, follower: &UserId, followee: &UserId) -> Result<bool>;
    /// Destroy the edge. Returns false (and changes nothing) if there was no such edge.
    async fn remove_follow(&self, follower: &UserId, followee: &UserId) -> Result<bool>;
    /// Edges pointing *at* `followee`, most recent first.
    async fn followers_of(&self, followee: &UserId) -> Result<Vec<FollowEdge>>;
    /// Edges pointing *out of* `follower`, most recent first.
    async fn followees_of(&self, follower: &UserId) -> Result<Vec<FollowEdge>>;
    /// Which of `candidates` does `follower` follow?
    async fn followee_filter(
        &self,
        follower: &UserId,
        candidates: &[UserId],
    ) -> Result<HashSet<UserId>>;

    // tags

    /// Create the [Tag] row if it isn't there; either way, return it. Two callers racing to
    /// introduce the same tag must both succeed (the loser observing the winner's row).
    async fn create_tag_if_absent(&self, title: &Tagname) -> Result<Tag>;
    async fn get_tag(&self, title: &Tagname) -> Result<Option<Tag>>;
    /// `total_posts += delta`, atomically, saturating at zero.
    async fn adjust_tag_total_posts(&self, title: &Tagname, delta: i64) -> Result<()>;

    // pinned & hidden posts

    async fn pin_post(&self, user: &UserId, post: &PostId) -> Result<()>;
    async fn unpin_post(&self, user: &UserId, post: &PostId) -> Result<()>;
    /// Which of `candidates` has `user` pinned?
    async fn pinned_filter(&self, user: &UserId, candidates: &[PostId]) -> Result<HashSet<PostId>>;
    async fn hide_post(&self, user: &UserId, post: &PostId) -> Result<()>;
    async fn unhide_post(&self, user: &UserId, post: &PostId) -> Result<()>;
    /// Which of `candidates` has `user` hidden?
    async fn hidden_filter(&self, user: &UserId, candidates: &[PostId]) -> Result<HashSet<PostId>>;
}
