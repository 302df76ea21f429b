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

//! # ranked
//!
//! Reads over the cached ranked sets, joined back to full rows.
//!
//! The read path is: warm the set if it's cold, take a rank range from the cache, then one
//! batched relational fetch to materialize rows-- *preserving the cache's order*, which is the
//! ranking; the relational store's natural order is nobody's business. Two deliberate softnesses:
//!
//! - An id in the cache with no row behind it is a deletion some other set hasn't heard about
//!   yet. It's filtered out, silently. Reconciliation happens at the next rebuild, not here.
//! - If the cache is unreachable, the same range is computed straight from the relational store.
//!   Readers never see an error because a cache was cold, stale or down; the worst they see is
//!   ranking staleness.
//!
//! Results come back as view-model structs ([PostView], [UserView]) with the viewer-dependent
//! flags (`is_pinned`, `is_followee`, ...) strongly typed, rather than as maps decorated after
//! the fact.

use std::{collections::HashMap, future::Future, sync::Arc};

use chrono::{DateTime, Utc};
use serde::Serialize;
use snafu::{prelude::*, Snafu};
use tracing::warn;

use emberfeed_cache::{
    store::Backend as CacheBackend,
    types::{Member, SetName},
};

use crate::{
    counter_add,
    entities::{users_by_popularity_key, Post, PostId, Tagname, UserId, Username},
    metrics::{self, Instruments, Sort},
    popularity::rank_entries,
    storage::{self, Backend as StorageBackend},
    warmer::{self, CacheWarmer},
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Storage error: {source}"))]
    Storage { source: storage::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          view models                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, Serialize)]
pub struct AuthorView {
    /// `None` for anonymous posts (and for authors who've since vanished)
    pub id: Option<UserId>,
    pub username: String,
}

/// A post, ready for presentation
#[derive(Clone, Debug, Serialize)]
pub struct PostView {
    pub id: PostId,
    pub text: String,
    pub author: AuthorView,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub voted_count: u32,
    pub downvoted_count: u32,
    pub is_pinned: bool,
    pub is_upvoted: bool,
    pub is_downvoted: bool,
}

/// A user, ready for presentation
#[derive(Clone, Debug, Serialize)]
pub struct UserView {
    pub id: UserId,
    pub username: Username,
    pub popularity: f64,
    pub is_followee: bool,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          RankedQuery                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { metrics::Registration::new("ranked.degraded.reads", Sort::IntegralCounter) }

pub struct RankedQuery {
    storage: Arc<dyn StorageBackend + Send + Sync>,
    cache: Arc<dyn CacheBackend + Send + Sync>,
    warmer: CacheWarmer,
    instruments: Arc<Instruments>,
}

impl RankedQuery {
    pub fn new(
        storage: Arc<dyn StorageBackend + Send + Sync>,
        cache: Arc<dyn CacheBackend + Send + Sync>,
        warmer: CacheWarmer,
        instruments: Arc<Instruments>,
    ) -> RankedQuery {
        RankedQuery {
            storage,
            cache,
            warmer,
            instruments,
        }
    }

    /// Ranked member ids in `[start, end]` from the named set, warming it first. `loader` is the
    /// set's rebuild recipe against the relational store; it also serves as the degraded read
    /// path when the cache is unreachable.
    pub async fn ranked_ids<F, Fut>(
        &self,
        key: &SetName,
        start: usize,
        end: usize,
        loader: F,
    ) -> Result<Vec<Member>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = storage::Result<Vec<(f64, Member)>>>,
    {
        match self.warmer.ensure_warm(key, &loader).await {
            Ok(()) => match self.cache.range_by_score_desc(key, start, end).await {
                Ok(members) => return Ok(members),
                Err(err) => warn!("Range over {key} failed: {err}; going to the store"),
            },
            // Couldn't warm because the *loader* failed: the store itself is in trouble, and
            // there's nothing to degrade to.
            Err(warmer::Error::Loader { source, .. }) => return Err(Error::Storage { source }),
            Err(err) => warn!("{err}; going to the store"),
        }

        // Degraded path: same range, computed directly from the authoritative store.
        counter_add!(self.instruments, "ranked.degraded.reads", 1, &[]);
        let mut entries = loader().await.context(StorageSnafu)?;
        entries.sort_unstable_by(|a, b| {
            b.0.total_cmp(&a.0).then(b.1.cmp(&a.1))
        });
        if end < start {
            return Ok(Vec::new());
        }
        Ok(entries
            .into_iter()
            .skip(start)
            .take(end - start + 1)
            .map(|(_, member)| member)
            .collect())
    }

    /// Top of `owner`'s post set; `viewer` drives the per-viewer flags & hides what they've
    /// hidden.
    pub async fn top_posts(
        &self,
        owner: &UserId,
        start: usize,
        end: usize,
        viewer: Option<&UserId>,
    ) -> Result<Vec<PostView>> {
        let storage = self.storage.clone();
        let owner = *owner;
        let ids = self
            .ranked_ids(&owner.posts_key(), start, end, || {
                let storage = storage.clone();
                async move {
                    let now = Utc::now();
                    Ok(rank_entries(&storage.posts_by_owner(&owner, &now).await?))
                }
            })
            .await?;
        self.compose_posts(&ids, viewer).await
    }

    /// Top of `tag`'s post set.
    pub async fn tag_posts(
        &self,
        tag: &Tagname,
        start: usize,
        end: usize,
        viewer: Option<&UserId>,
    ) -> Result<Vec<PostView>> {
        let storage = self.storage.clone();
        let tag = tag.clone();
        let ids = self
            .ranked_ids(&tag.posts_key(), start, end, || {
                let storage = storage.clone();
                let tag = tag.clone();
                async move {
                    let now = Utc::now();
                    Ok(rank_entries(&storage.posts_by_tag(&tag, &now).await?))
                }
            })
            .await?;
        self.compose_posts(&ids, viewer).await
    }

    /// The global user ranking.
    pub async fn top_users(
        &self,
        start: usize,
        end: usize,
        viewer: Option<&UserId>,
    ) -> Result<Vec<UserView>> {
        let storage = self.storage.clone();
        let ids = self
            .ranked_ids(&users_by_popularity_key(), start, end, || {
                let storage = storage.clone();
                async move {
                    Ok(storage
                        .all_users()
                        .await?
                        .into_iter()
                        .map(|user| (user.popularity, Member::from(user.id)))
                        .collect())
                }
            })
            .await?;
        self.compose_users(&ids, viewer).await
    }

    /// `user`'s followers, most recent first.
    pub async fn followers(
        &self,
        user: &UserId,
        start: usize,
        end: usize,
        viewer: Option<&UserId>,
    ) -> Result<Vec<UserView>> {
        let storage = self.storage.clone();
        let user = *user;
        let ids = self
            .ranked_ids(&user.followers_key(), start, end, || {
                let storage = storage.clone();
                async move {
                    Ok(storage
                        .followers_of(&user)
                        .await?
                        .into_iter()
                        .map(|edge| {
                            (edge.created_at.timestamp() as f64, Member::from(edge.follower))
                        })
                        .collect())
                }
            })
            .await?;
        self.compose_users(&ids, viewer).await
    }

    /// Users `user` follows, most recent first.
    pub async fn followees(
        &self,
        user: &UserId,
        start: usize,
        end: usize,
        viewer: Option<&UserId>,
    ) -> Result<Vec<UserView>> {
        let storage = self.storage.clone();
        let user = *user;
        let ids = self
            .ranked_ids(&user.followees_key(), start, end, || {
                let storage = storage.clone();
                async move {
                    Ok(storage
                        .followees_of(&user)
                        .await?
                        .into_iter()
                        .map(|edge| {
                            (edge.created_at.timestamp() as f64, Member::from(edge.followee))
                        })
                        .collect())
                }
            })
            .await?;
        self.compose_users(&ids, viewer).await
    }

    /// Materialize post rows for `ids`, preserving that order, dropping ids with no row (stale
    /// cache entries) & posts the viewer has hidden.
    pub async fn compose_posts(
        &self,
        ids: &[Member],
        viewer: Option<&UserId>,
    ) -> Result<Vec<PostView>> {
        let post_ids = ids.iter().map(|m| PostId::from(*m)).collect::<Vec<PostId>>();
        let rows = self
            .storage
            .get_posts_by_ids(&post_ids)
            .await
            .context(StorageSnafu)?;
        let by_id: HashMap<PostId, Post> = rows.into_iter().map(|post| (post.id, post)).collect();

        let hidden = match viewer {
            Some(viewer) => self
                .storage
                .hidden_filter(viewer, &post_ids)
                .await
                .context(StorageSnafu)?,
            None => Default::default(),
        };
        let pinned = match viewer {
            Some(viewer) => self
                .storage
                .pinned_filter(viewer, &post_ids)
                .await
                .context(StorageSnafu)?,
            None => Default::default(),
        };
        let votes = match viewer {
            Some(viewer) => self
                .storage
                .votes_by_user(viewer, &post_ids)
                .await
                .context(StorageSnafu)?,
            None => Default::default(),
        };

        let owner_ids = by_id
            .values()
            .filter_map(|post| post.owner)
            .collect::<Vec<UserId>>();
        let owners = self
            .storage
            .get_users_by_ids(&owner_ids)
            .await
            .context(StorageSnafu)?
            .into_iter()
            .map(|user| (user.id, user))
            .collect::<HashMap<_, _>>();

        Ok(post_ids
            .iter()
            .filter_map(|id| by_id.get(id))
            .filter(|post| !hidden.contains(&post.id))
            .map(|post| {
                let author = match post.owner.and_then(|id| owners.get(&id)) {
                    Some(user) => AuthorView {
                        id: Some(user.id),
                        username: user.username.to_string(),
                    },
                    None => AuthorView {
                        id: None,
                        username: "Anonymous".to_owned(),
                    },
                };
                let polarity = votes.get(&post.id).copied().flatten();
                PostView {
                    id: post.id,
                    text: post.text.clone(),
                    author,
                    created_at: post.created_at,
                    expires_at: post.expires_at,
                    voted_count: post.voted_count,
                    downvoted_count: post.downvoted_count,
                    is_pinned: pinned.contains(&post.id),
                    is_upvoted: polarity == Some(true),
                    is_downvoted: polarity == Some(false),
                }
            })
            .collect())
    }

    /// Materialize user rows for `ids`, preserving that order, dropping stale ids.
    pub async fn compose_users(
        &self,
        ids: &[Member],
        viewer: Option<&UserId>,
    ) -> Result<Vec<UserView>> {
        let user_ids = ids.iter().map(|m| UserId::from(*m)).collect::<Vec<UserId>>();
        let rows = self
            .storage
            .get_users_by_ids(&user_ids)
            .await
            .context(StorageSnafu)?;
        let by_id = rows
            .into_iter()
            .map(|user| (user.id, user))
            .collect::<HashMap<_, _>>();
        let followees = match viewer {
            Some(viewer) => self
                .storage
                .followee_filter(viewer, &user_ids)
                .await
                .context(StorageSnafu)?,
            None => Default::default(),
        };
        Ok(user_ids
            .iter()
            .filter_map(|id| by_id.get(id))
            .map(|user| UserView {
                id: user.id,
                username: user.username.clone(),
                popularity: user.popularity,
                is_followee: followees.contains(&user.id),
            })
            .collect())
    }
}
