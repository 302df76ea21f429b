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

//! # memory
//!
//! [Backend](crate::storage::Backend) implementation backed by process memory.
//!
//! This serves as the reference implementation of the [storage](crate::storage) contract & as the
//! test-suite's relational store. Ids are assigned from a monotone counter (which the ordering
//! rules depend on); every mutating method takes the write lock once, making each call atomic
//! with respect to the others.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

use crate::{
    entities::{FollowEdge, Post, PostId, Tag, Tagname, User, UserId, Username},
    storage::{
        Backend, Error, NoSuchPostSnafu, NoSuchUserSnafu, Result, UsernameClaimedSnafu,
    },
};

/// Order posts the way the cached sets do: popularity descending, ties by id descending.
fn rank_order(posts: &mut [Post]) {
    posts.sort_unstable_by(|a, b| {
        b.popularity()
            .cmp(&a.popularity())
            .then(b.id.cmp(&a.id))
    });
}

#[derive(Debug, Default)]
struct Inner {
    next_user_id: u64,
    next_post_id: u64,
    users: HashMap<UserId, User>,
    usernames: HashMap<String, UserId>,
    posts: HashMap<PostId, Post>,
    votes: HashMap<(UserId, PostId), Option<bool>>,
    follows: HashMap<(UserId, UserId), FollowEdge>,
    tags: HashMap<Tagname, Tag>,
    pinned: HashMap<UserId, HashSet<PostId>>,
    hidden: HashMap<UserId, HashSet<PostId>>,
}

/// In-memory relational backend
#[derive(Debug)]
pub struct Memory {
    inner: RwLock<Inner>,
}

impl Memory {
    /// A fresh store, pre-seeded with the sentinel row anonymous posts are filed under.
    pub fn new() -> Memory {
        let mut inner = Inner {
            next_user_id: 1,
            next_post_id: 1,
            ..Default::default()
        };
        let anonymous = User {
            id: UserId::ANONYMOUS,
            username: Username::new("Anonymous").unwrap(/* known good */),
            popularity: 0.0,
            created_at: Utc::now(),
        };
        inner
            .usernames
            .insert(anonymous.username.to_string(), anonymous.id);
        inner.users.insert(anonymous.id, anonymous);
        Memory {
            inner: RwLock::new(inner),
        }
    }
}

impl Default for Memory {
    fn default() -> Self {
        Memory::new()
    }
}

#[async_trait]
impl Backend for Memory {
    async fn add_user(&self, username: &Username) -> Result<User> {
        let mut guard = self.inner.write().await;
        if guard.usernames.contains_key(username.as_ref()) {
            return UsernameClaimedSnafu {
                username: username.clone(),
            }
            .fail();
        }
        let id = UserId::new(guard.next_user_id);
        guard.next_user_id += 1;
        let user = User {
            id,
            username: username.clone(),
            popularity: 0.0,
            created_at: Utc::now(),
        };
        guard.usernames.insert(username.to_string(), id);
        guard.users.insert(id, user.clone());
        Ok(user)
    }
    async fn user_for_name(&self, name: &str) -> Result<Option<User>> {
        let guard = self.inner.read().await;
        Ok(guard
            .usernames
            .get(name)
            .and_then(|id| guard.users.get(id))
            .cloned())
    }
    async fn get_users_by_ids(&self, ids: &[UserId]) -> Result<Vec<User>> {
        let guard = self.inner.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| guard.users.get(id))
            .cloned()
            .collect())
    }
    async fn all_users(&self) -> Result<Vec<User>> {
        Ok(self.inner.read().await.users.values().cloned().collect())
    }
    async fn adjust_user_popularity(&self, id: &UserId, delta: f64) -> Result<()> {
        match self.inner.write().await.users.get_mut(id) {
            Some(user) => {
                user.popularity += delta;
                Ok(())
            }
            None => NoSuchUserSnafu { id: *id }.fail(),
        }
    }
    async fn add_post(
        &self,
        owner: Option<UserId>,
        text: &str,
        tags: &[Tagname],
        lifetime: Duration,
    ) -> Result<Post> {
        let mut guard = self.inner.write().await;
        if let Some(owner) = &owner {
            if !guard.users.contains_key(owner) {
                return NoSuchUserSnafu { id: *owner }.fail();
            }
        }
        let id = PostId::new(guard.next_post_id);
        guard.next_post_id += 1;
        let created_at = Utc::now();
        let post = Post {
            id,
            owner,
            text: text.to_owned(),
            voted_count: 0,
            downvoted_count: 0,
            created_at,
            expires_at: created_at + lifetime,
            tags: tags.to_vec(),
        };
        guard.posts.insert(id, post.clone());
        Ok(post)
    }
    async fn get_post(&self, id: &PostId) -> Result<Option<Post>> {
        Ok(self.inner.read().await.posts.get(id).cloned())
    }
    async fn get_posts_by_ids(&self, ids: &[PostId]) -> Result<Vec<Post>> {
        let guard = self.inner.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| guard.posts.get(id))
            .cloned()
            .collect())
    }
    async fn delete_post(&self, id: &PostId) -> Result<Option<Post>> {
        let mut guard = self.inner.write().await;
        let post = guard.posts.remove(id);
        if post.is_some() {
            // Rows referencing the post go with it.
            guard.votes.retain(|(_, p), _| p != id);
            for set in guard.pinned.values_mut() {
                set.remove(id);
            }
            for set in guard.hidden.values_mut() {
                set.remove(id);
            }
        }
        Ok(post)
    }
    async fn posts_by_owner(&self, owner: &UserId, now: &DateTime<Utc>) -> Result<Vec<Post>> {
        let guard = self.inner.read().await;
        let mut posts = guard
            .posts
            .values()
            .filter(|post| post.ranking_owner() == *owner && !post.is_expired(now))
            .cloned()
            .collect::<Vec<Post>>();
        rank_order(&mut posts);
        Ok(posts)
    }
    async fn posts_by_tag(&self, tag: &Tagname, now: &DateTime<Utc>) -> Result<Vec<Post>> {
        let guard = self.inner.read().await;
        let mut posts = guard
            .posts
            .values()
            .filter(|post| post.tags.contains(tag) && !post.is_expired(now))
            .cloned()
            .collect::<Vec<Post>>();
        rank_order(&mut posts);
        Ok(posts)
    }
    async fn expired_posts(&self, now: &DateTime<Utc>) -> Result<Vec<Post>> {
        Ok(self
            .inner
            .read()
            .await
            .posts
            .values()
            .filter(|post| post.is_expired(now))
            .cloned()
            .collect())
    }
    async fn adjust_post_counters(
        &self,
        id: &PostId,
        d_voted: i64,
        d_downvoted: i64,
    ) -> Result<()> {
        match self.inner.write().await.posts.get_mut(id) {
            Some(post) => {
                post.voted_count = (post.voted_count as i64 + d_voted).max(0) as u32;
                post.downvoted_count = (post.downvoted_count as i64 + d_downvoted).max(0) as u32;
                Ok(())
            }
            None => NoSuchPostSnafu { id: *id }.fail(),
        }
    }
    async fn shift_post_expiry(&self, id: &PostId, delta: Duration) -> Result<()> {
        match self.inner.write().await.posts.get_mut(id) {
            Some(post) => {
                post.expires_at += delta;
                Ok(())
            }
            None => NoSuchPostSnafu { id: *id }.fail(),
        }
    }
    async fn set_vote(
        &self,
        user: &UserId,
        post: &PostId,
        is_positive: Option<bool>,
    ) -> Result<Option<bool>> {
        let mut guard = self.inner.write().await;
        if !guard.posts.contains_key(post) {
            return NoSuchPostSnafu { id: *post }.fail();
        }
        Ok(guard
            .votes
            .insert((*user, *post), is_positive)
            .flatten())
    }
    async fn votes_by_user(
        &self,
        user: &UserId,
        posts: &[PostId],
    ) -> Result<HashMap<PostId, Option<bool>>> {
        let guard = self.inner.read().await;
        Ok(posts
            .iter()
            .filter_map(|post| {
                guard
                    .votes
                    .get(&(*user, *post))
                    .map(|polarity| (*post, *polarity))
            })
            .collect())
    }
    async fn add_follow(&self, follower: &UserId, followee: &UserId) -> Result<bool> {
        let mut guard = self.inner.write().await;
        if !guard.users.contains_key(follower) {
            return NoSuchUserSnafu { id: *follower }.fail();
        }
        if !guard.users.contains_key(followee) {
            return NoSuchUserSnafu { id: *followee }.fail();
        }
        let key = (*follower, *followee);
        if guard.follows.contains_key(&key) {
            return Ok(false);
        }
        guard.follows.insert(
            key,
            FollowEdge {
                follower: *follower,
                followee: *followee,
                created_at: Utc::now(),
            },
        );
        Ok(true)
    }
    async fn remove_follow(&self, follower: &UserId, followee: &UserId) -> Result<bool> {
        Ok(self
            .inner
            .write()
            .await
            .follows
            .remove(&(*follower, *followee))
            .is_some())
    }
    async fn followers_of(&self, followee: &UserId) -> Result<Vec<FollowEdge>> {
        let guard = self.inner.read().await;
        let mut edges = guard
            .follows
            .values()
            .filter(|edge| edge.followee == *followee)
            .cloned()
            .collect::<Vec<FollowEdge>>();
        edges.sort_unstable_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then(b.follower.cmp(&a.follower))
        });
        Ok(edges)
    }
    async fn followees_of(&self, follower: &UserId) -> Result<Vec<FollowEdge>> {
        let guard = self.inner.read().await;
        let mut edges = guard
            .follows
            .values()
            .filter(|edge| edge.follower == *follower)
            .cloned()
            .collect::<Vec<FollowEdge>>();
        edges.sort_unstable_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then(b.followee.cmp(&a.followee))
        });
        Ok(edges)
    }
    async fn followee_filter(
        &self,
        follower: &UserId,
        candidates: &[UserId],
    ) -> Result<HashSet<UserId>> {
        let guard = self.inner.read().await;
        Ok(candidates
            .iter()
            .filter(|candidate| guard.follows.contains_key(&(*follower, **candidate)))
            .copied()
            .collect())
    }
    async fn create_tag_if_absent(&self, title: &Tagname) -> Result<Tag> {
        Ok(self
            .inner
            .write()
            .await
            .tags
            .entry(title.clone())
            .or_insert_with(|| Tag {
                title: title.clone(),
                total_posts: 0,
            })
            .clone())
    }
    async fn get_tag(&self, title: &Tagname) -> Result<Option<Tag>> {
        Ok(self.inner.read().await.tags.get(title).cloned())
    }
    async fn adjust_tag_total_posts(&self, title: &Tagname, delta: i64) -> Result<()> {
        if let Some(tag) = self.inner.write().await.tags.get_mut(title) {
            tag.total_posts = (tag.total_posts as i64 + delta).max(0) as u32;
        }
        Ok(())
    }
    async fn pin_post(&self, user: &UserId, post: &PostId) -> Result<()> {
        self.inner
            .write()
            .await
            .pinned
            .entry(*user)
            .or_default()
            .insert(*post);
        Ok(())
    }
    async fn unpin_post(&self, user: &UserId, post: &PostId) -> Result<()> {
        if let Some(set) = self.inner.write().await.pinned.get_mut(user) {
            set.remove(post);
        }
        Ok(())
    }
    async fn pinned_filter(&self, user: &UserId, candidates: &[PostId]) -> Result<HashSet<PostId>> {
        let guard = self.inner.read().await;
        Ok(guard
            .pinned
            .get(user)
            .map(|set| candidates.iter().filter(|c| set.contains(c)).copied().collect())
            .unwrap_or_default())
    }
    async fn hide_post(&self, user: &UserId, post: &PostId) -> Result<()> {
        self.inner
            .write()
            .await
            .hidden
            .entry(*user)
            .or_default()
            .insert(*post);
        Ok(())
    }
    async fn unhide_post(&self, user: &UserId, post: &PostId) -> Result<()> {
        if let Some(set) = self.inner.write().await.hidden.get_mut(user) {
            set.remove(post);
        }
        Ok(())
    }
    async fn hidden_filter(&self, user: &UserId, candidates: &[PostId]) -> Result<HashSet<PostId>> {
        let guard = self.inner.read().await;
        Ok(guard
            .hidden
            .get(user)
            .map(|set| candidates.iter().filter(|c| set.contains(c)).copied().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn user_lifecycle() {
        let store = Memory::new();
        let alice = store
            .add_user(&Username::new("alice").unwrap())
            .await
            .unwrap();
        assert_eq!(alice.id, UserId::new(1));
        assert!(matches!(
            store.add_user(&Username::new("alice").unwrap()).await,
            Err(Error::UsernameClaimed { .. })
        ));
        assert_eq!(
            store.user_for_name("alice").await.unwrap().unwrap().id,
            alice.id
        );
        // The sentinel is there from the start.
        assert_eq!(
            store
                .get_users_by_ids(&[UserId::ANONYMOUS])
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn rank_ordering_matches_the_cache() {
        let store = Memory::new();
        let alice = store
            .add_user(&Username::new("alice").unwrap())
            .await
            .unwrap();
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(
                store
                    .add_post(Some(alice.id), "hi", &[], Duration::hours(24))
                    .await
                    .unwrap()
                    .id,
            );
        }
        store.adjust_post_counters(&ids[0], 2, 0).await.unwrap();
        store.adjust_post_counters(&ids[1], 1, 0).await.unwrap();

        let now = Utc::now();
        let ordered = store
            .posts_by_owner(&alice.id, &now)
            .await
            .unwrap()
            .into_iter()
            .map(|post| post.id)
            .collect::<Vec<PostId>>();
        assert_eq!(ordered, vec![ids[0], ids[1], ids[2]]);

        // Tie the first two at +2; the higher id now leads.
        store.adjust_post_counters(&ids[1], 1, 0).await.unwrap();
        let ordered = store
            .posts_by_owner(&alice.id, &now)
            .await
            .unwrap()
            .into_iter()
            .map(|post| post.id)
            .collect::<Vec<PostId>>();
        assert_eq!(ordered, vec![ids[1], ids[0], ids[2]]);
    }

    #[tokio::test]
    async fn vote_upsert_reports_previous_polarity() {
        let store = Memory::new();
        let alice = store
            .add_user(&Username::new("alice").unwrap())
            .await
            .unwrap();
        let post = store
            .add_post(Some(alice.id), "hi", &[], Duration::hours(24))
            .await
            .unwrap();
        assert_eq!(
            store
                .set_vote(&alice.id, &post.id, Some(true))
                .await
                .unwrap(),
            None
        );
        assert_eq!(
            store
                .set_vote(&alice.id, &post.id, Some(false))
                .await
                .unwrap(),
            Some(true)
        );
        assert_eq!(
            store.set_vote(&alice.id, &post.id, None).await.unwrap(),
            Some(false)
        );
    }

    #[tokio::test]
    async fn counters_saturate() {
        let store = Memory::new();
        let alice = store
            .add_user(&Username::new("alice").unwrap())
            .await
            .unwrap();
        let post = store
            .add_post(Some(alice.id), "hi", &[], Duration::hours(24))
            .await
            .unwrap();
        store.adjust_post_counters(&post.id, -5, -5).await.unwrap();
        let post = store.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!((post.voted_count, post.downvoted_count), (0, 0));
    }
}
