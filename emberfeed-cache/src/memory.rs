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
//! [Backend] implementation backed by process memory.
//!
//! This is the engine used by the test-suites & by single-process deployments that don't want to
//! operate a Redis instance. Each operation takes the lock exactly once, giving the all-or-nothing
//! guarantee the [store](crate::store) contract demands; ranked order is maintained in a
//! [BTreeSet] keyed so that in-order traversal yields rank order directly.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use rand::seq::SliceRandom;
use tokio::sync::RwLock;

use crate::{
    store::{Backend, Result},
    types::{Member, SetName},
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                              Rank                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Sort key for scored-set members
///
/// Deriving [Ord] would sort ascending by score & then ascending by member; we want the
/// traversal of a [BTreeSet] of these (which is ascending) to yield the *display* order:
/// descending score, ties broken by member id descending.
#[derive(Clone, Copy, Debug)]
struct Rank {
    score: f64,
    member: Member,
}

impl PartialEq for Rank {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for Rank {}

impl Ord for Rank {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // `total_cmp` rather than `partial_cmp` so that we never have to unwrap; scores are
        // finite in practice, but the ordering must be total regardless.
        other
            .score
            .total_cmp(&self.score)
            .then(other.member.cmp(&self.member))
    }
}

impl PartialOrd for Rank {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        the Memory engine                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Default)]
struct Scored {
    warm: bool,
    scores: HashMap<Member, f64>,
    order: BTreeSet<Rank>,
}

impl Scored {
    fn put(&mut self, score: f64, member: Member) {
        if let Some(old) = self.scores.insert(member, score) {
            self.order.remove(&Rank { score: old, member });
        }
        self.order.insert(Rank { score, member });
    }
}

#[derive(Debug, Default)]
struct Members {
    warm: bool,
    items: Vec<Member>,
    index: HashMap<Member, usize>,
}

impl Members {
    fn add(&mut self, member: Member) {
        if !self.index.contains_key(&member) {
            self.index.insert(member, self.items.len());
            self.items.push(member);
        }
    }
    fn remove(&mut self, member: Member) {
        if let Some(i) = self.index.remove(&member) {
            self.items.swap_remove(i);
            if i < self.items.len() {
                self.index.insert(self.items[i], i);
            }
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    scored: HashMap<SetName, Scored>,
    members: HashMap<SetName, Members>,
}

/// In-memory [Backend] implementation
#[derive(Debug, Default)]
pub struct Memory {
    inner: RwLock<Inner>,
}

impl Memory {
    pub fn new() -> Memory {
        Memory::default()
    }
}

#[async_trait]
impl Backend for Memory {
    async fn upsert(&self, set: &SetName, score: f64, member: Member) -> Result<()> {
        self.inner
            .write()
            .await
            .scored
            .entry(set.clone())
            .or_default()
            .put(score, member);
        Ok(())
    }
    async fn increment_score(&self, set: &SetName, member: Member, delta: f64) -> Result<f64> {
        let mut guard = self.inner.write().await;
        let scored = guard.scored.entry(set.clone()).or_default();
        let score = scored.scores.get(&member).copied().unwrap_or(0.0) + delta;
        scored.put(score, member);
        Ok(score)
    }
    async fn remove(&self, set: &SetName, member: Member) -> Result<()> {
        if let Some(scored) = self.inner.write().await.scored.get_mut(set) {
            if let Some(score) = scored.scores.remove(&member) {
                scored.order.remove(&Rank { score, member });
            }
        }
        Ok(())
    }
    async fn exists(&self, set: &SetName) -> Result<bool> {
        let guard = self.inner.read().await;
        Ok(guard.scored.get(set).map(|s| s.warm).unwrap_or(false)
            || guard.members.get(set).map(|s| s.warm).unwrap_or(false))
    }
    async fn cardinality(&self, set: &SetName) -> Result<u64> {
        Ok(self
            .inner
            .read()
            .await
            .scored
            .get(set)
            .map(|s| s.scores.len() as u64)
            .unwrap_or(0))
    }
    async fn range_by_score_desc(
        &self,
        set: &SetName,
        start: usize,
        end: usize,
    ) -> Result<Vec<Member>> {
        if end < start {
            return Ok(Vec::new());
        }
        Ok(self
            .inner
            .read()
            .await
            .scored
            .get(set)
            .map(|scored| {
                scored
                    .order
                    .iter()
                    .skip(start)
                    .take(end - start + 1)
                    .map(|rank| rank.member)
                    .collect()
            })
            .unwrap_or_default())
    }
    async fn load(&self, set: &SetName, entries: &[(f64, Member)]) -> Result<()> {
        let mut scored = Scored {
            warm: true,
            ..Default::default()
        };
        for (score, member) in entries {
            scored.put(*score, *member);
        }
        self.inner.write().await.scored.insert(set.clone(), scored);
        Ok(())
    }
    async fn drop_set(&self, set: &SetName) -> Result<()> {
        let mut guard = self.inner.write().await;
        guard.scored.remove(set);
        guard.members.remove(set);
        Ok(())
    }
    async fn add_members(&self, set: &SetName, members: &[Member]) -> Result<()> {
        let mut guard = self.inner.write().await;
        let entry = guard.members.entry(set.clone()).or_default();
        for member in members {
            entry.add(*member);
        }
        Ok(())
    }
    async fn remove_member(&self, set: &SetName, member: Member) -> Result<()> {
        if let Some(entry) = self.inner.write().await.members.get_mut(set) {
            entry.remove(member);
        }
        Ok(())
    }
    async fn load_members(&self, set: &SetName, members: &[Member]) -> Result<()> {
        let mut entry = Members {
            warm: true,
            ..Default::default()
        };
        for member in members {
            entry.add(*member);
        }
        self.inner.write().await.members.insert(set.clone(), entry);
        Ok(())
    }
    async fn random_members(&self, set: &SetName, count: usize) -> Result<Vec<Member>> {
        Ok(self
            .inner
            .read()
            .await
            .members
            .get(set)
            .map(|entry| {
                entry
                    .items
                    .choose_multiple(&mut rand::thread_rng(), count)
                    .copied()
                    .collect()
            })
            .unwrap_or_default())
    }
}


#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn ordering_and_ranges() {
        let engine = Memory::new();
        let set = SetName::from("user:1:posts");
        engine.upsert(&set, 1.0, Member::new(10)).await.unwrap();
        engine.upsert(&set, 3.0, Member::new(11)).await.unwrap();
        engine.upsert(&set, 1.0, Member::new(12)).await.unwrap();
        engine.upsert(&set, 2.0, Member::new(13)).await.unwrap();

        let all = engine.range_by_score_desc(&set, 0, 3).await.unwrap();
        assert_eq!(
            all,
            vec![
                Member::new(11),
                Member::new(13),
                Member::new(12), // ties at 1.0 break member-descending
                Member::new(10),
            ]
        );

        // Inclusive bounds, out-of-range tolerated.
        assert_eq!(
            engine.range_by_score_desc(&set, 1, 2).await.unwrap(),
            vec![Member::new(13), Member::new(12)]
        );
        assert_eq!(
            engine.range_by_score_desc(&set, 2, 100).await.unwrap(),
            vec![Member::new(12), Member::new(10)]
        );
        assert!(engine
            .range_by_score_desc(&set, 7, 9)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn warm_but_empty() {
        let engine = Memory::new();
        let set = SetName::from("tag:ghost:posts");
        assert!(!engine.exists(&set).await.unwrap());
        // A bare upsert doesn't make the set warm...
        engine.upsert(&set, 0.0, Member::new(1)).await.unwrap();
        assert!(!engine.exists(&set).await.unwrap());
        // ...but a load does, even one with nothing in it, & it drops any stale contents.
        engine.load(&set, &[]).await.unwrap();
        assert!(engine.exists(&set).await.unwrap());
        assert_eq!(engine.cardinality(&set).await.unwrap(), 0);

        engine.drop_set(&set).await.unwrap();
        assert!(!engine.exists(&set).await.unwrap());
    }

    #[tokio::test]
    async fn increments_move_rank() {
        let engine = Memory::new();
        let set = SetName::from("user:2:posts");
        engine
            .load(&set, &[(0.0, Member::new(1)), (0.0, Member::new(2))])
            .await
            .unwrap();
        let score = engine
            .increment_score(&set, Member::new(1), 2.0)
            .await
            .unwrap();
        assert_eq!(score, 2.0);
        assert_eq!(
            engine.range_by_score_desc(&set, 0, 1).await.unwrap(),
            vec![Member::new(1), Member::new(2)]
        );
        let score = engine
            .increment_score(&set, Member::new(1), -3.0)
            .await
            .unwrap();
        assert_eq!(score, -1.0);
        assert_eq!(
            engine.range_by_score_desc(&set, 0, 1).await.unwrap(),
            vec![Member::new(2), Member::new(1)]
        );
    }

    #[tokio::test]
    async fn random_pool() {
        let engine = Memory::new();
        let set = SetName::from("users:set:all");
        let members = (1..=10).map(Member::new).collect::<Vec<Member>>();
        engine.load_members(&set, &members).await.unwrap();
        assert!(engine.exists(&set).await.unwrap());

        let sample = engine.random_members(&set, 4).await.unwrap();
        assert_eq!(sample.len(), 4);
        let unique = sample.iter().collect::<std::collections::HashSet<_>>();
        assert_eq!(unique.len(), 4);

        // Asking for more than there are yields what there is.
        assert_eq!(engine.random_members(&set, 100).await.unwrap().len(), 10);

        engine.remove_member(&set, Member::new(1)).await.unwrap();
        assert_eq!(engine.random_members(&set, 100).await.unwrap().len(), 9);
    }
}
