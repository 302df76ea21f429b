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

//! # store
//!
//! Abstraction over the emberfeed scored-set cache.
//!
//! ## Semantics
//!
//! The contract is modeled on Redis sorted sets & plain sets, with one addition: *warmth*. A set
//! is "warm" once it has been populated wholesale from the authoritative store (via
//! [`load`](Backend::load) or [`load_members`](Backend::load_members)), *even if that population
//! turned out to be empty*. [`exists`](Backend::exists) reports warmth, nothing else; cardinality
//! can't be used to answer "has this set been built?" because an empty result is a perfectly good
//! cache entry. Incremental mutations (upsert, increment, remove, add) apply whether or not the
//! set is warm & never change its warmth.
//!
//! Ordering: descending score; ties broken by member id *descending* (so among equal scores, the
//! most recently assigned id ranks first). Both engines in this crate implement the same rule.
//!
//! Every operation is all-or-nothing: it either fully applies or leaves the named set unchanged.

use std::error::Error as StdError;

use async_trait::async_trait;
use snafu::{Backtrace, Snafu};

use crate::types::{Member, SetName};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Cache backend error: {source}"))]
    Backend {
        source: Box<dyn StdError + Send + Sync + 'static>,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to parse {text} as a member id: {source}"))]
    MemberParse {
        text: String,
        source: std::num::ParseIntError,
        backtrace: Backtrace,
    },
}

impl Error {
    /// Wrap an engine-specific error
    pub fn backend(err: impl StdError + Send + Sync + 'static) -> Error {
        Error::Backend {
            source: Box::new(err),
            backtrace: Backtrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         trait Backend                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Object-safe trait abstracting over the cache engine
///
/// In production this will be Redis; tests & single-process deployments use the in-memory engine.
/// Implementations are given to the popularity machinery as `Arc<dyn Backend + Send + Sync>`--
/// there is deliberately no process-wide cache handle.
#[async_trait]
pub trait Backend {
    /// Insert `member` with `score`, or update its score if already present.
    async fn upsert(&self, set: &SetName, score: f64, member: Member) -> Result<()>;
    /// Add `delta` to `member`'s score, inserting it at `delta` if absent. Returns the new score.
    async fn increment_score(&self, set: &SetName, member: Member, delta: f64) -> Result<f64>;
    /// Remove `member` from the scored set; removing an absent member is not an error.
    async fn remove(&self, set: &SetName, member: Member) -> Result<()>;
    /// Is this set warm? See the module docs for what warmth does & does not mean.
    async fn exists(&self, set: &SetName) -> Result<bool>;
    /// Number of members currently in the scored set (zero for a set never touched).
    async fn cardinality(&self, set: &SetName) -> Result<u64>;
    /// Members with ranks in `[start, end]` (inclusive on both ends, ZREVRANGE-style), best
    /// score first. Out-of-range bounds yield a short or empty result, never an error.
    async fn range_by_score_desc(
        &self,
        set: &SetName,
        start: usize,
        end: usize,
    ) -> Result<Vec<Member>>;
    /// Replace the scored set's contents with `entries` & mark it warm-- even when `entries` is
    /// empty.
    async fn load(&self, set: &SetName, entries: &[(f64, Member)]) -> Result<()>;
    /// Drop the set altogether: contents *and* warmth.
    async fn drop_set(&self, set: &SetName) -> Result<()>;

    // Plain (unscored) membership sets; used for the feed's random pool.

    /// Add members to a plain set; warmth is unchanged.
    async fn add_members(&self, set: &SetName, members: &[Member]) -> Result<()>;
    /// Remove a member from a plain set; removing an absent member is not an error.
    async fn remove_member(&self, set: &SetName, member: Member) -> Result<()>;
    /// Replace a plain set's contents & mark it warm (the SADD analogue of [`load`](Backend::load)).
    async fn load_members(&self, set: &SetName, members: &[Member]) -> Result<()>;
    /// Up to `count` *distinct* members drawn uniformly at random from a plain set.
    async fn random_members(&self, set: &SetName, count: usize) -> Result<Vec<Member>>;
}

/// Blanket implementation for [Arc]s; if `T` is a [Backend], then so is `Arc<T>`.
#[async_trait]
impl<T: Backend + Send + Sync> Backend for std::sync::Arc<T> {
    async fn upsert(&self, set: &SetName, score: f64, member: Member) -> Result<()> {
        self.as_ref().upsert(set, score, member).await
    }
    async fn increment_score(&self, set: &SetName, member: Member, delta: f64) -> Result<f64> {
        self.as_ref().increment_score(set, member, delta).await
    }
    async fn remove(&self, set: &SetName, member: Member) -> Result<()> {
        self.as_ref().remove(set, member).await
    }
    async fn exists(&self, set: &SetName) -> Result<bool> {
        self.as_ref().exists(set).await
    }
    async fn cardinality(&self, set: &SetName) -> Result<u64> {
        self.as_ref().cardinality(set).await
    }
    async fn range_by_score_desc(
        &self,
        set: &SetName,
        start: usize,
        end: usize,
    ) -> Result<Vec<Member>> {
        self.as_ref().range_by_score_desc(set, start, end).await
    }
    async fn load(&self, set: &SetName, entries: &[(f64, Member)]) -> Result<()> {
        self.as_ref().load(set, entries).await
    }
    async fn drop_set(&self, set: &SetName) -> Result<()> {
        self.as_ref().drop_set(set).await
    }
    async fn add_members(&self, set: &SetName, members: &[Member]) -> Result<()> {
        self.as_ref().add_members(set, members).await
    }
    async fn remove_member(&self, set: &SetName, member: Member) -> Result<()> {
        self.as_ref().remove_member(set, member).await
    }
    async fn load_members(&self, set: &SetName, members: &[Member]) -> Result<()> {
        self.as_ref().load_members(set, members).await
    }
    async fn random_members(&self, set: &SetName, count: usize) -> Result<Vec<Member>> {
        self.as_ref().random_members(set, count).await
    }
}
