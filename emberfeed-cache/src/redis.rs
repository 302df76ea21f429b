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

//! # redis
//!
//! [Backend] implementation for Redis.
//!
//! Two points where this engine has to work for the contract rather than getting it for free:
//!
//! - *Warmth*: Redis can't distinguish "never built" from "built & empty" by looking at a sorted
//!   set (an empty zset and a missing zset are the same thing). Warmth is therefore a companion
//!   `{set}:warm` string key, written in the same MULTI/EXEC transaction as the bulk load so the
//!   two can't be observed apart.
//!
//! - *Tie-break*: ZREVRANGE breaks score ties by *reverse lexicographic* member order. Member ids
//!   are encoded as zero-padded fixed-width decimal so that lexicographic order coincides with
//!   numeric order, making the tie-break "member id descending"-- the same rule the in-memory
//!   engine implements.

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use snafu::ResultExt;
use tracing::debug;

use crate::{
    store::{Backend, Error, MemberParseSnafu, Result},
    types::{Member, SetName},
};

/// Width of the zero-padded member encoding; wide enough for any u64.
const MEMBER_WIDTH: usize = 20;

fn encode(member: Member) -> String {
    format!("{:0width$}", member.get(), width = MEMBER_WIDTH)
}

fn decode(text: String) -> Result<Member> {
    text.parse::<u64>()
        .map(Member::new)
        .context(MemberParseSnafu { text })
}

fn warm_key(set: &SetName) -> String {
    format!("{set}:warm")
}

/// [Backend] implementation talking to a Redis instance
///
/// [ConnectionManager] multiplexes one connection & reconnects on failure; it's cheap to clone, so
/// each operation clones it rather than serializing callers through a lock.
pub struct Redis {
    manager: ConnectionManager,
}

impl Redis {
    pub async fn connect(url: &str) -> Result<Redis> {
        debug!("Connecting to Redis at {url}");
        let client = Client::open(url).map_err(Error::backend)?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(Error::backend)?;
        Ok(Redis { manager })
    }
    pub fn new(manager: ConnectionManager) -> Redis {
        Redis { manager }
    }
}

#[async_trait]
impl Backend for Redis {
    async fn upsert(&self, set: &SetName, score: f64, member: Member) -> Result<()> {
        let mut con = self.manager.clone();
        let _: () = con
            .zadd(set.as_ref(), encode(member), score)
            .await
            .map_err(Error::backend)?;
        Ok(())
    }
    async fn increment_score(&self, set: &SetName, member: Member, delta: f64) -> Result<f64> {
        let mut con = self.manager.clone();
        con.zincr(set.as_ref(), encode(member), delta)
            .await
            .map_err(Error::backend)
    }
    async fn remove(&self, set: &SetName, member: Member) -> Result<()> {
        let mut con = self.manager.clone();
        let _: () = con
            .zrem(set.as_ref(), encode(member))
            .await
            .map_err(Error::backend)?;
        Ok(())
    }
    async fn exists(&self, set: &SetName) -> Result<bool> {
        let mut con = self.manager.clone();
        con.exists(warm_key(set)).await.map_err(Error::backend)
    }
    async fn cardinality(&self, set: &SetName) -> Result<u64> {
        let mut con = self.manager.clone();
        con.zcard(set.as_ref()).await.map_err(Error::backend)
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
        let mut con = self.manager.clone();
        let raw: Vec<String> = con
            .zrevrange(set.as_ref(), start as isize, end as isize)
            .await
            .map_err(Error::backend)?;
        raw.into_iter().map(decode).collect()
    }
    async fn load(&self, set: &SetName, entries: &[(f64, Member)]) -> Result<()> {
        let encoded = entries
            .iter()
            .map(|(score, member)| (*score, encode(*member)))
            .collect::<Vec<(f64, String)>>();
        let mut con = self.manager.clone();
        let mut pipe = redis::pipe();
        pipe.atomic().del(set.as_ref()).ignore();
        if !encoded.is_empty() {
            pipe.zadd_multiple(set.as_ref(), &encoded).ignore();
        }
        pipe.set(warm_key(set), 1).ignore();
        let _: () = pipe.query_async(&mut con).await.map_err(Error::backend)?;
        Ok(())
    }
    async fn drop_set(&self, set: &SetName) -> Result<()> {
        let mut con = self.manager.clone();
        let _: () = redis::pipe()
            .atomic()
            .del(set.as_ref())
            .ignore()
            .del(warm_key(set))
            .ignore()
            .query_async(&mut con)
            .await
            .map_err(Error::backend)?;
        Ok(())
    }
    async fn add_members(&self, set: &SetName, members: &[Member]) -> Result<()> {
        if members.is_empty() {
            return Ok(());
        }
        let encoded = members.iter().map(|m| encode(*m)).collect::<Vec<String>>();
        let mut con = self.manager.clone();
        let _: () = con
            .sadd(set.as_ref(), encoded)
            .await
            .map_err(Error::backend)?;
        Ok(())
    }
    async fn remove_member(&self, set: &SetName, member: Member) -> Result<()> {
        let mut con = self.manager.clone();
        let _: () = con
            .srem(set.as_ref(), encode(member))
            .await
            .map_err(Error::backend)?;
        Ok(())
    }
    async fn load_members(&self, set: &SetName, members: &[Member]) -> Result<()> {
        let encoded = members.iter().map(|m| encode(*m)).collect::<Vec<String>>();
        let mut con = self.manager.clone();
        let mut pipe = redis::pipe();
        pipe.atomic().del(set.as_ref()).ignore();
        if !encoded.is_empty() {
            pipe.sadd(set.as_ref(), encoded).ignore();
        }
        pipe.set(warm_key(set), 1).ignore();
        let _: () = pipe.query_async(&mut con).await.map_err(Error::backend)?;
        Ok(())
    }
    async fn random_members(&self, set: &SetName, count: usize) -> Result<Vec<Member>> {
        let mut con = self.manager.clone();
        let raw: Vec<String> = con
            .srandmember_multiple(set.as_ref(), count)
            .await
            .map_err(Error::backend)?;
        raw.into_iter().map(decode).collect()
    }
}

#[cfg(test)]
mod check_member_encoding {
    use super::*;

    #[test]
    fn round_trip() {
        assert_eq!(encode(Member::new(42)), "00000000000000000042");
        assert_eq!(decode(encode(Member::new(42))).unwrap(), Member::new(42));
        assert_eq!(decode(encode(Member::new(0))).unwrap(), Member::new(0));
        assert_eq!(
            decode(encode(Member::new(u64::MAX))).unwrap(),
            Member::new(u64::MAX)
        );
    }

    #[test]
    fn lexicographic_is_numeric() {
        // The whole point of the padding: string order must agree with numeric order.
        assert!(encode(Member::new(9)) < encode(Member::new(10)));
        assert!(encode(Member::new(99)) < encode(Member::new(100)));
    }
}
