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

//! # emberfeed models
//!
//! ## Introduction
//!
//! The domain: *ephemeral posts*. A [Post] is born with a day to live, gains time when upvoted &
//! loses it when downvoted, and is swept away once its clock runs out. [User]s and [Tag]s each
//! own a ranked collection of posts ordered by popularity; those collections are cached as scored
//! sets (see [emberfeed_cache]) under the key conventions defined here.
//!
//! The relational store is authoritative for everything in this module. Every cached set is
//! derived & rebuildable; losing one is a performance event, not data loss.

use std::{collections::HashSet, fmt::Display, ops::Deref, str::FromStr};

use chrono::{DateTime, Duration, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use snafu::{Backtrace, Snafu};

use emberfeed_cache::types::{Member, SetName};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{text} is not a valid tag name"))]
    BadTagname { text: String, backtrace: Backtrace },
    #[snafu(display("{name} is not a valid emberfeed username"))]
    BadUsername { name: String, backtrace: Backtrace },
    #[snafu(display("Post text is {len} characters; the limit is {MAX_POST_TEXT}"))]
    TextTooLong { len: usize, backtrace: Backtrace },
}

type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

fn mk_serde_de_err<'de, D: serde::Deserializer<'de>>(err: impl std::error::Error) -> D::Error {
    <D::Error as serde::de::Error>::custom(format!("{:?}", err))
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          Identifiers                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// identifier!
///
/// Declare a newtype struct over [u64] intended to be used as an opaque identifier for some other
/// sort of entity. The backing store assigns these monotonically, a property the ordering rules
/// below lean on: among posts with equal popularity, the greater id is the more recent post.
///
/// I could have just used a type alias, but I can't bring myself to let a user id be assignable
/// to a post id.
macro_rules! define_id {
    ($type_name:ident) => {
        #[derive(
            Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
        )]
        #[serde(transparent)]
        pub struct $type_name(u64);
        impl $type_name {
            pub fn new(id: u64) -> $type_name {
                $type_name(id)
            }
            pub fn get(&self) -> u64 {
                self.0
            }
        }
        impl Display for $type_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
        impl From<u64> for $type_name {
            fn from(value: u64) -> Self {
                $type_name(value)
            }
        }
        impl From<$type_name> for Member {
            fn from(value: $type_name) -> Self {
                Member::new(value.0)
            }
        }
        impl From<Member> for $type_name {
            fn from(value: Member) -> Self {
                $type_name(value.get())
            }
        }
    };
}

define_id!(UserId);
define_id!(PostId);

impl UserId {
    /// Sentinel owner for anonymous posts. The backing store guarantees a [User] row with this
    /// id exists from the start.
    pub const ANONYMOUS: UserId = UserId(0);
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         cached-set keys                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// All users, as a plain membership set-- the feed's random pool
pub const ALL_USERS_KEY: &str = "users:set:all";

/// All users, ranked by popularity
pub const USERS_BY_POPULARITY_KEY: &str = "users:zset:all";

pub fn all_users_key() -> SetName {
    SetName::from(ALL_USERS_KEY)
}

pub fn users_by_popularity_key() -> SetName {
    SetName::from(USERS_BY_POPULARITY_KEY)
}

impl UserId {
    /// This user's posts, ranked by popularity
    pub fn posts_key(&self) -> SetName {
        SetName::new(format!("user:{}:posts", self.0))
    }
    /// Users following this user, ranked by edge recency
    pub fn followers_key(&self) -> SetName {
        SetName::new(format!("user:{}:followers", self.0))
    }
    /// Users this user follows, ranked by edge recency
    pub fn followees_key(&self) -> SetName {
        SetName::new(format!("user:{}:followees", self.0))
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Username                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

// emberfeed usernames must be ASCII, at most fifteen characters, and must match the regex
// "^[A-Za-z][-_.A-Za-z0-9]*$".
const MAX_USERNAME_LENGTH: usize = 15;

lazy_static! {
    static ref USERNAME: Regex = Regex::new("^[A-Za-z][-_.A-Za-z0-9]*$").unwrap(/* known good */);
}

fn check_username(s: &str) -> bool {
    s.is_ascii() && !s.is_empty() && s.len() <= MAX_USERNAME_LENGTH && USERNAME.is_match(s)
}

/// A refined type representing an emberfeed username
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct Username(String);

impl Username {
    /// Construct a [Username] from a `&str`, copying. To *move* a [String] into a [Username]
    /// (with the same validity checking) use [TryFrom::try_from()].
    pub fn new(name: &str) -> Result<Username> {
        check_username(name)
            .then_some(Username(name.to_owned()))
            .ok_or(
                BadUsernameSnafu {
                    name: name.to_owned(),
                }
                .build(),
            )
    }
}

impl AsRef<str> for Username {
    fn as_ref(&self) -> &str {
        self.deref()
    }
}

impl Deref for Username {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// Implement `Deserialize` by hand to fail if the serialized value isn't a legit `Username`
impl<'de> Deserialize<'de> for Username {
    fn deserialize<D>(deserializer: D) -> StdResult<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        Username::try_from(s).map_err(mk_serde_de_err::<'de, D>)
    }
}

impl Display for Username {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Username {
    type Err = Error;

    fn from_str(s: &str) -> StdResult<Self, Self::Err> {
        Username::new(s)
    }
}

impl TryFrom<String> for Username {
    type Error = Error;

    fn try_from(name: String) -> StdResult<Self, Self::Error> {
        if check_username(&name) {
            Ok(Username(name))
        } else {
            BadUsernameSnafu { name }.fail()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             Tagname                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

// Tag names are what the hashtag extractor produces: word characters with at least one letter or
// underscore among them, at most thirty characters.
const MAX_TAGNAME_LENGTH: usize = 30;

lazy_static! {
    static ref TAGNAME: Regex = Regex::new(r"^\w*[A-Za-z_]+\w*$").unwrap(/* known good */);
}

fn check_tagname(s: &str) -> bool {
    !s.is_empty() && s.len() <= MAX_TAGNAME_LENGTH && TAGNAME.is_match(s)
}

/// A refined type representing a hashtag title; doubles as the [Tag]'s primary key
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct Tagname(String);

impl Tagname {
    pub fn new(text: &str) -> Result<Tagname> {
        check_tagname(text)
            .then_some(Tagname(text.to_owned()))
            .ok_or(
                BadTagnameSnafu {
                    text: text.to_owned(),
                }
                .build(),
            )
    }
    /// Posts carrying this tag, ranked by popularity
    pub fn posts_key(&self) -> SetName {
        SetName::new(format!("tag:{}:posts", self.0))
    }
}

impl AsRef<str> for Tagname {
    fn as_ref(&self) -> &str {
        self.deref()
    }
}

impl Deref for Tagname {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'de> Deserialize<'de> for Tagname {
    fn deserialize<D>(deserializer: D) -> StdResult<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        Tagname::try_from(s).map_err(mk_serde_de_err::<'de, D>)
    }
}

impl Display for Tagname {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Tagname {
    type Err = Error;

    fn from_str(s: &str) -> StdResult<Self, Self::Err> {
        Tagname::new(s)
    }
}

impl TryFrom<String> for Tagname {
    type Error = Error;

    fn try_from(text: String) -> StdResult<Self, Self::Error> {
        if check_tagname(&text) {
            Ok(Tagname(text))
        } else {
            BadTagnameSnafu { text }.fail()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        text extraction                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

lazy_static! {
    // The `regex` crate has no look-behind, so the leading whitespace-or-start lands in the
    // match; only the capture group matters.
    static ref HASHTAG: Regex = Regex::new(r"(?:^|\s)#(\w*[A-Za-z_]+\w*)").unwrap(/* known good */);
    static ref MENTION: Regex = Regex::new(r"(?:^|\s)@(\w*[A-Za-z_]+\w*)").unwrap(/* known good */);
}

/// Hashtags appearing in `text`, deduplicated, in order of first appearance. Candidates that
/// don't survive [Tagname]'s validation (over-long, say) are dropped.
pub fn extract_hashtags(text: &str) -> Vec<Tagname> {
    let mut seen: HashSet<&str> = HashSet::new();
    HASHTAG
        .captures_iter(text)
        .filter_map(|caps| {
            let raw = caps.get(1).unwrap(/* known good */).as_str();
            seen.insert(raw).then(|| Tagname::new(raw).ok()).flatten()
        })
        .collect()
}

/// `@`-mentions appearing in `text`, deduplicated, in order of first appearance
pub fn extract_mentions(text: &str) -> Vec<Username> {
    let mut seen: HashSet<&str> = HashSet::new();
    MENTION
        .captures_iter(text)
        .filter_map(|caps| {
            let raw = caps.get(1).unwrap(/* known good */).as_str();
            seen.insert(raw).then(|| Username::new(raw).ok()).flatten()
        })
        .collect()
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             User                                               //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct User {
    pub id: UserId,
    pub username: Username,
    /// Maintained counter: +1 per post, +1 per follower (and the corresponding decrements)
    pub popularity: f64,
    pub created_at: DateTime<Utc>,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             Post                                               //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Maximum length of a post's text, in characters
pub const MAX_POST_TEXT: usize = 256;

/// How long a post lives absent any votes
pub fn default_lifetime() -> Duration {
    Duration::hours(24)
}

/// An ephemeral post
///
/// `owner` is `None` for anonymous posts; for ranking purposes those are filed under
/// [UserId::ANONYMOUS].
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Post {
    pub id: PostId,
    pub owner: Option<UserId>,
    pub text: String,
    pub voted_count: u32,
    pub downvoted_count: u32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// The tags this post was filed under at creation (extracted from `text`)
    pub tags: Vec<Tagname>,
}

impl Post {
    /// Validate `text` for use as a post body
    pub fn check_text(text: &str) -> Result<()> {
        let len = text.chars().count();
        if len > MAX_POST_TEXT {
            TextTooLongSnafu { len }.fail()
        } else {
            Ok(())
        }
    }
    /// The derived ranking score
    pub fn popularity(&self) -> i64 {
        self.voted_count as i64 - self.downvoted_count as i64
    }
    /// The entity under which this post ranks
    pub fn ranking_owner(&self) -> UserId {
        self.owner.unwrap_or(UserId::ANONYMOUS)
    }
    pub fn is_expired(&self, now: &DateTime<Utc>) -> bool {
        self.expires_at < *now
    }
    /// Time left before expiry; zero once expired (never negative)
    pub fn time_remaining(&self, now: &DateTime<Utc>) -> Duration {
        std::cmp::max(self.expires_at - *now, Duration::zero())
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                              Tag                                               //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Tag {
    pub title: Tagname,
    /// Count of posts ever filed under this tag & not yet deleted (expired posts count until
    /// the sweep removes them)
    pub total_posts: u32,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                              Vote                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A (user, post) vote record; unique per pair
///
/// `is_positive` is tri-state: `None` (no vote yet), `Some(true)` (upvote), `Some(false)`
/// (downvote). Re-voting flips the polarity in place; counters are adjusted by the *transition*,
/// never by a flat increment.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Vote {
    pub user: UserId,
    pub post: PostId,
    pub is_positive: Option<bool>,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           FollowEdge                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A (follower, followee) edge; unique per pair
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FollowEdge {
    pub follower: UserId,
    pub followee: UserId,
    pub created_at: DateTime<Utc>,
}


#[cfg(test)]
mod check_extraction {
    use super::*;

    #[test]
    fn hashtags() {
        assert_eq!(
            extract_hashtags("shipped #rust today, more #rust and some #caching"),
            vec![Tagname::new("rust").unwrap(), Tagname::new("caching").unwrap()]
        );
        // Mid-word '#' doesn't count; neither does a bare number.
        assert!(extract_hashtags("C#minor room#42").is_empty());
        assert_eq!(
            extract_hashtags("#leading tag"),
            vec![Tagname::new("leading").unwrap()]
        );
    }

    #[test]
    fn mentions() {
        assert_eq!(
            extract_mentions("ping @alice and @bob, but not embedded@host"),
            vec![Username::new("alice").unwrap(), Username::new("bob").unwrap()]
        );
    }
}
