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

//! # types
//!
//! Foundational types for the [emberfeed-cache](crate) crate.

use std::{fmt::Display, ops::Deref};

use serde::{Deserialize, Serialize};

/// The name of a cached set (`"user:42:posts"`, `"users:zset:all"` & so forth)
///
/// Just a newtype over [String]; the naming conventions live with the domain entities, not here.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(transparent)]
pub struct SetName(String);

impl SetName {
    pub fn new(name: impl Into<String>) -> SetName {
        SetName(name.into())
    }
}

impl AsRef<str> for SetName {
    fn as_ref(&self) -> &str {
        self.deref()
    }
}

impl Deref for SetName {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for SetName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SetName {
    fn from(value: &str) -> Self {
        SetName(value.to_owned())
    }
}

/// A set member-- an opaque entity identifier
///
/// Members are entity ids (posts, users). The cache layer doesn't care which; the caller is
/// responsible for not mixing them within one set.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct Member(u64);

impl Member {
    pub fn new(id: u64) -> Member {
        Member(id)
    }
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl Display for Member {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Member {
    fn from(value: u64) -> Self {
        Member(value)
    }
}

impl From<Member> for u64 {
    fn from(value: Member) -> Self {
        value.0
    }
}
