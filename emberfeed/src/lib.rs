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

//! # emberfeed
//!
//! The ranked-feed & popularity machinery for an ephemeral-posts service: a write-through cache
//! of per-entity ranked sets kept consistent with the authoritative relational store, warmed
//! lazily, read through [ranked] & blended into a discovery feed by [feed]. This is a library;
//! request handlers call [popularity::PopularityLedger] for every ranking mutation & the query
//! types for every ranking read. There is no wire format here.
pub mod background_tasks;
pub mod entities;
pub mod feed;
pub mod memory;
pub mod metrics;
pub mod notifications;
pub mod popularity;
pub mod ranked;
pub mod storage;
pub mod warmer;
