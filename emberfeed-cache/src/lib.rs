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

//! # emberfeed-cache
//!
//! The scored-set cache layer underneath [emberfeed]'s popularity machinery: named, ordered sets
//! of (score, member-id) pairs with an explicit notion of *warmth*, plus plain membership sets
//! for random sampling. See the [store] module docs for the contract, & the [memory] and [redis]
//! modules for the two engines.
//!
//! [emberfeed]: https://crates.io/crates/emberfeed
pub mod memory;
pub mod redis;
pub mod store;
pub mod types;
