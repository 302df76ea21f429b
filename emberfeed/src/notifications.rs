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

//! # notifications
//!
//! The notification *dispatcher* contract. Delivery mechanics (push services, device registries &
//! so on) live on the far side of the [Sink] trait and are somebody else's problem; this crate's
//! commitment is strictly best-effort: notifications are composed after ranking mutations, handed
//! to a background task, and failures are logged & forgotten. Nothing user-facing ever waits on,
//! or fails because of, a notification.

use std::error::Error as StdError;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, Snafu};
use tracing::info;

use crate::entities::{PostId, UserId};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to deliver a notification: {source}"))]
    Deliver {
        source: Box<dyn StdError + Send + Sync + 'static>,
        backtrace: Backtrace,
    },
}

impl Error {
    pub fn deliver(err: impl StdError + Send + Sync + 'static) -> Error {
        Error::Deliver {
            source: Box::new(err),
            backtrace: Backtrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          Notification                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// What happened, in machine-readable form; rides along as the notification's payload
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Event {
    /// Someone started following the recipient
    StartedFollow { follower: UserId },
    /// The recipient was `@`-mentioned in a post
    MentionedInPost { post: PostId },
    /// A post of the recipient's crossed a vote-count milestone
    VotesReached { post: PostId, milestone: u32 },
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Notification {
    /// The recipient
    pub user: UserId,
    /// Human-readable text
    pub message: String,
    pub event: Event,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           milestones                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Vote counts at which a "votes reached" notification goes out
pub const VOTE_MILESTONES: [u32; 5] = [10, 25, 50, 100, 500];

/// Did the move from `old` to `new` cross a milestone? If it crossed several at once (bulk
/// adjustments), report the highest.
pub fn crossed_milestone(old: u32, new: u32) -> Option<u32> {
    VOTE_MILESTONES
        .iter()
        .rev()
        .find(|&&m| old < m && m <= new)
        .copied()
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Sink                                                //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Object-safe trait abstracting over the delivery mechanism
#[async_trait]
pub trait Sink {
    async fn deliver(&self, notification: &Notification) -> Result<()>;
}

/// A [Sink] that just writes to the log; the default for deployments with no push
/// infrastructure, & handy in tests.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl Sink for LogSink {
    async fn deliver(&self, notification: &Notification) -> Result<()> {
        info!(
            "Notify user {}: {} ({:?})",
            notification.user, notification.message, notification.event
        );
        Ok(())
    }
}

#[cfg(test)]
mod check_milestones {
    use super::*;

    #[test]
    fn smoke() {
        assert_eq!(crossed_milestone(9, 10), Some(10));
        assert_eq!(crossed_milestone(10, 11), None);
        assert_eq!(crossed_milestone(24, 26), Some(25));
        assert_eq!(crossed_milestone(0, 600), Some(500)); // several at once: highest wins
        assert_eq!(crossed_milestone(11, 9), None); // downward moves never fire
        assert_eq!(crossed_milestone(10, 10), None);
    }
}
