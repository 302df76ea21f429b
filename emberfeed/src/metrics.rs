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

//! # emberfeed metrics
//!
//! [OpenTelemetry] instruments are meant to be created once & reused, which raises the question
//! of where to keep them. Rather than hang dozens of `Counter<u64>` fields off the application
//! state, each collection site registers its metric by name & sort with the [inventory] crate:
//!
//! [OpenTelemetry]: https://docs.rs/opentelemetry/latest/opentelemetry/index.html
//!
//! ```ignore
//! inventory::submit! { metrics::Registration::new("ledger.votes.cast", Sort::IntegralCounter) }
//! ```
//!
//! One [Instruments] instance is built at startup; its constructor walks the registrations,
//! pre-builds every instrument & panics on a name collision (a logic error best caught
//! immediately). At the collection site:
//!
//! ```ignore
//! counter_add!(instruments, "ledger.votes.cast", 1, &[]);
//! ```
//!
//! The lookup panics if the name was never registered or names an instrument of the wrong sort--
//! again, logic errors, not conditions to push onto callers as `Result`s.

use std::collections::HashMap;

use opentelemetry::{
    global,
    metrics::{Counter, Gauge, Meter},
    KeyValue,
};

/// Instrument type
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Sort {
    /// Corresponds to `Counter<u64>`
    IntegralCounter,
    /// Corresponds to `Gauge<u64>`
    IntegralGauge,
}

/// The thing being inventoried: a metric name & its sort
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Registration {
    name: &'static str,
    sort: Sort,
}

impl Registration {
    pub const fn new(name: &'static str, sort: Sort) -> Registration {
        Registration { name, sort }
    }
    pub fn name(&self) -> String {
        self.name.to_string()
    }
    pub fn sort(&self) -> Sort {
        self.sort
    }
}

inventory::collect!(Registration);

/// Container for OTel instruments, one typed map per sort
///
/// Pre-building everything at construction is what lets the collection-site methods take `&self`;
/// an [Instruments] rides happily inside an `Arc`.
pub struct Instruments {
    counters: HashMap<&'static str, Counter<u64>>,
    gauges: HashMap<&'static str, Gauge<u64>>,
}

impl Instruments {
    pub fn new(prefix: &'static str) -> Instruments {
        let meter: Meter = global::meter(prefix);
        let mut instruments = Instruments {
            counters: HashMap::new(),
            gauges: HashMap::new(),
        };
        for reg in inventory::iter::<Registration> {
            let taken = match reg.sort() {
                Sort::IntegralCounter => instruments
                    .counters
                    .insert(reg.name, meter.u64_counter(reg.name).build())
                    .is_some(),
                Sort::IntegralGauge => instruments
                    .gauges
                    .insert(reg.name, meter.u64_gauge(reg.name).build())
                    .is_some(),
            };
            if taken {
                panic!("The metric name {} was registered twice", reg.name);
            }
        }
        instruments
    }
    // panics if `name` doesn't name a counter
    pub fn add(&self, name: &str, count: u64, attributes: &[KeyValue]) {
        match self.counters.get(name) {
            Some(counter) => counter.add(count, attributes),
            None => panic!("{} does not name a counter", name),
        }
    }
    // panics if `name` doesn't name a gauge
    pub fn recordu(&self, name: &str, value: u64, attributes: &[KeyValue]) {
        match self.gauges.get(name) {
            Some(gauge) => gauge.record(value, attributes),
            None => panic!("{} does not name a gauge", name),
        }
    }
}

#[macro_export]
macro_rules! counter_add {
    ($instr:expr, $name:expr, $count:expr, $attrs:expr) => {
        $instr.add($name, $count, $attrs);
    };
}

#[macro_export]
macro_rules! gauge_setu {
    ($instr:expr, $name:expr, $value:expr, $attrs:expr) => {
        $instr.recordu($name, $value, $attrs);
    };
}
