// Copyright 2024 The Streampool Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use streampool_error::{make_input_err, Error, ResultExt};

/// A single inclusive `[from, to]` range of event ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InclusiveRange {
    pub from: u64,
    pub to: u64,
}

impl InclusiveRange {
    pub const fn new(from: u64, to: u64) -> Self {
        Self { from, to }
    }
}

/// A compact ordered set of inclusive event-id ranges within one stream.
///
/// Events must be added in ascending order. Consecutive ids collapse into a
/// single range, so a task covering events 1..=5 and 8..=9 stores two ranges
/// rather than seven ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InclusiveRanges {
    ranges: Vec<InclusiveRange>,
}

impl InclusiveRanges {
    pub const fn new() -> Self {
        Self { ranges: Vec::new() }
    }

    /// Adds an event id, extending the tail range when contiguous. Ids at or
    /// below the tail range are ignored.
    pub fn add(&mut self, event_id: u64) {
        if let Some(last) = self.ranges.last_mut() {
            if event_id <= last.to {
                return;
            }
            if event_id == last.to + 1 {
                last.to = event_id;
                return;
            }
        }
        self.ranges.push(InclusiveRange::new(event_id, event_id));
    }

    /// Returns a copy containing only the first `len` ranges.
    #[must_use]
    pub fn sub_ranges(&self, len: usize) -> Self {
        Self {
            ranges: self.ranges.iter().take(len).copied().collect(),
        }
    }

    pub fn ranges(&self) -> &[InclusiveRange] {
        &self.ranges
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Total number of event ids covered by all ranges.
    pub fn event_count(&self) -> u64 {
        self.ranges.iter().map(|r| r.to - r.from + 1).sum()
    }
}

impl fmt::Display for InclusiveRanges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for range in &self.ranges {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            if range.from == range.to {
                write!(f, "{}", range.from)?;
            } else {
                write!(f, "{}-{}", range.from, range.to)?;
            }
        }
        Ok(())
    }
}

impl FromStr for InclusiveRanges {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mut ranges = Vec::new();
        if value.is_empty() {
            return Ok(Self { ranges });
        }
        for part in value.split(',') {
            let range = match part.split_once('-') {
                Some((from, to)) => InclusiveRange::new(
                    from.parse()
                        .err_tip(|| format!("Invalid range start in '{part}'"))?,
                    to.parse()
                        .err_tip(|| format!("Invalid range end in '{part}'"))?,
                ),
                None => {
                    let id = part
                        .parse()
                        .err_tip(|| format!("Invalid event id in '{part}'"))?;
                    InclusiveRange::new(id, id)
                }
            };
            if range.to < range.from {
                return Err(make_input_err!("Backwards range '{part}'"));
            }
            ranges.push(range);
        }
        Ok(Self { ranges })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn contiguous_ids_collapse_into_one_range() {
        let mut ranges = InclusiveRanges::new();
        for id in 1..=5 {
            ranges.add(id);
        }
        assert_eq!(ranges.ranges(), &[InclusiveRange::new(1, 5)]);
        assert_eq!(ranges.event_count(), 5);
    }

    #[test]
    fn gaps_open_new_ranges() {
        let mut ranges = InclusiveRanges::new();
        ranges.add(1);
        ranges.add(2);
        ranges.add(7);
        ranges.add(9);
        ranges.add(10);
        assert_eq!(
            ranges.ranges(),
            &[
                InclusiveRange::new(1, 2),
                InclusiveRange::new(7, 7),
                InclusiveRange::new(9, 10)
            ]
        );
    }

    #[test]
    fn out_of_order_ids_are_ignored() {
        let mut ranges = InclusiveRanges::new();
        ranges.add(5);
        ranges.add(3);
        assert_eq!(ranges.ranges(), &[InclusiveRange::new(5, 5)]);
    }

    #[test]
    fn sub_ranges_trims_to_length() {
        let mut ranges = InclusiveRanges::new();
        ranges.add(1);
        ranges.add(3);
        ranges.add(5);
        let trimmed = ranges.sub_ranges(2);
        assert_eq!(trimmed.len(), 2);
        assert_eq!(
            trimmed.ranges(),
            &[InclusiveRange::new(1, 1), InclusiveRange::new(3, 3)]
        );
    }

    #[test]
    fn display_and_parse_round_trip() {
        let mut ranges = InclusiveRanges::new();
        ranges.add(1);
        ranges.add(2);
        ranges.add(3);
        ranges.add(7);
        ranges.add(9);
        ranges.add(10);
        let encoded = ranges.to_string();
        assert_eq!(encoded, "1-3,7,9-10");
        let decoded: InclusiveRanges = encoded.parse().unwrap();
        assert_eq!(decoded, ranges);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("1-x".parse::<InclusiveRanges>().is_err());
        assert!("5-2".parse::<InclusiveRanges>().is_err());
    }
}
