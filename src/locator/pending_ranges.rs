//! The per-keyspace pending-range interval map.
//!
//! Pending ranges are kept as a sorted vector of disjoint segments of the
//! token line, each carrying the set of endpoints that will own any token
//! inside it; lookups are a binary search by bound. Overlapping input
//! ranges are split and their endpoint sets unioned while the map is
//! built.

use std::collections::{HashMap, HashSet};
use std::ops::Bound;

use smallvec::SmallVec;
use tokio::task::consume_budget;

use crate::locator::topology::Endpoint;
use crate::routing::{Token, TokenInterval, TokenRange};

/// Endpoints gaining ownership of a token during a topology change.
/// Nearly always a single endpoint, hence the inline capacity.
pub type PendingEndpoints = SmallVec<[Endpoint; 1]>;

/// A point between tokens on the token line. `after` selects the
/// position immediately past `token`, so that every bound flavor of a
/// [`TokenRange`] maps onto a half-open `[start, end)` segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct RingPosition {
    token: Token,
    after: bool,
}

impl RingPosition {
    fn at(token: Token) -> Self {
        Self {
            token,
            after: false,
        }
    }

    fn past(token: Token) -> Self {
        Self { token, after: true }
    }

    /// Unbounded sides default to the minimum token.
    fn lower(bound: Bound<Token>) -> Self {
        match bound {
            Bound::Included(token) => Self::at(token),
            Bound::Excluded(token) => Self::past(token),
            Bound::Unbounded => Self::at(Token::minimum()),
        }
    }

    /// Unbounded sides default to the maximum token.
    fn upper(bound: Bound<Token>) -> Self {
        match bound {
            Bound::Included(token) => Self::past(token),
            Bound::Excluded(token) => Self::at(token),
            Bound::Unbounded => Self::past(Token::maximum()),
        }
    }
}

#[derive(Debug, Clone)]
struct Segment {
    start: RingPosition,
    end: RingPosition,
    endpoints: HashSet<Endpoint>,
}

/// Interval map from token range to the set of endpoints that will own
/// any token in that range once current transitions finish.
#[derive(Debug, Clone, Default)]
pub(crate) struct PendingRanges {
    segments: Vec<Segment>,
}

impl PendingRanges {
    /// Builds the map from `(range, endpoint)` entries, unioning endpoint
    /// sets where ranges overlap and joining adjacent segments with equal
    /// sets. Yields between entries.
    pub(crate) async fn build(entries: Vec<(TokenRange, Endpoint)>) -> PendingRanges {
        let mut events: Vec<(RingPosition, bool, Endpoint)> = Vec::with_capacity(entries.len() * 2);
        for (range, endpoint) in entries {
            let interval = TokenInterval::from(range);
            let start = RingPosition::lower(interval.lower);
            let end = RingPosition::upper(interval.upper);
            if start < end {
                events.push((start, true, endpoint));
                events.push((end, false, endpoint));
            }
            consume_budget().await;
        }
        events.sort_unstable_by_key(|(position, _, _)| *position);

        // Sweep the boundaries left to right, maintaining the multiset of
        // endpoints whose ranges cover the current position.
        let mut segments: Vec<Segment> = Vec::new();
        let mut active: HashMap<Endpoint, usize> = HashMap::new();
        let mut cursor: Option<RingPosition> = None;
        let mut i = 0;
        while i < events.len() {
            let position = events[i].0;
            if let Some(start) = cursor {
                if start < position && !active.is_empty() {
                    push_segment(
                        &mut segments,
                        start,
                        position,
                        active.keys().copied().collect(),
                    );
                }
            }
            while i < events.len() && events[i].0 == position {
                let (_, opening, endpoint) = events[i];
                if opening {
                    *active.entry(endpoint).or_insert(0) += 1;
                } else if let Some(count) = active.get_mut(&endpoint) {
                    *count -= 1;
                    if *count == 0 {
                        active.remove(&endpoint);
                    }
                }
                i += 1;
            }
            cursor = Some(position);
            consume_budget().await;
        }

        PendingRanges { segments }
    }

    /// Endpoints of the segment containing `token`, in unspecified order.
    pub(crate) fn endpoints_for(&self, token: Token) -> PendingEndpoints {
        let position = RingPosition::at(token);
        let idx = self
            .segments
            .partition_point(|segment| segment.start <= position);
        match idx.checked_sub(1) {
            Some(i) if position < self.segments[i].end => {
                self.segments[i].endpoints.iter().copied().collect()
            }
            _ => PendingEndpoints::new(),
        }
    }

    pub(crate) fn contains_endpoint(&self, endpoint: Endpoint) -> bool {
        self.segments
            .iter()
            .any(|segment| segment.endpoints.contains(&endpoint))
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

fn push_segment(
    segments: &mut Vec<Segment>,
    start: RingPosition,
    end: RingPosition,
    endpoints: HashSet<Endpoint>,
) {
    if let Some(last) = segments.last_mut() {
        if last.end == start && last.endpoints == endpoints {
            last.end = end;
            return;
        }
    }
    segments.push(Segment {
        start,
        end,
        endpoints,
    });
}

#[cfg(test)]
mod tests {
    use super::PendingRanges;
    use crate::routing::{Token, TokenBound, TokenRange};
    use crate::test_utils::{setup_tracing, test_endpoint};

    fn left_open(start: i64, end: i64) -> TokenRange {
        TokenRange::new(
            Some(TokenBound::exclusive(Token::new(start))),
            Some(TokenBound::inclusive(Token::new(end))),
        )
    }

    #[tokio::test]
    async fn empty_input_builds_empty_map() {
        setup_tracing();
        let map = PendingRanges::build(Vec::new()).await;
        assert!(map.is_empty());
        assert!(map.endpoints_for(Token::new(5)).is_empty());
    }

    #[tokio::test]
    async fn disjoint_ranges_keep_their_endpoints() {
        setup_tracing();
        let (a, b) = (test_endpoint(1), test_endpoint(2));
        let map =
            PendingRanges::build(vec![(left_open(0, 10), a), (left_open(20, 30), b)]).await;

        assert_eq!(map.endpoints_for(Token::new(5)).as_slice(), &[a]);
        assert_eq!(map.endpoints_for(Token::new(25)).as_slice(), &[b]);
        assert!(map.endpoints_for(Token::new(15)).is_empty());
        // Left-open start, right-closed end.
        assert!(map.endpoints_for(Token::new(0)).is_empty());
        assert_eq!(map.endpoints_for(Token::new(10)).as_slice(), &[a]);
    }

    #[tokio::test]
    async fn overlapping_ranges_union_endpoint_sets() {
        setup_tracing();
        let (a, b) = (test_endpoint(1), test_endpoint(2));
        let map =
            PendingRanges::build(vec![(left_open(0, 20), a), (left_open(10, 30), b)]).await;

        let mut both = map.endpoints_for(Token::new(15)).to_vec();
        both.sort_unstable();
        assert_eq!(both, vec![a, b]);
        assert_eq!(map.endpoints_for(Token::new(5)).as_slice(), &[a]);
        assert_eq!(map.endpoints_for(Token::new(25)).as_slice(), &[b]);
        assert!(map.contains_endpoint(a));
        assert!(map.contains_endpoint(b));
        assert!(!map.contains_endpoint(test_endpoint(3)));
    }

    #[tokio::test]
    async fn duplicate_entries_collapse() {
        setup_tracing();
        let a = test_endpoint(1);
        let map =
            PendingRanges::build(vec![(left_open(0, 10), a), (left_open(0, 10), a)]).await;
        assert_eq!(map.endpoints_for(Token::new(5)).as_slice(), &[a]);
    }

    #[tokio::test]
    async fn unbounded_sides_cover_the_space_ends() {
        setup_tracing();
        let a = test_endpoint(1);
        let wrap_high = TokenRange::new(Some(TokenBound::exclusive(Token::new(30))), None);
        let wrap_low = TokenRange::new(None, Some(TokenBound::inclusive(Token::new(10))));
        let map = PendingRanges::build(vec![(wrap_high, a), (wrap_low, a)]).await;

        assert_eq!(map.endpoints_for(Token::maximum()).as_slice(), &[a]);
        assert_eq!(map.endpoints_for(Token::minimum()).as_slice(), &[a]);
        assert_eq!(map.endpoints_for(Token::new(10)).as_slice(), &[a]);
        assert!(map.endpoints_for(Token::new(20)).is_empty());
    }
}
