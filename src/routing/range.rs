//! Token ranges with independently open or closed bounds, and their
//! interval form used by the pending-range map.

use std::ops::Bound;

use itertools::Either;

use super::Token;

/// One bound of a [`TokenRange`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TokenBound {
    pub value: Token,
    pub inclusive: bool,
}

impl TokenBound {
    #[inline]
    pub fn new(value: Token, inclusive: bool) -> Self {
        Self { value, inclusive }
    }

    #[inline]
    pub fn inclusive(value: Token) -> Self {
        Self::new(value, true)
    }

    #[inline]
    pub fn exclusive(value: Token) -> Self {
        Self::new(value, false)
    }
}

/// A non-wrapping range of tokens. A missing bound means the range
/// extends to the minimum (start) or maximum (end) of the token space.
///
/// Circular arcs crossing the ends of the token line are expanded into
/// two such ranges with [`TokenRange::expand_arc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TokenRange {
    pub start: Option<TokenBound>,
    pub end: Option<TokenBound>,
}

impl TokenRange {
    #[inline]
    pub fn new(start: Option<TokenBound>, end: Option<TokenBound>) -> Self {
        Self { start, end }
    }

    /// The whole token space.
    #[inline]
    pub fn full() -> Self {
        Self::new(None, None)
    }

    /// The token looked up when computing the natural endpoints of this
    /// range: its end bound, or the maximum token when the range is
    /// end-unbounded.
    pub fn end_token(&self) -> Token {
        self.end.map_or(Token::maximum(), |bound| bound.value)
    }

    /// Whether the range contains `token`.
    pub fn contains(&self, token: Token) -> bool {
        let after_start = match self.start {
            None => true,
            Some(bound) if bound.inclusive => token >= bound.value,
            Some(bound) => token > bound.value,
        };
        let before_end = match self.end {
            None => true,
            Some(bound) if bound.inclusive => token <= bound.value,
            Some(bound) => token < bound.value,
        };
        after_start && before_end
    }

    /// Expands the circular half-open arc `(left, right]` into
    /// non-wrapping ranges: one when `left < right`, two when the arc
    /// crosses the ends of the token line. A single-token ring, where
    /// `left == right`, covers the whole space.
    pub fn expand_arc(left: Token, right: Token) -> impl Iterator<Item = TokenRange> {
        if left < right {
            Either::Left(std::iter::once(TokenRange::new(
                Some(TokenBound::exclusive(left)),
                Some(TokenBound::inclusive(right)),
            )))
        } else {
            Either::Right(
                [
                    TokenRange::new(Some(TokenBound::exclusive(left)), None),
                    TokenRange::new(None, Some(TokenBound::inclusive(right))),
                ]
                .into_iter(),
            )
        }
    }
}

/// The interval form of a [`TokenRange`], keyed on by the pending-range
/// interval map. Conversions in either direction preserve every
/// combination of open, closed and unbounded sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenInterval {
    pub lower: Bound<Token>,
    pub upper: Bound<Token>,
}

impl From<TokenRange> for TokenInterval {
    fn from(range: TokenRange) -> TokenInterval {
        let bound = |b: Option<TokenBound>| match b {
            None => Bound::Unbounded,
            Some(b) if b.inclusive => Bound::Included(b.value),
            Some(b) => Bound::Excluded(b.value),
        };
        TokenInterval {
            lower: bound(range.start),
            upper: bound(range.end),
        }
    }
}

impl From<TokenInterval> for TokenRange {
    fn from(interval: TokenInterval) -> TokenRange {
        let bound = |b: Bound<Token>| match b {
            Bound::Unbounded => None,
            Bound::Included(value) => Some(TokenBound::inclusive(value)),
            Bound::Excluded(value) => Some(TokenBound::exclusive(value)),
        };
        TokenRange {
            start: bound(interval.lower),
            end: bound(interval.upper),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Token, TokenBound, TokenInterval, TokenRange};

    #[test]
    fn range_interval_round_trip() {
        let starts = [
            None,
            Some(TokenBound::inclusive(Token::new(5))),
            Some(TokenBound::exclusive(Token::new(5))),
        ];
        let ends = [
            None,
            Some(TokenBound::inclusive(Token::new(10))),
            Some(TokenBound::exclusive(Token::new(10))),
        ];
        for start in starts {
            for end in ends {
                let range = TokenRange::new(start, end);
                assert_eq!(TokenRange::from(TokenInterval::from(range)), range);
            }
        }
    }

    #[test]
    fn contains_respects_bound_openness() {
        let range = TokenRange::new(
            Some(TokenBound::exclusive(Token::new(10))),
            Some(TokenBound::inclusive(Token::new(20))),
        );
        assert!(!range.contains(Token::new(10)));
        assert!(range.contains(Token::new(11)));
        assert!(range.contains(Token::new(20)));
        assert!(!range.contains(Token::new(21)));

        assert!(TokenRange::full().contains(Token::minimum()));
        assert!(TokenRange::full().contains(Token::maximum()));
    }

    #[test]
    fn expand_arc_without_wrap() {
        let ranges: Vec<TokenRange> =
            TokenRange::expand_arc(Token::new(10), Token::new(20)).collect();
        assert_eq!(
            ranges,
            vec![TokenRange::new(
                Some(TokenBound::exclusive(Token::new(10))),
                Some(TokenBound::inclusive(Token::new(20))),
            )]
        );
    }

    #[test]
    fn expand_arc_with_wrap() {
        let ranges: Vec<TokenRange> =
            TokenRange::expand_arc(Token::new(30), Token::new(10)).collect();
        assert_eq!(ranges.len(), 2);
        assert!(ranges[0].contains(Token::new(31)));
        assert!(ranges[0].contains(Token::maximum()));
        assert!(!ranges[0].contains(Token::new(30)));
        assert!(ranges[1].contains(Token::minimum()));
        assert!(ranges[1].contains(Token::new(10)));
        assert!(!ranges[1].contains(Token::new(11)));
    }

    #[test]
    fn expand_arc_single_token_covers_everything() {
        let ranges: Vec<TokenRange> =
            TokenRange::expand_arc(Token::new(10), Token::new(10)).collect();
        assert_eq!(ranges.len(), 2);
        for probe in [i64::MIN + 1, -5, 0, 10, 11, i64::MAX] {
            let covered = ranges
                .iter()
                .filter(|r| r.contains(Token::new(probe)))
                .count();
            assert_eq!(covered, 1, "token {probe} not covered exactly once");
        }
    }

    #[test]
    fn end_token_defaults_to_maximum() {
        let unbounded = TokenRange::new(Some(TokenBound::exclusive(Token::new(10))), None);
        assert_eq!(unbounded.end_token(), Token::maximum());
        let bounded = TokenRange::new(None, Some(TokenBound::inclusive(Token::new(7))));
        assert_eq!(bounded.end_token(), Token::new(7));
    }
}
