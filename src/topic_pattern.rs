// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Topic routing-key patterns.
//!
//! A pattern is split on `#` into groups of `.`-separated segments. `*`
//! matches exactly one segment, `#` matches zero or more. Interior groups are
//! located with a greedy forward scan and the last group is anchored at the
//! end of the key. Matching never backtracks into an earlier group.

const SINGLE_WORD: &str = "*";
const MULTI_WORD: &str = "#";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    groups: Vec<Vec<String>>,
}

impl TopicPattern {
    pub fn new(pattern: &str) -> TopicPattern {
        let mut groups = vec![vec![]];
        let mut previous_multi = false;

        for segment in pattern.split('.') {
            if segment == MULTI_WORD {
                if !previous_multi {
                    groups.push(vec![]);
                }
                previous_multi = true;
                continue;
            }

            previous_multi = false;
            if let Some(group) = groups.last_mut() {
                group.push(segment.to_owned());
            }
        }

        TopicPattern { groups }
    }

    pub fn matches(&self, routing_key: &str) -> bool {
        let segments: Vec<&str> = routing_key.split('.').collect();

        let (first, rest) = match self.groups.split_first() {
            Some(split) => split,
            None => return false,
        };

        let Some((last, interior)) = rest.split_last() else {
            return first.len() == segments.len() && matches_at(first, &segments, 0);
        };

        if segments.len() < first.len() || !matches_at(first, &segments, 0) {
            return false;
        }

        let mut cursor = first.len();
        for group in interior {
            match find_from(group, &segments, cursor) {
                Some(position) => cursor = position + group.len(),
                None => return false,
            }
        }

        if segments.len() < last.len() {
            return false;
        }
        let start = segments.len() - last.len();

        start >= cursor && matches_at(last, &segments, start)
    }
}

fn matches_at(group: &[String], segments: &[&str], start: usize) -> bool {
    group
        .iter()
        .zip(&segments[start..])
        .all(|(pattern, segment)| pattern == SINGLE_WORD || pattern == segment)
        && segments.len() - start >= group.len()
}

fn find_from(group: &[String], segments: &[&str], from: usize) -> Option<usize> {
    if segments.len() < group.len() {
        return None;
    }

    (from..=segments.len() - group.len()).find(|&start| matches_at(group, segments, start))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(pattern: &str, key: &str) -> bool {
        TopicPattern::new(pattern).matches(key)
    }

    #[test]
    fn single_word_wildcard() {
        assert!(matches("a.*.c", "a.b.c"));
        assert!(matches("*.b.c", "a.b.c"));
        assert!(!matches("*.b.c", "b.c"));
        assert!(!matches("*.b.c", "a.a.b.c"));
        assert!(!matches("a.*.c", "a.b.b.c"));
        assert!(!matches("a.*.c", "a.c"));
        assert!(matches("*", "word"));
        assert!(!matches("*", "two.words"));
    }

    #[test]
    fn multi_word_wildcard() {
        assert!(matches("a.#.c", "a.c"));
        assert!(matches("a.#.c", "a.b.c"));
        assert!(matches("a.#.c", "a.b.b.c"));
        assert!(!matches("a.#.c", "a.b.b.d"));
        assert!(matches("#", "anything.at.all"));
        assert!(matches("#", ""));
        assert!(matches("a.#", "a"));
        assert!(matches("#.c", "a.b.c"));
        assert!(!matches("#.c", "a.b.d"));
    }

    #[test]
    fn interior_groups_scan_forward() {
        assert!(matches("a.#.b.#.c", "a.x.b.y.c"));
        assert!(matches("a.#.b.#.c", "a.b.c"));
        assert!(!matches("a.#.b.#.c", "a.x.y.c"));
        assert!(matches("a.#.c.#.e", "a.b.c.d.e"));
        assert!(matches("a.#.c.#.e", "a.c.e"));
        assert!(!matches("a.#.c.#.e", "a.b.d.e"));
        assert!(matches("#.*.#", "one"));
        assert!(!matches("#.*.*.#", "one"));
    }

    #[test]
    fn consecutive_multi_word_wildcards_collapse() {
        assert_eq!(TopicPattern::new("a.#.#.c"), TopicPattern::new("a.#.c"));
        assert!(matches("a.#.#.c", "a.c"));
    }

    #[test]
    fn last_group_must_not_overlap_interior_match() {
        assert!(!matches("a.#.b.#.b", "a.b"));
        assert!(matches("a.#.b.#.b", "a.b.b"));

        // the last group may not reuse the words of the first
        assert!(!matches("a.#.a", "a"));
        assert!(matches("a.#.a", "a.a"));
        assert!(matches("a.#.a", "a.x.a"));
    }

    #[test]
    fn literal_segments_match_exactly() {
        assert!(matches("stock.usd.nyse", "stock.usd.nyse"));
        assert!(!matches("stock.usd.nyse", "stock.eur.nyse"));
        assert!(!matches("stock.usd", "stock.usd.nyse"));
    }
}
