//! Topic filter matching per MQTT 3.1.1.
//!
//! `/` separates levels, `+` matches exactly one level, `#` must be the
//! last level and matches the remainder of the topic, including zero
//! levels. Both filter and topic must be fully consumed for a match.

/// Returns whether `topic` matches the (possibly wildcarded) `filter`.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match filter_levels.next() {
            // matches the remainder unless the filter is malformed and
            // carries levels past the '#'
            Some("#") => return filter_levels.next().is_none(),
            Some("+") => match topic_levels.next() {
                Some(_) => continue,
                None => return false,
            },
            Some(level) => match topic_levels.next() {
                Some(name) if name == level => continue,
                _ => return false,
            },
            None => return topic_levels.next().is_none(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact() {
        assert!(topic_matches("a/b/c", "a/b/c"));
        assert!(!topic_matches("a/b/c", "a/b"));
        assert!(!topic_matches("a/b", "a/b/c"));
        assert!(!topic_matches("a/b/c", "a/b/d"));
        assert!(topic_matches("a//c", "a//c"));
    }

    #[test]
    fn test_single_level_wildcard() {
        assert!(topic_matches("a/+/c", "a/b/c"));
        assert!(topic_matches("a/+/c", "a//c"));
        assert!(!topic_matches("a/+/c", "a/b/c/d"));
        assert!(!topic_matches("a/+", "a"));
        assert!(topic_matches("+/b", "a/b"));
        assert!(topic_matches("+/b", "/b"));
        assert!(topic_matches("+", "a"));
        assert!(!topic_matches("+", "a/b"));
    }

    #[test]
    fn test_multi_level_wildcard() {
        assert!(topic_matches("#", "a"));
        assert!(topic_matches("#", "a/b/c"));
        assert!(topic_matches("a/#", "a"));
        assert!(topic_matches("a/#", "a/"));
        assert!(topic_matches("a/#", "a/b/c/d"));
        assert!(!topic_matches("a/#", "b"));
        assert!(!topic_matches("b/#", "a/b"));
    }

    // the match matrix from the documented filter/topic truth table
    #[test]
    fn test_match_matrix() {
        let filters = ["a/+/c", "a/#", "+/b", "#"];
        let topics = ["a/b/c", "a/", "b", "a/b/c/d"];
        let expected = [
            [true, false, false, false],  // a/+/c
            [true, true, false, true],    // a/#
            [false, false, false, false], // +/b
            [true, true, true, true],     // #
        ];

        for (f, filter) in filters.iter().enumerate() {
            for (t, topic) in topics.iter().enumerate() {
                assert_eq!(
                    topic_matches(filter, topic),
                    expected[f][t],
                    "filter {:?} against topic {:?}",
                    filter,
                    topic
                );
            }
        }
    }

    // equality subsumes the matcher for wildcard-free filters
    #[test]
    fn test_equality_subsumes_matcher() {
        let samples = ["a", "a/b", "a//c", "sensors/a/t", ""];

        for filter in &samples {
            for topic in &samples {
                if filter == topic {
                    assert!(topic_matches(filter, topic));
                } else {
                    assert!(!topic_matches(filter, topic));
                }
            }
        }
    }

    #[test]
    fn test_malformed_multi_level() {
        assert!(!topic_matches("a/#/b", "a/x/b"));
    }
}
