//! Insert-position resolution
//!
//! Rules sharing a (chain, table) are kept in ascending lexical order of their
//! names, which is why names conventionally start with a zero-padded priority
//! (`010 allow lo`, `100 allow ssh`, `999 drop rest`). The position of a rule is
//! therefore its 1-based rank among the live names plus its own.

/// Returns the 1-based position at which `candidate` belongs among `live_names`.
///
/// `live_names` may already contain `candidate` (the replace case); the first
/// occurrence in sorted order wins, so the result is the same either way.
pub fn insert_position<'a, I>(candidate: &str, live_names: I) -> usize
where
    I: IntoIterator<Item = &'a str>,
{
    let mut names: Vec<&str> = live_names.into_iter().collect();
    if names.is_empty() {
        return 1;
    }

    names.push(candidate);
    names.sort_unstable();

    names
        .iter()
        .position(|n| *n == candidate)
        .map_or(1, |i| i + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_empty_chain() {
        assert_eq!(insert_position("100 allow ssh", []), 1);
    }

    #[test]
    fn test_between_neighbours() {
        let live = ["010 lo", "200 web", "999 drop"];
        assert_eq!(insert_position("100 ssh", live), 2);
        assert_eq!(insert_position("001 first", live), 1);
        assert_eq!(insert_position("999 zzz", live), 4);
    }

    #[test]
    fn test_existing_name_keeps_its_rank() {
        let live = ["010 lo", "100 ssh", "200 web"];
        assert_eq!(insert_position("100 ssh", live), 2);
    }

    #[test]
    fn test_lexical_not_numeric() {
        // "20" sorts after "100"
        assert_eq!(insert_position("20 late", ["100 a", "300 b"]), 2);
    }

    proptest! {
        #[test]
        fn prop_position_is_rank(names in prop::collection::btree_set("[0-9]{3} [a-z]{1,6}", 1..20)) {
            let all: Vec<&str> = names.iter().map(String::as_str).collect();
            for (rank, name) in all.iter().enumerate() {
                let others = all.iter().copied().filter(|n| n != name);
                prop_assert_eq!(insert_position(name, others), rank + 1);
            }
        }

        #[test]
        fn prop_present_or_absent_agree(
            names in prop::collection::btree_set("[0-9]{3} [a-z]{1,6}", 1..20),
            candidate in "[0-9]{3} [a-z]{1,6}",
        ) {
            let without: Vec<&str> = names.iter().map(String::as_str).filter(|n| *n != candidate).collect();
            let mut with = without.clone();
            with.push(candidate.as_str());
            if !without.is_empty() {
                prop_assert_eq!(
                    insert_position(&candidate, without.iter().copied()),
                    insert_position(&candidate, with.iter().copied())
                );
            }
        }
    }
}
