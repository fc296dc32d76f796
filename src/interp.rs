//! String interpolation with reference-cycle detection.
//!
//! A string value may reference another key's string value with `{!key}`
//! syntax. Everything outside a reference is copied verbatim; a literal `{!`
//! is written by doubling the marker character (`{!!`). References resolve
//! against a flat key -> string snapshot of the whole tree, and a referenced
//! value may itself contain references.
//!
//! Every substitution records a "value X references value Y" edge in an
//! acyclic graph that is transitively closed on insert, so indirect cycles
//! (`a -> b -> c -> a`) are rejected as soon as the closing edge appears,
//! before any rescanning can loop forever.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use thiserror::Error;

/// Errors raised while interpolating a string value.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InterpolationError {
    /// A reference names a key with no string value.
    #[error("unknown interpolation key: `{0}`")]
    UnknownKey(String),

    /// A reference marker was opened but never closed.
    #[error("missing terminating `}}` in interpolation reference")]
    Unterminated,

    /// A reference key contains a nested `{`.
    #[error("interpolation keys cannot contain `{{`")]
    NestedMarker,

    /// Substituting the reference would loop back on itself.
    #[error("interpolation cycle through `{0}`")]
    Cycle(String),
}

/// A directed graph that rejects edges closing a cycle.
///
/// Each node maps to the set of nodes reachable from it; inserting `u -> v`
/// extends `u`'s set with `v` and everything `v` reaches, then propagates the
/// same set to every node that already reaches `u`. An edge whose target
/// already reaches its source is refused.
#[derive(Debug, Default)]
struct AcyclicGraph {
    reach: HashMap<String, HashSet<String>>,
}

impl AcyclicGraph {
    fn add_edge(&mut self, from: &str, to: &str) -> Result<(), InterpolationError> {
        if from == to
            || self
                .reach
                .get(to)
                .is_some_and(|reachable| reachable.contains(from))
        {
            return Err(InterpolationError::Cycle(to.to_owned()));
        }

        let mut grown: HashSet<String> = self.reach.get(to).cloned().unwrap_or_default();
        grown.insert(to.to_owned());

        self.reach
            .entry(from.to_owned())
            .or_default()
            .extend(grown.iter().cloned());

        for reachable in self.reach.values_mut() {
            if reachable.contains(from) {
                reachable.extend(grown.iter().cloned());
            }
        }
        Ok(())
    }
}

/// The `{!key}` substitution engine.
pub struct Interpolator;

impl Interpolator {
    /// True if `text` contains a reference marker that interpolation would
    /// rewrite. Values for which this holds must not be cached in their
    /// unresolved form.
    pub fn eligible(text: &str) -> bool {
        let bytes = text.as_bytes();
        let mut i = 0;
        while let Some(offset) = text[i..].find("{!") {
            let next = i + offset + 2;
            if bytes.get(next) != Some(&b'!') {
                return true;
            }
            i = next + 1;
        }
        false
    }

    /// Resolve every reference in `text`, which is the string value of
    /// `key`. `values` is a flat key -> string snapshot of the tree.
    pub fn interpolate(
        key: &str,
        text: &str,
        values: &IndexMap<String, String>,
    ) -> Result<String, InterpolationError> {
        let mut graph = AcyclicGraph::default();
        Self::resolve(key, text, values, &mut graph)
    }

    fn resolve(
        key: &str,
        text: &str,
        values: &IndexMap<String, String>,
        graph: &mut AcyclicGraph,
    ) -> Result<String, InterpolationError> {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;

        while let Some(start) = rest.find("{!") {
            let after = &rest[start + 2..];

            // an escaped marker passes through verbatim
            if after.starts_with('!') {
                out.push_str(&rest[..start + 2]);
                rest = after;
                continue;
            }

            out.push_str(&rest[..start]);

            let end = match after.find(['}', '{']) {
                Some(i) if after.as_bytes()[i] == b'{' => {
                    return Err(InterpolationError::NestedMarker);
                }
                Some(i) => i,
                None => return Err(InterpolationError::Unterminated),
            };

            let reference = &after[..end];
            graph.add_edge(key, reference)?;

            let raw = values
                .get(reference)
                .ok_or_else(|| InterpolationError::UnknownKey(reference.to_owned()))?;
            out.push_str(&Self::resolve(reference, raw, values, graph)?);

            rest = &after[end + 1..];
        }

        out.push_str(rest);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(pairs: &[(&str, &str)]) -> IndexMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn literal_text_passes_through() {
        let values = snapshot(&[]);
        assert_eq!(
            Interpolator::interpolate("k", "plain text", &values).unwrap(),
            "plain text"
        );
    }

    #[test]
    fn single_reference() {
        let values = snapshot(&[("host", "8.8.8.8")]);
        assert_eq!(
            Interpolator::interpolate("url", "http://{!host}/", &values).unwrap(),
            "http://8.8.8.8/"
        );
    }

    #[test]
    fn chained_references() {
        let values = snapshot(&[("a", "1"), ("b", "{!a}x"), ("c", "{!b}y")]);
        assert_eq!(
            Interpolator::interpolate("c", "{!b}y", &values).unwrap(),
            "1xy"
        );
    }

    #[test]
    fn direct_cycle() {
        let values = snapshot(&[("a", "{!b}"), ("b", "{!a}")]);
        assert_eq!(
            Interpolator::interpolate("a", "{!b}", &values),
            Err(InterpolationError::Cycle("a".into()))
        );
    }

    #[test]
    fn indirect_cycle() {
        let values = snapshot(&[("a", "{!b}"), ("b", "{!c}"), ("c", "{!a}")]);
        assert!(matches!(
            Interpolator::interpolate("a", "{!b}", &values),
            Err(InterpolationError::Cycle(_))
        ));
    }

    #[test]
    fn self_reference() {
        let values = snapshot(&[("a", "{!a}")]);
        assert_eq!(
            Interpolator::interpolate("a", "{!a}", &values),
            Err(InterpolationError::Cycle("a".into()))
        );
    }

    #[test]
    fn diamond_is_not_a_cycle() {
        // d is referenced twice but nothing loops
        let values = snapshot(&[("a", "{!b} {!c}"), ("b", "{!d}"), ("c", "{!d}"), ("d", "x")]);
        assert_eq!(
            Interpolator::interpolate("a", "{!b} {!c}", &values).unwrap(),
            "x x"
        );
    }

    #[test]
    fn escaped_marker() {
        let values = snapshot(&[]);
        assert_eq!(
            Interpolator::interpolate("k", "{!!literal}", &values).unwrap(),
            "{!!literal}"
        );
        assert!(!Interpolator::eligible("{!!literal}"));
        assert!(Interpolator::eligible("{!!x} and {!real}"));
    }

    #[test]
    fn unknown_key() {
        let values = snapshot(&[]);
        assert_eq!(
            Interpolator::interpolate("k", "{!missing}", &values),
            Err(InterpolationError::UnknownKey("missing".into()))
        );
    }

    #[test]
    fn unterminated_reference() {
        let values = snapshot(&[("a", "1")]);
        assert_eq!(
            Interpolator::interpolate("k", "{!a", &values),
            Err(InterpolationError::Unterminated)
        );
    }

    #[test]
    fn nested_marker_rejected() {
        let values = snapshot(&[]);
        assert_eq!(
            Interpolator::interpolate("k", "{!a{b}", &values),
            Err(InterpolationError::NestedMarker)
        );
    }

    #[test]
    fn transitive_closure_on_insert() {
        let mut graph = AcyclicGraph::default();
        graph.add_edge("a", "b").unwrap();
        graph.add_edge("b", "c").unwrap();
        // a now reaches c through b, so c -> a must close a cycle
        assert!(graph.add_edge("c", "a").is_err());
    }
}
