//! Subject pattern matching with NATS wildcard semantics.
//!
//! Registered patterns form an immutable trie: literal tokens descend
//! through a map, `*` through a dedicated wildcard child, and `>` marks a
//! node as tail-terminal (it captures every subject rooted at its prefix).
//! Resolution returns the most specific registered pattern for a concrete
//! subject.

use std::collections::HashMap;
use std::ops::Range;

/// Single-token wildcard.
pub const TOKEN_WILDCARD: &str = "*";

/// Tail wildcard; matches the rest of the subject.
pub const TAIL_WILDCARD: &str = ">";

#[derive(Debug, Default)]
struct Node {
    /// Literal children, keyed by token. Case-sensitive.
    children: HashMap<String, usize>,
    /// The `*` child, if any pattern descends through a wildcard here.
    wildcard: Option<usize>,
    /// Pattern id of a `>` terminating at this node.
    tail: Option<usize>,
    /// Pattern id of a pattern ending exactly at this node.
    exact: Option<usize>,
}

/// Candidate kind, ordered so an exact end outranks a tail wildcard at
/// equal depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum CandidateKind {
    Tail = 0,
    Exact = 1,
}

/// An immutable trie of subject patterns.
///
/// # Example
///
/// ```rust
/// use messaging::SubjectMatcher;
///
/// let matcher = SubjectMatcher::from_patterns(["a.b.c", "a.*.c", "a.>"]);
/// assert_eq!(matcher.resolve("a.b.c"), Some("a.b.c"));
/// assert_eq!(matcher.resolve("a.x.c"), Some("a.*.c"));
/// assert_eq!(matcher.resolve("a.x.y.z"), Some("a.>"));
/// assert_eq!(matcher.resolve("b.c"), None);
/// ```
#[derive(Debug)]
pub struct SubjectMatcher {
    nodes: Vec<Node>,
    patterns: Vec<String>,
}

impl Default for SubjectMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl SubjectMatcher {
    /// Create an empty matcher.
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::default()],
            patterns: Vec::new(),
        }
    }

    /// Build a matcher from a set of patterns.
    pub fn from_patterns<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut matcher = Self::new();
        for pattern in patterns {
            matcher.insert(pattern);
        }
        matcher
    }

    /// Number of registered patterns.
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Whether no pattern has been registered.
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Register a pattern.
    ///
    /// Empty tokens are skipped. Everything after a `>` token is ignored.
    /// Re-inserting a pattern overwrites the previous registration, so the
    /// most recent insertion wins ties.
    pub fn insert(&mut self, pattern: impl Into<String>) {
        let pattern = pattern.into();
        let pattern_id = self.patterns.len();

        let mut node = 0usize;
        let mut tail = false;
        for token in pattern.split('.') {
            if token.is_empty() {
                continue;
            }
            if token == TAIL_WILDCARD {
                self.nodes[node].tail = Some(pattern_id);
                tail = true;
                break;
            }
            node = if token == TOKEN_WILDCARD {
                match self.nodes[node].wildcard {
                    Some(next) => next,
                    None => {
                        let next = self.push_node();
                        self.nodes[node].wildcard = Some(next);
                        next
                    }
                }
            } else {
                match self.nodes[node].children.get(token) {
                    Some(&next) => next,
                    None => {
                        let next = self.push_node();
                        self.nodes[node].children.insert(token.to_string(), next);
                        next
                    }
                }
            };
        }

        if !tail {
            self.nodes[node].exact = Some(pattern_id);
        }
        self.patterns.push(pattern);
    }

    /// Resolve a concrete subject to the most specific registered pattern.
    ///
    /// Depth decides first (a deeper match is more specific), an exact end
    /// beats a `>` at equal depth, and literal descent is explored before
    /// wildcard descent so the more literal of two equally deep patterns
    /// wins.
    pub fn resolve<'a>(&'a self, subject: &str) -> Option<&'a str> {
        let tokens = token_ranges(subject);
        let total = tokens.len();

        let mut best: Option<(usize, CandidateKind, usize)> = None;
        let mut consider = |depth: usize, kind: CandidateKind, id: usize| {
            if best.map_or(true, |(d, k, _)| (depth, kind) > (d, k)) {
                best = Some((depth, kind, id));
            }
        };

        // Alternatives to revisit: (node, token index).
        let mut backtrack: Vec<(usize, usize)> = Vec::new();
        let mut cursor = Some((0usize, 0usize));

        while let Some((node_id, index)) = cursor.take() {
            let node = &self.nodes[node_id];

            if let Some(id) = node.tail {
                consider(total, CandidateKind::Tail, id);
            }

            if index == total {
                if let Some(id) = node.exact {
                    consider(index, CandidateKind::Exact, id);
                }
            } else {
                let token = &subject[tokens[index].clone()];
                let literal = node.children.get(token).copied();
                let wildcard = node.wildcard;
                match (literal, wildcard) {
                    (Some(next), Some(alt)) => {
                        backtrack.push((alt, index + 1));
                        cursor = Some((next, index + 1));
                    }
                    (Some(next), None) | (None, Some(next)) => {
                        cursor = Some((next, index + 1));
                    }
                    (None, None) => {}
                }
            }

            if cursor.is_none() {
                cursor = backtrack.pop();
            }
        }

        best.map(|(_, _, id)| self.patterns[id].as_str())
    }
}

impl SubjectMatcher {
    fn push_node(&mut self) -> usize {
        self.nodes.push(Node::default());
        self.nodes.len() - 1
    }
}

/// Tokenize a subject into byte ranges, avoiding per-token allocation.
fn token_ranges(subject: &str) -> Vec<Range<usize>> {
    let mut ranges = Vec::with_capacity(8);
    let mut start = 0usize;
    for (pos, byte) in subject.bytes().enumerate() {
        if byte == b'.' {
            ranges.push(start..pos);
            start = pos + 1;
        }
    }
    ranges.push(start..subject.len());
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_vs_wildcard_specificity() {
        let matcher = SubjectMatcher::from_patterns(["a.b.c", "a.*.c", "a.>"]);
        assert_eq!(matcher.resolve("a.b.c"), Some("a.b.c"));
        assert_eq!(matcher.resolve("a.x.c"), Some("a.*.c"));
        assert_eq!(matcher.resolve("a.x.y.z"), Some("a.>"));
    }

    #[test]
    fn test_no_match() {
        let matcher = SubjectMatcher::from_patterns(["orders.created"]);
        assert_eq!(matcher.resolve("orders"), None);
        assert_eq!(matcher.resolve("orders.created.extra"), None);
        assert_eq!(matcher.resolve("payments.created"), None);
    }

    #[test]
    fn test_tail_matches_everything_under_prefix() {
        let matcher = SubjectMatcher::from_patterns(["evt.>"]);
        assert_eq!(matcher.resolve("evt.a"), Some("evt.>"));
        assert_eq!(matcher.resolve("evt.a.b.c.d"), Some("evt.>"));
        assert_eq!(matcher.resolve("evt"), None);
        assert_eq!(matcher.resolve("other.a"), None);
    }

    #[test]
    fn test_star_matches_exactly_one_token() {
        let matcher = SubjectMatcher::from_patterns(["a.*"]);
        assert_eq!(matcher.resolve("a.b"), Some("a.*"));
        assert_eq!(matcher.resolve("a"), None);
        assert_eq!(matcher.resolve("a.b.c"), None);
    }

    #[test]
    fn test_exact_end_beats_tail_at_same_depth() {
        let matcher = SubjectMatcher::from_patterns(["a.>", "a.b"]);
        assert_eq!(matcher.resolve("a.b"), Some("a.b"));

        // Order of registration must not change the outcome.
        let matcher = SubjectMatcher::from_patterns(["a.b", "a.>"]);
        assert_eq!(matcher.resolve("a.b"), Some("a.b"));
    }

    #[test]
    fn test_deeper_match_wins() {
        let matcher = SubjectMatcher::from_patterns(["a.>", "a.b.>"]);
        assert_eq!(matcher.resolve("a.b.c"), Some("a.b.>"));
        assert_eq!(matcher.resolve("a.x"), Some("a.>"));
    }

    #[test]
    fn test_literal_beats_wildcard_among_equal_depth() {
        let matcher = SubjectMatcher::from_patterns(["*.b", "a.b"]);
        assert_eq!(matcher.resolve("a.b"), Some("a.b"));
        assert_eq!(matcher.resolve("x.b"), Some("*.b"));
    }

    #[test]
    fn test_backtracking_through_wildcard() {
        // Literal path dead-ends; the match must back up into `*`.
        let matcher = SubjectMatcher::from_patterns(["a.*.c"]);
        assert_eq!(matcher.resolve("a.b.c"), Some("a.*.c"));

        let matcher = SubjectMatcher::from_patterns(["a.b.x", "a.*.c"]);
        assert_eq!(matcher.resolve("a.b.c"), Some("a.*.c"));
    }

    #[test]
    fn test_case_sensitive_literals() {
        let matcher = SubjectMatcher::from_patterns(["Orders.Created"]);
        assert_eq!(matcher.resolve("Orders.Created"), Some("Orders.Created"));
        assert_eq!(matcher.resolve("orders.created"), None);
    }

    #[test]
    fn test_empty_tokens_skipped_on_insert() {
        let mut matcher = SubjectMatcher::new();
        matcher.insert("a..b");
        assert_eq!(matcher.resolve("a.b"), Some("a..b"));
    }

    #[test]
    fn test_tokens_after_tail_ignored() {
        let matcher = SubjectMatcher::from_patterns(["a.>.ignored"]);
        assert_eq!(matcher.resolve("a.b.c"), Some("a.>.ignored"));
    }

    #[test]
    fn test_reinsert_is_idempotent() {
        let mut matcher = SubjectMatcher::from_patterns(["a.*.c", "a.b.c"]);
        matcher.insert("a.*.c");
        // Probe results are unchanged by re-insertion.
        assert_eq!(matcher.resolve("a.b.c"), Some("a.b.c"));
        assert_eq!(matcher.resolve("a.x.c"), Some("a.*.c"));
        assert_eq!(matcher.len(), 3);
    }

    #[test]
    fn test_insertion_order_independent() {
        let forward = SubjectMatcher::from_patterns(["a.b.c", "a.*.c", "a.>", "a.b.>"]);
        let reverse = SubjectMatcher::from_patterns(["a.b.>", "a.>", "a.*.c", "a.b.c"]);
        for probe in ["a.b.c", "a.x.c", "a.b.d", "a.x.y", "a.b.c.d"] {
            assert_eq!(forward.resolve(probe), reverse.resolve(probe), "{probe}");
        }
    }

    #[test]
    fn test_root_tail_matches_all() {
        let matcher = SubjectMatcher::from_patterns([">"]);
        assert_eq!(matcher.resolve("anything"), Some(">"));
        assert_eq!(matcher.resolve("a.b.c"), Some(">"));
    }

    #[test]
    fn test_token_ranges_are_views() {
        let ranges = token_ranges("a.bc.d");
        let subject = "a.bc.d";
        let tokens: Vec<&str> = ranges.into_iter().map(|r| &subject[r]).collect();
        assert_eq!(tokens, vec!["a", "bc", "d"]);
    }
}
