use std::collections::HashMap;
use std::sync::Arc;

use crate::mutation::{Mutation, MutationError, MutationPath};

use super::Conn;

const STAR: &str = "*";
const DOUBLE_STAR: &str = "**";

/// Terminal mark on a rule-tree node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum Mark {
    #[default]
    Undefined,
    Include,
    Exclude,
    /// Set on `*`/`**` siblings along an include rule's path: an include of
    /// a named path narrows the default for everything beside it.
    ImpliedExclude,
}

impl Mark {
    fn allows(self) -> bool {
        matches!(self, Mark::Include | Mark::Undefined)
    }
}

#[derive(Debug, Default)]
struct RuleNode {
    mark: Mark,
    children: HashMap<String, RuleNode>,
}

impl RuleNode {
    fn child_mut(&mut self, segment: &str) -> &mut RuleNode {
        self.children.entry(segment.to_string()).or_default()
    }

    /// Resolve the mark for `path`: exact segments first, then `*`, then
    /// `**` against every tail suffix (greedy). A path that runs past a
    /// marked node inherits that node's mark (prefix rules cover their
    /// subtrees).
    fn resolve(&self, path: &[String]) -> Mark {
        let Some((head, rest)) = path.split_first() else {
            return self.mark;
        };

        if let Some(child) = self.children.get(head.as_str()) {
            let mark = child.resolve(rest);
            if mark != Mark::Undefined {
                return mark;
            }
        }

        if let Some(star) = self.children.get(STAR) {
            let mark = star.resolve(rest);
            if mark != Mark::Undefined {
                return mark;
            }
        }

        if let Some(double) = self.children.get(DOUBLE_STAR) {
            for consumed in (0..=path.len()).rev() {
                let mark = double.resolve(&path[consumed..]);
                if mark != Mark::Undefined {
                    return mark;
                }
            }
        }

        self.mark
    }
}

struct Rule {
    exclude: bool,
    segments: Vec<String>,
}

/// Parse a single gitignore-like rule: an optional `!` inversion prefix,
/// an optional leading `/`, then a slash-separated path with `*` (one
/// segment) and `**` (zero or more segments) wildcards.
fn parse_rule(text: &str) -> Result<Rule, MutationError> {
    let invalid = || MutationError::InvalidFilterRule {
        rule: text.to_string(),
    };

    if text.is_empty() {
        return Err(invalid());
    }

    let (exclude, body) = match text.strip_prefix('!') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let body = body.strip_prefix('/').unwrap_or(body);
    if body.is_empty() {
        return Err(invalid());
    }

    Ok(Rule {
        exclude,
        segments: body.split('/').map(str::to_string).collect(),
    })
}

/// A compiled set of filter rules.
#[derive(Debug, Default)]
pub(crate) struct RuleSet {
    root: RuleNode,
}

impl RuleSet {
    pub(crate) fn parse<S: AsRef<str>>(rules: &[S]) -> Result<Self, MutationError> {
        let mut set = Self::default();
        for text in rules {
            set.insert(&parse_rule(text.as_ref())?);
        }
        Ok(set)
    }

    fn insert(&mut self, rule: &Rule) {
        let mut node = &mut self.root;
        for segment in &rule.segments {
            if !rule.exclude {
                for sibling in [STAR, DOUBLE_STAR] {
                    if sibling != segment {
                        let wild = node.child_mut(sibling);
                        if wild.mark == Mark::Undefined {
                            wild.mark = Mark::ImpliedExclude;
                        }
                    }
                }
            }
            node = node.child_mut(segment);
        }
        // Last matching rule wins, so later rules overwrite any prior mark.
        node.mark = if rule.exclude {
            Mark::Exclude
        } else {
            Mark::Include
        };
    }

    pub(crate) fn allows(&self, path: &MutationPath) -> bool {
        self.root.resolve(path.segments()).allows()
    }
}

/// A wrapping connection that drops outbound mutations whose path does not
/// pass the rule set. Everything else delegates to the wrapped connection.
///
/// Rules resolve like `.gitignore` patterns: the most recently added rule
/// matching a path wins, and a path no rule matches is allowed, unless an
/// include rule narrowed the default at one of its levels.
pub struct FilterConn {
    inner: Arc<dyn Conn>,
    rules: RuleSet,
}

impl FilterConn {
    pub fn wrap<S: AsRef<str>>(
        inner: Arc<dyn Conn>,
        rules: &[S],
    ) -> Result<Arc<Self>, MutationError> {
        Ok(Arc::new(Self {
            inner,
            rules: RuleSet::parse(rules)?,
        }))
    }
}

impl Conn for FilterConn {
    fn send(&self, mutation: &Mutation) -> Result<(), MutationError> {
        if !self.rules.allows(&mutation.path) {
            return Ok(());
        }
        self.inner.send(mutation)
    }

    fn receive(&self) -> Result<Mutation, MutationError> {
        self.inner.receive()
    }

    fn close(&self) {
        self.inner.close();
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn send_error(&self, err: &MutationError) {
        self.inner.send_error(err);
    }

    fn name(&self) -> String {
        self.inner.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::stub::StubConn;
    use crate::mutation::{Action, MutationId};
    use bytes::Bytes;

    fn path(text: &str) -> MutationPath {
        MutationPath::parse(text)
    }

    fn rules(texts: &[&str]) -> RuleSet {
        RuleSet::parse(texts).unwrap()
    }

    #[test]
    fn rejects_malformed_rules() {
        for bad in ["", "!", "/", "!/"] {
            let err = RuleSet::parse(&[bad]).unwrap_err();
            assert!(
                matches!(err, MutationError::InvalidFilterRule { .. }),
                "rule {bad:?}"
            );
        }
    }

    #[test]
    fn wildcard_rules_resolve_by_specificity() {
        let set = rules(&["/foo/*/*", "!/foo/bar/*", "/foo/bar/baz"]);

        assert!(set.allows(&path("foo/bop/bip")));
        assert!(!set.allows(&path("foo/bar/bop")));
        assert!(set.allows(&path("foo/bar/baz")));
    }

    #[test]
    fn no_rules_means_allow_everything() {
        let set = RuleSet::default();
        assert!(set.allows(&path("anything/at/all")));
        assert!(set.allows(&MutationPath::root()));
    }

    #[test]
    fn exclude_only_rules_leave_the_default_open() {
        let set = rules(&["!/secrets"]);
        assert!(!set.allows(&path("secrets")));
        assert!(!set.allows(&path("secrets/key")));
        assert!(set.allows(&path("teams/alpha")));
    }

    #[test]
    fn include_rules_narrow_the_default() {
        let set = rules(&["/teams/alpha"]);
        assert!(set.allows(&path("teams/alpha")));
        assert!(set.allows(&path("teams/alpha/radio")));
        assert!(!set.allows(&path("teams/bravo")));
        assert!(!set.allows(&path("other")));
    }

    #[test]
    fn double_star_matches_zero_or_more_segments() {
        let set = rules(&["!/incidents/**/track"]);
        assert!(!set.allows(&path("incidents/track")));
        assert!(!set.allows(&path("incidents/a/track")));
        assert!(!set.allows(&path("incidents/a/b/track")));
        assert!(set.allows(&path("incidents/a/route")));
    }

    #[test]
    fn last_matching_rule_wins() {
        let set = rules(&["!/a/b", "/a/b"]);
        assert!(set.allows(&path("a/b")));

        let set = rules(&["/a/b", "!/a/b"]);
        assert!(!set.allows(&path("a/b")));
    }

    #[test]
    fn tree_resolution_matches_linear_reference() {
        // Reference semantics: the last explicitly matching rule wins; when
        // no explicit rule matches, an include rule's implicit wildcard
        // siblings exclude, and otherwise the path is allowed.
        struct LinearRule {
            exclude: bool,
            segments: Vec<String>,
        }

        fn seg_match(segments: &[String], path: &[String]) -> bool {
            match segments.split_first() {
                None => true, // rule exhausted: prefix match
                Some((seg, rest)) if seg == DOUBLE_STAR => (0..=path.len())
                    .any(|consumed| seg_match(rest, &path[consumed..])),
                Some((seg, rest)) => match path.split_first() {
                    Some((head, tail)) if seg == STAR || seg == head => seg_match(rest, tail),
                    _ => false,
                },
            }
        }

        fn reference(rules: &[LinearRule], path: &[String]) -> bool {
            let verdict = rules
                .iter()
                .rev()
                .find(|rule| seg_match(&rule.segments, path))
                .map(|rule| !rule.exclude);
            if let Some(allowed) = verdict {
                return allowed;
            }
            // Implicit siblings of include rules.
            for rule in rules.iter().filter(|r| !r.exclude) {
                for depth in 0..rule.segments.len() {
                    let mut implied: Vec<String> =
                        rule.segments[..depth].to_vec();
                    implied.push(STAR.to_string());
                    if seg_match(&implied, path) {
                        return false;
                    }
                }
            }
            true
        }

        let rule_texts = ["/foo/*/*", "!/foo/bar/*", "/foo/bar/baz", "!/ops/**/secret"];
        let linear: Vec<LinearRule> = rule_texts
            .iter()
            .map(|text| {
                let rule = parse_rule(text).unwrap();
                LinearRule {
                    exclude: rule.exclude,
                    segments: rule.segments,
                }
            })
            .collect();
        let compiled = rules(&rule_texts);

        let alphabet = ["foo", "bar", "baz", "bop", "ops", "secret", "x"];
        let mut paths: Vec<Vec<String>> = vec![Vec::new()];
        for a in alphabet {
            paths.push(vec![a.to_string()]);
            for b in alphabet {
                paths.push(vec![a.to_string(), b.to_string()]);
                for c in alphabet {
                    paths.push(vec![a.to_string(), b.to_string(), c.to_string()]);
                }
            }
        }

        for segments in paths {
            let as_path: MutationPath = segments.iter().cloned().collect();
            assert_eq!(
                compiled.allows(&as_path),
                reference(&linear, &segments),
                "path {segments:?}"
            );
        }
    }

    #[test]
    fn filter_conn_drops_non_matching_sends() {
        let inner = StubConn::shared("inner");
        let filtered =
            FilterConn::wrap(inner.clone(), &["/foo/*/*", "!/foo/bar/*", "/foo/bar/baz"]).unwrap();

        let send = |p: &str| {
            let m = Mutation {
                client_id: MutationId::from("c"),
                id: MutationId::random(),
                timestamp: time::OffsetDateTime::now_utc(),
                origin: None,
                action: Action::Update,
                path: path(p),
                original_body: None,
                body: Some(Bytes::from_static(b"1")),
            };
            filtered.send(&m).unwrap();
        };

        send("foo/bop/bip");
        send("foo/bar/bop");
        send("foo/bar/baz");

        let delivered: Vec<String> = inner.sent.try_iter().map(|m| m.path.to_string()).collect();
        assert_eq!(delivered, ["foo/bop/bip", "foo/bar/baz"]);
    }

    #[test]
    fn delegates_everything_but_send() {
        let inner = StubConn::shared("inner");
        let filtered = FilterConn::wrap(inner.clone(), &["/x"]).unwrap();

        assert_eq!(filtered.name(), "inner");
        assert!(!filtered.is_closed());
        filtered.close();
        assert!(inner.is_closed());
        assert!(filtered.is_closed());
    }
}
