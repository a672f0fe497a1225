//! Reference markers embedded in exported content.
//!
//! Grammar (kept for compatibility with existing export files):
//! - `{{123}}` nested post ID
//! - `{{123-front-url}}` (also `{{123}-front-url}}`) front-end URL of a nested post
//! - `{{t_45}}` nested term ID
//! - `{{name}}` generic placeholder, e.g. `{{home_url}}`
//!
//! Content is parsed once into a list of [`ReferenceSite`]s; rewriting walks
//! that list instead of running repeated string replacements, so a
//! substituted value can never be matched again by a later marker.
use crate::model::{PostId, TermId};
use once_cell::sync::Lazy;
use regex::Regex;
use std::ops::Range;

static MARKER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{(?:t_(?P<term>\d+)|(?P<post>\d+)(?P<front>\}?-front-url)?|(?P<name>[a-z][a-z0-9_]*))\}\}")
        .expect("valid marker regex")
});

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Marker {
    PostId(PostId),
    PostUrl(PostId),
    TermId(TermId),
    Placeholder(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceSite {
    pub range: Range<usize>,
    pub marker: Marker,
}

pub fn post_marker(id: PostId) -> String {
    format!("{{{{{}}}}}", id)
}

pub fn post_url_marker(id: PostId) -> String {
    format!("{{{{{}-front-url}}}}", id)
}

pub fn term_marker(id: TermId) -> String {
    format!("{{{{t_{}}}}}", id)
}

pub fn placeholder(name: &str) -> String {
    format!("{{{{{}}}}}", name)
}

/// Every marker in `content`, in order of appearance.
pub fn parse(content: &str) -> Vec<ReferenceSite> {
    MARKER_RE
        .captures_iter(content)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let marker = if let Some(term) = caps.name("term") {
                Marker::TermId(term.as_str().parse().ok()?)
            } else if let Some(post) = caps.name("post") {
                let id = post.as_str().parse().ok()?;
                if caps.name("front").is_some() {
                    Marker::PostUrl(id)
                } else {
                    Marker::PostId(id)
                }
            } else {
                Marker::Placeholder(caps.name("name")?.as_str().to_string())
            };
            Some(ReferenceSite {
                range: whole.range(),
                marker,
            })
        })
        .collect()
}

/// Rebuild `content`, replacing each site for which `resolve` returns a value.
/// Sites resolved to `None` are left as they are.
pub fn rewrite<F>(content: &str, sites: &[ReferenceSite], mut resolve: F) -> String
where
    F: FnMut(&Marker) -> Option<String>,
{
    let mut out = String::with_capacity(content.len());
    let mut cursor = 0;
    for site in sites {
        if site.range.start < cursor {
            continue;
        }
        out.push_str(&content[cursor..site.range.start]);
        match resolve(&site.marker) {
            Some(value) => out.push_str(&value),
            None => out.push_str(&content[site.range.clone()]),
        }
        cursor = site.range.end;
    }
    out.push_str(&content[cursor..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_marker_kinds() {
        let content = r#"<!-- wp:block {"ref":{{12}}} /--><a href="{{12-front-url}}">x</a>{{t_4}}{{home_url}}{{7}-front-url}}"#;
        let markers: Vec<Marker> = parse(content).into_iter().map(|s| s.marker).collect();
        assert_eq!(
            markers,
            vec![
                Marker::PostId(12),
                Marker::PostUrl(12),
                Marker::TermId(4),
                Marker::Placeholder("home_url".into()),
                Marker::PostUrl(7),
            ]
        );
    }

    #[test]
    fn rewrite_does_not_rescan_substituted_text() {
        let content = "a {{1}} b {{2}}";
        let sites = parse(content);
        let out = rewrite(content, &sites, |m| match m {
            // The value for 1 looks like marker 2 and must stay untouched.
            Marker::PostId(1) => Some("{{2}}".into()),
            Marker::PostId(2) => Some("20".into()),
            _ => None,
        });
        assert_eq!(out, "a {{2}} b 20");
    }

    #[test]
    fn unresolved_markers_are_kept() {
        let content = "x {{9}} {{unknown_name}}";
        let out = rewrite(content, &parse(content), |_| None);
        assert_eq!(out, content);
    }

    #[test]
    fn builders_match_the_parser() {
        let content = format!("{}{}{}", post_marker(3), post_url_marker(3), term_marker(8));
        let markers: Vec<Marker> = parse(&content).into_iter().map(|s| s.marker).collect();
        assert_eq!(
            markers,
            vec![Marker::PostId(3), Marker::PostUrl(3), Marker::TermId(8)]
        );
        assert_eq!(placeholder("home_url"), "{{home_url}}");
    }

    #[test]
    fn braces_in_json_are_not_markers() {
        assert!(parse(r#"{"a":{"b":1}}"#).is_empty());
    }
}
