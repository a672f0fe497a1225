//! Finding numeric post/term references in block content and turning them
//! into markers at export time.
use super::markers::{placeholder, post_marker, post_url_marker, term_marker};
use crate::model::{PostId, TermId};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};

static BLOCK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<!--\s+wp:(?P<name>[a-z0-9_/-]+)\s+(?P<attrs>\{.*?\})\s+(?P<close>/?)-->")
        .expect("valid block regex")
});
static POST_ATTR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""(?P<key>ref|id|mediaId|featuredImageId)":(?P<id>\d+)"#)
        .expect("valid post attribute regex")
});
static TERM_ATTR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""(?P<key>termId|categoryId)":(?P<id>\d+)"#).expect("valid term attribute regex")
});
static IMAGE_CLASS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"wp-image-(?P<id>\d+)").expect("valid image class regex"));

const MENU_BLOCKS: &[&str] = &["navigation-link", "navigation-submenu"];

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ContentReferences {
    pub posts: BTreeSet<PostId>,
    pub terms: BTreeSet<TermId>,
}

fn permalink_re(home_url: &str) -> Option<Regex> {
    let home = home_url.trim_end_matches('/');
    if home.is_empty() {
        return None;
    }
    Regex::new(&format!(r"{}/\?p=(?P<id>\d+)", regex::escape(home))).ok()
}

/// Candidate IDs referenced by `content`. Whether they exist is up to the caller.
pub fn scan(content: &str, home_url: &str) -> ContentReferences {
    let mut refs = ContentReferences::default();
    for block in BLOCK_RE.captures_iter(content) {
        let attrs = &block["attrs"];
        for caps in POST_ATTR_RE.captures_iter(attrs) {
            if let Ok(id) = caps["id"].parse() {
                refs.posts.insert(id);
            }
        }
        for caps in TERM_ATTR_RE.captures_iter(attrs) {
            if let Ok(id) = caps["id"].parse() {
                refs.terms.insert(id);
            }
        }
    }
    for caps in IMAGE_CLASS_RE.captures_iter(content) {
        if let Ok(id) = caps["id"].parse() {
            refs.posts.insert(id);
        }
    }
    if let Some(re) = permalink_re(home_url) {
        for caps in re.captures_iter(content) {
            if let Ok(id) = caps["id"].parse() {
                refs.posts.insert(id);
            }
        }
    }
    refs
}

/// Turn navigation links to posts into plain custom links.
pub fn resolve_menu_links(content: &str) -> String {
    BLOCK_RE
        .replace_all(content, |caps: &Captures| {
            let name = caps["name"].trim_start_matches("core/");
            if !MENU_BLOCKS.contains(&name) {
                return caps[0].to_string();
            }
            let Ok(Value::Object(mut attrs)) = serde_json::from_str::<Value>(&caps["attrs"]) else {
                return caps[0].to_string();
            };
            if attrs.remove("id").is_none() {
                return caps[0].to_string();
            }
            attrs.insert("kind".into(), Value::String("custom".into()));
            attrs.insert("type".into(), Value::String("custom".into()));
            let close = if caps["close"].is_empty() { "" } else { "/" };
            format!(
                "<!-- wp:{} {} {}-->",
                &caps["name"],
                Value::Object(attrs),
                close
            )
        })
        .into_owned()
}

/// Replace references to known posts/terms with markers, and the origin's
/// uploads and home URLs with placeholders.
pub fn apply_markers(
    content: &str,
    home_url: &str,
    upload_url: &str,
    posts: &HashSet<PostId>,
    terms: &HashSet<TermId>,
) -> String {
    let with_blocks = BLOCK_RE.replace_all(content, |block: &Captures| {
        let whole = &block[0];
        let attrs = &block["attrs"];
        let attrs_start = block.name("attrs").map(|m| m.start() - block.get(0).map_or(0, |w| w.start())).unwrap_or(0);
        let rewritten = POST_ATTR_RE.replace_all(attrs, |caps: &Captures| {
            match caps["id"].parse::<PostId>() {
                Ok(id) if posts.contains(&id) => format!("\"{}\":{}", &caps["key"], post_marker(id)),
                _ => caps[0].to_string(),
            }
        });
        let rewritten = TERM_ATTR_RE.replace_all(&rewritten, |caps: &Captures| {
            match caps["id"].parse::<TermId>() {
                Ok(id) if terms.contains(&id) => format!("\"{}\":{}", &caps["key"], term_marker(id)),
                _ => caps[0].to_string(),
            }
        });
        format!(
            "{}{}{}",
            &whole[..attrs_start],
            rewritten,
            &whole[attrs_start + attrs.len()..]
        )
    });

    let with_images = IMAGE_CLASS_RE.replace_all(&with_blocks, |caps: &Captures| {
        match caps["id"].parse::<PostId>() {
            Ok(id) if posts.contains(&id) => format!("wp-image-{}", post_marker(id)),
            _ => caps[0].to_string(),
        }
    });

    let mut out = match permalink_re(home_url) {
        Some(re) => re
            .replace_all(&with_images, |caps: &Captures| {
                match caps["id"].parse::<PostId>() {
                    Ok(id) if posts.contains(&id) => post_url_marker(id),
                    _ => caps[0].to_string(),
                }
            })
            .into_owned(),
        None => with_images.into_owned(),
    };

    let upload_url = upload_url.trim_end_matches('/');
    if !upload_url.is_empty() {
        out = out.replace(upload_url, &placeholder("uploads_url"));
    }
    let home_url = home_url.trim_end_matches('/');
    if !home_url.is_empty() {
        out = out.replace(home_url, &placeholder("home_url"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOME: &str = "https://origin.test";
    const UPLOADS: &str = "https://origin.test/wp-content/uploads";

    #[test]
    fn scan_finds_block_image_and_permalink_references() {
        let content = format!(
            r#"<!-- wp:block {{"ref":12}} /--><!-- wp:image {{"id":7,"sizeSlug":"large"}} --><img class="wp-image-7"/><!-- /wp:image --><a href="{HOME}/?p=30">x</a><!-- wp:query {{"termId":4}} /-->"#
        );
        let refs = scan(&content, HOME);
        assert_eq!(refs.posts.into_iter().collect::<Vec<_>>(), vec![7, 12, 30]);
        assert_eq!(refs.terms.into_iter().collect::<Vec<_>>(), vec![4]);
    }

    #[test]
    fn apply_markers_only_touches_known_ids() {
        let content = format!(
            r#"<!-- wp:block {{"ref":12}} /--><!-- wp:block {{"ref":99}} /--><img class="wp-image-7" src="{UPLOADS}/2024/01/a.jpg"/><a href="{HOME}/?p=12">x</a>"#
        );
        let posts: HashSet<PostId> = [12, 7].into_iter().collect();
        let out = apply_markers(&content, HOME, UPLOADS, &posts, &HashSet::new());
        assert_eq!(
            out,
            r#"<!-- wp:block {"ref":{{12}}} /--><!-- wp:block {"ref":99} /--><img class="wp-image-{{7}}" src="{{uploads_url}}/2024/01/a.jpg"/><a href="{{12-front-url}}">x</a>"#
        );
    }

    #[test]
    fn term_references_become_term_markers() {
        let content = r#"<!-- wp:query {"categoryId":4,"id":5} /-->"#;
        let posts: HashSet<PostId> = HashSet::new();
        let terms: HashSet<TermId> = [4].into_iter().collect();
        let out = apply_markers(content, HOME, UPLOADS, &posts, &terms);
        assert_eq!(out, r#"<!-- wp:query {"categoryId":{{t_4}},"id":5} /-->"#);
    }

    #[test]
    fn menu_links_lose_their_post_id() {
        let content = r#"<!-- wp:navigation-link {"label":"About","id":5,"kind":"post-type","type":"page","url":"https://origin.test/about/"} /-->"#;
        let out = resolve_menu_links(content);
        assert!(!out.contains("\"id\""));
        assert!(out.contains("\"kind\":\"custom\""));
        assert!(out.contains("\"url\":\"https://origin.test/about/\""));
        assert!(out.ends_with("/-->"));
        assert!(scan(&out, HOME).posts.is_empty());
    }

    #[test]
    fn other_blocks_are_left_alone_by_menu_resolution() {
        let content = r#"<!-- wp:image {"id":5} -->"#;
        assert_eq!(resolve_menu_links(content), content);
    }
}
