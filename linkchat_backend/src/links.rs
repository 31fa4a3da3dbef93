//! Wikilink scanning.
//!
//! Two syntaxes are recognised:
//! - **inline**: `[[Note]]` or `![[Note]]` anywhere in the text
//! - **whole-line**: the link must be the only thing on its line (surrounding
//!   whitespace is tolerated and becomes part of the replaced span)
//!
//! Both split `Note#Section` / `Note#^block` subpaths and drop `|alias` suffixes.

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkSyntax {
    #[default]
    Inline,
    WholeLine,
}

/// One wikilink found in a text blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkOccurrence {
    /// The exact source text covered by `span`, `!` prefix included.
    pub raw: String,
    /// Link target with alias and subpath removed. Empty for same-file links.
    pub target: String,
    /// Heading path (`Section`, `A#B`) or block reference (`^id`).
    pub subpath: Option<String>,
    /// Byte range in the scanned text.
    pub span: Range<usize>,
}

fn inline_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"!?\[\[([^\[\]\n]+?)\]\]").expect("valid inline link pattern"))
}

fn whole_line_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^!?\[\[([^\[\]\n]+?)\]\]$").expect("valid line link pattern"))
}

/// Scan `text` for links, left to right, without overlaps.
pub fn scan(text: &str, syntax: LinkSyntax) -> Vec<LinkOccurrence> {
    match syntax {
        LinkSyntax::Inline => scan_inline(text),
        LinkSyntax::WholeLine => scan_whole_lines(text),
    }
}

fn scan_inline(text: &str) -> Vec<LinkOccurrence> {
    inline_pattern()
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let inner = caps.get(1)?.as_str();
            build_occurrence(text, whole.range(), inner)
        })
        .collect()
}

fn scan_whole_lines(text: &str) -> Vec<LinkOccurrence> {
    let mut occurrences = Vec::new();
    let mut offset = 0;

    for line in text.split_inclusive('\n') {
        let start = offset;
        offset += line.len();

        let content = line.strip_suffix('\n').unwrap_or(line);
        let content = content.strip_suffix('\r').unwrap_or(content);
        let trimmed = content.trim();
        if trimmed.is_empty() {
            continue;
        }

        let Some(caps) = whole_line_pattern().captures(trimmed) else {
            continue;
        };
        let Some(inner) = caps.get(1) else {
            continue;
        };
        if let Some(occurrence) =
            build_occurrence(text, start..start + content.len(), inner.as_str())
        {
            occurrences.push(occurrence);
        }
    }

    occurrences
}

fn build_occurrence(
    text: &str,
    span: Range<usize>,
    inner: &str,
) -> Option<LinkOccurrence> {
    let without_alias = inner.split('|').next().unwrap_or(inner);
    let (target, subpath) = split_subpath(without_alias);
    if target.is_empty() && subpath.is_none() {
        return None;
    }

    Some(LinkOccurrence {
        raw: text[span.clone()].to_string(),
        target,
        subpath,
        span,
    })
}

/// Split `Note#Section` into (`Note`, `Some("Section")`).
pub fn split_subpath(link: &str) -> (String, Option<String>) {
    match link.split_once('#') {
        Some((target, subpath)) => {
            let subpath = subpath.trim();
            (
                target.trim().to_string(),
                (!subpath.is_empty()).then(|| subpath.to_string()),
            )
        }
        None => (link.trim().to_string(), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_links_in_document_order() {
        let text = "See [[Alpha]] and ![[beta.png]] then [[Gamma#Intro|the intro]].";
        let links = scan(text, LinkSyntax::Inline);

        assert_eq!(links.len(), 3);
        assert_eq!(links[0].target, "Alpha");
        assert_eq!(&text[links[0].span.clone()], "[[Alpha]]");

        assert_eq!(links[1].target, "beta.png");
        assert_eq!(links[1].raw, "![[beta.png]]");

        assert_eq!(links[2].target, "Gamma");
        assert_eq!(links[2].subpath.as_deref(), Some("Intro"));
    }

    #[test]
    fn block_reference_keeps_caret() {
        let links = scan("[[Notes/Plan#^abc123]]", LinkSyntax::Inline);
        assert_eq!(links[0].target, "Notes/Plan");
        assert_eq!(links[0].subpath.as_deref(), Some("^abc123"));
    }

    #[test]
    fn whole_line_ignores_links_inside_prose() {
        let text = "intro [[Skipped]] here\n  [[Kept]]  \n![[img.png]]\n";
        let links = scan(text, LinkSyntax::WholeLine);

        assert_eq!(links.len(), 2);
        assert_eq!(links[0].target, "Kept");
        assert_eq!(links[0].raw, "  [[Kept]]  ");
        assert_eq!(&text[links[0].span.clone()], "  [[Kept]]  ");
        assert_eq!(links[1].raw, "![[img.png]]");
        assert_eq!(links[1].target, "img.png");
    }

    #[test]
    fn whole_line_tolerates_unicode_whitespace_and_crlf() {
        let text = "\u{3000}[[Wide]]\u{00a0}\r\nnext";
        let links = scan(text, LinkSyntax::WholeLine);

        assert_eq!(links.len(), 1);
        assert_eq!(links[0].target, "Wide");
        assert!(!links[0].raw.ends_with('\r'));
    }

    #[test]
    fn adjacent_links_do_not_overlap() {
        let links = scan("[[a]][[b]]", LinkSyntax::Inline);
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].span, 0..5);
        assert_eq!(links[1].span, 5..10);
    }

    #[test]
    fn no_links_yields_empty() {
        assert!(scan("plain [text] only", LinkSyntax::Inline).is_empty());
        assert!(scan("", LinkSyntax::WholeLine).is_empty());
    }
}
