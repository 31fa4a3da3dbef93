//! Heading and block-id lookup within a markdown file.

/// Byte range of the excerpt addressed by `subpath` (`Heading`, `A#B`, `^block`).
pub fn find_section(text: &str, subpath: &str) -> Option<(usize, usize)> {
    let subpath = subpath.trim();
    if let Some(block_id) = subpath.strip_prefix('^') {
        return find_block(text, block_id.trim());
    }

    let heading = subpath
        .rsplit('#')
        .map(str::trim)
        .find(|part| !part.is_empty())?;
    find_heading(text, heading)
}

fn heading_level(line: &str) -> Option<(usize, &str)> {
    let trimmed = line.trim_start();
    let level = trimmed.chars().take_while(|c| *c == '#').count();
    if level == 0 || level > 6 {
        return None;
    }
    let rest = &trimmed[level..];
    if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
        return None;
    }
    Some((level, rest.trim()))
}

/// Lines paired with their starting byte offset.
fn lines_with_offsets(text: &str) -> Vec<(usize, &str)> {
    let mut offset = 0;
    text.split_inclusive('\n')
        .map(|line| {
            let start = offset;
            offset += line.len();
            (start, line)
        })
        .collect()
}

fn find_heading(text: &str, wanted: &str) -> Option<(usize, usize)> {
    let lines = lines_with_offsets(text);
    let mut in_fence = false;
    let mut found: Option<(usize, usize)> = None;

    for (start, line) in lines {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        let Some((level, title)) = heading_level(line) else {
            continue;
        };

        match found {
            Some((section_start, section_level)) if level <= section_level => {
                return Some((section_start, start));
            }
            Some(_) => {}
            None if title.eq_ignore_ascii_case(wanted) => {
                found = Some((start, level));
            }
            None => {}
        }
    }

    found.map(|(section_start, _)| (section_start, text.len()))
}

fn find_block(text: &str, block_id: &str) -> Option<(usize, usize)> {
    if block_id.is_empty() {
        return None;
    }
    let marker = format!("^{}", block_id);
    let lines = lines_with_offsets(text);
    let mut paragraph_start: Option<usize> = None;

    for (start, line) in lines {
        let content = line.trim_end();
        if content.trim().is_empty() {
            paragraph_start = None;
            continue;
        }
        let first = *paragraph_start.get_or_insert(start);

        if let Some(before) = content.strip_suffix(marker.as_str()) {
            if before.is_empty() || before.ends_with(char::is_whitespace) {
                let end = start + before.trim_end().len();
                return Some((first, end.max(first)));
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOTE: &str = "# Title\nintro\n## Setup\ninstall it\n### Details\nfine print\n## Usage\nrun it\n";

    fn excerpt<'a>(text: &'a str, subpath: &str) -> Option<&'a str> {
        find_section(text, subpath).map(|(start, end)| &text[start..end])
    }

    #[test]
    fn heading_section_runs_to_next_sibling() {
        assert_eq!(
            excerpt(NOTE, "Setup"),
            Some("## Setup\ninstall it\n### Details\nfine print\n")
        );
    }

    #[test]
    fn last_heading_runs_to_end_of_file() {
        assert_eq!(excerpt(NOTE, "usage"), Some("## Usage\nrun it\n"));
    }

    #[test]
    fn nested_heading_path_uses_last_component() {
        assert_eq!(excerpt(NOTE, "Setup#Details"), Some("### Details\nfine print\n"));
    }

    #[test]
    fn headings_inside_code_fences_are_ignored() {
        let text = "```\n# Fake\n```\n# Real\nbody\n";
        assert_eq!(excerpt(text, "Real"), Some("# Real\nbody\n"));
        assert_eq!(excerpt(text, "Fake"), None);
    }

    #[test]
    fn block_reference_returns_paragraph_without_marker() {
        let text = "first para\n\nline one\nline two ^quote1\n\nafter\n";
        assert_eq!(excerpt(text, "^quote1"), Some("line one\nline two"));
    }

    #[test]
    fn missing_targets_return_none() {
        assert_eq!(find_section(NOTE, "Nope"), None);
        assert_eq!(find_section(NOTE, "^missing"), None);
        assert_eq!(find_section(NOTE, "^"), None);
    }
}
