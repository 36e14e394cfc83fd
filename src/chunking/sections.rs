//! Markdown heading structure
//!
//! A heading opens a section that runs until the next heading of the same or
//! a higher level, so deeper headings nest inside it.

use regex::Regex;
use std::sync::OnceLock;

fn heading_regex() -> &'static Regex {
    static HEADING: OnceLock<Regex> = OnceLock::new();
    HEADING.get_or_init(|| {
        Regex::new(r"^(#{1,6})[ \t]+(\S.*?)[ \t]*$").expect("heading pattern is valid")
    })
}

#[derive(Debug, Clone)]
struct HeadingLine {
    level: usize,
    title: String,
    offset: usize,
}

/// A heading-delimited region of a document
#[derive(Debug, Clone)]
pub(crate) struct Section<'a> {
    /// Heading text, empty for content before the first heading
    pub label: String,
    /// Whether `text` starts with a heading line
    pub has_heading: bool,
    /// Full section text including nested subsections
    pub text: &'a str,
    /// Text before the first nested subsection
    pub own_text: &'a str,
    pub children: Vec<Section<'a>>,
}

impl Section<'_> {
    /// True when the section holds anything besides its heading line
    pub fn has_body(&self) -> bool {
        has_body(self.text, self.has_heading)
    }

    pub fn own_has_body(&self) -> bool {
        has_body(self.own_text, self.has_heading)
    }
}

fn has_body(text: &str, has_heading: bool) -> bool {
    let body = if has_heading {
        text.split_once('\n').map(|(_, rest)| rest).unwrap_or("")
    } else {
        text
    };
    !body.trim().is_empty()
}

fn find_headings(text: &str) -> Vec<HeadingLine> {
    let mut headings = Vec::new();
    let mut offset = 0;
    let mut in_fence = false;

    for line in text.split_inclusive('\n') {
        let content = line.trim_end_matches(['\n', '\r']);
        let trimmed = content.trim_start();

        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
        } else if !in_fence {
            if let Some(caps) = heading_regex().captures(content) {
                let raw = caps[2].trim_end_matches('#').trim_end();
                let title = if raw.is_empty() { &caps[2] } else { raw };
                headings.push(HeadingLine {
                    level: caps[1].len(),
                    title: title.to_string(),
                    offset,
                });
            }
        }

        offset += line.len();
    }

    headings
}

/// Split a document into top-level sections.
///
/// Returns `None` when the document contains no headings at all.
pub(crate) fn parse_sections(text: &str) -> Option<Vec<Section<'_>>> {
    let headings = find_headings(text);
    if headings.is_empty() {
        return None;
    }

    // Index of the next heading at the same or a higher level
    let next: Vec<usize> = (0..headings.len())
        .map(|i| {
            (i + 1..headings.len())
                .find(|&j| headings[j].level <= headings[i].level)
                .unwrap_or(headings.len())
        })
        .collect();

    let mut sections = Vec::new();

    let lead = &text[..headings[0].offset];
    if !lead.trim().is_empty() {
        sections.push(Section {
            label: String::new(),
            has_heading: false,
            text: lead,
            own_text: lead,
            children: Vec::new(),
        });
    }

    let mut i = 0;
    while i < headings.len() {
        sections.push(build_section(text, &headings, &next, i));
        i = next[i];
    }

    Some(sections)
}

fn build_section<'a>(
    text: &'a str,
    headings: &[HeadingLine],
    next: &[usize],
    i: usize,
) -> Section<'a> {
    let offset_of = |idx: usize| headings.get(idx).map(|h| h.offset).unwrap_or(text.len());

    let start = headings[i].offset;
    let end = offset_of(next[i]);
    let own_end = if i + 1 < next[i] { offset_of(i + 1) } else { end };

    let mut children = Vec::new();
    let mut j = i + 1;
    while j < next[i] {
        children.push(build_section(text, headings, next, j));
        j = next[j];
    }

    Section {
        label: headings[i].title.clone(),
        has_heading: true,
        text: &text[start..end],
        own_text: &text[start..own_end],
        children,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = "Preamble line.\n\
                       # Handbook\n\
                       Intro.\n\
                       ## Leave\n\
                       Annual leave.\n\
                       ### Sick Leave\n\
                       Ten days.\n\
                       ## Working Hours ##\n\
                       Remote work.\n";

    #[test]
    fn test_no_headings() {
        assert!(parse_sections("plain text\nwithout headings").is_none());
        assert!(parse_sections("#hashtag is not a heading").is_none());
    }

    #[test]
    fn test_nested_structure() {
        let sections = parse_sections(DOC).unwrap();
        assert_eq!(sections.len(), 2);

        assert_eq!(sections[0].label, "");
        assert_eq!(sections[0].text, "Preamble line.\n");

        let handbook = &sections[1];
        assert_eq!(handbook.label, "Handbook");
        assert_eq!(handbook.own_text, "# Handbook\nIntro.\n");
        assert_eq!(handbook.children.len(), 2);

        let leave = &handbook.children[0];
        assert_eq!(leave.label, "Leave");
        assert!(leave.text.contains("Ten days."));
        assert_eq!(leave.children[0].label, "Sick Leave");

        let hours = &handbook.children[1];
        assert_eq!(hours.label, "Working Hours");
        assert_eq!(hours.text, "## Working Hours ##\nRemote work.\n");
    }

    #[test]
    fn test_sibling_after_deeper_heading() {
        let doc = "### Deep\nA.\n## Shallow\nB.\n";
        let sections = parse_sections(doc).unwrap();
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].label, "Deep");
        assert_eq!(sections[1].label, "Shallow");
    }

    #[test]
    fn test_fenced_code_is_not_a_heading() {
        let doc = "## Setup\n```sh\n# install\nmake\n```\nDone.\n";
        let sections = parse_sections(doc).unwrap();
        assert_eq!(sections.len(), 1);
        assert!(sections[0].children.is_empty());
        assert!(sections[0].text.contains("# install"));
    }

    #[test]
    fn test_heading_only_section_has_no_body() {
        let sections = parse_sections("## Empty\n\n## Full\nText.").unwrap();
        assert!(!sections[0].has_body());
        assert!(sections[1].has_body());
    }
}
