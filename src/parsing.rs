use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};

/// Variation keys the workflow is expected to return. Anything else is dropped
/// before parsing; the upstream format carries no schema guarantee.
pub const EXPECTED_VARIATION_KEYS: [&str; 6] = [
    "linkedin_single_image",
    "linkedin_conversation_ad",
    "linkedin_text_ad",
    "google_search_ad",
    "facebook_feed",
    "email_copy",
];

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedVariation {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ad_copy: Option<ParsedSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visual_concept_rationale: Option<ParsedSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<ParsedSection>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "format", rename_all = "camelCase")]
pub enum ParsedSection {
    #[serde(rename_all = "camelCase")]
    Conversation { turns: Vec<ConversationTurn> },
    #[serde(rename_all = "camelCase")]
    Table {
        headers: Vec<String>,
        rows: Vec<Vec<String>>,
    },
    #[serde(rename_all = "camelCase")]
    NumberedList { items: Vec<String> },
    #[serde(rename_all = "camelCase")]
    Paragraphs { paragraphs: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationTurn {
    pub sender: String,
    pub message: String,
}

/// Extracts the inner text of a literal `<tag>...</tag>` pair. No nesting, no
/// attributes; the workflow emits these as plain delimiters, not real markup.
pub fn extract_tag_section(text: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = text.find(&open)? + open.len();
    let end = text[start..].find(&close)? + start;
    let inner = text[start..end].trim();
    if inner.is_empty() {
        None
    } else {
        Some(inner.to_string())
    }
}

fn parse_conversation(text: &str) -> ParsedSection {
    let mut turns = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some((sender, message)) = line.split_once(':') {
            let sender = sender.trim();
            let message = message.trim();
            if !sender.is_empty() && !message.is_empty() && sender.len() <= 40 {
                turns.push(ConversationTurn {
                    sender: sender.to_string(),
                    message: message.to_string(),
                });
                continue;
            }
        }
        // Continuation line: fold into the previous turn.
        if let Some(last) = turns.last_mut() {
            last.message.push(' ');
            last.message.push_str(line);
        }
    }
    if turns.is_empty() {
        parse_paragraphs(text)
    } else {
        ParsedSection::Conversation { turns }
    }
}

fn split_table_row(line: &str) -> Vec<String> {
    line.trim()
        .trim_matches('|')
        .split('|')
        .map(|cell| cell.trim().to_string())
        .collect()
}

fn is_separator_row(cells: &[String]) -> bool {
    !cells.is_empty()
        && cells
            .iter()
            .all(|c| !c.is_empty() && c.chars().all(|ch| ch == '-' || ch == ':'))
}

fn parse_pipe_table(text: &str) -> ParsedSection {
    let mut headers = Vec::new();
    let mut rows = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if !line.contains('|') {
            continue;
        }
        let cells = split_table_row(line);
        if is_separator_row(&cells) {
            continue;
        }
        if headers.is_empty() {
            headers = cells;
        } else {
            rows.push(cells);
        }
    }
    if headers.is_empty() {
        parse_paragraphs(text)
    } else {
        ParsedSection::Table { headers, rows }
    }
}

fn parse_numbered_list(text: &str) -> ParsedSection {
    let item_re = Regex::new(r"^\s*\d+[.)]\s*(.+)$").expect("static regex");
    let mut items = Vec::new();
    for line in text.lines() {
        if let Some(caps) = item_re.captures(line) {
            items.push(caps[1].trim().to_string());
        } else if let Some(last) = items.last_mut() {
            let line = line.trim();
            if !line.is_empty() {
                last.push(' ');
                last.push_str(line);
            }
        }
    }
    if items.is_empty() {
        parse_paragraphs(text)
    } else {
        ParsedSection::NumberedList { items }
    }
}

fn parse_paragraphs(text: &str) -> ParsedSection {
    let paragraphs = text
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| p.split_whitespace().collect::<Vec<_>>().join(" "))
        .collect();
    ParsedSection::Paragraphs { paragraphs }
}

fn section_parser_for_key(key: &str, text: &str) -> ParsedSection {
    if key.contains("conversation") {
        parse_conversation(text)
    } else if key.contains("search") || key.contains("google") {
        parse_pipe_table(text)
    } else if key.contains("email") {
        parse_numbered_list(text)
    } else {
        parse_paragraphs(text)
    }
}

/// Turns the workflow's `{variation key -> raw text}` payload into renderable
/// sections. Unknown keys are filtered out; missing delimiters simply yield no
/// section for that slot.
pub fn parse_ad_copy_variations(variations: &Map<String, Value>) -> Vec<ParsedVariation> {
    EXPECTED_VARIATION_KEYS
        .iter()
        .filter_map(|key| {
            let raw = variations.get(*key)?.as_str()?;
            Some(ParsedVariation {
                key: key.to_string(),
                ad_copy: extract_tag_section(raw, "ad_copy")
                    .map(|s| section_parser_for_key(key, &s)),
                visual_concept_rationale: extract_tag_section(raw, "visual_concept_rationale")
                    .map(|s| parse_paragraphs(&s)),
                email: extract_tag_section(raw, "email").map(|s| parse_numbered_list(&s)),
            })
        })
        .collect()
}

/// Fallback record-id extraction for callbacks whose id arrives embedded in the
/// HTML body rather than in the query string or path.
pub fn extract_embedded_record_id(body: &str) -> Option<String> {
    let patterns = [
        r#"data-record-id="([0-9a-fA-F-]{36})""#,
        r#"(?i)record\s*id\s*[:=]\s*([0-9a-fA-F-]{36})"#,
        r#"(?i)analysis[_-]?id"?\s*[:=]\s*"?([0-9a-fA-F-]{36})"#,
    ];
    for pattern in patterns {
        let re = Regex::new(pattern).expect("static regex");
        if let Some(caps) = re.captures(body) {
            return Some(caps[1].to_lowercase());
        }
    }
    None
}

/// Pulls `<h2>`/`<h3>`-titled sections out of an analysis HTML body. Returns an
/// empty vec when the body has no recognizable headings, in which case the
/// caller wraps the raw HTML instead.
pub fn extract_analysis_sections(html: &str) -> Vec<(String, String)> {
    let heading_re = Regex::new(r"(?is)<h[23][^>]*>(.*?)</h[23]>").expect("static regex");
    let tag_re = Regex::new(r"(?s)<[^>]+>").expect("static regex");

    let mut sections = Vec::new();
    let mut headings = Vec::new();
    for caps in heading_re.captures_iter(html) {
        let whole = caps.get(0).expect("match");
        let title = tag_re.replace_all(&caps[1], "").trim().to_string();
        headings.push((whole.start(), whole.end(), title));
    }
    for (i, (_, body_start, title)) in headings.iter().enumerate() {
        let body_end = headings
            .get(i + 1)
            .map(|(next_start, _, _)| *next_start)
            .unwrap_or(html.len());
        let body = html[*body_start..body_end].trim().to_string();
        if !title.is_empty() && !body.is_empty() {
            sections.push((title.clone(), body));
        }
    }
    sections
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn variations(entries: &[(&str, &str)]) -> Map<String, Value> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v)))
            .collect()
    }

    #[test]
    fn tag_section_extracts_inner_text() {
        let raw = "intro <ad_copy>Buy now.</ad_copy> outro";
        assert_eq!(extract_tag_section(raw, "ad_copy").as_deref(), Some("Buy now."));
        assert_eq!(extract_tag_section(raw, "email"), None);
    }

    #[test]
    fn tag_section_ignores_empty_blocks() {
        assert_eq!(extract_tag_section("<ad_copy>  </ad_copy>", "ad_copy"), None);
    }

    #[test]
    fn unknown_variation_keys_are_filtered() {
        let map = variations(&[
            ("linkedin_text_ad", "<ad_copy>Hello there.</ad_copy>"),
            ("tiktok_spark_ad", "<ad_copy>nope</ad_copy>"),
        ]);
        let parsed = parse_ad_copy_variations(&map);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].key, "linkedin_text_ad");
    }

    #[test]
    fn conversation_key_uses_conversation_parser() {
        let raw = "<ad_copy>Alex: Hi {first_name}!\nAlex: Want a demo?\nProspect: Sure.</ad_copy>";
        let map = variations(&[("linkedin_conversation_ad", raw)]);
        let parsed = parse_ad_copy_variations(&map);
        match parsed[0].ad_copy.as_ref().expect("section") {
            ParsedSection::Conversation { turns } => {
                assert_eq!(turns.len(), 3);
                assert_eq!(turns[0].sender, "Alex");
                assert_eq!(turns[2].message, "Sure.");
            }
            other => panic!("expected conversation, got {other:?}"),
        }
    }

    #[test]
    fn search_key_uses_pipe_table_parser() {
        let raw = "<ad_copy>| Headline | Description |\n|---|---|\n| Fast CRM | Close more deals |</ad_copy>";
        let map = variations(&[("google_search_ad", raw)]);
        let parsed = parse_ad_copy_variations(&map);
        match parsed[0].ad_copy.as_ref().expect("section") {
            ParsedSection::Table { headers, rows } => {
                assert_eq!(headers, &["Headline", "Description"]);
                assert_eq!(rows, &[vec!["Fast CRM".to_string(), "Close more deals".to_string()]]);
            }
            other => panic!("expected table, got {other:?}"),
        }
    }

    #[test]
    fn email_section_uses_numbered_list_parser() {
        let raw = "<email>1. Subject: Launch week\n2. Body: We shipped.\n3. CTA: Read more</email>";
        let map = variations(&[("email_copy", raw)]);
        let parsed = parse_ad_copy_variations(&map);
        match parsed[0].email.as_ref().expect("section") {
            ParsedSection::NumberedList { items } => {
                assert_eq!(items.len(), 3);
                assert_eq!(items[0], "Subject: Launch week");
            }
            other => panic!("expected list, got {other:?}"),
        }
    }

    #[test]
    fn unstructured_section_falls_back_to_paragraphs() {
        let raw = "<ad_copy>First paragraph\nwrapped line.\n\nSecond paragraph.</ad_copy>";
        let map = variations(&[("linkedin_single_image", raw)]);
        let parsed = parse_ad_copy_variations(&map);
        match parsed[0].ad_copy.as_ref().expect("section") {
            ParsedSection::Paragraphs { paragraphs } => {
                assert_eq!(paragraphs.len(), 2);
                assert_eq!(paragraphs[0], "First paragraph wrapped line.");
            }
            other => panic!("expected paragraphs, got {other:?}"),
        }
    }

    #[test]
    fn rationale_always_parses_as_paragraphs() {
        let raw = "<ad_copy>x</ad_copy><visual_concept_rationale>Bold colors.\n\nHigh contrast.</visual_concept_rationale>";
        let map = variations(&[("google_search_ad", raw)]);
        let parsed = parse_ad_copy_variations(&map);
        match parsed[0].visual_concept_rationale.as_ref().expect("section") {
            ParsedSection::Paragraphs { paragraphs } => assert_eq!(paragraphs.len(), 2),
            other => panic!("expected paragraphs, got {other:?}"),
        }
    }

    #[test]
    fn embedded_record_id_fallback_chain() {
        let id = "9b2d6c1e-8f4a-4b6e-9d3c-2a1b0c9d8e7f";
        let html = format!(r#"<div data-record-id="{id}">done</div>"#);
        assert_eq!(extract_embedded_record_id(&html).as_deref(), Some(id));

        let text = format!("Report ready. Record ID: {id}");
        assert_eq!(extract_embedded_record_id(&text).as_deref(), Some(id));

        let json_ish = format!(r#"{{"analysisId": "{id}"}}"#);
        assert_eq!(extract_embedded_record_id(&json_ish).as_deref(), Some(id));

        assert_eq!(extract_embedded_record_id("no id here"), None);
    }

    #[test]
    fn analysis_sections_split_on_headings() {
        let html = "<h2>Company Overview</h2><p>Acme sells anvils.</p>\
                    <h3>Audience Insights</h3><p>Coyotes, mostly.</p>";
        let sections = extract_analysis_sections(html);
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].0, "Company Overview");
        assert!(sections[0].1.contains("anvils"));
        assert_eq!(sections[1].0, "Audience Insights");
    }

    #[test]
    fn analysis_sections_empty_without_headings() {
        assert!(extract_analysis_sections("<p>just text</p>").is_empty());
    }
}
