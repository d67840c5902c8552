//! Tolerant parser for the delimited timeline protocol.
//!
//! The parser is re-run on the whole accumulated buffer each time it grows. It only reports
//! records that are closed: a record is closed once a later record marker or section marker
//! follows it, or once the caller says the text is complete. Closed records never change as the
//! buffer grows, which keeps ids and fields stable across calls.

use crate::constants::{
    DEFAULT_PERSON_ROLE, EVENTS_SECTION_NAMES, EVENT_ID_PREFIX, FALLBACK_SOURCE_NAME,
    SUMMARY_SECTION_NAMES, UNSPECIFIED_SOURCE,
};
use crate::filter::{sort_events, SortDirection};
use crate::str_utils::{strip_emphasis, trim_label_separators};
use crate::types::{ParseResult, Person, TimelineEvent};
use lazy_static::lazy_static;
use regex::Regex;
use sha2::{Digest, Sha256};

lazy_static! {
    static ref SECTION_RE: Regex =
        Regex::new(r"===[ \t]*([^=\n]+?)[ \t]*===").expect("Invalid section regex");
    static ref RECORD_RE: Regex =
        Regex::new(r"(?i)--[ \t]*(?:事件|event|e)[ \t]*(\d+)[ \t]*--").expect("Invalid record regex");
    static ref LABEL_RE: Regex = Regex::new(
        r"(?mi)^[ \t]*(?:[-*•·][ \t]+)?(?:\*\*|__)?[ \t]*(相关方/人物|相关方|人物|日期|标题|描述|来源|date|title|description|participants|people|source)[ \t]*(?:\*\*|__)?[ \t]*[:：][ \t]*(?:\*\*|__)?"
    )
    .expect("Invalid label regex");
    static ref PERSON_RE: Regex = Regex::new(
        r"^(.+?)[ \t]*[(（][ \t]*([^,，)）]*?)[ \t]*(?:[,，][ \t]*([^)）]*?)[ \t]*)?[)）]"
    )
    .expect("Invalid person regex");
    static ref COLOR_RE: Regex = Regex::new(
        r"^(?:#(?:[0-9a-fA-F]{3}|[0-9a-fA-F]{4}|[0-9a-fA-F]{6}|[0-9a-fA-F]{8})|[a-zA-Z]{3,20})$"
    )
    .expect("Invalid color regex");
    static ref LABELLED_URL_RE: Regex =
        Regex::new(r"^(.+?)[ \t]*[(（]+[ \t]*(https?://[^\s)）]+)[ \t]*[)）]+")
            .expect("Invalid labelled url regex");
    static ref BARE_URL_RE: Regex =
        Regex::new(r"https?://[^\s)）]+").expect("Invalid url regex");
}

/// How a participant without a usable color gets one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorStrategy {
    /// Derived from the participant's name; identical names always share a color.
    #[default]
    NameHash,
    /// Drawn from a generator seeded once per parse call.
    Seeded(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseOptions {
    pub colors: ColorStrategy,
    pub sort_by_date: bool,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            colors: ColorStrategy::NameHash,
            sort_by_date: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TimelineParser {
    options: ParseOptions,
}

impl TimelineParser {
    pub fn new(options: ParseOptions) -> Self {
        Self { options }
    }

    /// Parses everything accumulated so far. `complete` closes the trailing record and section.
    pub fn parse(&self, text: &str, complete: bool) -> ParseResult {
        let markers = section_markers(text);
        let events_start = events_start(text, &markers);
        let summary = extract_summary(text, &markers, events_start, complete);

        let mut palette = Palette::new(self.options.colors);
        let mut events = match events_start {
            Some(start) => {
                let region = region_from(text, &markers, start, complete);
                parse_records(region, &mut palette)
            }
            None => Vec::new(),
        };

        if self.options.sort_by_date {
            sort_events(&mut events, SortDirection::Ascending);
        }

        ParseResult { summary, events }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SectionKind {
    Summary,
    Events,
    Other,
}

#[derive(Debug, Clone, Copy)]
struct SectionMarker {
    start: usize,
    end: usize,
    kind: SectionKind,
}

fn classify_section(name: &str) -> SectionKind {
    let name = name.trim_matches(|c: char| c.is_whitespace() || matches!(c, '*' | '#'));
    let upper = name.to_uppercase();
    if SUMMARY_SECTION_NAMES.iter().any(|n| *n == upper) {
        SectionKind::Summary
    } else if EVENTS_SECTION_NAMES.iter().any(|n| *n == upper) {
        SectionKind::Events
    } else {
        SectionKind::Other
    }
}

fn section_markers(text: &str) -> Vec<SectionMarker> {
    SECTION_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let name = caps.get(1)?;
            Some(SectionMarker {
                start: whole.start(),
                end: whole.end(),
                kind: classify_section(name.as_str()),
            })
        })
        .collect()
}

fn next_marker_after(markers: &[SectionMarker], pos: usize) -> Option<&SectionMarker> {
    markers.iter().find(|m| m.start >= pos)
}

/// Byte offset where record parsing begins: the event-list marker, unless a record marker
/// after the summary comes first. Anchoring at the earliest record keeps ids stable when the
/// list marker only shows up after some records.
fn events_start(text: &str, markers: &[SectionMarker]) -> Option<usize> {
    let search_from = markers
        .iter()
        .find(|m| m.kind == SectionKind::Summary)
        .map(|m| m.end)
        .unwrap_or(0);
    let first_record = RECORD_RE
        .find(&text[search_from..])
        .map(|m| search_from + m.start());
    let list_marker = markers.iter().find(|m| m.kind == SectionKind::Events);

    match (list_marker, first_record) {
        (Some(list), Some(record)) if record < list.start => Some(record),
        (Some(list), _) => Some(list.end),
        (None, record) => record,
    }
}

fn extract_summary(
    text: &str,
    markers: &[SectionMarker],
    events_start: Option<usize>,
    complete: bool,
) -> String {
    let Some(summary) = markers.iter().find(|m| m.kind == SectionKind::Summary) else {
        return String::new();
    };
    let next_section = next_marker_after(markers, summary.end).map(|m| m.start);
    let records = events_start.filter(|s| *s >= summary.end);
    let closing = match (next_section, records) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };
    let end = match closing {
        Some(end) => end,
        None if complete => text.len(),
        None => return String::new(),
    };
    clean_multiline(&text[summary.end..end])
}

struct Region<'a> {
    body: &'a str,
    closed: bool,
}

fn region_from<'a>(
    text: &'a str,
    markers: &[SectionMarker],
    start: usize,
    complete: bool,
) -> Region<'a> {
    // A late event-list marker sits inside the records and does not close them.
    let next = markers
        .iter()
        .find(|m| m.start >= start && m.kind != SectionKind::Events);
    match next {
        Some(m) => Region {
            body: &text[start..m.start],
            closed: true,
        },
        None => Region {
            body: &text[start..],
            closed: complete,
        },
    }
}

fn parse_records(region: Region<'_>, palette: &mut Palette) -> Vec<TimelineEvent> {
    let body = region.body;
    let markers: Vec<_> = RECORD_RE.find_iter(body).collect();

    let mut blocks: Vec<(&str, bool)> = Vec::with_capacity(markers.len() + 1);
    let lead_end = markers.first().map(|m| m.start()).unwrap_or(body.len());
    blocks.push((&body[..lead_end], !markers.is_empty() || region.closed));
    for (i, m) in markers.iter().enumerate() {
        let next = markers.get(i + 1);
        let end = next.map(|n| n.start()).unwrap_or(body.len());
        blocks.push((&body[m.end()..end], next.is_some() || region.closed));
    }

    blocks
        .into_iter()
        .take_while(|(_, closed)| *closed)
        .filter_map(|(block, _)| RawFields::from_block(block))
        .enumerate()
        .map(|(index, fields)| fields.into_event(index, palette))
        .collect()
}

#[derive(Debug, Clone, Copy)]
enum Field {
    Date,
    Title,
    Description,
    People,
    Source,
}

impl Field {
    fn from_label(label: &str) -> Self {
        match label.to_lowercase().as_str() {
            "日期" | "date" => Field::Date,
            "标题" | "title" => Field::Title,
            "描述" | "description" => Field::Description,
            "来源" | "source" => Field::Source,
            _ => Field::People,
        }
    }
}

#[derive(Debug, Default)]
struct RawFields<'a> {
    date: Option<&'a str>,
    title: Option<&'a str>,
    description: Option<&'a str>,
    people: Option<&'a str>,
    source: Option<&'a str>,
}

impl<'a> RawFields<'a> {
    /// Values run from the end of one label to the start of the next. `None` if no label is present.
    fn from_block(block: &'a str) -> Option<Self> {
        let labels: Vec<_> = LABEL_RE.captures_iter(block).collect();
        if labels.is_empty() {
            return None;
        }

        let mut fields = RawFields::default();
        for (i, caps) in labels.iter().enumerate() {
            let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let end = labels
                .get(i + 1)
                .and_then(|c| c.get(0))
                .map(|m| m.start())
                .unwrap_or(block.len());
            let value = &block[whole.end()..end];
            let slot = match Field::from_label(name.as_str()) {
                Field::Date => &mut fields.date,
                Field::Title => &mut fields.title,
                Field::Description => &mut fields.description,
                Field::People => &mut fields.people,
                Field::Source => &mut fields.source,
            };
            // First occurrence wins.
            if slot.is_none() {
                *slot = Some(value);
            }
        }
        Some(fields)
    }

    fn into_event(self, index: usize, palette: &mut Palette) -> TimelineEvent {
        let (source, source_url) = parse_source(&clean_multiline(self.source.unwrap_or("")));
        TimelineEvent {
            id: format!("{}{}", EVENT_ID_PREFIX, index),
            date: strip_emphasis(first_line(self.date.unwrap_or(""))).to_string(),
            title: strip_emphasis(first_line(self.title.unwrap_or(""))).to_string(),
            description: clean_multiline(self.description.unwrap_or("")),
            people: parse_people(self.people.unwrap_or(""), palette),
            source,
            source_url,
        }
    }
}

fn first_line(value: &str) -> &str {
    value
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !is_decoration_line(l))
        .unwrap_or("")
}

/// Code fences and horizontal rules a model wraps around its output.
fn is_decoration_line(line: &str) -> bool {
    let t = line.trim();
    t.starts_with("```")
        || (t.len() >= 3 && t.chars().all(|c| matches!(c, '-' | '=' | '*' | '_')))
        || (t.starts_with("===") && t.ends_with("===") && SECTION_RE.is_match(t))
}

fn clean_multiline(value: &str) -> String {
    let lines: Vec<&str> = value
        .lines()
        .filter(|l| !is_decoration_line(l))
        .collect();
    lines.join("\n").trim().to_string()
}

/// --- PARTICIPANTS ---

enum Palette {
    NameHash,
    Seeded(fastrand::Rng),
}

impl Palette {
    fn new(strategy: ColorStrategy) -> Self {
        match strategy {
            ColorStrategy::NameHash => Palette::NameHash,
            ColorStrategy::Seeded(seed) => Palette::Seeded(fastrand::Rng::with_seed(seed)),
        }
    }

    fn color_for(&mut self, name: &str) -> String {
        match self {
            Palette::NameHash => {
                let digest = Sha256::digest(name.as_bytes());
                format!("#{:02x}{:02x}{:02x}", digest[0], digest[1], digest[2])
            }
            Palette::Seeded(rng) => format!("#{:06x}", rng.u32(..0x0100_0000)),
        }
    }
}

fn is_valid_color(token: &str) -> bool {
    COLOR_RE.is_match(token)
}

fn parse_people(value: &str, palette: &mut Palette) -> Vec<Person> {
    value
        .split([';', '；', '\n'])
        .map(|entry| entry.trim().trim_start_matches(['-', '*', '•']).trim())
        .filter(|entry| !entry.is_empty() && !is_decoration_line(entry))
        .filter_map(|entry| parse_person(entry, palette))
        .collect()
}

fn parse_person(entry: &str, palette: &mut Palette) -> Option<Person> {
    if let Some(caps) = PERSON_RE.captures(entry) {
        let name = caps.get(1).map(|m| strip_emphasis(m.as_str())).unwrap_or("");
        if !name.is_empty() {
            let role = caps
                .get(2)
                .map(|m| m.as_str().trim())
                .filter(|r| !r.is_empty())
                .unwrap_or(DEFAULT_PERSON_ROLE);
            let color = match caps.get(3).map(|m| m.as_str().trim()) {
                Some(c) if is_valid_color(c) => c.to_string(),
                _ => palette.color_for(name),
            };
            return Some(Person {
                name: name.to_string(),
                role: role.to_string(),
                color,
            });
        }
    }

    // No usable parenthesised part; keep whatever name is present.
    let name = strip_emphasis(entry.split(['(', '（']).next().unwrap_or(""));
    if name.is_empty() {
        return None;
    }
    Some(Person {
        name: name.to_string(),
        role: DEFAULT_PERSON_ROLE.to_string(),
        color: palette.color_for(name),
    })
}

/// --- SOURCES ---

fn clean_url(raw: &str) -> String {
    raw.trim_end_matches([')', ']', '>', '.', ',', ';', '。', '，', '；'])
        .to_string()
}

fn host_name(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    Some(host.strip_prefix("www.").unwrap_or(host).to_string())
}

/// Display name and optional URL of a source field.
pub fn parse_source(raw: &str) -> (String, Option<String>) {
    let raw = raw.trim();
    if raw.is_empty() {
        return (UNSPECIFIED_SOURCE.to_string(), None);
    }

    if let Some(caps) = LABELLED_URL_RE.captures(raw) {
        if let (Some(label), Some(url)) = (caps.get(1), caps.get(2)) {
            let name = label.as_str().trim().trim_matches(['[', ']']).trim();
            let url = clean_url(url.as_str());
            if !name.is_empty() {
                return (name.to_string(), Some(url));
            }
        }
    }

    if let Some(m) = BARE_URL_RE.find(raw) {
        let url = clean_url(m.as_str());
        let before = trim_label_separators(&raw[..m.start()])
            .trim_end_matches(['(', '（', '['])
            .trim();
        let name = if before.is_empty() {
            host_name(&url).unwrap_or_else(|| FALLBACK_SOURCE_NAME.to_string())
        } else {
            before.to_string()
        };
        return (name, Some(url));
    }

    (raw.to_string(), None)
}
