use crate::types::{ParseResult, TimelineEvent};

/// What changed between two successive parses of a growing buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParseDelta {
    pub summary: Option<String>,
    pub events: Vec<TimelineEvent>,
}

impl ParseDelta {
    pub fn is_empty(&self) -> bool {
        self.summary.is_none() && self.events.is_empty()
    }
}

/// Events in `next` whose ids do not appear in `prev`, in `next` order.
pub fn diff_events(prev: &[TimelineEvent], next: &[TimelineEvent]) -> Vec<TimelineEvent> {
    next.iter()
        .filter(|e| !prev.iter().any(|p| p.id == e.id))
        .cloned()
        .collect()
}

/// Remembers which event ids have been delivered during one session.
///
/// Equality is by id. Once an id has been delivered its fields are frozen from the consumer's
/// point of view, even if a later parse reports different content for it.
#[derive(Debug, Clone, Default)]
pub struct EventTracker {
    delivered: Vec<TimelineEvent>,
    last_summary: String,
}

impl EventTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, result: &ParseResult) -> ParseDelta {
        let summary = if result.summary != self.last_summary {
            self.last_summary = result.summary.clone();
            Some(result.summary.clone())
        } else {
            None
        };

        let events = diff_events(&self.delivered, &result.events);
        self.delivered.extend(events.iter().cloned());

        ParseDelta { summary, events }
    }

    /// Events as first delivered, in delivery order.
    pub fn delivered(&self) -> &[TimelineEvent] {
        &self.delivered
    }

    pub fn delivered_count(&self) -> usize {
        self.delivered.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::TimelineParser;
    use std::collections::HashSet;

    fn event(id: &str, title: &str) -> TimelineEvent {
        TimelineEvent {
            id: id.into(),
            date: String::new(),
            title: title.into(),
            description: String::new(),
            people: Vec::new(),
            source: String::new(),
            source_url: None,
        }
    }

    #[test]
    fn test_diff_by_id() {
        let prev = vec![event("event-0", "a")];
        let next = vec![event("event-0", "a changed"), event("event-1", "b")];
        let diff = diff_events(&prev, &next);
        assert_eq!(diff.len(), 1);
        assert_eq!(diff[0].id, "event-1");
    }

    #[test]
    fn test_observe_freezes_delivered_events() {
        let mut tracker = EventTracker::new();
        let first = ParseResult {
            summary: String::new(),
            events: vec![event("event-0", "short")],
        };
        assert_eq!(tracker.observe(&first).events.len(), 1);

        let second = ParseResult {
            summary: String::new(),
            events: vec![event("event-0", "longer title")],
        };
        assert!(tracker.observe(&second).is_empty());
        assert_eq!(tracker.delivered()[0].title, "short");
    }

    #[test]
    fn test_summary_reported_only_on_change() {
        let mut tracker = EventTracker::new();
        let empty = ParseResult::default();
        assert!(tracker.observe(&empty).summary.is_none());

        let with_summary = ParseResult {
            summary: "概要".into(),
            events: Vec::new(),
        };
        assert_eq!(tracker.observe(&with_summary).summary.as_deref(), Some("概要"));
        assert!(tracker.observe(&with_summary).summary.is_none());
    }

    #[test]
    fn test_prefix_sequence_emits_each_id_once() {
        let text = "===总结===\n概要\n===事件列表===\n--事件1--\n日期：2021\n标题：甲\n--事件2--\n日期：2020\n标题：乙\n--事件3--\n日期：2022\n标题：丙\n";
        let parser = TimelineParser::default();
        let mut tracker = EventTracker::new();
        let mut emitted = Vec::new();

        let boundaries: Vec<usize> = text
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(text.len()))
            .collect();
        for &end in &boundaries {
            let delta = tracker.observe(&parser.parse(&text[..end], false));
            emitted.extend(delta.events.into_iter().map(|e| e.id));
        }
        let delta = tracker.observe(&parser.parse(text, true));
        emitted.extend(delta.events.into_iter().map(|e| e.id));

        let final_ids: HashSet<String> = parser
            .parse(text, true)
            .events
            .into_iter()
            .map(|e| e.id)
            .collect();
        let emitted_set: HashSet<String> = emitted.iter().cloned().collect();
        assert_eq!(emitted.len(), emitted_set.len());
        assert_eq!(emitted_set, final_ids);
        assert_eq!(tracker.delivered_count(), 3);
    }
}
