//! Prompt templates sent to the generation service.
//!
//! The timeline prompt fixes the delimited format that `parser` reads back; keep the section
//! markers, record markers and field labels here in sync with `constants` and `parser`.

use crate::types::TimelineEvent;

pub const TIMELINE_SYSTEM_PROMPT: &str = r#"你是一名资深的研究分析师和新闻编辑。你的任务是针对用户提供的关键词（人物、公司、行业、产品或公共事件），梳理相关的关键发展，并整理成一条按时间排序的事件时间轴。

如果在回答前获得了搜索引擎提供的最新信息，请优先依据这些信息，确保内容基于可核实的事实。

请严格按照以下文本分段格式返回（不要使用 JSON，不要添加代码块或其他额外格式）：

===总结===
用一段话概括与关键词相关的整体动态：起因、近期发展、当前状态，以及可能的影响。保持客观。

===事件列表===

--事件1--
日期：事件发生日期，格式为 YYYY-MM-DD；只能确定到月份或年份时使用 YYYY-MM 或 YYYY
标题：事件标题，简明扼要
描述：事件的完整经过、各方的行动与反应、背景与后续影响
相关方/人物：相关方1(角色1,#颜色代码1);相关方2(角色2,#颜色代码2)
来源：信息来源名称 (URL)

--事件2--
日期：...
标题：...
描述：...
相关方/人物：...
来源：...

要求：
1. 按时间先后顺序组织事件（从最早到最近）。
2. 只记录能够确认的事实，不记录传闻或未经证实的信息；有争议的事件在描述中列出各方观点。
3. 为每个相关方分配不同的颜色代码，立场相近的相关方使用相近的颜色。
4. 每个事件的描述以 100 到 300 字为宜，包含时间、地点、关键人物和经过。
5. 每个事件都必须注明具体来源，并尽量附上原始报道的 URL。
6. 不同来源信息相互矛盾时，优先采信官方公告、一手资料等权威来源，并在描述中注明差异。
"#;

pub const EVENT_DETAILS_SYSTEM_PROMPT: &str = r#"你是一名资深的研究分析师。用户会给出时间轴中的一个事件，请结合搜索引擎提供的最新信息，对该事件做全面、深入的分析。

请按以下结构回答，使用 ===小标题=== 分隔各部分，可以使用粗体等 Markdown 语法：

===事件概述===
用简洁的语言说明事件的核心内容和时间线。

===背景与起因===
事件发生的历史背景、直接原因和深层原因。

===过程与关键节点===
按时间顺序列出事件发展的关键节点。

===各方观点与反应===
主要相关方的立场、行动和公开表态；存在分歧时分别列出。

===影响与后续发展===
事件带来的直接与长期影响，以及值得关注的后续走向。

===信息来源与可靠性===
列出分析所依据的主要来源（附 URL），并说明信息不足或相互矛盾之处。

通用规则：重点突出，避免冗余；尽量用具体数据和事实支撑分析；保持客观中立；信息不充分时明确指出分析的局限。
"#;

pub fn timeline_user_message(query: &str) -> String {
    format!("请为以下事件创建时间轴：{}", query.trim())
}

pub fn event_details_user_message(subject: &str) -> String {
    format!(
        "请详细分析以下事件的背景、过程、影响及各方观点：{}",
        subject.trim()
    )
}

/// Text describing one event, used both as the details request subject and as its search query.
pub fn describe_event(event: &TimelineEvent, topic: Option<&str>) -> String {
    let mut text = String::new();
    if let Some(topic) = topic.map(str::trim).filter(|t| !t.is_empty()) {
        text.push_str(&format!("【{}】", topic));
    }
    if !event.date.is_empty() {
        text.push_str(&event.date);
        text.push(' ');
    }
    text.push_str(&event.title);
    if !event.description.is_empty() {
        text.push_str("\n\n");
        text.push_str(&event.description);
    }
    if !event.people.is_empty() {
        let names: Vec<&str> = event.people.iter().map(|p| p.name.as_str()).collect();
        text.push_str(&format!("\n\n相关方：{}", names.join("、")));
    }
    text
}

/// Short search query for an event: the first paragraph of its description text.
pub fn event_search_query(subject: &str) -> &str {
    subject.split("\n\n").next().unwrap_or(subject).trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{EVENTS_SECTION_NAMES, SUMMARY_SECTION_NAMES};
    use crate::parser::TimelineParser;
    use crate::types::Person;

    #[test]
    fn test_timeline_prompt_uses_parser_vocabulary() {
        assert!(TIMELINE_SYSTEM_PROMPT.contains(&format!("==={}===", SUMMARY_SECTION_NAMES[0])));
        assert!(TIMELINE_SYSTEM_PROMPT.contains(&format!("==={}===", EVENTS_SECTION_NAMES[0])));
        assert!(TIMELINE_SYSTEM_PROMPT.contains("--事件1--"));
    }

    #[test]
    fn test_prompt_example_parses() {
        let result = TimelineParser::default().parse(TIMELINE_SYSTEM_PROMPT, true);
        assert!(!result.summary.is_empty());
        assert_eq!(result.events.len(), 2);
        assert_eq!(result.events[0].people.len(), 2);
    }

    #[test]
    fn test_describe_event() {
        let event = TimelineEvent {
            id: "event-0".into(),
            date: "2023-05-01".into(),
            title: "发布会".into(),
            description: "详细经过".into(),
            people: vec![Person {
                name: "张三".into(),
                role: "发言人".into(),
                color: "#123456".into(),
            }],
            source: "S".into(),
            source_url: None,
        };
        let text = describe_event(&event, Some("新品"));
        assert!(text.starts_with("【新品】2023-05-01 发布会"));
        assert!(text.contains("相关方：张三"));
        assert_eq!(event_search_query(&text), "【新品】2023-05-01 发布会");
    }
}
