use crate::constants::MAX_GROUNDING_RESULTS;
use crate::relay::{ProgressStatus, RelayChunk};
use crate::types::{OnelineError, Result, SearchSettings};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::time::Duration;

pub const NO_RESULTS_TEXT: &str = "未找到相关搜索结果。";

const SEARCH_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engines: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_query: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SearchResults {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub results: Vec<SearchHit>,
}

pub trait SearchProvider: Send + Sync {
    fn search<'a>(
        &'a self,
        query: &'a str,
        settings: &'a SearchSettings,
    ) -> BoxFuture<'a, Result<SearchResults>>;
}

/// SearXNG JSON API client.
#[derive(Clone)]
pub struct SearxngClient {
    client: reqwest::Client,
}

impl SearxngClient {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn search_url(base: &str) -> Result<url::Url> {
        let base = base.trim().trim_end_matches('/');
        url::Url::parse(&format!("{}/search", base))
            .map_err(|e| OnelineError::Configuration(format!("invalid search url: {}", e)).into())
    }

    async fn run(&self, query: &str, settings: &SearchSettings) -> Result<SearchResults> {
        let url = Self::search_url(&settings.url)?;
        let mut params: Vec<(&str, &str)> = vec![
            ("q", query),
            ("format", "json"),
            ("categories", settings.categories.as_deref().unwrap_or("general")),
            ("language", settings.language.as_deref().unwrap_or("zh")),
            ("time_range", settings.time_range.as_deref().unwrap_or("year")),
        ];
        if let Some(engines) = settings.engines.as_deref().filter(|e| !e.trim().is_empty()) {
            params.push(("engines", engines));
        }

        tracing::info!("[⚙️  -> 🔎] Searching: {}", crate::str_utils::log_snippet(query, 80));
        let response = self
            .client
            .get(url)
            .query(&params)
            .timeout(SEARCH_TIMEOUT)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OnelineError::UpstreamHttp(status, body).into());
        }

        let mut results: SearchResults = response.json().await?;
        if results.query.is_empty() {
            results.query = query.to_string();
        }
        results
            .results
            .truncate(settings.num_results.unwrap_or(MAX_GROUNDING_RESULTS));
        tracing::info!("[🔎 -> ⚙️ ] {} search results", results.results.len());
        Ok(results)
    }
}

impl SearchProvider for SearxngClient {
    fn search<'a>(
        &'a self,
        query: &'a str,
        settings: &'a SearchSettings,
    ) -> BoxFuture<'a, Result<SearchResults>> {
        Box::pin(self.run(query, settings))
    }
}

/// Renders search results as the auxiliary context block handed to the model.
pub fn format_search_results(results: Option<&SearchResults>) -> String {
    let results = match results {
        Some(r) if !r.results.is_empty() => r,
        _ => return NO_RESULTS_TEXT.to_string(),
    };

    let mut out = String::new();
    let _ = write!(out, "以下是与\"{}\"相关的最新搜索结果：\n\n", results.query);

    for (index, hit) in results.results.iter().take(MAX_GROUNDING_RESULTS).enumerate() {
        match hit.from_query.as_deref() {
            Some(from) if from != results.query => {
                let _ = writeln!(out, "[{}] {} (来自查询: \"{}\")", index + 1, hit.title, from);
            }
            _ => {
                let _ = writeln!(out, "[{}] {}", index + 1, hit.title);
            }
        }
        let _ = writeln!(out, "来源: {}", hit.url);
        if let Some(date) = hit.published_date.as_deref().filter(|d| !d.is_empty()) {
            let _ = writeln!(out, "日期: {}", date);
        }
        if let Some(category) = hit.category.as_deref().filter(|c| !c.is_empty()) {
            let _ = writeln!(out, "类别: {}", category);
        }
        let engine = match (&hit.engine, &hit.engines) {
            (Some(e), _) if !e.is_empty() => e.clone(),
            (_, Some(list)) => list.join(", "),
            _ => String::new(),
        };
        let _ = writeln!(out, "引擎: {}", engine);
        let _ = write!(out, "摘要: {}\n\n", hit.content);
    }

    out.push_str("请根据以上搜索结果和你已有的知识回答问题，特别是利用最新的事实和数据。为每个事件尽可能提供详细信息，包括：\n");
    out.push_str("1. 精确的日期（年月日）\n");
    out.push_str("2. 参与的人物及其角色\n");
    out.push_str("3. 详细的事件描述，包括原因、经过和结果\n");
    out.push_str("4. 可靠的信息来源\n");
    out.push_str("5. 相关的背景和影响\n");
    out.push_str("6. 尽可能分析不同来源信息的差异，整合最完整和准确的事实\n");
    out.push_str("7. 在事件来源中，必须加入原始新闻的URL链接，以便用户查看原始报道\n");
    out
}

/// Grounding block for `query`, or `None` when grounding is disabled. A failed search degrades
/// to the "no results" text instead of failing the request.
pub async fn grounding_context(
    provider: &dyn SearchProvider,
    settings: Option<&SearchSettings>,
    query: &str,
) -> Option<String> {
    grounding_context_with_progress(provider, settings, query, &mut |_| {}).await
}

/// Like [`grounding_context`], reporting each search step to `progress` as a `Progress` frame.
/// Nothing is reported when grounding is disabled.
pub async fn grounding_context_with_progress(
    provider: &dyn SearchProvider,
    settings: Option<&SearchSettings>,
    query: &str,
    progress: &mut (dyn FnMut(RelayChunk) + Send),
) -> Option<String> {
    let settings = settings.filter(|s| s.is_active())?;
    progress(RelayChunk::progress(
        format!("正在使用搜索引擎查询：{}", query),
        ProgressStatus::Pending,
    ));
    match provider.search(query, settings).await {
        Ok(results) => {
            let message = if results.results.is_empty() {
                "搜索未返回有效结果".to_string()
            } else {
                format!("搜索完成，获取到 {} 条结果", results.results.len())
            };
            progress(RelayChunk::progress(message, ProgressStatus::Completed));
            Some(format_search_results(Some(&results)))
        }
        Err(e) => {
            tracing::warn!("[🔎 -> ⚙️ ] Search failed, continuing without results: {}", e.inner);
            progress(RelayChunk::progress(
                format!("搜索失败：{}", e.inner),
                ProgressStatus::Error,
            ));
            Some(format_search_results(None))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(title: &str) -> SearchHit {
        SearchHit {
            title: title.into(),
            url: format!("https://example.com/{}", title),
            content: "snippet".into(),
            engine: Some("bing".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_results_use_fixed_sentence() {
        assert_eq!(format_search_results(None), NO_RESULTS_TEXT);
        assert_eq!(
            format_search_results(Some(&SearchResults::default())),
            NO_RESULTS_TEXT
        );
    }

    #[test]
    fn test_results_are_capped() {
        let results = SearchResults {
            query: "q".into(),
            results: (0..30).map(|i| hit(&format!("t{}", i))).collect(),
        };
        let text = format_search_results(Some(&results));
        assert!(text.contains("[20] t19"));
        assert!(!text.contains("[21]"));
        assert!(text.starts_with("以下是与\"q\"相关的最新搜索结果"));
    }

    #[test]
    fn test_hit_details_rendered() {
        let mut h = hit("a");
        h.published_date = Some("2024-01-02".into());
        h.from_query = Some("other".into());
        h.engine = None;
        h.engines = Some(vec!["google".into(), "bing".into()]);
        let results = SearchResults {
            query: "q".into(),
            results: vec![h],
        };
        let text = format_search_results(Some(&results));
        assert!(text.contains("[1] a (来自查询: \"other\")"));
        assert!(text.contains("日期: 2024-01-02"));
        assert!(text.contains("引擎: google, bing"));
    }

    #[test]
    fn test_search_url_normalises_trailing_slash() {
        let url = SearxngClient::search_url("http://localhost:8888/").unwrap();
        assert_eq!(url.as_str(), "http://localhost:8888/search");
        assert!(SearxngClient::search_url("not a url").is_err());
    }

    #[test]
    fn test_searxng_payload_deserialises() {
        let raw = r#"{"query":"q","results":[{"title":"T","url":"https://a","content":"c","publishedDate":"2024-05-01","engines":["bing"]}],"number_of_results":1}"#;
        let parsed: SearchResults = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.results[0].published_date.as_deref(), Some("2024-05-01"));
    }
}
