use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::prompt::PromptParams;
use crate::sessions::GenerationSession;
use crate::versions::GraphState;

pub const HISTORY_SCHEMA_VERSION: u64 = 1;

/// Snapshot of a past generation, enough to rehydrate a workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    #[serde(default = "default_schema_version")]
    pub schema_version: u64,
    pub id: String,
    pub created_at: String,
    pub prompt: String,
    #[serde(default)]
    pub manual_prompt: bool,
    #[serde(default)]
    pub params: PromptParams,
    pub graph: GraphState,
    #[serde(default)]
    pub session: Option<GenerationSession>,
}

impl HistoryRecord {
    pub fn new(
        prompt: impl Into<String>,
        manual_prompt: bool,
        params: PromptParams,
        graph: GraphState,
        session: Option<GenerationSession>,
    ) -> Self {
        Self {
            schema_version: HISTORY_SCHEMA_VERSION,
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false),
            prompt: prompt.into(),
            manual_prompt,
            params,
            graph,
            session,
        }
    }

    pub fn summary(&self) -> HistorySummary {
        let thumbnail_url = self
            .graph
            .active_version_id
            .as_deref()
            .and_then(|id| self.graph.versions.iter().find(|version| version.id == id))
            .map(|version| version.image_url.clone());
        HistorySummary {
            id: self.id.clone(),
            created_at: self.created_at.clone(),
            prompt: self.prompt.clone(),
            kind: self
                .session
                .as_ref()
                .map(|session| session.kind.as_str().to_string()),
            thumbnail_url,
            output_count: self
                .session
                .as_ref()
                .map(|session| session.urls().len())
                .unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistorySummary {
    pub id: String,
    pub created_at: String,
    pub prompt: String,
    pub kind: Option<String>,
    pub thumbnail_url: Option<String>,
    pub output_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryPage {
    pub page: usize,
    pub per_page: usize,
    pub total: usize,
    pub total_pages: usize,
    pub records: Vec<HistorySummary>,
}

/// Newest-first page of summaries. `page` is 1-based and clamped to the
/// valid range; `per_page` is at least 1.
pub fn paginate(mut summaries: Vec<HistorySummary>, page: usize, per_page: usize) -> HistoryPage {
    summaries.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    let per_page = per_page.max(1);
    let total = summaries.len();
    let total_pages = total.div_ceil(per_page).max(1);
    let page = page.clamp(1, total_pages);
    let records = summaries
        .into_iter()
        .skip((page - 1) * per_page)
        .take(per_page)
        .collect();
    HistoryPage {
        page,
        per_page,
        total,
        total_pages,
        records,
    }
}

fn default_schema_version() -> u64 {
    HISTORY_SCHEMA_VERSION
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(id: &str, created_at: &str) -> HistorySummary {
        HistorySummary {
            id: id.to_string(),
            created_at: created_at.to_string(),
            prompt: String::new(),
            kind: None,
            thumbnail_url: None,
            output_count: 0,
        }
    }

    #[test]
    fn paginate_returns_newest_first() {
        let page = paginate(
            vec![
                summary("a", "2026-01-01T00:00:00Z"),
                summary("c", "2026-03-01T00:00:00Z"),
                summary("b", "2026-02-01T00:00:00Z"),
            ],
            1,
            2,
        );
        assert_eq!(page.total, 3);
        assert_eq!(page.total_pages, 2);
        let ids: Vec<&str> = page.records.iter().map(|row| row.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b"]);
    }

    #[test]
    fn paginate_clamps_out_of_range_pages() {
        let rows = vec![summary("a", "2026-01-01T00:00:00Z")];
        let page = paginate(rows.clone(), 9, 10);
        assert_eq!(page.page, 1);
        assert_eq!(page.records.len(), 1);

        let empty = paginate(Vec::new(), 0, 0);
        assert_eq!(empty.page, 1);
        assert_eq!(empty.per_page, 1);
        assert_eq!(empty.total_pages, 1);
        assert!(empty.records.is_empty());
    }
}
