//! Knowledge Store: retrieval context for generation and repair.
//!
//! Documents live in one of two scopes. Job scope holds a single job's own
//! artifacts, contract and compiler output. Repo scope holds reusable
//! sources shared by all jobs of one tenant/project pair; a query never
//! crosses that boundary.

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::models::Language;

const TRUNCATED: &str = "\n... (truncated)";

const INDEXABLE_EXTENSIONS: &[&str] = &[
    "java", "kt", "ts", "tsx", "js", "jsx", "vue", "sql", "yaml", "yml", "json", "xml",
    "properties", "gradle", "md", "rs", "py",
];

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum KnowledgeScope {
    Job {
        job_id: Uuid,
    },
    Repo {
        tenant_id: Option<String>,
        project_id: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Source,
    Contract,
    CompilerOutput,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeDocument {
    pub id: Uuid,
    pub scope: KnowledgeScope,
    pub kind: DocumentKind,
    pub file_path: String,
    pub language: Language,
    pub content: String,
    pub round: u32,
    pub indexed_at: DateTime<Utc>,
    /// Relevance assigned by the last search; zero when stored.
    pub score: f32,
    #[serde(skip)]
    seq: u64,
}

impl KnowledgeDocument {
    pub fn new(scope: KnowledgeScope, kind: DocumentKind, file_path: impl Into<String>, content: impl Into<String>, round: u32) -> Self {
        let file_path = file_path.into();
        let language = match kind {
            DocumentKind::CompilerOutput => Language::Other,
            _ => Language::from_file_name(&file_path),
        };
        Self {
            id: Uuid::new_v4(),
            scope,
            kind,
            file_path,
            language,
            content: content.into(),
            round,
            indexed_at: Utc::now(),
            score: 0.0,
            seq: 0,
        }
    }

    fn title(&self) -> String {
        match self.kind {
            DocumentKind::CompilerOutput => format!("{} (compiler output, round {})", self.file_path, self.round),
            _ => self.file_path.clone(),
        }
    }
}

/// Whether a source path is worth indexing at all.
pub fn is_indexable(file_path: &str) -> bool {
    file_path
        .rsplit_once('.')
        .map(|(_, ext)| INDEXABLE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// Relevance/recency ranked documents of one job.
    async fn search(&self, query: &str, job_id: Uuid, top_k: usize) -> Result<Vec<KnowledgeDocument>>;

    /// Relevance ranked documents shared by one tenant/project pair.
    async fn search_repo(
        &self,
        query: &str,
        tenant_id: Option<&str>,
        project_id: Option<&str>,
        top_k: usize,
    ) -> Result<Vec<KnowledgeDocument>>;

    /// Store a document. Returns `false` when the document was skipped.
    async fn ingest(&self, doc: KnowledgeDocument) -> Result<bool>;

    async fn ingest_job_document(&self, job_id: Uuid, kind: DocumentKind, file_path: &str, content: &str, round: u32) -> Result<bool> {
        self.ingest(KnowledgeDocument::new(KnowledgeScope::Job { job_id }, kind, file_path, content, round))
            .await
    }

    async fn ingest_repo_document(
        &self,
        tenant_id: Option<&str>,
        project_id: Option<&str>,
        file_path: &str,
        content: &str,
    ) -> Result<bool> {
        let scope = KnowledgeScope::Repo {
            tenant_id: tenant_id.map(str::to_string),
            project_id: project_id.map(str::to_string),
        };
        self.ingest(KnowledgeDocument::new(scope, DocumentKind::Source, file_path, content, 0))
            .await
    }

    /// Forget everything in a job's scope.
    async fn clear_job(&self, job_id: Uuid) -> Result<()>;

    /// Character budget of `format_for_context`.
    fn context_budget(&self) -> usize;

    fn format_for_context(&self, docs: &[KnowledgeDocument]) -> String {
        render_context(docs, self.context_budget())
    }
}

/// Render documents in the given order as fenced markdown blocks, never
/// exceeding `max_chars` characters. The block that does not fit is cut
/// and marked; nothing after it is rendered.
pub fn render_context(docs: &[KnowledgeDocument], max_chars: usize) -> String {
    let mut out = String::new();
    let mut used = 0usize;
    for doc in docs {
        let block = render_block(doc, &doc.content);
        let len = block.chars().count();
        if used + len <= max_chars {
            out.push_str(&block);
            used += len;
            continue;
        }
        let remaining = max_chars - used;
        let frame = render_block(doc, "").chars().count() + TRUNCATED.chars().count();
        if remaining > frame {
            let kept: String = doc.content.chars().take(remaining - frame).collect();
            out.push_str(&render_block(doc, &format!("{}{}", kept, TRUNCATED)));
        }
        break;
    }
    out
}

fn render_block(doc: &KnowledgeDocument, body: &str) -> String {
    format!("#### {}\n```{}\n{}\n```\n\n", doc.title(), doc.language.fence(), body)
}

fn query_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| t.len() >= 2)
        .map(|t| t.to_lowercase())
        .collect();
    terms.sort();
    terms.dedup();
    terms
}

fn rank(docs: Vec<KnowledgeDocument>, query: &str, top_k: usize) -> Vec<KnowledgeDocument> {
    let terms = query_terms(query);
    let mut scored: Vec<KnowledgeDocument> = docs
        .into_iter()
        .filter_map(|mut doc| {
            if terms.is_empty() {
                return Some(doc);
            }
            let haystack = format!("{}\n{}", doc.file_path, doc.content).to_lowercase();
            let hits = terms.iter().filter(|t| haystack.contains(t.as_str())).count();
            if hits == 0 {
                return None;
            }
            doc.score = hits as f32 / terms.len() as f32;
            Some(doc)
        })
        .collect();
    scored.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then(b.round.cmp(&a.round))
            .then(b.seq.cmp(&a.seq))
    });
    scored.truncate(top_k);
    scored
}

/// Process-local knowledge store.
///
/// Repo scopes keep at most `repo_capacity` documents each: a document with
/// an existing path replaces the old one, otherwise the oldest is evicted.
pub struct InMemoryKnowledgeStore {
    scopes: DashMap<KnowledgeScope, Vec<KnowledgeDocument>>,
    next_seq: AtomicU64,
    repo_capacity: usize,
    max_context_chars: usize,
}

impl InMemoryKnowledgeStore {
    pub fn new(repo_capacity: usize, max_context_chars: usize) -> Self {
        Self {
            scopes: DashMap::new(),
            next_seq: AtomicU64::new(1),
            repo_capacity: repo_capacity.max(1),
            max_context_chars,
        }
    }

    pub fn len(&self, scope: &KnowledgeScope) -> usize {
        self.scopes.get(scope).map(|docs| docs.len()).unwrap_or(0)
    }

    fn snapshot(&self, scope: &KnowledgeScope) -> Vec<KnowledgeDocument> {
        self.scopes.get(scope).map(|docs| docs.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl KnowledgeStore for InMemoryKnowledgeStore {
    async fn search(&self, query: &str, job_id: Uuid, top_k: usize) -> Result<Vec<KnowledgeDocument>> {
        Ok(rank(self.snapshot(&KnowledgeScope::Job { job_id }), query, top_k))
    }

    async fn search_repo(
        &self,
        query: &str,
        tenant_id: Option<&str>,
        project_id: Option<&str>,
        top_k: usize,
    ) -> Result<Vec<KnowledgeDocument>> {
        if tenant_id.is_none() && project_id.is_none() {
            return Ok(Vec::new());
        }
        let scope = KnowledgeScope::Repo {
            tenant_id: tenant_id.map(str::to_string),
            project_id: project_id.map(str::to_string),
        };
        Ok(rank(self.snapshot(&scope), query, top_k))
    }

    async fn ingest(&self, mut doc: KnowledgeDocument) -> Result<bool> {
        if doc.kind == DocumentKind::Source && !is_indexable(&doc.file_path) {
            return Ok(false);
        }
        if doc.content.trim().is_empty() {
            return Ok(false);
        }
        doc.seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        doc.score = 0.0;

        let is_repo = matches!(doc.scope, KnowledgeScope::Repo { .. });
        let mut docs = self.scopes.entry(doc.scope.clone()).or_default();
        if is_repo {
            docs.retain(|d| d.file_path != doc.file_path);
        } else {
            docs.retain(|d| !(d.kind == doc.kind && d.file_path == doc.file_path && d.round == doc.round));
        }
        docs.push(doc);
        if is_repo && docs.len() > self.repo_capacity {
            // Sequence numbers only grow, so the front is the oldest entry.
            docs.sort_by_key(|d| d.seq);
            let excess = docs.len() - self.repo_capacity;
            docs.drain(..excess);
        }
        Ok(true)
    }

    async fn clear_job(&self, job_id: Uuid) -> Result<()> {
        self.scopes.remove(&KnowledgeScope::Job { job_id });
        Ok(())
    }

    fn context_budget(&self) -> usize {
        self.max_context_chars
    }
}
