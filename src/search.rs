//! Search engine (§4.L): `reflect_on_past` and its two thin specializations
//! `search_by_file`/`search_by_concept`, plus `get_full_conversation`.
//!
//! Three decay modes share one merge/boost/render pipeline:
//! - **server-side** — a Qdrant ranking-formula query (`score + decay_weight
//!   · exp_decay(timestamp, now, scale_ms, midpoint=0.5)`), grounded on the
//!   `Formula`/`DecayParamsExpression` construction used by the original
//!   reference server.
//! - **client-side** — plain vector search over `limit × 3` candidates,
//!   decay computed by hand from each hit's `timestamp` payload field.
//! - **no decay** — plain vector search with a slightly loosened
//!   `score_threshold` and a flat v2-chunk boost.

use std::collections::HashMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use qdrant_client::qdrant::{
    condition::ConditionOneOf, r#match::MatchValue, vector_input::Variant as VectorVariant, with_payload_selector::SelectorOptions,
    Condition, FieldCondition, Filter, Match, PrefetchQueryBuilder, Query, QueryPointsBuilder, ScoredPoint,
    Value as QdrantValue, VectorInput, WithPayloadSelector,
};
use qdrant_client::qdrant::query::Variant as QueryVariant;
use qdrant_client::qdrant::{
    DecayParamsExpression, Expression, Formula, MultExpression, SumExpression,
};
use qdrant_client::qdrant::expression::Variant as ExprVariant;
use serde::Serialize;

use crate::config::Config;
use crate::embedding::{EmbedKind, EmbeddingProvider};
use crate::error::{AppError, VectorStoreError};
use crate::models::PatternInheritance;
use crate::resolver::Resolver;
use crate::vector_store::{payload_to_json, VectorStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecayMode {
    Off = -1,
    Client = 0,
    Server = 1,
}

impl DecayMode {
    pub fn from_i32(v: i32) -> DecayMode {
        match v {
            1 => DecayMode::Server,
            0 => DecayMode::Client,
            _ => DecayMode::Off,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFormat {
    Xml,
    Markdown,
}

pub struct SearchRequest {
    pub query: String,
    pub limit: usize,
    pub min_score: f32,
    pub decay: DecayMode,
    pub project: Option<String>,
    pub include_raw: bool,
    pub format: ResponseFormat,
    pub brief: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Hit {
    pub score: f32,
    pub collection: String,
    pub project: String,
    pub conversation_id: String,
    pub base_conversation_id: String,
    pub chunk_index: i64,
    pub timestamp: DateTime<Utc>,
    pub text: String,
    pub chunking_version: String,
    pub files_analyzed: Vec<String>,
    pub files_edited: Vec<String>,
    pub concepts: Vec<String>,
    pub tools_used: Vec<String>,
    pub tool_summary: HashMap<String, u32>,
    pub code_patterns: Option<HashMap<String, Vec<String>>>,
    pub pattern_inheritance: Option<PatternInheritance>,
    pub message_count: Option<u32>,
    pub total_length: Option<u32>,
    pub raw: Option<serde_json::Value>,
}

pub struct SearchEngine<'a> {
    pub config: &'a Config,
    pub store: &'a VectorStore,
    pub resolver: &'a Resolver,
    pub local_provider: &'a dyn EmbeddingProvider,
    pub voyage_provider: Option<&'a dyn EmbeddingProvider>,
}

impl<'a> SearchEngine<'a> {
    /// `reflect_on_past`.
    pub async fn reflect_on_past(&self, req: &SearchRequest) -> Result<String, AppError> {
        let t0 = Instant::now();

        let collections = self.resolve_target_collections(req.project.as_deref()).await;
        let t_resolve = t0.elapsed();

        let mut query_vectors: HashMap<&str, Vec<f32>> = HashMap::new();
        let mut all_hits = Vec::new();

        for collection in &collections {
            let suffix = backend_suffix(collection);
            let provider = self.provider_for_suffix(suffix);
            let Some(provider) = provider else { continue };

            let vector = match query_vectors.get(suffix) {
                Some(v) => v.clone(),
                None => {
                    let embedded = provider
                        .embed(&[req.query.clone()], EmbedKind::Query)
                        .await
                        .map_err(AppError::from)?;
                    let v = embedded.into_iter().next().unwrap_or_default();
                    query_vectors.insert(suffix, v.clone());
                    v
                }
            };

            let hits = self
                .search_one_collection(collection, &vector, req)
                .await
                .unwrap_or_default();
            all_hits.extend(hits);
        }
        let t_search = t0.elapsed() - t_resolve;

        filter_by_project(&mut all_hits, req.project.as_deref());
        apply_base_conversation_boost(&mut all_hits);

        all_hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        all_hits.truncate(req.limit);
        let t_total = t0.elapsed();

        let timing = Timing {
            resolve: t_resolve,
            search: t_search,
            total: t_total,
        };

        Ok(render(&all_hits, req, &timing))
    }

    /// `search_by_file`: payload filter on `files_analyzed`/`files_edited`,
    /// the path itself embedded so hits stay score-ordered.
    pub async fn search_by_file(&self, path_suffix: &str, limit: usize, project: Option<&str>) -> Result<String, AppError> {
        let req = SearchRequest {
            query: path_suffix.to_string(),
            limit,
            min_score: 0.0,
            decay: DecayMode::Off,
            project: project.map(String::from),
            include_raw: false,
            format: ResponseFormat::Xml,
            brief: false,
        };

        let collections = self.resolve_target_collections(project).await;
        let mut hits = Vec::new();

        for collection in &collections {
            let suffix = backend_suffix(collection);
            let Some(provider) = self.provider_for_suffix(suffix) else { continue };
            let vector = provider
                .embed(&[path_suffix.to_string()], EmbedKind::Query)
                .await
                .map_err(AppError::from)?
                .into_iter()
                .next()
                .unwrap_or_default();

            let filter = Filter {
                must: vec![path_contains_filter(path_suffix)],
                ..Default::default()
            };

            let scored = self
                .store
                .search(collection, vector, (limit * 2) as u64, None, Some(filter))
                .await;
            if let Ok(scored) = scored {
                hits.extend(scored.into_iter().filter_map(|p| hit_from_scored_point(collection, p, false)));
            }
        }

        filter_by_project(&mut hits, project);
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);

        Ok(render(&hits, &req, &Timing::default()))
    }

    /// `search_by_concept`: payload filter on `concepts`, broader
    /// `score_threshold = 0.5`.
    pub async fn search_by_concept(
        &self,
        concept: &str,
        include_files: bool,
        limit: usize,
        project: Option<&str>,
    ) -> Result<String, AppError> {
        let req = SearchRequest {
            query: concept.to_string(),
            limit,
            min_score: 0.0,
            decay: DecayMode::Off,
            project: project.map(String::from),
            include_raw: false,
            format: ResponseFormat::Xml,
            brief: false,
        };

        let collections = self.resolve_target_collections(project).await;
        let mut hits = Vec::new();
        let concept_lower = concept.to_lowercase();

        for collection in &collections {
            let suffix = backend_suffix(collection);
            let Some(provider) = self.provider_for_suffix(suffix) else { continue };
            let vector = provider
                .embed(&[concept.to_string()], EmbedKind::Query)
                .await
                .map_err(AppError::from)?
                .into_iter()
                .next()
                .unwrap_or_default();

            let mut must = vec![concept_contains_filter(&concept_lower)];
            if include_files {
                must.push(files_non_empty_filter());
            }
            let filter = Filter { must, ..Default::default() };

            let scored = self
                .store
                .search(collection, vector, (limit * 2) as u64, Some(0.5), Some(filter))
                .await;
            if let Ok(scored) = scored {
                hits.extend(scored.into_iter().filter_map(|p| hit_from_scored_point(collection, p, false)));
            }
        }

        filter_by_project(&mut hits, project);
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);

        Ok(render(&hits, &req, &Timing::default()))
    }

    /// `get_full_conversation`: no re-embedding, scroll + exact-match filter
    /// on `conversation_id`, reassembled in `chunk_index` order.
    pub async fn get_full_conversation(&self, conversation_id: &str, project: Option<&str>) -> Result<String, AppError> {
        let collections = self.resolve_target_collections(project).await;

        for collection in &collections {
            let filter = Filter {
                must: vec![exact_match_filter("conversation_id", conversation_id)],
                ..Default::default()
            };
            let response = self.store.scroll(collection, Some(filter), None, 10_000).await;
            let Ok(response) = response else { continue };
            if response.result.is_empty() {
                continue;
            }

            let mut chunks: Vec<(i64, String)> = response
                .result
                .iter()
                .filter_map(|p| {
                    let idx = payload_int(&p.payload, "chunk_index")?;
                    let text = payload_str(&p.payload, "text")?;
                    Some((idx, text))
                })
                .collect();
            chunks.sort_by_key(|(idx, _)| *idx);

            let full_text = chunks.into_iter().map(|(_, t)| t).collect::<Vec<_>>().join("\n\n");
            return Ok(format!(
                "<conversation id=\"{conversation_id}\" collection=\"{collection}\">\n<![CDATA[\n{full_text}\n]]>\n</conversation>"
            ));
        }

        Err(AppError::NotFound(format!("conversation {conversation_id} not found")))
    }

    /// Resolves `project` to the collections to search. `Some("all")` and
    /// an empty/no-match resolution both fall back to every collection;
    /// `None` first tries inferring the caller's project from its working
    /// directory before falling back the same way.
    async fn resolve_target_collections(&self, project: Option<&str>) -> Vec<String> {
        match project {
            Some("all") => self.resolver.all_collections(self.store).await,
            Some(name) => {
                let resolved: Vec<String> = self.resolver.resolve(self.store, name).await.into_iter().collect();
                if resolved.is_empty() {
                    self.resolver.all_collections(self.store).await
                } else {
                    resolved
                }
            }
            None => {
                if let Some(inferred) = crate::project::project_from_cwd() {
                    let resolved: Vec<String> = self.resolver.resolve(self.store, &inferred).await.into_iter().collect();
                    if !resolved.is_empty() {
                        return resolved;
                    }
                }
                self.resolver.all_collections(self.store).await
            }
        }
    }

    fn provider_for_suffix(&self, suffix: &str) -> Option<&dyn EmbeddingProvider> {
        match suffix {
            "voyage" => self.voyage_provider,
            _ => Some(self.local_provider),
        }
    }

    async fn search_one_collection(&self, collection: &str, vector: &[f32], req: &SearchRequest) -> Result<Vec<Hit>, VectorStoreError> {
        match req.decay {
            DecayMode::Server if self.config.use_native_decay => self.search_server_decay(collection, vector, req).await,
            DecayMode::Client => self.search_client_decay(collection, vector, req).await,
            _ => self.search_no_decay(collection, vector, req).await,
        }
    }

    async fn search_server_decay(&self, collection: &str, vector: &[f32], req: &SearchRequest) -> Result<Vec<Hit>, VectorStoreError> {
        let scale_ms = self.config.decay_scale_ms();
        let weight = self.config.decay_weight;

        let formula = Formula {
            sum: vec![
                Expression {
                    variant: Some(ExprVariant::Variable("score".to_string())),
                },
                Expression {
                    variant: Some(ExprVariant::Mult(Box::new(MultExpression {
                        mult: vec![
                            Expression {
                                variant: Some(ExprVariant::Constant(weight as f32)),
                            },
                            Expression {
                                variant: Some(ExprVariant::ExpDecay(Box::new(DecayParamsExpression {
                                    x: Some(Box::new(Expression {
                                        variant: Some(ExprVariant::DatetimeKey("timestamp".to_string())),
                                    })),
                                    target: Some(Box::new(Expression {
                                        variant: Some(ExprVariant::Datetime("now".to_string())),
                                    })),
                                    scale: Some(scale_ms as f32),
                                    midpoint: Some(0.5),
                                }))),
                            },
                        ],
                    }))),
                },
            ],
        };

        let prefetch = PrefetchQueryBuilder::default()
            .query(Query::from(VectorInput {
                variant: Some(VectorVariant::Dense(qdrant_client::qdrant::DenseVector { data: vector.to_vec() })),
            }))
            .limit((req.limit * 3) as u64)
            .build();

        let request = QueryPointsBuilder::new(collection)
            .add_prefetch(prefetch)
            .query(Query {
                variant: Some(QueryVariant::Formula(formula)),
            })
            .with_payload(WithPayloadSelector {
                selector_options: Some(SelectorOptions::Enable(true)),
            })
            .limit(req.limit as u64);

        let response = self
            .store
            .raw_client()
            .query(request)
            .await
            .map_err(|e| VectorStoreError::Client(e.into()))?;

        Ok(response
            .result
            .into_iter()
            .filter_map(|p| hit_from_scored_point(collection, p, req.include_raw))
            .filter(|h| h.score >= req.min_score)
            .collect())
    }

    async fn search_client_decay(&self, collection: &str, vector: &[f32], req: &SearchRequest) -> Result<Vec<Hit>, VectorStoreError> {
        let scored = self.store.search(collection, vector.to_vec(), (req.limit * 3) as u64, None, None).await?;
        let now = Utc::now();
        let scale_ms = self.config.decay_scale_ms();
        let weight = self.config.decay_weight;

        let mut hits: Vec<Hit> = scored
            .into_iter()
            .filter_map(|p| hit_from_scored_point(collection, p, req.include_raw))
            .map(|mut h| {
                let age_ms = (now - h.timestamp).num_milliseconds().max(0) as f64;
                let decay = (-age_ms / scale_ms).exp();
                h.score += (weight * decay) as f32;
                h
            })
            .filter(|h| h.score >= req.min_score)
            .collect();

        hits.truncate(req.limit * 2);
        Ok(hits)
    }

    async fn search_no_decay(&self, collection: &str, vector: &[f32], req: &SearchRequest) -> Result<Vec<Hit>, VectorStoreError> {
        let threshold = 0.9 * req.min_score;
        let scored = self
            .store
            .search(collection, vector.to_vec(), (req.limit * 2) as u64, Some(threshold), None)
            .await?;

        let mut hits: Vec<Hit> = scored.into_iter().filter_map(|p| hit_from_scored_point(collection, p, req.include_raw)).collect();
        for h in &mut hits {
            if h.chunking_version == "v2" {
                h.score = (h.score * 1.2).min(1.0);
            }
        }
        hits.retain(|h| h.score >= req.min_score);
        Ok(hits)
    }
}

#[derive(Default)]
struct Timing {
    resolve: std::time::Duration,
    search: std::time::Duration,
    total: std::time::Duration,
}

fn backend_suffix(collection: &str) -> &str {
    if collection.ends_with("_voyage") {
        "voyage"
    } else {
        "local"
    }
}

fn filter_by_project(hits: &mut Vec<Hit>, project: Option<&str>) {
    let Some(project) = project else { return };
    if project == "all" {
        return;
    }
    let target = project.replace('_', "-").to_lowercase();
    hits.retain(|h| {
        if h.collection.starts_with("reflections") && h.project.is_empty() {
            return true;
        }
        let candidate = h.project.replace('_', "-").to_lowercase();
        candidate == target || candidate.contains(&target) || target.contains(&candidate)
    });
}

/// Groups hits by `base_conversation_id`; conversations with more than one
/// surviving hit and a mean score above 0.8 get +0.1 on every member.
fn apply_base_conversation_boost(hits: &mut [Hit]) {
    let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
    for (i, h) in hits.iter().enumerate() {
        groups.entry(h.base_conversation_id.clone()).or_default().push(i);
    }

    for indices in groups.values() {
        if indices.len() <= 1 {
            continue;
        }
        let mean: f32 = indices.iter().map(|&i| hits[i].score).sum::<f32>() / indices.len() as f32;
        if mean > 0.8 {
            for &i in indices {
                hits[i].score += 0.1;
            }
        }
    }
}

fn hit_from_scored_point(collection: &str, point: ScoredPoint, include_raw: bool) -> Option<Hit> {
    let payload = &point.payload;
    let raw = if include_raw { Some(payload_to_json(payload)) } else { None };
    Some(Hit {
        score: point.score,
        collection: collection.to_string(),
        project: payload_str(payload, "project").unwrap_or_default(),
        conversation_id: payload_str(payload, "conversation_id").unwrap_or_default(),
        base_conversation_id: payload_str(payload, "base_conversation_id").unwrap_or_default(),
        chunk_index: payload_int(payload, "chunk_index").unwrap_or(0),
        timestamp: payload_str(payload, "timestamp")
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now),
        text: payload_str(payload, "text").unwrap_or_default(),
        chunking_version: payload_str(payload, "chunking_version").unwrap_or_default(),
        files_analyzed: payload_str_list(payload, "files_analyzed"),
        files_edited: payload_str_list(payload, "files_edited"),
        concepts: payload_str_list(payload, "concepts"),
        tools_used: payload_str_list(payload, "tools_used"),
        tool_summary: payload_u32_map(payload, "tool_summary"),
        code_patterns: payload_pattern_map(payload, "code_patterns"),
        pattern_inheritance: payload_pattern_inheritance(payload),
        message_count: payload_int(payload, "message_count").map(|n| n as u32),
        total_length: payload_int(payload, "total_length").map(|n| n as u32),
        raw,
    })
}

fn payload_str(payload: &HashMap<String, QdrantValue>, key: &str) -> Option<String> {
    match payload.get(key)?.kind.as_ref()? {
        qdrant_client::qdrant::value::Kind::StringValue(s) => Some(s.clone()),
        _ => None,
    }
}

fn payload_int(payload: &HashMap<String, QdrantValue>, key: &str) -> Option<i64> {
    match payload.get(key)?.kind.as_ref()? {
        qdrant_client::qdrant::value::Kind::IntegerValue(i) => Some(*i),
        _ => None,
    }
}

fn payload_str_list(payload: &HashMap<String, QdrantValue>, key: &str) -> Vec<String> {
    let Some(value) = payload.get(key) else { return Vec::new() };
    match &value.kind {
        Some(qdrant_client::qdrant::value::Kind::ListValue(list)) => list
            .values
            .iter()
            .filter_map(|v| match &v.kind {
                Some(qdrant_client::qdrant::value::Kind::StringValue(s)) => Some(s.clone()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn payload_u32_map(payload: &HashMap<String, QdrantValue>, key: &str) -> HashMap<String, u32> {
    let Some(value) = payload.get(key) else { return HashMap::new() };
    match &value.kind {
        Some(qdrant_client::qdrant::value::Kind::StructValue(s)) => s
            .fields
            .iter()
            .filter_map(|(k, v)| match &v.kind {
                Some(qdrant_client::qdrant::value::Kind::IntegerValue(i)) => Some((k.clone(), *i as u32)),
                _ => None,
            })
            .collect(),
        _ => HashMap::new(),
    }
}

fn payload_pattern_map(payload: &HashMap<String, QdrantValue>, key: &str) -> Option<HashMap<String, Vec<String>>> {
    let value = payload.get(key)?;
    match &value.kind {
        Some(qdrant_client::qdrant::value::Kind::StructValue(s)) => {
            let map: HashMap<String, Vec<String>> = s
                .fields
                .iter()
                .filter_map(|(k, v)| match &v.kind {
                    Some(qdrant_client::qdrant::value::Kind::ListValue(list)) => {
                        let items: Vec<String> = list
                            .values
                            .iter()
                            .filter_map(|item| match &item.kind {
                                Some(qdrant_client::qdrant::value::Kind::StringValue(s)) => Some(s.clone()),
                                _ => None,
                            })
                            .collect();
                        if items.is_empty() {
                            None
                        } else {
                            Some((k.clone(), items))
                        }
                    }
                    _ => None,
                })
                .collect();
            if map.is_empty() {
                None
            } else {
                Some(map)
            }
        }
        _ => None,
    }
}

fn payload_pattern_inheritance(payload: &HashMap<String, QdrantValue>) -> Option<PatternInheritance> {
    let value = payload.get("pattern_inheritance")?;
    let Some(qdrant_client::qdrant::value::Kind::StructValue(s)) = &value.kind else {
        return None;
    };
    let fields: HashMap<String, QdrantValue> = s.fields.clone();
    let source_chunk = payload_str(&fields, "source_chunk")?;
    let confidence = match fields.get("confidence").and_then(|v| v.kind.as_ref()) {
        Some(qdrant_client::qdrant::value::Kind::DoubleValue(d)) => *d as f32,
        Some(qdrant_client::qdrant::value::Kind::IntegerValue(i)) => *i as f32,
        _ => 0.0,
    };
    let distance = payload_int(&fields, "distance").unwrap_or(0) as u32;
    Some(PatternInheritance {
        source_chunk,
        confidence,
        distance,
    })
}

fn path_contains_filter(path_suffix: &str) -> Condition {
    Condition {
        condition_one_of: Some(ConditionOneOf::Field(FieldCondition {
            key: "files_analyzed".to_string(),
            r#match: Some(Match {
                match_value: Some(MatchValue::Text(path_suffix.to_string())),
            }),
            ..Default::default()
        })),
    }
}

fn concept_contains_filter(concept: &str) -> Condition {
    Condition {
        condition_one_of: Some(ConditionOneOf::Field(FieldCondition {
            key: "concepts".to_string(),
            r#match: Some(Match {
                match_value: Some(MatchValue::Keyword(concept.to_string())),
            }),
            ..Default::default()
        })),
    }
}

fn files_non_empty_filter() -> Condition {
    Condition {
        condition_one_of: Some(ConditionOneOf::Field(FieldCondition {
            key: "files_analyzed".to_string(),
            ..Default::default()
        })),
    }
}

fn exact_match_filter(key: &str, value: &str) -> Condition {
    Condition {
        condition_one_of: Some(ConditionOneOf::Field(FieldCondition {
            key: key.to_string(),
            r#match: Some(Match {
                match_value: Some(MatchValue::Keyword(value.to_string())),
            }),
            ..Default::default()
        })),
    }
}

fn relative_time(timestamp: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let days = (now - timestamp).num_days();
    match days {
        0 => "today".to_string(),
        1 => "yesterday".to_string(),
        n if n > 0 => format!("{n}d"),
        _ => "today".to_string(),
    }
}

fn render(hits: &[Hit], req: &SearchRequest, timing: &Timing) -> String {
    match req.format {
        ResponseFormat::Markdown => render_markdown(hits, req),
        ResponseFormat::Xml => render_xml(hits, req, timing),
    }
}

fn render_markdown(hits: &[Hit], req: &SearchRequest) -> String {
    if hits.is_empty() {
        return format!("No results found for \"{}\".", req.query);
    }
    let mut out = format!("Found {} result(s) for \"{}\":\n\n", hits.len(), req.query);
    for (i, hit) in hits.iter().enumerate() {
        let excerpt: String = hit.text.chars().take(350).collect();
        out.push_str(&format!(
            "{}. **{}** (score {:.3}, {})\n   {}\n\n",
            i + 1,
            hit.conversation_id,
            hit.score,
            hit.project,
            excerpt
        ));
    }
    out
}

/// First line of the excerpt, capped to 80 chars — used as a result's
/// human-scannable title.
fn result_title(text: &str) -> String {
    let first_line = text.lines().next().unwrap_or("");
    if first_line.chars().count() > 80 {
        format!("{}...", first_line.chars().take(80).collect::<String>())
    } else {
        first_line.to_string()
    }
}

/// First ~100 chars of the excerpt — the single line meant to let a reader
/// decide relevance without opening the full result.
fn key_finding(text: &str) -> String {
    if text.chars().count() > 100 {
        format!("{}...", text.chars().take(100).collect::<String>())
    } else {
        text.to_string()
    }
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn render_xml(hits: &[Hit], req: &SearchRequest, timing: &Timing) -> String {
    let now = Utc::now();
    let mut out = String::new();

    out.push_str(&format!(
        "Found {} result(s) for \"{}\" across {} (min_score={:.2}).\n\n",
        hits.len(),
        req.query,
        req.project.as_deref().unwrap_or("all projects"),
        req.min_score
    ));

    let embedders: std::collections::BTreeSet<&str> = hits.iter().map(|h| backend_suffix(&h.collection)).collect();
    let embedder = if embedders.is_empty() {
        "none".to_string()
    } else {
        embedders.into_iter().collect::<Vec<_>>().join(",")
    };

    out.push_str("<meta>\n");
    out.push_str(&format!("  <query><![CDATA[{}]]></query>\n", req.query));
    out.push_str(&format!("  <scope>{}</scope>\n", req.project.as_deref().unwrap_or("all")));
    out.push_str(&format!("  <count>{}</count>\n", hits.len()));
    out.push_str(&format!("  <embedder>{embedder}</embedder>\n"));
    if let (Some(min), Some(max)) = (
        hits.iter().map(|h| h.score).fold(None, |acc: Option<f32>, s| Some(acc.map_or(s, |a| a.min(s)))),
        hits.iter().map(|h| h.score).fold(None, |acc: Option<f32>, s| Some(acc.map_or(s, |a| a.max(s)))),
    ) {
        out.push_str(&format!("  <score_range min=\"{min:.3}\" max=\"{max:.3}\"/>\n"));
    }
    out.push_str(&format!(
        "  <timing resolve_ms=\"{}\" search_ms=\"{}\" total_ms=\"{}\"/>\n",
        timing.resolve.as_millis(),
        timing.search.as_millis(),
        timing.total.as_millis()
    ));
    out.push_str("</meta>\n");

    out.push_str("<results>\n");
    for (rank, hit) in hits.iter().enumerate() {
        let excerpt: String = hit.text.chars().take(350).collect();
        out.push_str(&format!(
            "  <result rank=\"{}\" score=\"{:.3}\" project=\"{}\" time=\"{}\">\n",
            rank + 1,
            hit.score,
            hit.project,
            relative_time(hit.timestamp, now)
        ));
        out.push_str(&format!("    <conversation_id>{}</conversation_id>\n", hit.conversation_id));
        if !req.brief {
            out.push_str(&format!("    <title>{}</title>\n", xml_escape(&result_title(&hit.text))));
            out.push_str(&format!("    <key-finding>{}</key-finding>\n", xml_escape(&key_finding(&hit.text))));
        }
        if req.brief {
            out.push_str(&format!("    <excerpt>{excerpt}</excerpt>\n"));
        } else {
            out.push_str(&format!("    <excerpt><![CDATA[{}]]></excerpt>\n", hit.text));
        }

        if let Some(raw) = &hit.raw {
            out.push_str(&format!("    <raw><![CDATA[{}]]></raw>\n", serde_json::to_string(raw).unwrap_or_default()));
        }

        if let Some(code_patterns) = &hit.code_patterns {
            out.push_str("    <patterns>\n");
            for (category, patterns) in code_patterns {
                let shown: Vec<String> = patterns.iter().take(5).map(|p| xml_escape(p)).collect();
                out.push_str(&format!("      <cat name=\"{}\">{}</cat>\n", xml_escape(category), shown.join(", ")));
            }
            out.push_str("    </patterns>\n");
        }

        if !hit.files_analyzed.is_empty() || !hit.files_edited.is_empty() {
            out.push_str("    <files>\n");
            push_capped_list(&mut out, "analyzed", &hit.files_analyzed);
            push_capped_list(&mut out, "edited", &hit.files_edited);
            out.push_str("    </files>\n");
        }
        if !hit.concepts.is_empty() {
            out.push_str(&format!("    <concepts>{}</concepts>\n", hit.concepts.join(", ")));
        }
        if !hit.tool_summary.is_empty() {
            let mut sorted: Vec<(&String, &u32)> = hit.tool_summary.iter().collect();
            sorted.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
            let mut summary = sorted.iter().take(5).map(|(tool, count)| format!("{tool}({count})")).collect::<Vec<_>>().join(", ");
            if sorted.len() > 5 {
                summary.push_str(&format!(" ... and {} more", sorted.len() - 5));
            }
            out.push_str(&format!("    <tools>{summary}</tools>\n"));
        } else if !hit.tools_used.is_empty() {
            out.push_str(&format!("    <tools>{}</tools>\n", hit.tools_used.join(", ")));
        }

        if let Some(code_patterns) = &hit.code_patterns {
            out.push_str("    <code_patterns>\n");
            for (category, patterns) in code_patterns {
                let shown: Vec<String> = patterns.iter().take(5).map(|p| xml_escape(p)).collect();
                out.push_str(&format!("      <{0}>{1}</{0}>\n", category, shown.join(", ")));
            }
            out.push_str("    </code_patterns>\n");
        }

        if let Some(inheritance) = &hit.pattern_inheritance {
            out.push_str(&format!(
                "    <pattern_source chunk=\"{}\" confidence=\"{:.2}\" distance=\"{}\"/>\n",
                xml_escape(&inheritance.source_chunk),
                inheritance.confidence,
                inheritance.distance
            ));
        }

        if hit.message_count.is_some() || hit.total_length.is_some() {
            let mut attrs = Vec::new();
            if let Some(m) = hit.message_count {
                attrs.push(format!("messages=\"{m}\""));
            }
            if let Some(l) = hit.total_length {
                attrs.push(format!("length=\"{l}\""));
            }
            out.push_str(&format!("    <stats {}/>\n", attrs.join(" ")));
        }

        out.push_str("  </result>\n");
    }
    out.push_str("</results>\n");

    out.push_str(&render_pattern_intelligence(hits));

    out
}

/// Aggregated `<pattern_intelligence>` section: common patterns across all
/// hits (top 10), per-category coverage, a couple of hand-picked
/// cross-pattern insights, referenced files (top 10), and discussed
/// concepts (top 10).
fn render_pattern_intelligence(hits: &[Hit]) -> String {
    let mut pattern_counts: HashMap<String, u32> = HashMap::new();
    let mut category_coverage: HashMap<String, u32> = HashMap::new();
    let mut files: Vec<String> = Vec::new();
    let mut seen_files = std::collections::HashSet::new();
    let mut concepts: Vec<String> = Vec::new();
    let mut seen_concepts = std::collections::HashSet::new();
    let mut categories_present = std::collections::HashSet::new();

    for hit in hits {
        if let Some(code_patterns) = &hit.code_patterns {
            for (category, patterns) in code_patterns {
                categories_present.insert(category.clone());
                *category_coverage.entry(category.clone()).or_insert(0) += patterns.len() as u32;
                for pattern in patterns {
                    *pattern_counts.entry(pattern.clone()).or_insert(0) += 1;
                }
            }
        }
        for f in hit.files_analyzed.iter().chain(hit.files_edited.iter()) {
            if seen_files.insert(f.clone()) {
                files.push(f.clone());
            }
        }
        for c in &hit.concepts {
            if seen_concepts.insert(c.clone()) {
                concepts.push(c.clone());
            }
        }
    }

    if pattern_counts.is_empty() {
        return String::new();
    }

    let mut out = String::new();
    out.push_str("<pattern_intelligence>\n");

    let total_results = hits.len().max(1);
    out.push_str("  <summary>\n");
    out.push_str(&format!("    <unique_patterns>{}</unique_patterns>\n", pattern_counts.len()));
    out.push_str(&format!(
        "    <pattern_diversity>{:.2}</pattern_diversity>\n",
        pattern_counts.len() as f64 / total_results as f64
    ));
    out.push_str("  </summary>\n");

    let mut sorted_patterns: Vec<(&String, &u32)> = pattern_counts.iter().collect();
    sorted_patterns.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    out.push_str("  <common_patterns>\n");
    for (pattern, count) in sorted_patterns.into_iter().take(10) {
        out.push_str(&format!("    <pattern count=\"{count}\">{}</pattern>\n", xml_escape(pattern)));
    }
    out.push_str("  </common_patterns>\n");

    out.push_str("  <categories>\n");
    let mut sorted_categories: Vec<(&String, &u32)> = category_coverage.iter().collect();
    sorted_categories.sort_by(|a, b| a.0.cmp(b.0));
    for (category, count) in sorted_categories {
        out.push_str(&format!("    <cat name=\"{}\" count=\"{count}\"/>\n", xml_escape(category)));
    }
    out.push_str("  </categories>\n");

    if categories_present.contains("async_patterns") && categories_present.contains("error_handling") {
        out.push_str("  <insight>Async patterns combined with error handling detected</insight>\n");
    }
    if categories_present.contains("react_hooks") {
        out.push_str("  <insight>React hooks with state management patterns detected</insight>\n");
    }

    if !files.is_empty() {
        let shown: Vec<&str> = files.iter().take(10).map(String::as_str).collect();
        out.push_str(&format!("  <files_across_results>{}</files_across_results>\n", shown.join(", ")));
    }
    if !concepts.is_empty() {
        let shown: Vec<&str> = concepts.iter().take(10).map(String::as_str).collect();
        out.push_str(&format!("  <concepts_discussed>{}</concepts_discussed>\n", shown.join(", ")));
    }

    out.push_str("</pattern_intelligence>\n");
    out
}

fn push_capped_list(out: &mut String, tag: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    const CAP: usize = 10;
    let shown: Vec<&String> = items.iter().take(CAP).collect();
    let tail = if items.len() > CAP {
        format!(" (and {} more)", items.len() - CAP)
    } else {
        String::new()
    };
    out.push_str(&format!(
        "      <{tag}>{}{tail}</{tag}>\n",
        shown.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
    ));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(score: f32, base_id: &str) -> Hit {
        Hit {
            score,
            collection: "conv_abcd1234_local".to_string(),
            project: "foo".to_string(),
            conversation_id: "c1".to_string(),
            base_conversation_id: base_id.to_string(),
            chunk_index: 0,
            timestamp: Utc::now(),
            text: "hello world".to_string(),
            chunking_version: "v2".to_string(),
            files_analyzed: vec![],
            files_edited: vec![],
            concepts: vec![],
            tools_used: vec![],
            tool_summary: HashMap::new(),
            code_patterns: None,
            pattern_inheritance: None,
            message_count: None,
            total_length: None,
            raw: None,
        }
    }

    #[test]
    fn base_conversation_boost_applies_when_group_mean_exceeds_threshold() {
        let mut hits = vec![hit(0.85, "base1"), hit(0.9, "base1")];
        apply_base_conversation_boost(&mut hits);
        assert!((hits[0].score - 0.95).abs() < 1e-5);
        assert!((hits[1].score - 1.0).abs() < 1e-5);
    }

    #[test]
    fn base_conversation_boost_skips_singleton_groups() {
        let mut hits = vec![hit(0.95, "base1")];
        apply_base_conversation_boost(&mut hits);
        assert!((hits[0].score - 0.95).abs() < 1e-5);
    }

    #[test]
    fn base_conversation_boost_skips_low_mean_groups() {
        let mut hits = vec![hit(0.5, "base1"), hit(0.6, "base1")];
        apply_base_conversation_boost(&mut hits);
        assert!((hits[0].score - 0.5).abs() < 1e-5);
    }

    #[test]
    fn backend_suffix_detects_voyage_collections() {
        assert_eq!(backend_suffix("conv_abcd1234_voyage"), "voyage");
        assert_eq!(backend_suffix("conv_abcd1234_local"), "local");
    }

    #[test]
    fn relative_time_labels_today_and_yesterday() {
        let now = Utc::now();
        assert_eq!(relative_time(now, now), "today");
        assert_eq!(relative_time(now - chrono::Duration::days(1), now), "yesterday");
        assert_eq!(relative_time(now - chrono::Duration::days(3), now), "3d");
    }

    #[test]
    fn markdown_render_reports_no_results() {
        let req = SearchRequest {
            query: "x".to_string(),
            limit: 5,
            min_score: 0.7,
            decay: DecayMode::Off,
            project: None,
            include_raw: false,
            format: ResponseFormat::Markdown,
            brief: false,
        };
        assert!(render_markdown(&[], &req).contains("No results"));
    }

    fn xml_req(brief: bool, include_raw: bool) -> SearchRequest {
        SearchRequest {
            query: "x".to_string(),
            limit: 5,
            min_score: 0.0,
            decay: DecayMode::Off,
            project: None,
            include_raw,
            format: ResponseFormat::Xml,
            brief,
        }
    }

    #[test]
    fn xml_render_includes_title_and_key_finding_unless_brief() {
        let h = hit(0.9, "base1");
        let req = xml_req(false, false);
        let out = render_xml(&[h], &req, &Timing::default());
        assert!(out.contains("<title>"));
        assert!(out.contains("<key-finding>"));
    }

    #[test]
    fn xml_render_omits_title_in_brief_mode() {
        let h = hit(0.9, "base1");
        let req = xml_req(true, false);
        let out = render_xml(&[h], &req, &Timing::default());
        assert!(!out.contains("<title>"));
    }

    #[test]
    fn xml_render_includes_raw_only_when_requested() {
        let mut h = hit(0.9, "base1");
        h.raw = Some(serde_json::json!({"text": "hello world"}));
        let req = xml_req(false, true);
        let out = render_xml(&[h], &req, &Timing::default());
        assert!(out.contains("<raw>"));
    }

    #[test]
    fn xml_render_shows_tool_counts() {
        let mut h = hit(0.9, "base1");
        h.tool_summary.insert("Edit".to_string(), 3);
        let req = xml_req(false, false);
        let out = render_xml(&[h], &req, &Timing::default());
        assert!(out.contains("Edit(3)"));
    }

    #[test]
    fn xml_render_emits_pattern_intelligence_when_code_patterns_present() {
        let mut h = hit(0.9, "base1");
        let mut patterns = HashMap::new();
        patterns.insert("async_patterns".to_string(), vec!["async fn run".to_string()]);
        h.code_patterns = Some(patterns);
        let req = xml_req(false, false);
        let out = render_xml(&[h], &req, &Timing::default());
        assert!(out.contains("<code_patterns>"));
        assert!(out.contains("<pattern_intelligence>"));
        assert!(out.contains("<common_patterns>"));
    }

    #[test]
    fn xml_render_omits_pattern_intelligence_when_no_patterns() {
        let h = hit(0.9, "base1");
        let req = xml_req(false, false);
        let out = render_xml(&[h], &req, &Timing::default());
        assert!(!out.contains("<pattern_intelligence>"));
    }
}
