//! Two-stage vector index over tool inventories.
//!
//! Stage one ranks services by a summary embedding; stage two ranks the
//! surviving services' tools. All vectors are L2-normalized at build time so
//! cosine similarity is a plain inner product.

use mcp::protocol::ToolDescriptor;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use utoipa::ToSchema;

use shared::error::CommonError;

use crate::logic::embedder::Embedder;

/// Everything the index needs to know about one service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexableService {
    pub path: String,
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
    pub tools: Vec<ToolDescriptor>,
    /// Service currently in `healthy-auth-expired`: indexed, but flagged.
    pub auth_expired: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedTool {
    pub service_path: String,
    pub service_name: String,
    pub tool_name: String,
    pub raw_text: String,
    pub schema: Value,
    pub auth_expired: bool,
}

/// One search hit.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ToolMatch {
    pub tool_name: String,
    pub parsed_description: String,
    pub tool_schema: Value,
    pub service_path: String,
    pub service_name: String,
    /// Raw cosine similarity in [-1, 1]; callers may threshold.
    pub overall_similarity_score: f32,
    pub auth_expired: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub path: String,
    pub name: String,
    pub tags: Vec<String>,
}

/// Dense matrices, cached to disk as a compact binary blob.
#[derive(Debug, Serialize, Deserialize)]
pub struct MatrixBlob {
    pub service_matrix: Vec<f32>,
    pub tool_matrix: Vec<f32>,
}

/// Everything except the matrices, cached next to the blob as JSON. JSON
/// because tool schemas are free-form documents a binary codec cannot
/// round-trip.
#[derive(Debug, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub digest: String,
    pub dim: usize,
    pub services: Vec<ServiceEntry>,
    pub tools: Vec<IndexedTool>,
    pub tool_service: Vec<usize>,
    pub descriptions: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ToolIndex {
    dim: usize,
    digest: String,
    services: Vec<ServiceEntry>,
    /// Row-major M×dim.
    service_matrix: Vec<f32>,
    tools: Vec<IndexedTool>,
    /// Row-major N×dim, rows parallel to `tools`.
    tool_matrix: Vec<f32>,
    /// Service row each tool belongs to.
    tool_service: Vec<usize>,
    descriptions: Vec<String>,
}

impl ToolIndex {
    pub fn empty(dim: usize) -> Self {
        Self {
            dim,
            digest: String::new(),
            services: Vec::new(),
            service_matrix: Vec::new(),
            tools: Vec::new(),
            tool_matrix: Vec::new(),
            tool_service: Vec::new(),
            descriptions: Vec::new(),
        }
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn tool_count(&self) -> usize {
        self.tools.len()
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    /// Split into the two cache artifacts.
    pub fn to_cache_parts(&self) -> (MatrixBlob, IndexMetadata) {
        (
            MatrixBlob {
                service_matrix: self.service_matrix.clone(),
                tool_matrix: self.tool_matrix.clone(),
            },
            IndexMetadata {
                digest: self.digest.clone(),
                dim: self.dim,
                services: self.services.clone(),
                tools: self.tools.clone(),
                tool_service: self.tool_service.clone(),
                descriptions: self.descriptions.clone(),
            },
        )
    }

    /// Reassemble from the cache artifacts, rejecting inconsistent shapes.
    pub fn from_cache_parts(
        meta: IndexMetadata,
        blob: MatrixBlob,
    ) -> Result<Self, CommonError> {
        let services_ok = blob.service_matrix.len() == meta.services.len() * meta.dim;
        let tools_ok = blob.tool_matrix.len() == meta.tools.len() * meta.dim
            && meta.tool_service.len() == meta.tools.len()
            && meta.descriptions.len() == meta.tools.len();
        if !services_ok || !tools_ok {
            return Err(CommonError::Corruption {
                msg: "tool-index cache artifacts disagree on shape".to_string(),
                path: String::new(),
                source: None,
            });
        }
        Ok(Self {
            dim: meta.dim,
            digest: meta.digest,
            services: meta.services,
            service_matrix: blob.service_matrix,
            tools: meta.tools,
            tool_matrix: blob.tool_matrix,
            tool_service: meta.tool_service,
            descriptions: meta.descriptions,
        })
    }

    /// Content digest over everything that feeds the embeddings; used to
    /// decide whether the disk cache is still valid.
    pub fn compute_digest(model_id: &str, dim: usize, services: &[IndexableService]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(model_id.as_bytes());
        hasher.update(dim.to_le_bytes());
        for service in services {
            hasher.update(service.path.as_bytes());
            hasher.update(service.name.as_bytes());
            hasher.update(service.description.as_bytes());
            hasher.update([service.auth_expired as u8]);
            for tag in &service.tags {
                hasher.update(tag.as_bytes());
            }
            for tool in &service.tools {
                hasher.update(tool.name.as_bytes());
                hasher.update(tool.description.as_bytes());
            }
        }
        format!("{:x}", hasher.finalize())
    }

    pub async fn build(
        embedder: &dyn Embedder,
        services: &[IndexableService],
    ) -> Result<Self, CommonError> {
        let dim = embedder.dim();
        let digest = Self::compute_digest(embedder.model_id(), dim, services);

        let service_texts: Vec<String> = services.iter().map(summary_text).collect();

        let mut tools = Vec::new();
        let mut tool_texts = Vec::new();
        let mut tool_service = Vec::new();
        let mut descriptions = Vec::new();
        for (service_idx, service) in services.iter().enumerate() {
            for tool in &service.tools {
                let text = format!(
                    "Service: {}. Tool: {}. Description: {}",
                    service.name, tool.name, tool.description
                );
                tools.push(IndexedTool {
                    service_path: service.path.clone(),
                    service_name: service.name.clone(),
                    tool_name: tool.name.clone(),
                    raw_text: text.clone(),
                    schema: tool.input_schema.clone(),
                    auth_expired: service.auth_expired,
                });
                descriptions.push(tool.description.clone());
                tool_texts.push(text);
                tool_service.push(service_idx);
            }
        }

        let service_matrix = flatten_normalized(embedder.encode(&service_texts).await?, dim)?;
        let tool_matrix = flatten_normalized(embedder.encode(&tool_texts).await?, dim)?;

        Ok(Self {
            dim,
            digest,
            services: services
                .iter()
                .map(|s| ServiceEntry {
                    path: s.path.clone(),
                    name: s.name.clone(),
                    tags: s.tags.clone(),
                })
                .collect(),
            service_matrix,
            tools,
            tool_matrix,
            tool_service,
            descriptions,
        })
    }

    /// Two-stage query over an already-normalized query vector.
    pub fn query(
        &self,
        query_vec: &[f32],
        top_k_services: usize,
        top_n_tools: usize,
        tags: Option<&[String]>,
    ) -> Vec<ToolMatch> {
        if self.services.is_empty() || query_vec.len() != self.dim {
            return Vec::new();
        }

        // Stage one: service summaries, optionally tag-filtered.
        let mut service_scores: Vec<(usize, f32)> = self
            .services
            .iter()
            .enumerate()
            .filter(|(_, entry)| match tags {
                Some(wanted) if !wanted.is_empty() => {
                    entry.tags.iter().any(|t| wanted.contains(t))
                }
                _ => true,
            })
            .map(|(i, _)| (i, dot(&self.service_matrix[i * self.dim..], query_vec)))
            .collect();
        service_scores
            .sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        service_scores.truncate(top_k_services);
        let selected: Vec<usize> = service_scores.iter().map(|(i, _)| *i).collect();

        // Stage two: tools of the surviving services.
        let mut matches: Vec<(f32, usize)> = self
            .tool_service
            .iter()
            .enumerate()
            .filter(|(_, service_idx)| selected.contains(service_idx))
            .map(|(tool_idx, _)| {
                (
                    dot(&self.tool_matrix[tool_idx * self.dim..], query_vec),
                    tool_idx,
                )
            })
            .collect();
        matches.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    let ta = &self.tools[a.1];
                    let tb = &self.tools[b.1];
                    (&ta.service_path, &ta.tool_name).cmp(&(&tb.service_path, &tb.tool_name))
                })
        });
        matches.truncate(top_n_tools);

        matches
            .into_iter()
            .map(|(score, tool_idx)| {
                let tool = &self.tools[tool_idx];
                ToolMatch {
                    tool_name: tool.tool_name.clone(),
                    parsed_description: self.descriptions[tool_idx].clone(),
                    tool_schema: tool.schema.clone(),
                    service_path: tool.service_path.clone(),
                    service_name: tool.service_name.clone(),
                    overall_similarity_score: score,
                    auth_expired: tool.auth_expired,
                }
            })
            .collect()
    }
}

fn summary_text(service: &IndexableService) -> String {
    let tool_digest = service
        .tools
        .iter()
        .map(|t| format!("{}: {}", t.name, t.description))
        .collect::<Vec<_>>()
        .join("; ");
    format!(
        "{} {} {} {}",
        service.name,
        service.description,
        service.tags.join(" "),
        tool_digest
    )
}

fn flatten_normalized(vectors: Vec<Vec<f32>>, dim: usize) -> Result<Vec<f32>, CommonError> {
    let mut flat = Vec::with_capacity(vectors.len() * dim);
    for mut v in vectors {
        if v.len() != dim {
            return Err(CommonError::upstream(format!(
                "embedding has dim {}, index expects {dim}",
                v.len()
            )));
        }
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        flat.extend_from_slice(&v);
    }
    Ok(flat)
}

pub fn normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

fn dot(row: &[f32], query: &[f32]) -> f32 {
    row.iter().take(query.len()).zip(query).map(|(a, b)| a * b).sum()
}
