//! Embeddings through the OpenAI `POST /embeddings` endpoint, plus the
//! vector math used by the in-memory index.

use anyhow::Result;

use crate::config::EmbeddingConfig;
use crate::credential::ValidCredential;
use crate::openai::OpenAIClient;

/// Embed `texts` in batches of `config.batch_size`, preserving input order.
pub async fn embed_texts(
    client: &OpenAIClient,
    credential: &ValidCredential,
    config: &EmbeddingConfig,
    texts: &[String],
) -> Result<Vec<Vec<f32>>> {
    let mut out = Vec::with_capacity(texts.len());

    for batch in texts.chunks(config.batch_size.max(1)) {
        let body = serde_json::json!({
            "model": config.model,
            "input": batch,
        });
        let json = client.post_json(credential, "embeddings", &body).await?;
        let vectors = parse_embeddings_response(&json)?;
        if vectors.len() != batch.len() {
            anyhow::bail!(
                "Invalid embeddings response: expected {} vectors, got {}",
                batch.len(),
                vectors.len()
            );
        }
        out.extend(vectors);
    }

    Ok(out)
}

/// Embed a single query text.
pub async fn embed_query(
    client: &OpenAIClient,
    credential: &ValidCredential,
    config: &EmbeddingConfig,
    text: &str,
) -> Result<Vec<f32>> {
    embed_texts(client, credential, config, &[text.to_string()])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))
}

/// Parse `data[].embedding`, ordered by each item's `index` when present.
fn parse_embeddings_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid embeddings response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());

    for (pos, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid embeddings response: missing embedding"))?;

        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();

        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        indexed.push((index, vec));
    }

    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

/// Cosine similarity in `[-1.0, 1.0]`; `0.0` for empty or mismatched vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
