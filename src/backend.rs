//! The external document-chat service, as seen by the session controller.
//!
//! [`ChatBackend`] is the seam between session bookkeeping and the provider
//! pipeline. The controller only ever talks to the trait; [`OpenAIBackend`]
//! is the production implementation and tests substitute their own.
//!
//! # Pipeline
//!
//! ```text
//! ingest:  PDF ──extract──▶ text ──chunk──▶ chunks ──embed──▶ VectorIndex
//! send:    question ──embed──▶ top_k(VectorIndex) ──▶ chat/completions ──▶ reply
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use crate::chunk::chunk_text;
use crate::completion::{build_messages, complete};
use crate::config::Config;
use crate::credential::ValidCredential;
use crate::embedding::{embed_query, embed_texts};
use crate::extract::extract_pdf_text;
use crate::index::VectorIndex;
use crate::models::{ChatReply, ConversationHandle, IndexConfig, Message};
use crate::openai::OpenAIClient;

/// Document ingestion plus conversation over the resulting index.
///
/// Implementations must be `Send + Sync`: one backend instance serves every
/// session of the process.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &str;

    /// Turn `files` into a queryable index named `index.index_name`.
    async fn ingest(
        &self,
        credential: &ValidCredential,
        files: &[PathBuf],
        index: &IndexConfig,
    ) -> Result<ConversationHandle>;

    /// Ask a question in the conversation bound to `handle`.
    async fn send(
        &self,
        credential: &ValidCredential,
        handle: &ConversationHandle,
        message: &str,
    ) -> Result<ChatReply>;

    /// Release whatever the backend keeps for `handle`. Called when a
    /// session replaces or drops its handle.
    fn discard(&self, _handle: &ConversationHandle) {}
}

/// One live conversation: the document index and the chat memory.
struct Conversation {
    index: VectorIndex,
    memory: Mutex<Vec<Message>>,
}

/// [`ChatBackend`] over an OpenAI-compatible API.
pub struct OpenAIBackend {
    client: OpenAIClient,
    config: Arc<Config>,
    conversations: RwLock<HashMap<String, Arc<Conversation>>>,
}

impl OpenAIBackend {
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let client = OpenAIClient::new(&config.openai)?;
        Ok(Self {
            client,
            config,
            conversations: RwLock::new(HashMap::new()),
        })
    }

    /// Number of live conversations.
    pub fn live_conversations(&self) -> usize {
        self.conversations.read().map(|c| c.len()).unwrap_or(0)
    }

    /// Chunk and embed already-extracted text into a new conversation named
    /// `index.index_name`. Returns the chunk count.
    pub async fn index_text(
        &self,
        credential: &ValidCredential,
        index: &IndexConfig,
        text: &str,
    ) -> Result<usize> {
        let chunks = chunk_text(text, self.config.chunking.max_tokens);
        let inputs: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = embed_texts(&self.client, credential, &self.config.embedding, &inputs).await?;
        let vector_index = VectorIndex::build(&index.index_name, chunks, vectors)?;
        if vector_index.is_empty() {
            anyhow::bail!("document contains no extractable text");
        }
        let chunk_count = vector_index.len();

        tracing::info!(
            index = %vector_index.name(),
            chunks = chunk_count,
            key = %credential.hint(),
            "document indexed"
        );

        self.conversations
            .write()
            .map_err(|_| anyhow::anyhow!("conversation table poisoned"))?
            .insert(
                index.index_name.clone(),
                Arc::new(Conversation {
                    index: vector_index,
                    memory: Mutex::new(Vec::new()),
                }),
            );

        Ok(chunk_count)
    }

    fn conversation(&self, index_name: &str) -> Result<Arc<Conversation>> {
        let map = self
            .conversations
            .read()
            .map_err(|_| anyhow::anyhow!("conversation table poisoned"))?;
        map.get(index_name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("conversation not found: {}", index_name))
    }
}

#[async_trait]
impl ChatBackend for OpenAIBackend {
    fn name(&self) -> &str {
        "openai"
    }

    async fn ingest(
        &self,
        credential: &ValidCredential,
        files: &[PathBuf],
        index: &IndexConfig,
    ) -> Result<ConversationHandle> {
        if files.is_empty() {
            anyhow::bail!("no input files");
        }

        let paths = files.to_vec();
        let (text, sha256) = tokio::task::spawn_blocking(move || -> Result<(String, String)> {
            let mut hasher = Sha256::new();
            let mut texts = Vec::with_capacity(paths.len());
            for path in &paths {
                let bytes = std::fs::read(path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                hasher.update(&bytes);
                texts.push(extract_pdf_text(&bytes)?);
            }
            Ok((texts.join("\n\n"), hex::encode(hasher.finalize())))
        })
        .await??;

        let chunk_count = self.index_text(credential, index, &text).await?;

        let document_name = files[0]
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(ConversationHandle {
            index_name: index.index_name.clone(),
            document_name,
            document_sha256: sha256,
            chunk_count,
            created_at: Utc::now(),
        })
    }

    async fn send(
        &self,
        credential: &ValidCredential,
        handle: &ConversationHandle,
        message: &str,
    ) -> Result<ChatReply> {
        let conversation = self.conversation(&handle.index_name)?;
        let chat = &self.config.chat;

        let query = embed_query(&self.client, credential, &self.config.embedding, message).await?;
        let hits = conversation.index.top_k(&query, chat.top_k);

        let history = conversation
            .memory
            .lock()
            .map_err(|_| anyhow::anyhow!("conversation memory poisoned"))?
            .clone();
        let prompt = build_messages(chat, &hits, &history, message);

        let text = complete(&self.client, credential, chat, &prompt).await?;

        let mut memory = conversation
            .memory
            .lock()
            .map_err(|_| anyhow::anyhow!("conversation memory poisoned"))?;
        memory.push(Message::user(message));
        memory.push(Message::assistant(&text));

        Ok(ChatReply { text })
    }

    fn discard(&self, handle: &ConversationHandle) {
        if let Ok(mut map) = self.conversations.write() {
            if map.remove(&handle.index_name).is_some() {
                tracing::debug!(index = %handle.index_name, "conversation discarded");
            }
        }
    }
}
