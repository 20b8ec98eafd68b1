//! Session controller.
//!
//! A [`Session`] is the explicit context of one user's conversation: the
//! validated credential, the live [`ConversationHandle`] and the
//! [`Transcript`]. The [`SessionController`] implements the three user
//! actions over it and owns nothing per-session itself.
//!
//! # Lifecycle
//!
//! ```text
//! NoCredential ──validate ok──▶ AwaitingDocument ──ingest ok──▶ Ready(h1)
//!      ▲                                                         │  ▲ send
//!      └──────────── validate failed (from any state) ───────────┤  └─┘
//!                                                                 ▼
//!                                                    ingest ok: Ready(h2), transcript cleared
//! ```
//!
//! Sessions are created and destroyed by the [`SessionStore`], which also
//! serialises actions on the same session.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::analytics::{Analytics, Widget};
use crate::backend::ChatBackend;
use crate::config::UploadConfig;
use crate::credential::{validate_credential, CredentialError, ValidCredential};
use crate::models::{ConversationHandle, IndexConfig};
use crate::transcript::Transcript;
use crate::upload::{next_index_name, UploadedDocument};

#[derive(Debug, Error)]
pub enum IngestionError {
    #[error("Please add a valid OpenAI API key before uploading a document.")]
    MissingCredential,
    #[error("Only PDF files are supported.")]
    UnsupportedDocument,
    #[error("File is too large ({size} bytes, limit {limit}).")]
    TooLarge { size: usize, limit: usize },
    #[error("Could not store the uploaded file: {0}")]
    Storage(#[from] std::io::Error),
    #[error("Document processing failed: {0}")]
    ExternalFailure(String),
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Please upload PDF files to continue.")]
    NoActiveHandle,
    #[error("Please add a valid OpenAI API key to continue.")]
    MissingCredential,
    #[error("Message must not be empty.")]
    EmptyMessage,
    #[error("A message is already being answered.")]
    Busy,
    #[error("The assistant could not answer: {0}")]
    ExternalFailure(String),
}

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    NoCredential,
    AwaitingDocument,
    Ready,
}

/// Per-user conversation state.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    created_at: DateTime<Utc>,
    credential: Option<ValidCredential>,
    handle: Option<ConversationHandle>,
    transcript: Transcript,
    /// How many times a credential was actually installed.
    configured: u64,
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            credential: None,
            handle: None,
            transcript: Transcript::new(),
            configured: 0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn phase(&self) -> SessionPhase {
        match (&self.credential, &self.handle) {
            (None, _) => SessionPhase::NoCredential,
            (Some(_), None) => SessionPhase::AwaitingDocument,
            (Some(_), Some(_)) => SessionPhase::Ready,
        }
    }

    pub fn credential(&self) -> Option<&ValidCredential> {
        self.credential.as_ref()
    }

    pub fn handle(&self) -> Option<&ConversationHandle> {
        self.handle.as_ref()
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    /// Number of distinct credential installations so far.
    pub fn configurations(&self) -> u64 {
        self.configured
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Implements credential validation, document ingestion and message
/// exchange over a [`Session`].
#[derive(Clone)]
pub struct SessionController {
    backend: Arc<dyn ChatBackend>,
    uploads: UploadConfig,
    analytics: Arc<Analytics>,
}

impl SessionController {
    pub fn new(backend: Arc<dyn ChatBackend>, uploads: UploadConfig, analytics: Arc<Analytics>) -> Self {
        Self {
            backend,
            uploads,
            analytics,
        }
    }

    pub fn analytics(&self) -> &Arc<Analytics> {
        &self.analytics
    }

    /// Validate `input` and install it as the session's credential.
    ///
    /// On failure the session loses any previously installed credential and
    /// halts until a valid one is supplied. Re-submitting the credential
    /// already installed changes nothing.
    pub fn validate_credential(
        &self,
        session: &mut Session,
        input: Option<&str>,
    ) -> Result<(), CredentialError> {
        self.analytics.record_script_run();
        self.analytics.record_widget(Widget::ApiKey);

        match validate_credential(input) {
            Ok(credential) => {
                if session.credential.as_ref() != Some(&credential) {
                    tracing::info!(session = %session.id, key = %credential.hint(), "credential configured");
                    session.credential = Some(credential);
                    session.configured += 1;
                }
                Ok(())
            }
            Err(e) => {
                if session.credential.take().is_some() {
                    tracing::info!(session = %session.id, "credential cleared");
                }
                Err(e)
            }
        }
    }

    /// Ingest one document and make it the session's conversation.
    ///
    /// On success the previous handle is discarded and the transcript is
    /// cleared. On failure the session is left exactly as it was.
    pub async fn ingest_document(
        &self,
        session: &mut Session,
        upload: UploadedDocument,
    ) -> Result<ConversationHandle, IngestionError> {
        self.analytics.record_script_run();
        self.analytics.record_widget(Widget::PdfUpload);

        let credential = session
            .credential
            .clone()
            .ok_or(IngestionError::MissingCredential)?;

        if upload.len() > self.uploads.max_bytes {
            return Err(IngestionError::TooLarge {
                size: upload.len(),
                limit: self.uploads.max_bytes,
            });
        }
        if !upload.looks_like_pdf() {
            return Err(IngestionError::UnsupportedDocument);
        }

        let index = IndexConfig {
            index_name: next_index_name(),
        };

        // Lives until the end of this function, on every path.
        let scoped = upload.write_scoped(self.uploads.temp_dir.as_deref())?;
        let files = vec![scoped.path().to_path_buf()];

        tracing::info!(
            session = %session.id,
            index = %index.index_name,
            file = upload.file_name(),
            bytes = upload.len(),
            backend = self.backend.name(),
            "ingesting document"
        );

        let mut handle = self
            .backend
            .ingest(&credential, &files, &index)
            .await
            .map_err(|e| {
                tracing::warn!(session = %session.id, error = %e, "ingestion failed");
                IngestionError::ExternalFailure(e.to_string())
            })?;
        handle.document_name = upload.file_name().to_string();

        if let Some(old) = session.handle.replace(handle.clone()) {
            self.backend.discard(&old);
        }
        session.transcript.clear();

        Ok(handle)
    }

    /// Send `text` in the session's conversation and return the reply.
    ///
    /// The user message is pending in the transcript while the backend call
    /// runs; it is committed together with the reply, or dropped if the call
    /// fails.
    pub async fn send_message(&self, session: &mut Session, text: &str) -> Result<String, ChatError> {
        self.analytics.record_script_run();

        let handle = session.handle.clone().ok_or(ChatError::NoActiveHandle)?;
        let credential = session
            .credential
            .clone()
            .ok_or(ChatError::MissingCredential)?;
        if text.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        self.analytics.record_widget(Widget::ChatInput);
        let session_id = session.id;
        // Rolled back on drop, including when this future is cancelled.
        let exchange = session
            .transcript
            .begin_exchange(text)
            .map_err(|_| ChatError::Busy)?;

        match self.backend.send(&credential, &handle, text).await {
            Ok(reply) => {
                exchange.commit(&reply.text);
                Ok(reply.text)
            }
            Err(e) => {
                exchange.rollback();
                tracing::warn!(session = %session_id, index = %handle.index_name, error = %e, "chat call failed");
                Err(ChatError::ExternalFailure(e.to_string()))
            }
        }
    }

    /// Release backend resources held by `session`.
    pub fn close(&self, session: &mut Session) {
        if let Some(handle) = session.handle.take() {
            self.backend.discard(&handle);
        }
        session.credential = None;
        session.transcript.clear();
    }
}

struct Entry {
    session: Arc<Mutex<Session>>,
    last_used: Instant,
}

/// All live sessions of the process, keyed by id.
///
/// Each session sits behind its own async mutex, so actions on one session
/// run one at a time while different sessions proceed independently.
pub struct SessionStore {
    sessions: RwLock<HashMap<Uuid, Entry>>,
    idle_ttl: Duration,
}

impl SessionStore {
    pub fn new(idle_ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            idle_ttl,
        }
    }

    pub async fn create(&self) -> Uuid {
        let session = Session::new();
        let id = session.id();
        self.sessions.write().await.insert(
            id,
            Entry {
                session: Arc::new(Mutex::new(session)),
                last_used: Instant::now(),
            },
        );
        tracing::debug!(session = %id, "session created");
        id
    }

    pub async fn get(&self, id: Uuid) -> Option<Arc<Mutex<Session>>> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions.get_mut(&id)?;
        entry.last_used = Instant::now();
        Some(entry.session.clone())
    }

    pub async fn remove(&self, id: Uuid) -> Option<Arc<Mutex<Session>>> {
        let removed = self.sessions.write().await.remove(&id).map(|e| e.session);
        if removed.is_some() {
            tracing::debug!(session = %id, "session removed");
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Remove sessions idle for longer than the TTL and return them so the
    /// caller can close them.
    pub async fn sweep_idle(&self) -> Vec<Arc<Mutex<Session>>> {
        let ttl = self.idle_ttl;
        let mut sessions = self.sessions.write().await;
        let expired: Vec<Uuid> = sessions
            .iter()
            .filter(|(_, e)| e.last_used.elapsed() > ttl)
            .map(|(id, _)| *id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| sessions.remove(&id).map(|e| e.session))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChatReply;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    const KEY: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ012345";
    const PDF: &[u8] = b"%PDF-1.4\nfake body\n%%EOF\n";

    /// Records every call; fails on demand.
    #[derive(Default)]
    struct FakeBackend {
        ingests: AtomicUsize,
        sends: AtomicUsize,
        fail_ingest: AtomicBool,
        fail_send: AtomicBool,
        hang_send: AtomicBool,
        seen_paths: StdMutex<Vec<PathBuf>>,
        sent_to: StdMutex<Vec<String>>,
        discarded: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl ChatBackend for FakeBackend {
        fn name(&self) -> &str {
            "fake"
        }

        async fn ingest(
            &self,
            _credential: &ValidCredential,
            files: &[PathBuf],
            index: &IndexConfig,
        ) -> Result<ConversationHandle> {
            self.ingests.fetch_add(1, Ordering::SeqCst);
            assert_eq!(files.len(), 1);
            assert!(files[0].exists(), "temp file must exist during ingestion");
            self.seen_paths.lock().unwrap().push(files[0].clone());
            if self.fail_ingest.load(Ordering::SeqCst) {
                anyhow::bail!("quota exceeded");
            }
            Ok(ConversationHandle {
                index_name: index.index_name.clone(),
                document_name: String::new(),
                document_sha256: String::new(),
                chunk_count: 1,
                created_at: Utc::now(),
            })
        }

        async fn send(
            &self,
            _credential: &ValidCredential,
            handle: &ConversationHandle,
            message: &str,
        ) -> Result<ChatReply> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            self.sent_to.lock().unwrap().push(handle.index_name.clone());
            if self.hang_send.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.fail_send.load(Ordering::SeqCst) {
                anyhow::bail!("connection reset");
            }
            Ok(ChatReply {
                text: format!("answer to: {}", message),
            })
        }

        fn discard(&self, handle: &ConversationHandle) {
            self.discarded.lock().unwrap().push(handle.index_name.clone());
        }
    }

    fn controller() -> (SessionController, Arc<FakeBackend>) {
        let backend = Arc::new(FakeBackend::default());
        let ctl = SessionController::new(
            backend.clone(),
            UploadConfig::default(),
            Arc::new(Analytics::fresh()),
        );
        (ctl, backend)
    }

    fn pdf(name: &str) -> UploadedDocument {
        UploadedDocument::new(name, PDF.to_vec())
    }

    #[test]
    fn test_phases_follow_credential_and_handle() {
        let (ctl, _) = controller();
        let mut s = Session::new();
        assert_eq!(s.phase(), SessionPhase::NoCredential);
        ctl.validate_credential(&mut s, Some(KEY)).unwrap();
        assert_eq!(s.phase(), SessionPhase::AwaitingDocument);
    }

    #[test]
    fn test_credential_validation_is_idempotent() {
        let (ctl, _) = controller();
        let mut s = Session::new();
        ctl.validate_credential(&mut s, Some(KEY)).unwrap();
        ctl.validate_credential(&mut s, Some(KEY)).unwrap();
        assert_eq!(s.configurations(), 1);
        assert_eq!(s.credential().unwrap().expose(), KEY);
    }

    #[test]
    fn test_invalid_credential_halts_session() {
        let (ctl, _) = controller();
        let mut s = Session::new();
        ctl.validate_credential(&mut s, Some(KEY)).unwrap();
        assert_eq!(
            ctl.validate_credential(&mut s, Some("short")),
            Err(CredentialError::MalformedFormat)
        );
        assert_eq!(s.phase(), SessionPhase::NoCredential);
        assert_eq!(
            ctl.validate_credential(&mut s, Some("")),
            Err(CredentialError::Empty)
        );
    }

    #[tokio::test]
    async fn test_ingest_requires_credential() {
        let (ctl, backend) = controller();
        let mut s = Session::new();
        let err = ctl.ingest_document(&mut s, pdf("doc.pdf")).await.unwrap_err();
        assert!(matches!(err, IngestionError::MissingCredential));
        assert_eq!(backend.ingests.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_ingest_rejects_non_pdf_and_oversized() {
        let backend = Arc::new(FakeBackend::default());
        let ctl = SessionController::new(
            backend.clone(),
            UploadConfig {
                max_bytes: 10,
                temp_dir: None,
            },
            Arc::new(Analytics::fresh()),
        );
        let mut s = Session::new();
        ctl.validate_credential(&mut s, Some(KEY)).unwrap();

        let err = ctl
            .ingest_document(&mut s, UploadedDocument::new("notes.txt", b"hi".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestionError::UnsupportedDocument));

        let err = ctl.ingest_document(&mut s, pdf("doc.pdf")).await.unwrap_err();
        assert!(matches!(err, IngestionError::TooLarge { limit: 10, .. }));
        assert_eq!(backend.ingests.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_send_without_handle_never_calls_backend() {
        let (ctl, backend) = controller();
        let mut s = Session::new();
        let err = ctl.send_message(&mut s, "hello").await.unwrap_err();
        assert!(matches!(err, ChatError::NoActiveHandle));

        ctl.validate_credential(&mut s, Some(KEY)).unwrap();
        let err = ctl.send_message(&mut s, "hello").await.unwrap_err();
        assert!(matches!(err, ChatError::NoActiveHandle));
        assert_eq!(backend.sends.load(Ordering::SeqCst), 0);
        assert!(s.transcript().is_empty());
    }

    #[tokio::test]
    async fn test_end_to_end_scenario() {
        let (ctl, backend) = controller();
        let mut s = Session::new();
        ctl.validate_credential(&mut s, Some(KEY)).unwrap();

        let h1 = ctl.ingest_document(&mut s, pdf("doc.pdf")).await.unwrap();
        assert_eq!(h1.document_name, "doc.pdf");
        assert_eq!(s.phase(), SessionPhase::Ready);
        assert!(s.transcript().is_empty());

        let reply = ctl.send_message(&mut s, "Summarize page 1").await.unwrap();
        assert_eq!(reply, "answer to: Summarize page 1");
        let msgs = s.transcript().messages();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].content, "Summarize page 1");
        assert_eq!(msgs[1].content, reply);

        let h2 = ctl.ingest_document(&mut s, pdf("doc2.pdf")).await.unwrap();
        assert_ne!(h1.index_name, h2.index_name);
        assert!(s.transcript().is_empty());
        assert_eq!(s.handle(), Some(&h2));
        assert_eq!(*backend.discarded.lock().unwrap(), vec![h1.index_name.clone()]);

        ctl.send_message(&mut s, "And now?").await.unwrap();
        assert_eq!(
            *backend.sent_to.lock().unwrap(),
            vec![h1.index_name.clone(), h2.index_name.clone()]
        );
    }

    #[tokio::test]
    async fn test_temp_file_is_removed_after_ingestion() {
        let (ctl, backend) = controller();
        let mut s = Session::new();
        ctl.validate_credential(&mut s, Some(KEY)).unwrap();
        ctl.ingest_document(&mut s, pdf("doc.pdf")).await.unwrap();

        backend.fail_ingest.store(true, Ordering::SeqCst);
        ctl.ingest_document(&mut s, pdf("doc.pdf")).await.unwrap_err();

        let paths = backend.seen_paths.lock().unwrap();
        assert_eq!(paths.len(), 2);
        assert!(paths.iter().all(|p| !p.exists()));
    }

    #[tokio::test]
    async fn test_failed_ingestion_keeps_session_intact() {
        let (ctl, backend) = controller();
        let mut s = Session::new();
        ctl.validate_credential(&mut s, Some(KEY)).unwrap();
        let h1 = ctl.ingest_document(&mut s, pdf("doc.pdf")).await.unwrap();
        ctl.send_message(&mut s, "q").await.unwrap();

        backend.fail_ingest.store(true, Ordering::SeqCst);
        let err = ctl.ingest_document(&mut s, pdf("doc2.pdf")).await.unwrap_err();
        assert!(matches!(err, IngestionError::ExternalFailure(ref m) if m.contains("quota")));
        assert_eq!(s.handle(), Some(&h1));
        assert_eq!(s.transcript().len(), 2);
        assert!(backend.discarded.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_send_rolls_back_pending_message() {
        let (ctl, backend) = controller();
        let mut s = Session::new();
        ctl.validate_credential(&mut s, Some(KEY)).unwrap();
        ctl.ingest_document(&mut s, pdf("doc.pdf")).await.unwrap();
        ctl.send_message(&mut s, "first").await.unwrap();

        backend.fail_send.store(true, Ordering::SeqCst);
        let err = ctl.send_message(&mut s, "second").await.unwrap_err();
        assert!(matches!(err, ChatError::ExternalFailure(_)));
        assert_eq!(s.transcript().len(), 2);
        assert!(s.transcript().pending().is_none());

        // Manual retry succeeds once the backend recovers.
        backend.fail_send.store(false, Ordering::SeqCst);
        ctl.send_message(&mut s, "second").await.unwrap();
        assert_eq!(s.transcript().len(), 4);
    }

    #[tokio::test]
    async fn test_cancelled_send_does_not_wedge_session() {
        let (ctl, backend) = controller();
        let mut s = Session::new();
        ctl.validate_credential(&mut s, Some(KEY)).unwrap();
        ctl.ingest_document(&mut s, pdf("doc.pdf")).await.unwrap();

        backend.hang_send.store(true, Ordering::SeqCst);
        let outcome = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            ctl.send_message(&mut s, "first"),
        )
        .await;
        assert!(outcome.is_err(), "send should still be hanging");
        assert!(s.transcript().pending().is_none());
        assert!(s.transcript().is_empty());

        backend.hang_send.store(false, Ordering::SeqCst);
        let reply = ctl.send_message(&mut s, "second").await.unwrap();
        assert_eq!(reply, "answer to: second");
        assert_eq!(s.transcript().len(), 2);
        assert_eq!(s.transcript().messages()[0].content, "second");
    }

    #[tokio::test]
    async fn test_blank_message_is_rejected() {
        let (ctl, backend) = controller();
        let mut s = Session::new();
        ctl.validate_credential(&mut s, Some(KEY)).unwrap();
        ctl.ingest_document(&mut s, pdf("doc.pdf")).await.unwrap();
        let err = ctl.send_message(&mut s, "   ").await.unwrap_err();
        assert!(matches!(err, ChatError::EmptyMessage));
        assert_eq!(backend.sends.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cleared_credential_blocks_send() {
        let (ctl, backend) = controller();
        let mut s = Session::new();
        ctl.validate_credential(&mut s, Some(KEY)).unwrap();
        ctl.ingest_document(&mut s, pdf("doc.pdf")).await.unwrap();
        ctl.validate_credential(&mut s, Some("bad")).unwrap_err();
        let err = ctl.send_message(&mut s, "hello").await.unwrap_err();
        assert!(matches!(err, ChatError::MissingCredential));
        assert_eq!(backend.sends.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_actions_are_counted_in_analytics() {
        let (ctl, _) = controller();
        let mut s = Session::new();
        ctl.validate_credential(&mut s, Some(KEY)).unwrap();
        ctl.ingest_document(&mut s, pdf("doc.pdf")).await.unwrap();
        ctl.send_message(&mut s, "q").await.unwrap();
        let snap = ctl.analytics().snapshot();
        assert_eq!(snap.total_script_runs, 3);
        assert_eq!(snap.widgets["api_key"], 1);
        assert_eq!(snap.widgets["pdf_upload"], 1);
        assert_eq!(snap.widgets["chat_input"], 1);
    }

    #[tokio::test]
    async fn test_close_discards_handle() {
        let (ctl, backend) = controller();
        let mut s = Session::new();
        ctl.validate_credential(&mut s, Some(KEY)).unwrap();
        let h = ctl.ingest_document(&mut s, pdf("doc.pdf")).await.unwrap();
        ctl.close(&mut s);
        assert_eq!(s.phase(), SessionPhase::NoCredential);
        assert_eq!(*backend.discarded.lock().unwrap(), vec![h.index_name]);
    }

    #[tokio::test]
    async fn test_store_creates_gets_and_removes() {
        let store = SessionStore::new(Duration::from_secs(60));
        let id = store.create().await;
        assert_eq!(store.len().await, 1);
        let session = store.get(id).await.unwrap();
        assert_eq!(session.lock().await.id(), id);
        assert!(store.get(Uuid::new_v4()).await.is_none());
        assert!(store.remove(id).await.is_some());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_sweep_removes_idle_sessions() {
        let store = SessionStore::new(Duration::ZERO);
        store.create().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let expired = store.sweep_idle().await;
        assert_eq!(expired.len(), 1);
        assert!(store.is_empty().await);
    }
}
