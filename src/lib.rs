//! # Chat Agent
//!
//! Upload a PDF, index it, and chat with it through a hosted
//! chat-completion API.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌───────────────────┐   ┌─────────────────────┐
//! │ Web page /   │──▶│ SessionController │──▶│ ChatBackend         │
//! │ terminal     │   │ Session context   │   │ (OpenAI: extract,   │
//! └──────────────┘   └─────────┬─────────┘   │  chunk, embed, chat)│
//!                              │             └─────────────────────┘
//!                              ▼
//!                        ┌───────────┐
//!                        │ Analytics │
//!                        └───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! export ANALYTICS_PASSWORD=change-me
//! chat-agent serve                 # open http://127.0.0.1:8501
//! chat-agent chat ./paper.pdf      # same conversation in the terminal
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`credential`] | API key shape validation |
//! | [`session`] | Session context, controller and store |
//! | [`transcript`] | Two-phase conversation history |
//! | [`upload`] | Uploaded documents, scoped temp files, index names |
//! | [`backend`] | External document-chat service trait + OpenAI implementation |
//! | [`extract`] | PDF text extraction |
//! | [`chunk`] | Text chunking |
//! | [`embedding`] | Embedding calls and vector math |
//! | [`index`] | In-memory vector index |
//! | [`completion`] | Prompt assembly and chat completion |
//! | [`openai`] | HTTP client for OpenAI-compatible endpoints |
//! | [`analytics`] | Usage tracking with persisted snapshots |
//! | [`server`] | HTTP server |

pub mod analytics;
pub mod backend;
pub mod chunk;
pub mod completion;
pub mod config;
pub mod credential;
pub mod embedding;
pub mod extract;
pub mod index;
pub mod models;
pub mod openai;
pub mod server;
pub mod session;
pub mod transcript;
pub mod upload;
