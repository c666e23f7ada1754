#![deny(missing_docs)]

//! Core library for the document pipeline workers.

/// Message broker traits plus RabbitMQ and in-memory implementations.
pub mod broker;
/// Environment-driven configuration management.
pub mod config;
/// Document metadata API client.
pub mod documents;
/// Structured logging and tracing setup.
pub mod logging;
/// Versioned message contracts exchanged between stages.
pub mod messages;
/// Per-stage delivery counters.
pub mod metrics;
/// External OCR tooling.
pub mod ocr;
/// Generic stage runner and supervisor.
pub mod pipeline;
/// Search index integration.
pub mod search;
/// Concrete pipeline stages.
pub mod stages;
/// Object storage for uploaded documents.
pub mod storage;
/// Summarization provider clients.
pub mod summarization;
