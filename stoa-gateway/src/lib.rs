#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Stoa marketplace gateway.
//!
//! Lets autonomous callers discover machine-callable services, pay for a
//! single invocation over an HTTP-402 challenge/verify/settle exchange
//! with an external facilitator, and have the call forwarded to the
//! provider's endpoint — with every attempt recorded for billing and
//! ranking.
//!
//! # Pipeline
//!
//! ```text
//! request → rate limiter → (search: query ranker)
//!                        → (call: payment gate → dispatcher → metrics recorder)
//! ```
//!
//! External collaborators are consumed through narrow traits so the
//! pipeline itself stays testable in-process:
//!
//! - [`catalog::CatalogStore`] — persist/read Service, CallLog, Caller rows
//! - [`embeddings::Embedder`] — text → fixed-length vector
//! - [`payment::Facilitator`] — verify and settle payment assertions
//!
//! # Modules
//!
//! - [`auth`] — API-key → caller identity resolution
//! - [`catalog`] — data model and storage port
//! - [`config`] — TOML + environment configuration
//! - [`dispatch`] — provider endpoint dispatcher
//! - [`embeddings`] — text-to-vector client
//! - [`error`] — gateway error taxonomy
//! - [`http`] — axum routes and shared state
//! - [`metrics`] — call log recorder and read paths
//! - [`payment`] — 402 payment protocol engine
//! - [`ratelimit`] — fixed-window rate limiting
//! - [`search`] — semantic query ranker

pub mod auth;
pub mod catalog;
pub mod config;
pub mod dispatch;
pub mod embeddings;
pub mod error;
pub mod http;
pub mod metrics;
pub mod payment;
pub mod ratelimit;
pub mod search;
