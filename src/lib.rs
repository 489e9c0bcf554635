//! # mcp-code-api
//!
//! A long-running MCP server that brokers code generation across multiple
//! LLM providers behind one `write` tool. A request names a file and a
//! prompt; the broker picks a provider from the configured preference
//! order, rotates API keys with exponential-backoff failover, calls the
//! provider's HTTP API, validates the produced source, writes it to disk
//! with a recoverable in-memory backup, and answers with a diff.
//!
//! ## Request path
//!
//! ```text
//! stdio JSON-RPC ─▶ server ─▶ write_tool ─▶ router ─▶ keypool ─▶ providers::* ─▶ HTTPS
//!                                              │                      │
//!                                           metrics             oauth (Gemini)
//! ```
//!
//! ## Modules
//! - `server`: line-delimited JSON-RPC 2.0 shell over stdio
//! - `write_tool`: argument handling, backup, diff/terse responses
//! - `router`: provider fallback and validation-feedback retries
//! - `keypool`: per-provider credential rotation and backoff
//! - `providers`: the four adapters (Anthropic, Cerebras, OpenRouter, Gemini)
//! - `oauth`: PKCE flow, token refresh, encrypted token storage
//! - `validate`: per-language syntax checks feeding retry prompts
//! - `metrics`: per-provider/per-model latency and token tracking

pub mod backup;
pub mod config;
pub mod diff;
pub mod error;
pub mod keypool;
pub mod language;
pub mod metrics;
pub mod oauth;
pub mod providers;
pub mod router;
pub mod server;
pub mod validate;
pub mod write_tool;
