//! Route handlers for the accgate proxy
//!
//! Provider-compatible routes:
//! - POST /v1/messages - Anthropic Messages shape
//! - POST /v1/chat/completions - OpenAI Chat Completions shape
//!
//! Control-plane routes (issued-key auth required):
//! - /v1/keys - issued API key management
//! - /v1/budgets - budget administration and status
//! - /v1/routing - routing rules, simulation, fallbacks, cheapest query
//! - /v1/pricing - catalog reads and price overrides
//! - /v1/security - detectors, quarantine, kills, policies, indicators
//! - /v1/logs - recent journal records

pub mod budgets;
pub mod chat;
pub mod health;
pub mod keys;
pub mod logs;
pub mod pricing;
pub mod routing;
pub mod security;
