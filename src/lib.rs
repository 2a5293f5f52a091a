//! Brigade: a multi-tenant platform for operating LLM-backed fiches.
//!
//! Users create fiches (configured agents), engage them through threads,
//! and receive results interactively over SSE or via background courses
//! driven by cron schedules, webhooks, and workflow graphs. A long-lived
//! concierge delegates bounded work to short-lived commis workers over a
//! durable queue, pausing on a barrier and resuming through continuation
//! courses. Remote runners attach over a WebSocket control plane.

pub mod api;
pub mod checkpoint;
pub mod commis;
pub mod concierge;
pub mod config;
pub mod context;
pub mod credentials;
pub mod db;
pub mod error;
pub mod events;
pub mod fiche;
pub mod jobs;
pub mod llm;
pub mod models;
pub mod queue;
pub mod startup;
pub mod tools;
pub mod transport;
pub mod workflow;
