//! Client-side dispatcher for fleets of ComfyUI image-generation
//! backends.
//!
//! Provides a per-backend connection manager (HTTP + WebSocket with
//! liveness watchdog, reconnect ladder, and polling fallback), a
//! weighted multi-backend job pool with failover, a prompt-call
//! lifecycle driver, and a workflow template builder.
//!
//! Typical flow: build a [`template::PromptTemplate`], hand a job to
//! [`pool::ComfyUIPool::run`], and drive the chosen client with a
//! [`call::PromptCall`].

pub mod api;
pub mod auth;
pub mod call;
pub mod client;
pub mod events;
pub mod messages;
pub mod pool;
pub mod reconnect;
pub mod template;
