#![deny(unsafe_code)]

//! Turn pipeline for a streaming chat client.
//!
//! [`SendOrchestrator`] owns a conversation's turn from the moment the user hits send:
//! it persists the message, builds the provider request through [`RequestAssembler`],
//! and streams the reply back into storage.

/// Builds provider requests from stored history under an image budget.
pub mod assembler;
pub mod hooks;
/// Shared, de-duplicating resolution of attachment references.
pub mod hydration;
pub mod media;
pub mod orchestrator;
/// Per-turn state machine and buffers.
pub mod session;
/// Settings persistence.
pub mod settings;

pub use assembler::{
    AssembledRequest, AssemblyError, AssemblyOptions, ImageCandidate, ImageInclusionPolicy,
    RequestAssembler,
};
pub use hooks::{ChatHooks, NoopHooks};
pub use hydration::{
    Hydrated, HydrationCache, HydrationError, HydrationOptions, Hydrator, ResolvedData,
};
pub use orchestrator::{
    ErrorPartialPolicy, OrchestratorConfig, SendError, SendOrchestrator, SendRequest,
    SendResult, TurnOutcome,
};
pub use session::{SendSession, SendState};
pub use settings::{ChatSettings, SettingsError, SettingsStore};
