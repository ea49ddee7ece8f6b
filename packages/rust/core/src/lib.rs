//! Dictionary lifecycle for Lexiforge.
//!
//! Generation ([`craft`], fanned out by [`forge`]), staging and change-feed
//! draining ([`pipeline`]), and the change handlers that review, promote
//! and clean up staged dictionaries ([`trigger`], [`check`], [`promote`],
//! [`cleanup`]).

pub mod check;
pub mod cleanup;
pub mod craft;
pub mod forge;
pub mod pipeline;
pub mod pool;
pub mod promote;
pub mod prompts;
pub mod trigger;

#[cfg(test)]
mod testing;

pub use check::{CheckParams, CheckRequest, Checker};
pub use cleanup::Cleanup;
pub use craft::{CraftParams, CraftRequest, Crafter, Dictionary, MAX_WORDS};
pub use forge::{ForgeOutcome, TaskError, TaskObserver, forge};
pub use pipeline::{
    DrainReport, ProgressReporter, SilentProgress, StageReport, StagingTarget, drain_changes,
    forge_and_stage,
};
pub use pool::WorkerPool;
pub use promote::{PromotionOutcome, Promoter};
pub use prompts::PromptLibrary;
pub use trigger::{ChangeEvent, Dispatcher, needs_promotion};
