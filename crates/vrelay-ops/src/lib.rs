//! End-to-end orchestration of the voucher relay: requester, relayer, attester
//! and keeper flows over any set of [`vrelay_chain::ChainClient`]s.
//!
//! Every flow suspends only in [`Orchestrator::wait_for_event`] or
//! [`Orchestrator::wait_for_block`], both bounded by a timeout and a
//! cancellation token.

pub mod attester;
pub mod config;
pub mod keeper;
pub mod logging;
pub mod orchestrator;
pub mod relayer;
pub mod user;

pub use attester::{AttesterAgent, Attested};
pub use config::{ChainEndpoint, OrchestratorConfig, RelayerPolicyConfig, RetryPolicy};
pub use keeper::Keeper;
pub use orchestrator::{with_retry, OperationType, Orchestrator, WaitOutcome};
pub use relayer::{IssuedVoucher, NextAction, OpenRequest, RelayOutcome, RelayerAgent};
pub use user::{CreatedRequest, UserAgent};
