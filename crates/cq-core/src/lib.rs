//! Commit queue core library
//!
//! The pending-change verification engine: discovers changes from a review
//! service, runs registered verifiers against them, aggregates the outcomes
//! and commits, reports or drops each change.

pub mod context;
pub mod domain;
pub mod error;
pub mod fakes;
pub mod manager;
pub mod metrics;
pub mod obs;
pub mod pool;
pub mod signals;
pub mod telemetry;
pub mod verification;

pub use context::{
    Checkout, CheckoutError, CheckoutResult, Context, NullStatusSink, ReviewClient, ReviewError,
    ReviewResult, StatusPayload, StatusSink, TryJobResult,
};

pub use domain::{
    ChangeInfo, PendingChange, ReviewMessage, SettledChange, SettledOutcome, SimpleStatus,
    StatusView, TrackedTryJob, TreeStatus, TryJobState, TryJobsStatus, VerificationState,
    Verified, VerifierStatus,
};

pub use error::{EngineError, EngineResult};

pub use manager::{
    ManagerConfig, PendingManager, QueueSnapshot, RoundSummary, MANAGER_STATUS_NAME,
    PATCH_APPLY_FAILED, PATCH_FETCH_FAILED,
};

pub use obs::{
    emit_change_committed, emit_change_discarded, emit_change_failed, emit_round_finished,
    emit_round_started, emit_shutdown_requested, round_span,
};

pub use pool::{PoolError, TaskPool};

pub use signals::ShutdownCoordinator;

pub use telemetry::init_tracing;

pub use verification::{
    pending_loop, CheckoutVerifier, DiscardPending, Verifier, VerifierRegistry, VerifyError,
    VerifyResult,
};
