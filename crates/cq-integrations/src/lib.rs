//! cq-integrations: production collaborators for the commit queue
//!
//! ## Key Components
//!
//! - `HttpReviewClient`: Rietveld-style JSON review service client with
//!   retry and exponential backoff on transient failures
//! - `GitCheckout`: working copy driven through the `git` CLI
//! - `ReadOnlyCheckout`, `ReadOnlyReviewClient`: dry-run wrappers that never
//!   commit, comment or close issues
//! - `HttpStatusSink`: fire-and-forget status push over HTTP

pub mod error;
pub mod git;
pub mod readonly;
pub mod retry;
pub mod review;
pub mod status;

pub use error::IntegrationError;
pub use git::{GitCheckout, GitCheckoutConfig};
pub use readonly::{ReadOnlyCheckout, ReadOnlyReviewClient};
pub use retry::{retry_if, with_retry, RetryPolicy};
pub use review::{HttpReviewClient, ReviewClientConfig};
pub use status::HttpStatusSink;
