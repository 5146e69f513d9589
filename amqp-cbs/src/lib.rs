#![deny(missing_debug_implementations)]
#![warn(missing_docs)]

//! An implementation of the AMQP 1.0 claims-based security (CBS) protocol
//!
//! Tokens are put to the `$cbs` node with the `put-token` management operation and
//! removed with `delete-token`. A non-success status aborts authentication, and
//! nodes protected by CBS should not be used until a put-token succeeds.

pub mod client;
pub mod constants;
pub mod error;
mod put_token;
pub mod token;

pub use client::{CbsOpenResult, CbsOperationResult, CbsOptions, ClaimsBasedSecurity};
pub use error::Error;
pub use token::{CbsToken, CbsTokenType};

/// A source of CBS tokens
///
/// [`CbsTokenProvider`] is the `Send` variant used by
/// [`ClaimsBasedSecurity::authorize`].
#[allow(async_fn_in_trait)]
#[trait_variant::make(CbsTokenProvider: Send)]
pub trait LocalCbsTokenProvider {
    /// The associated error type
    type Error: std::error::Error + Send + Sync + 'static;

    /// Get a token for `audience`
    async fn get_token(&self, audience: &str) -> Result<CbsToken<'static>, Self::Error>;
}
