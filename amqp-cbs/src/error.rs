//! Error types of the CBS client

/// Errors of [`crate::ClaimsBasedSecurity`]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The underlying management client failed
    #[error(transparent)]
    Management(#[from] amqp_management::Error),

    /// The token provider failed to produce a token
    #[error("Token provider error: {0}")]
    TokenProvider(Box<dyn std::error::Error + Send + Sync + 'static>),
}
