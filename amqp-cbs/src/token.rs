//! Defines CbsToken struct

use std::borrow::Cow;

use serde_amqp::primitives::Timestamp;

/// Type of a CBS token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CbsTokenType {
    /// JSON web token
    #[default]
    Jwt,

    /// Shared access signature token
    SasToken,
}

impl CbsTokenType {
    /// The value of the `type` application property
    pub fn as_str(&self) -> &'static str {
        match self {
            CbsTokenType::Jwt => "jwt",
            CbsTokenType::SasToken => "servicebus.windows.net:sastoken",
        }
    }
}

/// A CBS token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CbsToken<'a> {
    pub(crate) token_value: Cow<'a, str>,
    pub(crate) token_type: CbsTokenType,
    pub(crate) expires_at_utc: Option<Timestamp>,
}

impl<'a> CbsToken<'a> {
    /// Create a new CBS token
    pub fn new(
        token_value: impl Into<Cow<'a, str>>,
        token_type: CbsTokenType,
        expires_at_utc: impl Into<Option<Timestamp>>,
    ) -> Self {
        Self {
            token_value: token_value.into(),
            token_type,
            expires_at_utc: expires_at_utc.into(),
        }
    }

    /// Get the token value
    pub fn token_value(&self) -> &str {
        &self.token_value
    }

    /// Get the token type
    pub fn token_type(&self) -> CbsTokenType {
        self.token_type
    }

    /// Get the expiration time
    pub fn expires_at_utc(&self) -> Option<&Timestamp> {
        self.expires_at_utc.as_ref()
    }
}
