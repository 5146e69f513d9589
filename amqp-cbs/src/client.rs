//! CBS client

use std::sync::Arc;

use amqp_engine::{Context, Session};
use amqp_management::{
    ManagementClient, ManagementClientEvents, ManagementClientOptions, ManagementOpenStatus,
    ManagementOperationStatus, ManagementResult, ManagementState,
};
use parking_lot::Mutex;
use serde_amqp::primitives::Timestamp;

use crate::{
    constants::{CBS_NODE_ADDR, DELETE_TOKEN, PUT_TOKEN, STATUS_CODE, STATUS_DESCRIPTION},
    error::Error,
    put_token::{delete_token_message, put_token_message},
    token::CbsTokenType,
    CbsTokenProvider,
};

/// Options of a [`ClaimsBasedSecurity`] client
#[derive(Debug, Clone, Default)]
pub struct CbsOptions {
    /// Trace every request and response
    pub enable_trace: bool,
}

/// Result of [`ClaimsBasedSecurity::open`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CbsOpenResult {
    /// The CBS links are attached
    Ok,

    /// A link failed to attach
    Error,

    /// The context was done before the links were attached
    Cancelled,
}

/// Result of a put-token or delete-token operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CbsOperationResult {
    /// The node accepted the operation
    Ok,

    /// The request could not be delivered or the response could not be read
    Error,

    /// The node answered with a status code outside 200..=299
    Failed,

    /// The CBS links are not open
    InstanceClosed,
}

impl From<ManagementOperationStatus> for CbsOperationResult {
    fn from(status: ManagementOperationStatus) -> Self {
        match status {
            ManagementOperationStatus::Ok => CbsOperationResult::Ok,
            ManagementOperationStatus::Error => CbsOperationResult::Error,
            ManagementOperationStatus::FailedBadStatus => CbsOperationResult::Failed,
        }
    }
}

struct CbsEvents;

impl ManagementClientEvents for CbsEvents {
    fn on_error(&self, _error: &amqp_engine::definitions::Error) {
        #[cfg(feature = "tracing")]
        tracing::error!(error = ?_error, "cbs error");
        #[cfg(feature = "log")]
        log::error!("cbs error: {:?}", _error);
    }
}

/// Claims-based security client
///
/// Tokens are put to the `$cbs` node through a management link pair. The node
/// answers with `status-code` and `status-description` application properties.
///
/// # Example
///
/// ```rust,ignore
/// let cbs = ClaimsBasedSecurity::new(&session, CbsOptions::default());
/// cbs.open(&ctx).await?;
/// let (result, code, description) = cbs
///     .put_token(CbsTokenType::Jwt, "amqp://host/queue", &token, None, &ctx)
///     .await?;
/// ```
#[derive(Debug)]
pub struct ClaimsBasedSecurity {
    management: ManagementClient,
    last_token_type: Mutex<CbsTokenType>,
    token_expiry: Mutex<Option<Timestamp>>,
}

impl ClaimsBasedSecurity {
    /// Creates a CBS client on `session`. Nothing is attached until [`open`](Self::open).
    pub fn new(session: &Session, options: CbsOptions) -> Self {
        let management_options = ManagementClientOptions {
            enable_trace: options.enable_trace,
            expected_status_code_key_name: String::from(STATUS_CODE),
            expected_status_description_key_name: String::from(STATUS_DESCRIPTION),
            client_node_address: None,
        };
        let management = ManagementClient::new(
            session,
            CBS_NODE_ADDR,
            management_options,
            Some(Arc::new(CbsEvents)),
        );
        Self {
            management,
            last_token_type: Mutex::new(CbsTokenType::default()),
            token_expiry: Mutex::new(None),
        }
    }

    /// Attaches the CBS sender and receiver
    pub async fn open(&self, ctx: &Context) -> Result<CbsOpenResult, Error> {
        let result = match self.management.open(ctx).await? {
            ManagementOpenStatus::Ok => CbsOpenResult::Ok,
            ManagementOpenStatus::Error => CbsOpenResult::Error,
            ManagementOpenStatus::Cancelled => CbsOpenResult::Cancelled,
        };
        Ok(result)
    }

    /// Detaches the CBS sender and receiver
    pub async fn close(&self, ctx: &Context) -> Result<(), Error> {
        self.management.close(ctx).await?;
        Ok(())
    }

    /// Whether the CBS links are attached
    pub fn is_open(&self) -> bool {
        self.management.state() == ManagementState::Open
    }

    /// Expiry of the most recently accepted token
    pub fn token_expiry(&self) -> Option<Timestamp> {
        self.token_expiry.lock().clone()
    }

    /// Puts `token` for `audience`
    ///
    /// Returns the outcome together with the status code and description sent by
    /// the node. The expiry is retained when the node accepts the token.
    pub async fn put_token(
        &self,
        token_type: CbsTokenType,
        audience: &str,
        token: &str,
        expires_at: Option<Timestamp>,
        ctx: &Context,
    ) -> Result<(CbsOperationResult, i32, String), Error> {
        if !self.is_open() {
            return Ok((CbsOperationResult::InstanceClosed, 0, String::new()));
        }
        #[cfg(feature = "tracing")]
        tracing::debug!(audience, token_type = token_type.as_str(), "put-token");
        #[cfg(feature = "log")]
        log::debug!("put-token {} ({})", audience, token_type.as_str());

        let message = put_token_message(audience, token, expires_at.clone());
        let result = self
            .management
            .execute_operation(PUT_TOKEN, token_type.as_str(), "", message, ctx)
            .await?;
        *self.last_token_type.lock() = token_type;
        if result.is_ok() {
            *self.token_expiry.lock() = expires_at;
        }
        Ok(into_operation_result(result))
    }

    /// Deletes the token of `audience`
    ///
    /// The request carries the type of the last token put, JWT if none was.
    pub async fn delete_token(
        &self,
        audience: &str,
        ctx: &Context,
    ) -> Result<(CbsOperationResult, i32, String), Error> {
        if !self.is_open() {
            return Ok((CbsOperationResult::InstanceClosed, 0, String::new()));
        }
        #[cfg(feature = "tracing")]
        tracing::debug!(audience, "delete-token");
        #[cfg(feature = "log")]
        log::debug!("delete-token {}", audience);

        let token_type = *self.last_token_type.lock();
        let result = self
            .management
            .execute_operation(
                DELETE_TOKEN,
                token_type.as_str(),
                "",
                delete_token_message(audience),
                ctx,
            )
            .await?;
        Ok(into_operation_result(result))
    }

    /// Fetches a token for `audience` from `provider` and puts it
    pub async fn authorize<P>(
        &self,
        provider: &P,
        audience: &str,
        ctx: &Context,
    ) -> Result<(CbsOperationResult, i32, String), Error>
    where
        P: CbsTokenProvider,
    {
        let token = provider
            .get_token(audience)
            .await
            .map_err(|error| Error::TokenProvider(Box::new(error)))?;
        self.put_token(
            token.token_type,
            audience,
            &token.token_value,
            token.expires_at_utc,
            ctx,
        )
        .await
    }
}

fn into_operation_result(result: ManagementResult) -> (CbsOperationResult, i32, String) {
    (result.status.into(), result.status_code, result.description)
}
