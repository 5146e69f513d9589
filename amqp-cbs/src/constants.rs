//! Addresses and property names of the CBS protocol

/// Address of the CBS node
pub const CBS_NODE_ADDR: &str = "$cbs";

/// Put token operation
pub const PUT_TOKEN: &str = "put-token";

/// Delete token operation
pub const DELETE_TOKEN: &str = "delete-token";

/// Application property holding the audience of a token
pub const NAME: &str = "name";

/// Application property holding the expiry of a token
pub const EXPIRATION: &str = "expiration";

/// Key of the status code in a CBS response
pub const STATUS_CODE: &str = "status-code";

/// Key of the status description in a CBS response
pub const STATUS_DESCRIPTION: &str = "status-description";
