//! Application property keys used by management requests and responses

pub const OPERATION: &str = "operation";
pub const TYPE: &str = "type";
pub const LOCALES: &str = "locales";

/// Default key of the status code in a response
pub const STATUS_CODE: &str = "statusCode";

/// Default key of the status description in a response
pub const STATUS_DESCRIPTION: &str = "statusDescription";

/// Description of a response whose status properties could not be read
pub const PROCESSING_ERROR_DESCRIPTION: &str = "Error processing management operation.";
