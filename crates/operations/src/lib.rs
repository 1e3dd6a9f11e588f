//! Named CRM operations and the metered dispatcher
//!
//! An [`OperationCatalog`] is built once at startup, usually from
//! `[[operations]]` config entries turned into [`HttpOperation`]s. The
//! [`Dispatcher`] checks plan permissions, invokes the operation with the
//! tenant's upstream credential, and records usage.

pub mod catalog;
pub mod dispatcher;
pub mod error;
pub mod http;

pub use catalog::{Operation, OperationCatalog, OperationFuture, validate_name};
pub use dispatcher::Dispatcher;
pub use error::{Error, Result};
pub use http::{HttpOperation, HttpOperationSpec, UpstreamTarget};
