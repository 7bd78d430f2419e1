//! Application error codes and handler error translation
//!
//! Handlers return `anyhow::Error`. Before going on the wire every error is
//! turned into an [`RpcError`] by [`translate`], which walks the error chain
//! looking for something it knows how to classify.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io;
use thiserror::Error;

use crate::jsonrpc::{error_codes, RpcError};
use crate::storage::StorageError;

/// Application error codes
///
/// Codes -32000 to -32099 are reserved for the JSON-RPC protocol. Each
/// application code is bound to exactly one message.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    /// An operation was cancelled gracefully
    #[error("Operation cancelled")]
    OperationCancelled,

    /// An operation was aborted by the user
    #[error("Operation aborted")]
    OperationAborted,

    #[error("Install folder disappeared")]
    InstallFolderDisappeared,

    #[error("No compatible uploads")]
    NoCompatibleUploads,

    /// The title is hosted on an incompatible third-party website
    #[error("Unsupported host")]
    UnsupportedHost,

    #[error("No launch candidates")]
    NoLaunchCandidates,

    #[error("Java Runtime Environment is required to launch this title")]
    JavaRuntimeNeeded,

    #[error("There is no Internet connection")]
    NetworkDisconnected,

    #[error("API error")]
    ApiError,

    #[error("The database is busy")]
    DatabaseBusy,

    #[error("An install location could not be removed because it has active downloads")]
    CantRemoveLocationBecauseOfActiveDownloads,
}

impl Code {
    /// Numeric value sent on the wire
    pub fn code(self) -> i64 {
        match self {
            Code::OperationCancelled => 499,
            Code::OperationAborted => 410,
            Code::InstallFolderDisappeared => 404,
            Code::NoCompatibleUploads => 2001,
            Code::UnsupportedHost => 3001,
            Code::NoLaunchCandidates => 5000,
            Code::JavaRuntimeNeeded => 6000,
            Code::NetworkDisconnected => 9000,
            Code::ApiError => 12000,
            Code::DatabaseBusy => 16000,
            Code::CantRemoveLocationBecauseOfActiveDownloads => 18000,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.code() == code)
    }

    pub const ALL: [Code; 11] = [
        Code::OperationCancelled,
        Code::OperationAborted,
        Code::InstallFolderDisappeared,
        Code::NoCompatibleUploads,
        Code::UnsupportedHost,
        Code::NoLaunchCandidates,
        Code::JavaRuntimeNeeded,
        Code::NetworkDisconnected,
        Code::ApiError,
        Code::DatabaseBusy,
        Code::CantRemoveLocationBecauseOfActiveDownloads,
    ];
}

impl From<Code> for RpcError {
    fn from(code: Code) -> Self {
        RpcError::new(code.code(), code.to_string())
    }
}

/// Error payload returned by the upstream web API
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("api error ({status_code}) on {path}: {}", messages.join(", "))]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    pub messages: Vec<String>,
    pub status_code: u16,
    pub path: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("network is simulated as offline")]
    SimulatedOffline,

    #[error("network unreachable: {0}")]
    Unreachable(String),
}

/// Marker error for work that stopped because its token was cancelled
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("cancelled")]
pub struct Cancelled;

/// Look for a `T` in the error, including context layers
fn find<T>(err: &anyhow::Error) -> Option<&T>
where
    T: std::error::Error + Send + Sync + 'static,
{
    err.downcast_ref::<T>()
        .or_else(|| err.chain().find_map(|cause| cause.downcast_ref::<T>()))
}

fn is_network_error(err: &anyhow::Error) -> bool {
    if find::<NetworkError>(err).is_some() {
        return true;
    }
    if let Some(e) = find::<io::Error>(err) {
        if matches!(
            e.kind(),
            io::ErrorKind::ConnectionRefused
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::NotConnected
                | io::ErrorKind::AddrNotAvailable
                | io::ErrorKind::TimedOut
        ) {
            return true;
        }
    }
    find::<reqwest::Error>(err).is_some_and(|e| e.is_connect() || e.is_timeout())
}

fn is_cancellation(err: &anyhow::Error) -> bool {
    find::<Cancelled>(err).is_some()
        || matches!(find::<StorageError>(err), Some(StorageError::Interrupted))
}

/// Structured errors carry their own code and message
fn structured(err: &anyhow::Error) -> Option<(i64, String, Map<String, Value>)> {
    if let Some(rpc) = find::<RpcError>(err) {
        let data = match &rpc.data {
            Some(Value::Object(map)) => map.clone(),
            Some(other) => {
                let mut map = Map::new();
                map.insert("details".to_string(), other.clone());
                map
            }
            None => Map::new(),
        };
        return Some((rpc.code, rpc.message.clone(), data));
    }

    let code = match find::<StorageError>(err) {
        Some(StorageError::Busy) => Some(Code::DatabaseBusy),
        _ => find::<Code>(err).copied(),
    }?;
    Some((code.code(), code.to_string(), Map::new()))
}

/// Turn a handler error into its wire form
///
/// First match wins: structured errors, then network failures, then
/// cancellation, then a generic internal error carrying the error text.
/// `data.stack` and `data.version` are always filled in.
pub fn translate(err: &anyhow::Error, version: &str) -> RpcError {
    let (mut code, message, mut data) = match structured(err) {
        Some(found) => found,
        None if is_network_error(err) => {
            let code = Code::NetworkDisconnected;
            (code.code(), code.to_string(), Map::new())
        }
        None if is_cancellation(err) => {
            let code = Code::OperationCancelled;
            (code.code(), code.to_string(), Map::new())
        }
        None => (error_codes::INTERNAL_ERROR, format!("{:#}", err), Map::new()),
    };

    data.insert("stack".to_string(), Value::String(format!("{:?}", err)));
    data.insert("version".to_string(), Value::String(version.to_string()));

    if let Some(api_error) = find::<ApiError>(err) {
        code = Code::ApiError.code();
        if let Ok(payload) = serde_json::to_value(api_error) {
            data.insert("apiError".to_string(), payload);
        }
    }

    RpcError::new(code, message).with_data(Value::Object(data))
}

/// Internal error for a handler that panicked, with the backtrace captured
/// at the panic site as `data.stack`
pub fn translate_panic(message: &str, backtrace: &str, version: &str) -> RpcError {
    let mut data = Map::new();
    data.insert("stack".to_string(), Value::String(backtrace.to_string()));
    data.insert("version".to_string(), Value::String(version.to_string()));
    RpcError::new(error_codes::INTERNAL_ERROR, format!("panic: {}", message))
        .with_data(Value::Object(data))
}
