// Exit codes for the emendare CLI.
//
//   0  = success
//   1  = general error
//   2  = usage/argument error
//   10 = daemon not reachable
//   11 = not found
//   12 = conflict (closed, already voted, stale version, ...)
//   13 = rejected (not eligible, history unavailable)

use std::process;

use emendare_common::protocol::jsonrpc::RpcError;

use crate::client::is_daemon_unavailable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    Error = 1,
    Usage = 2,
    DaemonDown = 10,
    NotFound = 11,
    Conflict = 12,
    Rejected = 13,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Walks the error chain for a daemon answer or a transport failure.
    pub fn from_error(err: &anyhow::Error) -> Self {
        if is_daemon_unavailable(err) {
            return Self::DaemonDown;
        }
        for cause in err.chain() {
            if let Some(failure) = cause.downcast_ref::<RpcFailure>() {
                return Self::from_rpc_code(&failure.code);
            }
            if let Some(io_err) = cause.downcast_ref::<std::io::Error>() {
                if io_err.kind() == std::io::ErrorKind::InvalidInput {
                    return Self::Usage;
                }
            }
        }
        Self::Error
    }

    pub fn from_rpc_code(code: &str) -> Self {
        match code {
            "NOT_FOUND" => Self::NotFound,
            "ALREADY_CLOSED" | "ALREADY_VOTED" | "STALE_VERSION" | "MERGE_CONFLICT"
            | "ALREADY_FOLLOWING" | "NOT_FOLLOWING" => Self::Conflict,
            "NOT_ELIGIBLE" | "HISTORY_UNAVAILABLE" => Self::Rejected,
            "INVALID_REQUEST" | "INVALID_PARAMS" => Self::Usage,
            _ => Self::Error,
        }
    }
}

impl From<ExitCode> for process::ExitCode {
    fn from(code: ExitCode) -> Self {
        process::ExitCode::from(code.code() as u8)
    }
}

/// An error answered by the daemon, carried through `anyhow` chains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcFailure {
    /// Stable engine code such as `NOT_ELIGIBLE`, or the JSON-RPC code name.
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl From<RpcError> for RpcFailure {
    fn from(error: RpcError) -> Self {
        let code = error
            .error_code()
            .map(str::to_string)
            .unwrap_or_else(|| protocol_code_name(error.code).to_string());
        Self { code, retryable: error.is_retryable(), message: error.message }
    }
}

impl std::fmt::Display for RpcFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcFailure {}

fn protocol_code_name(code: i32) -> &'static str {
    use emendare_common::protocol::jsonrpc::{
        INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND, PARSE_ERROR,
    };
    match code {
        PARSE_ERROR => "PARSE_ERROR",
        INVALID_REQUEST => "INVALID_REQUEST",
        METHOD_NOT_FOUND => "METHOD_NOT_FOUND",
        INVALID_PARAMS => "INVALID_PARAMS",
        _ => "RPC_ERROR",
    }
}
