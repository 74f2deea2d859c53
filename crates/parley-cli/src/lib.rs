//! Parley CLI - drive the end-to-end encryption subsystem from a terminal
//!
//! This crate provides commands for:
//! - Creating, recovering and resetting the identity key pair
//! - Exporting and importing identity backups
//! - Enabling and disabling encryption on conversations
//! - Sending and reading encrypted messages through the relay

pub mod cli;
pub mod output;

pub use cli::Cli;
pub use output::{JsonResponse, OutputFormat, OutputFormatter};

use parley_core::relay::RelayError;
use parley_core::E2eeError;

/// Exit codes for CLI operations
///
/// - 0: Success
/// - 1: General error
/// - 2: Authentication failed (wrong recovery code, bad backup)
/// - 3: Timeout
/// - 4: Relay unreachable or rejected the request
/// - 5: Invalid input or configuration
/// - 6: Identity not initialized
/// - 7: Permission denied (not the conversation's encryption owner)
/// - 8: No session key available yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    GeneralError = 1,
    AuthenticationFailed = 2,
    Timeout = 3,
    ConnectionFailed = 4,
    InvalidInput = 5,
    NotInitialized = 6,
    PermissionDenied = 7,
    KeyUnavailable = 8,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

impl From<&E2eeError> for ExitCode {
    fn from(e: &E2eeError) -> Self {
        match e {
            E2eeError::Authentication(_) => ExitCode::AuthenticationFailed,
            E2eeError::Network(RelayError::Timeout) => ExitCode::Timeout,
            E2eeError::Network(_) => ExitCode::ConnectionFailed,
            E2eeError::Config(_) => ExitCode::InvalidInput,
            E2eeError::NotInitialized => ExitCode::NotInitialized,
            E2eeError::Unauthorized { .. } => ExitCode::PermissionDenied,
            E2eeError::KeyUnavailable(_) => ExitCode::KeyUnavailable,
            E2eeError::KeyGeneration(_) | E2eeError::Persistence(_) | E2eeError::Decryption(_) => {
                ExitCode::GeneralError
            }
        }
    }
}

impl ExitCode {
    pub fn to_exit_code(self) -> std::process::ExitCode {
        std::process::ExitCode::from(self as u8)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExitCode::Success => "SUCCESS",
            ExitCode::GeneralError => "GENERAL_ERROR",
            ExitCode::AuthenticationFailed => "AUTH_FAILED",
            ExitCode::Timeout => "TIMEOUT",
            ExitCode::ConnectionFailed => "CONNECTION_FAILED",
            ExitCode::InvalidInput => "INVALID_INPUT",
            ExitCode::NotInitialized => "NOT_INITIALIZED",
            ExitCode::PermissionDenied => "PERMISSION_DENIED",
            ExitCode::KeyUnavailable => "KEY_UNAVAILABLE",
        }
    }
}
