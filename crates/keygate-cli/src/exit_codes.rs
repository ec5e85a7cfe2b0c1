//! Exit codes for `keygate`.
//! These codes are part of the public contract; admission hooks and CI jobs key off them.

use keygate_core::{ClusterError, ConfigError, KeyMaterialError, ReferenceError, VerifyError};

pub const SUCCESS: i32 = 0;
pub const NO_MATCH: i32 = 1; // Every key tried, no valid signature for the signer
pub const CONFIG_ERROR: i32 = 2; // Bad config, unreadable secret or no usable key
pub const CANCELLED: i32 = 3; // Interrupted or overall timeout

/// Exit code for an error that escaped a command.
pub fn for_error(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<VerifyError>() {
            return e.exit_code();
        }
        if let Some(e) = cause.downcast_ref::<ConfigError>() {
            return e.exit_code();
        }
        if let Some(e) = cause.downcast_ref::<KeyMaterialError>() {
            return e.exit_code();
        }
        if let Some(e) = cause.downcast_ref::<ReferenceError>() {
            return e.exit_code();
        }
        if let Some(e) = cause.downcast_ref::<ClusterError>() {
            return e.exit_code();
        }
    }
    CONFIG_ERROR
}
