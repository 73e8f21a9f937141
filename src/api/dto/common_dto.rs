//! Shared DTO types used across multiple endpoints.

use serde::Deserialize;
use utoipa::IntoParams;

use crate::service::SubmitMode;

/// Query parameters accepted by every operation endpoint.
#[derive(Debug, Clone, Copy, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct SubmitParams {
    /// Block until the operation finishes and return its outcome instead of
    /// `202 Accepted`.
    #[serde(default)]
    pub wait: bool,
    /// Fail with `409 Conflict` immediately if the VM is busy, instead of
    /// waiting for it.
    #[serde(default)]
    pub fail_fast: bool,
}

impl SubmitParams {
    /// Busy-VM behaviour selected by the query.
    #[must_use]
    pub const fn mode(&self) -> SubmitMode {
        if self.fail_fast {
            SubmitMode::FailFast
        } else {
            SubmitMode::Wait
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_wait_for_busy_vms() {
        let params = SubmitParams::default();
        assert!(!params.wait);
        assert_eq!(params.mode(), SubmitMode::Wait);
    }

    #[test]
    fn fail_fast_selects_fail_fast_mode() {
        let params = SubmitParams {
            wait: true,
            fail_fast: true,
        };
        assert_eq!(params.mode(), SubmitMode::FailFast);
    }
}
