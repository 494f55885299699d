use berth_model::{RuntimeReason, RuntimeStatus};

use crate::runtime::ContainerRuntime;

/// Two sequential checks, first failure wins. Never returns an error: unexpected failures
/// are folded into `RuntimeReason::Unexpected`.
pub async fn check_runtime_status(runtime: &dyn ContainerRuntime, bin: &str) -> RuntimeStatus {
    match runtime.is_installed().await {
        Ok(true) => {}
        Ok(false) => {
            return RuntimeStatus::failed(
                RuntimeReason::NotInstalled,
                format!("`{bin}` is not installed or not on PATH; install it and retry"),
            );
        }
        Err(e) => {
            return RuntimeStatus::failed(
                RuntimeReason::Unexpected,
                format!("unexpected error while checking `{bin}`: {e:#}"),
            );
        }
    }

    match runtime.is_daemon_up().await {
        Ok(true) => RuntimeStatus::ok(format!("`{bin}` is installed and its daemon is running")),
        Ok(false) => RuntimeStatus::failed(
            RuntimeReason::NotRunning,
            format!("`{bin}` is installed but its daemon is not running; start it and retry"),
        ),
        Err(e) => RuntimeStatus::failed(
            RuntimeReason::Unexpected,
            format!("unexpected error while contacting the `{bin}` daemon: {e:#}"),
        ),
    }
}
