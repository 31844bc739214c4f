//! Concurrent fan-out dispatcher
//!
//! Runs one unit of work per host concurrently and always waits for every
//! unit to finish before reporting. The mode decides what a failure means:
//! provisioning dispatches fail fast, cleanup dispatches only log.

use crate::error::{ForgeError, HostFailure, Result};
use futures::future::join_all;
use std::future::Future;

/// How failures of individual hosts are reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Return an error listing every failed host
    FailFast,
    /// Log failures and carry on
    BestEffort,
}

/// Run `f` against every host concurrently
pub async fn fan_out<F, Fut>(hosts: &[String], mode: DispatchMode, operation: &str, f: F) -> Result<()>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    if hosts.is_empty() {
        return Ok(());
    }

    let f = &f;
    let results = join_all(hosts.iter().map(|host| async move {
        let outcome = f(host.clone()).await;
        (host.clone(), outcome)
    }))
    .await;

    let failures: Vec<HostFailure> = results
        .into_iter()
        .filter_map(|(host, outcome)| match outcome {
            Ok(()) => None,
            Err(e) => {
                tracing::error!(host = %host, operation = %operation, error = %e, "host failed");
                Some(HostFailure {
                    host,
                    message: e.to_string(),
                })
            }
        })
        .collect();

    if failures.is_empty() {
        return Ok(());
    }

    match mode {
        DispatchMode::FailFast => Err(ForgeError::Fanout {
            operation: operation.to_string(),
            failures,
        }),
        DispatchMode::BestEffort => {
            tracing::warn!(
                "{} failed on {} of {} hosts, continuing",
                operation,
                failures.len(),
                hosts.len()
            );
            Ok(())
        }
    }
}
