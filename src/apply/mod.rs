//! Pipeline processors
//!
//! Each cluster operation is a [`Processor`]: an ordered list of named steps
//! over a cluster descriptor. The [`Executor`] runs them top to bottom and
//! stops at the first failure. There is no rollback; every step checks the
//! actual state of the hosts first, so a failed pipeline is retried by
//! running it again.

pub mod context;
pub mod create;
pub mod delete;
pub mod gen;
pub mod install;
pub mod scale;
pub mod upgrade;

pub use context::{ApplyContext, LocalAccess};
pub use create::CreateProcessor;
pub use delete::DeleteProcessor;
pub use gen::GenProcessor;
pub use install::{InstallProcessor, UninstallProcessor};
pub use scale::ScaleProcessor;
pub use upgrade::UpgradeProcessor;

use crate::cluster::{Cluster, ScaleDirection, ScalePlan};
use crate::error::{ForgeError, Result};
use async_trait::async_trait;
use std::fmt::Display;

/// A named cluster operation
#[async_trait]
pub trait Processor: Send + Sync {
    type Step: Display + Send + Sync;

    /// Steps in execution order
    fn pipeline(&self) -> Vec<Self::Step>;

    async fn run(&self, step: &Self::Step, cluster: &Cluster) -> Result<()>;
}

/// Runs a processor's pipeline
pub struct Executor<P: Processor> {
    processor: P,
}

impl<P: Processor> Executor<P> {
    pub fn new(processor: P) -> Self {
        Self { processor }
    }

    pub async fn execute(&self, cluster: &Cluster) -> Result<()> {
        let steps = self.processor.pipeline();
        let total = steps.len();
        for (i, step) in steps.iter().enumerate() {
            tracing::info!("[{}/{}] {}", i + 1, total, step);
            if let Err(e) = self.processor.run(step, cluster).await {
                tracing::error!(step = %step, "Step failed: {}", e);
                return Err(e);
            }
        }
        Ok(())
    }
}

/// Bring the cluster to the state `desired` describes.
///
/// A cluster with no saved state is created. Otherwise a changed image
/// upgrades it and changed host lists scale it.
pub async fn apply(ctx: &ApplyContext, desired: &Cluster) -> Result<()> {
    desired.validate()?;
    let Some(current) = ctx.load_current(desired.name())? else {
        tracing::info!("Creating cluster {}", desired.name());
        return Executor::new(CreateProcessor::new(ctx)).execute(desired).await;
    };

    let current_master0 = current.master0()?;
    if desired.master0()? != current_master0 {
        return Err(ForgeError::InvalidConfig(format!(
            "master0 of {} is {} and cannot change",
            desired.name(),
            current_master0
        )));
    }

    let plan = ScalePlan::compute(&current, desired);
    let image_changed = current.image() != desired.image();
    if image_changed {
        tracing::info!(
            "Upgrading {} from {} to {}",
            desired.name(),
            current.image(),
            desired.image()
        );
        let mut target = current.clone();
        target.spec.image = desired.image().to_string();
        Executor::new(UpgradeProcessor::new(ctx))
            .execute(&target)
            .await?;
    }

    match plan.direction() {
        ScaleDirection::None => {
            if !image_changed {
                tracing::info!("Cluster {} is up to date", desired.name());
            }
            Ok(())
        }
        _ => scale(ctx, &current, desired, plan).await,
    }
}

/// Join or delete the hosts in `plan`
pub async fn scale(ctx: &ApplyContext, current: &Cluster, desired: &Cluster, plan: ScalePlan) -> Result<()> {
    tracing::info!(
        "Scaling {}: join masters {:?} nodes {:?}, delete masters {:?} nodes {:?}",
        desired.name(),
        plan.join_masters,
        plan.join_nodes,
        plan.delete_masters,
        plan.delete_nodes
    );
    Executor::new(ScaleProcessor::new(ctx, current.clone(), plan))
        .execute(desired)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recording {
        steps: Vec<&'static str>,
        fail_at: Option<&'static str>,
        ran: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Processor for Recording {
        type Step = &'static str;

        fn pipeline(&self) -> Vec<Self::Step> {
            self.steps.clone()
        }

        async fn run(&self, step: &Self::Step, _cluster: &Cluster) -> Result<()> {
            self.ran.lock().unwrap().push(step.to_string());
            if self.fail_at == Some(*step) {
                return Err(ForgeError::Internal(format!("{} failed", step)));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_executor_stops_at_first_error() {
        let executor = Executor::new(Recording {
            steps: vec!["a", "b", "c"],
            fail_at: Some("b"),
            ran: Mutex::new(Vec::new()),
        });
        let cluster = Cluster::new("c1", "img");

        let err = executor.execute(&cluster).await.unwrap_err();
        assert!(err.to_string().contains("b failed"));
        assert_eq!(*executor.processor.ran.lock().unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_executor_runs_in_order() {
        let executor = Executor::new(Recording {
            steps: vec!["a", "b", "c"],
            fail_at: None,
            ran: Mutex::new(Vec::new()),
        });
        executor.execute(&Cluster::new("c1", "img")).await.unwrap();
        assert_eq!(*executor.processor.ran.lock().unwrap(), vec!["a", "b", "c"]);
    }
}
