//! Component runtime: spawn a set of long-running tasks as one unit.
//!
//! A [`Component`] is a self-contained task (a comms channel, for now) that
//! captures its shared state at construction.  [`spawn_components`] starts
//! them on a `JoinSet` and returns a [`SubsystemHandle`] that resolves once
//! all of them have exited.  The first failure cancels the shared token so
//! the siblings stop too.

use std::future::Future;
use std::pin::Pin;

use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::AppError;

/// A boxed, owned future returned by [`Component::run`].
pub type ComponentFuture = Pin<Box<dyn Future<Output = Result<(), AppError>> + Send + 'static>>;

pub trait Component: Send + 'static {
    /// Stable identifier used in log messages.
    fn id(&self) -> &str;

    /// Consume the component and return its run-loop.  The loop should end
    /// when `shutdown` is cancelled.
    fn run(self: Box<Self>, shutdown: CancellationToken) -> ComponentFuture;
}

pub struct SubsystemHandle {
    inner: JoinHandle<Result<(), AppError>>,
}

impl SubsystemHandle {
    /// Await all components and return the first error, if any.
    pub async fn join(self) -> Result<(), AppError> {
        match self.inner.await {
            Ok(r) => r,
            Err(e) => Err(AppError::Comms(format!("subsystem task panicked: {e}"))),
        }
    }
}

pub fn spawn_components(components: Vec<Box<dyn Component>>, shutdown: CancellationToken) -> SubsystemHandle {
    let inner = tokio::spawn(async move {
        let mut set: JoinSet<Result<(), AppError>> = JoinSet::new();
        for component in components {
            debug!(component = %component.id(), "spawning component");
            set.spawn(component.run(shutdown.clone()));
        }

        let mut first_err: Option<AppError> = None;
        while let Some(res) = set.join_next().await {
            let err = match res {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(e) => AppError::Comms(format!("component panicked: {e}")),
            };
            error!(error = %err, "component failed; shutting down siblings");
            shutdown.cancel();
            first_err.get_or_insert(err);
        }

        first_err.map_or(Ok(()), Err)
    });

    SubsystemHandle { inner }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Waits(&'static str);

    impl Component for Waits {
        fn id(&self) -> &str {
            self.0
        }

        fn run(self: Box<Self>, shutdown: CancellationToken) -> ComponentFuture {
            Box::pin(async move {
                shutdown.cancelled().await;
                Ok(())
            })
        }
    }

    struct Fails;

    impl Component for Fails {
        fn id(&self) -> &str {
            "fails"
        }

        fn run(self: Box<Self>, _shutdown: CancellationToken) -> ComponentFuture {
            Box::pin(async { Err(AppError::Comms("boom".into())) })
        }
    }

    #[tokio::test]
    async fn failure_cancels_siblings() {
        let shutdown = CancellationToken::new();
        let handle = spawn_components(vec![Box::new(Waits("a")), Box::new(Fails)], shutdown.clone());
        let err = handle.join().await.unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn clean_shutdown() {
        let shutdown = CancellationToken::new();
        let handle = spawn_components(vec![Box::new(Waits("a")), Box::new(Waits("b"))], shutdown.clone());
        shutdown.cancel();
        handle.join().await.unwrap();
    }

    #[tokio::test]
    async fn no_components_resolves_immediately() {
        spawn_components(Vec::new(), CancellationToken::new()).join().await.unwrap();
    }
}
