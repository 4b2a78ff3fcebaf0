//! Process signals, the fail-fast panic hook and bounded resource shutdown.

use std::future::Future;
use std::sync::Once;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::JoinSet;

tokio::task_local! {
    static IN_REQUEST: ();
}

static PANIC_HOOK: Once = Once::new();

/// Runs `fut` marked as request-scoped, so a panic inside it is recovered
/// by the dispatcher instead of terminating the process.
pub(crate) async fn request_scope<F: Future>(fut: F) -> F::Output {
    IN_REQUEST.scope((), fut).await
}

fn in_request() -> bool {
    IN_REQUEST.try_with(|_| ()).is_ok()
}

/// Panics outside a request scope are programming errors: log and exit 1.
pub(crate) fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if in_request() {
                tracing::error!(panic = %info, "handler panicked");
                return;
            }
            previous(info);
            tracing::error!(panic = %info, "uncaught panic, exiting");
            std::process::exit(1);
        }));
    });
}

/// Resolves on Ctrl+C or, on unix, SIGTERM.
pub(crate) async fn signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received Ctrl+C"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

/// A named piece of shutdown work.
pub(crate) struct Closer {
    pub name: String,
    pub work: BoxFuture<'static, Result<(), String>>,
}

impl Closer {
    pub fn new<F>(name: impl Into<String>, work: F) -> Self
    where
        F: Future<Output = Result<(), String>> + Send + 'static,
    {
        Self {
            name: name.into(),
            work: Box::pin(work),
        }
    }
}

/// Runs every closer concurrently against one shared timeout.
///
/// Returns the names of the closers that were abandoned.
pub(crate) async fn close_all(closers: Vec<Closer>, timeout: Duration) -> Vec<String> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut pending: Vec<String> = closers.iter().map(|c| c.name.clone()).collect();
    let mut tasks = JoinSet::new();
    for closer in closers {
        let name = closer.name;
        let work = closer.work;
        tasks.spawn(async move { (name, work.await) });
    }

    while let Some(joined) = tokio::time::timeout_at(deadline, tasks.join_next())
        .await
        .ok()
        .flatten()
    {
        match joined {
            Ok((name, result)) => {
                match result {
                    Ok(()) => tracing::debug!(resource = %name, "closed"),
                    Err(err) => tracing::warn!(resource = %name, error = %err, "close failed"),
                }
                pending.retain(|p| *p != name);
            }
            Err(err) => tracing::warn!(error = %err, "close task panicked"),
        }
    }

    if !tasks.is_empty() {
        tracing::warn!(
            abandoned = ?pending,
            timeout_ms = timeout.as_millis() as u64,
            "resources did not close in time"
        );
        tasks.abort_all();
    } else {
        pending.clear();
    }
    pending
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn slow_closers_are_abandoned() {
        let closers = vec![
            Closer::new("fast", async { Ok(()) }),
            Closer::new("failing", async { Err("boom".to_string()) }),
            Closer::new("slow", async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            }),
        ];
        let started = std::time::Instant::now();
        let abandoned = close_all(closers, Duration::from_millis(50)).await;
        assert_eq!(abandoned, vec!["slow".to_string()]);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn nothing_abandoned_when_all_finish() {
        let abandoned = close_all(vec![Closer::new("a", async { Ok(()) })], Duration::from_secs(1)).await;
        assert!(abandoned.is_empty());
    }

    #[tokio::test]
    async fn request_scope_is_visible_inside_only() {
        assert!(!in_request());
        assert!(request_scope(async { in_request() }).await);
    }
}
