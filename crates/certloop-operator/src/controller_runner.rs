//! Controller runner - builds the certificate controller future
//!
//! Construction is kept separate from `main` so the bootstrap pass and the
//! watch can be composed by the caller.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use certloop_common::TLS_LABEL_SELECTOR;

use crate::controller::{error_policy, reconcile, reconcile_record, Context};
use crate::store::RecordId;

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Run one pass for the reserved Secret before the watch starts
///
/// The watch only fires for Secrets that exist, so a missing serving
/// certificate would never be created otherwise. Failure is logged and the
/// controller still starts.
pub async fn bootstrap_reserved_record(ctx: &Context) {
    let id = RecordId::new(&ctx.config.namespace, &ctx.config.tls_secret);
    match reconcile_record(&id, ctx).await {
        Ok(outcome) => tracing::info!(
            secret = %id,
            decision = outcome.decision.as_str(),
            write = outcome.write.as_str(),
            "bootstrap pass completed"
        ),
        Err(e) => tracing::error!(secret = %id, error = %e, "bootstrap pass failed"),
    }
}

/// Build the certificate Secret controller future
///
/// Watches Secrets labelled `certloop.dev/tls=true` in the operator
/// namespace.
pub fn build_tls_controller(
    client: Client,
    ctx: Arc<Context>,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    let secrets: Api<Secret> = Api::namespaced(client, &ctx.config.namespace);

    tracing::info!(
        namespace = %ctx.config.namespace,
        selector = TLS_LABEL_SELECTOR,
        "- certificate Secret controller"
    );

    Box::pin(
        Controller::new(
            secrets,
            WatcherConfig::default()
                .labels(TLS_LABEL_SELECTOR)
                .timeout(WATCH_TIMEOUT_SECS),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(log_reconcile_result("Certificate")),
    )
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
