//! A handful of toy privileged operations, registered under the
//! `demos::priv` prefix, exercising every shape an entry-point's result or
//! failure can take.

use std::sync::Arc;
use std::time::Duration;

use privsep_core::context::{register_named_context, Context};
use privsep_core::PrivsepError;
use rmpv::Value;

use crate::errors::QuotaExceeded;

pub const CONTEXT_NAME: &str = "demos::priv";

/// Builds the demo's `Context`, registers its entry-points, and publishes it
/// under [`CONTEXT_NAME`] for a rootwrap-spawned helper to find again.
pub fn build_context() -> Arc<Context> {
    privsep_core::context::register_remote_error::<QuotaExceeded>();

    let context = Arc::new(
        Context::new("demos::priv", vec![])
            .with_pypath(CONTEXT_NAME)
            .with_pool_size(4)
            // The generic `privsep-helper` binary has no entry-points of its
            // own; rootwrap needs to re-exec this same binary's `helper`
            // subcommand instead of the workspace's default helper.
            .with_helper_command(vec!["privsep-demo".to_owned(), "helper".to_owned()]),
    );

    context
        .entrypoint("demos::priv::add1", None, |args, _kwargs| {
            let n = args.first().and_then(|v| v.as_i64()).unwrap_or(0);
            Ok(Value::from(n + 1))
        })
        .expect("add1 registration");

    context
        .entrypoint("demos::priv::getpid", None, |_args, _kwargs| {
            Ok(Value::from(std::process::id()))
        })
        .expect("getpid registration");

    context
        .entrypoint(
            "demos::priv::sleep",
            Some(Duration::from_millis(500)),
            |args, _kwargs| {
                let seconds = args.first().and_then(|v| v.as_f64()).unwrap_or(0.0);
                std::thread::sleep(Duration::from_secs_f64(seconds));
                Ok(Value::Nil)
            },
        )
        .expect("sleep registration");

    context
        .entrypoint("demos::priv::fail", None, |args, _kwargs| {
            let reason = args
                .first()
                .and_then(|v| v.as_str())
                .unwrap_or("no reason given")
                .to_owned();
            Err(Box::new(QuotaExceeded { reason }) as Box<dyn privsep_core::context::AnyRemoteError>)
        })
        .expect("fail registration");

    context
        .entrypoint("demos::priv::log_burst", None, |args, _kwargs| {
            let count = args.first().and_then(|v| v.as_u64()).unwrap_or(1);
            for i in 0..count {
                tracing::info!(iteration = i, "privileged log line");
            }
            Ok(Value::from(count))
        })
        .expect("log_burst registration");

    register_named_context(CONTEXT_NAME, context.clone());
    context
}

/// A small smoke-test walk through every entry-point, used by the `client`
/// subcommand.
pub async fn run_smoke_test(context: &Context) -> Result<(), PrivsepError> {
    let sum = context
        .invoke(
            "demos::priv::add1",
            vec![Value::from(41)],
            privsep_core::wire::empty_kwargs(),
        )
        .await?;
    tracing::info!(?sum, "add1(41)");

    let pid = context
        .invoke("demos::priv::getpid", vec![], privsep_core::wire::empty_kwargs())
        .await?;
    tracing::info!(?pid, "privileged helper pid");

    match context
        .invoke(
            "demos::priv::fail",
            vec![Value::from("over limit")],
            privsep_core::wire::empty_kwargs(),
        )
        .await
    {
        Ok(value) => tracing::warn!(?value, "expected fail() to return an error"),
        Err(e) => tracing::info!(error = %e, "fail() raised as expected"),
    }

    context
        .invoke(
            "demos::priv::log_burst",
            vec![Value::from(3u64)],
            privsep_core::wire::empty_kwargs(),
        )
        .await?;

    Ok(())
}
