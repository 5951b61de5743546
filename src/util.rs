use anyhow::anyhow;
use sentry_core::protocol::SpanStatus;
use std::any::Any;
use std::future::Future;

/// Run `callback` inside a Sentry transaction named after the work.
pub(crate) async fn with_sentry_transaction<F, R, E, Fut>(
    transaction_name: &str,
    callback: F,
) -> Result<R, E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<R, E>>,
{
    let tx_ctx = sentry_core::TransactionContext::new(transaction_name, "work.run");
    let tx = sentry_core::start_transaction(tx_ctx);

    let result = sentry_core::with_scope(
        |scope| scope.set_span(Some(tx.clone().into())),
        callback,
    )
    .await;

    tx.set_status(if result.is_ok() {
        SpanStatus::Ok
    } else {
        SpanStatus::UnknownError
    });
    tx.finish();

    result
}

/// Turn a caught panic payload into an error.
pub(crate) fn try_to_extract_panic_info(info: &(dyn Any + Send + 'static)) -> anyhow::Error {
    if let Some(message) = info.downcast_ref::<&'static str>() {
        anyhow!("work panicked: {message}")
    } else if let Some(message) = info.downcast_ref::<String>() {
        anyhow!("work panicked: {message}")
    } else {
        anyhow!("work panicked")
    }
}
