use crate::queue::{Dispatch, Shared};
use crate::util::{try_to_extract_panic_info, with_sentry_transaction};
use futures_util::FutureExt;
use rand::Rng;
use sentry_core::{Hub, SentryFutureExt};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Instrument, debug, info_span, trace};

pub(crate) struct Worker<Env> {
    pub(crate) shared: Arc<Shared<Env>>,
}

impl<Env: Clone + Send + Sync + 'static> Worker<Env> {
    /// Calculate the sleep duration with random jitter applied.
    fn sleep_duration_with_jitter(&self) -> Duration {
        let poll_interval = self.shared.config.poll_interval();
        let jitter = self.shared.config.jitter();
        if jitter.is_zero() {
            return poll_interval;
        }

        let jitter_millis = u64::try_from(jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        poll_interval + Duration::from_millis(random_jitter)
    }

    /// Run works until the queue is shut down, or until it is empty if
    /// `shutdown_when_queue_empty` is set.
    pub(crate) async fn run(&self) {
        loop {
            if self.shared.shutdown.is_cancelled() {
                debug!("Work queue shut down. Stopping the worker…");
                break;
            }

            // Registered before looking, so an enqueue in between is not missed.
            let wakeup = self.shared.wakeup.notified();
            tokio::pin!(wakeup);
            wakeup.as_mut().enable();

            if let Some(dispatch) = self.shared.take_next() {
                self.run_work(dispatch).await;
                continue;
            }

            if self.shared.config.shutdown_when_queue_empty && self.shared.is_idle() {
                debug!("No pending works found. Shutting down the worker…");
                break;
            }

            let sleep_duration = self.sleep_duration_with_jitter();
            trace!("No pending works found. Polling again in {sleep_duration:?}…");
            tokio::select! {
                () = wakeup => {}
                () = tokio::time::sleep(sleep_duration) => {}
                () = self.shared.shutdown.cancelled() => {}
            }
        }
    }

    async fn run_work(&self, dispatch: Dispatch<Env>) {
        let span = info_span!(
            "work",
            work.id = %dispatch.execution.id(),
            work.name = dispatch.work.name(),
            work.attempt = dispatch.execution.attempt(),
        );

        let result = {
            let env = self.shared.env.clone();
            let work = &dispatch.work;
            let execution = &dispatch.execution;

            let future = with_sentry_transaction(work.name(), || {
                async move {
                    debug!("Running work…");
                    AssertUnwindSafe(work.run(env, execution))
                        .catch_unwind()
                        .await
                        .map_err(|e| try_to_extract_panic_info(&*e))
                        // `Result::flatten` is still unstable
                        .and_then(std::convert::identity)
                }
            });

            future
                .instrument(span.clone())
                .bind_hub(Hub::current())
                .await
        };

        self.shared
            .complete(dispatch, result)
            .instrument(span)
            .await;
    }
}
