use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    pub percent: u8,
    pub phrase: String,
}

pub type ProgressSink = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// Caller side of a cancellation signal. Stops local polling and callbacks;
/// a job already queued remotely keeps running.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    sender: Arc<watch::Sender<bool>>,
}

/// Pipeline side of a cancellation signal.
#[derive(Debug, Clone)]
pub struct CancelToken {
    receiver: watch::Receiver<bool>,
}

pub fn cancellation() -> (CancelHandle, CancelToken) {
    let (sender, receiver) = watch::channel(false);
    (
        CancelHandle {
            sender: Arc::new(sender),
        },
        CancelToken { receiver },
    )
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }
}

impl CancelToken {
    /// A token that is never cancelled.
    pub fn never() -> Self {
        cancellation().1
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Sleeps for `duration`; returns `true` if cancelled first.
    pub async fn sleep_or_cancel(&self, duration: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        let mut receiver = self.receiver.clone();
        let sleep = tokio::time::sleep(duration);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return self.is_cancelled(),
                changed = receiver.changed() => match changed {
                    Ok(()) if *receiver.borrow_and_update() => return true,
                    Ok(()) => continue,
                    // handle dropped: nobody can cancel any more
                    Err(_) => {
                        (&mut sleep).await;
                        return false;
                    }
                },
            }
        }
    }
}

/// Forwards progress to the caller, keeping it non-decreasing within a run.
///
/// The only backwards step is the explicit reset to 0% on failure. Nothing is
/// forwarded once the run is cancelled.
pub struct ProgressReporter {
    sink: ProgressSink,
    last: u8,
    cancel: CancelToken,
}

impl ProgressReporter {
    pub fn new(sink: ProgressSink, cancel: CancelToken) -> Self {
        Self {
            sink,
            last: 0,
            cancel,
        }
    }

    pub fn silent() -> Self {
        Self::new(Arc::new(|_| {}), CancelToken::never())
    }

    pub fn last(&self) -> u8 {
        self.last
    }

    pub fn report(&mut self, percent: u8, phrase: &str) {
        if self.cancel.is_cancelled() {
            return;
        }
        let percent = percent.min(100).max(self.last);
        self.last = percent;
        (self.sink)(ProgressEvent {
            percent,
            phrase: phrase.to_string(),
        });
    }

    pub fn fail(&mut self, phrase: &str) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.last = 0;
        (self.sink)(ProgressEvent {
            percent: 0,
            phrase: phrase.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recording() -> (ProgressSink, Arc<Mutex<Vec<ProgressEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink_events = events.clone();
        let sink: ProgressSink = Arc::new(move |event: ProgressEvent| sink_events.lock().unwrap().push(event));
        (sink, events)
    }

    #[test]
    fn test_reports_never_decrease() {
        let (sink, events) = recording();
        let mut reporter = ProgressReporter::new(sink, CancelToken::never());
        reporter.report(20, "queued");
        reporter.report(15, "still queued");
        reporter.report(140, "done");

        let percents: Vec<u8> = events.lock().unwrap().iter().map(|e| e.percent).collect();
        assert_eq!(percents, vec![20, 20, 100]);
    }

    #[test]
    fn test_failure_resets_to_zero() {
        let (sink, events) = recording();
        let mut reporter = ProgressReporter::new(sink, CancelToken::never());
        reporter.report(55, "working");
        reporter.fail("Generation failed");

        let events = events.lock().unwrap();
        assert_eq!(events.last().unwrap().percent, 0);
        assert_eq!(events.last().unwrap().phrase, "Generation failed");
    }

    #[test]
    fn test_cancelled_reporter_is_silent() {
        let (sink, events) = recording();
        let (handle, token) = cancellation();
        let mut reporter = ProgressReporter::new(sink, token);
        reporter.report(10, "submitted");
        handle.cancel();
        reporter.report(50, "working");
        reporter.fail("failed");

        assert_eq!(events.lock().unwrap().len(), 1);
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn test_sleep_or_cancel_wakes_on_cancel() {
        let (handle, token) = cancellation();
        let waiter = tokio::spawn(async move { token.sleep_or_cancel(Duration::from_secs(30)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.cancel();

        let cancelled = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(cancelled);
    }

    #[tokio::test]
    async fn test_never_token_sleeps_full_duration() {
        let token = CancelToken::never();
        assert!(!token.sleep_or_cancel(Duration::from_millis(5)).await);
    }
}
