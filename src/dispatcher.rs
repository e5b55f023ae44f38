// dispatcher.rs: Runs one capture → encode → inference exchange per
// authorized dispatch and posts the outcome back to the scheduling loop.

use std::sync::Arc;
use std::time::Duration;

use image::DynamicImage;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::ai::{AiError, AiProvider, OverlayUpdate};
use crate::capture::encode::{EncodeError, FrameEncoder};
use crate::lock::DispatchToken;

/// Outcome of one exchange, delivered through the scheduler's inbox.
#[derive(Debug)]
pub enum Completion {
    Result {
        token: DispatchToken,
        update: OverlayUpdate,
    },
    Failed {
        token: DispatchToken,
        error: AiError,
    },
    EncodeFailed {
        token: DispatchToken,
        error: EncodeError,
    },
}

impl Completion {
    pub fn token(&self) -> DispatchToken {
        match self {
            Completion::Result { token, .. }
            | Completion::Failed { token, .. }
            | Completion::EncodeFailed { token, .. } => *token,
        }
    }
}

pub type CompletionTx = mpsc::UnboundedSender<Completion>;
pub type CompletionRx = mpsc::UnboundedReceiver<Completion>;

pub struct CaptureDispatcher {
    encoder: Arc<dyn FrameEncoder>,
    provider: Arc<dyn AiProvider>,
    analysis_width: u32,
    /// Upper bound on one provider call, so an abandoned request cannot
    /// hold a backend connection forever.
    request_timeout: Duration,
    inbox: CompletionTx,
    /// Exchanges still running: the current one plus at most one abandoned
    /// at the failsafe deadline, kept so its late result can be merged.
    tasks: Vec<(DispatchToken, JoinHandle<()>)>,
}

impl CaptureDispatcher {
    pub fn new(
        encoder: Arc<dyn FrameEncoder>,
        provider: Arc<dyn AiProvider>,
        analysis_width: u32,
        request_timeout: Duration,
        inbox: CompletionTx,
    ) -> Self {
        Self {
            encoder,
            provider,
            analysis_width,
            request_timeout,
            inbox,
            tasks: Vec::new(),
        }
    }

    /// Encode `frame` and send it for analysis on a background task.
    /// Exactly one `Completion` for `token` is posted unless the exchange is
    /// aborted first.
    ///
    /// Any exchange still running here was abandoned by the scheduler. The
    /// newest of those may linger for its late result; older ones are
    /// aborted.
    pub fn dispatch(&mut self, token: DispatchToken, frame: DynamicImage, system_prompt: String) {
        self.tasks.retain(|(_, handle)| !handle.is_finished());
        let stale = self.tasks.len().saturating_sub(1);
        for (old, handle) in self.tasks.drain(..stale) {
            log::info!("Aborting abandoned request {}", old);
            handle.abort();
        }

        let encoder = Arc::clone(&self.encoder);
        let provider = Arc::clone(&self.provider);
        let inbox = self.inbox.clone();
        let width = self.analysis_width;
        let timeout = self.request_timeout;

        log::info!(
            "Dispatching {} ({}x{} -> {}px) to {}",
            token,
            frame.width(),
            frame.height(),
            width,
            provider.name()
        );

        let handle = tokio::spawn(async move {
            let completion = match encoder.encode(&frame, width).await {
                Ok(payload) if payload.data.is_empty() => Completion::EncodeFailed {
                    token,
                    error: EncodeError::EmptyPayload,
                },
                Err(error) => Completion::EncodeFailed { token, error },
                Ok(payload) => {
                    log::debug!("{} encoded to {} bytes", token, payload.byte_len);
                    let call = provider.analyze_frame(&payload, &system_prompt);
                    match tokio::time::timeout(timeout, call).await {
                        Ok(Ok(update)) => Completion::Result { token, update },
                        Ok(Err(error)) => Completion::Failed { token, error },
                        Err(_) => Completion::Failed {
                            token,
                            error: AiError::ConnectionError(format!(
                                "no reply within {:?}",
                                timeout
                            )),
                        },
                    }
                }
            };
            // The loop may already be gone; nothing to deliver to then.
            let _ = inbox.send(completion);
        });

        self.tasks.push((token, handle));
    }

    /// Abort every running exchange. Their completions are never posted.
    pub fn abandon(&mut self) {
        for (token, handle) in self.tasks.drain(..) {
            if !handle.is_finished() {
                log::info!("Abandoning in-flight request {}", token);
                handle.abort();
            }
        }
    }

    /// Number of exchanges that have not finished yet.
    pub fn running(&self) -> usize {
        self.tasks.iter().filter(|(_, h)| !h.is_finished()).count()
    }
}

impl Drop for CaptureDispatcher {
    fn drop(&mut self) {
        self.abandon();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::encode::EncodedFrame;
    use async_trait::async_trait;
    use image::RgbImage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedEncoder {
        fail: bool,
    }

    #[async_trait]
    impl FrameEncoder for FixedEncoder {
        async fn encode(&self, _frame: &DynamicImage, width: u32) -> Result<EncodedFrame, EncodeError> {
            if self.fail {
                return Err(EncodeError::EmptyFrame);
            }
            Ok(EncodedFrame {
                data: "aGVsbG8=".into(),
                width,
                height: width / 2,
                byte_len: 5,
            })
        }
    }

    struct EchoProvider {
        calls: AtomicUsize,
        hang: bool,
    }

    #[async_trait]
    impl AiProvider for EchoProvider {
        async fn analyze_frame(
            &self,
            frame: &EncodedFrame,
            system_prompt: &str,
        ) -> Result<OverlayUpdate, AiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                std::future::pending::<()>().await;
            }
            if system_prompt == "fail" {
                return Err(AiError::ModelError("nope".into()));
            }
            Ok(OverlayUpdate {
                object_count: Some(frame.width),
                ..Default::default()
            })
        }

        fn name(&self) -> &str {
            "echo"
        }
    }

    fn frame() -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::new(64, 32))
    }

    fn setup(fail_encode: bool, hang: bool) -> (CaptureDispatcher, CompletionRx, Arc<EchoProvider>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let provider = Arc::new(EchoProvider {
            calls: AtomicUsize::new(0),
            hang,
        });
        let dispatcher = CaptureDispatcher::new(
            Arc::new(FixedEncoder { fail: fail_encode }),
            provider.clone(),
            320,
            Duration::from_secs(16),
            tx,
        );
        (dispatcher, rx, provider)
    }

    fn token(id: u64) -> DispatchToken {
        DispatchToken::from_raw(id)
    }

    #[tokio::test]
    async fn result_is_posted_with_token() {
        let (mut d, mut rx, provider) = setup(false, false);
        let tok = token(1);
        d.dispatch(tok, frame(), "describe".into());

        match rx.recv().await.unwrap() {
            Completion::Result { token, update } => {
                assert_eq!(token, tok);
                assert_eq!(update.object_count, Some(320));
            }
            other => panic!("expected Result, got {:?}", other),
        }
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn provider_error_is_posted() {
        let (mut d, mut rx, _) = setup(false, false);
        d.dispatch(token(1), frame(), "fail".into());
        assert!(matches!(
            rx.recv().await.unwrap(),
            Completion::Failed { error: AiError::ModelError(_), .. }
        ));
    }

    #[tokio::test]
    async fn encode_failure_skips_provider() {
        let (mut d, mut rx, provider) = setup(true, false);
        d.dispatch(token(1), frame(), "describe".into());
        assert!(matches!(rx.recv().await.unwrap(), Completion::EncodeFailed { .. }));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn abandon_aborts_running_exchange() {
        let (mut d, mut rx, provider) = setup(false, true);
        d.dispatch(token(1), frame(), "describe".into());

        // Let the task reach the provider.
        while provider.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(d.running(), 1);

        d.abandon();
        tokio::task::yield_now().await;
        assert_eq!(d.running(), 0);
        drop(d);
        assert!(rx.recv().await.is_none(), "aborted exchange must not post");
    }

    #[tokio::test]
    async fn only_newest_abandoned_exchange_survives_a_dispatch() {
        let (mut d, _rx, provider) = setup(false, true);
        for id in 1..=3 {
            d.dispatch(token(id), frame(), "describe".into());
            while provider.calls.load(Ordering::SeqCst) < id as usize {
                tokio::task::yield_now().await;
            }
        }
        tokio::task::yield_now().await;

        // #3 is current, #2 may still answer late, #1 was aborted.
        assert_eq!(d.running(), 2);
        let live: Vec<u64> = d.tasks.iter().map(|(t, _)| t.id()).collect();
        assert_eq!(live, vec![2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_provider_call_times_out() {
        let (mut d, mut rx, _) = setup(false, true);
        d.dispatch(token(7), frame(), "describe".into());

        match rx.recv().await.unwrap() {
            Completion::Failed { token: tok, error: AiError::ConnectionError(msg) } => {
                assert_eq!(tok, token(7));
                assert!(msg.contains("no reply"));
            }
            other => panic!("expected timeout failure, got {:?}", other),
        }
        tokio::task::yield_now().await;
        assert_eq!(d.running(), 0);
    }
}
