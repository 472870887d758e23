// SPDX-License-Identifier: GPL-3.0-only

use std::{fmt, sync::Arc};
use tracing::{debug, warn};

use super::{
    error::KmsError,
    kernel::FlipEvent,
    resources::{Crtc, DeviceId},
    thread::{CallbackContext, Callbacks},
};

/// Kernel timing of a completed flip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlipTimings {
    pub sequence: u32,
    pub tv_sec: u32,
    pub tv_usec: u32,
}

impl From<&FlipEvent> for FlipTimings {
    fn from(event: &FlipEvent) -> Self {
        FlipTimings {
            sequence: event.sequence,
            tv_sec: event.tv_sec,
            tv_usec: event.tv_usec,
        }
    }
}

/// Receives the outcome of a page flip.
///
/// Exactly one method is called per registration, on the callback context
/// the listener was registered with.
pub trait PageFlipListener: Send + Sync {
    /// The kernel presented the new content
    fn flipped(&self, crtc: &Crtc, timings: FlipTimings);

    /// Nothing needed to be flipped; the update took effect immediately
    fn ready(&self, crtc: &Crtc);

    /// The flip was replaced by a full mode set
    fn mode_set_fallback(&self, crtc: &Crtc);

    /// The flip never happened. No error means it was cancelled.
    fn discarded(&self, crtc: &Crtc, error: Option<&KmsError>);
}

#[derive(Clone)]
enum Outcome {
    Flipped(FlipTimings),
    Ready,
    ModeSetFallback,
    Discarded(Option<KmsError>),
}

/// Listeners interested in one in-flight flip of one CRTC.
///
/// Completing consumes the data, so a flip cannot complete twice. Dropping
/// it without completing discards all listeners.
pub struct PageFlipData {
    device: DeviceId,
    crtc: Arc<Crtc>,
    listeners: Vec<(Arc<dyn PageFlipListener>, CallbackContext)>,
    timings: Option<FlipTimings>,
    symbolic: bool,
    callbacks: Callbacks,
}

impl PageFlipData {
    pub fn new(crtc: Arc<Crtc>, callbacks: Callbacks) -> Self {
        PageFlipData {
            device: crtc.device(),
            crtc,
            listeners: Vec::new(),
            timings: None,
            symbolic: false,
            callbacks,
        }
    }

    pub fn add_listener(&mut self, listener: Arc<dyn PageFlipListener>, ctx: CallbackContext) {
        self.listeners.push((listener, ctx));
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn crtc(&self) -> &Arc<Crtc> {
        &self.crtc
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Mark as completing without a kernel flip
    pub fn make_symbolic(&mut self) {
        self.symbolic = true;
    }

    pub fn is_symbolic(&self) -> bool {
        self.symbolic
    }

    pub fn set_timings(&mut self, event: &FlipEvent) {
        self.timings = Some(FlipTimings::from(event));
    }

    pub fn timings(&self) -> Option<FlipTimings> {
        self.timings
    }

    pub fn flipped(mut self) {
        let outcome = if self.symbolic {
            Outcome::Ready
        } else {
            Outcome::Flipped(self.timings.unwrap_or_default())
        };
        self.deliver(outcome);
    }

    pub fn mode_set_fallback(mut self) {
        self.deliver(Outcome::ModeSetFallback);
    }

    pub fn discard(mut self, error: Option<KmsError>) {
        self.deliver(Outcome::Discarded(error));
    }

    fn deliver(&mut self, outcome: Outcome) {
        for (listener, ctx) in self.listeners.drain(..) {
            let crtc = self.crtc.clone();
            let outcome = outcome.clone();
            self.callbacks.queue(ctx, move || match outcome {
                Outcome::Flipped(timings) => listener.flipped(&crtc, timings),
                Outcome::Ready => listener.ready(&crtc),
                Outcome::ModeSetFallback => listener.mode_set_fallback(&crtc),
                Outcome::Discarded(error) => listener.discarded(&crtc, error.as_ref()),
            });
        }
    }
}

impl Drop for PageFlipData {
    fn drop(&mut self) {
        if !self.listeners.is_empty() {
            debug!(crtc = self.crtc.id(), "Discarding unfinished page flip");
            self.deliver(Outcome::Discarded(None));
        }
    }
}

impl fmt::Debug for PageFlipData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageFlipData")
            .field("device", &self.device)
            .field("crtc", &self.crtc.id())
            .field("listeners", &self.listeners.len())
            .field("symbolic", &self.symbolic)
            .finish()
    }
}

/// Warn when more than one flip is pending for a CRTC, which the kernel
/// would have rejected
pub fn warn_if_duplicate(datas: &[PageFlipData], crtc: &Crtc) {
    let count = datas.iter().filter(|data| data.crtc.id() == crtc.id()).count();
    if count > 1 {
        warn!(crtc = crtc.id(), count, "Multiple page flips pending");
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Delivered {
        Flipped(u32, FlipTimings),
        Ready(u32),
        ModeSetFallback(u32),
        Discarded(u32, Option<KmsError>),
    }

    /// Records every outcome it receives
    #[derive(Default)]
    pub struct RecordingListener {
        pub log: Mutex<Vec<Delivered>>,
    }

    impl RecordingListener {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn delivered(&self) -> Vec<Delivered> {
            self.log.lock().unwrap().clone()
        }
    }

    impl PageFlipListener for RecordingListener {
        fn flipped(&self, crtc: &Crtc, timings: FlipTimings) {
            self.log.lock().unwrap().push(Delivered::Flipped(crtc.id(), timings));
        }

        fn ready(&self, crtc: &Crtc) {
            self.log.lock().unwrap().push(Delivered::Ready(crtc.id()));
        }

        fn mode_set_fallback(&self, crtc: &Crtc) {
            self.log.lock().unwrap().push(Delivered::ModeSetFallback(crtc.id()));
        }

        fn discarded(&self, crtc: &Crtc, error: Option<&KmsError>) {
            self.log
                .lock()
                .unwrap()
                .push(Delivered::Discarded(crtc.id(), error.cloned()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{testing::*, *};
    use crate::backend::kms::{
        kernel::mock::MockResources,
        resources::{DeviceId, DeviceResources},
    };

    fn crtc() -> Arc<Crtc> {
        let res = DeviceResources::from_raw(DeviceId(0), &MockResources::single_output().build());
        res.crtcs[0].clone()
    }

    #[test]
    fn every_listener_gets_one_outcome_on_its_context() {
        let callbacks = Callbacks::new();
        let other = callbacks.register();
        let a = RecordingListener::new();
        let b = RecordingListener::new();

        let mut data = PageFlipData::new(crtc(), callbacks.clone());
        data.add_listener(a.clone(), CallbackContext::MAIN);
        data.add_listener(b.clone(), other);
        data.set_timings(&FlipEvent {
            crtc_id: 41,
            sequence: 7,
            tv_sec: 1,
            tv_usec: 2,
        });
        data.flipped();

        assert!(a.delivered().is_empty());
        assert_eq!(callbacks.dispatch(CallbackContext::MAIN), 1);
        assert!(b.delivered().is_empty());
        assert_eq!(callbacks.dispatch(other), 1);

        let timings = FlipTimings {
            sequence: 7,
            tv_sec: 1,
            tv_usec: 2,
        };
        assert_eq!(a.delivered(), vec![Delivered::Flipped(41, timings)]);
        assert_eq!(b.delivered(), vec![Delivered::Flipped(41, timings)]);
    }

    #[test]
    fn symbolic_flip_reports_ready() {
        let callbacks = Callbacks::new();
        let listener = RecordingListener::new();
        let mut data = PageFlipData::new(crtc(), callbacks.clone());
        data.add_listener(listener.clone(), CallbackContext::MAIN);
        data.make_symbolic();
        data.flipped();
        callbacks.dispatch(CallbackContext::MAIN);
        assert_eq!(listener.delivered(), vec![Delivered::Ready(41)]);
    }

    #[test]
    fn dropping_unfinished_flip_discards_without_error() {
        let callbacks = Callbacks::new();
        let listener = RecordingListener::new();
        let mut data = PageFlipData::new(crtc(), callbacks.clone());
        data.add_listener(listener.clone(), CallbackContext::MAIN);
        drop(data);
        callbacks.dispatch(CallbackContext::MAIN);
        assert_eq!(listener.delivered(), vec![Delivered::Discarded(41, None)]);
    }

    #[test]
    fn discard_carries_error() {
        let callbacks = Callbacks::new();
        let listener = RecordingListener::new();
        let mut data = PageFlipData::new(crtc(), callbacks.clone());
        data.add_listener(listener.clone(), CallbackContext::MAIN);
        data.discard(Some(KmsError::failed("boom")));
        callbacks.dispatch(CallbackContext::MAIN);
        assert_eq!(
            listener.delivered(),
            vec![Delivered::Discarded(41, Some(KmsError::failed("boom")))]
        );
    }
}
