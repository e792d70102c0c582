//! Cooperative progress reporting and cancellation
//!
//! Long running work polls a [`Progress`] collaborator at natural loop
//! boundaries. A cancel request surfaces as [`Outcome::Canceled`], which is an
//! ordinary return value and not an error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Result of an operation the user can cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Outcome<T> {
    Done(T),
    Canceled,
}

impl<T> Outcome<T> {
    pub fn is_canceled(&self) -> bool {
        matches!(self, Outcome::Canceled)
    }

    pub fn done(self) -> Option<T> {
        match self {
            Outcome::Done(value) => Some(value),
            Outcome::Canceled => None,
        }
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Outcome<U> {
        match self {
            Outcome::Done(value) => Outcome::Done(f(value)),
            Outcome::Canceled => Outcome::Canceled,
        }
    }
}

/// Unwraps `Result<Outcome<T>>`, returning `Ok(Outcome::Canceled)` from the
/// enclosing function on cancellation and propagating errors like `?`.
macro_rules! done {
    ($e:expr) => {
        match $e? {
            $crate::kdb3::Outcome::Done(value) => value,
            $crate::kdb3::Outcome::Canceled => return Ok($crate::kdb3::Outcome::Canceled),
        }
    };
}
pub(crate) use done;


/// Progress collaborator consulted by long operations.
pub trait Progress {
    /// Number of steps of the whole task, at least one.
    fn set_steps(&mut self, steps: u32);

    /// Starts the next step, expecting `ticks` ticks.
    fn next_step(&mut self, ticks: u64, label: &str);

    fn tick_n(&mut self, n: u64);

    fn tick(&mut self) {
        self.tick_n(1);
    }

    fn is_canceled(&self) -> bool;

    /// 0..=100
    fn progress(&self) -> u8;
}


/// Optional progress collaborator as threaded through the pipeline.
///
/// Absent collaborators never cancel.
pub struct Ticker<'a> {
    inner: Option<&'a mut dyn Progress>,
}

impl<'a> Ticker<'a> {
    pub fn new(inner: Option<&'a mut dyn Progress>) -> Self {
        Ticker { inner }
    }

    pub fn none() -> Ticker<'static> {
        Ticker { inner: None }
    }

    pub fn set_steps(&mut self, steps: u32) {
        if let Some(p) = self.inner.as_deref_mut() {
            p.set_steps(steps);
        }
    }

    pub fn next_step(&mut self, ticks: u64, label: &str) {
        if let Some(p) = self.inner.as_deref_mut() {
            p.next_step(ticks, label);
        }
    }

    /// Polls for cancellation, then counts one unit of work.
    pub fn tick(&mut self) -> Outcome<()> {
        match self.inner.as_deref_mut() {
            Some(p) if p.is_canceled() => Outcome::Canceled,
            Some(p) => {
                p.tick();
                Outcome::Done(())
            }
            None => Outcome::Done(()),
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.as_deref().map_or(false, |p| p.is_canceled())
    }
}


/// Handle that cancels a [`ProgressMonitor`] from elsewhere, e.g. a UI thread.
#[derive(Clone, Debug, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Step/tick based progress monitor.
#[derive(Debug)]
pub struct ProgressMonitor {
    step: u32,
    steps: u32,
    tick: u64,
    ticks: u64,
    label: String,
    canceled: CancelHandle,
}

impl Default for ProgressMonitor {
    fn default() -> Self {
        ProgressMonitor::new(1)
    }
}

impl ProgressMonitor {
    pub fn new(steps: u32) -> Self {
        ProgressMonitor {
            step: 0,
            steps: steps.max(1),
            tick: 0,
            ticks: 0,
            label: String::new(),
            canceled: CancelHandle::default(),
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.canceled.clone()
    }

    pub fn cancel(&self) {
        self.canceled.cancel();
    }

    pub fn started(&self) -> bool {
        self.step > 0
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl Progress for ProgressMonitor {
    fn set_steps(&mut self, steps: u32) {
        self.step = 0;
        self.steps = steps.max(1);
    }

    fn next_step(&mut self, ticks: u64, label: &str) {
        self.tick = 0;
        self.ticks = ticks;
        self.step += 1;
        self.label = label.to_string();
    }

    fn tick_n(&mut self, n: u64) {
        self.tick = self.tick.saturating_add(n);
    }

    fn is_canceled(&self) -> bool {
        self.canceled.is_canceled()
    }

    fn progress(&self) -> u8 {
        if self.step == 0 {
            return 0;
        }
        if self.step > self.steps {
            return 100;
        }
        let one_step = 100 / self.steps as u64;
        let ticks_progress = if self.tick < self.ticks { self.tick * 100 / self.ticks } else { 100 };
        ((self.step as u64 - 1) * one_step + ticks_progress * one_step / 100).min(100) as u8
    }
}
