//! Scoped Ctrl-C handling.
//!
//! While an [`InterruptScope`] is alive, SIGINT cancels a
//! [`CancellationToken`] instead of killing the process, so running builds
//! are terminated and nothing half-written is left behind. A second SIGINT
//! exits immediately. Dropping the scope restores the previous handler and
//! signal mask, whichever way the scope is left.
//!
//! Scopes may nest or overlap. The handler only counts signals; each scope
//! remembers the count it started from.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// SIGINTs received while any scope was installed.
static SIGNALS: AtomicU64 = AtomicU64::new(0);
/// [`SIGNALS`] when the innermost live scope was installed.
static INNERMOST: AtomicU64 = AtomicU64::new(0);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum SignalError {
  #[error("failed to install interrupt handler: {0}")]
  Install(String),
}

#[derive(Debug)]
pub struct InterruptScope {
  baseline: u64,
  outer: u64,
  #[cfg(unix)]
  previous: unix::Saved,
  watcher: JoinHandle<()>,
}

impl InterruptScope {
  /// Route SIGINT to `token`. Must be called within a tokio runtime, and
  /// dropped on the thread that created it.
  pub fn install(token: CancellationToken) -> Result<Self, SignalError> {
    #[cfg(unix)]
    let previous = unix::install()?;

    let baseline = SIGNALS.load(Ordering::SeqCst);
    let outer = INNERMOST.swap(baseline, Ordering::SeqCst);
    let watcher = tokio::spawn(watch(token, baseline));
    debug!(baseline, "interrupt handler installed");

    Ok(Self {
      baseline,
      outer,
      #[cfg(unix)]
      previous,
      watcher,
    })
  }

  /// Whether SIGINT arrived while this scope was alive.
  pub fn interrupted(&self) -> bool {
    SIGNALS.load(Ordering::SeqCst) > self.baseline
  }
}

impl Drop for InterruptScope {
  fn drop(&mut self) {
    self.watcher.abort();
    INNERMOST.store(self.outer, Ordering::SeqCst);
    #[cfg(unix)]
    unix::restore(&self.previous);
    debug!("interrupt handler restored");
  }
}

async fn watch(token: CancellationToken, baseline: u64) {
  let mut tick = tokio::time::interval(POLL_INTERVAL);
  loop {
    tick.tick().await;
    if SIGNALS.load(Ordering::SeqCst) > baseline {
      warn!("interrupted, stopping builds (press Ctrl-C again to exit now)");
      token.cancel();
      return;
    }
  }
}

#[cfg(unix)]
mod unix {
  use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal, pthread_sigmask, sigaction};

  use std::sync::atomic::Ordering;

  use super::{INNERMOST, SIGNALS, SignalError};

  #[derive(Debug)]
  pub(super) struct Saved {
    action: SigAction,
    mask: SigSet,
  }

  extern "C" fn on_interrupt(_signal: nix::libc::c_int) {
    let count = SIGNALS.fetch_add(1, Ordering::SeqCst) + 1;
    if count.saturating_sub(INNERMOST.load(Ordering::SeqCst)) >= 2 {
      // SAFETY: _exit is async-signal-safe.
      unsafe { nix::libc::_exit(130) };
    }
  }

  pub(super) fn install() -> Result<Saved, SignalError> {
    let action = SigAction::new(SigHandler::Handler(on_interrupt), SaFlags::SA_RESTART, SigSet::empty());
    // SAFETY: the handler only touches atomics or calls _exit.
    let previous = unsafe { sigaction(Signal::SIGINT, &action) }.map_err(|e| SignalError::Install(e.to_string()))?;

    let mut unblock = SigSet::empty();
    unblock.add(Signal::SIGINT);
    let mut mask = SigSet::empty();
    if let Err(e) = pthread_sigmask(SigmaskHow::SIG_UNBLOCK, Some(&unblock), Some(&mut mask)) {
      // SAFETY: reinstating the disposition we just replaced.
      let _ = unsafe { sigaction(Signal::SIGINT, &previous) };
      return Err(SignalError::Install(e.to_string()));
    }

    Ok(Saved {
      action: previous,
      mask,
    })
  }

  pub(super) fn restore(saved: &Saved) {
    // SAFETY: reinstating a disposition previously returned by sigaction.
    let _ = unsafe { sigaction(Signal::SIGINT, &saved.action) };
    let _ = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&saved.mask), None);
  }
}
