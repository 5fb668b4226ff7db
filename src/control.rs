use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use nix::libc;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::Error;

/// Stop pulling new work; drain what is in flight and exit.
pub const SHUTDOWN: u32 = 0b001;
/// Tear down the current connection and return to the connect state.
pub const DISCONNECT: u32 = 0b010;
/// The peer is gone (broken pipe, zero-byte read); set alongside DISCONNECT.
pub const NO_PEER: u32 = 0b100;

static FLAGS: AtomicU32 = AtomicU32::new(0);

pub fn set(bits: u32) {
    FLAGS.fetch_or(bits, Ordering::Release);
}

pub fn clear(bits: u32) {
    FLAGS.fetch_and(!bits, Ordering::Release);
}

pub fn test(bits: u32) -> bool {
    FLAGS.load(Ordering::Acquire) & bits != 0
}

pub fn shutting_down() -> bool {
    test(SHUTDOWN)
}

pub fn disconnected() -> bool {
    test(DISCONNECT)
}

extern "C" fn on_terminate(_: libc::c_int) {
    // Two-step terminate: the first signal requests a graceful drain, the
    // second forces the process out with the shutdown exit code.
    if FLAGS.fetch_or(SHUTDOWN, Ordering::AcqRel) & SHUTDOWN != 0 {
        unsafe { libc::_exit(4) };
    }
}

extern "C" fn on_hangup(_: libc::c_int) {
    FLAGS.fetch_or(DISCONNECT, Ordering::Release);
}

extern "C" fn on_pipe(_: libc::c_int) {
    FLAGS.fetch_or(DISCONNECT | NO_PEER, Ordering::Release);
}

/// Install the process signal dispositions. Handlers only store into the
/// flag word; the engine loops observe the bits at their suspension points.
pub fn install_handlers() -> Result<(), Error> {
    let term = SigAction::new(
        SigHandler::Handler(on_terminate),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let hangup = SigAction::new(
        SigHandler::Handler(on_hangup),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let pipe = SigAction::new(
        SigHandler::Handler(on_pipe),
        SaFlags::empty(),
        SigSet::empty(),
    );

    unsafe {
        sigaction(Signal::SIGTERM, &term)?;
        sigaction(Signal::SIGINT, &term)?;
        sigaction(Signal::SIGHUP, &hangup)?;
        sigaction(Signal::SIGPIPE, &pipe)?;
    }

    Ok(())
}

/// Sleep for `dur`, waking early when a shutdown or disconnect is flagged.
pub fn interruptible_sleep(dur: Duration) {
    let deadline = Instant::now() + dur;
    while !test(SHUTDOWN | DISCONNECT) {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            break;
        }
        std::thread::sleep(left.min(Duration::from_millis(250)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_bits_are_independent() {
        clear(SHUTDOWN | DISCONNECT | NO_PEER);

        assert!(!test(DISCONNECT));
        set(DISCONNECT | NO_PEER);
        assert!(test(DISCONNECT));
        assert!(test(NO_PEER));
        assert!(!shutting_down());

        clear(NO_PEER);
        assert!(test(DISCONNECT));
        assert!(!test(NO_PEER));

        clear(SHUTDOWN | DISCONNECT | NO_PEER);
    }
}
