//! JSON-RPC 2.0 wire codec and connection

pub mod conn;
pub mod message;

pub use conn::{Conn, ConnError, Handler, ReplyHold};
pub use message::{error_codes, Id, Message, MessageKind, Notification, Request, RpcError};

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::sync::Once;

thread_local! {
    /// Backtrace of the last panic on this thread, taken by the recovery site
    static PANIC_BACKTRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Capture a backtrace for every panic, then defer to the previous hook
pub(crate) fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let backtrace = Backtrace::force_capture().to_string();
            PANIC_BACKTRACE.with(|slot| *slot.borrow_mut() = Some(backtrace));
            previous(info);
        }));
    });
}

/// Best-effort text for a caught panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// A panic recovered at a task boundary
///
/// Must be built on the thread that caught the panic, right after
/// `catch_unwind` returns.
pub(crate) struct CaughtPanic {
    pub(crate) message: String,
    pub(crate) backtrace: String,
}

impl CaughtPanic {
    pub(crate) fn new(payload: &(dyn Any + Send)) -> Self {
        let backtrace = PANIC_BACKTRACE
            .with(|slot| slot.borrow_mut().take())
            .unwrap_or_else(|| "backtrace unavailable".to_string());
        Self {
            message: panic_message(payload),
            backtrace,
        }
    }
}
