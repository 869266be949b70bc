//! Panic logging and containment
//!
//! The sidecar runs callbacks it does not own (notification handlers,
//! event handlers). A panic in one of them must not take down the reader
//! task or the process:
//! - `install_panic_hook()` routes every panic through `tracing` before the
//!   default hook prints it
//! - `contain()` runs a callback and turns a panic into a logged error

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use tracing::error;

/// Log panics through tracing, then delegate to the default hook
///
/// Unlike a crash handler this does not exit: a panicking tokio task is
/// torn down on its own and the rest of the sidecar keeps running.
pub fn install_panic_hook() {
    let default_hook = panic::take_hook();

    panic::set_hook(Box::new(move |info| {
        let location = info
            .location()
            .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
            .unwrap_or_else(|| "<unknown location>".to_string());

        error!(
            location = %location,
            message = %panic_message(info.payload()),
            "PANIC"
        );

        default_hook(info);
    }));

    tracing::info!("Panic hook installed");
}

/// Best-effort text of a panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<no message>".to_string()
    }
}

/// Run `f`, logging instead of unwinding if it panics; true if it returned
pub fn contain<F: FnOnce()>(what: &str, f: F) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(payload) => {
            error!(
                callback = what,
                message = %panic_message(payload.as_ref()),
                "callback panicked"
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contain_swallows_panic() {
        assert!(contain("ok", || {}));
        assert!(!contain("boom", || panic!("handler exploded")));
    }

    #[test]
    fn test_panic_message_variants() {
        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(payload.as_ref()), "static");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "<no message>");
    }

    #[test]
    fn test_hook_installs_twice() {
        install_panic_hook();
        install_panic_hook();
    }
}
