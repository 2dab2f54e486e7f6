//! Process-wide panic capture

use super::event::CapturedException;
use super::handling::{run_previous, ErrorHandling};
use parking_lot::Mutex;
use std::sync::Arc;

/// Capture panics into `errors`, then run whatever hook was installed before.
///
/// A panic raised while `errors` is locked is passed on without capture.
/// The manager's own previous handler runs after the lock is released.
pub fn install_panic_hook(errors: Arc<Mutex<ErrorHandling>>) {
    let previous = std::panic::take_hook();

    std::panic::set_hook(Box::new(move |info| {
        let exception = CapturedException::from_panic(info);
        let chained = errors.try_lock().and_then(|mut handling| {
            handling.capture(&exception);
            handling.previous_handler()
        });

        if let Some(handler) = chained {
            run_previous(&handler, &exception);
        }
        previous(info);
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ConfigKey};
    use crate::errors::PANIC_CLASS;
    use crate::testing::RecordingSink;
    use serde_json::json;

    #[test]
    fn test_panic_is_captured_and_chained() {
        let sink = Arc::new(RecordingSink::new());
        let config = Config::from_pairs([
            (ConfigKey::ErrorsEnabled, json!(true)),
            (ConfigKey::ErrorsBatchSize, json!(100)),
        ]);
        let errors = Arc::new(Mutex::new(ErrorHandling::new(config, sink)));

        // Runs after the hook has released `errors`
        let shared = errors.clone();
        let queued_at_chain = Arc::new(Mutex::new(None));
        let recorder = queued_at_chain.clone();
        errors
            .lock()
            .set_previous_handler(Box::new(move |_: &CapturedException| {
                *recorder.lock() = Some(shared.lock().queued().len());
            }));

        install_panic_hook(errors.clone());
        let result = std::panic::catch_unwind(|| panic!("inventory underflow"));
        // Restore the default hook
        let _ = std::panic::take_hook();

        assert!(result.is_err());
        assert!(queued_at_chain.lock().is_some_and(|n| n >= 1));
        let handling = errors.lock();
        let captured: Vec<_> = handling
            .queued()
            .iter()
            .filter(|event| event.exception.message == "inventory underflow")
            .collect();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].exception.class, PANIC_CLASS);
        assert!(captured[0].exception.frames[0].file.ends_with("panic.rs"));
    }
}
