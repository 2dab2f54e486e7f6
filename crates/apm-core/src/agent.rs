//! Agent facade tying the request tree, error handling and sink together
//!
//! One [`Agent`] serves one unit of work at a time. [`Agent::send`] closes
//! the current request, ships it, and immediately starts the next one so
//! instrumentation never sees a missing request.

use crate::clock::{Clock, SystemClock};
use crate::command::{Payload, TagValue};
use crate::config::{Config, ConfigKey};
use crate::errors::{
    install_panic_hook, run_previous, CapturedException, ErrorContext, ErrorHandling, LastError,
    PreviousHandler,
};
use crate::memory::{MemorySampler, ProcessMemory};
use crate::metadata::RequestMetadata;
use crate::request::{Request, SpanIndex, TraceResult};
use crate::sink::Sink;
use crate::uri::UriSettings;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct Agent {
    config: Config,
    sink: Arc<dyn Sink>,
    clock: Arc<dyn Clock>,
    memory: Arc<dyn MemorySampler>,
    uri_settings: UriSettings,
    request: Request,
    ignored: bool,
    errors: Arc<Mutex<ErrorHandling>>,
}

impl Agent {
    pub fn new(config: Config, sink: Arc<dyn Sink>) -> Self {
        Self::with_sources(config, sink, Arc::new(SystemClock), Arc::new(ProcessMemory))
    }

    pub fn with_sources(
        config: Config,
        sink: Arc<dyn Sink>,
        clock: Arc<dyn Clock>,
        memory: Arc<dyn MemorySampler>,
    ) -> Self {
        let uri_settings = UriSettings::from_config(&config);
        let request =
            Request::with_sources(uri_settings.clone(), clock.clone(), memory.clone(), None);

        let mut errors = ErrorHandling::new(config.clone(), sink.clone());
        errors.set_current_request_id(Some(request.id().clone()));

        info!(
            sink = sink.name(),
            monitor = config.get_as::<bool>(ConfigKey::Monitor).unwrap_or(false),
            "APM agent started"
        );

        Self {
            config,
            sink,
            clock,
            memory,
            uri_settings,
            request,
            ignored: false,
            errors: Arc::new(Mutex::new(errors)),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Whether requests are sent at all (`monitor`)
    pub fn enabled(&self) -> bool {
        self.config
            .get_as::<bool>(ConfigKey::Monitor)
            .unwrap_or(false)
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut Request {
        &mut self.request
    }

    pub fn start_span(&mut self, operation: &str, leaf: bool) -> TraceResult<SpanIndex> {
        self.request.start_span(operation, None, leaf)
    }

    pub fn stop_span(&mut self) {
        self.request.stop_span(None);
    }

    pub fn tag_request(&mut self, name: impl Into<String>, value: impl Into<TagValue>) {
        self.request.tag(name, value);
    }

    pub fn set_request_metadata(&mut self, metadata: RequestMetadata) {
        self.request.attach_metadata(metadata);
    }

    /// Drop the current request instead of sending it
    pub fn ignore(&mut self) {
        self.ignored = true;
    }

    pub fn is_ignored(&self) -> bool {
        self.ignored
    }

    /// Whether `path` starts with one of the configured `ignore` prefixes
    pub fn should_ignore(&self, path: &str) -> bool {
        self.config
            .get_or_default::<Vec<String>>(ConfigKey::Ignore)
            .unwrap_or_default()
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// Finish the current request and hand it to the sink along with any
    /// queued errors, then start a new one. Returns whether the request's
    /// batch was sent.
    pub fn send(&mut self) -> bool {
        self.request.stop_if_running(None);

        let sent = if !self.enabled() {
            debug!(request_id = %self.request.id(), "Monitoring disabled, dropping request");
            false
        } else if self.ignored {
            debug!(request_id = %self.request.id(), "Request ignored, not sending");
            false
        } else {
            let payload = Payload::BatchCommand(self.request.render());
            match self.sink.send(&payload) {
                Ok(()) => {
                    debug!(
                        request_id = %self.request.id(),
                        commands = payload.len(),
                        "Sent request"
                    );
                    true
                }
                Err(e) => {
                    warn!(sink = self.sink.name(), "Failed to send request: {}", e);
                    false
                }
            }
        };

        self.errors.lock().flush();
        self.request.release();
        self.start_next_request();
        sent
    }

    fn start_next_request(&mut self) {
        self.request = Request::with_sources(
            self.uri_settings.clone(),
            self.clock.clone(),
            self.memory.clone(),
            None,
        );
        self.ignored = false;

        let mut errors = self.errors.lock();
        errors.set_current_request_id(Some(self.request.id().clone()));
        errors.set_request_context(ErrorContext::default());
    }

    /// Capture an exception against the current request
    pub fn handle_exception(&mut self, exception: CapturedException) {
        let context = ErrorContext::from_request(&self.request);
        self.capture_and_chain(exception, Some(context));
    }

    /// Handler to run after every captured exception. It is called without
    /// the error manager locked, so it may use [`Agent::error_handling`].
    pub fn set_previous_handler(&self, handler: PreviousHandler) {
        self.errors.lock().set_previous_handler(handler);
    }

    fn capture_and_chain(&self, exception: CapturedException, context: Option<ErrorContext>) {
        let previous = {
            let mut errors = self.errors.lock();
            if let Some(context) = context {
                errors.set_request_context(context);
            }
            errors.capture(&exception);
            errors.previous_handler()
        };

        if let Some(handler) = previous {
            run_previous(&handler, &exception);
        }
    }

    /// Shared error manager, e.g. for [`install_panic_hook`]
    pub fn error_handling(&self) -> Arc<Mutex<ErrorHandling>> {
        self.errors.clone()
    }

    /// Route panics anywhere in the process into this agent's error manager
    pub fn install_panic_hook(&self) {
        install_panic_hook(self.errors.clone());
    }

    /// Report a fatal last error, if any, and flush queued errors
    pub fn shutdown(&mut self, last_error: Option<&LastError>) {
        let enabled = self.errors.lock().errors_enabled();
        if let Some(exception) = last_error.and_then(LastError::to_exception).filter(|_| enabled) {
            self.capture_and_chain(exception, None);
        }

        self.errors.lock().flush();
        info!("APM agent shut down");
    }
}
