//! Error batching and threshold flushing

use super::event::{CapturedException, ErrorContext, ErrorEvent, StackFrame};
use crate::command::{ErrorBatch, Payload};
use crate::config::{Config, ConfigKey};
use crate::host::{detect_hostname, detect_revision_sha};
use crate::id::RequestId;
use crate::sink::Sink;
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Class reported for fatal errors recovered at shutdown
pub const FATAL_ERROR_CLASS: &str = "ErrorException";

const DEFAULT_BATCH_SIZE: i64 = 5;

/// Handler that ran before this manager was installed; always invoked after capture
pub type PreviousHandler = Box<dyn FnMut(&CapturedException) + Send>;

/// A [`PreviousHandler`] that can be called without holding the manager's lock
pub type SharedPreviousHandler = Arc<Mutex<PreviousHandler>>;

pub(crate) fn run_previous(handler: &SharedPreviousHandler, exception: &CapturedException) {
    let mut handler = handler.lock();
    (&mut **handler)(exception);
}

/// Severity of the last error seen by the runtime before shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Fatal,
    Parse,
    CoreFatal,
    CompileFatal,
    UserFatal,
    Warning,
    Notice,
    Deprecated,
}

impl ErrorCategory {
    /// Categories that end the process and are reported as errors
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            ErrorCategory::Fatal
                | ErrorCategory::Parse
                | ErrorCategory::CoreFatal
                | ErrorCategory::CompileFatal
                | ErrorCategory::UserFatal
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Fatal => "fatal",
            ErrorCategory::Parse => "parse",
            ErrorCategory::CoreFatal => "core_fatal",
            ErrorCategory::CompileFatal => "compile_fatal",
            ErrorCategory::UserFatal => "user_fatal",
            ErrorCategory::Warning => "warning",
            ErrorCategory::Notice => "notice",
            ErrorCategory::Deprecated => "deprecated",
        }
    }
}

/// Last error recorded by the runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastError {
    pub category: ErrorCategory,
    pub message: String,
    pub file: String,
    pub line: u32,
}

impl LastError {
    /// The exception reported for this error, if its category is fatal
    pub fn to_exception(&self) -> Option<CapturedException> {
        if !self.category.is_fatal() {
            return None;
        }

        Some(
            CapturedException::new(FATAL_ERROR_CLASS, self.message.clone()).with_frames(vec![
                StackFrame::new(self.file.clone(), self.line, self.category.as_str()),
            ]),
        )
    }
}

/// Queues captured exceptions and sends them in batches
pub struct ErrorHandling {
    config: Config,
    sink: Arc<dyn Sink>,
    queue: Vec<ErrorEvent>,
    current_request_id: Option<RequestId>,
    context: ErrorContext,
    previous: Option<SharedPreviousHandler>,
    host: String,
    revision_sha: String,
}

impl ErrorHandling {
    pub fn new(config: Config, sink: Arc<dyn Sink>) -> Self {
        let host = detect_hostname(&config);
        let revision_sha = detect_revision_sha(&config);

        Self {
            config,
            sink,
            queue: Vec::new(),
            current_request_id: None,
            context: ErrorContext::default(),
            previous: None,
            host,
            revision_sha,
        }
    }

    /// Chain to a handler registered before this one
    pub fn with_previous_handler(mut self, handler: PreviousHandler) -> Self {
        self.set_previous_handler(handler);
        self
    }

    pub fn set_previous_handler(&mut self, handler: PreviousHandler) {
        self.previous = Some(Arc::new(Mutex::new(handler)));
    }

    pub fn previous_handler(&self) -> Option<SharedPreviousHandler> {
        self.previous.clone()
    }

    pub fn errors_enabled(&self) -> bool {
        self.config
            .get_as::<bool>(ConfigKey::ErrorsEnabled)
            .unwrap_or(false)
    }

    pub fn is_ignored(&self, class: &str) -> bool {
        self.config
            .get_as::<Vec<String>>(ConfigKey::ErrorsIgnoredExceptions)
            .unwrap_or_default()
            .iter()
            .any(|ignored| ignored == class)
    }

    /// Queue length that triggers a flush, at least 1.
    ///
    /// Numbers and numeric strings are truncated toward zero; anything else
    /// uses the default of 5.
    pub fn batch_threshold(&self) -> usize {
        let size = match self.config.get(ConfigKey::ErrorsBatchSize) {
            Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
            Some(Value::String(s)) => s.trim().parse::<f64>().ok().map(|f| f.trunc() as i64),
            _ => None,
        };

        let size = size.unwrap_or_else(|| {
            debug!("Malformed value for {}, using default", ConfigKey::ErrorsBatchSize.as_str());
            DEFAULT_BATCH_SIZE
        });
        usize::try_from(size).unwrap_or(0).max(1)
    }

    pub fn set_current_request_id(&mut self, request_id: Option<RequestId>) {
        self.current_request_id = request_id;
    }

    pub fn set_request_context(&mut self, context: ErrorContext) {
        self.context = context;
    }

    pub fn queued(&self) -> &[ErrorEvent] {
        &self.queue
    }

    /// Capture `exception` and then chain to the previous handler
    pub fn handle_exception(&mut self, exception: CapturedException) {
        self.capture(&exception);

        if let Some(previous) = &self.previous {
            run_previous(previous, &exception);
        }
    }

    /// Queue `exception` unless errors are off or its class is ignored,
    /// flushing once the threshold is reached. Does not chain.
    pub fn capture(&mut self, exception: &CapturedException) {
        if self.errors_enabled() && !self.is_ignored(&exception.class) {
            self.queue.push(ErrorEvent {
                exception: exception.clone(),
                request_id: self.current_request_id.clone(),
                context: self.context.clone(),
                host: self.host.clone(),
                revision_sha: self.revision_sha.clone(),
            });

            if self.queue.len() >= self.batch_threshold() {
                self.flush();
            }
        } else {
            debug!(class = %exception.class, "Exception not captured");
        }
    }

    /// Report the runtime's last error at shutdown if it was fatal
    pub fn handle_uncaught_fatal(&mut self, last_error: Option<&LastError>) {
        if !self.errors_enabled() {
            return;
        }

        if let Some(exception) = last_error.and_then(LastError::to_exception) {
            self.handle_exception(exception);
        }
    }

    /// Send everything queued as one batch. Failures are logged and the
    /// batch is dropped.
    pub fn flush(&mut self) {
        if !self.errors_enabled() || self.queue.is_empty() {
            return;
        }

        let problems = self.queue.drain(..).map(|event| event.to_record()).collect();
        let payload = Payload::ErrorBatch(ErrorBatch { problems });

        match self.sink.send(&payload) {
            Ok(()) => debug!(sink = self.sink.name(), count = payload.len(), "Sent error batch"),
            Err(e) => warn!(
                sink = self.sink.name(),
                count = payload.len(),
                "Failed to send error batch: {}",
                e
            ),
        }
    }
}

impl fmt::Debug for ErrorHandling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorHandling")
            .field("sink", &self.sink.name())
            .field("queued", &self.queue.len())
            .field("current_request_id", &self.current_request_id)
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}
