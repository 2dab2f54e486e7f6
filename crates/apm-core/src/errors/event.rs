//! Captured exceptions and the error events built from them

use crate::id::RequestId;
use crate::request::Request;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::any::type_name;
use std::panic::PanicHookInfo;

const UNKNOWN_MODULE: &str = "UnknownModule";
const UNKNOWN_CONTROLLER: &str = "UnknownController";
const UNKNOWN_ACTION: &str = "UnknownAction";
const CONTROLLER_PREFIX: &str = "Controller/";

/// Class reported for panics
pub const PANIC_CLASS: &str = "Panic";

/// One resolved stack frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub file: String,
    pub line: u32,
    pub function: String,
}

impl StackFrame {
    pub fn new(file: impl Into<String>, line: u32, function: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            line,
            function: function.into(),
        }
    }

    /// `file:line:in `function``
    pub fn to_trace_line(&self) -> String {
        format!("{}:{}:in `{}`", self.file, self.line, self.function)
    }
}

/// An error or panic, reduced to what the collector needs
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedException {
    pub class: String,
    pub message: String,
    pub frames: Vec<StackFrame>,
}

impl CapturedException {
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
            frames: Vec::new(),
        }
    }

    pub fn with_frames(mut self, frames: Vec<StackFrame>) -> Self {
        self.frames = frames;
        self
    }

    /// Capture with the current call stack
    pub fn capture(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(class, message).with_frames(current_frames())
    }

    /// Capture an error value; the class is the error's type name
    pub fn from_error<E>(error: &E) -> Self
    where
        E: std::error::Error + ?Sized,
    {
        Self::capture(short_type_name::<E>(), error.to_string())
    }

    /// Capture a panic from inside a panic hook
    pub fn from_panic(info: &PanicHookInfo<'_>) -> Self {
        let payload = info.payload();
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "Box<dyn Any>".to_string());

        let mut frames = Vec::new();
        if let Some(location) = info.location() {
            frames.push(StackFrame::new(location.file(), location.line(), "panic"));
        }
        frames.extend(current_frames());

        Self::new(PANIC_CLASS, message).with_frames(frames)
    }

    pub fn trace(&self) -> Vec<String> {
        self.frames.iter().map(StackFrame::to_trace_line).collect()
    }
}

fn short_type_name<T: ?Sized>() -> &'static str {
    let full = type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

fn current_frames() -> Vec<StackFrame> {
    let backtrace = backtrace::Backtrace::new();

    backtrace
        .frames()
        .iter()
        .flat_map(|frame| frame.symbols())
        .filter_map(|symbol| {
            let function = format!("{:#}", symbol.name()?);
            if function.starts_with("backtrace::")
                || function.contains("CapturedException")
                || function.contains("current_frames")
            {
                return None;
            }

            let file = symbol
                .filename()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "[unknown]".to_string());

            Some(StackFrame::new(file, symbol.lineno().unwrap_or(0), function))
        })
        .collect()
}

/// Module/controller/action the failing request was routed to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestComponents {
    pub module: String,
    pub controller: String,
    pub action: String,
}

impl Default for RequestComponents {
    fn default() -> Self {
        Self {
            module: UNKNOWN_MODULE.to_string(),
            controller: UNKNOWN_CONTROLLER.to_string(),
            action: UNKNOWN_ACTION.to_string(),
        }
    }
}

impl RequestComponents {
    /// Derive from a `Controller/<action>` span operation
    pub fn from_operation(operation: Option<&str>) -> Self {
        match operation.and_then(|op| op.strip_prefix(CONTROLLER_PREFIX)) {
            Some(action) => Self {
                module: UNKNOWN_MODULE.to_string(),
                controller: "Controller".to_string(),
                action: action.to_string(),
            },
            None => Self::default(),
        }
    }
}

/// Snapshot of the request an error happened in
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorContext {
    pub request_uri: String,
    pub params: Map<String, Value>,
    pub session: Map<String, Value>,
    pub environment: Map<String, Value>,
    pub components: RequestComponents,
    pub context: Map<String, Value>,
}

impl ErrorContext {
    pub fn from_request(request: &Request) -> Self {
        let metadata = request.metadata();

        let context = request
            .tags()
            .map(|tag| (tag.name.clone(), tag.value.clone()))
            .collect();

        Self {
            request_uri: metadata.absolute_uri(request.request_uri()),
            params: metadata.params.clone(),
            session: metadata.session.clone(),
            environment: metadata.environment.clone(),
            components: RequestComponents::from_operation(request.controller_operation()),
            context,
        }
    }
}

/// A queued error, immutable once created
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorEvent {
    pub exception: CapturedException,
    pub request_id: Option<RequestId>,
    pub context: ErrorContext,
    pub host: String,
    pub revision_sha: String,
}

impl ErrorEvent {
    pub fn to_record(&self) -> ErrorRecord {
        ErrorRecord {
            exception_class: self.exception.class.clone(),
            message: self.exception.message.clone(),
            request_id: self.request_id.as_ref().map(ToString::to_string),
            request_uri: self.context.request_uri.clone(),
            request_params: self.context.params.clone(),
            request_session: self.context.session.clone(),
            environment: self.context.environment.clone(),
            trace: self.exception.trace(),
            request_components: self.context.components.clone(),
            context: self.context.context.clone(),
            host: self.host.clone(),
            revision_sha: self.revision_sha.clone(),
        }
    }
}

/// Wire form of one error inside an `ErrorBatch`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub exception_class: String,
    pub message: String,
    pub request_id: Option<String>,
    pub request_uri: String,
    pub request_params: Map<String, Value>,
    pub request_session: Map<String, Value>,
    pub environment: Map<String, Value>,
    pub trace: Vec<String>,
    pub request_components: RequestComponents,
    pub context: Map<String, Value>,
    pub host: String,
    pub revision_sha: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::RequestMetadata;
    use crate::testing::{FixedClock, FixedMemory};
    use crate::uri::UriSettings;
    use serde_json::json;
    use std::sync::Arc;

    #[derive(Debug, thiserror::Error)]
    #[error("stock level for {0} went negative")]
    struct StockError(String);

    fn request() -> Request {
        Request::with_sources(
            UriSettings::default(),
            Arc::new(FixedClock::new(1_700_000_000.0)),
            Arc::new(FixedMemory::new(0)),
            None,
        )
    }

    #[test]
    fn test_trace_line_format() {
        let frame = StackFrame::new("src/orders.rs", 42, "orders::ship");
        assert_eq!(frame.to_trace_line(), "src/orders.rs:42:in `orders::ship`");
    }

    #[test]
    fn test_from_error_uses_type_name() {
        let captured = CapturedException::from_error(&StockError("sku-1".to_string()));
        assert_eq!(captured.class, "StockError");
        assert_eq!(captured.message, "stock level for sku-1 went negative");
    }

    #[test]
    fn test_capture_skips_own_frames() {
        let captured = CapturedException::capture("Boom", "bang");
        assert!(captured
            .frames
            .iter()
            .all(|frame| !frame.function.starts_with("backtrace::")));
    }

    #[test]
    fn test_components_from_controller_span() {
        assert_eq!(
            RequestComponents::from_operation(Some("Controller/Users/show")),
            RequestComponents {
                module: "UnknownModule".to_string(),
                controller: "Controller".to_string(),
                action: "Users/show".to_string(),
            }
        );
        assert_eq!(
            RequestComponents::from_operation(Some("SQL/Query")),
            RequestComponents::default()
        );
        assert_eq!(RequestComponents::default().action, "UnknownAction");
    }

    #[test]
    fn test_context_from_request() {
        let mut request = request();
        let mut params = Map::new();
        params.insert("page".to_string(), json!("2"));

        request.attach_metadata(
            RequestMetadata::new()
                .with_server_var("HTTPS", "on")
                .with_server_var("HTTP_HOST", "shop.example")
                .with_server_var("REQUEST_URI", "/cart")
                .with_params(params.clone()),
        );
        request.tag("customer", "acme");
        request.start_span("Controller/Cart/show", None, false).unwrap();

        let context = ErrorContext::from_request(&request);
        assert_eq!(context.request_uri, "https://shop.example/cart");
        assert_eq!(context.params, params);
        assert_eq!(context.components.action, "Cart/show");
        assert_eq!(context.context.get("customer"), Some(&json!("acme")));
    }

    #[test]
    fn test_record_wire_shape() {
        let event = ErrorEvent {
            exception: CapturedException::new("ErrorException", "oops")
                .with_frames(vec![StackFrame::new("a.rs", 1, "main")]),
            request_id: None,
            context: ErrorContext::default(),
            host: "web-01".to_string(),
            revision_sha: String::new(),
        };

        let value = serde_json::to_value(event.to_record()).unwrap();
        assert_eq!(value["exception_class"], "ErrorException");
        assert_eq!(value["request_id"], Value::Null);
        assert_eq!(value["trace"], json!(["a.rs:1:in `main`"]));
        assert_eq!(value["request_components"]["controller"], "UnknownController");
        assert_eq!(value["host"], "web-01");
    }
}
