//! Request tracking - the span tree for one unit of work
//!
//! A [`Request`] owns every span created while it is active. Spans live in
//! an arena and are addressed by [`SpanIndex`]; each container keeps an
//! ordered list of [`Command`] children, and the request keeps a cursor to
//! the currently open span. Rendering walks the tree depth-first and emits
//! the flat, bracketed [`WireCommand`] stream the collector expects.

use crate::clock::{Clock, SystemClock};
use crate::command::{BatchCommand, Tag, TagTarget, TagValue, WireCommand};
use crate::config::Config;
use crate::id::{RequestId, SpanId};
use crate::memory::{MemorySampler, MemoryUsage, ProcessMemory};
use crate::metadata::RequestMetadata;
use crate::timer::{normalize_ambiguous_timestamp, Timer};
use crate::uri::UriSettings;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Maximum number of spans recorded for one request
pub const MAX_COMPLETE_SPANS: usize = 3000;

/// Memory growth over the request, in megabytes
pub const TAG_MEMORY_DELTA: &str = "memory_delta";
/// Reported request path
pub const TAG_REQUEST_PATH: &str = "path";
/// Time spent queued before the application saw the request, in nanoseconds
pub const TAG_QUEUE_TIME: &str = "scout.queue_time_ns";

/// Headers carrying the time a front-end proxy received the request,
/// checked in this order
const QUEUE_TIME_HEADERS: [&str; 2] = ["X-Queue-Start", "X-Request-Start"];

const CONTROLLER_PREFIX: &str = "Controller/";

/// Request tracking errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TraceError {
    #[error("Span limit of {limit} reached, not starting span for operation {operation}")]
    SpanLimitReached { operation: String, limit: usize },

    #[error("No span with index {0}")]
    UnknownSpan(usize),

    #[error("No span is currently open")]
    NoOpenSpan,
}

pub type TraceResult<T> = Result<T, TraceError>;

/// Stable address of a span within its request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanIndex(usize);

impl SpanIndex {
    pub fn get(self) -> usize {
        self.0
    }
}

/// Child element of a container (the request root or a span)
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Span(SpanIndex),
    Tag(Tag),
}

/// One timed operation in the call tree
#[derive(Debug, Clone)]
pub struct Span {
    operation: String,
    id: SpanId,
    request_id: RequestId,
    timer: Timer,
    parent: Option<SpanIndex>,
    children: Vec<Command>,
    leaf: bool,
}

impl Span {
    fn new(
        operation: &str,
        request_id: RequestId,
        timer: Timer,
        parent: Option<SpanIndex>,
        leaf: bool,
    ) -> Self {
        Self {
            operation: operation.to_string(),
            id: SpanId::new(),
            request_id,
            timer,
            parent,
            children: Vec::new(),
            leaf,
        }
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn id(&self) -> &SpanId {
        &self.id
    }

    pub fn timer(&self) -> &Timer {
        &self.timer
    }

    /// Enclosing span, `None` when directly under the request
    pub fn parent(&self) -> Option<SpanIndex> {
        self.parent
    }

    pub fn is_leaf(&self) -> bool {
        self.leaf
    }

    pub fn children(&self) -> &[Command] {
        &self.children
    }

    pub fn tags(&self) -> impl Iterator<Item = &Tag> {
        self.children.iter().filter_map(|child| match child {
            Command::Tag(tag) => Some(tag),
            Command::Span(_) => None,
        })
    }

    /// Tags stay writable after the span is stopped
    pub fn tag(&mut self, name: impl Into<String>, value: impl Into<TagValue>) {
        let tag = Tag::for_span(self.request_id.clone(), self.id.clone(), name, value.into());
        self.children.push(Command::Tag(tag));
    }
}

/// The root of one unit of work
pub struct Request {
    id: RequestId,
    timer: Timer,
    start_memory: MemoryUsage,
    children: Vec<Command>,
    spans: Vec<Span>,
    current: Option<SpanIndex>,
    span_count: usize,
    leaf_node_depth: usize,
    uri_settings: UriSettings,
    request_uri_override: Option<String>,
    metadata: RequestMetadata,
    clock: Arc<dyn Clock>,
    memory: Arc<dyn MemorySampler>,
}

impl Request {
    /// Start a request using the system clock and process memory
    pub fn from_config(config: &Config, override_timestamp: Option<f64>) -> Self {
        Self::with_sources(
            UriSettings::from_config(config),
            Arc::new(SystemClock),
            Arc::new(ProcessMemory),
            override_timestamp,
        )
    }

    /// Start a request with explicit collaborators
    pub fn with_sources(
        uri_settings: UriSettings,
        clock: Arc<dyn Clock>,
        memory: Arc<dyn MemorySampler>,
        override_timestamp: Option<f64>,
    ) -> Self {
        let timer = Timer::start(clock.as_ref(), override_timestamp);
        let start_memory = memory.sample();

        Self {
            id: RequestId::new(),
            timer,
            start_memory,
            children: Vec::new(),
            spans: Vec::new(),
            current: None,
            span_count: 0,
            leaf_node_depth: 0,
            uri_settings,
            request_uri_override: None,
            metadata: RequestMetadata::default(),
            clock,
            memory,
        }
    }

    pub fn id(&self) -> &RequestId {
        &self.id
    }

    pub fn timer(&self) -> &Timer {
        &self.timer
    }

    pub fn is_stopped(&self) -> bool {
        self.timer.is_stopped()
    }

    /// Direct children: top-level spans and request tags
    pub fn children(&self) -> &[Command] {
        &self.children
    }

    pub fn span(&self, index: SpanIndex) -> Option<&Span> {
        self.spans.get(index.0)
    }

    pub fn span_mut(&mut self, index: SpanIndex) -> Option<&mut Span> {
        self.spans.get_mut(index.0)
    }

    /// Currently open span, `None` at the root
    pub fn current_span(&self) -> Option<SpanIndex> {
        self.current
    }

    /// Spans ever created, never decremented
    pub fn span_count(&self) -> usize {
        self.span_count
    }

    pub fn leaf_node_depth(&self) -> usize {
        self.leaf_node_depth
    }

    pub fn metadata(&self) -> &RequestMetadata {
        &self.metadata
    }

    /// Use the given transport metadata for path, queue time and error context
    pub fn attach_metadata(&mut self, metadata: RequestMetadata) {
        self.metadata = metadata;
    }

    /// Report this URI instead of the one from transport metadata
    pub fn override_request_uri(&mut self, uri: impl Into<String>) {
        self.request_uri_override = Some(uri.into());
    }

    /// Raw request URI: the override, else what transport metadata reports
    pub fn request_uri(&self) -> &str {
        self.request_uri_override
            .as_deref()
            .unwrap_or_else(|| self.metadata.request_path())
    }

    /// Open a span under the current command.
    ///
    /// While a leaf span is current, nested starts are absorbed: the depth
    /// counter goes up and the leaf itself is returned.
    pub fn start_span(
        &mut self,
        operation: &str,
        override_timestamp: Option<f64>,
        leaf: bool,
    ) -> TraceResult<SpanIndex> {
        if self.span_count >= MAX_COMPLETE_SPANS {
            return Err(TraceError::SpanLimitReached {
                operation: operation.to_string(),
                limit: MAX_COMPLETE_SPANS,
            });
        }

        if let Some(current) = self.current {
            if self.spans.get(current.0).is_some_and(Span::is_leaf) {
                self.leaf_node_depth += 1;
                return Ok(current);
            }
        }

        self.span_count += 1;

        let index = SpanIndex(self.spans.len());
        let timer = Timer::start(self.clock.as_ref(), override_timestamp);
        self.spans
            .push(Span::new(operation, self.id.clone(), timer, self.current, leaf));

        match self.current.and_then(|parent| self.spans.get_mut(parent.0)) {
            Some(parent) => parent.children.push(Command::Span(index)),
            None => self.children.push(Command::Span(index)),
        }

        self.current = Some(index);
        Ok(index)
    }

    /// Close the current span. Tags can still be added until the request
    /// is rendered.
    pub fn stop_span(&mut self, override_timestamp: Option<f64>) {
        let Some(index) = self.current else {
            debug!(request_id = %self.id, "stop_span with no open span, stopping request");
            self.stop_if_running(override_timestamp);
            return;
        };

        let Some(span) = self.spans.get_mut(index.0) else {
            self.current = None;
            return;
        };

        if span.leaf && self.leaf_node_depth > 0 {
            self.leaf_node_depth -= 1;
            return;
        }

        span.timer.stop(self.clock.as_ref(), override_timestamp);
        self.current = span.parent;
    }

    /// Tag the request as a whole; always attached at the root
    pub fn tag(&mut self, name: impl Into<String>, value: impl Into<TagValue>) {
        let tag = Tag::for_request(self.id.clone(), name, value.into());
        self.children.push(Command::Tag(tag));
    }

    pub fn tag_span(
        &mut self,
        index: SpanIndex,
        name: impl Into<String>,
        value: impl Into<TagValue>,
    ) -> TraceResult<()> {
        let span = self
            .spans
            .get_mut(index.0)
            .ok_or(TraceError::UnknownSpan(index.0))?;
        span.tag(name, value);
        Ok(())
    }

    pub fn tag_current_span(
        &mut self,
        name: impl Into<String>,
        value: impl Into<TagValue>,
    ) -> TraceResult<()> {
        let index = self.current.ok_or(TraceError::NoOpenSpan)?;
        self.tag_span(index, name, value)
    }

    /// Stop the request. Only the first call has any effect; it records
    /// memory growth, the request path and any queue time.
    pub fn stop(&mut self, override_timestamp: Option<f64>, now: Option<f64>) {
        if self.timer.is_stopped() {
            return;
        }

        self.timer.stop(self.clock.as_ref(), override_timestamp);

        let delta = self
            .memory
            .sample()
            .used_difference_in_megabytes(&self.start_memory);
        self.tag(TAG_MEMORY_DELTA, delta);

        let path = self.uri_settings.format(self.request_uri());
        self.tag(TAG_REQUEST_PATH, path);

        let now = now.unwrap_or_else(|| self.clock.now());
        self.tag_queue_time(now);
    }

    pub fn stop_if_running(&mut self, override_timestamp: Option<f64>) {
        if self.timer.is_stopped() {
            return;
        }
        self.stop(override_timestamp, None);
    }

    fn tag_queue_time(&mut self, now: f64) {
        let values: Vec<(&str, String)> = QUEUE_TIME_HEADERS
            .iter()
            .filter_map(|header| {
                self.metadata
                    .header(header)
                    .map(|value| (*header, value.to_string()))
            })
            .collect();

        for (header, raw) in values {
            let trimmed = raw.trim();
            let value = trimmed.strip_prefix("t=").unwrap_or(trimmed);

            let Ok(parsed) = value.parse::<f64>() else {
                debug!(header, value, "Unparseable queue time header");
                continue;
            };

            let header_seconds = normalize_ambiguous_timestamp(parsed, now);
            if header_seconds == 0.0 {
                continue;
            }

            let queue_time_ns = (self.timer.start_seconds() - header_seconds) * 1e9;
            self.tag(TAG_QUEUE_TIME, queue_time_ns);
        }
    }

    /// Request tags in the order they were added
    pub fn tags(&self) -> impl Iterator<Item = &Tag> {
        self.children.iter().filter_map(|child| match child {
            Command::Tag(tag) if tag.target == TagTarget::Request => Some(tag),
            _ => None,
        })
    }

    /// Operation of the first span named `Controller/...`
    pub fn controller_operation(&self) -> Option<&str> {
        self.spans
            .iter()
            .map(Span::operation)
            .find(|operation| operation.starts_with(CONTROLLER_PREFIX))
    }

    /// Number of span nodes in the tree, as opposed to [`Request::span_count`]
    pub fn total_span_count(&self) -> usize {
        self.count_spans(&self.children)
    }

    fn count_spans(&self, commands: &[Command]) -> usize {
        commands
            .iter()
            .map(|command| match command {
                Command::Span(index) => {
                    1 + self
                        .spans
                        .get(index.0)
                        .map(|span| self.count_spans(&span.children))
                        .unwrap_or(0)
                }
                Command::Tag(_) => 0,
            })
            .sum()
    }

    /// Render the request and all descendants into a command batch
    pub fn render(&self) -> BatchCommand {
        let mut commands = Vec::with_capacity(2 + self.children.len());

        commands.push(WireCommand::StartRequest {
            request_id: self.id.to_string(),
            timestamp: self.timer.start_timestamp(),
        });

        for child in &self.children {
            self.render_command(child, &mut commands);
        }

        commands.push(WireCommand::FinishRequest {
            request_id: self.id.to_string(),
            timestamp: self.timer.stop_timestamp(),
        });

        BatchCommand { commands }
    }

    fn render_command(&self, command: &Command, out: &mut Vec<WireCommand>) {
        match command {
            Command::Tag(tag) => out.push(tag.to_wire()),
            Command::Span(index) => {
                let Some(span) = self.spans.get(index.0) else {
                    warn!(index = index.0, "Skipping span missing from arena");
                    return;
                };

                out.push(WireCommand::StartSpan {
                    request_id: self.id.to_string(),
                    span_id: span.id.to_string(),
                    parent_id: span
                        .parent
                        .and_then(|parent| self.spans.get(parent.0))
                        .map(|parent| parent.id.to_string()),
                    operation: span.operation.clone(),
                    timestamp: span.timer.start_timestamp(),
                });

                for child in &span.children {
                    self.render_command(child, out);
                }

                out.push(WireCommand::StopSpan {
                    request_id: self.id.to_string(),
                    span_id: span.id.to_string(),
                    timestamp: span.timer.stop_timestamp(),
                });
            }
        }
    }

    /// Drop the whole tree. Safe to call more than once.
    pub fn release(&mut self) {
        self.children.clear();
        self.spans.clear();
        self.current = None;
        self.leaf_node_depth = 0;
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("timer", &self.timer)
            .field("children", &self.children.len())
            .field("spans", &self.spans.len())
            .field("current", &self.current)
            .field("span_count", &self.span_count)
            .field("leaf_node_depth", &self.leaf_node_depth)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FixedClock, FixedMemory};
    use crate::uri::UriReporting;
    use serde_json::{json, Value};

    const NOW: f64 = 1_700_000_000.0;
    const MB: u64 = 1024 * 1024;

    fn new_request() -> (Request, Arc<FixedClock>, Arc<FixedMemory>) {
        let clock = Arc::new(FixedClock::new(NOW));
        let memory = Arc::new(FixedMemory::new(10 * MB));
        let request = Request::with_sources(
            UriSettings::default(),
            clock.clone(),
            memory.clone(),
            None,
        );
        (request, clock, memory)
    }

    fn request_tag<'a>(batch: &'a BatchCommand, name: &str) -> Vec<&'a Value> {
        batch
            .commands
            .iter()
            .filter_map(|command| match command {
                WireCommand::TagRequest { tag, value, .. } if tag == name => Some(value),
                _ => None,
            })
            .collect()
    }

    fn finish_timestamp(batch: &BatchCommand) -> Option<String> {
        match batch.commands.last() {
            Some(WireCommand::FinishRequest { timestamp, .. }) => timestamp.clone(),
            other => panic!("last record is not FinishRequest: {:?}", other),
        }
    }

    #[test]
    fn test_unstopped_request_renders_null_finish() {
        let (request, _, _) = new_request();
        let batch = request.render();

        assert_eq!(batch.commands.len(), 2);
        assert!(matches!(batch.commands[0], WireCommand::StartRequest { .. }));
        assert_eq!(finish_timestamp(&batch), None);
    }

    #[test]
    fn test_stop_tags_memory_and_path() {
        let (mut request, _, _) = new_request();
        request.stop(None, None);
        let batch = request.render();

        assert_eq!(batch.commands.len(), 4);
        assert!(matches!(
            &batch.commands[1],
            WireCommand::TagRequest { tag, .. } if tag == TAG_MEMORY_DELTA
        ));
        assert!(matches!(
            &batch.commands[2],
            WireCommand::TagRequest { tag, value, .. } if tag == TAG_REQUEST_PATH && value == "/"
        ));
        assert_eq!(
            finish_timestamp(&batch).as_deref(),
            Some("2023-11-14T22:13:20.000000Z")
        );
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (mut request, clock, _) = new_request();
        request.stop(Some(NOW + 1.0), None);
        let first = request.render();

        clock.advance(30.0);
        request.stop(Some(NOW + 5.0), None);
        request.stop(None, None);
        let second = request.render();

        assert_eq!(finish_timestamp(&first), finish_timestamp(&second));
        assert_eq!(first.commands.len(), second.commands.len());
    }

    #[test]
    fn test_stop_if_running_keeps_existing_stop() {
        let (mut request, clock, _) = new_request();
        request.stop(Some(NOW - 100.0), None);
        let original = finish_timestamp(&request.render());

        clock.advance(10.0);
        request.stop_if_running(None);

        assert_eq!(finish_timestamp(&request.render()), original);
    }

    #[test]
    fn test_stop_if_running_stops() {
        let (mut request, _, _) = new_request();
        request.stop_if_running(None);
        assert!(request.is_stopped());
        assert!(finish_timestamp(&request.render()).is_some());
    }

    #[test]
    fn test_memory_delta_is_tagged() {
        let (mut request, _, memory) = new_request();
        memory.set(74 * MB);
        request.stop(None, None);

        let batch = request.render();
        assert_eq!(request_tag(&batch, TAG_MEMORY_DELTA), vec![&json!(64.0)]);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_memory_delta_grows_with_real_allocation() {
        let mut request = Request::from_config(&Config::default(), None);
        let block = vec![1u8; 64 * MB as usize];
        request.stop_if_running(None);

        let batch = request.render();
        let delta = request_tag(&batch, TAG_MEMORY_DELTA)[0].as_f64().unwrap();
        assert!(delta > 0.0);
        assert_eq!(block[0], 1);
    }

    #[test]
    fn test_path_priority() {
        let (mut request, _, _) = new_request();
        request.attach_metadata(
            RequestMetadata::new().with_server_var("ORIG_PATH_INFO", "/orig-path-info"),
        );
        request.stop(None, None);
        assert_eq!(
            request_tag(&request.render(), TAG_REQUEST_PATH),
            vec![&json!("/orig-path-info")]
        );

        let (mut request, _, _) = new_request();
        request.attach_metadata(
            RequestMetadata::new()
                .with_server_var("ORIG_PATH_INFO", "/orig-path-info")
                .with_server_var("REQUEST_URI", "/request-uri"),
        );
        request.stop(None, None);
        assert_eq!(
            request_tag(&request.render(), TAG_REQUEST_PATH),
            vec![&json!("/request-uri")]
        );

        let (mut request, _, _) = new_request();
        request.attach_metadata(
            RequestMetadata::new().with_server_var("REQUEST_URI", "/request-uri"),
        );
        request.override_request_uri("/overridden");
        request.stop(None, None);
        assert_eq!(
            request_tag(&request.render(), TAG_REQUEST_PATH),
            vec![&json!("/overridden")]
        );
    }

    #[test]
    fn test_path_uses_reporting_mode() {
        let clock = Arc::new(FixedClock::new(NOW));
        let memory = Arc::new(FixedMemory::new(0));
        let settings = UriSettings {
            reporting: UriReporting::PathOnly,
            ..UriSettings::default()
        };
        let mut request = Request::with_sources(settings, clock, memory, None);
        request.override_request_uri("/orders?id=7");
        request.stop(None, None);

        assert_eq!(
            request_tag(&request.render(), TAG_REQUEST_PATH),
            vec![&json!("/orders")]
        );
    }

    #[test]
    fn test_queue_time_from_headers() {
        let (mut request, _, _) = new_request();
        // Request started at NOW; the proxy saw it 50ms earlier, in milliseconds
        request.attach_metadata(
            RequestMetadata::new()
                .with_header("X-Queue-Start", "t=1699999999950")
                .with_header("X-Request-Start", "1699999999900000"),
        );
        request.stop(None, Some(NOW));

        let batch = request.render();
        let values: Vec<f64> = request_tag(&batch, TAG_QUEUE_TIME)
            .into_iter()
            .map(|v| v.as_f64().unwrap())
            .collect();

        assert_eq!(values.len(), 2);
        assert!((values[0] - 50_000_000.0).abs() < 1_000.0);
        assert!((values[1] - 100_000_000.0).abs() < 1_000.0);
    }

    #[test]
    fn test_queue_time_skips_ancient_or_garbage_values() {
        let (mut request, _, _) = new_request();
        request.attach_metadata(
            RequestMetadata::new()
                .with_header("X-Queue-Start", "t=12345")
                .with_header("X-Request-Start", "not-a-number"),
        );
        request.stop(None, Some(NOW));

        assert!(request_tag(&request.render(), TAG_QUEUE_TIME).is_empty());
    }

    #[test]
    fn test_render_order() {
        let (mut request, _, _) = new_request();
        request.tag("t", "v");
        let span = request.start_span("foo", None, false).unwrap();
        request.tag_span(span, "spantag", "spanvalue").unwrap();
        request.stop_span(None);
        request.stop(None, None);

        let kinds: Vec<&str> = request
            .render()
            .commands
            .iter()
            .map(|command| match command {
                WireCommand::StartRequest { .. } => "StartRequest",
                WireCommand::FinishRequest { .. } => "FinishRequest",
                WireCommand::StartSpan { .. } => "StartSpan",
                WireCommand::StopSpan { .. } => "StopSpan",
                WireCommand::TagRequest { .. } => "TagRequest",
                WireCommand::TagSpan { .. } => "TagSpan",
            })
            .collect();

        assert_eq!(
            kinds,
            vec![
                "StartRequest",
                "TagRequest",
                "StartSpan",
                "TagSpan",
                "StopSpan",
                "TagRequest",
                "TagRequest",
                "FinishRequest",
            ]
        );
    }

    #[test]
    fn test_nested_spans_render_with_parent_ids() {
        let (mut request, _, _) = new_request();
        let outer = request.start_span("Controller/Home", None, false).unwrap();
        let inner = request.start_span("SQL/Query", None, false).unwrap();
        request.stop_span(None);
        request.stop_span(None);

        assert_eq!(request.span(inner).unwrap().parent(), Some(outer));
        assert_eq!(request.current_span(), None);

        let outer_id = request.span(outer).unwrap().id().to_string();
        let batch = request.render();
        match &batch.commands[2] {
            WireCommand::StartSpan {
                parent_id,
                operation,
                ..
            } => {
                assert_eq!(operation, "SQL/Query");
                assert_eq!(parent_id.as_deref(), Some(outer_id.as_str()));
            }
            other => panic!("unexpected record: {:?}", other),
        }
        assert!(matches!(
            &batch.commands[1],
            WireCommand::StartSpan { parent_id: None, .. }
        ));
    }

    #[test]
    fn test_request_tags_attach_to_root_while_nested() {
        let (mut request, _, _) = new_request();
        request.start_span("outer", None, false).unwrap();
        request.start_span("inner", None, false).unwrap();
        request.tag("user_id", 42);

        assert_eq!(request.children().len(), 2);
        assert_eq!(request.tags().count(), 1);
        assert!(matches!(request.children()[1], Command::Tag(_)));
    }

    #[test]
    fn test_leaf_span_absorbs_nested_calls() {
        let (mut request, _, _) = new_request();
        let leaf = request.start_span("SQL/Query", None, true).unwrap();

        for _ in 0..5 {
            let nested = request.start_span("PDO/execute", None, false).unwrap();
            assert_eq!(nested, leaf);
        }
        assert_eq!(request.leaf_node_depth(), 5);

        for _ in 0..5 {
            request.stop_span(None);
            assert!(!request.span(leaf).unwrap().timer().is_stopped());
        }
        assert_eq!(request.leaf_node_depth(), 0);

        request.stop_span(None);
        assert!(request.span(leaf).unwrap().timer().is_stopped());
        assert_eq!(request.current_span(), None);
        assert_eq!(request.total_span_count(), 1);
        assert_eq!(request.span_count(), 1);
    }

    #[test]
    fn test_stop_span_at_root_stops_request() {
        let (mut request, _, _) = new_request();
        request.start_span("only", None, false).unwrap();
        request.stop_span(None);
        assert!(!request.is_stopped());

        // Unbalanced close: recovered by stopping the request
        request.stop_span(Some(NOW + 3.0));
        assert!(request.is_stopped());
        assert_eq!(request.timer().stop_seconds(), Some(NOW + 3.0));
    }

    #[test]
    fn test_span_limit() {
        let (mut request, _, _) = new_request();
        for i in 0..MAX_COMPLETE_SPANS {
            request
                .start_span(&format!("span-{}", i), None, false)
                .unwrap();
            request.stop_span(None);
        }

        let err = request.start_span("one-too-many", None, false).unwrap_err();
        assert_eq!(
            err,
            TraceError::SpanLimitReached {
                operation: "one-too-many".to_string(),
                limit: MAX_COMPLETE_SPANS,
            }
        );
        assert!(err.to_string().contains("one-too-many"));

        // Still usable
        request.tag("after_limit", true);
        request.stop(None, None);
        assert_eq!(request.total_span_count(), MAX_COMPLETE_SPANS);
    }

    #[test]
    fn test_tag_current_span() {
        let (mut request, _, _) = new_request();
        assert_eq!(
            request.tag_current_span("a", 1),
            Err(TraceError::NoOpenSpan)
        );

        let span = request.start_span("work", None, false).unwrap();
        request.tag_current_span("a", 1).unwrap();
        assert_eq!(request.span(span).unwrap().tags().count(), 1);
    }

    #[test]
    fn test_controller_operation() {
        let (mut request, _, _) = new_request();
        request.start_span("Middleware/Auth", None, false).unwrap();
        request.stop_span(None);
        request.start_span("Controller/Users/show", None, false).unwrap();
        request.stop_span(None);

        assert_eq!(request.controller_operation(), Some("Controller/Users/show"));
    }

    #[test]
    fn test_release_is_idempotent() {
        let (mut request, _, _) = new_request();
        request.start_span("a", None, false).unwrap();
        request.tag("x", 1);
        request.release();
        request.release();

        assert_eq!(request.total_span_count(), 0);
        assert_eq!(request.current_span(), None);
        assert_eq!(request.span_count(), 1);
        assert_eq!(request.render().commands.len(), 2);
    }

    #[derive(Debug, PartialEq)]
    struct Node {
        operation: String,
        tags: Vec<(String, Value)>,
        children: Vec<Node>,
    }

    fn tree_from_request(request: &Request, commands: &[Command]) -> (Vec<(String, Value)>, Vec<Node>) {
        let mut tags = Vec::new();
        let mut nodes = Vec::new();
        for command in commands {
            match command {
                Command::Tag(tag) => tags.push((tag.name.clone(), tag.value.clone())),
                Command::Span(index) => {
                    let span = request.span(*index).unwrap();
                    let (span_tags, children) = tree_from_request(request, span.children());
                    nodes.push(Node {
                        operation: span.operation().to_string(),
                        tags: span_tags,
                        children,
                    });
                }
            }
        }
        (tags, nodes)
    }

    fn tree_from_wire(commands: &[WireCommand]) -> (Vec<(String, Value)>, Vec<Node>) {
        let mut request_tags = Vec::new();
        let mut roots = Vec::new();
        let mut stack: Vec<Node> = Vec::new();

        for command in commands {
            match command {
                WireCommand::StartSpan { operation, .. } => stack.push(Node {
                    operation: operation.clone(),
                    tags: Vec::new(),
                    children: Vec::new(),
                }),
                WireCommand::StopSpan { .. } => {
                    let node = stack.pop().unwrap();
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(node),
                        None => roots.push(node),
                    }
                }
                WireCommand::TagSpan { tag, value, .. } => {
                    stack.last_mut().unwrap().tags.push((tag.clone(), value.clone()))
                }
                WireCommand::TagRequest { tag, value, .. } => {
                    request_tags.push((tag.clone(), value.clone()))
                }
                WireCommand::StartRequest { .. } | WireCommand::FinishRequest { .. } => {}
            }
        }

        assert!(stack.is_empty());
        (request_tags, roots)
    }

    #[test]
    fn test_wire_round_trip_rebuilds_tree() -> anyhow::Result<()> {
        let (mut request, _, _) = new_request();
        request.tag("customer", "acme");
        let controller = request.start_span("Controller/Orders/index", None, false)?;
        request.tag_span(controller, "format", "json")?;
        request.start_span("SQL/Select", None, true)?;
        request.start_span("Driver/execute", None, false)?;
        request.stop_span(None);
        request.tag_current_span("rows", 12)?;
        request.stop_span(None);
        request.start_span("View/render", None, false)?;
        request.start_span("Template/partial", None, false)?;
        request.stop_span(None);
        request.stop_span(None);
        request.stop_span(None);
        request.stop(None, None);

        let json = serde_json::to_string(&request.render())?;
        let parsed: BatchCommand = serde_json::from_str(&json)?;

        let expected = tree_from_request(&request, request.children());
        let rebuilt = tree_from_wire(&parsed.commands);
        assert_eq!(rebuilt, expected);

        let controller_node = &rebuilt.1[0];
        assert_eq!(controller_node.children.len(), 2);
        assert_eq!(controller_node.children[0].children.len(), 0);
        assert_eq!(controller_node.children[1].children[0].operation, "Template/partial");
        Ok(())
    }

    #[test]
    fn test_balanced_sequences_pair_start_and_stop() {
        let (mut request, _, _) = new_request();
        // depth pattern: open 3, close 2, open 2, close 3
        for op in ["a", "b", "c"] {
            request.start_span(op, None, false).unwrap();
        }
        request.stop_span(None);
        request.stop_span(None);
        for op in ["d", "e"] {
            request.start_span(op, None, false).unwrap();
        }
        for _ in 0..3 {
            request.stop_span(None);
        }

        let batch = request.render();
        let mut depth: i64 = 0;
        let mut starts = 0;
        for command in &batch.commands {
            match command {
                WireCommand::StartSpan { .. } => {
                    depth += 1;
                    starts += 1;
                }
                WireCommand::StopSpan { timestamp, .. } => {
                    assert!(timestamp.is_some());
                    depth -= 1;
                    assert!(depth >= 0);
                }
                _ => {}
            }
        }
        assert_eq!(depth, 0);
        assert_eq!(starts, 5);
        assert_eq!(request.total_span_count(), 5);
    }
}
