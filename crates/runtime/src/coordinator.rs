//! Autonomous multi-round tool calling.
//!
//! Each round streams the conversation through a [`ModelAdapter`]. Text is
//! passed through as it arrives; tool calls are collected, executed through
//! the [`ToolExecutor`] once the model finishes its turn, and folded back
//! into the conversation for the next round. Generation ends when a round
//! asks for no tools.

use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::discovery::ToolCatalogSnapshot;
use crate::document::{DocumentError, DocumentWriter};
use crate::error::{CoordinatorError, ExecutionError};
use crate::executor::{ExecutionRequest, ExecutionResult, ExecutionSource, ToolExecutor};
use crate::llm::{AdapterEvent, Message, ModelAdapter, ToolCall, ToolResult};

/// What a failed tool call does to the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ToolFailurePolicy {
    /// Hand the error to the model as the tool's result.
    #[default]
    FoldIntoConversation,
    /// End generation with the error.
    AbortRound,
}

#[derive(Clone)]
pub struct GenerateOptions {
    /// Document the calls are made for. Defaults to the writer's path.
    pub document_path: Option<String>,
    pub section_line: Option<u32>,
    pub parallel_execution: bool,
    pub max_parallel_tools: usize,
    pub tool_failure_policy: ToolFailurePolicy,
    /// Unbounded when unset.
    pub max_rounds: Option<usize>,
    /// Deadline for the whole run.
    pub timeout: Option<Duration>,
    pub cancel: CancellationToken,
    pub writer: Option<Arc<dyn DocumentWriter>>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            document_path: None,
            section_line: None,
            parallel_execution: false,
            max_parallel_tools: 3,
            tool_failure_policy: ToolFailurePolicy::default(),
            max_rounds: None,
            timeout: None,
            cancel: CancellationToken::new(),
            writer: None,
        }
    }
}

impl GenerateOptions {
    fn document(&self) -> Option<String> {
        self.document_path
            .clone()
            .or_else(|| self.writer.as_ref().map(|w| w.path().to_string()))
    }

    fn stop_error(&self) -> CoordinatorError {
        match self.timeout {
            Some(limit) if !self.cancel.is_cancelled() => CoordinatorError::TimedOut(limit),
            _ => CoordinatorError::Cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorChunk {
    Text(String),
    ToolResult {
        call: ToolCall,
        result: ToolResult,
        /// The result as the adapter renders it into the text.
        rendered: String,
    },
}

pub struct AutonomousToolCallCoordinator {
    executor: Arc<ToolExecutor>,
}

impl AutonomousToolCallCoordinator {
    pub fn new(executor: Arc<ToolExecutor>) -> Self {
        Self { executor }
    }

    /// Run the tool-calling loop.
    ///
    /// Nothing happens until the stream is polled. Dropping the stream
    /// cancels any execution still in flight.
    pub fn generate_with_tools(
        &self,
        messages: Vec<Message>,
        adapter: Arc<dyn ModelAdapter>,
        options: GenerateOptions,
    ) -> impl Stream<Item = Result<CoordinatorChunk, CoordinatorError>> + Send + 'static {
        let executor = self.executor.clone();

        stream! {
            let cancel = options.cancel.child_token();
            let _cancel_on_drop = cancel.clone().drop_guard();
            if let Some(limit) = options.timeout {
                let timer = cancel.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = timer.cancelled() => {}
                        _ = tokio::time::sleep(limit) => timer.cancel(),
                    }
                });
            }

            let mut messages = messages;
            let mut round = 0usize;

            'rounds: loop {
                if cancel.is_cancelled() {
                    yield Err(options.stop_error());
                    break;
                }
                if options.max_rounds.is_some_and(|max| round >= max) {
                    yield Err(CoordinatorError::RoundLimit(round));
                    break;
                }
                round += 1;

                let snapshot = executor.discovery().get_snapshot(false).await;
                let tools = snapshot.specs();
                debug!(round, tools = tools.len(), "starting model round");

                let mut events = match adapter.stream(&messages, &tools, &cancel).await {
                    Ok(events) => events,
                    Err(e) => {
                        yield Err(CoordinatorError::from(e));
                        break;
                    }
                };

                let mut text = String::new();
                let mut calls: Vec<ToolCall> = Vec::new();
                loop {
                    let next = tokio::select! {
                        _ = cancel.cancelled() => None,
                        next = events.next() => Some(next),
                    };
                    let Some(next) = next else {
                        yield Err(options.stop_error());
                        break 'rounds;
                    };
                    match next {
                        None => break,
                        Some(Ok(AdapterEvent::Text(chunk))) => {
                            text.push_str(&chunk);
                            yield Ok(CoordinatorChunk::Text(chunk));
                        }
                        Some(Ok(AdapterEvent::ToolCalls(requested))) => calls.extend(requested),
                        Some(Err(e)) => {
                            yield Err(CoordinatorError::from(e));
                            break 'rounds;
                        }
                    }
                }

                if let Some(writer) = &options.writer {
                    if !text.is_empty() {
                        if let Err(e) = write(writer.as_ref(), &text).await {
                            yield Err(CoordinatorError::from(e));
                            break;
                        }
                    }
                }

                if calls.is_empty() {
                    info!(rounds = round, "generation finished");
                    break;
                }

                debug!(round, calls = calls.len(), "executing tool calls");
                let outcomes = run_calls(&executor, &snapshot, &calls, &options, &cancel).await;

                let mut results = Vec::with_capacity(calls.len());
                for (call, outcome) in calls.iter().zip(outcomes) {
                    let result = match outcome {
                        Ok(done) => ToolResult::success(&call.id, done.text()),
                        Err(ExecutionError::Cancelled) if cancel.is_cancelled() => {
                            yield Err(options.stop_error());
                            break 'rounds;
                        }
                        Err(e) if options.tool_failure_policy == ToolFailurePolicy::AbortRound => {
                            yield Err(CoordinatorError::from(e));
                            break 'rounds;
                        }
                        Err(e) => ToolResult::error(&call.id, e.to_string()),
                    };

                    let rendered = adapter.render_tool_result(call, &result);
                    if let Some(writer) = &options.writer {
                        if let Err(e) = write(writer.as_ref(), &rendered).await {
                            yield Err(CoordinatorError::from(e));
                            break 'rounds;
                        }
                    }
                    yield Ok(CoordinatorChunk::ToolResult {
                        call: call.clone(),
                        result: result.clone(),
                        rendered,
                    });
                    results.push(result);
                }

                adapter.format_tool_results(&mut messages, &text, &calls, results);
            }
        }
    }
}

async fn write(writer: &dyn DocumentWriter, text: &str) -> Result<(), DocumentError> {
    let lock = writer.lock().clone();
    lock.run_exclusive(|| writer.insert(text)).await
}

async fn run_calls(
    executor: &ToolExecutor,
    snapshot: &ToolCatalogSnapshot,
    calls: &[ToolCall],
    options: &GenerateOptions,
    cancel: &CancellationToken,
) -> Vec<Result<ExecutionResult, ExecutionError>> {
    let document = options.document();
    let requests: Vec<ExecutionRequest> = calls
        .iter()
        .map(|call| {
            let params = (!call.input.is_null()).then(|| call.input.clone());
            let mut request = ExecutionRequest::new(&call.name, params)
                .with_source(ExecutionSource::AiAutonomous)
                .with_cancel(cancel.child_token());
            if let Some(owner) = snapshot.owner(&call.name) {
                request = request.with_server(owner.server_id.clone());
            }
            if let Some(document) = &document {
                request = request.with_document(document.clone());
            }
            if let Some(line) = options.section_line {
                request = request.with_section_line(line);
            }
            request
        })
        .collect();

    if options.parallel_execution {
        return futures::stream::iter(requests)
            .map(|request| executor.execute_tool(request))
            .buffered(options.max_parallel_tools.max(1))
            .collect()
            .await;
    }

    let mut outcomes = Vec::with_capacity(calls.len());
    for request in requests {
        let outcome = executor.execute_tool(request).await;
        let failed = outcome.is_err();
        outcomes.push(outcome);
        if failed && options.tool_failure_policy == ToolFailurePolicy::AbortRound {
            break;
        }
    }
    outcomes
}
