//! Glue between the request loops, the multi-queue, and the command handler.
//!
//! The communicator knows nothing about queues and the queue knows nothing
//! about wire formats; the closures built here are the only place the two
//! meet, and the integration tests assemble exactly these pipelines.

use std::sync::Arc;

use serde_json::Value;
use wdn_commands::CommandEntry;
use wdn_communicator::{GetMessages, OnSuccess};
use wdn_queue::{Message, MessageType, MultiTypeQueue};

/// Module name attached to queue rows produced by the command pipeline.
pub const COMMAND_MODULE: &str = "command_handler";

/// Body supplier for an event loop: batch the earliest rows up to the byte
/// budget and serialize them one JSON document per line. Waits (bounded)
/// for content when the buffer is empty so the loop does not spin.
pub fn batch_from_queue(queue: Arc<MultiTypeQueue>, kind: MessageType) -> GetMessages {
    Box::new(move |max_bytes| {
        let queue = Arc::clone(&queue);
        Box::pin(async move {
            match queue.retrieve_by_size(max_bytes, kind, None).await {
                Ok(messages) if !messages.is_empty() => {
                    let body = serialize_batch(&messages);
                    (messages.len(), body)
                }
                Ok(_) => {
                    let _ = queue.wait_for_messages(kind, queue.batch_timeout()).await;
                    (0, String::new())
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to read event batch from queue");
                    tokio::time::sleep(queue.batch_timeout()).await;
                    (0, String::new())
                }
            }
        })
    })
}

/// Success handler for an event loop: the manager acknowledged the batch, so
/// the delivered rows can leave the buffer.
pub fn remove_on_success(queue: Arc<MultiTypeQueue>, kind: MessageType) -> OnSuccess {
    Box::new(move |count, _body| {
        let queue = Arc::clone(&queue);
        Box::pin(async move {
            if count == 0 {
                return;
            }
            if let Err(e) = queue.remove_multiple(count, kind, None).await {
                tracing::error!(error = %e, "failed to drop acknowledged events");
            }
        })
    })
}

/// Success handler for the commands poll: every command document in the
/// response body lands in the command buffer for the dispatch loop.
pub fn enqueue_commands(queue: Arc<MultiTypeQueue>) -> OnSuccess {
    Box::new(move |_count, body| {
        let queue = Arc::clone(&queue);
        Box::pin(async move {
            for doc in parse_command_docs(&body) {
                let message = Message::new(doc, COMMAND_MODULE);
                match queue.push(message, MessageType::Command, false).await {
                    Ok(0) => tracing::warn!("command buffer full, dropping command"),
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "failed to buffer command"),
                }
            }
        })
    })
}

/// Supplier for the dispatch loop: peek the oldest buffered command without
/// consuming it. Unparseable rows are consumed immediately so they cannot
/// wedge the loop.
pub fn command_supplier(
    queue: Arc<MultiTypeQueue>,
) -> impl Fn() -> futures_util::future::BoxFuture<'static, Option<CommandEntry>> {
    move || {
        let queue = Arc::clone(&queue);
        let fut: futures_util::future::BoxFuture<'static, Option<CommandEntry>> =
            Box::pin(async move {
                let front = match queue.retrieve_multiple(1, MessageType::Command, None).await {
                    Ok(mut rows) => rows.pop(),
                    Err(e) => {
                        tracing::error!(error = %e, "failed to read command buffer");
                        return None;
                    }
                };
                let message = front?;
                match CommandEntry::from_value(&message.data) {
                    Ok(entry) => Some(entry),
                    Err(reason) => {
                        tracing::error!(%reason, "discarding malformed command document");
                        let _ = queue.remove_multiple(1, MessageType::Command, None).await;
                        None
                    }
                }
            });
        fut
    }
}

/// Consumer side of [`command_supplier`].
pub fn command_popper(
    queue: Arc<MultiTypeQueue>,
) -> impl Fn() -> futures_util::future::BoxFuture<'static, ()> {
    move || {
        let queue = Arc::clone(&queue);
        let fut: futures_util::future::BoxFuture<'static, ()> = Box::pin(async move {
            if let Err(e) = queue.remove_multiple(1, MessageType::Command, None).await {
                tracing::error!(error = %e, "failed to pop command buffer");
            }
        });
        fut
    }
}

/// Reporter for the dispatch loop: command outcomes travel to the manager as
/// stateful events.
pub fn report_to_stateful(
    queue: Arc<MultiTypeQueue>,
) -> impl Fn(CommandEntry) -> futures_util::future::BoxFuture<'static, ()> {
    move |entry| {
        let queue = Arc::clone(&queue);
        let fut: futures_util::future::BoxFuture<'static, ()> = Box::pin(async move {
            let message = Message::new(result_report(&entry), COMMAND_MODULE);
            match queue.push(message, MessageType::Stateful, true).await {
                Ok(0) => tracing::warn!(id = %entry.id, "command result not buffered"),
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, id = %entry.id, "failed to buffer command result"),
            }
        });
        fut
    }
}

/// One message per line; the manager splits on newlines.
pub fn serialize_batch(messages: &[Message]) -> String {
    messages
        .iter()
        .filter_map(|m| serde_json::to_string(m).ok())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Accepts `{"commands":[…]}` or a bare array; anything else yields nothing.
pub fn parse_command_docs(body: &str) -> Vec<Value> {
    let parsed: Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "unparseable commands response");
            return Vec::new();
        }
    };
    let docs = parsed
        .get("commands")
        .and_then(Value::as_array)
        .cloned()
        .or_else(|| parsed.as_array().cloned());
    match docs {
        Some(docs) => docs,
        None => {
            tracing::warn!("commands response without a command array");
            Vec::new()
        }
    }
}

/// Manager-facing report for a finished (or rejected) command.
pub fn result_report(entry: &CommandEntry) -> Value {
    serde_json::json!({
        "id": entry.id,
        "module": entry.module,
        "command": entry.command,
        "result": {
            "code": entry.result.status.as_i64(),
            "message": entry.result.message,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wdn_commands::{CommandResult, ExecutionMode, Status};

    #[test]
    fn command_docs_parse_from_both_envelopes() {
        let wrapped = r#"{"commands":[{"id":"c1","command":"restart"}]}"#;
        assert_eq!(parse_command_docs(wrapped).len(), 1);

        let bare = r#"[{"id":"c1","command":"restart"},{"id":"c2","command":"restart"}]"#;
        assert_eq!(parse_command_docs(bare).len(), 2);

        assert!(parse_command_docs("{}").is_empty());
        assert!(parse_command_docs("no json").is_empty());
    }

    #[test]
    fn batch_serialization_is_one_document_per_line() {
        let messages = vec![
            Message::new(json!({"a": 1}), "inv"),
            Message::new(json!({"b": 2}), "fim"),
        ];
        let body = serialize_batch(&messages);
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains(r#""a":1"#));
        assert!(lines[1].contains(r#""b":2"#));
    }

    #[test]
    fn result_report_carries_the_numeric_status() {
        let mut entry = CommandEntry::new(
            "c1",
            COMMAND_MODULE,
            "set-group",
            json!({"groups":["g1"]}),
            ExecutionMode::Async,
        );
        entry.result = CommandResult::new(Status::Success, "done");
        let report = result_report(&entry);
        assert_eq!(report["id"], "c1");
        assert_eq!(report["result"]["code"], 0);
        assert_eq!(report["result"]["message"], "done");
    }
}
