// ai
//! 📡 Elasticsearch Bulk Transform — formatting write operations for the bulk API's peculiar tastes 🚀🔄
//!
//! 🎬 COLD OPEN — INT. ELASTICSEARCH CLUSTER — BULK ENDPOINT — HIGH NOON
//!
//! The bulk API has rules.
//!
//! Rule 1: Index and update take two lines. Action metadata, then a body.
//! Rule 2: Delete takes ONE line. There is no body. Sending one anyway gets you
//!         a parse error that points at the wrong line number.
//! Rule 3: The whole body ends with a newline. It MATTERS. Three engineers lost
//!         weekends to this. One of them still flinches when they see `\n`.
//!
//! ## Knowledge Graph 🧠
//! - Input: [`WriteOperation`] (the output of a flavor's build step)
//! - Target: `POST /_bulk`, NDJSON
//! - Action keys: `index` | `create` | `update` | `delete`
//! - Metadata: `_index`, `_id`, `routing`, `version` + `version_type`,
//!   `if_seq_no` + `if_primary_term`. Absent fields are omitted, never null.
//!
//! ⚠️ When the singularity happens, the bulk API will still require two lines
//! per document. Some things transcend consciousness. 🦆

use anyhow::{Context, Result};
use serde_json::{Map, Value, json};

use crate::common::{OpType, VersionType, WriteOperation};

/// 📡 ElasticsearchBulk — the format whisperer for bulk writes.
pub(crate) struct ElasticsearchBulk;

impl ElasticsearchBulk {
    /// 🔄 One operation → its bulk lines, without the trailing newline.
    pub(crate) fn transform_operation(operation: &WriteOperation) -> Result<String> {
        let mut meta = Map::new();
        meta.insert("_index".to_string(), json!(operation.index()));
        if let Some(id) = operation.id() {
            meta.insert("_id".to_string(), json!(id));
        }

        let (routing, version, version_type, if_seq_no, if_primary_term) = match operation {
            WriteOperation::Index(op) => (&op.routing, op.version, op.version_type, op.if_seq_no, op.if_primary_term),
            WriteOperation::Update(op) => (&op.routing, None, VersionType::Internal, op.if_seq_no, op.if_primary_term),
            WriteOperation::Delete(op) => (&op.routing, op.version, op.version_type, op.if_seq_no, op.if_primary_term),
        };
        if let Some(routing) = routing {
            meta.insert("routing".to_string(), json!(routing));
        }
        // -- 🔢 a version only means something alongside its type
        if let Some(version) = version {
            meta.insert("version".to_string(), json!(version));
            meta.insert("version_type".to_string(), json!(version_type.as_str()));
        }
        if let (Some(seq_no), Some(term)) = (if_seq_no, if_primary_term) {
            meta.insert("if_seq_no".to_string(), json!(seq_no));
            meta.insert("if_primary_term".to_string(), json!(term));
        }

        let action = match operation.op_type() {
            OpType::Index => "index",
            OpType::Create => "create",
            OpType::Update => "update",
            OpType::Delete => "delete",
        };
        let mut envelope = Map::new();
        envelope.insert(action.to_string(), Value::Object(meta));
        let action_line = serde_json::to_string(&envelope).context(
            "💀 Failed to serialize bulk action metadata. The JSON that describes JSON has failed to become JSON.",
        )?;

        let body_line = match operation {
            WriteOperation::Index(op) => Some(serde_json::to_string(&op.source)?),
            WriteOperation::Update(op) => Some(serde_json::to_string(&json!({ "doc": op.doc }))?),
            WriteOperation::Delete(_) => None,
        };
        Ok(match body_line {
            Some(body) => format!("{action_line}\n{body}"),
            None => action_line,
        })
    }

    /// 📦 A whole bulk body: every operation, newline-terminated. Trailing newline included.
    pub(crate) fn render_body(operations: &[WriteOperation]) -> Result<String> {
        let mut body = String::new();
        for operation in operations {
            body.push_str(&Self::transform_operation(operation)?);
            body.push('\n');
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{DeleteOperation, IndexOpType, IndexOperation, UpdateOperation};

    fn source(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn the_one_where_a_fully_loaded_index_op_becomes_beautiful_bulk_format() -> Result<()> {
        let op = WriteOperation::Index(IndexOperation {
            index: "the-answer-index".into(),
            id: Some("doc-42".into()),
            routing: Some("route-66".into()),
            version: Some(7),
            version_type: VersionType::External,
            if_seq_no: None,
            if_primary_term: None,
            op_type: IndexOpType::Index,
            source: source(json!({"meaning_of_life": 42})),
        });
        let rendered = ElasticsearchBulk::transform_operation(&op)?;
        let lines: Vec<&str> = rendered.split('\n').collect();
        assert_eq!(lines.len(), 2, "index ops are two lines. No more. No less.");

        let action: Value = serde_json::from_str(lines[0])?;
        assert_eq!(action["index"]["_id"], "doc-42");
        assert_eq!(action["index"]["_index"], "the-answer-index");
        assert_eq!(action["index"]["routing"], "route-66");
        assert_eq!(action["index"]["version"], 7);
        assert_eq!(action["index"]["version_type"], "external");
        assert_eq!(lines[1], r#"{"meaning_of_life":42}"#);
        Ok(())
    }

    #[test]
    fn the_one_where_seq_no_rides_along_for_update_by_query() -> Result<()> {
        let op = WriteOperation::Index(IndexOperation {
            index: "books".into(),
            id: Some("1".into()),
            routing: None,
            version: None,
            version_type: VersionType::Internal,
            if_seq_no: Some(12),
            if_primary_term: Some(3),
            op_type: IndexOpType::Create,
            source: Map::new(),
        });
        let rendered = ElasticsearchBulk::transform_operation(&op)?;
        let action: Value = serde_json::from_str(rendered.split('\n').next().unwrap_or_default())?;
        assert_eq!(action["create"]["if_seq_no"], 12);
        assert_eq!(action["create"]["if_primary_term"], 3);
        assert!(action["create"].get("version").is_none(), "absent, not null");
        Ok(())
    }

    #[test]
    fn the_one_where_delete_travels_light() -> Result<()> {
        let op = WriteOperation::Delete(DeleteOperation {
            index: "books".into(),
            id: "gone".into(),
            routing: None,
            version: None,
            version_type: VersionType::Internal,
            if_seq_no: None,
            if_primary_term: None,
        });
        let rendered = ElasticsearchBulk::transform_operation(&op)?;
        assert!(!rendered.contains('\n'), "delete has no body line");
        assert_eq!(rendered, r#"{"delete":{"_id":"gone","_index":"books"}}"#);
        Ok(())
    }

    #[test]
    fn the_one_where_update_wraps_its_doc() -> Result<()> {
        let op = WriteOperation::Update(UpdateOperation {
            index: "books".into(),
            id: "1".into(),
            routing: None,
            if_seq_no: None,
            if_primary_term: None,
            doc: source(json!({"read": true})),
        });
        let rendered = ElasticsearchBulk::transform_operation(&op)?;
        assert_eq!(rendered.split('\n').nth(1), Some(r#"{"doc":{"read":true}}"#));
        Ok(())
    }

    #[test]
    fn the_one_where_the_body_ends_in_a_newline_because_it_matters() -> Result<()> {
        let op = WriteOperation::Delete(DeleteOperation {
            index: "i".into(),
            id: "1".into(),
            routing: None,
            version: None,
            version_type: VersionType::Internal,
            if_seq_no: None,
            if_primary_term: None,
        });
        let body = ElasticsearchBulk::render_body(&[op.clone(), op])?;
        assert!(body.ends_with('\n'));
        assert_eq!(body.lines().count(), 2);
        Ok(())
    }
}
