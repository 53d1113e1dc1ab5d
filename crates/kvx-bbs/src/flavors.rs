// ai
//! 🎭 Flavors — what a run actually does to each document it finds.
//!
//! Three flavors, one engine:
//! - 🚚 [`Flavor::Reindex`] copies hits into a destination index.
//! - ✏️ [`Flavor::UpdateByQuery`] rewrites hits in place, guarded by `_seq_no` CAS.
//! - 🗑️ [`Flavor::DeleteByQuery`] deletes hits, also CAS-guarded.
//!
//! Each flavor answers three questions for the coordinator:
//! 1. `accept`: is this hit even processable? A "no" kills the run.
//! 2. `copy_metadata`: which of the hit's metadata rides along to the write?
//! 3. `build`: what write (if any) comes out the other end, script included?
//!
//! ⚠️ Script mutations of `_index`, `_id`, `_version` and `_routing` each go
//! through their own hook. Reindex honors them. Update-by-query refuses them
//! all, because an in-place update that moves the document isn't in place. 🦆

use std::fmt;

use serde::{Deserialize, Deserializer};
use tracing::trace;

use crate::common::{
    DeleteOperation, IndexOpType, IndexOperation, JSON_CONTENT_TYPE, MatchedDocument,
    VersionType, WriteOperation,
};
use crate::error::BulkByScrollError;
use crate::script::{BoundScript, ScriptContext, ScriptOp};

/// 🧭 Where a reindexed document's routing comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DestRouting {
    /// keep the hit's routing
    #[default]
    Keep,
    /// drop it and let the destination route by id
    Discard,
    /// route everything with this value
    Fixed(String),
}

impl DestRouting {
    /// 🔍 `keep`, `discard`, or `=value`.
    pub fn parse(raw: &str) -> Result<Self, BulkByScrollError> {
        match raw {
            "keep" => Ok(DestRouting::Keep),
            "discard" => Ok(DestRouting::Discard),
            other => other
                .strip_prefix('=')
                .map(|value| DestRouting::Fixed(value.to_string()))
                .ok_or_else(|| {
                    BulkByScrollError::InvalidRequest(format!(
                        "routing must be [keep], [discard] or [=value], got [{other}]"
                    ))
                }),
        }
    }
}

impl<'de> Deserialize<'de> for DestRouting {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DestRouting::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// 🚚 Where, and how, a reindex writes.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ReindexDestination {
    pub index: String,
    #[serde(default)]
    pub op_type: IndexOpType,
    /// `internal` ignores the hit's version; the external kinds copy it over
    #[serde(default)]
    pub version_type: VersionType,
    #[serde(default)]
    pub routing: DestRouting,
}

impl ReindexDestination {
    pub fn new(index: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            ..Default::default()
        }
    }
}

/// 🏷️ The metadata fields a script may try to change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataField {
    Index,
    Id,
    Version,
    Routing,
}

impl fmt::Display for MetadataField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MetadataField::Index => "_index",
            MetadataField::Id => "_id",
            MetadataField::Version => "_version",
            MetadataField::Routing => "_routing",
        };
        f.write_str(name)
    }
}

/// 📦 What `build` made of one hit.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltOperation {
    /// `None` when the script said `noop`
    pub operation: Option<WriteOperation>,
    /// which mutation hooks fired, in the order they fired
    pub mutations: Vec<MetadataField>,
}

impl BuiltOperation {
    pub fn is_noop(&self) -> bool {
        self.operation.is_none()
    }
}

/// 🎭 The per-run strategy for turning hits into writes.
#[derive(Debug, Clone, PartialEq)]
pub enum Flavor {
    Reindex(ReindexDestination),
    UpdateByQuery,
    DeleteByQuery,
}

impl Flavor {
    pub fn name(&self) -> &'static str {
        match self {
            Flavor::Reindex(_) => "reindex",
            Flavor::UpdateByQuery => "update_by_query",
            Flavor::DeleteByQuery => "delete_by_query",
        }
    }

    /// 🙅 Precondition check. A rejection is fatal to the run, not a filter.
    pub fn accept(&self, doc: &MatchedDocument) -> Result<(), BulkByScrollError> {
        if matches!(self, Flavor::DeleteByQuery) {
            return Ok(());
        }
        if doc.source.is_none() {
            return Err(BulkByScrollError::DocumentRejected(format!(
                "{} failed: document [{}][{}] has no _source; is _source disabled in the mapping?",
                self.name(),
                doc.index,
                doc.id
            )));
        }
        if doc.content_type != JSON_CONTENT_TYPE {
            return Err(BulkByScrollError::DocumentRejected(format!(
                "{} failed: document [{}][{}] has unsupported _source content type [{}]",
                self.name(),
                doc.index,
                doc.id,
                doc.content_type
            )));
        }
        Ok(())
    }

    /// 🧭 Copy routing from the hit, the way this flavor wants it.
    pub fn copy_metadata(&self, doc: &MatchedDocument, operation: &mut WriteOperation) {
        let routing = match self {
            Flavor::Reindex(dest) => match &dest.routing {
                DestRouting::Keep => doc.routing.clone(),
                DestRouting::Discard => None,
                DestRouting::Fixed(value) => Some(value.clone()),
            },
            Flavor::UpdateByQuery | Flavor::DeleteByQuery => doc.routing.clone(),
        };
        match operation {
            WriteOperation::Index(op) => op.routing = routing,
            WriteOperation::Update(op) => op.routing = routing,
            WriteOperation::Delete(op) => op.routing = routing,
        }
    }

    /// 🏗️ One accepted hit in, at most one write out.
    pub fn build(
        &self,
        doc: &MatchedDocument,
        script: Option<&BoundScript>,
    ) -> Result<BuiltOperation, BulkByScrollError> {
        let mut operation = self.initial_operation(doc)?;
        self.copy_metadata(doc, &mut operation);

        match (operation, script) {
            (WriteOperation::Index(op), Some(script)) => self.apply_script(doc, op, script),
            (operation, _) => Ok(BuiltOperation {
                operation: Some(operation),
                mutations: Vec::new(),
            }),
        }
    }

    fn initial_operation(&self, doc: &MatchedDocument) -> Result<WriteOperation, BulkByScrollError> {
        let cas = |doc: &MatchedDocument| match (doc.seq_no, doc.primary_term) {
            (Some(seq_no), Some(term)) => (Some(seq_no), Some(term)),
            _ => (None, None),
        };
        Ok(match self {
            Flavor::Reindex(dest) => WriteOperation::Index(IndexOperation {
                index: dest.index.clone(),
                id: Some(doc.id.clone()),
                routing: None,
                version: match dest.version_type {
                    VersionType::Internal => None,
                    VersionType::External | VersionType::ExternalGte => doc.version,
                },
                version_type: dest.version_type,
                if_seq_no: None,
                if_primary_term: None,
                op_type: dest.op_type,
                source: parse_source(doc)?,
            }),
            Flavor::UpdateByQuery => {
                let (if_seq_no, if_primary_term) = cas(doc);
                WriteOperation::Index(IndexOperation {
                    index: doc.index.clone(),
                    id: Some(doc.id.clone()),
                    routing: None,
                    version: None,
                    version_type: VersionType::Internal,
                    if_seq_no,
                    if_primary_term,
                    op_type: IndexOpType::Index,
                    source: parse_source(doc)?,
                })
            }
            Flavor::DeleteByQuery => {
                let (if_seq_no, if_primary_term) = cas(doc);
                WriteOperation::Delete(DeleteOperation {
                    index: doc.index.clone(),
                    id: doc.id.clone(),
                    routing: None,
                    version: None,
                    version_type: VersionType::Internal,
                    if_seq_no,
                    if_primary_term,
                })
            }
        })
    }

    fn apply_script(
        &self,
        doc: &MatchedDocument,
        mut op: IndexOperation,
        script: &BoundScript,
    ) -> Result<BuiltOperation, BulkByScrollError> {
        let pre_script_routing = op.routing.clone();
        let mut ctx = ScriptContext::new(
            doc.index.clone(),
            Some(doc.id.clone()),
            doc.version,
            doc.routing.clone(),
            std::mem::take(&mut op.source),
        );
        let new_op = script.apply(&mut ctx)?;
        op.source = std::mem::take(&mut ctx.source);

        let mut mutations = Vec::new();
        if ctx.index != doc.index {
            self.on_script_mutation(MetadataField::Index, &mut op, &ctx)?;
            mutations.push(MetadataField::Index);
        }
        if ctx.id.as_deref() != Some(doc.id.as_str()) {
            self.on_script_mutation(MetadataField::Id, &mut op, &ctx)?;
            mutations.push(MetadataField::Id);
        }
        if ctx.version != doc.version {
            self.on_script_mutation(MetadataField::Version, &mut op, &ctx)?;
            mutations.push(MetadataField::Version);
        }
        if ctx.routing != doc.routing {
            self.on_script_mutation(MetadataField::Routing, &mut op, &ctx)?;
            mutations.push(MetadataField::Routing);
        }

        let operation = match new_op {
            ScriptOp::Index => Some(WriteOperation::Index(op)),
            ScriptOp::Noop => {
                trace!(index = %doc.index, id = %doc.id, "🫥 script said noop");
                None
            }
            ScriptOp::Delete => {
                let Some(id) = op.id.clone() else {
                    return Err(BulkByScrollError::Script(format!(
                        "cannot delete [{}][{}] after the script removed its _id",
                        doc.index, doc.id
                    )));
                };
                // -- 🔒 deletes check against the version the hit was read at, not whatever the script set
                Some(WriteOperation::Delete(DeleteOperation {
                    index: op.index,
                    id,
                    routing: pre_script_routing,
                    version: doc.version,
                    version_type: VersionType::Internal,
                    if_seq_no: None,
                    if_primary_term: None,
                }))
            }
        };
        Ok(BuiltOperation {
            operation,
            mutations,
        })
    }

    /// 🪝 A script changed `field`. Reindex follows along; update-by-query says no.
    fn on_script_mutation(
        &self,
        field: MetadataField,
        op: &mut IndexOperation,
        ctx: &ScriptContext,
    ) -> Result<(), BulkByScrollError> {
        if !matches!(self, Flavor::Reindex(_)) {
            return Err(BulkByScrollError::Script(format!("Modifying [{field}] not allowed")));
        }
        match field {
            MetadataField::Index => op.index = ctx.index.clone(),
            MetadataField::Id => op.id = ctx.id.clone(),
            MetadataField::Version => match ctx.version {
                Some(version) => op.version = Some(version),
                None => {
                    // -- 🔓 clearing the version means "write whatever is there"
                    op.version = None;
                    op.version_type = VersionType::Internal;
                }
            },
            MetadataField::Routing => op.routing = ctx.routing.clone(),
        }
        Ok(())
    }
}

fn parse_source(
    doc: &MatchedDocument,
) -> Result<serde_json::Map<String, serde_json::Value>, BulkByScrollError> {
    doc.parse_source()
        .map_err(|err| BulkByScrollError::DocumentRejected(format!("{err:#}")))
}
