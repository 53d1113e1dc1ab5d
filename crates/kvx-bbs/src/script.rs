// ai
//! 🧪 Scripts — per-document mutations with a strictly limited vocabulary.
//!
//! 🎬 A document walks into a script. The script can rewrite its source,
//! send it to a different index, give it a new id, bump its version, change
//! its routing, or tell it to go away (`delete`) or that it was never really
//! here (`noop`). What the script may NOT do is invent a new `op`, or leave
//! junk lying around in the context. Either of those kills the whole run,
//! because a script that does that is broken for every document, not just this one. 🦆
//!
//! 🧠 Knowledge graph:
//! - [`ScriptContext`]: the fixed-shape record a script gets to mutate.
//! - [`DocumentScript`]: the trait scripts implement. Closures work too.
//! - [`BoundScript`]: a script plus its params, ready to run against many docs.
//! - [`ScriptRegistry`]: id → script lookup, pre-loaded with a few builtins.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::BulkByScrollError;

/// 🏷️ The only mapping type a modern index has.
pub const DEFAULT_DOC_TYPE: &str = "_doc";

/// 🎛️ What the script decided to do with the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptOp {
    Noop,
    Index,
    Delete,
}

impl ScriptOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptOp::Noop => "noop",
            ScriptOp::Index => "index",
            ScriptOp::Delete => "delete",
        }
    }

    /// 🔍 Anything outside `noop` / `index` / `delete` is a misconfigured script.
    pub fn parse(op: &str) -> Result<Self, BulkByScrollError> {
        match op {
            "noop" => Ok(ScriptOp::Noop),
            "index" => Ok(ScriptOp::Index),
            "delete" => Ok(ScriptOp::Delete),
            other => Err(BulkByScrollError::Script(format!(
                "Operation type [{other}] not allowed, only [noop, index, delete] are allowed"
            ))),
        }
    }
}

/// 📝 The record a script sees and mutates.
///
/// `extra` exists so scripts that scribble unknown keys get caught instead of
/// silently ignored. It must be empty when the script returns.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptContext {
    pub index: String,
    pub doc_type: String,
    pub id: Option<String>,
    pub version: Option<i64>,
    pub routing: Option<String>,
    pub source: Map<String, Value>,
    pub op: String,
    pub extra: Map<String, Value>,
}

impl ScriptContext {
    pub fn new(
        index: impl Into<String>,
        id: Option<String>,
        version: Option<i64>,
        routing: Option<String>,
        source: Map<String, Value>,
    ) -> Self {
        Self {
            index: index.into(),
            doc_type: DEFAULT_DOC_TYPE.to_string(),
            id,
            version,
            routing,
            source,
            op: ScriptOp::Index.as_str().to_string(),
            extra: Map::new(),
        }
    }

    /// ✅ The post-script contract: a known op, and nothing left over.
    pub fn validate(&self) -> Result<ScriptOp, BulkByScrollError> {
        let op = ScriptOp::parse(&self.op)?;
        if !self.extra.is_empty() {
            let keys: Vec<&str> = self.extra.keys().map(String::as_str).collect();
            return Err(BulkByScrollError::Script(format!(
                "Invalid fields added to context [{}]",
                keys.join(", ")
            )));
        }
        if self.doc_type != DEFAULT_DOC_TYPE {
            return Err(BulkByScrollError::Script(format!(
                "Modifying [_type] not allowed, tried to set it to [{}]",
                self.doc_type
            )));
        }
        Ok(op)
    }
}

/// 🧪 A per-document mutation. Runs once per hit, in batch order.
pub trait DocumentScript: Send + Sync {
    fn execute(&self, ctx: &mut ScriptContext, params: &Map<String, Value>) -> Result<()>;
}

impl<F> DocumentScript for F
where
    F: Fn(&mut ScriptContext, &Map<String, Value>) -> Result<()> + Send + Sync,
{
    fn execute(&self, ctx: &mut ScriptContext, params: &Map<String, Value>) -> Result<()> {
        self(ctx, params)
    }
}

/// 🔧 How a job names its script in config.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ScriptConfig {
    pub id: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

/// 🔗 A script with its params attached. Cheap to clone.
#[derive(Clone)]
pub struct BoundScript {
    pub id: String,
    pub params: Map<String, Value>,
    script: Arc<dyn DocumentScript>,
}

impl fmt::Debug for BoundScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundScript")
            .field("id", &self.id)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl BoundScript {
    pub fn new(id: impl Into<String>, params: Map<String, Value>, script: Arc<dyn DocumentScript>) -> Self {
        Self {
            id: id.into(),
            params,
            script,
        }
    }

    /// 🏃 Run against one context and check the result. Every failure is fatal to the run.
    pub fn apply(&self, ctx: &mut ScriptContext) -> Result<ScriptOp, BulkByScrollError> {
        self.script
            .execute(ctx, &self.params)
            .with_context(|| format!("script [{}] failed", self.id))
            .map_err(|err| BulkByScrollError::Script(format!("{err:#}")))?;
        ctx.validate()
    }
}

/// 📚 Scripts by id.
#[derive(Clone)]
pub struct ScriptRegistry {
    scripts: BTreeMap<String, Arc<dyn DocumentScript>>,
}

impl fmt::Debug for ScriptRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptRegistry")
            .field("scripts", &self.scripts.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for ScriptRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl ScriptRegistry {
    /// 📭 No scripts at all. Mostly for tests that want full control.
    pub fn empty() -> Self {
        Self {
            scripts: BTreeMap::new(),
        }
    }

    /// 🧰 The builtins: `set_fields`, `noop`, `delete`, `rename_index`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("set_fields", set_fields);
        registry.register("noop", |ctx: &mut ScriptContext, _: &Map<String, Value>| -> Result<()> {
            ctx.op = ScriptOp::Noop.as_str().to_string();
            Ok(())
        });
        registry.register("delete", |ctx: &mut ScriptContext, _: &Map<String, Value>| -> Result<()> {
            ctx.op = ScriptOp::Delete.as_str().to_string();
            Ok(())
        });
        registry.register("rename_index", rename_index);
        registry
    }

    pub fn register(&mut self, id: impl Into<String>, script: impl DocumentScript + 'static) {
        self.scripts.insert(id.into(), Arc::new(script));
    }

    /// 🔗 Look up `config.id` and bind its params.
    pub fn bind(&self, config: &ScriptConfig) -> Result<BoundScript, BulkByScrollError> {
        let script = self.scripts.get(&config.id).ok_or_else(|| {
            BulkByScrollError::InvalidRequest(format!(
                "unknown script [{}]; known scripts are [{}]",
                config.id,
                self.scripts.keys().cloned().collect::<Vec<_>>().join(", ")
            ))
        })?;
        Ok(BoundScript::new(
            config.id.clone(),
            config.params.clone(),
            Arc::clone(script),
        ))
    }
}

/// ✏️ Merge every param into the source, overwriting what's there.
fn set_fields(ctx: &mut ScriptContext, params: &Map<String, Value>) -> Result<()> {
    for (field, value) in params {
        ctx.source.insert(field.clone(), value.clone());
    }
    Ok(())
}

/// 🚚 Send the document to `params.index` instead.
fn rename_index(ctx: &mut ScriptContext, params: &Map<String, Value>) -> Result<()> {
    let index = params
        .get("index")
        .and_then(Value::as_str)
        .context("rename_index needs a string param named [index]")?;
    ctx.index = index.to_string();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> ScriptContext {
        ScriptContext::new(
            "src",
            Some("1".into()),
            Some(3),
            None,
            json!({"title": "Dune"}).as_object().cloned().unwrap_or_default(),
        )
    }

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn the_one_where_set_fields_merges_params_into_source() -> anyhow::Result<()> {
        let registry = ScriptRegistry::with_builtins();
        let script = registry.bind(&ScriptConfig {
            id: "set_fields".into(),
            params: params(json!({"read": true, "title": "Dune Messiah"})),
        })?;
        let mut ctx = ctx();
        assert_eq!(script.apply(&mut ctx)?, ScriptOp::Index);
        assert_eq!(ctx.source["read"], true);
        assert_eq!(ctx.source["title"], "Dune Messiah");
        Ok(())
    }

    #[test]
    fn the_one_where_an_unknown_op_is_fatal() {
        let mut registry = ScriptRegistry::empty();
        registry.register("creative", |ctx: &mut ScriptContext, _: &Map<String, Value>| -> Result<()> {
            ctx.op = "create".to_string();
            Ok(())
        });
        let script = registry.bind(&ScriptConfig {
            id: "creative".into(),
            params: Map::new(),
        });
        let Ok(script) = script else {
            panic!("registered script should bind");
        };
        let err = script.apply(&mut ctx()).unwrap_err();
        assert!(matches!(err, BulkByScrollError::Script(ref msg) if msg.contains("[create] not allowed")));
    }

    #[test]
    fn the_one_where_leftover_keys_are_fatal() {
        let mut registry = ScriptRegistry::empty();
        registry.register("litterbug", |ctx: &mut ScriptContext, _: &Map<String, Value>| -> Result<()> {
            ctx.extra.insert("_ttl".into(), json!("1d"));
            Ok(())
        });
        let script = registry
            .bind(&ScriptConfig {
                id: "litterbug".into(),
                params: Map::new(),
            })
            .unwrap();
        let err = script.apply(&mut ctx()).unwrap_err();
        assert!(err.to_string().contains("Invalid fields added to context [_ttl]"));
    }

    #[test]
    fn the_one_where_script_errors_become_script_errors() {
        let registry = ScriptRegistry::with_builtins();
        let script = registry
            .bind(&ScriptConfig {
                id: "rename_index".into(),
                params: Map::new(),
            })
            .unwrap();
        let err = script.apply(&mut ctx()).unwrap_err();
        assert!(matches!(err, BulkByScrollError::Script(ref msg) if msg.contains("rename_index")));
    }

    #[test]
    fn the_one_where_unknown_script_ids_are_an_invalid_request() {
        let err = ScriptRegistry::with_builtins()
            .bind(&ScriptConfig {
                id: "does_not_exist".into(),
                params: Map::new(),
            })
            .unwrap_err();
        assert!(matches!(err, BulkByScrollError::InvalidRequest(_)));
        assert!(err.to_string().contains("set_fields"));
    }

    #[test]
    fn the_one_where_noop_and_delete_just_flip_the_op() -> anyhow::Result<()> {
        let registry = ScriptRegistry::with_builtins();
        for (id, expected) in [("noop", ScriptOp::Noop), ("delete", ScriptOp::Delete)] {
            let script = registry.bind(&ScriptConfig {
                id: id.into(),
                params: Map::new(),
            })?;
            assert_eq!(script.apply(&mut ctx())?, expected);
        }
        Ok(())
    }
}
