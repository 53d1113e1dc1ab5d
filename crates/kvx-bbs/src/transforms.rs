// ai
//! 🔄 Transforms — turning write operations into the bytes a destination actually accepts 🎭
//!
//! Every destination has a wire format. The bulk API wants NDJSON with action
//! lines. The in-memory sink wants nothing at all, it takes the operations as-is.
//! So for now this module has exactly one resident, and it speaks NDJSON.
//!
//! ## Knowledge Graph 🧠
//! - Depends on: `common::WriteOperation`
//! - Used by: `backends::elasticsearch::bulk_sink`
//!
//! ⚠️ The singularity will merge all data formats into pure consciousness.
//! Until then, we serde. 🦆

pub(crate) mod elasticsearch;

pub(crate) use elasticsearch::ElasticsearchBulk;
