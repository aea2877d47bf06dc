//! Agent-side files stored beside the index: the uuid mapping and metadata.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use vecagent_core::ObjectId;

use crate::error::Result;
use crate::model::AgentMetadata;

pub const KVS_FILE: &str = "kvs.bin";
pub const METADATA_FILE: &str = "agent-metadata.json";

/// Write through a temporary sibling and rename it into place.
fn write_atomic<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut BufWriter<File>) -> Result<()>,
{
    let tmp = path.with_extension("tmp");
    let mut writer = BufWriter::new(File::create(&tmp)?);
    write(&mut writer)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn save_kvs(dir: &Path, pairs: &[(String, ObjectId)]) -> Result<()> {
    write_atomic(&dir.join(KVS_FILE), |w| {
        bincode::serialize_into(w, pairs)?;
        Ok(())
    })
}

/// Saved pairs, or an empty list when no mapping was saved yet.
pub fn load_kvs(dir: &Path) -> Result<Vec<(String, ObjectId)>> {
    let path = dir.join(KVS_FILE);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let reader = BufReader::new(File::open(path)?);
    Ok(bincode::deserialize_from(reader)?)
}

pub fn save_metadata(dir: &Path, meta: &AgentMetadata) -> Result<()> {
    write_atomic(&dir.join(METADATA_FILE), |w| {
        serde_json::to_writer_pretty(w, meta)?;
        Ok(())
    })
}

pub fn load_metadata(dir: &Path) -> Result<Option<AgentMetadata>> {
    let path = dir.join(METADATA_FILE);
    if !path.exists() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_slice(&fs::read(path)?)?))
}
