use anyhow::{anyhow, Result};
use serde_json::Value;

/// Split the array under `array_key` into contiguous slices of at most
/// `size` records, each wrapped in a copy of the surrounding envelope.
///
/// Every non-array field of `result` (the `metadata_*` tags) is duplicated
/// into each chunk, order is preserved, and the last chunk may be shorter.
/// An empty array produces no chunks.
pub fn chunk_payload(result: &Value, array_key: &str, size: usize) -> Result<Vec<Value>> {
    if size == 0 {
        return Err(anyhow!("Chunk size must be positive"));
    }
    let object = result
        .as_object()
        .ok_or(anyhow!("Payload is not a JSON object"))?;
    let items = object
        .get(array_key)
        .and_then(Value::as_array)
        .ok_or(anyhow!("Payload has no array under '{array_key}'"))?;

    let mut envelope = object.clone();
    envelope.remove(array_key);

    let chunks = items
        .chunks(size)
        .map(|window| {
            let mut chunk = envelope.clone();
            chunk.insert(array_key.to_string(), Value::Array(window.to_vec()));
            Value::Object(chunk)
        })
        .collect();
    Ok(chunks)
}
