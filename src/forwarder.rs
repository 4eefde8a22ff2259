use std::cell::RefCell;
use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose, Engine as _};
use hmac::{Hmac, Mac};
use log::{info, warn};
use serde_json::Value;
use sha2::Sha256;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::OffsetDateTime;

use crate::utils::chunk_payload;

type HmacSha256 = Hmac<Sha256>;

/// A sink whose delivery failures are fatal for the payload.
pub trait LogSink {
    fn send(&self, payload: &Value, log_type: &str) -> Result<()>;
}

/// A best-effort sink; callers log and continue on failure.
pub trait ObjectStore {
    fn put(&self, bucket: &str, key: &str, body: &str, region: &str) -> Result<()>;
}

/// An [`ObjectStore`] destination plus where to write in it.
pub struct StoreTarget<'a> {
    pub store: &'a dyn ObjectStore,
    pub bucket: &'a str,
    pub region: &'a str,
}

/// Azure Log Analytics HTTP Data Collector endpoint.
pub struct LogAnalyticsSink {
    workspace_id: String,
    workspace_key: String,
}

impl LogAnalyticsSink {
    pub fn new(workspace_id: String, workspace_key: String) -> Self {
        LogAnalyticsSink {
            workspace_id,
            workspace_key,
        }
    }
}

impl LogSink for LogAnalyticsSink {
    fn send(&self, payload: &Value, log_type: &str) -> Result<()> {
        let serialized = serde_json::to_string(payload)?;
        let body = json_escape_utf(&serialized);
        let date = rfc1123_date(OffsetDateTime::now_utc())?;
        let signature =
            build_signature(&self.workspace_id, &self.workspace_key, &date, body.len())?;
        let url = format!(
            "https://{}.ods.opinsights.azure.com/api/logs?api-version=2016-04-01",
            self.workspace_id
        );

        let result = ureq::post(&url)
            .set("Content-Type", "application/json")
            .set("Authorization", &signature)
            .set("Log-Type", log_type)
            .set("x-ms-date", &date)
            .send_string(&body);
        match result {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(status, _)) => Err(anyhow!(
                "Error posting data to Azure Log Analytics: {status}"
            )),
            Err(err) => Err(anyhow!("Error posting data to Azure Log Analytics: {err}")),
        }
    }
}

/// Shared-key authorization header: HMAC-SHA256 over the canonical request
/// string, keyed with the base64-decoded workspace key.
fn build_signature(
    workspace_id: &str,
    workspace_key: &str,
    date: &str,
    content_length: usize,
) -> Result<String> {
    let string_to_hash =
        format!("POST\n{content_length}\napplication/json\nx-ms-date:{date}\n/api/logs");
    let decoded_key = general_purpose::STANDARD
        .decode(workspace_key)
        .with_context(|| "Workspace key is not valid base64")?;
    let mut mac = HmacSha256::new_from_slice(&decoded_key)
        .map_err(|_| anyhow!("Workspace key has an invalid length"))?;
    mac.update(string_to_hash.as_bytes());
    let signature = general_purpose::STANDARD.encode(mac.finalize().into_bytes());
    Ok(format!("SharedKey {workspace_id}:{signature}"))
}

fn rfc1123_date(now: OffsetDateTime) -> Result<String> {
    let format = format_description!(
        "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
    );
    Ok(now.format(&format)?)
}

/// The ingestion endpoint rejects bodies with raw non-ASCII text. ASCII
/// passes through unchanged; everything else becomes `\uXXXX` escapes
/// (surrogate pairs for astral codepoints).
pub fn json_escape_utf(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    let mut units = [0u16; 2];
    for ch in input.chars() {
        if ch.is_ascii() {
            escaped.push(ch);
        } else {
            for unit in ch.encode_utf16(&mut units) {
                escaped.push_str(&format!("\\u{unit:04x}"));
            }
        }
    }
    escaped
}

/// Per-region S3 clients, built lazily and cached for the run.
pub struct S3Registry {
    runtime: tokio::runtime::Runtime,
    clients: RefCell<HashMap<String, aws_sdk_s3::Client>>,
}

impl S3Registry {
    pub fn new() -> Result<Self> {
        let runtime =
            tokio::runtime::Runtime::new().with_context(|| "Failed to start the S3 runtime")?;
        Ok(S3Registry {
            runtime,
            clients: RefCell::new(HashMap::new()),
        })
    }

    fn client_for(&self, region: &str) -> aws_sdk_s3::Client {
        if let Some(client) = self.clients.borrow().get(region) {
            return client.clone();
        }
        let config = self.runtime.block_on(
            aws_config::defaults(aws_config::BehaviorVersion::latest())
                .region(aws_config::Region::new(region.to_string()))
                .load(),
        );
        let client = aws_sdk_s3::Client::new(&config);
        self.clients
            .borrow_mut()
            .insert(region.to_string(), client.clone());
        client
    }
}

impl ObjectStore for S3Registry {
    fn put(&self, bucket: &str, key: &str, body: &str, region: &str) -> Result<()> {
        let client = self.client_for(region);
        self.runtime
            .block_on(
                client
                    .put_object()
                    .bucket(bucket)
                    .key(key)
                    .content_type("application/json")
                    .body(aws_sdk_s3::primitives::ByteStream::from(
                        body.as_bytes().to_vec(),
                    ))
                    .send(),
            )
            .map_err(|err| anyhow!("Error uploading data to S3: {err}"))?;
        Ok(())
    }
}

/// Send one query result to the sinks. Array domains are split into chunks
/// of at most `chunk_size` records; scalar domains go out as-is. A log sink
/// failure aborts; an object store failure is logged and skipped.
pub fn forward_payload(
    log_sink: &dyn LogSink,
    store: Option<&StoreTarget>,
    payload: &Value,
    array_key: Option<&str>,
    log_type: &str,
    chunk_size: usize,
) -> Result<()> {
    match array_key {
        Some(key) => {
            let chunks = chunk_payload(payload, key, chunk_size)?;
            let total = chunks.len();
            if total == 0 {
                info!("{log_type}: nothing to forward");
            }
            for (index, chunk) in chunks.iter().enumerate() {
                send_to_sinks(log_sink, store, chunk, log_type)?;
                info!("{log_type}: forwarded chunk {} of {total}", index + 1);
            }
        }
        None => {
            send_to_sinks(log_sink, store, payload, log_type)?;
            info!("{log_type}: forwarded");
        }
    }
    Ok(())
}

fn send_to_sinks(
    log_sink: &dyn LogSink,
    store: Option<&StoreTarget>,
    payload: &Value,
    log_type: &str,
) -> Result<()> {
    log_sink.send(payload, log_type)?;
    if let Some(target) = store {
        let key = object_key(payload);
        let body = serde_json::to_string_pretty(payload)?;
        if let Err(err) = target.store.put(target.bucket, &key, &body, target.region) {
            warn!("Skipping object store upload for {log_type}: {err}");
        }
    }
    Ok(())
}

/// `{domain}/{owner}-{repo}-{timestamp}.json`; org-scoped payloads have no
/// repo segment.
fn object_key(payload: &Value) -> String {
    let domain = payload
        .get("metadata_query")
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    let owner = payload
        .get("metadata_owner")
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    let timestamp = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default();
    match payload.get("metadata_repo").and_then(Value::as_str) {
        Some(repo) => format!("{domain}/{owner}-{repo}-{timestamp}.json"),
        None => format!("{domain}/{owner}-{timestamp}.json"),
    }
}
