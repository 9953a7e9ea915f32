//! Sends newline-delimited JSON documents to a bulk indexing endpoint.
//!
//! Every input file is read line by line. Each non-empty line is one JSON document, and
//! documents are grouped into bulk payloads of `batch_size` index actions. Payloads pass through
//! the [`Equalizer`] of an [`IngestPool`], so a slow endpoint slows down reading the files.

use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use futures::future;
use reqwest::header;
use serde::Deserialize;
use serde::de::IgnoredAny;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::Instant;
use url::Url;

use crate::equalizer::{BulkSink, Equalizer};
use crate::ingest::{IngestConfig, IngestItem, IngestPool, IngestSummary};

/// The action line preceding every document of a bulk payload.
const INDEX_ACTION: &str = r#"{"index":{}}"#;

/// An input file with one JSON document per line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DocumentFile {
    pub path: PathBuf,
    pub size: u64,
}

impl DocumentFile {
    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let metadata = tokio::fs::metadata(&path)
            .await
            .with_context(|| format!("failed to open `{}`", path.display()))?;
        anyhow::ensure!(metadata.is_file(), "`{}` is not a file", path.display());

        Ok(Self {
            size: metadata.len(),
            path,
        })
    }
}

impl IngestItem for DocumentFile {
    fn size(&self) -> u64 {
        self.size
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BulkResponse {
    errors: bool,
    items: Vec<BulkItem>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BulkItem {
    index: Option<BulkItemStatus>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BulkItemStatus {
    error: Option<BulkItemError>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BulkItemError {
    #[serde(rename = "type")]
    ty: String,
    reason: String,
}

/// Posts bulk payloads to an HTTP endpoint speaking the Elasticsearch bulk protocol.
#[derive(Clone, Debug)]
pub struct HttpBulkSink {
    client: reqwest::Client,
    url: Url,
}

impl HttpBulkSink {
    pub fn new(client: reqwest::Client, url: Url) -> Self {
        Self { client, url }
    }
}

#[async_trait]
impl BulkSink for HttpBulkSink {
    type Item = String;

    async fn send(&self, payload: String) -> anyhow::Result<()> {
        let response = self
            .client
            .post(self.url.clone())
            .header(header::CONTENT_TYPE, "application/x-ndjson")
            .body(payload)
            .send()
            .await
            .with_context(|| format!("failed to send bulk request to {}", self.url))?;

        let status = response.status();
        metric!(counter("ingest.responses") += 1, "status" => status.as_str());
        let body = response
            .bytes()
            .await
            .context("failed to read bulk response")?;

        if status.is_client_error() || status.is_server_error() {
            anyhow::bail!(
                "bulk endpoint responded with {status}: {}",
                String::from_utf8_lossy(&body)
            );
        }

        let response: BulkResponse =
            serde_json::from_slice(&body).context("invalid bulk response")?;
        if response.errors {
            let error = response
                .items
                .into_iter()
                .filter_map(|item| item.index?.error)
                .next();
            match error {
                Some(error) => anyhow::bail!(
                    "bulk endpoint rejected a document: {}: {}",
                    error.ty,
                    error.reason
                ),
                None => anyhow::bail!("bulk endpoint reported errors"),
            }
        }

        Ok(())
    }
}

/// Reads `file` and sends its documents in payloads of up to `batch_size` documents.
///
/// A payload is only built once the previous one was handed to the equalizer, and the time
/// spent reading it is reported as its generation time. Resolves once all payloads were sent.
pub async fn send_documents<S>(
    file: DocumentFile,
    equalizer: Equalizer<S>,
    batch_size: usize,
) -> anyhow::Result<()>
where
    S: BulkSink<Item = String>,
{
    let path = file.path.display();
    let input = tokio::fs::File::open(&file.path)
        .await
        .with_context(|| format!("failed to open `{path}`"))?;
    let mut lines = BufReader::new(input).lines();
    let batch_size = batch_size.max(1);

    let mut sent = vec![];
    let mut line_number = 0;
    loop {
        let started = Instant::now();
        let mut payload = String::new();
        let mut documents = 0;

        while documents < batch_size {
            let Some(line) = lines
                .next_line()
                .await
                .with_context(|| format!("failed to read `{path}`"))?
            else {
                break;
            };
            line_number += 1;

            let document = line.trim();
            if document.is_empty() {
                continue;
            }
            serde_json::from_str::<IgnoredAny>(document)
                .with_context(|| format!("invalid document at {path}:{line_number}"))?;

            payload.push_str(INDEX_ACTION);
            payload.push('\n');
            payload.push_str(document);
            payload.push('\n');
            documents += 1;
        }

        if documents == 0 {
            break;
        }

        let token = equalizer.ready().await?;
        tracing::trace!(file = %path, documents, "sending bulk payload");
        sent.push(equalizer.send(token, payload, started.elapsed()));
    }

    for result in future::join_all(sent).await {
        result?;
    }
    Ok(())
}

/// Sends the documents of all `paths` to the bulk endpoint at `target`.
pub async fn ingest_files(
    config: &IngestConfig,
    target: Url,
    paths: &[PathBuf],
) -> anyhow::Result<IngestSummary> {
    config.validate()?;

    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        files.push(DocumentFile::open(path).await?);
    }

    let sink = HttpBulkSink::new(reqwest::Client::new(), target);
    let batch_size = config.batch_size;
    IngestPool::from_config(config)
        .execute(files, sink, |file, equalizer| {
            send_documents(file, equalizer, batch_size)
        })
        .await
}
