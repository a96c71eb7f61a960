//! Typed HTTP calls against a node's API, shared by peers and the failover client.

use std::time::Duration;

use futures::{Stream, StreamExt};
use reqwest::{Client, RequestBuilder, header::ACCEPT};
use serde::{Deserialize, de::DeserializeOwned};

use super::error::{ClientError, ClientResult};
use crate::{
    dao::models::GameMode,
    dto::{
        cluster::PingResponse,
        feed::FeedMessage,
        replication::{
            ApplyChangeResponse, ChangeEvent, ExportResponse, MergeRequest, MergeResponse,
            TableRows,
        },
        scores::{BestScoresResponse, SaveScoreRequest, SaveScoreResponse, ScoreRow},
    },
};

/// Shape of every error body produced by a node.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ErrorEnvelope {
    message: String,
}

#[derive(Clone)]
pub struct NodeApi {
    client: Client,
}

impl NodeApi {
    pub fn new() -> ClientResult<Self> {
        let client = Client::builder()
            .build()
            .map_err(|source| ClientError::Builder { source })?;
        Ok(Self { client })
    }

    fn url(address: &str, path: &str) -> String {
        format!("http://{address}{path}")
    }

    async fn send<T: DeserializeOwned>(
        &self,
        address: &str,
        builder: RequestBuilder,
    ) -> ClientResult<T> {
        let transport = |source| ClientError::Transport {
            address: address.to_owned(),
            source,
        };

        let response = builder.send().await.map_err(transport)?;
        let status = response.status();
        if !status.is_success() {
            let message = response
                .json::<ErrorEnvelope>()
                .await
                .map(|body| body.message)
                .unwrap_or_else(|_| status.canonical_reason().unwrap_or("error").to_owned());
            return Err(ClientError::Rejected {
                address: address.to_owned(),
                status: status.as_u16(),
                message,
            });
        }

        response.json::<T>().await.map_err(transport)
    }

    /// Liveness probe bounded by `timeout`.
    pub async fn ping(&self, address: &str, timeout: Duration) -> ClientResult<PingResponse> {
        let builder = self
            .client
            .get(Self::url(address, "/ping"))
            .timeout(timeout);
        self.send(address, builder).await
    }

    pub async fn apply_change(
        &self,
        address: &str,
        event: &ChangeEvent,
        timeout: Duration,
    ) -> ClientResult<()> {
        let builder = self
            .client
            .post(Self::url(address, "/apply-change"))
            .json(event)
            .timeout(timeout);
        let body: ApplyChangeResponse = self.send(address, builder).await?;
        ensure_success(address, body.success, "change was not applied")
    }

    pub async fn export_all(&self, address: &str, timeout: Duration) -> ClientResult<TableRows> {
        let builder = self
            .client
            .get(Self::url(address, "/export-all"))
            .timeout(timeout);
        let body: ExportResponse = self.send(address, builder).await?;
        ensure_success(address, body.success, "export failed")?;
        Ok(body.data)
    }

    /// Bulk merge; returns how many rows were new to the node.
    pub async fn merge(
        &self,
        address: &str,
        data: TableRows,
        timeout: Duration,
    ) -> ClientResult<usize> {
        let builder = self
            .client
            .post(Self::url(address, "/merge-from-remote"))
            .json(&MergeRequest { data })
            .timeout(timeout);
        let body: MergeResponse = self.send(address, builder).await?;
        ensure_success(address, body.success, "merge failed")?;
        Ok(body.count)
    }

    pub async fn save_score(
        &self,
        address: &str,
        request: &SaveScoreRequest,
        timeout: Duration,
    ) -> ClientResult<String> {
        let builder = self
            .client
            .post(Self::url(address, "/save-score"))
            .json(request)
            .timeout(timeout);
        let body: SaveScoreResponse = self.send(address, builder).await?;
        ensure_success(address, body.success, &body.message)?;
        Ok(body.message)
    }

    pub async fn best_scores(
        &self,
        address: &str,
        mode: GameMode,
        limit: Option<usize>,
        timeout: Duration,
    ) -> ClientResult<Vec<ScoreRow>> {
        let path = match limit {
            Some(limit) => format!("/best-scores?mode={mode}&limit={limit}"),
            None => format!("/best-scores?mode={mode}"),
        };
        let builder = self
            .client
            .get(Self::url(address, &path))
            .timeout(timeout);
        let body: BestScoresResponse = self.send(address, builder).await?;
        ensure_success(address, body.success, "query failed")?;
        Ok(body.data)
    }

    /// Open the change feed of `address`. The stream ends when the connection closes.
    pub async fn subscribe(
        &self,
        address: &str,
    ) -> ClientResult<impl Stream<Item = ClientResult<FeedMessage>> + Send + 'static> {
        let response = self
            .client
            .get(Self::url(address, "/subscribe-changes"))
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|source| ClientError::Transport {
                address: address.to_owned(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Rejected {
                address: address.to_owned(),
                status: status.as_u16(),
                message: "subscription refused".into(),
            });
        }

        let address = address.to_owned();
        let mut bytes = response.bytes_stream();
        Ok(async_stream::stream! {
            let mut buffer: Vec<u8> = Vec::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(source) => {
                        yield Err(ClientError::Transport { address: address.clone(), source });
                        break;
                    }
                };
                buffer.extend_from_slice(&chunk);

                while let Some(end) = frame_end(&buffer) {
                    let frame: Vec<u8> = buffer.drain(..end).collect();
                    let Some(data) = frame_data(&String::from_utf8_lossy(&frame)) else {
                        continue;
                    };
                    yield serde_json::from_str::<FeedMessage>(&data).map_err(|source| {
                        ClientError::MalformedFrame { address: address.clone(), source }
                    });
                }
            }
        })
    }
}

fn ensure_success(address: &str, success: bool, message: &str) -> ClientResult<()> {
    if success {
        Ok(())
    } else {
        Err(ClientError::Rejected {
            address: address.to_owned(),
            status: 200,
            message: message.to_owned(),
        })
    }
}

/// Length of the first complete SSE frame in `buffer`, separator included.
fn frame_end(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(2)
        .position(|window| window == b"\n\n")
        .map(|position| position + 2)
}

/// Joined `data:` lines of a frame; `None` for comment-only frames such as keep-alives.
fn frame_data(frame: &str) -> Option<String> {
    let lines: Vec<&str> = frame
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
        .collect();

    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}
