use std::fmt;

use async_trait::async_trait;
use errors::ErrorMetadata;
use futures::StreamExt;
use rand::Rng;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use url::Url;

use crate::{
    message::TopicMessage,
    subscription::TopicSubscription,
    Index,
    Ipfs,
    MachineId,
};

/// Client for the IPFS node's HTTP API.
///
/// A machine's log is a chain of dag-json nodes `{ prev, inputs }`; the head
/// CID is published under the machine's IPNS key and serves as the log's
/// index. The machine id is also the pub/sub topic name (multibase-encoded on
/// the wire, as the API requires).
pub struct HttpIpfsClient {
    http: reqwest::Client,
    base: Url,
}

/// One append: the inputs of this batch and the previous head, if any.
#[derive(Debug, serde::Serialize, Deserialize)]
struct LogNode {
    prev: Option<String>,
    inputs: Vec<JsonValue>,
}

#[derive(Deserialize)]
struct KeyGenResponse {
    #[serde(rename = "Id")]
    id: String,
}

#[derive(Deserialize)]
struct DagPutResponse {
    #[serde(rename = "Cid")]
    cid: CidRef,
}

#[derive(Deserialize)]
struct CidRef {
    #[serde(rename = "/")]
    path: String,
}

#[derive(Deserialize)]
struct NameResolveResponse {
    #[serde(rename = "Path")]
    path: String,
}

#[derive(Deserialize)]
struct SubLine {
    data: String,
}

fn ipfs_error(op: &str, err: impl fmt::Display) -> anyhow::Error {
    anyhow::Error::new(ErrorMetadata::ipfs_error(format!("{op}: {err}")))
}

/// Topic names go over the pub/sub API in multibase (base64url, no padding).
fn multibase_encode(data: &[u8]) -> String {
    format!("u{}", base64::encode_config(data, base64::URL_SAFE_NO_PAD))
}

fn multibase_decode(encoded: &str) -> Option<Vec<u8>> {
    let rest = encoded.strip_prefix('u')?;
    base64::decode_config(rest, base64::URL_SAFE_NO_PAD).ok()
}

/// One line of the pub/sub stream carries one message; anything undecodable
/// is not ours and is skipped.
fn decode_sub_line(line: &[u8]) -> Option<TopicMessage> {
    let line: SubLine = serde_json::from_slice(line).ok()?;
    let payload = multibase_decode(&line.data)?;
    TopicMessage::decode(&payload)
}

impl HttpIpfsClient {
    pub fn new(api_base: Url) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: api_base,
        }
    }

    fn endpoint(&self, path: &str) -> anyhow::Result<Url> {
        self.base
            .join(path)
            .map_err(|e| ipfs_error("building API url", e))
    }

    async fn api_call<T: serde::de::DeserializeOwned>(
        &self,
        op: &str,
        request: reqwest::RequestBuilder,
    ) -> anyhow::Result<T> {
        let response = request.send().await.map_err(|e| ipfs_error(op, e))?;
        let response = response
            .error_for_status()
            .map_err(|e| ipfs_error(op, e))?;
        response.json().await.map_err(|e| ipfs_error(op, e))
    }

    /// The current head CID of the machine's log, `None` when the key has
    /// never been published (an empty log).
    async fn resolve_head(&self, id: &MachineId) -> anyhow::Result<Option<String>> {
        let op = "name/resolve";
        let request = self
            .http
            .post(self.endpoint("/api/v0/name/resolve")?)
            .query(&[("arg", format!("/ipns/{id}")), ("nocache", "true".to_string())]);
        let response = request.send().await.map_err(|e| ipfs_error(op, e))?;
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            if body.contains("could not resolve") {
                return Ok(None);
            }
            return Err(ipfs_error(op, body));
        }
        let resolved: NameResolveResponse =
            response.json().await.map_err(|e| ipfs_error(op, e))?;
        let cid = resolved
            .path
            .strip_prefix("/ipfs/")
            .unwrap_or(&resolved.path)
            .to_string();
        Ok(Some(cid))
    }

    async fn dag_put(&self, node: &LogNode) -> anyhow::Result<String> {
        let op = "dag/put";
        let bytes = serde_json::to_vec(node).map_err(|e| ipfs_error(op, e))?;
        let form = reqwest::multipart::Form::new()
            .part("file", reqwest::multipart::Part::bytes(bytes));
        let request = self
            .http
            .post(self.endpoint("/api/v0/dag/put")?)
            .query(&[
                ("store-codec", "dag-json"),
                ("input-codec", "dag-json"),
                ("pin", "true"),
            ])
            .multipart(form);
        let put: DagPutResponse = self.api_call(op, request).await?;
        Ok(put.cid.path)
    }

    async fn dag_get(&self, cid: &str) -> anyhow::Result<LogNode> {
        let request = self
            .http
            .post(self.endpoint("/api/v0/dag/get")?)
            .query(&[("arg", cid)]);
        self.api_call("dag/get", request).await
    }

    async fn name_publish(&self, id: &MachineId, cid: &str) -> anyhow::Result<()> {
        let request = self
            .http
            .post(self.endpoint("/api/v0/name/publish")?)
            .query(&[
                ("arg", format!("/ipfs/{cid}")),
                ("key", id.to_string()),
                ("allow-offline", "true".to_string()),
            ]);
        let _: JsonValue = self.api_call("name/publish", request).await?;
        Ok(())
    }
}

#[async_trait]
impl Ipfs for HttpIpfsClient {
    async fn create_machine_id(&self) -> anyhow::Result<MachineId> {
        let key_name: u128 = rand::rng().random();
        let request = self
            .http
            .post(self.endpoint("/api/v0/key/gen")?)
            .query(&[
                ("arg", format!("machine-{key_name:032x}")),
                ("type", "ed25519".to_string()),
            ]);
        let key: KeyGenResponse = self.api_call("key/gen", request).await?;
        Ok(MachineId(key.id))
    }

    async fn write_log(&self, id: &MachineId, inputs: &[JsonValue]) -> anyhow::Result<Index> {
        let prev = self.resolve_head(id).await?;
        let node = LogNode {
            prev,
            inputs: inputs.to_vec(),
        };
        let cid = self.dag_put(&node).await?;
        self.name_publish(id, &cid).await?;
        Ok(Index(cid))
    }

    async fn read_log_from(
        &self,
        id: &MachineId,
        from_exclusive: Option<&Index>,
    ) -> anyhow::Result<(Option<Index>, Vec<JsonValue>)> {
        let Some(head) = self.resolve_head(id).await? else {
            return Ok((None, Vec::new()));
        };
        let mut batches = Vec::new();
        let mut cursor = Some(head.clone());
        while let Some(cid) = cursor.take() {
            if from_exclusive.is_some_and(|from| from.0 == cid) {
                break;
            }
            let node = self.dag_get(&cid).await?;
            batches.push(node.inputs);
            cursor = node.prev;
        }
        // Walked newest to oldest; the log reads oldest first.
        batches.reverse();
        let inputs = batches.into_iter().flatten().collect();
        Ok((Some(Index(head)), inputs))
    }

    async fn subscribe(&self, id: &MachineId) -> anyhow::Result<TopicSubscription> {
        let op = "pubsub/sub";
        let request = self
            .http
            .post(self.endpoint("/api/v0/pubsub/sub")?)
            .query(&[("arg", multibase_encode(id.0.as_bytes()))]);
        let response = request.send().await.map_err(|e| ipfs_error(op, e))?;
        let response = response
            .error_for_status()
            .map_err(|e| ipfs_error(op, e))?;

        let body = Box::pin(response.bytes_stream());
        let stream = futures::stream::unfold(
            (body, Vec::new()),
            |(mut body, mut buffer)| async move {
                loop {
                    if let Some(newline) = buffer.iter().position(|&b| b == b'\n') {
                        let line: Vec<u8> = buffer.drain(..=newline).collect();
                        match decode_sub_line(&line) {
                            Some(message) => return Some((message, (body, buffer))),
                            None => continue,
                        }
                    }
                    match body.next().await {
                        Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                        Some(Err(err)) => {
                            tracing::warn!("Pub/sub stream failed: {err}");
                            return None;
                        },
                        None => return None,
                    }
                }
            },
        );
        Ok(TopicSubscription::new(stream))
    }

    async fn publish(&self, id: &MachineId, message: &TopicMessage) -> anyhow::Result<()> {
        let form = reqwest::multipart::Form::new()
            .part("file", reqwest::multipart::Part::bytes(message.encode()));
        let request = self
            .http
            .post(self.endpoint("/api/v0/pubsub/pub")?)
            .query(&[("arg", multibase_encode(id.0.as_bytes()))])
            .multipart(form);
        let op = "pubsub/pub";
        let response = request.send().await.map_err(|e| ipfs_error(op, e))?;
        response
            .error_for_status()
            .map_err(|e| ipfs_error(op, e))?;
        Ok(())
    }
}
