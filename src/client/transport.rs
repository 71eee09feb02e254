//! 传输层
//!
//! 按记录的协议把一次调用落到具体传输上。HTTP 走 reqwest，
//! gRPC 通过透传编解码器做免桩的动态 unary 调用。

use crate::error::{DiscoveryError, Result};
use crate::types::ServiceRecord;
use async_trait::async_trait;
use bytes::{Buf, BufMut};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tonic::Status;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::transport::{Channel, Endpoint};
use tracing::debug;

/// 传输层请求
#[derive(Debug, Clone)]
pub struct TransportRequest {
    /// HTTP 动词；gRPC 调用忽略
    pub method: String,
    /// HTTP 路径或 gRPC 方法全路径（`/package.Service/Method`）
    pub path: String,
    pub body: Vec<u8>,
}

impl TransportRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            body,
        }
    }
}

/// 传输层响应
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// 传输抽象，按实例协议选择实现
#[async_trait]
pub trait Transport: Send + Sync {
    async fn invoke(
        &self,
        record: &ServiceRecord,
        request: &TransportRequest,
    ) -> Result<TransportResponse>;
}

/// HTTP 传输
///
/// 实例 metadata 以 `x-service-*` 请求头随调用透传。
pub struct HttpTransport {
    http: reqwest::Client,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            timeout,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn invoke(
        &self,
        record: &ServiceRecord,
        request: &TransportRequest,
    ) -> Result<TransportResponse> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| DiscoveryError::backend("call", format!("invalid method: {}", e)))?;
        let url = format!("{}{}", record.http_url(), request.path);

        let mut builder = self
            .http
            .request(method, &url)
            .timeout(self.timeout)
            .body(request.body.clone());
        for (key, value) in &record.metadata {
            builder = builder.header(format!("x-service-{}", key), value);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| DiscoveryError::backend("call", format!("http {}: {}", url, e)))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| DiscoveryError::backend("call", format!("http {}: {}", url, e)))?
            .to_vec();

        debug!(url = %url, status, "Http call completed");
        Ok(TransportResponse { status, body })
    }
}

/// 字节透传编解码器，让 unary 调用无需生成的消息类型
#[derive(Debug, Clone, Default)]
struct RawCodec;

#[derive(Debug, Clone, Default)]
struct RawEncoder;

#[derive(Debug, Clone, Default)]
struct RawDecoder;

impl Encoder for RawEncoder {
    type Item = Vec<u8>;
    type Error = Status;

    fn encode(
        &mut self,
        item: Self::Item,
        dst: &mut EncodeBuf<'_>,
    ) -> std::result::Result<(), Self::Error> {
        dst.put_slice(&item);
        Ok(())
    }
}

impl Decoder for RawDecoder {
    type Item = Vec<u8>;
    type Error = Status;

    fn decode(
        &mut self,
        src: &mut DecodeBuf<'_>,
    ) -> std::result::Result<Option<Self::Item>, Self::Error> {
        let remaining = src.remaining();
        Ok(Some(src.copy_to_bytes(remaining).to_vec()))
    }
}

impl Codec for RawCodec {
    type Encode = Vec<u8>;
    type Decode = Vec<u8>;
    type Encoder = RawEncoder;
    type Decoder = RawDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        RawEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        RawDecoder
    }
}

/// gRPC 传输
///
/// Channel 按服务名缓存并粘滞复用：同名实例地址变化时已建连接不重建，
/// 连接失效由下一次调用报错、重试换实例兜底。
pub struct GrpcTransport {
    channels: Mutex<HashMap<String, Channel>>,
    timeout: Duration,
}

impl GrpcTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    async fn channel_for(&self, record: &ServiceRecord) -> Result<Channel> {
        let mut channels = self.channels.lock().await;
        if let Some(channel) = channels.get(&record.name) {
            return Ok(channel.clone());
        }

        let endpoint = Endpoint::from_shared(record.grpc_uri())
            .map_err(|e| DiscoveryError::backend("call", format!("invalid uri: {}", e)))?
            .connect_timeout(self.timeout)
            .timeout(self.timeout);
        let channel = endpoint
            .connect()
            .await
            .map_err(|e| {
                DiscoveryError::backend(
                    "call",
                    format!("grpc connect {}: {}", record.grpc_uri(), e),
                )
            })?;

        debug!(service = %record.name, uri = %record.grpc_uri(), "Grpc channel created");
        channels.insert(record.name.clone(), channel.clone());
        Ok(channel)
    }
}

#[async_trait]
impl Transport for GrpcTransport {
    async fn invoke(
        &self,
        record: &ServiceRecord,
        request: &TransportRequest,
    ) -> Result<TransportResponse> {
        let channel = self.channel_for(record).await?;
        let path: http::uri::PathAndQuery = request
            .path
            .parse()
            .map_err(|e| DiscoveryError::backend("call", format!("invalid grpc path: {}", e)))?;

        let mut grpc = tonic::client::Grpc::new(channel);
        grpc.ready()
            .await
            .map_err(|e| DiscoveryError::backend("call", format!("grpc not ready: {}", e)))?;

        let response = grpc
            .unary(
                tonic::Request::new(request.body.clone()),
                path,
                RawCodec,
            )
            .await
            .map_err(|status| {
                DiscoveryError::backend("call", format!("grpc {}: {}", request.path, status))
            })?;

        Ok(TransportResponse {
            status: 200,
            body: response.into_inner(),
        })
    }
}
