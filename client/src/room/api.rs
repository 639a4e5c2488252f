//! SFU REST client.

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use rtc_common::api::{
    endpoints, ConnectTransportRequest, ConsumeRequest, ConsumerDescriptor,
    CreateTransportRequest, DtlsParameters, MuteParticipantRequest, ProduceRequest,
    ProduceResponse, RemoveParticipantRequest, RoomHandshake, RoomRequest, TransportOptions,
};
use rtc_common::TransportDirection;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error};

/// REST errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("Connection failed: {0}")]
    Request(String),
    #[error("Server returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Invalid response: {0}")]
    Decode(String),
}

/// The SFU's room/transport/producer/consumer endpoints.
#[async_trait]
pub trait SfuApi: Send + Sync {
    async fn create_room(&self, room_id: &str) -> Result<RoomHandshake, ApiError>;

    async fn join_room(&self, room_id: &str) -> Result<RoomHandshake, ApiError>;

    async fn create_transport(
        &self,
        room_id: &str,
        direction: TransportDirection,
    ) -> Result<TransportOptions, ApiError>;

    async fn connect_transport(
        &self,
        transport_id: &str,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), ApiError>;

    /// Returns the server-assigned producer id.
    async fn produce(&self, request: ProduceRequest) -> Result<ProduceResponse, ApiError>;

    /// `None` when the server has nothing to consume for the producer.
    async fn consume(&self, request: ConsumeRequest)
        -> Result<Option<ConsumerDescriptor>, ApiError>;

    async fn mute_participant(&self, request: MuteParticipantRequest) -> Result<(), ApiError>;

    async fn remove_participant(&self, request: RemoveParticipantRequest)
        -> Result<(), ApiError>;

    async fn leave_room(&self, room_id: &str) -> Result<(), ApiError>;
}

/// [`SfuApi`] over HTTP with bearer authentication.
#[derive(Debug, Clone)]
pub struct HttpSfuApi {
    http: HttpClient,
    base_url: String,
    token: Option<String>,
}

impl HttpSfuApi {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self::with_client(HttpClient::new(), base_url, token)
    }

    pub fn with_client(
        http: HttpClient,
        base_url: impl Into<String>,
        token: Option<String>,
    ) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http,
            base_url,
            token,
        }
    }

    async fn send<B: Serialize + Sync>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response, ApiError> {
        let mut request = self.http.post(format!("{}{path}", self.base_url)).json(body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        debug!(path, "SFU request");
        let response = request.send().await.map_err(|e| {
            error!(path, "SFU request failed: {}", e);
            ApiError::Request(e.to_string())
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(path, "SFU request rejected: {} - {}", status, body);
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn post<B, R>(&self, path: &str, body: &B) -> Result<R, ApiError>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        self.send(path, body)
            .await?
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))
    }

    async fn post_unit<B: Serialize + Sync>(&self, path: &str, body: &B) -> Result<(), ApiError> {
        self.send(path, body).await.map(|_| ())
    }
}

#[async_trait]
impl SfuApi for HttpSfuApi {
    async fn create_room(&self, room_id: &str) -> Result<RoomHandshake, ApiError> {
        self.post(
            endpoints::ROOM_CREATE,
            &RoomRequest {
                room_id: room_id.to_string(),
            },
        )
        .await
    }

    async fn join_room(&self, room_id: &str) -> Result<RoomHandshake, ApiError> {
        self.post(
            endpoints::ROOM_JOIN,
            &RoomRequest {
                room_id: room_id.to_string(),
            },
        )
        .await
    }

    async fn create_transport(
        &self,
        room_id: &str,
        direction: TransportDirection,
    ) -> Result<TransportOptions, ApiError> {
        self.post(
            endpoints::TRANSPORT_CREATE,
            &CreateTransportRequest {
                room_id: room_id.to_string(),
                direction,
            },
        )
        .await
    }

    async fn connect_transport(
        &self,
        transport_id: &str,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), ApiError> {
        self.post_unit(
            endpoints::TRANSPORT_CONNECT,
            &ConnectTransportRequest {
                transport_id: transport_id.to_string(),
                dtls_parameters,
            },
        )
        .await
    }

    async fn produce(&self, request: ProduceRequest) -> Result<ProduceResponse, ApiError> {
        self.post(endpoints::PRODUCE, &request).await
    }

    async fn consume(
        &self,
        request: ConsumeRequest,
    ) -> Result<Option<ConsumerDescriptor>, ApiError> {
        self.post(endpoints::CONSUME, &request).await
    }

    async fn mute_participant(&self, request: MuteParticipantRequest) -> Result<(), ApiError> {
        self.post_unit(endpoints::PARTICIPANT_MUTE, &request).await
    }

    async fn remove_participant(
        &self,
        request: RemoveParticipantRequest,
    ) -> Result<(), ApiError> {
        self.post_unit(endpoints::PARTICIPANT_REMOVE, &request).await
    }

    async fn leave_room(&self, room_id: &str) -> Result<(), ApiError> {
        self.post_unit(
            endpoints::ROOM_LEAVE,
            &RoomRequest {
                room_id: room_id.to_string(),
            },
        )
        .await
    }
}
