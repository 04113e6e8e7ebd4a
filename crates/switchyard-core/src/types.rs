//! Core data model shared by every stage of the dispatch path.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt,
    hash::{Hash, Hasher},
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;
use url::Url;

use crate::invoker::PendingSlot;

pub const DEFAULT_WEIGHT: u32 = 100;
pub const DEFAULT_SERIALIZATION: &str = "default";

/// Identity of a remote endpoint. Two endpoints are the same endpoint iff their keys are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointKey {
    pub host: Arc<str>,
    pub port: u16,
    pub protocol: Arc<str>,
    pub serialization: Arc<str>,
}

impl EndpointKey {
    #[must_use]
    pub fn new(protocol: &str, host: &str, port: u16, serialization: &str) -> Self {
        Self {
            host: Arc::from(host),
            port,
            protocol: Arc::from(protocol),
            serialization: Arc::from(serialization),
        }
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.protocol, self.host, self.port)
    }
}

/// Errors raised while parsing an endpoint URL.
#[derive(Debug, Error)]
pub enum EndpointParseError {
    #[error("Invalid endpoint url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Endpoint url has no host: {0}")]
    MissingHost(String),

    #[error("Endpoint url has no port: {0}")]
    MissingPort(String),

    #[error("Invalid weight '{value}' in {url}")]
    InvalidWeight { url: String, value: String },
}

/// Availability of an endpoint as decided by the regulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum RegulationState {
    #[default]
    Normal = 0,
    /// Excluded from selection.
    Regulated = 1,
    /// Selectable with a reduced traffic share while probe samples accumulate.
    Recovering = 2,
}

impl RegulationState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Regulated,
            2 => Self::Recovering,
            _ => Self::Normal,
        }
    }

    #[must_use]
    pub fn is_selectable(&self) -> bool {
        !matches!(self, Self::Regulated)
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Regulated => "regulated",
            Self::Recovering => "recovering",
        }
    }
}

impl fmt::Display for RegulationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One remote service instance.
///
/// Identity, weight and metadata are immutable. The regulation state is the only mutable field;
/// it is written by the regulation loop and read on every selection, so it is stored as a single
/// atomic byte and readers always see a whole state.
#[derive(Debug)]
pub struct EndpointInfo {
    key: EndpointKey,
    weight: u32,
    metadata: BTreeMap<String, String>,
    state: AtomicU8,
}

impl EndpointInfo {
    #[must_use]
    pub fn new(key: EndpointKey, weight: u32) -> Self {
        Self { key, weight, metadata: BTreeMap::new(), state: AtomicU8::new(0) }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Parses `protocol://host:port?serialization=..&weight=..&tag.k=v`.
    ///
    /// Query keys prefixed with `tag.` become metadata entries; unknown keys are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointParseError`] if the URL is malformed, lacks a host or port, or carries
    /// a non-numeric weight.
    pub fn parse(raw: &str) -> Result<Self, EndpointParseError> {
        let url = Url::parse(raw.trim())?;
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| EndpointParseError::MissingHost(raw.to_string()))?;
        let port = url.port().ok_or_else(|| EndpointParseError::MissingPort(raw.to_string()))?;

        let mut serialization = DEFAULT_SERIALIZATION.to_string();
        let mut weight = DEFAULT_WEIGHT;
        let mut metadata = BTreeMap::new();
        for (name, value) in url.query_pairs() {
            match name.as_ref() {
                "serialization" => serialization = value.into_owned(),
                "weight" => {
                    weight = value.parse().map_err(|_| EndpointParseError::InvalidWeight {
                        url: raw.to_string(),
                        value: value.to_string(),
                    })?;
                }
                other => {
                    if let Some(tag) = other.strip_prefix("tag.") {
                        metadata.insert(tag.to_string(), value.into_owned());
                    }
                }
            }
        }

        let key = EndpointKey::new(url.scheme(), host, port, &serialization);
        Ok(Self::new(key, weight).with_metadata(metadata))
    }

    /// Parses a list of endpoint URLs separated by `,` or `;`.
    ///
    /// # Errors
    ///
    /// Returns the first parse failure.
    pub fn parse_list(raw: &str) -> Result<Vec<Self>, EndpointParseError> {
        raw.split([',', ';']).filter(|s| !s.trim().is_empty()).map(Self::parse).collect()
    }

    /// Builds a fresh endpoint with new static attributes carrying over `previous`'s state.
    pub(crate) fn inherit_state(self, previous: &EndpointInfo) -> Self {
        self.state.store(previous.state.load(Ordering::Acquire), Ordering::Release);
        self
    }

    /// Returns `true` if static attributes (weight, metadata) match.
    pub(crate) fn same_attributes(&self, other: &EndpointInfo) -> bool {
        self.weight == other.weight && self.metadata == other.metadata
    }

    #[must_use]
    pub fn key(&self) -> &EndpointKey {
        &self.key
    }

    #[must_use]
    pub fn weight(&self) -> u32 {
        self.weight
    }

    #[must_use]
    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    #[must_use]
    pub fn regulation_state(&self) -> RegulationState {
        RegulationState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_regulation_state(&self, state: RegulationState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

impl PartialEq for EndpointInfo {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for EndpointInfo {}

impl Hash for EndpointInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl fmt::Display for EndpointInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.key, f)
    }
}

/// How the caller waits for the outcome of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvokeType {
    #[default]
    Sync,
    Future,
    Callback,
    /// Fire and forget. The outcome is still recorded in statistics.
    Oneway,
}

impl InvokeType {
    #[must_use]
    pub fn is_async(&self) -> bool {
        !matches!(self, Self::Sync)
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Future => "future",
            Self::Callback => "callback",
            Self::Oneway => "oneway",
        }
    }
}

/// An outbound call as it travels through filters, routers and the transport.
#[derive(Debug, Clone)]
pub struct RpcRequest {
    pub request_id: u64,
    pub service: Arc<str>,
    pub method: String,
    pub payload: Bytes,
    pub headers: BTreeMap<String, String>,
    pub invoke_type: InvokeType,
    pub timeout: Duration,
    /// Aliases of the routers that contributed candidates, in evaluation order.
    pub route_record: Vec<&'static str>,
    /// Endpoints already tried and failed during this call.
    pub excluded: Vec<EndpointKey>,
    pub(crate) pending: Option<Arc<PendingSlot>>,
}

impl RpcRequest {
    #[must_use]
    pub fn new(service: &str, method: &str, payload: impl Into<Bytes>) -> Self {
        Self {
            request_id: 0,
            service: Arc::from(service),
            method: method.to_string(),
            payload: payload.into(),
            headers: BTreeMap::new(),
            invoke_type: InvokeType::Sync,
            timeout: Duration::from_secs(3),
            route_record: Vec::new(),
            excluded: Vec::new(),
            pending: None,
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_invoke_type(mut self, invoke_type: InvokeType) -> Self {
        self.invoke_type = invoke_type;
        self
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// Outcome payload of a successful call.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RpcResponse {
    pub payload: Bytes,
    pub headers: BTreeMap<String, String>,
    placeholder: bool,
}

impl RpcResponse {
    #[must_use]
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self { payload: payload.into(), headers: BTreeMap::new(), placeholder: false }
    }

    /// Empty response returned immediately by asynchronous invoke modes.
    #[must_use]
    pub fn placeholder() -> Self {
        Self { placeholder: true, ..Self::default() }
    }

    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    #[must_use]
    pub fn is_placeholder(&self) -> bool {
        self.placeholder
    }
}
