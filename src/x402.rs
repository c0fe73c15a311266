//! Wire types for the x402 (HTTP 402) payment protocol, and the HTTP client
//! for a remote facilitator.
//!
//! The facilitator verifies and settles payments on behalf of the merchant:
//! this engine posts `{paymentPayload, paymentRequirements}` to its `/verify`
//! and `/settle` endpoints and treats a non-200 response, `isValid = false`,
//! or `success = false` as a hard failure carrying the facilitator's stated
//! reason.

use reqwest::{Client, StatusCode};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fmt::Display;
use std::time::Duration;
use url::Url;

use crate::currency::Network;
use crate::types::TokenAmount;
use crate::util::Base64Bytes;

/// Represents the protocol version. Currently only version 1 is supported.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum X402Version {
    /// Version `1`.
    V1,
}

impl Serialize for X402Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            X402Version::V1 => serializer.serialize_u8(1),
        }
    }
}

impl<'de> Deserialize<'de> for X402Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let num = u8::deserialize(deserializer)?;
        match num {
            1 => Ok(X402Version::V1),
            other => Err(serde::de::Error::custom(format!(
                "Unsupported x402Version: {other}"
            ))),
        }
    }
}

impl Display for X402Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            X402Version::V1 => write!(f, "1"),
        }
    }
}

/// Enumerates payment schemes. Only "exact" is supported, meaning the
/// transferred amount must match the requirements exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Exact,
}

impl Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exact")
    }
}

/// Requirements set by the merchant for an acceptable payment. Built by
/// `create_payment_request`, returned to the caller, and threaded back into
/// verify/settle by the caller — never retained as per-instance state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    pub scheme: Scheme,
    pub network: Network,
    /// Maximum amount in atomic units of `asset`.
    pub max_amount_required: TokenAmount,
    pub resource: Url,
    pub description: String,
    pub mime_type: String,
    /// The merchant wallet receiving the payment.
    pub pay_to: String,
    pub max_timeout_seconds: u64,
    /// On-chain asset identifier (mint / contract address / ticker).
    pub asset: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

/// The HTTP 402 challenge envelope sent to an unpaid client.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequiredResponse {
    pub x402_version: X402Version,
    pub accepts: Vec<PaymentRequirements>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A full protocol payment payload: scheme/network tags plus the
/// chain-specific signed payload, forwarded to the facilitator verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPayload {
    pub x402_version: X402Version,
    pub scheme: Scheme,
    pub network: Network,
    pub payload: serde_json::Value,
}

/// A bare wallet-signed payment: no facilitator round trip, the signature
/// itself is the proof.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimpleSignaturePayload {
    pub network: String,
    pub wallet: String,
    pub signature: String,
    /// Raw or base64-encoded JSON `{amount, currency, merchant}`.
    pub message: String,
}

/// The two payload shapes a client may supply in the `X-PAYMENT` header.
#[derive(Debug, Clone)]
pub enum ClientPayment {
    Simple(SimpleSignaturePayload),
    Protocol(PaymentPayload),
}

#[derive(Debug, thiserror::Error)]
pub enum PaymentDecodingError {
    #[error("Payment payload is neither raw nor base64-encoded JSON")]
    NotJson,
    #[error("Unrecognized payment payload shape: {0}")]
    UnknownShape(String),
}

impl ClientPayment {
    /// Decodes an `X-PAYMENT` header value: raw JSON, or base64-encoded
    /// JSON, into whichever payload shape the object matches.
    pub fn parse(raw: &[u8]) -> Result<Self, PaymentDecodingError> {
        let value: serde_json::Value = match serde_json::from_slice(raw) {
            Ok(value) => value,
            Err(_) => {
                let decoded = Base64Bytes::from(raw)
                    .decode()
                    .map_err(|_| PaymentDecodingError::NotJson)?;
                serde_json::from_slice(&decoded).map_err(|_| PaymentDecodingError::NotJson)?
            }
        };
        let object = value
            .as_object()
            .ok_or(PaymentDecodingError::NotJson)?;
        if object.contains_key("signature")
            && object.contains_key("message")
            && object.contains_key("wallet")
        {
            let simple = serde_json::from_value(value.clone())
                .map_err(|e| PaymentDecodingError::UnknownShape(e.to_string()))?;
            return Ok(ClientPayment::Simple(simple));
        }
        if object.contains_key("x402Version") {
            let payload = serde_json::from_value(value.clone())
                .map_err(|e| PaymentDecodingError::UnknownShape(e.to_string()))?;
            return Ok(ClientPayment::Protocol(payload));
        }
        Err(PaymentDecodingError::UnknownShape(
            "expected a simple signature or an x402 envelope".to_string(),
        ))
    }
}

/// Wrapper for a payment payload and requirements posted to the facilitator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    pub x402_version: X402Version,
    pub payment_payload: PaymentPayload,
    pub payment_requirements: PaymentRequirements,
}

/// Same envelope, posted to `/settle`.
pub type SettleRequest = VerifyRequest;

/// Facilitator's answer to `/verify`: `{isValid, payer, invalidReason?}`.
#[derive(Debug, Clone)]
pub enum VerifyResponse {
    Valid { payer: String },
    Invalid { reason: String, payer: Option<String> },
}

impl Serialize for VerifyResponse {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            VerifyResponse::Valid { payer } => {
                let mut s = serializer.serialize_struct("VerifyResponse", 2)?;
                s.serialize_field("isValid", &true)?;
                s.serialize_field("payer", payer)?;
                s.end()
            }
            VerifyResponse::Invalid { reason, payer } => {
                let mut s = serializer.serialize_struct("VerifyResponse", 3)?;
                s.serialize_field("isValid", &false)?;
                s.serialize_field("invalidReason", reason)?;
                s.serialize_field("payer", payer)?;
                s.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for VerifyResponse {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Raw {
            is_valid: bool,
            #[serde(default)]
            payer: Option<String>,
            #[serde(default)]
            invalid_reason: Option<String>,
        }
        let raw = Raw::deserialize(deserializer)?;
        match (raw.is_valid, raw.invalid_reason) {
            (true, None) => {
                let payer = raw.payer.ok_or_else(|| {
                    serde::de::Error::custom("`payer` must be present when `isValid` is true")
                })?;
                Ok(VerifyResponse::Valid { payer })
            }
            (false, Some(reason)) => Ok(VerifyResponse::Invalid {
                reason,
                payer: raw.payer,
            }),
            (true, Some(_)) => Err(serde::de::Error::custom(
                "`invalidReason` must be absent when `isValid` is true",
            )),
            (false, None) => Err(serde::de::Error::custom(
                "`invalidReason` must be present when `isValid` is false",
            )),
        }
    }
}

/// Facilitator's answer to `/settle`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettleResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
    #[serde(default)]
    pub payer: Option<String>,
    #[serde(default)]
    pub transaction: Option<String>,
    pub network: Network,
}

/// Errors that can occur while interacting with a remote facilitator.
/// Transport, status, and decode failures are retryable; a rejection is not.
#[derive(Debug, thiserror::Error)]
pub enum X402Error {
    #[error("URL parse error: {context}: {source}")]
    UrlParse {
        context: &'static str,
        #[source]
        source: url::ParseError,
    },
    #[error("HTTP error: {context}: {source}")]
    Http {
        context: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("Unexpected HTTP status {status}: {context}: {body}")]
    HttpStatus {
        context: &'static str,
        status: StatusCode,
        body: String,
    },
    #[error("Failed to deserialize JSON: {context}: {source}")]
    JsonDeserialization {
        context: &'static str,
        #[source]
        source: reqwest::Error,
    },
    /// The facilitator answered but refused the payment.
    #[error("Facilitator rejected payment: {reason}")]
    Rejected { reason: String },
}

/// Default per-request timeout for facilitator calls.
pub const FACILITATOR_TIMEOUT: Duration = Duration::from_secs(30);

/// A client for communicating with a remote x402 facilitator over its
/// `/verify` and `/settle` endpoints.
#[derive(Debug, Clone)]
pub struct FacilitatorClient {
    base_url: Url,
    verify_url: Url,
    settle_url: Url,
    client: Client,
    timeout: Duration,
}

impl FacilitatorClient {
    /// Constructs a client from a base URL, deriving the `./verify` and
    /// `./settle` endpoint URLs relative to it.
    pub fn try_new(base_url: Url) -> Result<Self, X402Error> {
        let verify_url = base_url
            .join("./verify")
            .map_err(|e| X402Error::UrlParse {
                context: "Failed to construct ./verify URL",
                source: e,
            })?;
        let settle_url = base_url
            .join("./settle")
            .map_err(|e| X402Error::UrlParse {
                context: "Failed to construct ./settle URL",
                source: e,
            })?;
        Ok(Self {
            base_url,
            verify_url,
            settle_url,
            client: Client::new(),
            timeout: FACILITATOR_TIMEOUT,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Sets a timeout for all future requests.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sends a `POST /verify` request to the facilitator.
    pub async fn verify(&self, request: &VerifyRequest) -> Result<VerifyResponse, X402Error> {
        self.post_json(&self.verify_url, "POST /verify", request)
            .await
    }

    /// Sends a `POST /settle` request to the facilitator.
    pub async fn settle(&self, request: &SettleRequest) -> Result<SettleResponse, X402Error> {
        self.post_json(&self.settle_url, "POST /settle", request)
            .await
    }

    /// Generic POST helper handling JSON serialization, status mapping, and
    /// timeout application. `context` names the call in errors.
    async fn post_json<T, R>(
        &self,
        url: &Url,
        context: &'static str,
        payload: &T,
    ) -> Result<R, X402Error>
    where
        T: Serialize + ?Sized,
        R: serde::de::DeserializeOwned,
    {
        let http_response = self
            .client
            .post(url.clone())
            .json(payload)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| X402Error::Http { context, source: e })?;
        if http_response.status() == StatusCode::OK {
            http_response
                .json::<R>()
                .await
                .map_err(|e| X402Error::JsonDeserialization { context, source: e })
        } else {
            let status = http_response.status();
            let body = http_response.text().await.unwrap_or_default();
            Err(X402Error::HttpStatus {
                context,
                status,
                body,
            })
        }
    }
}

impl TryFrom<&str> for FacilitatorClient {
    type Error = X402Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        // Normalize: strip trailing slashes and add a single trailing slash,
        // so relative joins resolve under the base path.
        let mut normalized = value.trim_end_matches('/').to_string();
        normalized.push('/');
        let url = Url::parse(&normalized).map_err(|e| X402Error::UrlParse {
            context: "Failed to parse base url",
            source: e,
        })?;
        FacilitatorClient::try_new(url)
    }
}
