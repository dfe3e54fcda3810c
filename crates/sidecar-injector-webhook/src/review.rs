//! AdmissionReview envelopes
//!
//! The API server speaks `admission.k8s.io/v1` or `admission.k8s.io/v1beta1`.
//! The two shapes differ only in field typing, so both are decoded by their
//! `apiVersion` into a tagged union and immediately normalized into
//! [`ReviewRequest`]. The response is encoded back into whichever version the
//! request arrived in.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// `admission.k8s.io/v1`
pub const ADMISSION_V1: &str = "admission.k8s.io/v1";
/// `admission.k8s.io/v1beta1`
pub const ADMISSION_V1BETA1: &str = "admission.k8s.io/v1beta1";

const REVIEW_KIND: &str = "AdmissionReview";
const PATCH_TYPE_JSON_PATCH: &str = "JSONPatch";

/// Envelope-level failures; the server answers these with HTTP 400
#[derive(Debug, Error)]
pub enum ReviewError {
    /// The body is not JSON or does not match the envelope shape
    #[error("malformed admission review: {0}")]
    Malformed(#[from] serde_json::Error),

    /// `apiVersion` names neither supported version
    #[error("unsupported admission review version {0:?}")]
    UnsupportedVersion(String),

    /// The envelope has no `request`
    #[error("admission review has no request")]
    MissingRequest,

    /// `operation` is not one of the four admission operations
    #[error("unknown admission operation {0:?}")]
    UnknownOperation(String),
}

/// Envelope version a review arrived in
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReviewVersion {
    /// `admission.k8s.io/v1`
    V1,
    /// `admission.k8s.io/v1beta1`
    V1Beta1,
}

impl ReviewVersion {
    /// The `apiVersion` string
    pub fn api_version(self) -> &'static str {
        match self {
            ReviewVersion::V1 => ADMISSION_V1,
            ReviewVersion::V1Beta1 => ADMISSION_V1BETA1,
        }
    }
}

/// Admission operation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    /// CREATE
    Create,
    /// UPDATE
    Update,
    /// DELETE
    Delete,
    /// CONNECT
    Connect,
}

impl std::str::FromStr for Operation {
    type Err = ReviewError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATE" => Ok(Operation::Create),
            "UPDATE" => Ok(Operation::Update),
            "DELETE" => Ok(Operation::Delete),
            "CONNECT" => Ok(Operation::Connect),
            other => Err(ReviewError::UnknownOperation(other.to_string())),
        }
    }
}

/// Group, version and kind of the reviewed object
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupVersionKind {
    /// API group, empty for core
    #[serde(default)]
    pub group: String,
    /// API version
    #[serde(default)]
    pub version: String,
    /// Kind
    #[serde(default)]
    pub kind: String,
}

/// Version-independent admission request
#[derive(Clone, Debug, PartialEq)]
pub struct ReviewRequest {
    /// Envelope version the request arrived in
    pub version: ReviewVersion,
    /// Request uid, echoed in the response
    pub uid: String,
    /// Kind of the reviewed object
    pub kind: GroupVersionKind,
    /// Namespace of the object, if any
    pub namespace: Option<String>,
    /// Name of the object; often empty for generated pod names
    pub name: Option<String>,
    /// Operation being admitted
    pub operation: Operation,
    /// The object as submitted
    pub object: Option<Value>,
    /// Whether the request is a dry run
    pub dry_run: bool,
}

/// Version-independent admission response
#[derive(Clone, Debug, PartialEq)]
pub struct ReviewResponse {
    /// Uid of the request being answered
    pub uid: String,
    /// Admission decision
    pub allowed: bool,
    /// JSON Patch to apply to the object
    pub patch: Option<json_patch::Patch>,
    /// Warnings shown to the client
    pub warnings: Vec<String>,
    /// Denial reason
    pub status_message: Option<String>,
}

impl ReviewResponse {
    /// Allow without changes
    pub fn allow(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            allowed: true,
            patch: None,
            warnings: Vec::new(),
            status_message: None,
        }
    }

    /// Deny with `reason` as both warning and status message
    pub fn deny(uid: impl Into<String>, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            uid: uid.into(),
            allowed: false,
            patch: None,
            warnings: vec![reason.clone()],
            status_message: Some(reason),
        }
    }

    /// Attach a patch
    pub fn with_patch(mut self, patch: json_patch::Patch) -> Self {
        self.patch = Some(patch);
        self
    }

    /// Attach a warning
    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    /// Encode into the envelope of `version`
    pub fn into_review(self, version: ReviewVersion) -> Result<Value, serde_json::Error> {
        let patch = match &self.patch {
            Some(patch) => Some(STANDARD.encode(serde_json::to_vec(patch)?)),
            None => None,
        };
        let response = WireResponse {
            uid: self.uid,
            allowed: self.allowed,
            patch_type: patch.as_ref().map(|_| PATCH_TYPE_JSON_PATCH.to_string()),
            patch,
            warnings: (!self.warnings.is_empty()).then_some(self.warnings),
            status: self.status_message.map(|message| WireStatus { message }),
        };
        serde_json::to_value(WireReview {
            api_version: version.api_version().to_string(),
            kind: REVIEW_KIND.to_string(),
            response,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "apiVersion")]
enum AdmissionReview {
    #[serde(rename = "admission.k8s.io/v1")]
    V1(Envelope<V1Request>),
    #[serde(rename = "admission.k8s.io/v1beta1")]
    V1Beta1(Envelope<V1Beta1Request>),
}

#[derive(Debug, Deserialize)]
struct Envelope<R> {
    request: Option<R>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct V1Request {
    uid: String,
    kind: GroupVersionKind,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    namespace: Option<String>,
    operation: Operation,
    #[serde(default)]
    object: Option<Value>,
    #[serde(default)]
    dry_run: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct V1Beta1Request {
    uid: String,
    kind: GroupVersionKind,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    namespace: Option<String>,
    operation: String,
    #[serde(default)]
    object: Option<Value>,
    #[serde(default)]
    dry_run: Option<bool>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireReview {
    api_version: String,
    kind: String,
    response: WireResponse,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireResponse {
    uid: String,
    allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    patch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    patch_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    warnings: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<WireStatus>,
}

#[derive(Serialize)]
struct WireStatus {
    message: String,
}

/// Decode an envelope of either version into a [`ReviewRequest`]
pub fn from_slice(body: &[u8]) -> Result<ReviewRequest, ReviewError> {
    parse(serde_json::from_slice(body)?)
}

/// Normalize an already-parsed envelope
pub fn parse(value: Value) -> Result<ReviewRequest, ReviewError> {
    let api_version = value
        .get("apiVersion")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if api_version != ADMISSION_V1 && api_version != ADMISSION_V1BETA1 {
        return Err(ReviewError::UnsupportedVersion(api_version.to_string()));
    }

    match serde_json::from_value::<AdmissionReview>(value)? {
        AdmissionReview::V1(envelope) => {
            let r = envelope.request.ok_or(ReviewError::MissingRequest)?;
            Ok(ReviewRequest {
                version: ReviewVersion::V1,
                uid: r.uid,
                kind: r.kind,
                namespace: r.namespace,
                name: r.name,
                operation: r.operation,
                object: r.object,
                dry_run: r.dry_run.unwrap_or(false),
            })
        }
        AdmissionReview::V1Beta1(envelope) => {
            let r = envelope.request.ok_or(ReviewError::MissingRequest)?;
            Ok(ReviewRequest {
                version: ReviewVersion::V1Beta1,
                uid: r.uid,
                kind: r.kind,
                namespace: r.namespace,
                name: r.name,
                operation: r.operation.parse()?,
                object: r.object,
                dry_run: r.dry_run.unwrap_or(false),
            })
        }
    }
}
