//! S3 (and S3-compatible) artifact backend.
//!
//! Objects live at `{prefix}/{kind}/{series_id}/{series_id}_{kind}_v{version}`
//! in one bucket and are referenced as `s3://bucket/key`. Writes are
//! conditional (`If-None-Match: *`), so an existing key is never replaced.
//!
//! The SDK is async while [`ArtifactStore`] is blocking. Calls are bridged
//! through the runtime handle captured at construction and must come from a
//! blocking thread, which is how the engine runs all store I/O.

use std::fmt;

use aws_config::environment::credentials::EnvironmentVariableCredentialsProvider;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tracing::debug;

use super::{ArtifactKey, ArtifactStore};
use crate::error::{Error, Result};

/// `[storage.s3]` settings. Unset credentials fall back to the standard
/// `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY` / `AWS_SESSION_TOKEN`
/// environment variables.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Settings {
    pub bucket: String,
    /// Optional key prefix; surrounding slashes are ignored.
    pub prefix: String,
    pub region: String,
    /// Custom endpoint for S3-compatible services (MinIO, LocalStack, ...).
    pub endpoint_url: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
    /// Path-style addressing, needed by most S3-compatible services.
    pub force_path_style: bool,
}

impl Default for S3Settings {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            prefix: String::new(),
            region: "us-east-1".to_string(),
            endpoint_url: None,
            access_key_id: None,
            secret_access_key: None,
            session_token: None,
            force_path_style: false,
        }
    }
}

impl fmt::Debug for S3Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "<redacted>");
        f.debug_struct("S3Settings")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .field("region", &self.region)
            .field("endpoint_url", &self.endpoint_url)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &redact(&self.secret_access_key))
            .field("session_token", &redact(&self.session_token))
            .field("force_path_style", &self.force_path_style)
            .finish()
    }
}

pub struct S3ArtifactStore {
    client: Client,
    bucket: String,
    prefix: String,
    runtime: Handle,
}

impl S3ArtifactStore {
    pub fn new(settings: &S3Settings, runtime: Handle) -> Result<Self> {
        let bucket = settings.bucket.trim();
        if bucket.is_empty() {
            return Err(Error::validation(
                "storage.s3.bucket must be set when the backend is 's3'",
            ));
        }

        let mut conf = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(settings.region.trim().to_string()))
            .force_path_style(settings.force_path_style);
        if let Some(url) = settings
            .endpoint_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
        {
            conf = conf.endpoint_url(url);
        }
        conf = match (&settings.access_key_id, &settings.secret_access_key) {
            (Some(id), Some(secret)) => conf.credentials_provider(Credentials::new(
                id,
                secret,
                settings.session_token.clone(),
                None,
                "anomalyd-config",
            )),
            _ => conf.credentials_provider(EnvironmentVariableCredentialsProvider::new()),
        };

        Ok(Self {
            client: Client::from_conf(conf.build()),
            bucket: bucket.to_string(),
            prefix: normalize_prefix(&settings.prefix),
            runtime,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Object key for an artifact, under the configured prefix.
    pub fn object_key(&self, key: &ArtifactKey) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{key}", self.prefix)
        }
    }

    /// Bucket and key behind a stored reference.
    pub fn locate(&self, reference: &str) -> Result<(String, String)> {
        split_reference(&self.bucket, reference)
    }
}

fn normalize_prefix(prefix: &str) -> String {
    prefix.trim().trim_matches('/').to_string()
}

fn to_uri(bucket: &str, key: &str) -> String {
    format!("s3://{bucket}/{key}")
}

/// Accepts `s3://bucket/key`, or a bare key that lives in `default_bucket`.
fn split_reference(default_bucket: &str, reference: &str) -> Result<(String, String)> {
    let value = reference.trim();
    if let Some(rest) = value.strip_prefix("s3://") {
        return match rest.split_once('/') {
            Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => {
                Ok((bucket.to_string(), key.to_string()))
            }
            _ => Err(Error::InconsistentState(format!("invalid S3 URI '{reference}'"))),
        };
    }
    let key = value.trim_start_matches('/');
    if key.is_empty() {
        return Err(Error::InconsistentState(format!("invalid S3 reference '{reference}'")));
    }
    Ok((default_bucket.to_string(), key.to_string()))
}

fn s3_error(op: &str, reference: &str, e: impl std::error::Error) -> Error {
    Error::Storage(format!("s3 {op} {reference}: {}", DisplayErrorContext(e)))
}

impl ArtifactStore for S3ArtifactStore {
    fn backend(&self) -> &'static str {
        "s3"
    }

    fn resolve(&self, key: &ArtifactKey) -> String {
        to_uri(&self.bucket, &self.object_key(key))
    }

    fn put(&self, key: &ArtifactKey, bytes: &[u8]) -> Result<String> {
        let object_key = self.object_key(key);
        let reference = to_uri(&self.bucket, &object_key);
        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .content_type("application/json")
            .if_none_match("*")
            .body(ByteStream::from(bytes.to_vec()));

        match self.runtime.block_on(request.send()) {
            Ok(_) => {
                debug!(reference = %reference, bytes = bytes.len(), "artifact written");
                Ok(reference)
            }
            // 412: key exists. 409: a concurrent conditional write won.
            Err(e) if matches!(e.raw_response().map(|r| r.status().as_u16()), Some(409 | 412)) => {
                Err(Error::ArtifactConflict { key: reference })
            }
            Err(e) => Err(s3_error("put", &reference, e)),
        }
    }

    fn get(&self, reference: &str) -> Result<Bytes> {
        let (bucket, key) = self.locate(reference)?;
        self.runtime.block_on(async {
            let output = match self.client.get_object().bucket(&bucket).key(&key).send().await {
                Ok(output) => output,
                Err(e) => {
                    let missing = e.as_service_error().is_some_and(|se| se.is_no_such_key())
                        || e.raw_response().map(|r| r.status().as_u16()) == Some(404);
                    return Err(if missing {
                        Error::not_found(format!("artifact '{reference}' does not exist"))
                    } else {
                        s3_error("get", reference, e)
                    });
                }
            };
            let body = output
                .body
                .collect()
                .await
                .map_err(|e| s3_error("read", reference, e))?;
            Ok(body.into_bytes())
        })
    }

    fn exists(&self, reference: &str) -> Result<bool> {
        let (bucket, key) = self.locate(reference)?;
        let request = self.client.head_object().bucket(&bucket).key(&key);
        match self.runtime.block_on(request.send()) {
            Ok(_) => Ok(true),
            Err(e)
                if e.as_service_error().is_some_and(|se| se.is_not_found())
                    || e.raw_response().map(|r| r.status().as_u16()) == Some(404) =>
            {
                Ok(false)
            }
            Err(e) => Err(s3_error("head", reference, e)),
        }
    }
}
