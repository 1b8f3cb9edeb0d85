//! 📡 S3Transport: an S3-compatible object store through `aws-sdk-s3`.
//!
//! HEAD for sizes, ranged `GetObject` for chunks, `ListObjectsV2` with
//! continuation tokens for listings, and the multipart upload calls for the
//! writer. The SDK builds, signs and encodes the requests (keys with `#`, `?`
//! or spaces included) and parses the XML coming back.
//!
//! 🔄 The SDK's own retries are switched off; every call goes through one retry
//! loop here instead. Whatever `TransferError::is_retryable` says yes to
//! (connection trouble, 5xx) is retried up to `max_attempts` total attempts with
//! a linear backoff, then surfaces as `FailedAfterRetry`. A 4xx is the store
//! telling us no, so it becomes `Remote` straight away with its code and message.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_config::retry::RetryConfig;
use aws_config::timeout::TimeoutConfig;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::{
    Credentials, Region, RequestChecksumCalculation, ResponseChecksumValidation,
};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart as SdkCompletedPart};
use bytes::Bytes;
use serde::Deserialize;
use tracing::{debug, trace, warn};

use crate::errors::{TransferError, TransferResult};
use crate::reader::Range;
use crate::transport::{CompletedPart, ObjectSummary, Transport};

/// 🔧 Where the store lives, who we are, and how patient to be with it.
#[derive(Deserialize, Clone)]
pub struct S3TransportConfig {
    /// 📡 Endpoint override, e.g. `http://127.0.0.1:9000` for MinIO. None = AWS.
    #[serde(default)]
    pub endpoint: Option<String>,
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// `{endpoint}/{bucket}/{key}` instead of `{bucket}.{endpoint}/{key}`.
    #[serde(default = "default_force_path_style")]
    pub force_path_style: bool,
    /// Static credentials. Both or neither; neither means the default AWS chain.
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    /// Total attempts per request, the first one included. 0 fails without trying.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Attempt `n` waits `n × retry_backoff_ms` before the next one.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

// -- 🏖️ no region given? the SDK wants one anyway, and us-east-1 is where they all retire
fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_force_path_style() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    200
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    300
}

impl std::fmt::Debug for S3TransportConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // -- the secret stays out of the logs
        f.debug_struct("S3TransportConfig")
            .field("endpoint", &self.endpoint)
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("force_path_style", &self.force_path_style)
            .field("access_key_id", &self.access_key_id)
            .field("max_attempts", &self.max_attempts)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .finish_non_exhaustive()
    }
}

impl S3TransportConfig {
    /// Defaults for everything but the address.
    pub fn for_endpoint(endpoint: &str, bucket: &str) -> Self {
        Self {
            endpoint: Some(endpoint.to_string()),
            bucket: bucket.to_string(),
            region: default_region(),
            force_path_style: default_force_path_style(),
            access_key_id: None,
            secret_access_key: None,
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }

    fn validate(&self) -> TransferResult<()> {
        if self.bucket.is_empty() {
            return Err(TransferError::Setup("bucket name must not be empty".into()));
        }
        if let Some(endpoint) = &self.endpoint {
            if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                return Err(TransferError::Setup(format!(
                    "invalid endpoint '{endpoint}': expected an http:// or https:// URL"
                )));
            }
        }
        if self.access_key_id.is_some() != self.secret_access_key.is_some() {
            return Err(TransferError::Setup(
                "access_key_id and secret_access_key come as a pair".into(),
            ));
        }
        Ok(())
    }
}

/// 📡 The S3 side of the house. One SDK client, reused for every request.
#[derive(Debug)]
pub struct S3Transport {
    client: Client,
    config: S3TransportConfig,
}

/// 🧾 Folds an SDK failure into our taxonomy. The store's answers become
/// `Remote` (status, code, message); everything that never got an answer is `Transport`.
fn sdk_error<E>(error: SdkError<E, HttpResponse>) -> TransferError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    match &error {
        SdkError::ServiceError(context) => TransferError::Remote {
            status: context.raw().status().as_u16(),
            code: context.err().code().unwrap_or("Unknown").to_string(),
            message: context.err().message().unwrap_or_default().to_string(),
        },
        SdkError::ConstructionFailure(_) => {
            TransferError::Setup(DisplayErrorContext(&error).to_string())
        }
        _ => TransferError::Transport(DisplayErrorContext(&error).to_string()),
    }
}

fn part_number_for_sdk(part_number: u64) -> TransferResult<i32> {
    i32::try_from(part_number).map_err(|_| {
        TransferError::Setup(format!("part number {part_number} does not fit the protocol"))
    })
}

impl S3Transport {
    /// 🏗️ Validates the config and builds the SDK client. Nothing goes over the wire.
    pub async fn new(config: S3TransportConfig) -> TransferResult<Self> {
        config.validate()?;

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .retry_config(RetryConfig::disabled())
            .timeout_config(
                TimeoutConfig::builder()
                    .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
                    .operation_attempt_timeout(Duration::from_secs(config.request_timeout_secs))
                    .build(),
            );
        if let (Some(access_key_id), Some(secret_access_key)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            loader = loader.credentials_provider(Credentials::new(
                access_key_id,
                secret_access_key,
                None,
                None,
                "s3x-config",
            ));
        }
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;

        // -- plain S3-compatible stores don't all speak the newer checksum headers
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.force_path_style)
            .request_checksum_calculation(RequestChecksumCalculation::WhenRequired)
            .response_checksum_validation(ResponseChecksumValidation::WhenRequired)
            .build();

        Ok(Self {
            client: Client::from_conf(s3_config),
            config,
        })
    }

    fn describe(&self, key: &str) -> String {
        format!("s3://{}/{key}", self.config.bucket)
    }

    /// 🔄 Runs `call` until it succeeds, fails for good, or `max_attempts` runs out.
    async fn with_retries<T, F, Fut>(&self, target: &str, call: F) -> TransferResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = TransferResult<T>>,
    {
        let max_attempts = self.config.max_attempts;
        let mut last_failure = String::from("no attempt was made");
        for attempt in 1..=max_attempts {
            match call().await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_retryable() => last_failure = error.to_string(),
                Err(error) => return Err(error),
            }
            if attempt < max_attempts {
                warn!(
                    "🔄 attempt {attempt}/{max_attempts} against '{target}' failed ({last_failure}), retrying"
                );
                let backoff = self.config.retry_backoff_ms.saturating_mul(u64::from(attempt));
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }
        }
        Err(TransferError::FailedAfterRetry {
            url: target.to_string(),
            attempts: max_attempts,
            message: last_failure,
        })
    }
}

#[async_trait]
impl Transport for S3Transport {
    async fn object_size(&self, key: &str) -> TransferResult<u64> {
        let target = self.describe(key);
        let head = self
            .with_retries(&target, move || async move {
                self.client
                    .head_object()
                    .bucket(&self.config.bucket)
                    .key(key)
                    .send()
                    .await
                    .map_err(sdk_error)
            })
            .await?;
        head.content_length()
            .and_then(|length| u64::try_from(length).ok())
            .ok_or_else(|| {
                TransferError::Transport(format!("HEAD '{target}' came back without a Content-Length"))
            })
    }

    async fn key_exists(&self, key: &str) -> TransferResult<bool> {
        let target = self.describe(key);
        self.with_retries(&target, move || async move {
            match self
                .client
                .head_object()
                .bucket(&self.config.bucket)
                .key(key)
                .send()
                .await
                .map_err(sdk_error)
            {
                Ok(_) => Ok(true),
                Err(TransferError::Remote {
                    status: 403 | 404, ..
                }) => Ok(false),
                Err(error) => Err(error),
            }
        })
        .await
    }

    async fn list_objects(&self, prefix: &str) -> TransferResult<Vec<ObjectSummary>> {
        let target = self.describe(prefix);
        let mut listing = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let token = continuation.as_deref();
            let page = self
                .with_retries(&target, move || async move {
                    self.client
                        .list_objects_v2()
                        .bucket(&self.config.bucket)
                        .prefix(prefix)
                        .set_continuation_token(token.map(str::to_string))
                        .send()
                        .await
                        .map_err(sdk_error)
                })
                .await?;

            for object in page.contents() {
                let Some(key) = object.key() else {
                    continue;
                };
                match object.size().and_then(|size| u64::try_from(size).ok()) {
                    Some(size) if size > 0 => listing.push(ObjectSummary {
                        key: key.to_string(),
                        size,
                    }),
                    _ => debug!("📋 skipping empty object '{key}'"),
                }
            }

            match (page.is_truncated(), page.next_continuation_token()) {
                (Some(true), Some(token)) => continuation = Some(token.to_string()),
                _ => break,
            }
        }
        debug!("📋 '{prefix}' lists {} non-empty objects", listing.len());
        Ok(listing)
    }

    async fn get_object_range(&self, key: &str, range: Range) -> TransferResult<Vec<u8>> {
        if range.length == 0 {
            return Ok(Vec::new());
        }
        let target = self.describe(key);
        let range_header = format!("bytes={}-{}", range.offset, range.end() - 1);
        trace!("📦 GET '{target}' {range_header}");
        let range_header = range_header.as_str();
        self.with_retries(&target, move || async move {
            let output = self
                .client
                .get_object()
                .bucket(&self.config.bucket)
                .key(key)
                .range(range_header)
                .send()
                .await
                .map_err(sdk_error)?;
            // -- a body cut off halfway is a network problem, so it's retryable like one
            let body = output
                .body
                .collect()
                .await
                .map_err(|error| TransferError::Transport(error.to_string()))?;
            Ok(body.into_bytes().to_vec())
        })
        .await
    }

    async fn get_upload_id(&self, key: &str) -> TransferResult<String> {
        let target = self.describe(key);
        let created = self
            .with_retries(&target, move || async move {
                self.client
                    .create_multipart_upload()
                    .bucket(&self.config.bucket)
                    .key(key)
                    .send()
                    .await
                    .map_err(sdk_error)
            })
            .await?;
        created
            .upload_id()
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                TransferError::Transport(format!("no UploadId came back for '{target}'"))
            })
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u64,
        data: Vec<u8>,
    ) -> TransferResult<String> {
        let target = self.describe(key);
        let sdk_part_number = part_number_for_sdk(part_number)?;
        // -- Bytes clones are refcounts, so a retry doesn't copy the part again
        let data = &Bytes::from(data);
        let uploaded = self
            .with_retries(&target, move || async move {
                self.client
                    .upload_part()
                    .bucket(&self.config.bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .part_number(sdk_part_number)
                    .body(ByteStream::from(data.clone()))
                    .send()
                    .await
                    .map_err(sdk_error)
            })
            .await?;
        uploaded.e_tag().map(str::to_string).ok_or_else(|| {
            TransferError::Transport(format!("part {part_number} was accepted without an ETag"))
        })
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> TransferResult<()> {
        if parts.is_empty() {
            return Err(TransferError::Setup(format!(
                "refusing to complete upload {upload_id} with no parts"
            )));
        }
        let completed = parts
            .iter()
            .map(|part| {
                Ok(SdkCompletedPart::builder()
                    .part_number(part_number_for_sdk(part.part_number)?)
                    .e_tag(&part.etag)
                    .build())
            })
            .collect::<TransferResult<Vec<_>>>()?;
        let document = CompletedMultipartUpload::builder()
            .set_parts(Some(completed))
            .build();
        let document = &document;

        let target = self.describe(key);
        self.with_retries(&target, move || async move {
            self.client
                .complete_multipart_upload()
                .bucket(&self.config.bucket)
                .key(key)
                .upload_id(upload_id)
                .multipart_upload(document.clone())
                .send()
                .await
                .map_err(sdk_error)
        })
        .await?;
        debug!("✅ completed upload {upload_id} of '{key}' with {} parts", parts.len());
        Ok(())
    }

    async fn abort_upload(&self, key: &str, upload_id: &str) -> TransferResult<()> {
        let target = self.describe(key);
        self.with_retries(&target, move || async move {
            self.client
                .abort_multipart_upload()
                .bucket(&self.config.bucket)
                .key(key)
                .upload_id(upload_id)
                .send()
                .await
                .map_err(sdk_error)
        })
        .await?;
        Ok(())
    }
}
