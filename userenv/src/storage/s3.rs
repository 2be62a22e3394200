//! S3-compatible object store.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::{BehaviorVersion, Builder, Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use userenv_shared::errors::{UserEnvError, UserEnvResult};

use super::{ObjectStorageConfig, ObjectStore, PutCondition, StoredObject};

/// HTTP statuses an S3-compatible store uses to reject a conditional write.
const PRECONDITION_FAILED: u16 = 412;
const CONDITIONAL_CONFLICT: u16 = 409;

/// [`ObjectStore`] backed by a single bucket.
///
/// Credentials come only from the accepted configuration; the ambient AWS
/// credential chain is never consulted.
#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    pub fn from_config(config: &ObjectStorageConfig) -> UserEnvResult<Self> {
        config.validate()?;

        let credentials = Credentials::new(
            config.access_key.clone(),
            config.secret_key.clone(),
            None,
            None,
            "userenv-static",
        );
        let s3_config = Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region_or_default().to_string()))
            .endpoint_url(config.endpoint.clone())
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        tracing::debug!(
            bucket = %config.bucket,
            endpoint = %config.endpoint,
            "Created S3 object store client"
        );

        Ok(Self {
            client: Client::from_conf(s3_config),
            bucket: config.bucket.clone(),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

fn http_status<E>(err: &SdkError<E, HttpResponse>) -> Option<u16> {
    err.raw_response().map(|response| response.status().as_u16())
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn get(&self, key: &str) -> UserEnvResult<Option<StoredObject>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(output) => {
                let etag = output.e_tag().map(str::to_string).unwrap_or_default();
                let body = output
                    .body
                    .collect()
                    .await
                    .map_err(|e| {
                        UserEnvError::Storage(format!("failed to read s3://{}/{}: {}", self.bucket, key, e))
                    })?
                    .into_bytes()
                    .to_vec();
                Ok(Some(StoredObject { body, etag }))
            }
            Err(e) => {
                let missing = e
                    .as_service_error()
                    .is_some_and(|service_err| service_err.is_no_such_key())
                    || http_status(&e) == Some(404);
                if missing {
                    tracing::trace!(bucket = %self.bucket, key, "Object not found");
                    return Ok(None);
                }
                Err(UserEnvError::Storage(format!(
                    "get s3://{}/{} failed: {}",
                    self.bucket,
                    key,
                    DisplayErrorContext(&e)
                )))
            }
        }
    }

    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        condition: PutCondition<'_>,
    ) -> UserEnvResult<String> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type("text/plain");
        request = match condition {
            PutCondition::Always => request,
            PutCondition::IfAbsent => request.if_none_match("*"),
            PutCondition::IfMatch(etag) => request.if_match(etag),
        };
        let result = request.send().await;

        match result {
            Ok(output) => Ok(output.e_tag().map(str::to_string).unwrap_or_default()),
            Err(e) => match http_status(&e) {
                Some(PRECONDITION_FAILED) | Some(CONDITIONAL_CONFLICT)
                    if condition != PutCondition::Always =>
                {
                    Err(UserEnvError::PreconditionFailed(format!(
                        "s3://{}/{}: {:?} not satisfied",
                        self.bucket, key, condition
                    )))
                }
                _ => Err(UserEnvError::Storage(format!(
                    "put s3://{}/{} failed: {}",
                    self.bucket,
                    key,
                    DisplayErrorContext(&e)
                ))),
            },
        }
    }

    async fn delete(&self, key: &str) -> UserEnvResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                UserEnvError::Storage(format!(
                    "delete s3://{}/{} failed: {}",
                    self.bucket,
                    key,
                    DisplayErrorContext(&e)
                ))
            })?;
        Ok(())
    }
}
