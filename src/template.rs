use std::path::PathBuf;

use async_trait::async_trait;
use aws_sdk_s3::types::{ByteStream, SdkError};
use aws_types::SdkConfig;
use bytes::Bytes;
use tracing::debug;

use crate::stack::{self, StackService};

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("Unable to fetch template s3://{bucket}/{key}: {message}")]
    FetchError {
        bucket: String,
        key: String,
        message: String,
    },

    #[error("Unable to read template {0}: {1}")]
    ReadError(String, String),

    #[error("Unable to read the template stream: {0}")]
    StreamError(String),

    #[error("Template body is not valid UTF-8: {0}")]
    EncodingError(String),

    #[error("Template failed validation: {0}")]
    InvalidTemplate(#[source] stack::Error),
}

/// A CloudFormation template in whatever shape its source produced it.
pub enum Template {
    /// A body already read into memory.
    Bytes(Bytes),
    /// A response body that has not been read yet.
    Stream(ByteStream),
    Text(String),
}

#[async_trait]
pub trait TemplateStore: Send + Sync {
    async fn fetch(&self, bucket: &str, key: &str) -> Result<Template, Error>;
}

pub struct S3TemplateStore {
    client: aws_sdk_s3::Client,
}

impl S3TemplateStore {
    pub fn new(sdk_config: &SdkConfig) -> Self {
        let client = aws_sdk_s3::Client::new(sdk_config);
        return Self { client };
    }
}

#[async_trait]
impl TemplateStore for S3TemplateStore {
    async fn fetch(&self, bucket: &str, key: &str) -> Result<Template, Error> {
        debug!("Fetching template s3://{}/{}", bucket, key);

        let result = self.client.get_object().bucket(bucket).key(key).send().await;
        let output = match result {
            Ok(output) => output,
            Err(SdkError::ServiceError { err, .. }) => {
                return Err(Error::FetchError {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                    message: match err.message() {
                        Some(message) => message.to_string(),
                        None => err.to_string(),
                    },
                })
            }
            Err(err) => {
                return Err(Error::FetchError {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                    message: err.to_string(),
                })
            }
        };

        return Ok(Template::Stream(output.body));
    }
}

/// Reads templates from a local directory, using the object key as a relative path.
pub struct LocalTemplateStore {
    root: PathBuf,
}

impl LocalTemplateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl TemplateStore for LocalTemplateStore {
    async fn fetch(&self, _bucket: &str, key: &str) -> Result<Template, Error> {
        let path = self.root.join(key);
        debug!("Reading template {}", path.display());

        match tokio::fs::read(&path).await {
            Ok(contents) => Ok(Template::Bytes(Bytes::from(contents))),
            Err(error) => Err(Error::ReadError(path.display().to_string(), error.to_string())),
        }
    }
}

/// Decodes the template and validates it once against CloudFormation.
pub async fn parse<S>(template: Template, service: &S) -> Result<String, Error>
where
    S: StackService + ?Sized,
{
    let body = match template {
        Template::Bytes(bytes) => decode(bytes.to_vec())?,
        Template::Stream(stream) => {
            let aggregated = match stream.collect().await {
                Ok(aggregated) => aggregated,
                Err(error) => return Err(Error::StreamError(error.to_string())),
            };
            decode(aggregated.into_bytes().to_vec())?
        }
        Template::Text(text) => text,
    };

    match service.validate_template(&body).await {
        Ok(()) => Ok(body),
        Err(error) => Err(Error::InvalidTemplate(error)),
    }
}

fn decode(bytes: Vec<u8>) -> Result<String, Error> {
    String::from_utf8(bytes).map_err(|error| Error::EncodingError(error.to_string()))
}
