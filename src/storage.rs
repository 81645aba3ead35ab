use async_trait::async_trait;
use log::{error, info, warn};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("unsupported media type")]
    UnsupportedType,
    #[error("payload too large")]
    TooLarge,
    #[error("not_found")]
    NotFound,
    #[error("other: {0}")]
    Other(String),
}

pub const MEDIA_SIZE_LIMIT: usize = 10 * 1024 * 1024; // 10 MB

const ALLOWED_MIME: &[&str] = &["image/png", "image/jpeg", "image/gif", "image/webp"];

/// Result of a successful upload. `duplicate` is true when the object was
/// already present (uploads are content-addressed and idempotent).
#[derive(Debug, Clone)]
pub struct StoredMedia {
    pub key: String,
    pub url: String,
    pub mime: String,
    pub size: usize,
    pub duplicate: bool,
}

#[async_trait]
pub trait MediaStore: Send + Sync {
    async fn save(&self, bytes: &[u8]) -> Result<StoredMedia, MediaError>;
    async fn load(&self, key: &str) -> Result<(Vec<u8>, String), MediaError>;
    async fn delete(&self, key: &str) -> Result<(), MediaError>;
    fn public_url(&self, key: &str) -> String;
}

fn object_key(hash: &str) -> String {
    format!("media/{}/{}", &hash[0..2], hash)
}

/// Validate and content-address an upload; shared by all store impls.
fn prepare(bytes: &[u8]) -> Result<(String, String), MediaError> {
    if bytes.len() > MEDIA_SIZE_LIMIT {
        return Err(MediaError::TooLarge);
    }
    let mime = infer::get(bytes)
        .map(|t| t.mime_type().to_string())
        .unwrap_or_else(|| "application/octet-stream".into());
    if !ALLOWED_MIME.contains(&mime.as_str()) {
        return Err(MediaError::UnsupportedType);
    }
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let hash = format!("{:x}", hasher.finalize());
    Ok((object_key(&hash), mime))
}

// ---------------- S3 Implementation (platform storage tier / MinIO) ----------------
pub struct S3MediaStore {
    bucket: String,
    client: aws_sdk_s3::Client,
    public_base: String,
}

impl S3MediaStore {
    pub async fn new() -> anyhow::Result<Self> {
        use aws_credential_types::provider::SharedCredentialsProvider;
        use aws_credential_types::Credentials;

        let bucket = std::env::var("S3_BUCKET").unwrap_or_else(|_| "food-images".into());
        let endpoint = std::env::var("S3_ENDPOINT")
            .map_err(|_| anyhow::anyhow!("S3_ENDPOINT must be set (MinIO / S3 endpoint)"))?;
        let region = std::env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".into());
        let access = std::env::var("S3_ACCESS_KEY").unwrap_or_default();
        let secret = std::env::var("S3_SECRET_KEY").unwrap_or_default();
        let public_base = std::env::var("MEDIA_PUBLIC_URL")
            .unwrap_or_else(|_| format!("{}/{}", endpoint.trim_end_matches('/'), bucket));

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(region));
        loader = loader.endpoint_url(endpoint);
        if !access.is_empty() && !secret.is_empty() {
            let creds = Credentials::new(access, secret, None, None, "static");
            loader = loader.credentials_provider(SharedCredentialsProvider::new(creds));
        }
        let conf = loader.load().await;
        // Path-style addressing; most MinIO/local endpoints lack wildcard DNS.
        let s3_conf = aws_sdk_s3::config::Builder::from(&conf)
            .force_path_style(true)
            .build();
        let client = aws_sdk_s3::Client::from_conf(s3_conf);
        info!("Initialized media storage client (path-style addressing enabled)");

        // Ensure bucket exists (create if missing)
        if let Err(e) = client.head_bucket().bucket(&bucket).send().await {
            warn!("head_bucket failed for '{bucket}' (will attempt create): {e:?}");
            if let Err(e2) = client.create_bucket().bucket(&bucket).send().await {
                error!("create_bucket failed for '{bucket}': {e2:?}");
                return Err(anyhow::anyhow!("failed to ensure bucket '{bucket}': {e2}"));
            }
            info!("created bucket '{bucket}'");
        }

        Ok(Self {
            bucket,
            client,
            public_base: public_base.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl MediaStore for S3MediaStore {
    async fn save(&self, bytes: &[u8]) -> Result<StoredMedia, MediaError> {
        use aws_sdk_s3::primitives::ByteStream;
        let (key, mime) = prepare(bytes)?;
        // HEAD first: same content means the object is already there.
        if self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .is_ok()
        {
            return Ok(StoredMedia {
                url: self.public_url(&key),
                key,
                mime,
                size: bytes.len(),
                duplicate: true,
            });
        }
        let put = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(bytes.to_vec()))
            .content_type(mime.clone());
        if let Err(e) = put.send().await {
            error!(
                "put_object failed key={key} bucket={} err={:?}",
                self.bucket, e
            );
            let hint = if e.to_string().contains("NoSuchBucket") {
                " (bucket missing or not yet propagated)"
            } else if e.to_string().contains("AccessDenied") {
                " (check S3_ACCESS_KEY/S3_SECRET_KEY permissions)"
            } else {
                ""
            };
            return Err(MediaError::Other(format!("{e}{hint}")));
        }
        Ok(StoredMedia {
            url: self.public_url(&key),
            key,
            mime,
            size: bytes.len(),
            duplicate: false,
        })
    }

    async fn load(&self, key: &str) -> Result<(Vec<u8>, String), MediaError> {
        let obj = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|_| MediaError::NotFound)?;
        let data = obj
            .body
            .collect()
            .await
            .map_err(|e| MediaError::Other(e.to_string()))?;
        let bytes = Vec::from(data.into_bytes().as_ref());
        let mime = infer::get(&bytes)
            .map(|t| t.mime_type().to_string())
            .unwrap_or_else(|| "application/octet-stream".into());
        Ok((bytes, mime))
    }

    async fn delete(&self, key: &str) -> Result<(), MediaError> {
        // Best-effort delete: treat not found as success
        let _ = self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;
        Ok(())
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.public_base, key)
    }
}

#[cfg(feature = "inmem-backend")]
pub mod mem {
    use super::*;
    use dashmap::DashMap;

    /// Hash-map store backing local mode and tests.
    #[derive(Default)]
    pub struct MemMediaStore {
        objects: DashMap<String, (Vec<u8>, String)>,
    }

    impl MemMediaStore {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl MediaStore for MemMediaStore {
        async fn save(&self, bytes: &[u8]) -> Result<StoredMedia, MediaError> {
            let (key, mime) = prepare(bytes)?;
            let duplicate = self.objects.contains_key(&key);
            if !duplicate {
                self.objects
                    .insert(key.clone(), (bytes.to_vec(), mime.clone()));
            }
            Ok(StoredMedia {
                url: self.public_url(&key),
                key,
                mime,
                size: bytes.len(),
                duplicate,
            })
        }

        async fn load(&self, key: &str) -> Result<(Vec<u8>, String), MediaError> {
            self.objects
                .get(key)
                .map(|e| e.value().clone())
                .ok_or(MediaError::NotFound)
        }

        async fn delete(&self, key: &str) -> Result<(), MediaError> {
            self.objects.remove(key);
            Ok(())
        }

        fn public_url(&self, key: &str) -> String {
            format!("mem://{key}")
        }
    }
}
