use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use std::sync::Arc;
use tracing::debug;

use super::keys::StorageUri;
use crate::config::StoreSettings;
use crate::error::StoreError;

/// Abstraction over the remote object store
///
/// Keys are logical: implementations scope them under their own configured
/// location, so callers only deal with `{folder}/{relative path}` keys.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// List every key starting with `prefix`, directory markers included
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Fetch the full body of an object
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    /// Create or replace an object
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), StoreError>;

    /// Human-readable location used in log lines
    fn location(&self) -> String;
}

/// ObjectStore implementation for S3 and S3-compatible endpoints
#[derive(Clone)]
pub struct S3ObjectStore {
    s3_client: Arc<S3Client>,
    uri: StorageUri,
}

impl S3ObjectStore {
    /// Create a new S3ObjectStore from an existing client
    pub fn new(s3_client: Arc<S3Client>, uri: StorageUri) -> Self {
        Self { s3_client, uri }
    }

    /// Load AWS configuration and build a client for the configured location
    pub async fn connect(settings: &StoreSettings) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &settings.region {
            loader = loader.region(Region::new(region.clone()));
        }
        let sdk_config = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = &settings.endpoint_url {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        let client = S3Client::from_conf(builder.build());
        Self::new(Arc::new(client), settings.uri.clone())
    }

    fn backend_error(
        operation: &'static str,
        key: &str,
        err: impl std::error::Error + Send + Sync + 'static,
    ) -> StoreError {
        StoreError::Backend {
            operation,
            key: key.to_string(),
            message: DisplayErrorContext(err).to_string(),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let full_prefix = self.uri.full_key(prefix);

        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let response = self
                .s3_client
                .list_objects_v2()
                .bucket(&self.uri.bucket)
                .prefix(&full_prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| Self::backend_error("ListObjectsV2", prefix, e))?;

            for object in response.contents() {
                if let Some(key) = object.key() {
                    keys.push(self.uri.logical_key(key).to_string());
                }
            }

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        debug!(prefix, count = keys.len(), "listed objects");
        Ok(keys)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let response = self
            .s3_client
            .get_object()
            .bucket(&self.uri.bucket)
            .key(self.uri.full_key(key))
            .send()
            .await
            .map_err(|e| {
                let service_error = e.into_service_error();
                if service_error.is_no_such_key() {
                    StoreError::NotFound(key.to_string())
                } else {
                    Self::backend_error("GetObject", key, service_error)
                }
            })?;

        let bytes = response
            .body
            .collect()
            .await
            .map_err(|e| Self::backend_error("GetObject body", key, e))?
            .into_bytes()
            .to_vec();

        Ok(bytes)
    }

    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), StoreError> {
        self.s3_client
            .put_object()
            .bucket(&self.uri.bucket)
            .key(self.uri.full_key(key))
            .content_type(content_type)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| Self::backend_error("PutObject", key, e))?;

        Ok(())
    }

    fn location(&self) -> String {
        format!("s3://{}/{}", self.uri.bucket, self.uri.prefix)
    }
}

#[cfg(test)]
pub(crate) mod memory {
    //! In-memory ObjectStore used by tests

    use super::*;
    use std::collections::{BTreeMap, HashSet};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    pub struct MemoryObjectStore {
        objects: Mutex<BTreeMap<String, (Vec<u8>, String)>>,
        failing_gets: Mutex<HashSet<String>>,
        failing_put_prefixes: Mutex<Vec<String>>,
        get_delay: Mutex<Option<Duration>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        puts: AtomicUsize,
    }

    impl MemoryObjectStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert(&self, key: &str, body: &[u8]) {
            self.objects.lock().unwrap().insert(
                key.to_string(),
                (body.to_vec(), "application/octet-stream".to_string()),
            );
        }

        pub fn fail_get(&self, key: &str) {
            self.failing_gets.lock().unwrap().insert(key.to_string());
        }

        pub fn fail_puts_under(&self, prefix: &str) {
            self.failing_put_prefixes
                .lock()
                .unwrap()
                .push(prefix.to_string());
        }

        pub fn delay_gets(&self, delay: Duration) {
            *self.get_delay.lock().unwrap() = Some(delay);
        }

        pub fn keys(&self) -> Vec<String> {
            self.objects.lock().unwrap().keys().cloned().collect()
        }

        pub fn body(&self, key: &str) -> Option<Vec<u8>> {
            self.objects
                .lock()
                .unwrap()
                .get(key)
                .map(|(body, _)| body.clone())
        }

        pub fn content_type(&self, key: &str) -> Option<String> {
            self.objects
                .lock()
                .unwrap()
                .get(key)
                .map(|(_, content_type)| content_type.clone())
        }

        pub fn max_concurrent_gets(&self) -> usize {
            self.max_in_flight.load(Ordering::SeqCst)
        }

        pub fn put_count(&self) -> usize {
            self.puts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ObjectStore for MemoryObjectStore {
        async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
            Ok(self
                .objects
                .lock()
                .unwrap()
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect())
        }

        async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);

            let delay = *self.get_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let result = if self.failing_gets.lock().unwrap().contains(key) {
                Err(StoreError::Backend {
                    operation: "GetObject",
                    key: key.to_string(),
                    message: "injected failure".to_string(),
                })
            } else {
                self.objects
                    .lock()
                    .unwrap()
                    .get(key)
                    .map(|(body, _)| body.clone())
                    .ok_or_else(|| StoreError::NotFound(key.to_string()))
            };

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }

        async fn put(
            &self,
            key: &str,
            body: Vec<u8>,
            content_type: &str,
        ) -> Result<(), StoreError> {
            let failing = self
                .failing_put_prefixes
                .lock()
                .unwrap()
                .iter()
                .any(|p| key.starts_with(p.as_str()));
            if failing {
                return Err(StoreError::Backend {
                    operation: "PutObject",
                    key: key.to_string(),
                    message: "injected failure".to_string(),
                });
            }

            self.puts.fetch_add(1, Ordering::SeqCst);
            self.objects
                .lock()
                .unwrap()
                .insert(key.to_string(), (body, content_type.to_string()));
            Ok(())
        }

        fn location(&self) -> String {
            "memory://test".to_string()
        }
    }
}
