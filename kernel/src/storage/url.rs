//! Table-location parsing: turns a URL (or bare path) into a configured
//! [`StorageBackend`] rooted at the table.
//!
//! Supported forms: `memory://[name]`, `file:///path`, `/abs/path`,
//! `./rel/path`, `s3://bucket/prefix`,
//! `s3://bucket.s3.region.amazonaws.com/prefix`, `r2://bucket/prefix`.
//! Consumers can plug additional schemes via [`register_scheme_handler`].

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, RwLock};

use object_store::path::Path;
use object_store::prefix::PrefixStore;
use object_store::DynObjectStore;
use percent_encoding::percent_decode_str;
use url::Url;

use super::{memory_store, ObjectStoreBackend, StorageRef};
use crate::error::{DlResult, Error};

/// Free-form backend options (region, endpoint, credentials profile).
#[derive(Debug, Clone, Default)]
pub struct StorageOptions(pub HashMap<String, String>);

impl StorageOptions {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

type HandlerClosure = Arc<dyn Fn(&Url, &StorageOptions) -> DlResult<StorageRef> + Send + Sync>;

static SCHEME_REGISTRY: LazyLock<RwLock<HashMap<String, HandlerClosure>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// Register a handler for a custom URL scheme, letting callers plug their
/// own [`super::StorageBackend`] into the factory.
pub fn register_scheme_handler(scheme: impl AsRef<str>, handler: HandlerClosure) -> DlResult<()> {
    let mut registry = SCHEME_REGISTRY
        .write()
        .map_err(|_| Error::internal("scheme registry lock poisoned"))?;
    registry.insert(scheme.as_ref().to_string(), handler);
    Ok(())
}

/// Parse a table location into a storage backend rooted at that table.
pub fn parse_table_url(location: &str, options: &StorageOptions) -> DlResult<StorageRef> {
    if location.contains('\0') {
        return Err(Error::validation("table location contains a null byte"));
    }
    let decoded = percent_decode_str(location)
        .decode_utf8()
        .map_err(|_| Error::validation(format!("table location is not valid UTF-8: {location}")))?;
    if decoded.contains('\0') {
        return Err(Error::validation("table location contains a null byte"));
    }

    // Bare paths go straight to the local filesystem.
    if decoded.starts_with('/') || decoded.starts_with("./") || decoded.starts_with("../") {
        return local_backend(&decoded);
    }

    let url = Url::parse(&decoded)
        .map_err(|e| Error::validation(format!("invalid table location {location}: {e}")))?;

    if let Ok(registry) = SCHEME_REGISTRY.read() {
        if let Some(handler) = registry.get(url.scheme()) {
            return handler(&url, options);
        }
    }

    match url.scheme() {
        "memory" => {
            let name = url.host_str().unwrap_or("");
            let store: Arc<DynObjectStore> = memory_store(name);
            let prefix = url.path().trim_matches('/');
            Ok(with_prefix(store, prefix))
        }
        "file" => {
            let path = url
                .to_file_path()
                .map_err(|_| Error::validation(format!("invalid file URL: {location}")))?;
            local_backend(&path.to_string_lossy())
        }
        "s3" => s3_backend(&url, options, /* r2 */ false),
        "r2" => s3_backend(&url, options, /* r2 */ true),
        other => Err(Error::validation(format!(
            "unsupported storage scheme: {other}"
        ))),
    }
}

fn with_prefix(store: Arc<DynObjectStore>, prefix: &str) -> StorageRef {
    if prefix.is_empty() {
        Arc::new(ObjectStoreBackend::new(store))
    } else {
        Arc::new(ObjectStoreBackend::new(Arc::new(PrefixStore::new(
            store,
            Path::from(prefix),
        ))))
    }
}

fn local_backend(path: &str) -> DlResult<StorageRef> {
    std::fs::create_dir_all(path)?;
    // Canonicalizing pins the root; object_store's Path type rejects `..`
    // segments, so reads and writes cannot escape it afterwards.
    let canonical = std::fs::canonicalize(path)?;
    let store = object_store::local::LocalFileSystem::new_with_prefix(&canonical)
        .map_err(Error::ObjectStore)?;
    Ok(Arc::new(ObjectStoreBackend::new(Arc::new(store))))
}

#[cfg(feature = "cloud")]
fn s3_backend(url: &Url, options: &StorageOptions, r2: bool) -> DlResult<StorageRef> {
    use object_store::aws::AmazonS3Builder;

    let host = url
        .host_str()
        .ok_or_else(|| Error::validation(format!("missing bucket in {url}")))?;

    let mut builder = AmazonS3Builder::from_env();
    // Virtual-hosted form: bucket.s3.region.amazonaws.com
    let bucket = match host.split_once(".s3.") {
        Some((bucket, rest)) => {
            if let Some(region) = rest.strip_suffix(".amazonaws.com") {
                builder = builder.with_region(region);
            }
            bucket
        }
        None => host,
    };
    if bucket.is_empty() {
        return Err(Error::validation(format!("missing bucket in {url}")));
    }
    builder = builder.with_bucket_name(bucket);
    if let Some(region) = options.get("region") {
        builder = builder.with_region(region);
    }
    if let Some(endpoint) = options.get("endpoint") {
        builder = builder.with_endpoint(endpoint);
    }
    if r2 {
        let account = options.get("account_id").map(str::to_string).or_else(|| {
            std::env::var("R2_ACCOUNT_ID").ok()
        });
        match (options.get("endpoint"), account) {
            (Some(_), _) => {}
            (None, Some(account)) => {
                builder = builder
                    .with_endpoint(format!("https://{account}.r2.cloudflarestorage.com"));
            }
            (None, None) => {
                return Err(Error::validation(
                    "r2:// locations need an `endpoint` option or R2_ACCOUNT_ID",
                ));
            }
        }
        // R2 speaks the S3 API but only with path-style addressing.
        builder = builder.with_virtual_hosted_style_request(false);
    }
    let store = builder.build().map_err(Error::ObjectStore)?;
    let prefix = url.path().trim_matches('/');
    Ok(with_prefix(Arc::new(store), prefix))
}

#[cfg(not(feature = "cloud"))]
fn s3_backend(url: &Url, _options: &StorageOptions, _r2: bool) -> DlResult<StorageRef> {
    Err(Error::validation(format!(
        "{url} requires the `cloud` feature"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn memory_urls_share_by_name() {
        let a = parse_table_url("memory://tbl-share", &StorageOptions::default()).unwrap();
        let b = parse_table_url("memory://tbl-share", &StorageOptions::default()).unwrap();
        a.write(&Path::from("k"), Bytes::from_static(b"v"))
            .await
            .unwrap();
        assert_eq!(b.read(&Path::from("k")).await.unwrap().as_ref(), b"v");

        let fresh = parse_table_url("memory://", &StorageOptions::default()).unwrap();
        assert!(fresh.read(&Path::from("k")).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn local_paths_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let loc = dir.path().join("table");
        let store =
            parse_table_url(loc.to_str().unwrap(), &StorageOptions::default()).unwrap();
        store
            .write(&Path::from("part-x.parquet"), Bytes::from_static(b"d"))
            .await
            .unwrap();
        assert!(loc.join("part-x.parquet").exists());
    }

    #[test]
    fn rejects_null_bytes_and_garbage() {
        let opts = StorageOptions::default();
        assert!(matches!(
            parse_table_url("memory://a\0b", &opts),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            parse_table_url("memory%3A%2F%2Fa%00b", &opts),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            parse_table_url("gopher://nope", &opts),
            Err(Error::Validation(_))
        ));
    }

    #[cfg(not(feature = "cloud"))]
    #[test]
    fn cloud_schemes_need_the_feature() {
        let opts = StorageOptions::default();
        assert!(matches!(
            parse_table_url("s3://bucket/prefix", &opts),
            Err(Error::Validation(_))
        ));
    }
}
