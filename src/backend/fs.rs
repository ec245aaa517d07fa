//! Local-disk blob backend.
//!
//! Payloads live under `root/{bucket}/{shard}/{shard}/{key}`, where the shards
//! are the first two bytes of MD5(`bucket/key`). Writes go to a temporary file
//! in the destination directory, are fsynced, then renamed into place.

use super::{
    BackendError, BackendResult, BlobBackend, BlobReader, BlobRef, ByteStream, ObjectInfo,
    PresignSigner, PutOptions,
};
use async_trait::async_trait;
use futures::StreamExt;
use std::{
    collections::BTreeMap,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

const MAX_OBJECT_KEY_LEN: usize = 1024;
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;
const TMP_PREFIX: &str = ".tmp-";

#[derive(Clone)]
pub struct FsBackend {
    root: PathBuf,
    signer: Arc<PresignSigner>,
}

/// Removes the temporary file on drop unless the write was committed.
struct TempFile {
    path: PathBuf,
    armed: bool,
}

impl TempFile {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn commit(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

impl FsBackend {
    pub fn new(root: impl Into<PathBuf>, signer: Arc<PresignSigner>) -> Self {
        Self {
            root: root.into(),
            signer,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Rejects keys that are empty, absolute, contain `..`, or carry control
    /// characters and backslashes.
    fn ensure_key_safe(&self, key: &str) -> BackendResult<()> {
        let invalid = key.is_empty()
            || key.len() > MAX_OBJECT_KEY_LEN
            || key.starts_with('/')
            || key.ends_with('/')
            || key.contains("..")
            || key.contains("//")
            || key
                .bytes()
                .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0');
        if invalid {
            return Err(BackendError::InvalidObjectKey(key.to_string()));
        }
        Ok(())
    }

    /// S3-style bucket names: 3 to 63 lowercase letters, digits, dots and
    /// hyphens, alphanumeric at both ends, not shaped like an IPv4 address.
    fn ensure_bucket_name_safe(&self, name: &str) -> BackendResult<()> {
        let invalid = |reason: &str| BackendError::InvalidBucketName {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        let len = name.len();
        if !(BUCKET_NAME_MIN_LEN..=BUCKET_NAME_MAX_LEN).contains(&len) {
            return Err(invalid("must be between 3 and 63 characters"));
        }
        if !name
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
        {
            return Err(invalid(
                "allowed characters are lowercase letters, digits, dots, and hyphens",
            ));
        }
        if name.starts_with(['.', '-']) || name.ends_with(['.', '-']) {
            return Err(invalid("must start and end with a lowercase letter or digit"));
        }
        if name.contains("..") || name.contains("-.") || name.contains(".-") {
            return Err(invalid(
                "cannot contain consecutive dots or dot-hyphen combinations",
            ));
        }
        if is_ipv4_like(name) {
            return Err(invalid("must not be formatted like an IP address"));
        }
        Ok(())
    }

    fn validate(&self, bucket: &str, key: &str) -> BackendResult<()> {
        self.ensure_bucket_name_safe(bucket)?;
        self.ensure_key_safe(key)
    }

    fn bucket_root(&self, bucket: &str) -> PathBuf {
        self.root.join(bucket)
    }

    fn object_shards(bucket: &str, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", bucket, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(bucket, key);
        let mut path = self.bucket_root(bucket);
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    /// Create the destination directory and an open temp file beside it.
    async fn create_temp(&self, file_path: &Path) -> BackendResult<(TempFile, File)> {
        let parent = file_path.parent().ok_or_else(|| {
            BackendError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(parent).await?;
        let tmp_path = parent.join(format!("{}{}", TMP_PREFIX, Uuid::new_v4()));
        let file = File::create(&tmp_path).await?;
        Ok((TempFile::new(tmp_path), file))
    }

    async fn commit_temp(&self, mut tmp: TempFile, mut file: File, dest: &Path) -> BackendResult<()> {
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if let Err(err) = fs::rename(&tmp.path, dest).await {
            if err.kind() != ErrorKind::AlreadyExists {
                return Err(BackendError::Io(err));
            }
            fs::remove_file(dest).await?;
            fs::rename(&tmp.path, dest).await?;
        }
        tmp.commit();
        Ok(())
    }

    async fn open(&self, bucket: &str, key: &str) -> BackendResult<File> {
        File::open(self.object_path(bucket, key))
            .await
            .map_err(|err| {
                if err.kind() == ErrorKind::NotFound {
                    BackendError::not_found(bucket, key)
                } else {
                    BackendError::Io(err)
                }
            })
    }

    /// Remove empty directories from `start` upwards, stopping below `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err)
                    if matches!(
                        err.kind(),
                        ErrorKind::NotFound | ErrorKind::DirectoryNotEmpty
                    ) =>
                {
                    break;
                }
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl BlobBackend for FsBackend {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        mut body: ByteStream,
        expected_size: Option<u64>,
        _opts: PutOptions,
    ) -> BackendResult<u64> {
        self.validate(bucket, key)?;
        let file_path = self.object_path(bucket, key);
        let (tmp, mut file) = self.create_temp(&file_path).await?;

        let mut written: u64 = 0;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            written += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }

        if let Some(expected) = expected_size {
            if expected != written {
                return Err(BackendError::SizeMismatch {
                    key: key.to_string(),
                    expected,
                    actual: written,
                });
            }
        }

        self.commit_temp(tmp, file, &file_path).await?;
        debug!(bucket, key, size = written, "stored blob");
        Ok(written)
    }

    async fn get(&self, bucket: &str, key: &str) -> BackendResult<BlobReader> {
        self.validate(bucket, key)?;
        let file = self.open(bucket, key).await?;
        let size = file.metadata().await?.len();
        Ok(BlobReader {
            body: ReaderStream::new(file).boxed(),
            size,
        })
    }

    async fn head(&self, bucket: &str, key: &str) -> BackendResult<Option<ObjectInfo>> {
        self.validate(bucket, key)?;
        match fs::metadata(self.object_path(bucket, key)).await {
            Ok(meta) if meta.is_file() => Ok(Some(ObjectInfo {
                key: key.to_string(),
                size: meta.len(),
            })),
            Ok(_) => Ok(None),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(BackendError::Io(err)),
        }
    }

    async fn remove(&self, bucket: &str, key: &str) -> BackendResult<()> {
        self.validate(bucket, key)?;
        let file_path = self.object_path(bucket, key);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed blob {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("blob {} already missing", file_path.display());
                return Ok(());
            }
            Err(err) => return Err(BackendError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent, &self.bucket_root(bucket)).await;
        }
        Ok(())
    }

    async fn compose(&self, dest: &BlobRef, sources: &[BlobRef]) -> BackendResult<u64> {
        self.validate(&dest.bucket, &dest.key)?;
        for source in sources {
            self.validate(&source.bucket, &source.key)?;
        }

        let dest_path = self.object_path(&dest.bucket, &dest.key);
        let (tmp, mut file) = self.create_temp(&dest_path).await?;

        let mut total: u64 = 0;
        for source in sources {
            let mut reader = self.open(&source.bucket, &source.key).await?;
            total += tokio::io::copy(&mut reader, &mut file).await?;
        }

        self.commit_temp(tmp, file, &dest_path).await?;
        debug!(bucket = %dest.bucket, key = %dest.key, parts = sources.len(), size = total, "composed blob");
        Ok(total)
    }

    async fn presign(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
        response_params: &BTreeMap<String, String>,
    ) -> BackendResult<String> {
        self.validate(bucket, key)?;
        self.signer.sign(bucket, key, ttl, response_params)
    }

    async fn list(&self, bucket: &str) -> BackendResult<Vec<ObjectInfo>> {
        self.ensure_bucket_name_safe(bucket)?;
        let bucket_root = self.bucket_root(bucket);
        let mut objects = Vec::new();

        for shard_a in read_dirs(&bucket_root).await? {
            for shard_b in read_dirs(&shard_a).await? {
                let mut pending = vec![(shard_b, String::new())];
                while let Some((dir, prefix)) = pending.pop() {
                    let mut entries = fs::read_dir(&dir).await?;
                    while let Some(entry) = entries.next_entry().await? {
                        let name = entry.file_name().to_string_lossy().into_owned();
                        let file_type = entry.file_type().await?;
                        if file_type.is_dir() {
                            pending.push((entry.path(), format!("{prefix}{name}/")));
                        } else if file_type.is_file() && !name.starts_with(TMP_PREFIX) {
                            let size = entry.metadata().await?.len();
                            objects.push(ObjectInfo {
                                key: format!("{prefix}{name}"),
                                size,
                            });
                        }
                    }
                }
            }
        }

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }
}

/// Subdirectories of `dir`; a missing directory yields none.
async fn read_dirs(dir: &Path) -> BackendResult<Vec<PathBuf>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(BackendError::Io(err)),
    };
    let mut dirs = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() == 4
        && parts.iter().all(|segment| {
            !segment.is_empty()
                && segment.len() <= 3
                && segment.chars().all(|c| c.is_ascii_digit())
                && segment.parse::<u8>().is_ok()
        })
}

/// Drain a [`ByteStream`] into memory. Test helper shared with other modules.
#[cfg(test)]
pub(crate) async fn collect(stream: ByteStream) -> Vec<u8> {
    use futures::TryStreamExt;
    stream
        .try_fold(Vec::new(), |mut acc, chunk| async move {
            acc.extend_from_slice(&chunk);
            Ok(acc)
        })
        .await
        .unwrap()
}
