// objectbackup/src/backup/integrity.rs
//! Content digests and post-upload verification.
//!
//! The digest must be the one the store reports for a finished upload.
//! For S3 that is the ETag: plain MD5 hex for a single PUT, and
//! `md5(md5(part_1) .. md5(part_n))-n` for a multipart upload.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use crate::backup::store::ObjectHead;
use crate::errors::IntegrityError;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// How a local file's digest is computed so it compares against the store's.
pub trait DigestStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn digest(&self, path: &Path) -> Result<String, IntegrityError>;
}

/// S3 ETag semantics. Files larger than `multipart_threshold` are digested
/// in parts of that size, matching how `S3Store` splits them.
#[derive(Debug, Clone, Copy)]
pub struct Md5Etag {
    pub multipart_threshold: u64,
}

impl Md5Etag {
    pub fn new(multipart_threshold: u64) -> Self {
        Md5Etag {
            multipart_threshold: multipart_threshold.max(1),
        }
    }
}

impl DigestStrategy for Md5Etag {
    fn name(&self) -> &'static str {
        "md5-etag"
    }

    fn digest(&self, path: &Path) -> Result<String, IntegrityError> {
        let read_err = |e: std::io::Error| {
            IntegrityError::LocalDigest(format!("{}: {}", path.display(), e))
        };
        let mut file = File::open(path).map_err(read_err)?;
        let size = file.metadata().map_err(read_err)?.len();

        let mut buffer = vec![0u8; READ_BUFFER_SIZE];

        if size <= self.multipart_threshold {
            let mut context = md5::Context::new();
            loop {
                let n = file.read(&mut buffer).map_err(read_err)?;
                if n == 0 {
                    break;
                }
                context.consume(&buffer[..n]);
            }
            return Ok(hex::encode(context.compute().0));
        }

        let mut part_digests: Vec<u8> = Vec::new();
        let mut parts = 0usize;
        let mut context = md5::Context::new();
        let mut in_part = 0u64;
        loop {
            let want = (self.multipart_threshold - in_part).min(buffer.len() as u64) as usize;
            let n = file.read(&mut buffer[..want]).map_err(read_err)?;
            if n == 0 {
                break;
            }
            context.consume(&buffer[..n]);
            in_part += n as u64;
            if in_part == self.multipart_threshold {
                let finished = std::mem::replace(&mut context, md5::Context::new());
                part_digests.extend_from_slice(&finished.compute().0);
                parts += 1;
                in_part = 0;
            }
        }
        if in_part > 0 {
            part_digests.extend_from_slice(&context.compute().0);
            parts += 1;
        }

        Ok(format!(
            "{}-{}",
            hex::encode(md5::compute(&part_digests).0),
            parts
        ))
    }
}

/// Computes local digests and checks them against what the store reports.
#[derive(Clone)]
pub struct IntegrityChecker {
    strategy: Arc<dyn DigestStrategy>,
}

impl IntegrityChecker {
    pub fn new(strategy: Arc<dyn DigestStrategy>) -> Self {
        IntegrityChecker { strategy }
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn digest(&self, local_path: &Path) -> Result<String, IntegrityError> {
        self.strategy.digest(local_path)
    }

    /// ETags come quoted and sometimes upper-cased; both are ignored.
    pub fn verify(&self, local_digest: &str, remote_digest: &str) -> bool {
        let normalize = |d: &str| d.trim().trim_matches('"').to_ascii_lowercase();
        let local = normalize(local_digest);
        !local.is_empty() && local == normalize(remote_digest)
    }

    /// Checks the uploaded object: it exists, its size matches and both the
    /// digest returned by the PUT and the one reported by HEAD match locally.
    pub fn verify_upload(
        &self,
        local_digest: &str,
        local_size: u64,
        put_digest: &str,
        head: Option<&ObjectHead>,
    ) -> Result<(), IntegrityError> {
        let head = head.ok_or(IntegrityError::MissingObject)?;
        if head.size != local_size {
            return Err(IntegrityError::SizeMismatch {
                local: local_size,
                remote: head.size,
            });
        }
        for remote in [put_digest, head.digest.as_str()] {
            if !self.verify(local_digest, remote) {
                return Err(IntegrityError::DigestMismatch {
                    local: local_digest.to_string(),
                    remote: remote.to_string(),
                });
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for IntegrityChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrityChecker")
            .field("strategy", &self.strategy.name())
            .finish()
    }
}
