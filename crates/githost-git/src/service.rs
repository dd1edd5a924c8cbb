//! Async entry points for an HTTP transport.
//!
//! Each call checks access, then runs the blocking protocol engine on
//! `spawn_blocking`, bounded by the configured request timeout and the
//! caller's cancellation token.

use crate::config::ProtocolConfig;
use crate::protocol::{ProtocolEngine, Service};
use crate::{GitError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use flate2::read::GzDecoder;
use githost_storage::Repository;
use std::fmt;
use std::io::{self, BufRead, BufReader, Cursor};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Kind of access a request needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    /// Advertise and fetch.
    Read,
    /// Push.
    Write,
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => f.write_str("read"),
            Self::Write => f.write_str("write"),
        }
    }
}

/// Decides whether a principal may access a repository.
#[async_trait]
pub trait AccessControl: Send + Sync {
    /// `principal` is `None` for anonymous requests.
    async fn authorize(&self, repository_key: &str, principal: Option<&str>, access: Access) -> bool;
}

/// Grants everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl AccessControl for AllowAll {
    async fn authorize(&self, _repository_key: &str, _principal: Option<&str>, _access: Access) -> bool {
        true
    }
}

/// A request body as received by the transport.
#[derive(Debug, Clone, Default)]
pub struct RequestBody {
    /// Raw bytes.
    pub data: Bytes,
    /// Set when the request had `Content-Encoding: gzip`.
    pub gzip: bool,
}

impl RequestBody {
    /// An uncompressed body.
    pub fn plain(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            gzip: false,
        }
    }

    /// A gzip-encoded body.
    pub fn gzip(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            gzip: true,
        }
    }

    fn reader(self) -> Box<dyn BufRead + Send> {
        let cursor = Cursor::new(self.data);
        if self.gzip {
            Box::new(BufReader::new(GzDecoder::new(cursor)))
        } else {
            Box::new(cursor)
        }
    }
}

/// What the transport sends back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceResponse {
    /// `Content-Type` header.
    pub content_type: &'static str,
    /// `Cache-Control` header.
    pub cache_control: &'static str,
    /// Response body.
    pub body: Bytes,
}

impl ServiceResponse {
    fn new(content_type: &'static str, body: Vec<u8>) -> Self {
        Self {
            content_type,
            cache_control: "no-cache",
            body: Bytes::from(body),
        }
    }
}

/// Smart HTTP service over repositories the caller has opened.
pub struct GitService<A> {
    access: Arc<A>,
    config: ProtocolConfig,
}

impl<A> Clone for GitService<A> {
    fn clone(&self) -> Self {
        Self {
            access: Arc::clone(&self.access),
            config: self.config.clone(),
        }
    }
}

impl<A: AccessControl + 'static> GitService<A> {
    /// Creates a service.
    pub fn new(access: Arc<A>, config: ProtocolConfig) -> Self {
        Self { access, config }
    }

    /// Protocol limits in effect.
    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    /// `GET info/refs?service=<service>`.
    ///
    /// Fetch advertisements need read access, push advertisements write
    /// access.
    pub async fn info_refs(
        &self,
        repo: Arc<Repository>,
        service: Service,
        principal: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ServiceResponse> {
        let access = match service {
            Service::UploadPack => Access::Read,
            Service::ReceivePack => Access::Write,
        };
        self.authorize(&repo, principal, access).await?;

        let config = self.config.clone();
        let body = self
            .run(cancel, move |token| {
                let mut out = Vec::new();
                ProtocolEngine::new(&repo, service)
                    .with_config(&config)
                    .with_cancellation(token)
                    .advertise(&mut out)?;
                Ok(out)
            })
            .await?;
        Ok(ServiceResponse::new(service.advertisement_content_type(), body))
    }

    /// `POST git-upload-pack`.
    pub async fn upload_pack(
        &self,
        repo: Arc<Repository>,
        principal: Option<&str>,
        body: RequestBody,
        cancel: &CancellationToken,
    ) -> Result<ServiceResponse> {
        self.authorize(&repo, principal, Access::Read).await?;

        let config = self.config.clone();
        let out = self
            .run(cancel, move |token| {
                let mut out = Vec::new();
                ProtocolEngine::for_request(&repo, Service::UploadPack)
                    .with_config(&config)
                    .with_cancellation(token)
                    .upload_pack(body.reader(), &mut out)?;
                Ok(out)
            })
            .await?;
        Ok(ServiceResponse::new(Service::UploadPack.result_content_type(), out))
    }

    /// `POST git-receive-pack`.
    pub async fn receive_pack(
        &self,
        repo: Arc<Repository>,
        principal: Option<&str>,
        body: RequestBody,
        cancel: &CancellationToken,
    ) -> Result<ServiceResponse> {
        self.authorize(&repo, principal, Access::Write).await?;

        let config = self.config.clone();
        let out = self
            .run(cancel, move |token| {
                let mut out = Vec::new();
                ProtocolEngine::for_request(&repo, Service::ReceivePack)
                    .with_config(&config)
                    .with_cancellation(token)
                    .receive_pack(body.reader(), &mut out)?;
                Ok(out)
            })
            .await?;
        Ok(ServiceResponse::new(Service::ReceivePack.result_content_type(), out))
    }

    async fn authorize(&self, repo: &Repository, principal: Option<&str>, access: Access) -> Result<()> {
        if self.access.authorize(&repo.key, principal, access).await {
            return Ok(());
        }
        tracing::warn!(repo = %repo.key, principal = principal.unwrap_or("anonymous"), %access, "access denied");
        Err(GitError::Unauthorized)
    }

    /// Runs `job` off the async runtime. The job's token is cancelled when
    /// the caller cancels or the deadline passes.
    async fn run<T, F>(&self, cancel: &CancellationToken, job: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(CancellationToken) -> Result<T> + Send + 'static,
    {
        let token = cancel.child_token();
        let mut task = tokio::task::spawn_blocking({
            let token = token.clone();
            move || job(token)
        });

        let interrupted = tokio::select! {
            biased;
            _ = cancel.cancelled() => GitError::Cancelled,
            joined = tokio::time::timeout(self.config.timeout(), &mut task) => match joined {
                Ok(Ok(result)) => return result,
                Ok(Err(e)) => return Err(GitError::Io(io::Error::other(e))),
                Err(_) => GitError::TimedOut,
            },
        };

        token.cancel();
        tracing::warn!(error = %interrupted, "request interrupted");
        Err(interrupted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use githost_storage::{ObjectType, StorageConfig};
    use std::io::Write;
    use tempfile::TempDir;

    const SIG: &str = "Alice <alice@example.com> 1700000000 +0000";

    struct DenyWrites;

    #[async_trait]
    impl AccessControl for DenyWrites {
        async fn authorize(&self, _repository_key: &str, principal: Option<&str>, access: Access) -> bool {
            access == Access::Read || principal == Some("admin")
        }
    }

    fn repo() -> (TempDir, Arc<Repository>) {
        let dir = TempDir::new().unwrap();
        let config = StorageConfig {
            fsync: false,
            ..StorageConfig::default()
        };
        let repo = Repository::init(dir.path().join("repo.git"), "alice/repo", &config).unwrap();
        (dir, Arc::new(repo))
    }

    fn pkt(s: &str) -> Vec<u8> {
        crate::pktline::PktLine::from_string(s).encode()
    }

    #[tokio::test]
    async fn test_info_refs_response() {
        let (_dir, repo) = repo();
        let service = GitService::new(Arc::new(AllowAll), ProtocolConfig::default());
        let response = service
            .info_refs(repo, Service::UploadPack, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.content_type, "application/x-git-upload-pack-advertisement");
        assert_eq!(response.cache_control, "no-cache");
        assert!(response.body.starts_with(b"001e# service=git-upload-pack\n0000"));
    }

    #[tokio::test]
    async fn test_access_denied() {
        let (_dir, repo) = repo();
        let service = GitService::new(Arc::new(DenyWrites), ProtocolConfig::default());
        let cancel = CancellationToken::new();

        let err = service
            .receive_pack(repo.clone(), Some("bob"), RequestBody::plain(&b"0000"[..]), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, GitError::Unauthorized));
        let err = service
            .info_refs(repo.clone(), Service::ReceivePack, None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, GitError::Unauthorized));

        assert!(service
            .info_refs(repo.clone(), Service::UploadPack, None, &cancel)
            .await
            .is_ok());
        assert!(service
            .receive_pack(repo, Some("admin"), RequestBody::plain(&b"0000"[..]), &cancel)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_gzip_request_body() {
        let (_dir, repo) = repo();
        let tree = repo.objects.put(ObjectType::Tree, Vec::<u8>::new()).unwrap();
        let c1 = repo.commit(&tree, "initial\n", SIG, SIG).unwrap();

        let mut request = pkt(&format!("want {}\n", c1));
        request.extend_from_slice(b"0000");
        request.extend(pkt("done\n"));
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(&request).unwrap();

        let service = GitService::new(Arc::new(AllowAll), ProtocolConfig::default());
        let response = service
            .upload_pack(repo, None, RequestBody::gzip(gz.finish().unwrap()), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.content_type, "application/x-git-upload-pack-result");
        assert!(response.body.starts_with(b"0008NAK\nPACK"));
    }

    #[tokio::test]
    async fn test_cancelled_request() {
        let (_dir, repo) = repo();
        let service = GitService::new(Arc::new(AllowAll), ProtocolConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = service
            .upload_pack(repo, None, RequestBody::plain(&b"0000"[..]), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, GitError::Cancelled));
    }

    #[tokio::test]
    async fn test_protocol_error_propagates() {
        let (_dir, repo) = repo();
        let service = GitService::new(Arc::new(AllowAll), ProtocolConfig::default());
        let err = service
            .upload_pack(repo, None, RequestBody::plain(&b"xxzz"[..]), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_protocol_error());
    }
}
