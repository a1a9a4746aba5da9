//! SSH/SFTP destination
//!
//! `ssh2` is blocking, so every remote call runs on the blocking pool. Uploads
//! stream through a bounded channel into a writer task that fills a hidden
//! temporary file and renames it into place only when told to commit.

use super::{check_digest, naming, staging_token, DestinationAdapter};
use crate::config::SftpDestinationConfig;
use crate::credentials::Secret;
use crate::error::{BackupError, Result};
use crate::report::{ArtifactDescriptor, ArtifactStatus};
use crate::sources::{ArtifactStream, CHUNK_SIZE};
use crate::utils::cancel::CancelSignal;
use crate::utils::checksum::Checksum;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ssh2::{CheckResult, KnownHostFileKind, OpenFlags, OpenType, RenameFlags, Session, Sftp};
use std::future::Future;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const DEFAULT_PORT: u16 = 22;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// libssh2 `LIBSSH2_FX_NO_SUCH_FILE`
const SFTP_NO_SUCH_FILE: i32 = 2;

pub enum SftpAuth {
    Password(Secret),
    PrivateKey {
        key: Secret,
        passphrase: Option<Secret>,
    },
}

struct SftpConn {
    session: Session,
    sftp: Sftp,
}

enum WriteOp {
    Chunk(Vec<u8>),
    Commit,
}

enum FeedError {
    Upstream(BackupError),
    WriterGone,
}

pub struct SftpDestination {
    name: String,
    host: String,
    port: u16,
    user: String,
    remote_dir: String,
    auth: Arc<SftpAuth>,
    known_hosts: Option<PathBuf>,
    timeout: Duration,
    conn: Arc<Mutex<Option<SftpConn>>>,
}

impl SftpDestination {
    pub fn new(name: &str, config: &SftpDestinationConfig, auth: SftpAuth) -> Self {
        Self {
            name: name.to_string(),
            host: config.host.clone(),
            port: config.port.unwrap_or(DEFAULT_PORT),
            user: config.user.clone(),
            remote_dir: config.remote_dir.trim_end_matches('/').to_string(),
            auth: Arc::new(auth),
            known_hosts: config.known_hosts.as_deref().map(crate::config::expand_tilde),
            timeout: config
                .timeout_seconds
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_TIMEOUT),
            conn: Arc::new(Mutex::new(None)),
        }
    }

    fn remote_path(&self, name: &str) -> PathBuf {
        if self.remote_dir.is_empty() {
            PathBuf::from(name)
        } else {
            PathBuf::from(format!("{}/{}", self.remote_dir, name))
        }
    }

    /// Run `f` against the open connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&SftpConn) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let name = self.name.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| BackupError::Transfer(format!("{}: connection state poisoned", name)))?;
            let conn = guard.as_ref().ok_or_else(|| {
                BackupError::Connection(format!("Destination '{}' is not connected", name))
            })?;
            f(conn)
        })
        .await
        .map_err(|e| BackupError::Transfer(format!("SFTP task failed: {}", e)))?
    }
}

fn open_session(
    host: &str,
    port: u16,
    user: &str,
    auth: &SftpAuth,
    known_hosts: Option<&Path>,
    timeout: Duration,
) -> Result<SftpConn> {
    let addr = (host, port)
        .to_socket_addrs()
        .map_err(|e| BackupError::Connection(format!("Cannot resolve {}: {}", host, e)))?
        .next()
        .ok_or_else(|| BackupError::Connection(format!("No address for {}", host)))?;

    let tcp = TcpStream::connect_timeout(&addr, timeout)
        .map_err(|e| BackupError::Connection(format!("Cannot reach {}:{}: {}", host, port, e)))?;

    let mut session =
        Session::new().map_err(|e| BackupError::Connection(format!("SSH session: {}", e)))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(timeout.as_millis().min(u32::MAX as u128) as u32);
    session
        .handshake()
        .map_err(|e| BackupError::Connection(format!("SSH handshake with {} failed: {}", host, e)))?;

    if let Some(path) = known_hosts {
        check_host_key(&session, host, port, path)?;
    }

    let auth_result = match auth {
        SftpAuth::Password(password) => session.userauth_password(user, password.expose()),
        SftpAuth::PrivateKey { key, passphrase } => session.userauth_pubkey_memory(
            user,
            None,
            key.expose(),
            passphrase.as_ref().map(|p| p.expose()),
        ),
    };
    if let Err(e) = auth_result {
        return Err(BackupError::Authentication(format!(
            "{}@{} rejected: {}",
            user, host, e
        )));
    }
    if !session.authenticated() {
        return Err(BackupError::Authentication(format!(
            "{}@{} not authenticated",
            user, host
        )));
    }

    let sftp = session
        .sftp()
        .map_err(|e| BackupError::Connection(format!("SFTP subsystem unavailable: {}", e)))?;
    Ok(SftpConn { session, sftp })
}

fn check_host_key(session: &Session, host: &str, port: u16, path: &Path) -> Result<()> {
    let mut known = session
        .known_hosts()
        .map_err(|e| BackupError::Config(format!("known_hosts: {}", e)))?;
    known
        .read_file(path, KnownHostFileKind::OpenSSH)
        .map_err(|e| BackupError::Config(format!("Cannot read {:?}: {}", path, e)))?;
    let (key, _) = session
        .host_key()
        .ok_or_else(|| BackupError::Connection(format!("{} sent no host key", host)))?;

    match known.check_port(host, port, key) {
        CheckResult::Match => Ok(()),
        CheckResult::NotFound => Err(BackupError::Authentication(format!(
            "Host key for {} not found in {:?}",
            host, path
        ))),
        CheckResult::Mismatch => Err(BackupError::Authentication(format!(
            "Host key for {} does not match {:?}",
            host, path
        ))),
        CheckResult::Failure => Err(BackupError::Authentication(format!(
            "Host key check for {} failed",
            host
        ))),
    }
}

fn ensure_dir(sftp: &Sftp, dir: &str) -> Result<()> {
    if dir.is_empty() {
        return Ok(());
    }
    let mut current = String::new();
    for part in dir.split('/') {
        if part.is_empty() {
            if current.is_empty() {
                current.push('/');
            }
            continue;
        }
        if !current.is_empty() && !current.ends_with('/') {
            current.push('/');
        }
        current.push_str(part);
        let path = Path::new(&current);
        if sftp.stat(path).is_err() {
            sftp.mkdir(path, 0o750).map_err(|e| {
                BackupError::Transfer(format!("Cannot create remote directory {}: {}", current, e))
            })?;
        }
    }
    Ok(())
}

fn is_missing(err: &ssh2::Error) -> bool {
    matches!(err.code(), ssh2::ErrorCode::SFTP(SFTP_NO_SUCH_FILE))
}

fn transfer_error(context: &str, err: impl std::fmt::Display) -> BackupError {
    BackupError::Transfer(format!("{}: {}", context, err))
}

/// File operations the upload path needs from the remote side
trait RemoteFiles {
    type File: Write;

    fn create_exclusive(&self, path: &Path) -> Result<Self::File>;
    /// Best-effort flush to stable storage
    fn sync(&self, file: &mut Self::File);
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;
    /// Remove `path`; a missing file is not an error
    fn unlink(&self, path: &Path) -> Result<()>;
}

impl RemoteFiles for Sftp {
    type File = ssh2::File;

    fn create_exclusive(&self, path: &Path) -> Result<ssh2::File> {
        self.open_mode(
            path,
            OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::EXCLUSIVE,
            0o640,
            OpenType::File,
        )
        .map_err(|e| transfer_error("open staging file", e))
    }

    fn sync(&self, file: &mut ssh2::File) {
        if let Err(e) = file.fsync() {
            debug!("Remote fsync unsupported: {}", e);
        }
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        Sftp::rename(
            self,
            from,
            to,
            Some(RenameFlags::OVERWRITE | RenameFlags::ATOMIC | RenameFlags::NATIVE),
        )
        .map_err(|e| transfer_error("rename into place", e))
    }

    fn unlink(&self, path: &Path) -> Result<()> {
        match Sftp::unlink(self, path) {
            Ok(()) => Ok(()),
            Err(e) if is_missing(&e) => Ok(()),
            Err(e) => Err(transfer_error(&format!("delete {:?}", path), e)),
        }
    }
}

/// Drain `rx` into a staging file and rename it onto `target` on commit.
///
/// If the channel closes before a commit arrives the upload was abandoned.
fn receive_remote<R: RemoteFiles>(
    fs: &R,
    staging: &Path,
    target: &Path,
    rx: &mut mpsc::Receiver<WriteOp>,
) -> Result<()> {
    let mut file = fs.create_exclusive(staging)?;

    while let Some(op) = rx.blocking_recv() {
        match op {
            WriteOp::Chunk(data) => file
                .write_all(&data)
                .map_err(|e| transfer_error("write", e))?,
            WriteOp::Commit => {
                fs.sync(&mut file);
                drop(file);
                return fs.rename(staging, target);
            }
        }
    }
    Err(BackupError::Cancelled)
}

/// [`receive_remote`], removing the staging file if anything went wrong
fn receive_or_discard<R: RemoteFiles>(
    fs: &R,
    staging: &Path,
    target: &Path,
    rx: &mut mpsc::Receiver<WriteOp>,
) -> Result<()> {
    let result = receive_remote(fs, staging, target, rx);
    if result.is_err() {
        match fs.unlink(staging) {
            Ok(()) => debug!("Removed staging file {:?}", staging),
            Err(e) => warn!("Failed to remove staging file {:?}: {}", staging, e),
        }
    }
    result
}

/// Feed `stream` to a writer running on the other end of a channel and
/// wait for both halves.
async fn transfer<W, Fut>(
    stream: &mut ArtifactStream,
    cancel: &CancelSignal,
    writer: W,
) -> Result<Checksum>
where
    W: FnOnce(mpsc::Receiver<WriteOp>) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let (tx, rx) = mpsc::channel::<WriteOp>(4);
    let written = writer(rx);

    let mut cancel = cancel.clone();
    let feeding = async {
        let fed = feed(&tx, stream, &mut cancel).await;
        drop(tx);
        fed
    };
    let (fed, written) = tokio::join!(feeding, written);

    match (fed, written) {
        (Ok(checksum), Ok(())) => Ok(checksum),
        (Err(FeedError::Upstream(e)), _) => Err(e),
        (_, Err(e)) => Err(e),
        (Err(FeedError::WriterGone), Ok(())) => {
            Err(BackupError::Transfer("SFTP writer stopped early".to_string()))
        }
    }
}

async fn feed(
    tx: &mpsc::Sender<WriteOp>,
    stream: &mut ArtifactStream,
    cancel: &mut CancelSignal,
) -> std::result::Result<Checksum, FeedError> {
    let mut checksum = Checksum::new();
    loop {
        let next = cancel
            .guard(stream.next_chunk())
            .await
            .map_err(FeedError::Upstream)?;
        let Some(chunk) = next else { break };
        checksum.update(&chunk);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FeedError::Upstream(BackupError::Cancelled)),
            sent = tx.send(WriteOp::Chunk(chunk)) => sent.map_err(|_| FeedError::WriterGone)?,
        }
    }
    tx.send(WriteOp::Commit)
        .await
        .map_err(|_| FeedError::WriterGone)?;
    Ok(checksum)
}

#[async_trait]
impl DestinationAdapter for SftpDestination {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&mut self) -> Result<()> {
        let host = self.host.clone();
        let port = self.port;
        let user = self.user.clone();
        let auth = Arc::clone(&self.auth);
        let known_hosts = self.known_hosts.clone();
        let timeout = self.timeout;
        let remote_dir = self.remote_dir.clone();

        let conn = tokio::task::spawn_blocking(move || {
            let conn = open_session(&host, port, &user, &auth, known_hosts.as_deref(), timeout)?;
            ensure_dir(&conn.sftp, &remote_dir)?;
            Ok::<_, BackupError>(conn)
        })
        .await
        .map_err(|e| BackupError::Connection(format!("SFTP connect task failed: {}", e)))??;

        info!("Connected to sftp://{}@{}:{}", self.user, self.host, self.port);
        let mut slot = self
            .conn
            .lock()
            .map_err(|_| BackupError::Connection("connection state poisoned".to_string()))?;
        *slot = Some(conn);
        Ok(())
    }

    async fn put_stream(
        &mut self,
        name: &str,
        mut stream: ArtifactStream,
        cancel: &CancelSignal,
    ) -> Result<ArtifactDescriptor> {
        let staging = self.remote_path(&naming::staging_name(name, &staging_token()));
        let target = self.remote_path(name);

        let checksum = transfer(&mut stream, cancel, |mut rx| {
            self.with_conn(move |conn| receive_or_discard(&conn.sftp, &staging, &target, &mut rx))
        })
        .await?;

        let size_bytes = checksum.bytes();
        info!("Uploaded {} ({} bytes) to {}", name, size_bytes, self.host);
        Ok(ArtifactDescriptor {
            name: name.to_string(),
            size_bytes,
            checksum: Some(checksum.finalize()),
            created_at: naming::embedded_timestamp(name).unwrap_or_else(Utc::now),
            destination: self.name.clone(),
            status: ArtifactStatus::Succeeded,
        })
    }

    async fn verify_checksum(&mut self, descriptor: &ArtifactDescriptor) -> Result<()> {
        let path = self.remote_path(&descriptor.name);
        let (digest, size) = self
            .with_conn(move |conn| {
                let mut file = conn.sftp.open(&path).map_err(|e| {
                    if is_missing(&e) {
                        BackupError::Integrity(format!("{:?} is missing after upload", path))
                    } else {
                        transfer_error("open for verification", e)
                    }
                })?;
                let mut checksum = Checksum::new();
                let mut buf = vec![0u8; CHUNK_SIZE];
                loop {
                    let n = file.read(&mut buf).map_err(|e| transfer_error("read", e))?;
                    if n == 0 {
                        break;
                    }
                    checksum.update(&buf[..n]);
                }
                let size = checksum.bytes();
                Ok((checksum.finalize(), size))
            })
            .await?;
        check_digest(descriptor, &digest, size)
    }

    async fn list_existing(&mut self, prefix: &str) -> Result<Vec<ArtifactDescriptor>> {
        let dir = if self.remote_dir.is_empty() {
            PathBuf::from(".")
        } else {
            PathBuf::from(&self.remote_dir)
        };
        let entries = self
            .with_conn(move |conn| {
                conn.sftp
                    .readdir(&dir)
                    .map_err(|e| transfer_error("list remote directory", e))
            })
            .await?;

        let mut found = Vec::new();
        for (path, stat) in entries {
            let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
                continue;
            };
            if !name.starts_with(prefix) || naming::is_staging(&name) || !stat.is_file() {
                continue;
            }
            let modified = stat
                .mtime
                .and_then(|t| DateTime::from_timestamp(t as i64, 0));
            found.push(ArtifactDescriptor {
                created_at: naming::parse_timestamp(prefix, &name)
                    .or(modified)
                    .unwrap_or_else(Utc::now),
                name,
                size_bytes: stat.size.unwrap_or(0),
                checksum: None,
                destination: self.name.clone(),
                status: ArtifactStatus::Succeeded,
            });
        }
        Ok(found)
    }

    async fn delete_existing(&mut self, descriptor: &ArtifactDescriptor) -> Result<()> {
        let path = self.remote_path(&descriptor.name);
        self.with_conn(move |conn| RemoteFiles::unlink(&conn.sftp, &path))
            .await
    }

    async fn close(&mut self) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            if let Ok(mut slot) = conn.lock() {
                if let Some(conn) = slot.take() {
                    let _ = conn.session.disconnect(None, "backup finished", None);
                }
            }
        })
        .await
        .map_err(|e| BackupError::Transfer(format!("SFTP close task failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::sources::{ChunkStream, MemoryStream};
    use crate::utils::cancel::CancelHandle;
    use std::collections::HashMap;

    type Tree = Arc<Mutex<HashMap<PathBuf, Vec<u8>>>>;

    /// In-memory remote directory
    #[derive(Clone, Default)]
    struct MemoryFiles {
        tree: Tree,
        fail_writes_after: Option<usize>,
        unlinked: Arc<Mutex<Vec<PathBuf>>>,
    }

    struct MemoryFile {
        path: PathBuf,
        tree: Tree,
        budget: Option<usize>,
    }

    impl Write for MemoryFile {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if let Some(budget) = self.budget.as_mut() {
                if *budget < buf.len() {
                    return Err(std::io::Error::new(std::io::ErrorKind::Other, "quota exceeded"));
                }
                *budget -= buf.len();
            }
            let mut tree = self.tree.lock().unwrap();
            tree.entry(self.path.clone()).or_default().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl RemoteFiles for MemoryFiles {
        type File = MemoryFile;

        fn create_exclusive(&self, path: &Path) -> Result<MemoryFile> {
            let mut tree = self.tree.lock().unwrap();
            if tree.contains_key(path) {
                return Err(BackupError::Transfer(format!("{:?} exists", path)));
            }
            tree.insert(path.to_path_buf(), Vec::new());
            Ok(MemoryFile {
                path: path.to_path_buf(),
                tree: Arc::clone(&self.tree),
                budget: self.fail_writes_after,
            })
        }

        fn sync(&self, _file: &mut MemoryFile) {}

        fn rename(&self, from: &Path, to: &Path) -> Result<()> {
            let mut tree = self.tree.lock().unwrap();
            let data = tree
                .remove(from)
                .ok_or_else(|| BackupError::Transfer(format!("{:?} missing", from)))?;
            tree.insert(to.to_path_buf(), data);
            Ok(())
        }

        fn unlink(&self, path: &Path) -> Result<()> {
            self.unlinked.lock().unwrap().push(path.to_path_buf());
            self.tree.lock().unwrap().remove(path);
            Ok(())
        }
    }

    impl MemoryFiles {
        fn paths(&self) -> Vec<PathBuf> {
            let mut paths: Vec<_> = self.tree.lock().unwrap().keys().cloned().collect();
            paths.sort();
            paths
        }
    }

    /// Yields `before` chunks, then fires `handle` and keeps yielding
    struct CancelMidway {
        before: usize,
        handle: Option<CancelHandle>,
    }

    #[async_trait]
    impl ChunkStream for CancelMidway {
        async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
            if self.before == 0 {
                if let Some(handle) = self.handle.take() {
                    handle.cancel();
                }
            } else {
                self.before -= 1;
            }
            Ok(Some(vec![7; 1024]))
        }
    }

    async fn upload(
        fs: &MemoryFiles,
        mut stream: ArtifactStream,
        cancel: &CancelSignal,
    ) -> Result<Checksum> {
        let staging = PathBuf::from("/db/.a.sql.gz.partial-x");
        let target = PathBuf::from("/db/a.sql.gz");
        transfer(&mut stream, cancel, |mut rx| {
            let fs = fs.clone();
            async move {
                tokio::task::spawn_blocking(move || {
                    receive_or_discard(&fs, &staging, &target, &mut rx)
                })
                .await
                .map_err(|e| BackupError::Transfer(e.to_string()))?
            }
        })
        .await
    }

    #[tokio::test]
    async fn test_commit_renames_staging_into_place() {
        let fs = MemoryFiles::default();
        let checksum = upload(
            &fs,
            Box::new(MemoryStream::from_bytes(b"pg_dump output", 4)),
            &CancelSignal::never(),
        )
        .await
        .unwrap();

        assert_eq!(checksum.bytes(), 14);
        assert_eq!(fs.paths(), vec![PathBuf::from("/db/a.sql.gz")]);
        assert_eq!(
            fs.tree.lock().unwrap()[Path::new("/db/a.sql.gz")],
            b"pg_dump output".to_vec()
        );
        assert!(fs.unlinked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_write_failure_unlinks_staging() {
        let fs = MemoryFiles {
            fail_writes_after: Some(8),
            ..Default::default()
        };
        let err = upload(
            &fs,
            Box::new(MemoryStream::from_bytes(&[1u8; 64], 4)),
            &CancelSignal::never(),
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Transfer);
        assert!(fs.paths().is_empty());
        assert_eq!(
            *fs.unlinked.lock().unwrap(),
            vec![PathBuf::from("/db/.a.sql.gz.partial-x")]
        );
    }

    #[tokio::test]
    async fn test_cancel_mid_upload_unlinks_staging() {
        let fs = MemoryFiles::default();
        let (handle, signal) = CancelHandle::new();
        let stream = CancelMidway {
            before: 3,
            handle: Some(handle),
        };

        let err = upload(&fs, Box::new(stream), &signal).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(fs.paths().is_empty());
        assert_eq!(fs.unlinked.lock().unwrap().len(), 1);
    }

    fn config(host: &str, port: u16) -> SftpDestinationConfig {
        SftpDestinationConfig {
            host: host.to_string(),
            port: Some(port),
            user: "backup".to_string(),
            remote_dir: "/volume1/db/".to_string(),
            password_ref: Some("nas".to_string()),
            private_key_ref: None,
            known_hosts: None,
            timeout_seconds: Some(2),
        }
    }

    fn destination(port: u16) -> SftpDestination {
        SftpDestination::new(
            "nas",
            &config("127.0.0.1", port),
            SftpAuth::Password(Secret::new("pw")),
        )
    }

    #[test]
    fn test_remote_paths() {
        let dest = destination(22);
        assert_eq!(
            dest.remote_path("a.sql.gz"),
            PathBuf::from("/volume1/db/a.sql.gz")
        );
    }

    #[tokio::test]
    async fn test_refused_connection_is_transient() {
        // bind then drop to get a port with nothing listening
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut dest = destination(port);
        let err = dest.connect().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_operations_require_connect() {
        let mut dest = destination(22);
        let err = dest.list_existing("nightly-").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
        dest.close().await.unwrap();
    }
}
