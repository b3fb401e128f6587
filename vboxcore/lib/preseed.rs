//! The preseed HTTP server.
//!
//! During a master install the guest's boot loader is pointed at
//! `http://<advertise_host>:<port>/preseed.cfg`, where [`PreseedServer`] serves the rendered
//! unattended-install document. One server runs per process, serving one document at a time.
//! It runs while at least one [`PreseedLease`] is alive.

use std::{
    net::{SocketAddr, TcpListener as StdTcpListener},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use axum::{extract::State, http::header, response::IntoResponse, routing::get, Router};
use tokio::{net::TcpListener, task::JoinHandle};

use crate::{
    config::{PreseedSection, PRESEED_PATH},
    VboxcoreError, VboxcoreResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const PRESEED_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Serves one unattended-install document over HTTP.
#[derive(Debug, Clone)]
pub struct PreseedServer {
    inner: Arc<Inner>,
}

/// Keeps the preseed server running. The server stops when the last lease is dropped.
#[derive(Debug)]
pub struct PreseedLease {
    inner: Arc<Inner>,
    url: String,
    generation: u64,
}

#[derive(Debug)]
struct Inner {
    section: PreseedSection,
    running: Mutex<Option<Running>>,
    generations: AtomicU64,
}

#[derive(Debug)]
struct Running {
    generation: u64,
    document: Arc<str>,
    url: String,
    local_addr: SocketAddr,
    served: Arc<AtomicUsize>,
    leases: usize,
    task: JoinHandle<()>,
}

#[derive(Clone)]
struct Document {
    body: Arc<str>,
    served: Arc<AtomicUsize>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl PreseedServer {
    /// Creates a stopped server that will bind and advertise as `section` says.
    pub fn new(section: PreseedSection) -> Self {
        Self {
            inner: Arc::new(Inner {
                section,
                running: Mutex::new(None),
                generations: AtomicU64::new(0),
            }),
        }
    }

    /// Starts serving `document` and returns the URL guests fetch it from.
    ///
    /// Starting again with the same document returns the same URL. Starting with a different
    /// document while running fails with [`VboxcoreError::Conflict`].
    pub fn start(&self, document: &str) -> VboxcoreResult<String> {
        let mut running = self.inner.running();
        self.inner.start_locked(&mut running, document)
    }

    /// Starts serving `document` and counts the caller as a user of the server.
    pub fn acquire(&self, document: &str) -> VboxcoreResult<PreseedLease> {
        let mut running = self.inner.running();
        let url = self.inner.start_locked(&mut running, document)?;

        let generation = match running.as_mut() {
            Some(running) => {
                running.leases += 1;
                running.generation
            }
            None => {
                return Err(VboxcoreError::Invariant(
                    "preseed server not running after start".to_string(),
                ))
            }
        };

        Ok(PreseedLease {
            inner: Arc::clone(&self.inner),
            url,
            generation,
        })
    }

    /// Stops the server regardless of leases. Does nothing when it is not running.
    pub fn stop(&self) {
        self.inner.stop_locked(&mut self.inner.running());
    }

    /// The address the server is bound to, if running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.running().as_ref().map(|running| running.local_addr)
    }

    /// The advertised URL, if running.
    pub fn url(&self) -> Option<String> {
        self.inner.running().as_ref().map(|running| running.url.clone())
    }

    /// How many times the current document has been served.
    pub fn served(&self) -> usize {
        self.inner.served()
    }
}

impl PreseedLease {
    /// The URL guests fetch the document from.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// How many times the leased document has been served.
    pub fn served(&self) -> usize {
        self.inner.served()
    }
}

impl Inner {
    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn served(&self) -> usize {
        self.running()
            .as_ref()
            .map(|running| running.served.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    fn start_locked(
        &self,
        running: &mut Option<Running>,
        document: &str,
    ) -> VboxcoreResult<String> {
        if let Some(current) = running.as_ref() {
            if &*current.document == document {
                return Ok(current.url.clone());
            }

            return Err(VboxcoreError::Conflict(format!(
                "the preseed server at {} is serving a different document",
                current.url
            )));
        }

        let listener = StdTcpListener::bind((self.section.bind_host.as_str(), self.section.port))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let listener = TcpListener::from_std(listener)?;

        let url = format!(
            "http://{}:{}{PRESEED_PATH}",
            self.section.advertise_host,
            local_addr.port()
        );

        let document = Document {
            body: Arc::from(document),
            served: Arc::new(AtomicUsize::new(0)),
        };

        let app = Router::new()
            .route(PRESEED_PATH, get(serve_document))
            .with_state(document.clone());

        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app.into_make_service()).await {
                tracing::error!(error = %e, "preseed server failed");
            }
        });

        tracing::info!(%local_addr, %url, "preseed server started");

        *running = Some(Running {
            generation: self.generations.fetch_add(1, Ordering::SeqCst) + 1,
            document: document.body,
            url: url.clone(),
            local_addr,
            served: document.served,
            leases: 0,
            task,
        });

        Ok(url)
    }

    fn stop_locked(&self, running: &mut Option<Running>) {
        if let Some(running) = running.take() {
            running.task.abort();
            tracing::info!(local_addr = %running.local_addr, "preseed server stopped");
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

async fn serve_document(State(document): State<Document>) -> impl IntoResponse {
    document.served.fetch_add(1, Ordering::SeqCst);
    tracing::debug!("preseed document served");

    (
        [(header::CONTENT_TYPE, PRESEED_CONTENT_TYPE)],
        document.body.to_string(),
    )
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Drop for PreseedLease {
    fn drop(&mut self) {
        let mut running = self.inner.running();

        let last = match running.as_mut() {
            Some(current) if current.generation == self.generation => {
                current.leases = current.leases.saturating_sub(1);
                current.leases == 0
            }
            _ => false,
        };

        if last {
            self.inner.stop_locked(&mut running);
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
    };

    use super::*;

    fn loopback() -> PreseedServer {
        PreseedServer::new(PreseedSection {
            bind_host: "127.0.0.1".to_string(),
            port: 0,
            advertise_host: "10.0.2.2".to_string(),
        })
    }

    async fn http_get(addr: SocketAddr, path: &str) -> anyhow::Result<String> {
        let mut stream = TcpStream::connect(addr).await?;
        stream
            .write_all(
                format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n")
                    .as_bytes(),
            )
            .await?;

        let mut response = String::new();
        stream.read_to_string(&mut response).await?;
        Ok(response)
    }

    #[test_log::test(tokio::test)]
    async fn test_serves_document_at_preseed_path() -> anyhow::Result<()> {
        let server = loopback();
        let url = server.start("d-i passwd/username string ops\n")?;
        let addr = server.local_addr().ok_or_else(|| anyhow::anyhow!("not running"))?;

        assert_eq!(url, format!("http://10.0.2.2:{}/preseed.cfg", addr.port()));

        let response = http_get(addr, "/preseed.cfg").await?;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response
            .to_ascii_lowercase()
            .contains("content-type: text/plain; charset=utf-8"));
        assert!(response.ends_with("d-i passwd/username string ops\n"));
        assert_eq!(server.served(), 1);

        let response = http_get(addr, "/other.cfg").await?;
        assert!(response.starts_with("HTTP/1.1 404"));

        server.stop();
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_start_is_idempotent_and_conflicts() -> anyhow::Result<()> {
        let server = loopback();
        let first = server.start("a")?;

        assert_eq!(server.start("a")?, first);
        assert!(matches!(server.start("b"), Err(VboxcoreError::Conflict(_))));

        server.stop();
        server.stop();
        assert!(server.local_addr().is_none());

        let again = server.start("b")?;
        assert!(again.ends_with("/preseed.cfg"));
        server.stop();

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_last_lease_stops_server() -> anyhow::Result<()> {
        let server = loopback();
        let first = server.acquire("a")?;
        let second = server.acquire("a")?;
        let addr = server.local_addr().ok_or_else(|| anyhow::anyhow!("not running"))?;

        drop(first);
        assert!(server.local_addr().is_some());

        drop(second);
        assert!(server.local_addr().is_none());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(TcpStream::connect(addr).await.is_err());

        Ok(())
    }
}
