//! HTTP client for the page-serving service.

use std::future::Future;
use std::io;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::client::conn::http1::{self, SendRequest};
use hyper::{header, Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, warn};

use super::wire::TimelineInfo;
use super::PageService;
use crate::types::{Lsn, NimbusError, PageBuf, PageId, Result, ServiceKind, TimelineId, PAGE_SIZE};

/// Largest body accepted from the timeline and health endpoints.
const MAX_METADATA_BODY: usize = 64 * 1024;

/// Host and path prefix parsed from an `http://` base URL.
#[derive(Clone, Debug, PartialEq, Eq)]
struct BaseUrl {
    authority: String,
    prefix: String,
}

impl BaseUrl {
    fn parse(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix("http://")
            .ok_or_else(|| NimbusError::InvalidOwned(format!("unsupported url: {url}")))?;
        let (authority, prefix) = match rest.find('/') {
            Some(idx) => (&rest[..idx], rest[idx..].trim_end_matches('/')),
            None => (rest, ""),
        };
        if authority.is_empty() {
            return Err(NimbusError::InvalidOwned(format!("missing host: {url}")));
        }
        let authority = if authority.contains(':') {
            authority.to_string()
        } else {
            format!("{authority}:80")
        };
        Ok(Self {
            authority,
            prefix: prefix.to_string(),
        })
    }
}

struct PageResponse {
    status: StatusCode,
    body: Bytes,
}

/// Keep-alive HTTP/1.1 client for one page-service connection.
///
/// Endpoints: `GET /page/{timeline}/{page}`, `GET|POST|DELETE
/// /timeline/{timeline}` and `GET /health`.
///
/// Each client drives its connection on a private current-thread runtime,
/// so calls block the caller and must not be made from inside a tokio task.
pub struct PageClient {
    base: BaseUrl,
    timeout: Duration,
    sender: Option<SendRequest<Empty<Bytes>>>,
    runtime: Runtime,
}

impl PageClient {
    /// Creates a client and opens its connection.
    pub fn connect(base_url: &str, timeout: Duration) -> Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let mut client = Self {
            base: BaseUrl::parse(base_url)?,
            timeout,
            sender: None,
            runtime,
        };
        let sender = client.checkout()?;
        client.sender = Some(sender);
        Ok(client)
    }

    /// Sets the per-call timeout used for the next connection.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
        self.sender = None;
    }

    /// Points the client at another service instance.
    pub fn set_base_url(&mut self, base_url: &str) -> Result<()> {
        self.base = BaseUrl::parse(base_url)?;
        self.sender = None;
        Ok(())
    }

    /// Whether a connection is currently open.
    pub fn is_connected(&self) -> bool {
        self.sender.as_ref().is_some_and(|sender| !sender.is_closed())
    }

    /// Same probe as [`PageService::check_availability`].
    pub fn get_server_status(&mut self) -> Result<()> {
        self.check_availability()
    }

    /// Takes the open connection, or opens a new one.
    fn checkout(&mut self) -> Result<SendRequest<Empty<Bytes>>> {
        match self.sender.take() {
            Some(sender) if !sender.is_closed() => Ok(sender),
            _ => {
                let sender = self
                    .runtime
                    .block_on(open(&self.base.authority, self.timeout))?;
                debug!(authority = %self.base.authority, "page.connect");
                Ok(sender)
            }
        }
    }

    fn request(&mut self, method: Method, path: &str, limit: usize) -> Result<PageResponse> {
        let full_path = format!("{}{}", self.base.prefix, path);
        match self.try_request(&method, &full_path, limit) {
            Err(NimbusError::Io(err)) => {
                debug!(%method, path = %full_path, error = %err, "page.request.reconnect");
                self.try_request(&method, &full_path, limit)
            }
            other => other,
        }
    }

    fn try_request(&mut self, method: &Method, path: &str, limit: usize) -> Result<PageResponse> {
        let request = Request::builder()
            .method(method.clone())
            .uri(path)
            .header(header::HOST, self.base.authority.as_str())
            .body(Empty::<Bytes>::new())
            .map_err(|err| NimbusError::InvalidOwned(format!("bad request {path}: {err}")))?;
        let mut sender = self.checkout()?;
        let timeout = self.timeout;
        let (response, keep_alive) = self
            .runtime
            .block_on(within(timeout, exchange(&mut sender, request, limit)))
            .and_then(|outcome| outcome)?;
        if keep_alive {
            self.sender = Some(sender);
        }
        Ok(response)
    }

    fn expect_success(response: PageResponse) -> Result<PageResponse> {
        if response.status.is_success() {
            Ok(response)
        } else {
            Err(NimbusError::Remote {
                kind: ServiceKind::Page,
                status: response.status.as_u16(),
                message: String::from_utf8_lossy(&response.body).into_owned(),
            })
        }
    }
}

async fn open(authority: &str, timeout: Duration) -> Result<SendRequest<Empty<Bytes>>> {
    let stream = within(timeout, TcpStream::connect(authority)).await??;
    stream.set_nodelay(true)?;
    let (sender, connection) = within(timeout, http1::handshake(TokioIo::new(stream)))
        .await?
        .map_err(transport)?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            debug!(error = %err, "page.connection.closed");
        }
    });
    Ok(sender)
}

/// Sends one request and reads at most `limit` body bytes.
///
/// Returns the response and whether the connection may be reused.
async fn exchange(
    sender: &mut SendRequest<Empty<Bytes>>,
    request: Request<Empty<Bytes>>,
    limit: usize,
) -> Result<(PageResponse, bool)> {
    sender.ready().await.map_err(transport)?;
    let response = sender.send_request(request).await.map_err(transport)?;
    let status = response.status();
    let keep_alive = !response
        .headers()
        .get(header::CONNECTION)
        .is_some_and(|value| value.as_bytes().eq_ignore_ascii_case(b"close"));
    let body = response.into_body();
    let announced = body.size_hint().lower();
    if announced > limit as u64 {
        return Err(NimbusError::Protocol(format!(
            "response body of {announced} bytes exceeds the {limit} byte limit"
        )));
    }
    let collected = Limited::new(body, limit).collect().await.map_err(|err| {
        if err.is::<LengthLimitError>() {
            return NimbusError::Protocol(format!(
                "response body exceeds the {limit} byte limit"
            ));
        }
        match err.downcast::<hyper::Error>() {
            Ok(err) => transport(*err),
            Err(err) => NimbusError::Io(io::Error::new(io::ErrorKind::ConnectionAborted, err)),
        }
    })?;
    Ok((
        PageResponse {
            status,
            body: collected.to_bytes(),
        },
        keep_alive,
    ))
}

async fn within<F: Future>(timeout: Duration, fut: F) -> Result<F::Output> {
    tokio::time::timeout(timeout, fut).await.map_err(|_| {
        NimbusError::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("no answer within {} ms", timeout.as_millis()),
        ))
    })
}

/// Malformed responses are protocol errors; everything else is transport.
fn transport(err: hyper::Error) -> NimbusError {
    if err.is_parse() {
        NimbusError::Protocol(format!("malformed response: {err}"))
    } else {
        NimbusError::Io(io::Error::new(io::ErrorKind::ConnectionAborted, err))
    }
}

impl PageService for PageClient {
    fn read_page(&mut self, page_id: PageId) -> Result<PageBuf> {
        let path = format!("/page/{}/{}", page_id.timeline, page_id.page_number);
        let response = Self::expect_success(self.request(Method::GET, &path, PAGE_SIZE)?)?;
        if response.body.len() != PAGE_SIZE {
            warn!(
                page = %page_id,
                len = response.body.len(),
                "page.read.bad_length"
            );
            return Err(NimbusError::Protocol(format!(
                "page {page_id} returned {} bytes, expected {PAGE_SIZE}",
                response.body.len()
            )));
        }
        Ok(response.body.to_vec().into_boxed_slice())
    }

    fn create_timeline(&mut self, timeline: TimelineId) -> Result<()> {
        let path = format!("/timeline/{timeline}");
        Self::expect_success(self.request(Method::POST, &path, MAX_METADATA_BODY)?)?;
        Ok(())
    }

    fn delete_timeline(&mut self, timeline: TimelineId) -> Result<()> {
        let path = format!("/timeline/{timeline}");
        Self::expect_success(self.request(Method::DELETE, &path, MAX_METADATA_BODY)?)?;
        Ok(())
    }

    fn timeline_info(&mut self, timeline: TimelineId) -> Result<Lsn> {
        let path = format!("/timeline/{timeline}");
        let response =
            Self::expect_success(self.request(Method::GET, &path, MAX_METADATA_BODY)?)?;
        let info: TimelineInfo = serde_json::from_slice(&response.body)
            .map_err(|err| NimbusError::Protocol(format!("bad timeline info: {err}")))?;
        Ok(Lsn(info.latest_lsn))
    }

    fn check_availability(&mut self) -> Result<()> {
        Self::expect_success(self.request(Method::GET, "/health", MAX_METADATA_BODY)?)?;
        Ok(())
    }
}
