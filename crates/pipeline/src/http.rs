//! HTTP source and sink.
//!
//! Uses `ureq` (sync) on `tokio::task::spawn_blocking`. Bodies are streamed
//! in both directions: a GET body reaches the sink chunk by chunk and a POST
//! body is read from the part as it is sent. Address type `HttpData`:
//!
//! - `endpoint` (required): URL to GET from or POST to
//! - `authorization` (optional): sent verbatim as the `Authorization` header
//! - `name` (optional, source): part name, defaults to the last URL segment
//! - `appendPartName` (optional flag, sink): POST each part to
//!   `{endpoint}/{part name}` instead of `{endpoint}`

use std::io::{self, Read};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use ferry_core::address::{AUTHORIZATION, ENDPOINT};
use ferry_core::{DataAddress, StreamFailure, StreamResult};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::io::SyncIoBridge;
use ureq::SendBody;

use crate::error::PipelineError;
use crate::part::DataPart;
use crate::sink::{DataSink, DataSinkFactory};
use crate::source::{required, DataSource, DataSourceFactory, PartsSource};

pub const HTTP_DATA_TYPE: &str = "HttpData";

/// Sink flag: address each part by name under the endpoint.
pub const APPEND_PART_NAME: &str = "appendPartName";

const CHUNK_SIZE: usize = 64 * 1024;
/// Chunks buffered between the blocking reader and the consumer.
const STREAM_CHUNKS: usize = 4;

fn validate_endpoint(address: &DataAddress) -> Result<(), PipelineError> {
    let endpoint = required(address, ENDPOINT)?;
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        Ok(())
    } else {
        Err(PipelineError::InvalidAddress(format!(
            "endpoint '{endpoint}' is not an http(s) URL"
        )))
    }
}

/// Map a `ureq` failure onto a transfer failure.
///
/// 401/403 are authentication errors, 404 is not found; 408, 429 and 5xx
/// are transient; any other status is permanent. Transport errors are
/// transient.
pub(crate) fn classify(url: &str, err: ureq::Error) -> StreamFailure {
    match err {
        ureq::Error::StatusCode(code @ (401 | 403)) => {
            StreamFailure::not_authorized(format!("{url} answered {code}"))
        }
        ureq::Error::StatusCode(404) => StreamFailure::not_found(format!("{url} answered 404")),
        ureq::Error::StatusCode(code) if code >= 500 || code == 408 || code == 429 => {
            StreamFailure::general(format!("{url} answered {code}"))
        }
        ureq::Error::StatusCode(code) => StreamFailure::fatal(format!("{url} answered {code}")),
        other => StreamFailure::general(format!("request to {url} failed: {other}")),
    }
}

fn join_error(err: tokio::task::JoinError) -> StreamFailure {
    StreamFailure::general(format!("task join error: {err}"))
}

// ── Source ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HttpDataSourceFactory {
    agent: ureq::Agent,
}

impl Default for HttpDataSourceFactory {
    fn default() -> Self {
        HttpDataSourceFactory {
            agent: ureq::Agent::new_with_defaults(),
        }
    }
}

#[async_trait]
impl DataSourceFactory for HttpDataSourceFactory {
    fn supported_type(&self) -> &str {
        HTTP_DATA_TYPE
    }

    fn validate(&self, address: &DataAddress) -> Result<(), PipelineError> {
        validate_endpoint(address)
    }

    async fn create_source(&self, address: &DataAddress) -> StreamResult<Box<dyn DataSource>> {
        let url = address
            .required_property(ENDPOINT)
            .map_err(StreamFailure::fatal)?
            .to_string();
        let name = address
            .property(crate::memory::NAME)
            .map(str::to_string)
            .unwrap_or_else(|| part_name_from_url(&url));
        let auth = address.property(AUTHORIZATION).map(str::to_string);
        let agent = self.agent.clone();

        let (headers_tx, headers_rx) = oneshot::channel();
        let (chunks_tx, chunks_rx) = mpsc::channel(STREAM_CHUNKS);
        tokio::task::spawn_blocking(move || {
            let mut request = agent.get(&url);
            if let Some(ref value) = auth {
                request = request.header("Authorization", value);
            }
            let response = match request.call() {
                Ok(response) => response,
                Err(e) => {
                    let _ = headers_tx.send(Err(classify(&url, e)));
                    return;
                }
            };
            let _ = headers_tx.send(Ok(response.body().content_length()));
            pump(response.into_body().into_reader(), &chunks_tx);
        });

        let size = headers_rx
            .await
            .map_err(|_| StreamFailure::general("request task ended before a response"))??;
        let reader = ChannelReader::new(chunks_rx);
        Ok(Box::new(PartsSource::new([DataPart::new(
            name,
            size,
            Box::new(reader),
        )])))
    }
}

/// Forward a blocking reader into `tx` chunk by chunk. Stops when the
/// receiving side is dropped.
fn pump(mut reader: impl Read, tx: &mpsc::Sender<io::Result<Vec<u8>>>) {
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let chunk = match reader.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => Ok(buf[..n].to_vec()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => Err(e),
        };
        let failed = chunk.is_err();
        if tx.blocking_send(chunk).is_err() || failed {
            return;
        }
    }
}

/// [`AsyncRead`] over chunks produced by a blocking task. A read error on
/// the producing side surfaces as a read error here, not as a short body.
struct ChannelReader {
    rx: mpsc::Receiver<io::Result<Vec<u8>>>,
    chunk: Vec<u8>,
    pos: usize,
}

impl ChannelReader {
    fn new(rx: mpsc::Receiver<io::Result<Vec<u8>>>) -> Self {
        ChannelReader {
            rx,
            chunk: Vec::new(),
            pos: 0,
        }
    }
}

impl AsyncRead for ChannelReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if self.pos < self.chunk.len() {
                let n = buf.remaining().min(self.chunk.len() - self.pos);
                let start = self.pos;
                buf.put_slice(&self.chunk[start..start + n]);
                self.pos += n;
                return Poll::Ready(Ok(()));
            }
            match self.rx.poll_recv(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    self.chunk = chunk;
                    self.pos = 0;
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(e)),
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

fn part_name_from_url(url: &str) -> String {
    url.split(['?', '#'])
        .next()
        .and_then(|path| path.trim_end_matches('/').rsplit('/').next())
        .filter(|segment| !segment.is_empty() && !segment.contains(':'))
        .unwrap_or("data")
        .to_string()
}

// ── Sink ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HttpDataSinkFactory {
    agent: ureq::Agent,
}

impl Default for HttpDataSinkFactory {
    fn default() -> Self {
        HttpDataSinkFactory {
            agent: ureq::Agent::new_with_defaults(),
        }
    }
}

#[async_trait]
impl DataSinkFactory for HttpDataSinkFactory {
    fn supported_type(&self) -> &str {
        HTTP_DATA_TYPE
    }

    fn validate(&self, address: &DataAddress) -> Result<(), PipelineError> {
        validate_endpoint(address)
    }

    async fn create_sink(&self, address: &DataAddress) -> StreamResult<Arc<dyn DataSink>> {
        let endpoint = address
            .required_property(ENDPOINT)
            .map_err(StreamFailure::fatal)?;
        Ok(Arc::new(HttpDataSink {
            agent: self.agent.clone(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            authorization: address.property(AUTHORIZATION).map(str::to_string),
            append_part_name: address.flag(APPEND_PART_NAME),
        }))
    }
}

struct HttpDataSink {
    agent: ureq::Agent,
    endpoint: String,
    authorization: Option<String>,
    append_part_name: bool,
}

#[async_trait]
impl DataSink for HttpDataSink {
    async fn write_part(&self, part: DataPart) -> StreamResult<u64> {
        let url = if self.append_part_name {
            format!("{}/{}", self.endpoint, part.name)
        } else {
            self.endpoint.clone()
        };
        let agent = self.agent.clone();
        let auth = self.authorization.clone();
        // Built here: the bridge needs the runtime handle of this task.
        let body = SyncIoBridge::new(part.into_reader());
        let sent = Arc::new(AtomicU64::new(0));
        let counter = sent.clone();

        tokio::task::spawn_blocking(move || {
            let mut request = agent
                .post(&url)
                .header("Content-Type", "application/octet-stream");
            if let Some(ref value) = auth {
                request = request.header("Authorization", value);
            }
            let body = Counted {
                inner: body,
                count: counter,
            };
            request
                .send(SendBody::from_owned_reader(body))
                .map(|_| ())
                .map_err(|e| classify(&url, e))
        })
        .await
        .map_err(join_error)??;
        Ok(sent.load(Ordering::Relaxed))
    }
}

/// Counts the bytes read through it.
struct Counted<R> {
    inner: R,
    count: Arc<AtomicU64>,
}

impl<R: Read> Read for Counted<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::FailureReason;
    use std::io::{BufRead, BufReader, Write};
    use std::net::{TcpListener, TcpStream};

    #[test]
    fn status_codes_are_classified() {
        let url = "http://x";
        assert_eq!(
            classify(url, ureq::Error::StatusCode(401)).reason,
            FailureReason::NotAuthorized
        );
        assert_eq!(
            classify(url, ureq::Error::StatusCode(404)).reason,
            FailureReason::NotFound
        );
        assert!(classify(url, ureq::Error::StatusCode(503)).retryable);
        assert!(classify(url, ureq::Error::StatusCode(429)).retryable);
        assert!(!classify(url, ureq::Error::StatusCode(400)).retryable);
    }

    #[test]
    fn part_name_defaults_to_last_segment() {
        assert_eq!(part_name_from_url("http://h/data/report.csv?x=1"), "report.csv");
        assert_eq!(part_name_from_url("http://h/data/"), "data");
        assert_eq!(part_name_from_url("http://h"), "h");
    }

    #[test]
    fn validate_requires_http_endpoint() {
        let factory = HttpDataSinkFactory::default();
        let ok = DataAddress::new(HTTP_DATA_TYPE).with_property(ENDPOINT, "https://h/in");
        let bad = DataAddress::new(HTTP_DATA_TYPE).with_property(ENDPOINT, "ftp://h/in");
        assert!(factory.validate(&ok).is_ok());
        assert!(matches!(
            factory.validate(&bad),
            Err(PipelineError::InvalidAddress(_))
        ));
        assert!(factory.validate(&DataAddress::new(HTTP_DATA_TYPE)).is_err());
    }

    /// Accept one connection on a background thread and hand it to `handle`.
    fn serve_once<F>(handle: F) -> (u16, std::thread::JoinHandle<Vec<u8>>)
    where
        F: FnOnce(&mut BufReader<TcpStream>, Vec<String>) -> Vec<u8> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream);
            let mut head = Vec::new();
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                let line = line.trim_end().to_string();
                if line.is_empty() {
                    break;
                }
                head.push(line);
            }
            handle(&mut reader, head)
        });
        (port, server)
    }

    fn header<'a>(head: &'a [String], name: &str) -> Option<&'a str> {
        head.iter().find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.eq_ignore_ascii_case(name).then(|| value.trim())
        })
    }

    fn read_request_body(reader: &mut BufReader<TcpStream>, head: &[String]) -> Vec<u8> {
        if let Some(len) = header(head, "content-length") {
            let mut body = vec![0u8; len.parse().unwrap()];
            reader.read_exact(&mut body).unwrap();
            return body;
        }
        let mut body = Vec::new();
        loop {
            let mut size = String::new();
            reader.read_line(&mut size).unwrap();
            let size = usize::from_str_radix(size.trim(), 16).unwrap();
            let mut chunk = vec![0u8; size + 2];
            reader.read_exact(&mut chunk).unwrap();
            if size == 0 {
                return body;
            }
            body.extend_from_slice(&chunk[..size]);
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn source_streams_the_response_body() {
        let body = pattern(300_000);
        let served = body.clone();
        let (port, server) = serve_once(move |reader, _head| {
            let stream = reader.get_mut();
            write!(
                stream,
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                served.len()
            )
            .unwrap();
            stream.write_all(&served).unwrap();
            Vec::new()
        });

        let address = DataAddress::new(HTTP_DATA_TYPE)
            .with_property(ENDPOINT, format!("http://127.0.0.1:{port}/files/blob.bin"));
        let mut source = HttpDataSourceFactory::default()
            .create_source(&address)
            .await
            .unwrap();
        let mut part = source.next_part().await.unwrap().unwrap();
        assert_eq!(part.name, "blob.bin");
        assert_eq!(part.size, Some(body.len() as u64));
        assert_eq!(part.read_all().await.unwrap(), body);
        assert!(source.next_part().await.unwrap().is_none());
        server.join().unwrap();
    }

    #[tokio::test]
    async fn truncated_response_is_a_read_error() {
        let (port, server) = serve_once(|reader, _head| {
            let stream = reader.get_mut();
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 1000\r\n\r\nonly ten b")
                .unwrap();
            Vec::new()
        });

        let address = DataAddress::new(HTTP_DATA_TYPE)
            .with_property(ENDPOINT, format!("http://127.0.0.1:{port}/short"));
        let mut source = HttpDataSourceFactory::default()
            .create_source(&address)
            .await
            .unwrap();
        let mut part = source.next_part().await.unwrap().unwrap();
        server.join().unwrap();
        assert!(part.read_all().await.is_err());
    }

    #[tokio::test]
    async fn sink_posts_each_part_under_its_name() {
        let (port, server) = serve_once(|reader, head| {
            let body = read_request_body(reader, &head);
            let stream = reader.get_mut();
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .unwrap();
            let mut record = head[0].clone().into_bytes();
            record.push(b'\n');
            record.extend_from_slice(&body);
            record
        });

        let address = DataAddress::new(HTTP_DATA_TYPE)
            .with_property(ENDPOINT, format!("http://127.0.0.1:{port}/in/"))
            .with_property(APPEND_PART_NAME, "true");
        let sink = HttpDataSinkFactory::default()
            .create_sink(&address)
            .await
            .unwrap();
        let body = pattern(200_000);
        let written = sink
            .write_part(DataPart::from_bytes("x.bin", body.clone()))
            .await
            .unwrap();
        assert_eq!(written, body.len() as u64);

        let record = server.join().unwrap();
        let split = record.iter().position(|b| *b == b'\n').unwrap();
        let request_line = String::from_utf8_lossy(&record[..split]);
        assert!(request_line.starts_with("POST /in/x.bin "), "{request_line}");
        assert_eq!(&record[split + 1..], &body[..]);
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_retryable() {
        let factory = HttpDataSourceFactory::default();
        let address =
            DataAddress::new(HTTP_DATA_TYPE).with_property(ENDPOINT, "http://127.0.0.1:1/none");
        let err = factory.create_source(&address).await.err().unwrap();
        assert_eq!(err.reason, FailureReason::GeneralError);
        assert!(err.retryable);
    }
}
