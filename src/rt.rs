//! Tokio driver.
//!
//! Reads one request head per connection, then feeds the [`Session`] with wake, writable,
//! and timer events until it finishes.
use std::io::{self, IoSlice};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::Poll;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Instant, sleep_until};

use crate::buf::File;
use crate::error::Error;
use crate::log::{debug, trace, warning};
use crate::request::Request;
use crate::response::StatusCode;
use crate::session::{Engine, Session};
use crate::transport::Transport;

const MAX_HEAD: usize = 8 * 1024;
const MAX_HEADERS: usize = 64;
const FILE_CHUNK: usize = 64 * 1024;

// ===== Runtime =====

/// Accept connections forever, each one on its own task.
pub async fn serve(listener: TcpListener, engine: Arc<Engine>) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(ok) => ok,
            Err(err) => {
                warning!("failed to accept peer: {err}");
                continue;
            }
        };
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            if let Err(err) = drive(stream, engine).await {
                debug!("{addr}: {err}");
            }
        });
    }
}

/// Serve a single request on `stream`.
pub async fn drive(mut stream: TcpStream, engine: Arc<Engine>) -> io::Result<()> {
    let head = read_head(&mut stream).await?;

    let stream = Arc::new(stream);
    let deadline = Arc::new(Mutex::new(None));
    let transport = TcpTransport { stream: Arc::clone(&stream), deadline: Arc::clone(&deadline) };

    let start = Instant::now();
    let mut session = match head {
        Ok(target) => Session::new(engine, transport, &target),
        Err(status) => {
            let reject = move |_: &mut Request<'_>| -> Poll<Result<StatusCode, Error>> { Poll::Ready(Ok(status)) };
            Session::with_handler(engine, transport, "/", Box::new(reject))
        }
    };
    session.run();

    while !session.is_finished() && !session.is_errored() {
        let timer = *deadline.lock().unwrap_or_else(PoisonError::into_inner);
        let wants_write = session.wants_write();

        tokio::select! {
            _ = session.woken() => {
                session.set_elapsed(start.elapsed());
                session.run();
            }
            result = stream.writable(), if wants_write => {
                result?;
                session.set_elapsed(start.elapsed());
                session.on_writable();
            }
            _ = sleep_until(timer.unwrap_or(start)), if timer.is_some() => {
                *deadline.lock().unwrap_or_else(PoisonError::into_inner) = None;
                session.set_elapsed(start.elapsed());
                session.on_timer();
            }
        }
    }

    session.close();
    Ok(())
}

/// Read the request head, returns the request target or the status to reject it with.
async fn read_head(stream: &mut TcpStream) -> io::Result<Result<String, StatusCode>> {
    let mut buf = BytesMut::with_capacity(1024);

    loop {
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        let status = match req.parse(&buf) {
            Ok(httparse::Status::Complete(_)) => {
                trace!("{:?} {:?}", req.method, req.path);
                return Ok(match (req.method, req.path) {
                    (Some("GET"), Some(path)) => Ok(path.to_owned()),
                    (Some(_), Some(_)) => Err(StatusCode::METHOD_NOT_ALLOWED),
                    _ => Err(StatusCode::BAD_REQUEST),
                });
            }
            Ok(httparse::Status::Partial) if buf.len() < MAX_HEAD => continue,
            Ok(httparse::Status::Partial) | Err(httparse::Error::TooManyHeaders) => {
                StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE
            }
            Err(err) => {
                debug!("invalid request head: {err}");
                StatusCode::BAD_REQUEST
            }
        };
        return Ok(Err(status));
    }
}

// ===== Transport =====

/// Non blocking TCP transport, the driver waits for readiness.
#[derive(Debug)]
struct TcpTransport {
    stream: Arc<TcpStream>,
    deadline: Arc<Mutex<Option<Instant>>>,
}

impl Transport for TcpTransport {
    fn send(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        self.stream.try_write_vectored(bufs)
    }

    fn send_file(&mut self, file: &File, offset: u64, len: u64) -> io::Result<usize> {
        let mut staging = vec![0; len.min(FILE_CHUNK as u64) as usize];
        let n = file.read_at(&mut staging, offset)?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        self.stream.try_write(&staging[..n])
    }

    fn add_timer(&mut self, after: Duration) {
        *self.deadline.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now() + after);
    }

    fn del_timer(&mut self) {
        *self.deadline.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}
