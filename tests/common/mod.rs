#![allow(dead_code)]

use http::{Request, Response};
use std::convert::Infallible;
use std::future::Ready;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tollgate::PeerAddr;
use tower::util::ServiceFn;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::MakeWriter;

#[derive(Clone)]
struct SharedWriter(Arc<Mutex<Vec<u8>>>);

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedGuard;
    fn make_writer(&'a self) -> Self::Writer {
        SharedGuard(self.0.clone())
    }
}

struct SharedGuard(Arc<Mutex<Vec<u8>>>);
impl std::io::Write for SharedGuard {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut guard = self.0.lock().unwrap();
        guard.extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Captures `tracing` output on the current thread for as long as the guard lives.
pub struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
    _guard: tracing::subscriber::DefaultGuard,
}

impl LogCapture {
    pub fn install() -> Self {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::fmt()
            .with_writer(BoxMakeWriter::new(SharedWriter(buffer.clone())))
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .without_time()
            .finish();
        let guard = tracing::subscriber::set_default(subscriber);
        Self {
            buffer,
            _guard: guard,
        }
    }

    pub fn contents(&self) -> String {
        String::from_utf8(self.buffer.lock().unwrap().clone()).unwrap()
    }
}

pub type Reply = Ready<Result<Response<String>, Infallible>>;
pub type Handler = fn(Request<String>) -> Reply;

fn ok_handler(_req: Request<String>) -> Reply {
    std::future::ready(Ok(Response::new(String::from("ok"))))
}

/// Inner service that always answers 200 "ok".
pub fn ok_service() -> ServiceFn<Handler> {
    tower::service_fn(ok_handler as Handler)
}

/// Inner service answering 200 and counting how many times it ran.
pub fn counting_service(
    calls: Arc<AtomicUsize>,
) -> ServiceFn<impl Fn(Request<String>) -> Reply + Clone + Send + 'static> {
    tower::service_fn(move |_req: Request<String>| {
        calls.fetch_add(1, Ordering::SeqCst);
        std::future::ready(Ok::<_, Infallible>(Response::new(String::from("ok"))))
    })
}

/// Request whose transport peer is `ip`.
pub fn request_from(ip: &str) -> Request<String> {
    let mut req = Request::new(String::new());
    req.extensions_mut().insert(PeerAddr(format!("{ip}:40000").parse().unwrap()));
    req
}

/// Request from `peer` carrying `X-Forwarded-For: forwarded`.
pub fn forwarded_request(forwarded: &str, peer: &str) -> Request<String> {
    let mut req = request_from(peer);
    req.headers_mut().insert("x-forwarded-for", forwarded.parse().unwrap());
    req
}

pub fn body_json(res: &Response<String>) -> serde_json::Value {
    serde_json::from_str(res.body()).expect("429 body is JSON")
}
