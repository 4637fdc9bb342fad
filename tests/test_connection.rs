use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use beacon::config::{Config, SessionConfig};
use beacon::http::connection::{Connection, ConnectionState, Context, Interest, Transport};
use beacon::http::request::Request;
use beacon::http::response::{Response, ResponseBuilder, StatusCode};
use beacon::http::writer::CONTINUE_RESPONSE;
use beacon::server::{Engine, Router};
use beacon::sse::{EventPublisher, SessionManager, SseEvent, open_event_stream};
use bytes::Bytes;

/// In-memory socket: reads drain queued input, writes accumulate.
#[derive(Default)]
struct MockStream {
    input: VecDeque<Vec<u8>>,
    eof: bool,
    output: Vec<u8>,
    write_budget: Option<usize>,
    write_shut: bool,
}

impl Read for MockStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(mut chunk) = self.input.pop_front() else {
            if self.eof {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        };
        let n = buf.len().min(chunk.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
            self.input.push_front(chunk.split_off(n));
        }
        Ok(n)
    }
}

impl Write for MockStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = match self.write_budget.as_mut() {
            Some(0) => return Err(io::ErrorKind::WouldBlock.into()),
            Some(budget) => {
                let n = (*budget).min(buf.len());
                *budget -= n;
                n
            }
            None => buf.len(),
        };
        self.output.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for MockStream {
    fn shutdown_write(&mut self) -> io::Result<()> {
        self.write_shut = true;
        Ok(())
    }
}

fn echo_router() -> Router {
    Router::new()
        .route("/echo", |req: &Request| {
            ResponseBuilder::new(StatusCode::Ok)
                .body(req.body.clone())
                .build()
        })
        .route("/stream", |_: &Request| {
            let mut parts = vec![Bytes::from_static(b"BB"), Bytes::from_static(b"A")];
            Response::streaming(move || parts.pop())
        })
}

fn engine(router: Router) -> Arc<Engine> {
    Arc::new(Engine::new(Config::default(), router))
}

fn connection() -> Connection<MockStream> {
    Connection::new(MockStream::default(), None)
}

fn feed(conn: &mut Connection<MockStream>, ctx: &Context<'_>, bytes: &[u8]) {
    conn.stream_mut().input.push_back(bytes.to_vec());
    conn.on_readable(ctx).unwrap();
}

fn output(conn: &Connection<MockStream>) -> String {
    String::from_utf8_lossy(&conn.stream().output).into_owned()
}

fn take_output(conn: &mut Connection<MockStream>) -> String {
    let out = std::mem::take(&mut conn.stream_mut().output);
    String::from_utf8_lossy(&out).into_owned()
}

#[test]
fn test_unregistered_route_is_404() {
    let engine = engine(echo_router());
    let ctx = Context::inline(&engine);
    let mut conn = connection();

    feed(&mut conn, &ctx, b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n");

    let out = output(&conn);
    assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert!(out.contains("Connection: keep-alive\r\n"));
    assert!(out.contains("Host: x\r\n"));
    assert!(out.contains("Date: "));
    assert!(out.ends_with("404 Not Found"));
    assert_eq!(conn.state(), ConnectionState::Idle);
    assert_eq!(conn.interest(), Interest::Read);
}

#[test]
fn test_partial_body_suspends_until_complete() {
    let engine = engine(echo_router());
    let ctx = Context::inline(&engine);
    let mut conn = connection();

    feed(
        &mut conn,
        &ctx,
        b"POST /echo HTTP/1.1\r\nContent-Length: 5\r\n\r\nabc",
    );
    assert!(output(&conn).is_empty());
    assert_eq!(conn.state(), ConnectionState::ReceivingBody);

    feed(&mut conn, &ctx, b"de");
    let out = output(&conn);
    assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(out.contains("Content-Length: 5\r\n"));
    assert!(out.ends_with("\r\n\r\nabcde"));
}

#[test]
fn test_headers_split_across_reads() {
    let engine = engine(echo_router());
    let ctx = Context::inline(&engine);
    let mut conn = connection();

    feed(&mut conn, &ctx, b"GET /echo HT");
    assert_eq!(conn.state(), ConnectionState::ReceivingHeaders);
    feed(&mut conn, &ctx, b"TP/1.1\r\n\r\n");

    assert!(output(&conn).starts_with("HTTP/1.1 200 OK\r\n"));
}

#[test]
fn test_expect_100_continue() {
    let engine = engine(echo_router());
    let ctx = Context::inline(&engine);
    let mut conn = connection();

    feed(
        &mut conn,
        &ctx,
        b"POST /echo HTTP/1.1\r\nContent-Length: 4\r\nExpect: 100-continue\r\n\r\n",
    );
    assert_eq!(conn.stream().output, CONTINUE_RESPONSE);
    assert_eq!(conn.state(), ConnectionState::ReceivingBody);

    feed(&mut conn, &ctx, b"ping");
    let out = output(&conn);
    assert!(out.starts_with("HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\n"));
    assert!(out.ends_with("ping"));
}

#[test]
fn test_unknown_expectation_is_417() {
    let engine = engine(echo_router());
    let ctx = Context::inline(&engine);
    let mut conn = connection();

    feed(
        &mut conn,
        &ctx,
        b"POST /echo HTTP/1.1\r\nContent-Length: 4\r\nExpect: something-else\r\n\r\n",
    );

    let out = output(&conn);
    assert!(out.starts_with("HTTP/1.1 417 Expectation Failed\r\n"));
    assert!(out.contains("Connection: close\r\n"));
    assert_eq!(conn.state(), ConnectionState::Closing);
    assert!(conn.stream().write_shut);
}

#[test]
fn test_oversized_header_block_is_431() {
    let engine = engine(echo_router());
    let ctx = Context::inline(&engine);
    let mut conn = connection();

    let mut req = b"GET / HTTP/1.1\r\nX-Filler: ".to_vec();
    req.extend(std::iter::repeat_n(b'a', 9000));
    req.extend_from_slice(b"\r\n\r\n");
    feed(&mut conn, &ctx, &req);

    assert!(output(&conn).starts_with("HTTP/1.1 431 Request Header Fields Too Large\r\n"));
    assert_eq!(conn.state(), ConnectionState::Closing);
    assert_eq!(conn.interest(), Interest::Close);
}

#[test]
fn test_oversized_body_is_413() {
    let engine = engine(echo_router());
    let ctx = Context::inline(&engine);
    let mut conn = connection();

    feed(
        &mut conn,
        &ctx,
        b"POST /echo HTTP/1.1\r\nContent-Length: 3000000\r\n\r\n",
    );

    assert!(output(&conn).starts_with("HTTP/1.1 413 Payload Too Large\r\n"));
    assert_eq!(conn.state(), ConnectionState::Closing);
}

#[test]
fn test_malformed_request_is_400() {
    let engine = engine(echo_router());
    let ctx = Context::inline(&engine);
    let mut conn = connection();

    feed(&mut conn, &ctx, b"BROKEN\r\n\r\n");

    let out = output(&conn);
    assert!(out.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert!(out.ends_with("400 Bad Request"));
    assert_eq!(conn.state(), ConnectionState::Closing);
}

#[test]
fn test_keep_alive_serves_buffered_second_request() {
    let engine = engine(echo_router());
    let ctx = Context::inline(&engine);
    let mut conn = connection();

    feed(
        &mut conn,
        &ctx,
        b"POST /echo HTTP/1.1\r\nContent-Length: 3\r\n\r\none\r\nPOST /echo HTTP/1.1\r\nContent-Length: 3\r\n\r\ntwo",
    );

    let out = output(&conn);
    assert_eq!(out.matches("HTTP/1.1 200 OK\r\n").count(), 2);
    assert!(out.contains("\r\n\r\none"));
    assert!(out.ends_with("\r\n\r\ntwo"));
    assert_eq!(conn.state(), ConnectionState::Idle);
    assert_eq!(conn.buffered(), 0);
}

#[test]
fn test_http10_closes_after_response() {
    let engine = engine(echo_router());
    let ctx = Context::inline(&engine);
    let mut conn = connection();

    feed(&mut conn, &ctx, b"GET /echo HTTP/1.0\r\n\r\n");

    assert!(output(&conn).contains("Connection: close\r\n"));
    assert!(!conn.keep_alive());
    assert_eq!(conn.state(), ConnectionState::Closing);
    assert!(conn.stream().write_shut);
}

#[test]
fn test_peer_close_while_idle() {
    let engine = engine(echo_router());
    let ctx = Context::inline(&engine);
    let mut conn = connection();

    conn.stream_mut().eof = true;
    conn.on_readable(&ctx).unwrap();

    assert_eq!(conn.state(), ConnectionState::Closing);
}

#[test]
fn test_head_sends_headers_only() {
    let router = Router::new().route("/", |_: &Request| Response::ok("hello"));
    let engine = engine(router);
    let ctx = Context::inline(&engine);
    let mut conn = connection();

    feed(&mut conn, &ctx, b"HEAD / HTTP/1.1\r\n\r\n");

    let out = output(&conn);
    assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(out.contains("Content-Length: 5\r\n"));
    assert!(out.ends_with("\r\n\r\n"));
    assert!(!out.contains("hello"));
}

#[test]
fn test_options_without_cors_is_405() {
    let engine = engine(echo_router());
    let ctx = Context::inline(&engine);
    let mut conn = connection();

    feed(&mut conn, &ctx, b"OPTIONS /echo HTTP/1.1\r\n\r\n");

    let out = output(&conn);
    assert!(out.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));
    assert!(!out.contains("Access-Control-Allow-Origin"));
}

#[test]
fn test_options_with_cors_is_204() {
    let mut config = Config::default();
    config.cors.enabled = true;
    let engine = Arc::new(Engine::new(config, echo_router()));
    let ctx = Context::inline(&engine);
    let mut conn = connection();

    feed(&mut conn, &ctx, b"OPTIONS /echo HTTP/1.1\r\n\r\n");

    let out = output(&conn);
    assert!(out.starts_with("HTTP/1.1 204 No Content\r\n"));
    assert!(out.contains("Access-Control-Allow-Origin: *\r\n"));
    assert!(out.contains("Access-Control-Max-Age: 86400\r\n"));
    assert!(out.contains("Access-Control-Expose-Headers: Mcp-Session-Id\r\n"));
    assert!(!out.contains("Content-Length"));
}

#[test]
fn test_delete_terminates_session() {
    let engine = engine(echo_router());
    let ctx = Context::inline(&engine);
    let mut conn = connection();
    let id = engine.sessions().create_session().unwrap();

    let req = format!("DELETE /mcp HTTP/1.1\r\nMcp-Session-Id: {id}\r\n\r\n");
    feed(&mut conn, &ctx, req.as_bytes());
    assert!(take_output(&mut conn).starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(engine.sessions().session_count(), 0);

    feed(&mut conn, &ctx, req.as_bytes());
    assert!(take_output(&mut conn).starts_with("HTTP/1.1 404 Not Found\r\n"));
}

#[test]
fn test_streaming_response_is_chunked() {
    let engine = engine(echo_router());
    let ctx = Context::inline(&engine);
    let mut conn = connection();

    feed(&mut conn, &ctx, b"GET /stream HTTP/1.1\r\n\r\n");
    while conn.state() == ConnectionState::StreamingChunked {
        conn.on_writable(&ctx).unwrap();
    }

    let out = output(&conn);
    assert!(out.contains("Transfer-Encoding: chunked\r\n"));
    assert!(!out.contains("Content-Length"));
    assert!(out.ends_with("\r\n\r\n1\r\nA\r\n2\r\nBB\r\n0\r\n\r\n"));
    assert_eq!(conn.chunks_sent(), 2);
    assert_eq!(conn.state(), ConnectionState::Idle);
}

#[test]
fn test_stream_completion_callback_runs_once() {
    let done = Arc::new(AtomicBool::new(false));
    let flag = done.clone();
    let router = Router::new().route("/", move |_: &Request| {
        let flag = flag.clone();
        let mut sent = false;
        ResponseBuilder::new(StatusCode::Ok)
            .stream(move || {
                if sent {
                    return None;
                }
                sent = true;
                Some(Bytes::from_static(b"only"))
            })
            .on_complete(move || flag.store(true, Ordering::SeqCst))
            .build()
    });
    let engine = engine(router);
    let ctx = Context::inline(&engine);
    let mut conn = connection();

    feed(&mut conn, &ctx, b"GET / HTTP/1.1\r\n\r\n");
    assert!(!done.load(Ordering::SeqCst));
    while conn.state() == ConnectionState::StreamingChunked {
        conn.on_writable(&ctx).unwrap();
    }

    assert!(done.load(Ordering::SeqCst));
    assert!(output(&conn).ends_with("4\r\nonly\r\n0\r\n\r\n"));
}

#[test]
fn test_partial_writes_resume_on_writable() {
    let engine = engine(echo_router());
    let ctx = Context::inline(&engine);
    let mut conn = connection();
    conn.stream_mut().write_budget = Some(10);

    feed(&mut conn, &ctx, b"POST /echo HTTP/1.1\r\nContent-Length: 4\r\n\r\nbody");
    assert_eq!(conn.stream().output.len(), 10);
    assert_eq!(conn.state(), ConnectionState::SendingHeaders);
    assert_eq!(conn.interest(), Interest::ReadWrite);

    conn.stream_mut().write_budget = Some(5);
    conn.on_writable(&ctx).unwrap();
    assert_eq!(conn.stream().output.len(), 15);

    conn.stream_mut().write_budget = None;
    conn.on_writable(&ctx).unwrap();

    let out = output(&conn);
    assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(out.ends_with("\r\n\r\nbody"));
    assert_eq!(conn.state(), ConnectionState::Idle);
}

fn sse_engine(slot: Arc<Mutex<Option<EventPublisher>>>) -> Arc<Engine> {
    let sessions = Arc::new(SessionManager::new(&SessionConfig::default()));
    let shared = sessions.clone();
    let router = Router::new().route("/events", move |req: &Request| {
        match open_event_stream(req, &sessions, "Mcp-Session-Id") {
            Ok((response, publisher)) => {
                *slot.lock().unwrap() = Some(publisher);
                response
            }
            Err(response) => response,
        }
    });
    Arc::new(Engine::new(Config::default(), router).with_sessions(shared))
}

#[test]
fn test_event_stream_parks_and_wakes() {
    let slot = Arc::new(Mutex::new(None));
    let engine = sse_engine(slot.clone());
    let ctx = Context::inline(&engine);
    let mut conn = connection();

    feed(&mut conn, &ctx, b"GET /events HTTP/1.1\r\n\r\n");
    let head = take_output(&mut conn);
    assert!(head.contains("Content-Type: text/event-stream\r\n"));
    assert!(head.contains("Cache-Control: no-cache\r\n"));
    assert!(head.contains("Mcp-Session-Id: "));
    assert_eq!(conn.state(), ConnectionState::StreamingChunked);
    assert_eq!(conn.interest(), Interest::Read);

    let publisher = slot.lock().unwrap().take().unwrap();
    assert_eq!(publisher.publish(SseEvent::new("hi")).unwrap(), "1");
    conn.wake_stream(&ctx).unwrap();

    let wire = "id: 1\nevent: message\ndata: hi\n\n";
    assert_eq!(take_output(&mut conn), format!("{:x}\r\n{}\r\n", wire.len(), wire));

    drop(publisher);
    conn.wake_stream(&ctx).unwrap();
    while conn.state() == ConnectionState::StreamingChunked {
        conn.wake_stream(&ctx).unwrap();
    }
    assert_eq!(take_output(&mut conn), "0\r\n\r\n");
    assert_eq!(conn.state(), ConnectionState::Idle);
}

#[test]
fn test_event_stream_replays_after_last_event_id() {
    let slot = Arc::new(Mutex::new(None));
    let engine = sse_engine(slot.clone());
    let ctx = Context::inline(&engine);

    let mut first = connection();
    feed(&mut first, &ctx, b"GET /events HTTP/1.1\r\n\r\n");
    let publisher = slot.lock().unwrap().take().unwrap();
    let session = publisher.session_id().to_string();
    for n in 1..=3 {
        publisher.publish(SseEvent::new(format!("event {n}"))).unwrap();
    }
    drop(publisher);
    first.abort();

    let mut second = connection();
    let req = format!(
        "GET /events HTTP/1.1\r\nMcp-Session-Id: {session}\r\nLast-Event-Id: 1\r\n\r\n"
    );
    feed(&mut second, &ctx, req.as_bytes());
    let publisher = slot.lock().unwrap().take().unwrap();
    assert_eq!(publisher.session_id(), session);
    while second.state() == ConnectionState::StreamingChunked && second.chunks_sent() < 2 {
        second.on_writable(&ctx).unwrap();
    }

    let out = output(&second);
    assert!(!out.contains("data: event 1\n"));
    assert!(out.contains("id: 2\nevent: message\ndata: event 2\n\n"));
    assert!(out.contains("id: 3\nevent: message\ndata: event 3\n\n"));

    // ids continue after the replayed ones
    assert_eq!(publisher.publish(SseEvent::new("later")).unwrap(), "4");
}

#[test]
fn test_event_stream_unknown_session_is_404() {
    let slot = Arc::new(Mutex::new(None));
    let engine = sse_engine(slot.clone());
    let ctx = Context::inline(&engine);
    let mut conn = connection();

    feed(
        &mut conn,
        &ctx,
        b"GET /events HTTP/1.1\r\nMcp-Session-Id: missing\r\n\r\n",
    );

    assert!(output(&conn).starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert!(slot.lock().unwrap().is_none());
}

#[test]
fn test_peer_close_mid_stream_aborts() {
    let slot = Arc::new(Mutex::new(None));
    let engine = sse_engine(slot.clone());
    let ctx = Context::inline(&engine);
    let mut conn = connection();

    feed(&mut conn, &ctx, b"GET /events HTTP/1.1\r\n\r\n");
    assert_eq!(conn.state(), ConnectionState::StreamingChunked);

    conn.stream_mut().eof = true;
    conn.on_readable(&ctx).unwrap();

    assert_eq!(conn.state(), ConnectionState::Closing);
    let publisher = slot.lock().unwrap().take().unwrap();
    drop(conn);
    assert!(publisher.publish(SseEvent::new("late")).is_err());
}

#[test]
fn test_idle_expiry() {
    let engine = engine(echo_router());
    let ctx = Context::inline(&engine);
    let mut conn = connection();
    let later = Instant::now() + Duration::from_secs(5);

    assert!(conn.is_idle_expired(later, Duration::from_secs(1)));
    assert!(!conn.is_idle_expired(later, Duration::from_secs(60)));

    feed(&mut conn, &ctx, b"GET /stream HTTP/1.1\r\n\r\n");
    assert_eq!(conn.state(), ConnectionState::StreamingChunked);
    assert!(!conn.is_idle_expired(later, Duration::from_secs(1)));
}

#[test]
fn test_half_closed_peer_still_gets_response() {
    let engine = engine(echo_router());
    let ctx = Context::inline(&engine);
    let mut conn = connection();

    conn.stream_mut().eof = true;
    feed(&mut conn, &ctx, b"POST /echo HTTP/1.1\r\nContent-Length: 2\r\n\r\nok");

    let out = output(&conn);
    assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(out.ends_with("\r\n\r\nok"));
    assert_eq!(conn.state(), ConnectionState::Closing);
    assert!(conn.stream().write_shut);
}

#[test]
fn test_resume_outside_async_processing_is_ignored() {
    let engine = engine(echo_router());
    let ctx = Context::inline(&engine);
    let mut conn = connection();

    conn.resume(&ctx, Response::ok("late")).unwrap();
    assert!(output(&conn).is_empty());
    assert_eq!(conn.state(), ConnectionState::Idle);

    feed(&mut conn, &ctx, b"POST /echo HTTP/1.1\r\nContent-Length: 3\r\n\r\nab");
    conn.resume(&ctx, Response::ok("late")).unwrap();
    assert!(output(&conn).is_empty());
    assert_eq!(conn.state(), ConnectionState::ReceivingBody);

    conn.abort();
    conn.resume(&ctx, Response::ok("late")).unwrap();
    assert!(output(&conn).is_empty());
    assert_eq!(conn.state(), ConnectionState::Closing);
}

#[test]
fn test_head_on_stream_runs_completion_callback() {
    let done = Arc::new(AtomicBool::new(false));
    let flag = done.clone();
    let router = Router::new().route("/", move |_: &Request| {
        let flag = flag.clone();
        ResponseBuilder::new(StatusCode::Ok)
            .stream(|| Some(Bytes::from_static(b"never sent")))
            .on_complete(move || flag.store(true, Ordering::SeqCst))
            .build()
    });
    let engine = engine(router);
    let ctx = Context::inline(&engine);
    let mut conn = connection();

    feed(&mut conn, &ctx, b"HEAD / HTTP/1.1\r\n\r\n");

    let out = output(&conn);
    assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(out.contains("Transfer-Encoding: chunked\r\n"));
    assert!(out.ends_with("\r\n\r\n"));
    assert!(!out.contains("never sent"));
    assert!(done.load(Ordering::SeqCst));
    assert_eq!(conn.state(), ConnectionState::Idle);
}
