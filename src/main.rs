use std::sync::Arc;
use std::time::Duration;

use beacon::config::Config;
use beacon::http::request::Request;
use beacon::http::response::{Response, ResponseBuilder, StatusCode};
use beacon::server::{Engine, Router, Server, WorkerPool};
use beacon::sse::{SessionManager, SseEvent, open_event_stream};
use bytes::Bytes;

fn routes(sessions: Arc<SessionManager>, session_header: String) -> Router {
    Router::new()
        .route("/echo", |req: &Request| {
            ResponseBuilder::new(StatusCode::Ok)
                .header("Content-Type", "application/octet-stream")
                .body(req.body.clone())
                .build()
        })
        .route("/stream", |_: &Request| {
            let mut remaining = 5u32;
            Response::streaming(move || {
                if remaining == 0 {
                    return None;
                }
                remaining -= 1;
                Some(Bytes::from(format!("chunk {}\n", 5 - remaining)))
            })
        })
        .route("/events", move |req: &Request| {
            let (response, publisher) = match open_event_stream(req, &sessions, &session_header) {
                Ok(opened) => opened,
                Err(response) => return response,
            };

            std::thread::spawn(move || {
                for tick in 1..=10 {
                    let event = SseEvent::new(format!("tick {}", tick)).with_event("tick");
                    if publisher.publish(event).is_err() {
                        break;
                    }
                    std::thread::sleep(Duration::from_secs(1));
                }
            });

            response
        })
        .route("/", |_: &Request| {
            Response::ok("Hello from Beacon\n")
        })
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let cfg = Config::load()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .max_blocking_threads(cfg.server.workers.max(1))
        .thread_name("beacon-worker")
        .build()?;

    let sessions = Arc::new(SessionManager::new(&cfg.sessions));
    let router = routes(sessions.clone(), cfg.sessions.header_name.clone());
    let mut engine = Engine::new(cfg.clone(), router).with_sessions(sessions);
    if cfg.server.workers > 0 {
        engine = engine.with_worker_pool(WorkerPool::new(runtime.handle().clone()));
    }

    let server = Server::bind(engine)?;
    let handle = server.handle();

    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    let reactor = std::thread::Builder::new()
        .name("beacon-reactor".to_string())
        .spawn(move || {
            let _ = done_tx.send(server.run());
        })?;

    runtime.block_on(async {
        tokio::select! {
            res = done_rx => {
                match res {
                    Ok(result) => result?,
                    Err(_) => anyhow::bail!("reactor thread exited unexpectedly"),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
                handle.shutdown();
            }
        }
        Ok::<(), anyhow::Error>(())
    })?;

    reactor
        .join()
        .map_err(|_| anyhow::anyhow!("reactor thread panicked"))?;

    Ok(())
}
