//! Requests over a real socket through `Server` into a `Router`.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use switchyard::session::{LocalSessionStore, SessionHandler};
use switchyard::{HttpError, Router, Server, StatusCode};

async fn start(router: Router) -> SocketAddr {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("switchyard=debug")
        .with_test_writer()
        .try_init();
    let server = Server::bind("127.0.0.1:0").await.expect("bind");
    let addr = server.local_addr();
    tokio::spawn(server.serve(router));
    addr
}

async fn send(addr: SocketAddr, raw: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    stream.write_all(raw.as_bytes()).await.expect("write");
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.expect("read");
    String::from_utf8_lossy(&out).into_owned()
}

fn get(path: &str) -> String {
    format!("GET {path} HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n")
}

fn body(response: &str) -> &str {
    response.split_once("\r\n\r\n").map_or("", |(_, b)| b)
}

#[tokio::test]
async fn handlers_run_in_registration_order() {
    let router = Router::new();
    let log = Arc::new(Mutex::new(Vec::new()));

    let l = Arc::clone(&log);
    router.get("/a").sync_handler(move |ctx| {
        l.lock().unwrap().push("H1");
        ctx.put("greeting", String::from("from H1"));
        ctx.next();
        Ok(())
    });
    let l = Arc::clone(&log);
    router.get("/a").sync_handler(move |ctx| {
        l.lock().unwrap().push("H2");
        let greeting = ctx.get::<String>("greeting").cloned().unwrap_or_default();
        ctx.response_mut().set_body(greeting);
        ctx.end();
        Ok(())
    });

    let addr = start(router).await;
    let response = send(addr, &get("/a")).await;

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
    assert_eq!(body(&response), "from H1");
    assert_eq!(*log.lock().unwrap(), vec!["H1", "H2"]);

    // Same path, different method: neither handler runs.
    let response = send(
        addr,
        "POST /a HTTP/1.1\r\nHost: test\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"), "{response}");
    assert_eq!(*log.lock().unwrap(), vec!["H1", "H2"]);
}

#[tokio::test]
async fn mounted_router_sees_relative_path() {
    let api = Router::new();
    api.get("/users/:id").sync_handler(|ctx| {
        let text = format!(
            "{} {} {}",
            ctx.mount_point().unwrap_or("-"),
            ctx.normalised_path(),
            ctx.path_param("id").unwrap_or("-"),
        );
        ctx.response_mut().set_body(text);
        ctx.end();
        Ok(())
    });

    let router = Router::new();
    router.mount_sub_router("/api", api).expect("mount");

    let addr = start(router).await;
    let response = send(addr, &get("/api/users/7")).await;
    assert_eq!(body(&response), "/api /users/7 7");

    let response = send(addr, &get("/apiary")).await;
    assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"), "{response}");
}

#[tokio::test]
async fn failure_handler_renders_the_error() {
    let router = Router::new();
    router.get("/orders").sync_handler(|_| {
        Err(anyhow::Error::new(HttpError::new(409, "stale version")))
    });
    router.route().sync_failure_handler(|ctx| {
        let status = ctx.status_code().unwrap_or(500);
        ctx.response_mut().set_status(status);
        ctx.end_json(&serde_json::json!({ "status": status }))?;
        Ok(())
    });

    let addr = start(router).await;
    let response = send(addr, &get("/orders")).await;
    assert!(response.starts_with("HTTP/1.1 409 Conflict\r\n"), "{response}");
    assert!(response.contains("Content-Type: application/json"));
    assert_eq!(body(&response), r#"{"status":409}"#);
}

#[tokio::test]
async fn keep_alive_serves_pipelined_requests() {
    let router = Router::new();
    router.route_at("/").sync_handler(|ctx| {
        let path = ctx.request().path().to_owned();
        ctx.response_mut().set_body(path);
        ctx.end();
        Ok(())
    });

    let addr = start(router).await;
    let raw = "GET /one HTTP/1.1\r\nHost: test\r\n\r\n\
               POST /two HTTP/1.1\r\nHost: test\r\nContent-Length: 3\r\nConnection: close\r\n\r\nabc";
    let response = send(addr, raw).await;
    assert_eq!(response.matches("HTTP/1.1 200 OK").count(), 2, "{response}");
    assert!(response.contains("Connection: keep-alive"));
    assert!(response.ends_with("/two"));
}

#[tokio::test]
async fn session_cookie_round_trips_over_the_wire() {
    let router = Router::new();
    router
        .route()
        .handled_by(SessionHandler::new(LocalSessionStore::new()));
    router.get("/visits").sync_handler(|ctx| {
        let Some(session) = ctx.session().cloned() else {
            ctx.fail(StatusCode::INTERNAL_SERVER_ERROR);
            return Ok(());
        };
        let visits = session.get_as::<u64>("visits").unwrap_or(0) + 1;
        session.put("visits", visits);
        ctx.response_mut().set_body(visits.to_string());
        ctx.end();
        Ok(())
    });

    let addr = start(router).await;
    let first = send(addr, &get("/visits")).await;
    assert_eq!(body(&first), "1");
    let cookie = first
        .lines()
        .find_map(|l| l.strip_prefix("Set-Cookie: "))
        .and_then(|c| c.split(';').next())
        .expect("session cookie")
        .to_owned();

    let mut second = String::new();
    for _ in 0..50 {
        second = send(
            addr,
            &format!("GET /visits HTTP/1.1\r\nHost: test\r\nCookie: {cookie}\r\nConnection: close\r\n\r\n"),
        )
        .await;
        if body(&second) == "2" {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(body(&second), "2");
}
