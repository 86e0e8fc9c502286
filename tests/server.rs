use bytes::{Bytes, BytesMut};
use rand::Rng;
use socket2::SockRef;
use spindle::*;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::{Duration, Instant};

const HELLO: &[u8] =
    b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 13\r\n\r\nHello, world\n";

fn hello(_: &Request) -> anyhow::Result<Response> {
    Ok(Response::new(StatusCode::Ok)
        .with_header("Content-Type", "text/plain")
        .with_body("Hello, world\n"))
}

fn start_server(reactors: usize, setup: impl FnOnce(&mut HttpServer)) -> HttpServer {
    let config = ServerConfig::default()
        .with_reactors(reactors)
        .with_poll_timeout(Duration::from_millis(50));
    let mut server = HttpServer::with_config("127.0.0.1", 0, config).expect("Failed to bind");
    server.register("/", Method::Get, hello).unwrap();
    server.register("/", Method::Head, hello).unwrap();
    setup(&mut server);
    server.run().expect("Failed to start server");
    server
}

fn get_client(server: &HttpServer) -> TcpStream {
    let stream = TcpStream::connect(server.local_addr()).expect("Failed to connect");
    stream.set_read_timeout(Some(Duration::from_secs(10))).expect("Failed to set read timeout");
    stream.set_write_timeout(Some(Duration::from_secs(10))).expect("Failed to set write timeout");
    stream
}

// Read exactly one response, using the codec to find its end
fn read_response(stream: &mut TcpStream) -> Response {
    let mut buf = BytesMut::new();
    let mut chunk = [0u8; 8192];
    loop {
        if let Some((used, resp)) = parse_response(&buf).expect("Invalid response") {
            assert_eq!(used, buf.len(), "unexpected trailing bytes");
            return resp;
        }
        let n = stream.read(&mut chunk).expect("Failed to read response");
        assert!(n > 0, "server closed the connection mid-response");
        buf.extend_from_slice(&chunk[..n]);
    }
}

// Read a response head only (up to and including the blank line)
fn read_head(stream: &mut TcpStream) -> Vec<u8> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).expect("Failed to read head");
        head.push(byte[0]);
    }
    head
}

fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn hello_world_exact_bytes_and_keep_alive() {
    let mut server = start_server(2, |_| {});
    let mut stream = get_client(&server);

    for _ in 0..3 {
        stream
            .write_all(b"GET / HTTP/1.1\r\nConnection: Keep-Alive\r\n\r\n")
            .unwrap();
        let mut got = vec![0u8; HELLO.len()];
        stream.read_exact(&mut got).unwrap();
        assert_eq!(got, HELLO);
    }

    server.stop().unwrap();
}

#[test]
fn unknown_path_and_method() {
    let mut server = start_server(1, |_| {});
    let mut stream = get_client(&server);

    for method in ["GET", "POST", "DELETE"] {
        stream
            .write_all(format!("{} /nope HTTP/1.1\r\n\r\n", method).as_bytes())
            .unwrap();
        let resp = read_response(&mut stream);
        assert_eq!(resp.status(), StatusCode::NotFound);
        assert!(resp.body().is_empty());
    }

    stream.write_all(b"PUT / HTTP/1.1\r\n\r\n").unwrap();
    assert_eq!(read_head(&mut stream), b"HTTP/1.1 405 Method Not Allowed\r\n\r\n");

    server.stop().unwrap();
}

#[test]
fn head_sends_no_body_but_keeps_content_length() {
    let mut server = start_server(1, |_| {});
    let mut stream = get_client(&server);

    stream.write_all(b"HEAD / HTTP/1.1\r\n\r\n").unwrap();
    let head = read_head(&mut stream);
    assert_eq!(
        head,
        b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 13\r\n\r\n"
    );

    // If the HEAD response had leaked a body, it would precede this one.
    stream.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
    let mut got = vec![0u8; HELLO.len()];
    stream.read_exact(&mut got).unwrap();
    assert_eq!(got, HELLO);

    server.stop().unwrap();
}

#[test]
fn protocol_errors_answered_without_closing() {
    let mut server = start_server(1, |_| {});
    let mut stream = get_client(&server);

    stream.write_all(b"XYZ\r\n\r\n").unwrap();
    let resp = read_response(&mut stream);
    assert_eq!(resp.status(), StatusCode::BadRequest);
    assert!(!resp.body().is_empty());

    stream.write_all(b"GET / HTTP/3.0\r\n\r\n").unwrap();
    let resp = read_response(&mut stream);
    assert_eq!(resp.status(), StatusCode::HttpVersionNotSupported);

    // same socket still serves
    stream.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
    assert_eq!(read_response(&mut stream).status(), StatusCode::Ok);

    server.stop().unwrap();
}

#[test]
fn handler_error_becomes_500() {
    let mut server = start_server(1, |s| {
        s.register("/fail", Method::Get, |_| Err(anyhow::anyhow!("database unavailable")))
            .unwrap();
    });
    let mut stream = get_client(&server);

    stream.write_all(b"GET /fail HTTP/1.1\r\n\r\n").unwrap();
    let resp = read_response(&mut stream);
    assert_eq!(resp.status(), StatusCode::InternalServerError);
    assert!(String::from_utf8_lossy(resp.body()).contains("database unavailable"));

    server.stop().unwrap();
}

#[test]
fn request_body_reassembled_across_writes() {
    let mut server = start_server(1, |s| {
        s.register("/echo", Method::Post, |req| {
            Ok(Response::new(StatusCode::Ok).with_body(Bytes::copy_from_slice(req.body())))
        })
        .unwrap();
    });
    let mut stream = get_client(&server);

    let body = vec![b'q'; 64 * 1024];
    let head = format!("POST /echo HTTP/1.1\r\nContent-Length: {}\r\n\r\n", body.len());
    stream.write_all(head.as_bytes()).unwrap();
    for part in body.chunks(10_000) {
        stream.write_all(part).unwrap();
        std::thread::sleep(Duration::from_millis(5));
    }

    let resp = read_response(&mut stream);
    assert_eq!(resp.status(), StatusCode::Ok);
    assert_eq!(resp.body(), body.as_slice());

    server.stop().unwrap();
}

#[test]
fn large_response_written_across_many_events() {
    let size = 8 * 1024 * 1024;
    let mut payload = vec![0u8; size];
    rand::thread_rng().fill(&mut payload[..]);
    let payload = Bytes::from(payload);
    let served = payload.clone();

    let mut server = start_server(1, move |s| {
        s.register("/big", Method::Get, move |_| {
            Ok(Response::new(StatusCode::Ok).with_body(served.clone()))
        })
        .unwrap();
    });
    let mut stream = get_client(&server);

    stream.write_all(b"GET /big HTTP/1.1\r\n\r\n").unwrap();
    let head = String::from_utf8(read_head(&mut stream)).unwrap();
    assert!(head.contains(&format!("Content-Length: {}\r\n", size)));

    let mut received = vec![0u8; size];
    stream.read_exact(&mut received).unwrap();
    assert_eq!(received, &payload[..]);

    // connection went back to reading
    stream.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
    let mut got = vec![0u8; HELLO.len()];
    stream.read_exact(&mut got).unwrap();
    assert_eq!(got, HELLO);

    server.stop().unwrap();
}

// Drop the socket with SO_LINGER 0 so the server sees RST instead of FIN
fn reset(stream: TcpStream) {
    SockRef::from(&stream)
        .set_linger(Some(Duration::ZERO))
        .expect("Failed to set linger");
    drop(stream);
}

fn assert_hello(server: &HttpServer) {
    let mut stream = get_client(server);
    stream.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
    let mut got = vec![0u8; HELLO.len()];
    stream.read_exact(&mut got).unwrap();
    assert_eq!(got, HELLO);
}

#[test]
fn reset_mid_response_leaves_reactor_serving() {
    let payload = Bytes::from(vec![b'z'; 8 * 1024 * 1024]);
    let mut server = start_server(1, move |s| {
        s.register("/big", Method::Get, move |_| {
            Ok(Response::new(StatusCode::Ok).with_body(payload.clone()))
        })
        .unwrap();
    });

    for _ in 0..3 {
        let mut stream = get_client(&server);
        stream.write_all(b"GET /big HTTP/1.1\r\n\r\n").unwrap();
        let mut first = [0u8; 4096];
        stream.read_exact(&mut first).unwrap();
        assert!(first.starts_with(b"HTTP/1.1 200 OK\r\n"));
        reset(stream);
    }

    // the single reactor moved on from the dead writers
    assert_hello(&server);
    server.stop().unwrap();
}

#[test]
fn hangups_and_resets_are_torn_down() {
    let mut server = start_server(1, |_| {});

    // vanish before sending anything, mid-request, and with a response pending
    drop(get_client(&server));
    let mut partial = get_client(&server);
    partial.write_all(b"GET / HT").unwrap();
    drop(partial);
    let mut pending = get_client(&server);
    pending.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
    reset(pending);
    let idle = get_client(&server);
    reset(idle);

    assert_hello(&server);
    assert_hello(&server);

    server.stop().unwrap();
}

#[test]
fn half_closed_client_still_answered() {
    let mut server = start_server(1, |_| {});
    let mut stream = get_client(&server);

    stream
        .write_all(b"GET / HTTP/1.1\r\n\r\nHEAD / HTTP/1.1\r\n\r\n")
        .unwrap();
    stream.shutdown(Shutdown::Write).unwrap();

    // both answers arrive, then the server closes its side
    let mut got = Vec::new();
    stream.read_to_end(&mut got).unwrap();
    let head_only = &HELLO[..HELLO.len() - 13];
    assert_eq!(got, [HELLO, head_only].concat());

    assert_hello(&server);
    server.stop().unwrap();
}

#[test]
fn out_of_range_content_length_rejected() {
    let mut server = start_server(1, |_| {});
    let mut stream = get_client(&server);

    for declared in [usize::MAX.to_string(), "18446744073709551616".to_string()] {
        let req = format!("POST / HTTP/1.1\r\nContent-Length: {}\r\n\r\n", declared);
        stream.write_all(req.as_bytes()).unwrap();
        let resp = read_response(&mut stream);
        assert_eq!(resp.status(), StatusCode::BadRequest);
    }

    // same socket still serves
    stream.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
    assert_eq!(read_response(&mut stream).status(), StatusCode::Ok);

    server.stop().unwrap();
}

#[test]
fn connections_dealt_round_robin() {
    let reactors = 3;
    let total = 7;
    let mut server = start_server(reactors, |_| {});

    let mut clients = Vec::new();
    for _ in 0..total {
        let mut stream = get_client(&server);
        stream.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(read_response(&mut stream).status(), StatusCode::Ok);
        clients.push(stream);
    }

    assert_eq!(server.connection_counts(), vec![3, 2, 2]);
    server.stop().unwrap();
}

#[test]
fn stop_closes_connections_and_joins() {
    let mut server = start_server(2, |_| {});
    assert!(server.running());

    let mut clients = Vec::new();
    for _ in 0..4 {
        let mut stream = get_client(&server);
        stream.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        read_response(&mut stream);
        clients.push(stream);
    }
    wait_until(|| server.connection_counts().iter().sum::<usize>() == 4);

    server.stop().unwrap();
    assert!(!server.running());

    for mut stream in clients {
        let mut buf = [0u8; 16];
        match stream.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => panic!("unexpected {} bytes after shutdown", n),
            Err(e) => assert_eq!(e.kind(), ErrorKind::ConnectionReset),
        }
    }

    // the listening socket is gone and the server cannot be restarted
    assert!(TcpStream::connect(server.local_addr()).is_err());
    assert!(server.run().is_err());
}

#[test]
fn registration_rejected_while_running() {
    let mut server = start_server(1, |_| {});
    assert!(server.register("/late", Method::Get, hello).is_err());
    assert!(server.routes().lookup("/late", Method::Get).is_none());
    assert_eq!(server.routes().len(), 2);

    server.stop().unwrap();
    assert!(server.register("/late", Method::Get, hello).is_ok());
    assert!(server.routes().lookup("/late", Method::Get).is_some());
    assert!(server.routes().lookup("/late", Method::Post).is_none());
}

#[test]
fn accessors_report_configuration() {
    let mut server = HttpServer::new("127.0.0.1", 0).unwrap();
    assert_eq!(server.host(), "127.0.0.1");
    assert_eq!(server.port(), 0);
    assert_ne!(server.local_addr().port(), 0);
    assert!(!server.running());
    assert_eq!(server.config().reactors, 5);
    server.stop().unwrap();
}

#[test]
fn bind_failure_is_fatal() {
    assert!(HttpServer::new("definitely-not-a-host.invalid", 0).is_err());
    assert!(HttpServer::with_config(
        "127.0.0.1",
        0,
        ServerConfig::default().with_reactors(0)
    )
    .is_err());
}
