use bytes::BytesMut;
use spindle::*;

#[test]
fn parse_route_and_serialize_hello() {
    let mut routes = RouteTable::new();
    routes.register("/", Method::Get, |_| {
        Ok(Response::new(StatusCode::Ok)
            .with_header("Content-Type", "text/plain")
            .with_body("Hello, world\n"))
    });

    let raw = b"GET / HTTP/1.1\r\nConnection: Keep-Alive\r\n\r\n";
    let (used, request) = parse_request(raw).unwrap().unwrap();
    assert_eq!(used, raw.len());

    let mut out = BytesMut::new();
    encode_response(&routes.dispatch(&request), true, &mut out);
    assert_eq!(
        &out[..],
        b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 13\r\n\r\nHello, world\n"
    );
}

#[test]
fn request_survives_encode_and_parse() {
    let request = Request::new(Method::Post, "/submit")
        .with_header("Host", "example")
        .with_body(&b"a=1&b=2"[..]);

    let mut wire = BytesMut::new();
    encode_request(&request, &mut wire);
    // a second request queued behind the first
    wire.extend_from_slice(b"DELETE /x HTTP/1.0\r\n\r\n");

    let (used, parsed) = parse_request(&wire).unwrap().unwrap();
    assert_eq!(parsed, request);

    let (_, next) = parse_request(&wire[used..]).unwrap().unwrap();
    assert_eq!(next.method(), Method::Delete);
    assert_eq!(next.version(), Version::Http10);
}

#[test]
fn error_conditions_map_to_responses() {
    let err = parse_request(b"XYZ\r\n\r\n").unwrap_err();
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::BadRequest);
    assert!(!resp.body().is_empty());

    let err = parse_request(b"GET / HTTP/3.0\r\n\r\n").unwrap_err();
    assert_eq!(err.into_response().status(), StatusCode::HttpVersionNotSupported);
}
