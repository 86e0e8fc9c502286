/*!
 * Spindle Demo Server
 *
 * Starts the server with two demo routes and runs until `quit` is typed on
 * stdin (or stdin closes).
 *
 * Environment:
 * * `SPINDLE_ADDR` - host:port to bind (default 127.0.0.1:8080)
 * * `SPINDLE_REACTORS` - number of reactor threads (default 5)
 * * `RUST_LOG` - log filter, e.g. `RUST_LOG=debug`
 */

use anyhow::{Context, Result};
use spindle::*;
use std::io::BufRead;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const HELLO_HTML: &str = "<!doctype html>\n<html>\n<body>\n\n\
<h1>Hello, world in an Html page</h1>\n\
<p>A Paragraph</p>\n\n\
</body>\n</html>\n";

fn say_hello(_: &Request) -> Result<Response> {
    Ok(Response::new(StatusCode::Ok)
        .with_header("Content-Type", "text/plain")
        .with_body("Hello, world\n"))
}

fn send_html(_: &Request) -> Result<Response> {
    Ok(Response::new(StatusCode::Ok)
        .with_header("Content-Type", "text/html")
        .with_body(HELLO_HTML))
}

fn config_from_env() -> Result<ServerConfig> {
    let mut config = ServerConfig::default();
    if let Ok(v) = std::env::var("SPINDLE_REACTORS") {
        let n = v
            .parse()
            .with_context(|| format!("SPINDLE_REACTORS must be a number, got `{}`", v))?;
        config = config.with_reactors(n);
    }
    Ok(config)
}

fn main() -> Result<()> {
    // Initialize logging - respects RUST_LOG environment variable
    env_logger::init();

    let addr = std::env::var("SPINDLE_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string());
    let (host, port) = addr
        .rsplit_once(':')
        .with_context(|| format!("SPINDLE_ADDR must be host:port, got `{}`", addr))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid port in `{}`", addr))?;

    let mut server = HttpServer::with_config(host, port, config_from_env()?)?;
    server.register("/", Method::Head, say_hello)?;
    server.register("/", Method::Get, say_hello)?;
    server.register("/hello.html", Method::Head, send_html)?;
    server.register("/hello.html", Method::Get, send_html)?;

    println!("Starting the web server..");
    server.run()?;
    println!("Server listening on {}", server.local_addr());
    println!("Enter [quit] to stop the server");

    for line in std::io::stdin().lock().lines() {
        if line?.trim() == "quit" {
            println!("'quit' command entered. Stopping the web server..");
            break;
        }
    }

    server.stop()?;
    println!("Server stopped");
    Ok(())
}
