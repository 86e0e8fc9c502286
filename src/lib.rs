// Core modules for the spindle HTTP server
pub mod error; // ProtocolError + status mapping
pub mod message; // Request/Response + Method/Version/StatusCode/Headers
pub mod codec; // HTTP/1.1 parser + encoders
pub mod router; // RouteTable::dispatch (path -> method -> handler)
pub mod config; // ServerConfig + defaults
pub mod conn; // Connection read/write state machine
pub mod reactor; // Reactor event loop (one per worker thread)
pub mod net; // bind_listener + Listener (accept loop, round-robin)
pub mod server; // HttpServer run/stop lifecycle

// Re-export all public items from modules for easier access
pub use error::*;
pub use message::*;
pub use codec::*;
pub use router::*;
pub use config::*;
pub use conn::*;
pub use reactor::*;
pub use net::*;
pub use server::*;

// Default server address used by the demo binary
pub const DEFAULT_ADDR: &str = "127.0.0.1:8080";
