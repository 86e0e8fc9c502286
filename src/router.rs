/*!
 * Route Table
 *
 * Exact-match mapping from request target to method to handler. The table
 * is filled before the server starts and is only read afterwards, so the
 * reactors share it behind an `Arc` without any locking.
 */

use crate::error::ProtocolError;
use crate::message::{Method, Request, Response, StatusCode};
use anyhow::Result;
use hashbrown::HashMap;
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Request handler
///
/// Runs synchronously on the reactor thread that owns the connection, so a
/// slow handler stalls every other connection on that reactor.
pub type Handler = Arc<dyn Fn(&Request) -> Result<Response> + Send + Sync>;

/// path -> method -> handler
#[derive(Default, Clone)]
pub struct RouteTable {
    routes: HashMap<String, HashMap<Method, Handler>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handler` to (`path`, `method`), replacing any previous binding
    pub fn register<F>(&mut self, path: impl Into<String>, method: Method, handler: F)
    where
        F: Fn(&Request) -> Result<Response> + Send + Sync + 'static,
    {
        self.routes
            .entry(path.into())
            .or_default()
            .insert(method, Arc::new(handler));
    }

    /// Look up the handler for an exact (path, method) pair
    pub fn lookup(&self, path: &str, method: Method) -> Option<&Handler> {
        self.routes.get(path).and_then(|methods| methods.get(&method))
    }

    /// Number of (path, method) bindings
    pub fn len(&self) -> usize {
        self.routes.values().map(|m| m.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Route a request and produce its response
    ///
    /// * unknown path -> 404, empty body
    /// * known path, unbound method -> 405, empty body
    /// * handler error or panic -> 500 carrying the failure description
    pub fn dispatch(&self, request: &Request) -> Response {
        let methods = match self.routes.get(request.target()) {
            Some(m) => m,
            None => return Response::new(StatusCode::NotFound),
        };
        let handler = match methods.get(&request.method()) {
            Some(h) => h,
            None => return Response::new(StatusCode::MethodNotAllowed),
        };

        match catch_unwind(AssertUnwindSafe(|| handler(request))) {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                log::warn!("handler for {} {} failed: {:#}", request.method(), request.target(), e);
                ProtocolError::Internal(format!("{:#}", e)).into_response()
            }
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                log::warn!("handler for {} {} panicked: {}", request.method(), request.target(), msg);
                ProtocolError::Internal(msg).into_response()
            }
        }
    }
}

impl fmt::Debug for RouteTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (path, methods) in &self.routes {
            map.entry(path, &methods.keys().collect::<Vec<_>>());
        }
        map.finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::HttpMessage;
    use anyhow::anyhow;

    fn table() -> RouteTable {
        let mut t = RouteTable::new();
        t.register("/", Method::Get, |_| {
            Ok(Response::new(StatusCode::Ok).with_body("root"))
        });
        t.register("/fail", Method::Post, |_| Err(anyhow!("disk on fire")));
        t.register("/panic", Method::Get, |_| panic!("bad handler"));
        t
    }

    #[test]
    fn dispatches_exact_match() {
        let resp = table().dispatch(&Request::new(Method::Get, "/"));
        assert_eq!(resp.status(), StatusCode::Ok);
        assert_eq!(resp.body(), b"root".as_slice());
    }

    #[test]
    fn unknown_path_is_404_for_any_method() {
        let t = table();
        for method in [Method::Get, Method::Head, Method::Post, Method::Delete] {
            let resp = t.dispatch(&Request::new(method, "/missing"));
            assert_eq!(resp.status(), StatusCode::NotFound);
            assert!(resp.body().is_empty());
        }
        // no prefix or query matching
        assert_eq!(t.dispatch(&Request::new(Method::Get, "/?q=1")).status(), StatusCode::NotFound);
    }

    #[test]
    fn unbound_method_is_405() {
        let resp = table().dispatch(&Request::new(Method::Put, "/"));
        assert_eq!(resp.status(), StatusCode::MethodNotAllowed);
    }

    #[test]
    fn handler_failures_become_500() {
        let t = table();
        let resp = t.dispatch(&Request::new(Method::Post, "/fail"));
        assert_eq!(resp.status(), StatusCode::InternalServerError);
        assert!(String::from_utf8_lossy(resp.body()).contains("disk on fire"));

        let resp = t.dispatch(&Request::new(Method::Get, "/panic"));
        assert_eq!(resp.status(), StatusCode::InternalServerError);
        assert!(String::from_utf8_lossy(resp.body()).contains("bad handler"));
    }

    #[test]
    fn later_registration_wins() {
        let mut t = table();
        t.register("/", Method::Get, |_| Ok(Response::new(StatusCode::Accepted)));
        assert_eq!(t.len(), 3);
        assert_eq!(t.dispatch(&Request::new(Method::Get, "/")).status(), StatusCode::Accepted);
    }
}
