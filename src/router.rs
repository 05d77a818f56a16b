//! Routing result consumed by the core plus a small route table to
//! produce it. Matching semantics deliberately stay simple (literal and
//! `:param` segments, linear scan); anything fancier belongs in an
//! external router producing the same [`RoutingResult`].

use std::sync::Arc;
use std::time::Duration;

use crate::config::WebSocketConfig;
use crate::handlers::{
    AsyncHandler, RequestHandler, RequestMiddleware, RequestTask, ResponseMiddleware,
    ResponseStream, StreamingHandler,
};
use crate::http::{self, HttpRequest, HttpResponse, Method};
use crate::websocket::WebSocketCallbacks;

/// Per-route CORS policy (route-level overrides a global one).
#[derive(Clone, Debug, Default)]
pub struct CorsPolicy {
    /// Exact origins; empty list allows any origin.
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<Method>,
    pub allowed_headers: Vec<String>,
    pub allow_credentials: bool,
    pub max_age: Option<Duration>,
}

impl CorsPolicy {
    pub fn allow_any() -> CorsPolicy {
        CorsPolicy::default()
    }

    pub fn origin_allowed(&self, origin: &str) -> bool {
        self.allowed_origins.is_empty()
            || self
                .allowed_origins
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(origin))
    }

    /// True when the request carries an Origin this policy rejects.
    pub fn denies(&self, request: &HttpRequest) -> bool {
        match request.header_value(http::H_ORIGIN) {
            Some(origin) => !self.origin_allowed(origin),
            None => false,
        }
    }

    pub fn apply_to_response(&self, request: &HttpRequest, response: &mut HttpResponse) {
        let Some(origin) = request.header_value(http::H_ORIGIN) else {
            return;
        };
        if !self.origin_allowed(origin) {
            return;
        }
        let echoed = if self.allowed_origins.is_empty() && !self.allow_credentials {
            "*".to_owned()
        } else {
            origin.to_owned()
        };
        response.add_header("Access-Control-Allow-Origin", echoed);
        if self.allow_credentials {
            response.add_header("Access-Control-Allow-Credentials", "true");
        }
    }

    /// Response for an `OPTIONS` preflight that this policy accepts.
    pub fn preflight_response(&self, request: &HttpRequest) -> HttpResponse {
        let mut response = HttpResponse::new(http::STATUS_NO_CONTENT);
        self.apply_to_response(request, &mut response);
        let methods = if self.allowed_methods.is_empty() {
            "GET, HEAD, POST, PUT, DELETE, OPTIONS, PATCH".to_owned()
        } else {
            self.allowed_methods
                .iter()
                .map(|method| method.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        };
        response.add_header("Access-Control-Allow-Methods", methods);
        if !self.allowed_headers.is_empty() {
            response.add_header(
                "Access-Control-Allow-Headers",
                self.allowed_headers.join(", "),
            );
        }
        if let Some(max_age) = self.max_age {
            response.add_header("Access-Control-Max-Age", max_age.as_secs().to_string());
        }
        response
    }
}

/// A registered WebSocket endpoint: per-endpoint limits plus a factory
/// producing the callbacks for each accepted connection.
pub struct WebSocketEndpoint {
    pub config: WebSocketConfig,
    pub callbacks: Arc<dyn Fn(&HttpRequest) -> WebSocketCallbacks + Send + Sync>,
}

impl std::fmt::Debug for WebSocketEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketEndpoint")
            .field("config", &self.config)
            .finish()
    }
}

#[derive(Clone)]
enum RouteTarget {
    Buffered(RequestHandler),
    Streaming(StreamingHandler),
    Async(AsyncHandler),
    WebSocket(Arc<WebSocketEndpoint>),
}

#[derive(Clone)]
struct Route {
    segments: Vec<Segment>,
    // Trailing slashes are significant so canonical-slash redirects work.
    trailing_slash: bool,
    methods: Option<Vec<Method>>,
    target: RouteTarget,
    cors: Option<Arc<CorsPolicy>>,
    request_middleware: Vec<RequestMiddleware>,
    response_middleware: Vec<ResponseMiddleware>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

fn has_trailing_slash(path: &str) -> bool {
    path.len() > 1 && path.ends_with('/')
}

fn parse_segments(path: &str) -> Vec<Segment> {
    path.trim_matches('/')
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| match segment.strip_prefix(':') {
            Some(name) => Segment::Param(name.to_owned()),
            None => Segment::Literal(segment.to_owned()),
        })
        .collect()
}

/// Canonical-path redirect the core should emit instead of dispatching.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum RedirectSlash {
    #[default]
    None,
    AddSlash,
    RemoveSlash,
}

/// Everything the core needs to dispatch one request. At most one of the
/// handler variants is set.
#[derive(Default)]
pub struct RoutingResult {
    pub handler: Option<RequestHandler>,
    pub streaming: Option<StreamingHandler>,
    pub async_handler: Option<AsyncHandler>,
    pub websocket: Option<Arc<WebSocketEndpoint>>,
    pub cors: Option<Arc<CorsPolicy>>,
    pub redirect: RedirectSlash,
    pub method_not_allowed: bool,
    pub path_params: Vec<(String, String)>,
    pub request_middleware: Vec<RequestMiddleware>,
    pub response_middleware: Vec<ResponseMiddleware>,
}

/// Route table. Copy-on-write friendly: cloning shares all handlers, so a
/// posted router update mutates a worker-local copy cheaply.
#[derive(Clone, Default)]
pub struct Router {
    routes: Vec<Route>,
    global_cors: Option<Arc<CorsPolicy>>,
    global_request_middleware: Vec<RequestMiddleware>,
    global_response_middleware: Vec<ResponseMiddleware>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("routes", &self.routes.len())
            .finish()
    }
}

impl Router {
    pub fn new() -> Router {
        Router::default()
    }

    pub fn get(
        &mut self,
        path: &str,
        handler: impl Fn(&mut HttpRequest) -> HttpResponse + Send + Sync + 'static,
    ) -> &mut Self {
        self.route(&[Method::Get, Method::Head], path, handler)
    }

    pub fn post(
        &mut self,
        path: &str,
        handler: impl Fn(&mut HttpRequest) -> HttpResponse + Send + Sync + 'static,
    ) -> &mut Self {
        self.route(&[Method::Post], path, handler)
    }

    /// Register a buffered handler for the given methods; an empty method
    /// list accepts every method.
    pub fn route(
        &mut self,
        methods: &[Method],
        path: &str,
        handler: impl Fn(&mut HttpRequest) -> HttpResponse + Send + Sync + 'static,
    ) -> &mut Self {
        self.push(methods, path, RouteTarget::Buffered(Arc::new(handler)));
        self
    }

    pub fn streaming(
        &mut self,
        methods: &[Method],
        path: &str,
        handler: impl Fn(&mut HttpRequest, &mut dyn ResponseStream) + Send + Sync + 'static,
    ) -> &mut Self {
        self.push(methods, path, RouteTarget::Streaming(Arc::new(handler)));
        self
    }

    pub fn async_route(
        &mut self,
        methods: &[Method],
        path: &str,
        handler: impl Fn(&mut HttpRequest) -> RequestTask + Send + Sync + 'static,
    ) -> &mut Self {
        self.push(methods, path, RouteTarget::Async(Arc::new(handler)));
        self
    }

    pub fn websocket(&mut self, path: &str, endpoint: WebSocketEndpoint) -> &mut Self {
        self.push(
            &[Method::Get],
            path,
            RouteTarget::WebSocket(Arc::new(endpoint)),
        );
        self
    }

    /// Attach a CORS policy to the most recently added route.
    pub fn with_cors(&mut self, policy: CorsPolicy) -> &mut Self {
        if let Some(route) = self.routes.last_mut() {
            route.cors = Some(Arc::new(policy));
        }
        self
    }

    /// Attach request middleware to the most recently added route.
    pub fn with_request_middleware(
        &mut self,
        middleware: impl Fn(&mut HttpRequest) -> Option<HttpResponse> + Send + Sync + 'static,
    ) -> &mut Self {
        if let Some(route) = self.routes.last_mut() {
            route.request_middleware.push(Arc::new(middleware));
        }
        self
    }

    /// Attach response middleware to the most recently added route.
    pub fn with_response_middleware(
        &mut self,
        middleware: impl Fn(&HttpRequest, &mut HttpResponse) + Send + Sync + 'static,
    ) -> &mut Self {
        if let Some(route) = self.routes.last_mut() {
            route.response_middleware.push(Arc::new(middleware));
        }
        self
    }

    pub fn set_global_cors(&mut self, policy: CorsPolicy) {
        self.global_cors = Some(Arc::new(policy));
    }

    pub fn use_request_middleware(
        &mut self,
        middleware: impl Fn(&mut HttpRequest) -> Option<HttpResponse> + Send + Sync + 'static,
    ) {
        self.global_request_middleware.push(Arc::new(middleware));
    }

    pub fn use_response_middleware(
        &mut self,
        middleware: impl Fn(&HttpRequest, &mut HttpResponse) + Send + Sync + 'static,
    ) {
        self.global_response_middleware.push(Arc::new(middleware));
    }

    fn push(&mut self, methods: &[Method], path: &str, target: RouteTarget) {
        self.routes.push(Route {
            segments: parse_segments(path),
            trailing_slash: has_trailing_slash(path),
            methods: if methods.is_empty() {
                None
            } else {
                Some(methods.to_vec())
            },
            target,
            cors: None,
            request_middleware: Vec::new(),
            response_middleware: Vec::new(),
        });
    }

    fn match_segments(route: &Route, path: &str) -> Option<Vec<(String, String)>> {
        if route.trailing_slash != has_trailing_slash(path) {
            return None;
        }
        let mut params = Vec::new();
        let mut path_segments = path
            .trim_matches('/')
            .split('/')
            .filter(|segment| !segment.is_empty());
        let mut route_segments = route.segments.iter();
        loop {
            match (route_segments.next(), path_segments.next()) {
                (None, None) => return Some(params),
                (Some(Segment::Literal(expected)), Some(actual)) if expected == actual => {}
                (Some(Segment::Param(name)), Some(actual)) => {
                    params.push((name.clone(), actual.to_owned()));
                }
                _ => return None,
            }
        }
    }

    /// Resolve `(method, path)` to at most one handler, with CORS policy,
    /// slash-redirect hint, method-not-allowed flag, path parameters and
    /// middleware chains.
    pub fn resolve(&self, method: Method, path: &str) -> RoutingResult {
        let mut result = RoutingResult {
            cors: self.global_cors.clone(),
            request_middleware: self.global_request_middleware.clone(),
            response_middleware: self.global_response_middleware.clone(),
            ..RoutingResult::default()
        };

        let mut path_matched = false;
        for route in &self.routes {
            let Some(params) = Self::match_segments(route, path) else {
                continue;
            };
            path_matched = true;
            let method_ok = route
                .methods
                .as_ref()
                .map_or(true, |methods| methods.contains(&method));
            if !method_ok {
                continue;
            }

            if route.cors.is_some() {
                result.cors = route.cors.clone();
            }
            result
                .request_middleware
                .extend(route.request_middleware.iter().cloned());
            result
                .response_middleware
                .extend(route.response_middleware.iter().cloned());
            result.path_params = params;
            match &route.target {
                RouteTarget::Buffered(handler) => result.handler = Some(handler.clone()),
                RouteTarget::Streaming(handler) => result.streaming = Some(handler.clone()),
                RouteTarget::Async(handler) => result.async_handler = Some(handler.clone()),
                RouteTarget::WebSocket(endpoint) => result.websocket = Some(endpoint.clone()),
            }
            return result;
        }

        if path_matched {
            result.method_not_allowed = true;
            return result;
        }

        // Canonical-slash redirect: the other spelling of the path exists.
        let (other, redirect) = if path.len() > 1 && path.ends_with('/') {
            (path[..path.len() - 1].to_owned(), RedirectSlash::RemoveSlash)
        } else {
            (format!("{}/", path), RedirectSlash::AddSlash)
        };
        if path != other
            && self
                .routes
                .iter()
                .any(|route| Self::match_segments(route, &other).is_some())
        {
            result.redirect = redirect;
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_handler() -> impl Fn(&mut HttpRequest) -> HttpResponse + Send + Sync + 'static {
        |_request: &mut HttpRequest| HttpResponse::with_text(http::STATUS_OK, "ok")
    }

    #[test]
    fn exact_match() {
        let mut router = Router::new();
        router.get("/echo", ok_handler());
        let result = router.resolve(Method::Get, "/echo");
        assert!(result.handler.is_some());
        assert!(!result.method_not_allowed);
    }

    #[test]
    fn method_not_allowed() {
        let mut router = Router::new();
        router.get("/echo", ok_handler());
        let result = router.resolve(Method::Post, "/echo");
        assert!(result.handler.is_none());
        assert!(result.method_not_allowed);
    }

    #[test]
    fn path_params_captured() {
        let mut router = Router::new();
        router.get("/users/:id/posts/:post", ok_handler());
        let result = router.resolve(Method::Get, "/users/42/posts/7");
        assert!(result.handler.is_some());
        assert_eq!(
            result.path_params,
            vec![
                ("id".to_owned(), "42".to_owned()),
                ("post".to_owned(), "7".to_owned())
            ]
        );
    }

    #[test]
    fn no_match_is_empty_result() {
        let router = Router::new();
        let result = router.resolve(Method::Get, "/nope");
        assert!(result.handler.is_none());
        assert!(!result.method_not_allowed);
        assert_eq!(result.redirect, RedirectSlash::None);
    }

    #[test]
    fn canonical_slash_redirects() {
        let mut router = Router::new();
        router.get("/dir/", ok_handler());
        router.get("/plain", ok_handler());

        let result = router.resolve(Method::Get, "/dir");
        assert!(result.handler.is_none());
        assert_eq!(result.redirect, RedirectSlash::AddSlash);

        let result = router.resolve(Method::Get, "/plain/");
        assert!(result.handler.is_none());
        assert_eq!(result.redirect, RedirectSlash::RemoveSlash);

        let result = router.resolve(Method::Get, "/dir/");
        assert!(result.handler.is_some());
    }

    #[test]
    fn route_middleware_appends_to_global() {
        let mut router = Router::new();
        router.use_request_middleware(|_request| None);
        router.get("/a", ok_handler());
        router.with_request_middleware(|_request| None);
        let result = router.resolve(Method::Get, "/a");
        assert_eq!(result.request_middleware.len(), 2);
    }

    #[test]
    fn cors_deny() {
        let policy = CorsPolicy {
            allowed_origins: vec!["https://good.example".to_owned()],
            ..CorsPolicy::default()
        };
        let mut request = HttpRequest::default();
        request.try_set_head(
            b"GET / HTTP/1.1\r\nOrigin: https://evil.example\r\n\r\n",
            8192,
            true,
        );
        assert!(policy.denies(&request));
    }
}
