use crate::dispatch::{Dispatcher, Next};
use crate::error::{ServerError, ServerResult};
use crate::http::{Method, Request, Response};
use std::collections::HashMap;
use std::fmt;

/// What a handler returns. `Err` raises the error into the error channel.
pub type HandlerResult = ServerResult<()>;

/// A `(req, res, next)` handler
pub type NormalFn =
    Box<dyn Fn(&mut Request, &mut Response, Next<'_>) -> HandlerResult + Send + Sync>;

/// An `(err, req, res, next)` handler
pub type ErrorFn =
    Box<dyn Fn(ServerError, &mut Request, &mut Response, Next<'_>) -> HandlerResult + Send + Sync>;

/// Which flow a handler takes part in, fixed when the handler is built
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Normal,
    ErrorHandling,
}

/// A unit of request processing: either a normal handler or an error handler
pub enum Handler {
    Normal(NormalFn),
    Error(ErrorFn),
}

impl Handler {
    /// A handler that receives the continuation and decides whether to advance
    pub fn normal<F>(handler: F) -> Self
    where
        F: Fn(&mut Request, &mut Response, Next<'_>) -> HandlerResult + Send + Sync + 'static,
    {
        Handler::Normal(Box::new(handler))
    }

    /// A handler without a continuation: it can respond or raise, never advance
    pub fn terminal<F>(handler: F) -> Self
    where
        F: Fn(&mut Request, &mut Response) -> HandlerResult + Send + Sync + 'static,
    {
        Handler::Normal(Box::new(
            move |req: &mut Request, res: &mut Response, _next: Next<'_>| handler(req, res),
        ))
    }

    /// A handler that only runs when an error is travelling down the table
    pub fn error<F>(handler: F) -> Self
    where
        F: Fn(ServerError, &mut Request, &mut Response, Next<'_>) -> HandlerResult
            + Send
            + Sync
            + 'static,
    {
        Handler::Error(Box::new(handler))
    }

    pub fn kind(&self) -> HandlerKind {
        match self {
            Handler::Normal(_) => HandlerKind::Normal,
            Handler::Error(_) => HandlerKind::ErrorHandling,
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handler::{:?}(<function>)", self.kind())
    }
}

/// Position of a handler in the route table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerPos {
    pub route: usize,
    pub handler: usize,
}

impl fmt::Display for HandlerPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "route {} handler {}", self.route, self.handler)
    }
}

/// Which request methods a route accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodFilter {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Any,
}

impl MethodFilter {
    pub fn matches(&self, method: Method) -> bool {
        match self {
            MethodFilter::Any => true,
            MethodFilter::Get => method == Method::Get,
            MethodFilter::Post => method == Method::Post,
            MethodFilter::Put => method == Method::Put,
            MethodFilter::Patch => method == Method::Patch,
            MethodFilter::Delete => method == Method::Delete,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MethodFilter::Any => "ANY",
            MethodFilter::Get => "GET",
            MethodFilter::Post => "POST",
            MethodFilter::Put => "PUT",
            MethodFilter::Patch => "PATCH",
            MethodFilter::Delete => "DELETE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

/// A route entry: method filter, path prefix and its handler chain
#[derive(Debug)]
pub struct Route {
    filter: MethodFilter,
    prefix: String,
    segments: Vec<Segment>,
    handlers: Vec<Handler>,
}

impl Route {
    fn new(filter: MethodFilter, prefix: &str, handlers: Vec<Handler>) -> Self {
        let segments = path_segments(prefix)
            .map(|seg| match seg.strip_prefix(':') {
                Some(name) => Segment::Param(name.to_string()),
                None => Segment::Literal(seg.to_string()),
            })
            .collect();

        let prefix = if prefix.starts_with('/') {
            prefix.to_string()
        } else {
            format!("/{}", prefix)
        };

        Self {
            filter,
            prefix,
            segments,
            handlers,
        }
    }

    pub fn method_filter(&self) -> MethodFilter {
        self.filter
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn handlers(&self) -> &[Handler] {
        &self.handlers
    }

    /// Whether normal (non-error) flow can ever enter this route
    pub fn has_normal_handlers(&self) -> bool {
        self.handlers
            .iter()
            .any(|h| h.kind() == HandlerKind::Normal)
    }

    /// Check the method filter and whether the prefix covers `path`
    pub fn matches(&self, method: Method, path: &str) -> bool {
        self.filter.matches(method) && self.path_matches(path)
    }

    /// String-prefix match. With `:name` segments the literal text between
    /// them must match whole segments and each parameter takes one segment;
    /// the final literal segment is still matched as a string prefix.
    fn path_matches(&self, path: &str) -> bool {
        if !self.has_params() {
            return path.starts_with(&self.prefix);
        }

        let last = self.segments.len() - 1;
        let mut path_segments = path_segments(path);
        self.segments
            .iter()
            .enumerate()
            .all(|(i, pattern)| match (pattern, path_segments.next()) {
                (_, None) => false,
                (Segment::Param(_), Some(_)) => true,
                (Segment::Literal(lit), Some(seg)) if i == last => seg.starts_with(lit.as_str()),
                (Segment::Literal(lit), Some(seg)) => lit == seg,
            })
    }

    fn has_params(&self) -> bool {
        self.segments
            .iter()
            .any(|seg| matches!(seg, Segment::Param(_)))
    }

    /// Extract `:name` parameters from a path this route matches
    pub fn extract_params(&self, path: &str) -> HashMap<String, String> {
        self.segments
            .iter()
            .zip(path_segments(path))
            .filter_map(|(pattern, seg)| match pattern {
                Segment::Param(name) => Some((name.clone(), seg.to_string())),
                Segment::Literal(_) => None,
            })
            .collect()
    }
}

fn path_segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// The route table, built during the registration phase.
///
/// Routes are tried in the order they were registered. Freeze the table with
/// [`Router::into_dispatcher`] before serving; the dispatcher cannot be
/// mutated.
#[derive(Debug, Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    /// Create an empty route table
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    /// Append a route. No deduplication or reordering takes place.
    pub fn register(
        &mut self,
        filter: MethodFilter,
        prefix: &str,
        handlers: Vec<Handler>,
    ) -> &mut Self {
        log::debug!(
            "Registering route #{} {} {} ({} handlers)",
            self.routes.len(),
            filter.as_str(),
            prefix,
            handlers.len()
        );
        self.routes.push(Route::new(filter, prefix, handlers));
        self
    }

    /// Add a route for every method
    pub fn use_all(&mut self, prefix: &str, handlers: Vec<Handler>) -> &mut Self {
        self.register(MethodFilter::Any, prefix, handlers)
    }

    /// Add a GET route
    pub fn get(&mut self, prefix: &str, handlers: Vec<Handler>) -> &mut Self {
        self.register(MethodFilter::Get, prefix, handlers)
    }

    /// Add a POST route
    pub fn post(&mut self, prefix: &str, handlers: Vec<Handler>) -> &mut Self {
        self.register(MethodFilter::Post, prefix, handlers)
    }

    /// Add a PUT route
    pub fn put(&mut self, prefix: &str, handlers: Vec<Handler>) -> &mut Self {
        self.register(MethodFilter::Put, prefix, handlers)
    }

    /// Add a PATCH route
    pub fn patch(&mut self, prefix: &str, handlers: Vec<Handler>) -> &mut Self {
        self.register(MethodFilter::Patch, prefix, handlers)
    }

    /// Add a DELETE route
    pub fn delete(&mut self, prefix: &str, handlers: Vec<Handler>) -> &mut Self {
        self.register(MethodFilter::Delete, prefix, handlers)
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// End the registration phase
    pub fn into_dispatcher(self) -> Dispatcher {
        Dispatcher::new(self.routes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Handler {
        Handler::terminal(|_, _| Ok(()))
    }

    #[test]
    fn test_prefix_matching_is_string_prefix() {
        let route = Route::new(MethodFilter::Any, "/user", vec![noop()]);
        assert!(route.matches(Method::Get, "/user"));
        assert!(route.matches(Method::Get, "/user/"));
        assert!(route.matches(Method::Post, "/user/42/posts"));
        assert!(route.matches(Method::Get, "/users"));
        assert!(!route.matches(Method::Get, "/use"));
        assert!(!route.matches(Method::Get, "/"));
    }

    #[test]
    fn test_prefix_without_leading_slash() {
        let route = Route::new(MethodFilter::Any, "user", vec![noop()]);
        assert_eq!(route.prefix(), "/user");
        assert!(route.matches(Method::Get, "/user/1"));
    }

    #[test]
    fn test_param_routes_match_whole_segments() {
        let route = Route::new(MethodFilter::Any, "/user/:id", vec![noop()]);
        assert!(route.matches(Method::Get, "/user/42"));
        assert!(route.matches(Method::Get, "/user/42/posts"));
        assert!(!route.matches(Method::Get, "/users/42"));
        assert!(!route.matches(Method::Get, "/user"));

        let route = Route::new(MethodFilter::Any, "/user/:id/post", vec![noop()]);
        assert!(route.matches(Method::Get, "/user/42/posts"));
        assert!(!route.matches(Method::Get, "/user/42/comments"));
    }

    #[test]
    fn test_root_is_catch_all() {
        let route = Route::new(MethodFilter::Any, "/", vec![noop()]);
        assert!(route.matches(Method::Get, "/"));
        assert!(route.matches(Method::Delete, "/anything/at/all"));
    }

    #[test]
    fn test_method_filter() {
        let route = Route::new(MethodFilter::Patch, "/user", vec![noop()]);
        assert!(route.matches(Method::Patch, "/user"));
        assert!(!route.matches(Method::Get, "/user"));
        assert!(!route.matches(Method::Head, "/user"));
    }

    #[test]
    fn test_router_params() {
        let route = Route::new(MethodFilter::Get, "/users/:id/posts/:post_id", vec![noop()]);
        assert!(route.matches(Method::Get, "/users/123/posts/456/comments"));

        let params = route.extract_params("/users/123/posts/456/comments");
        assert_eq!(params.len(), 2);
        assert_eq!(params.get("id").unwrap(), "123");
        assert_eq!(params.get("post_id").unwrap(), "456");

        let route = Route::new(MethodFilter::Get, "/users", vec![noop()]);
        assert!(route.extract_params("/users").is_empty());
    }

    #[test]
    fn test_registration_order_is_preserved() {
        let mut router = Router::new();
        router
            .use_all("/", vec![noop()])
            .get("/test", vec![noop(), noop()])
            .use_all("/", vec![Handler::error(|_, _, _, _| Ok(()))]);

        let prefixes: Vec<&str> = router.routes().iter().map(Route::prefix).collect();
        assert_eq!(prefixes, vec!["/", "/test", "/"]);
        assert_eq!(router.routes()[1].handlers().len(), 2);
        assert!(!router.routes()[2].has_normal_handlers());
        assert_eq!(
            router.routes()[2].handlers()[0].kind(),
            HandlerKind::ErrorHandling
        );
    }
}
