//! First-match dispatch and the handler chain executor.
//!
//! Handlers run as nested calls: `next.run(..)` invokes the following handler
//! and returns to the caller once that handler (and everything it delegated
//! to) has returned. A handler can therefore keep executing after a later
//! handler already responded; a second terminal write from it is reported on
//! the response as `DoubleResponse` instead of being dropped.
//!
//! Errors, whether returned, passed to `next.fail` or raised by a panic, skip
//! the remaining normal handlers and go to the first error handler after the
//! raising position: later handlers of the same chain first, then every later
//! route that matches the request. An error nobody handles fails the exchange
//! and only that exchange.

use crate::error::ServerError;
use crate::http::{Method, Request, Response, Status};
use crate::metrics::MetricsCollector;
use crate::router::{Handler, HandlerKind, HandlerPos, Route};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// How an exchange ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A handler wrote the terminal response
    Responded,
    /// No route matched; no handler ran
    RouteNotFound,
    /// The matched chain ran to its end with no terminal response: the last
    /// normal handler returned without responding, or `next` was called past it
    ChainExhausted,
    /// An error reached the boundary without an error handler
    Failed,
    /// A handler before the end of the chain returned without responding or advancing
    Open,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Responded => "responded",
            Outcome::RouteNotFound => "route_not_found",
            Outcome::ChainExhausted => "chain_exhausted",
            Outcome::Failed => "failed",
            Outcome::Open => "open",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One request, its response, and how the chain ran
#[derive(Debug)]
pub struct Exchange {
    pub request: Request,
    pub response: Response,
    pub outcome: Outcome,
    /// The route selected for normal flow
    pub route: Option<usize>,
    /// Every handler entered, in call order
    pub invoked: Vec<HandlerPos>,
    /// Errors no error handler took
    pub unhandled: Vec<ServerError>,
}

impl Exchange {
    /// Double writes and late header changes reported during the exchange
    pub fn violations(&self) -> &[ServerError] {
        self.response.violations()
    }

    pub fn double_responses(&self) -> usize {
        self.violations()
            .iter()
            .filter(|e| matches!(e, ServerError::DoubleResponse { .. }))
            .count()
    }

    pub fn is_open(&self) -> bool {
        self.outcome == Outcome::Open
    }
}

/// Per-exchange bookkeeping shared by every continuation of one dispatch
#[derive(Default)]
struct ChainState {
    exhausted: Cell<bool>,
    invoked: RefCell<Vec<HandlerPos>>,
    unhandled: RefCell<Vec<ServerError>>,
}

/// The continuation handed to each handler.
///
/// Consuming it with [`Next::run`] advances the chain; [`Next::fail`] sends an
/// error down the error channel. Dropping it leaves the exchange where it is.
pub struct Next<'a> {
    dispatcher: &'a Dispatcher,
    pos: HandlerPos,
    state: &'a ChainState,
}

impl<'a> Next<'a> {
    /// Invoke the next normal handler of the current chain and return once it does
    pub fn run(self, req: &mut Request, res: &mut Response) {
        match self.dispatcher.next_normal(self.pos) {
            Some(pos) => self.dispatcher.invoke(pos, None, req, res, self.state),
            None => {
                log::debug!("{} {}: next() past the end of the chain at {}", req.method, req.path, self.pos);
                self.state.exhausted.set(true);
            }
        }
    }

    /// Skip to the nearest error handler with `err`
    pub fn fail(self, err: ServerError, req: &mut Request, res: &mut Response) {
        self.dispatcher.raise(self.pos, err, req, res, self.state);
    }

    /// Position of the handler holding this continuation
    pub fn position(&self) -> HandlerPos {
        self.pos
    }
}

/// A frozen route table that dispatches requests
pub struct Dispatcher {
    routes: Vec<Route>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("routes", &self.routes)
            .finish()
    }
}

impl Dispatcher {
    pub(crate) fn new(routes: Vec<Route>) -> Self {
        Self {
            routes,
            metrics: None,
        }
    }

    /// Record exchange outcomes and latency into `metrics`
    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// First route, in registration order, that normal flow can enter
    pub fn find_route(&self, method: Method, path: &str) -> Option<usize> {
        self.routes
            .iter()
            .position(|route| route.has_normal_handlers() && route.matches(method, path))
    }

    /// Run one request through the table
    pub fn dispatch(&self, mut request: Request) -> Exchange {
        let _timer = self
            .metrics
            .as_ref()
            .map(|m| m.time_exchange(request.method.as_str()));
        let mut response = Response::new();
        let state = ChainState::default();

        let route = self.find_route(request.method, &request.path);
        let outcome = match route {
            None => {
                let _ = response.send_text(Status::NotFound, &cannot(&request));
                Outcome::RouteNotFound
            }
            Some(route) => {
                if let Some(first) = self.first_normal(route) {
                    self.invoke(first, None, &mut request, &mut response, &state);
                }
                self.settle(&request, &mut response, &state)
            }
        };

        self.report(&request, &response, outcome, &state);

        Exchange {
            request,
            response,
            outcome,
            route,
            invoked: state.invoked.into_inner(),
            unhandled: state.unhandled.into_inner(),
        }
    }

    fn first_normal(&self, route: usize) -> Option<HandlerPos> {
        self.routes[route]
            .handlers()
            .iter()
            .position(|h| h.kind() == HandlerKind::Normal)
            .map(|handler| HandlerPos { route, handler })
    }

    /// Next normal handler after `from` within its own chain
    fn next_normal(&self, from: HandlerPos) -> Option<HandlerPos> {
        self.routes[from.route]
            .handlers()
            .iter()
            .enumerate()
            .skip(from.handler + 1)
            .find(|(_, h)| h.kind() == HandlerKind::Normal)
            .map(|(handler, _)| HandlerPos {
                route: from.route,
                handler,
            })
    }

    /// First error handler after `from`: rest of its chain, then later matching routes
    fn find_error_handler(&self, from: HandlerPos, method: Method, path: &str) -> Option<HandlerPos> {
        let is_error = |h: &Handler| h.kind() == HandlerKind::ErrorHandling;

        let in_chain = self.routes[from.route]
            .handlers()
            .iter()
            .enumerate()
            .skip(from.handler + 1)
            .find(|(_, h)| is_error(*h))
            .map(|(handler, _)| HandlerPos {
                route: from.route,
                handler,
            });
        if in_chain.is_some() {
            return in_chain;
        }

        self.routes
            .iter()
            .enumerate()
            .skip(from.route + 1)
            .filter(|(_, route)| route.matches(method, path))
            .find_map(|(route, r)| {
                r.handlers()
                    .iter()
                    .position(is_error)
                    .map(|handler| HandlerPos { route, handler })
            })
    }

    /// Call the handler at `pos`. `err` must be `Some` exactly for error handlers.
    fn invoke(
        &self,
        pos: HandlerPos,
        err: Option<ServerError>,
        req: &mut Request,
        res: &mut Response,
        state: &ChainState,
    ) {
        let route = &self.routes[pos.route];
        let handler = &route.handlers()[pos.handler];
        state.invoked.borrow_mut().push(pos);
        let ends_chain =
            err.is_none() && handler.kind() == HandlerKind::Normal && self.next_normal(pos).is_none();

        let outer_params = std::mem::replace(&mut req.params, route.extract_params(&req.path));
        let outer_writer = res.enter(Some(pos));
        let next = Next {
            dispatcher: self,
            pos,
            state,
        };

        let result = panic::catch_unwind(AssertUnwindSafe(|| match (handler, err) {
            (Handler::Normal(f), None) => f(req, res, next),
            (Handler::Error(f), Some(err)) => f(err, req, res, next),
            (Handler::Normal(_), Some(err)) => Err(err),
            (Handler::Error(_), None) => Ok(()),
        }));

        res.enter(outer_writer);
        req.params = outer_params;

        let err = match result {
            Ok(Ok(())) => {
                if ends_chain {
                    state.exhausted.set(true);
                }
                return;
            }
            Ok(Err(err)) => err,
            Err(payload) => {
                let message = panic_message(payload);
                log::error!("Handler at {} panicked: {}", pos, message);
                ServerError::Panic(message)
            }
        };
        log::debug!("{} {}: {} raised: {}", req.method, req.path, pos, err);
        self.raise(pos, err, req, res, state);
    }

    fn raise(
        &self,
        from: HandlerPos,
        err: ServerError,
        req: &mut Request,
        res: &mut Response,
        state: &ChainState,
    ) {
        match self.find_error_handler(from, req.method, &req.path) {
            Some(pos) => self.invoke(pos, Some(err), req, res, state),
            None => {
                log::error!("{} {}: unhandled error from {}: {}", req.method, req.path, from, err);
                state.unhandled.borrow_mut().push(err);
            }
        }
    }

    /// Decide the outcome once the outermost handler returned
    fn settle(&self, req: &Request, res: &mut Response, state: &ChainState) -> Outcome {
        if let Some(err) = state.unhandled.borrow().first() {
            if !res.is_closed() {
                let status = err.status();
                let body = match status {
                    Status::InternalServerError => status.as_str().to_string(),
                    _ => err.to_string(),
                };
                let _ = res.send_text(status, &body);
            }
            return Outcome::Failed;
        }

        if res.is_closed() {
            return Outcome::Responded;
        }

        if state.exhausted.get() {
            let _ = res.send_text(Status::NotFound, &cannot(req));
            return Outcome::ChainExhausted;
        }

        Outcome::Open
    }

    fn report(&self, req: &Request, res: &Response, outcome: Outcome, state: &ChainState) {
        match outcome {
            Outcome::Responded | Outcome::RouteNotFound => log::info!(
                "{} {} -> {} ({})",
                req.method,
                req.path,
                res.status.code(),
                outcome
            ),
            Outcome::ChainExhausted => log::warn!(
                "{} {}: chain ran out without a response, likely a handler bug",
                req.method,
                req.path
            ),
            Outcome::Open => log::warn!(
                "{} {}: handlers returned without responding; exchange left open",
                req.method,
                req.path
            ),
            Outcome::Failed => log::error!(
                "{} {} -> {} after {} unhandled error(s)",
                req.method,
                req.path,
                res.status.code(),
                state.unhandled.borrow().len()
            ),
        }

        if let Some(metrics) = &self.metrics {
            let status = res.is_closed().then(|| res.status.code());
            metrics.record_outcome(outcome.as_str(), status);
            for violation in res.violations() {
                let kind = match violation {
                    ServerError::DoubleResponse { .. } => "double_response",
                    _ => "headers_sent",
                };
                metrics.record_error(kind);
            }
        }
    }
}

fn cannot(req: &Request) -> String {
    format!("Cannot {} {}", req.method, req.path)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::Router;

    fn respond(body: &'static str) -> Handler {
        Handler::terminal(move |_, res| res.send_text(Status::Ok, body))
    }

    fn pass() -> Handler {
        Handler::normal(|req, res, next| {
            next.run(req, res);
            Ok(())
        })
    }

    #[test]
    fn test_error_only_routes_are_skipped_by_normal_flow() {
        let mut router = Router::new();
        router
            .use_all("/", vec![Handler::error(|_, _, _, _| Ok(()))])
            .get("/", vec![respond("root")]);
        let dispatcher = router.into_dispatcher();

        assert_eq!(dispatcher.find_route(Method::Get, "/"), Some(1));
        let exchange = dispatcher.dispatch(Request::new(Method::Get, "/"));
        assert_eq!(exchange.outcome, Outcome::Responded);
        assert_eq!(exchange.response.body_str(), "root");
    }

    #[test]
    fn test_normal_flow_skips_error_handlers_in_chain() {
        let mut router = Router::new();
        router.get(
            "/",
            vec![
                pass(),
                Handler::error(|_, _, res, _| res.send_text(Status::Ok, "error")),
                respond("normal"),
            ],
        );
        let exchange = router
            .into_dispatcher()
            .dispatch(Request::new(Method::Get, "/"));

        assert_eq!(exchange.response.body_str(), "normal");
        assert_eq!(
            exchange.invoked,
            vec![
                HandlerPos { route: 0, handler: 0 },
                HandlerPos { route: 0, handler: 2 }
            ]
        );
    }

    #[test]
    fn test_panic_is_routed_to_error_handler() {
        let mut router = Router::new();
        router
            .get("/boom", vec![Handler::terminal(|_, _| panic!("kaboom"))])
            .use_all(
                "/",
                vec![Handler::error(|err, _, res, _| {
                    res.send_text(Status::InternalServerError, &err.to_string())
                })],
            );
        let exchange = router
            .into_dispatcher()
            .dispatch(Request::new(Method::Get, "/boom"));

        assert_eq!(exchange.outcome, Outcome::Responded);
        assert_eq!(exchange.response.status, Status::InternalServerError);
        assert!(exchange.response.body_str().contains("kaboom"));
    }

    #[test]
    fn test_params_are_scoped_to_the_running_route() {
        let mut router = Router::new();
        router
            .use_all(
                "/user/:id",
                vec![Handler::normal(|req, res, next| {
                    assert_eq!(req.param("id"), Some("7"));
                    next.fail(ServerError::Handler("x".into()), req, res);
                    assert_eq!(req.param("id"), Some("7"));
                    Ok(())
                })],
            )
            .use_all(
                "/",
                vec![Handler::error(|_, req, res, _| {
                    assert!(req.params.is_empty());
                    res.end(Status::NoContent)
                })],
            );
        let exchange = router
            .into_dispatcher()
            .dispatch(Request::new(Method::Get, "/user/7"));

        assert_eq!(exchange.response.status, Status::NoContent);
        assert!(exchange.request.params.is_empty());
    }

    #[test]
    fn test_metrics_record_outcomes() {
        let metrics = Arc::new(MetricsCollector::new());
        let mut router = Router::new();
        router.get("/", vec![respond("ok")]);
        let dispatcher = router.into_dispatcher().with_metrics(metrics.clone());

        dispatcher.dispatch(Request::new(Method::Get, "/"));
        dispatcher.dispatch(Request::new(Method::Get, "/missing"));

        let registry = metrics.registry();
        assert_eq!(registry.counter("exchanges.responded").value(), 1);
        assert_eq!(registry.counter("exchanges.route_not_found").value(), 1);
        assert_eq!(registry.counter("responses.404").value(), 1);
    }
}
