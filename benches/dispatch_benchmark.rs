use chain_dispatch::dispatch::Dispatcher;
use chain_dispatch::http::{HttpParser, Method, Request, Response, Status};
use chain_dispatch::router::{Handler, Router};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn pass() -> Handler {
    Handler::normal(|req, res, next| {
        next.run(req, res);
        Ok(())
    })
}

/// `routes` decoy routes ahead of a chain of `depth` pass-through handlers
fn build_dispatcher(routes: usize, depth: usize) -> Dispatcher {
    let mut router = Router::new();
    for i in 0..routes {
        let body = format!("decoy {}", i);
        router.get(
            &format!("/decoy{}", i),
            vec![Handler::terminal(move |_, res| res.send_text(Status::Ok, &body))],
        );
    }

    let mut chain: Vec<Handler> = (0..depth).map(|_| pass()).collect();
    chain.push(Handler::terminal(|req, res| {
        let id = req.param("id").unwrap_or_default().to_string();
        res.send_text(Status::Ok, &id)
    }));
    router.get("/user/:id", chain);
    router.into_dispatcher()
}

fn benchmark_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch");

    let shallow = build_dispatcher(0, 1);
    group.bench_function("single_route_short_chain", |b| {
        b.iter(|| {
            let exchange = shallow.dispatch(black_box(Request::new(Method::Get, "/user/42")));
            assert!(exchange.response.is_closed());
        })
    });

    let deep = build_dispatcher(50, 16);
    group.bench_function("fifty_decoys_deep_chain", |b| {
        b.iter(|| {
            let exchange = deep.dispatch(black_box(Request::new(Method::Get, "/user/42")));
            assert_eq!(exchange.invoked.len(), 17);
        })
    });

    group.bench_function("error_routing", |b| {
        let mut router = Router::new();
        router
            .get(
                "/fail",
                vec![pass(), Handler::terminal(|_, _| {
                    Err(chain_dispatch::ServerError::Handler("bench".to_string()))
                })],
            )
            .use_all(
                "/",
                vec![Handler::error(|err, _, res, _| res.send_text(err.status(), "handled"))],
            );
        let dispatcher = router.into_dispatcher();
        b.iter(|| {
            let exchange = dispatcher.dispatch(black_box(Request::new(Method::Get, "/fail")));
            assert_eq!(exchange.response.status, Status::InternalServerError);
        })
    });

    group.finish();
}

fn benchmark_http_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("http_parser");

    let complex_request = "POST /signup HTTP/1.1\r\n\
                          Host: example.com\r\n\
                          Content-Type: application/json\r\n\
                          Content-Length: 27\r\n\
                          User-Agent: Benchmark\r\n\
                          Accept: */*\r\n\
                          \r\n\
                          {\"name\":\"test\",\"value\":123}";

    group.bench_function("parse_complex_request", |b| {
        b.iter(|| {
            let mut parser = HttpParser::new();
            parser.parse(complex_request.as_bytes()).unwrap();
            let request = parser.get_request().unwrap();
            assert_eq!(request.body.len(), 27);
        })
    });

    group.finish();
}

fn benchmark_response_serialization(c: &mut Criterion) {
    let mut group = c.benchmark_group("response");

    group.bench_function("json_response", |b| {
        b.iter(|| {
            let mut response = Response::new();
            response.set_header("Cache-Control", "no-cache").unwrap();
            response
                .send_json(
                    Status::Ok,
                    &serde_json::json!({"success": true, "data": {"items": [1, 2, 3, 4, 5]}}),
                )
                .unwrap();

            let mut buffer = Vec::new();
            response.serialize(&mut buffer).unwrap();
            assert!(!buffer.is_empty());
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_dispatch,
    benchmark_http_parsing,
    benchmark_response_serialization
);
criterion_main!(benches);
