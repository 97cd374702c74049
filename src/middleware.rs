use crate::error::ServerError;
use crate::http::Status;
use crate::router::Handler;
use std::time::Instant;

/// Common middleware

/// Logging middleware - logs the request, then the status once the rest of
/// the chain has returned
pub fn logging_middleware() -> Handler {
    Handler::normal(|req, res, next| {
        let start_time = Instant::now();
        log::info!("[Request] {} {}", req.method, req.uri);

        next.run(req, res);

        let elapsed = start_time.elapsed();
        if res.is_closed() {
            log::info!(
                "[Response] {} {} - {} - {:?}",
                req.method,
                req.uri,
                res.status.code(),
                elapsed
            );
        } else {
            log::debug!("[Pending] {} {} - no response yet - {:?}", req.method, req.uri, elapsed);
        }
        Ok(())
    })
}

/// CORS middleware - stages CORS headers for allowed origins before handing on
pub fn cors_middleware(allowed_origins: Vec<String>) -> Handler {
    Handler::normal(move |req, res, next| {
        if let Some(origin) = req.get_header("origin").cloned() {
            let allowed = allowed_origins.iter().any(|o| o == "*" || *o == origin);
            if allowed {
                res.set_header("Access-Control-Allow-Origin", &origin)?;
                res.set_header(
                    "Access-Control-Allow-Methods",
                    "GET, POST, PUT, PATCH, DELETE",
                )?;
                res.set_header("Access-Control-Allow-Headers", "Content-Type, Authorization")?;
            }
        }

        next.run(req, res);
        Ok(())
    })
}

/// Basic auth middleware - answers 401 unless the credentials match; on
/// success the user name is left in `req.locals["user"]`
pub fn basic_auth_middleware(username: String, password: String) -> Handler {
    Handler::normal(move |req, res, next| {
        let authorized = req
            .get_header("authorization")
            .and_then(|auth| auth.strip_prefix("Basic "))
            .and_then(|encoded| base64::decode(encoded.trim()).ok())
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .map_or(false, |credentials| match credentials.split_once(':') {
                Some((user, pass)) => user == username && pass == password,
                None => false,
            });

        if !authorized {
            res.set_header("WWW-Authenticate", "Basic realm=\"chain-dispatch\"")?;
            return res.send_text(Status::Unauthorized, "Unauthorized Request");
        }

        req.locals
            .insert("user".to_string(), serde_json::Value::from(username.clone()));
        next.run(req, res);
        Ok(())
    })
}

/// JSON body guard - raises `BadRequest` unless the body is a JSON object
/// sent as `application/json`; the parsed body is left in `req.locals["body"]`
pub fn json_body_middleware() -> Handler {
    Handler::normal(|req, res, next| {
        let is_json = req
            .get_header("content-type")
            .map_or(false, |ct| ct.starts_with("application/json"));
        if !is_json {
            return Err(ServerError::BadRequest(
                "Expected an application/json body".to_string(),
            ));
        }

        let body: serde_json::Value = req.json()?;
        if !body.is_object() {
            return Err(ServerError::BadRequest(
                "Expected a JSON object".to_string(),
            ));
        }

        req.locals.insert("body".to_string(), body);
        next.run(req, res);
        Ok(())
    })
}
