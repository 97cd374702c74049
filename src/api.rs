//! Users API mounted on the route table.
//!
//! A chain never falls through to later routes, so every route carries its
//! own middleware (request logging, CORS when configured, auth, JSON guard)
//! in front of the final handler. Errors raised anywhere travel to the JSON error handler
//! registered last.

use crate::config::AdminCredentials;
use crate::error::{ServerError, ServerResult};
use crate::http::{Request, Status};
use crate::middleware::{
    basic_auth_middleware, cors_middleware, json_body_middleware, logging_middleware,
};
use crate::pool::WorkerPool;
use crate::router::{Handler, Router};
use crate::store::{Document, DocumentStore, Filter, FindOptions, ID_FIELD};
use serde_json::{json, Value};
use std::sync::Arc;

/// Fields a user may change through `PATCH /user/:id`
pub const EDITABLE_FIELDS: [&str; 4] = ["name", "skills", "experienceLevel", "location"];

pub const DEFAULT_PAGE_SIZE: usize = 10;
pub const MAX_PAGE_SIZE: usize = 50;

/// Upper bound for `POST /work/primes`
pub const MAX_PRIME_LIMIT: u64 = 10_000_000;

/// Collaborators shared by the API handlers
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn DocumentStore>,
    pub pool: Arc<WorkerPool>,
    pub admin: Option<AdminCredentials>,
    /// Origins answered with CORS headers; empty disables the middleware
    pub cors_origins: Vec<String>,
}

impl ApiState {
    /// Shared middleware followed by the route's own handlers
    fn chain(&self, handlers: Vec<Handler>) -> Vec<Handler> {
        let mut chain = vec![logging_middleware()];
        if !self.cors_origins.is_empty() {
            chain.push(cors_middleware(self.cors_origins.clone()));
        }
        chain.extend(handlers);
        chain
    }
}

/// Register the users API on `router`
pub fn mount(router: &mut Router, state: ApiState) {
    if let Some(admin) = &state.admin {
        let auth = || basic_auth_middleware(admin.username.clone(), admin.password.clone());
        router
            .get(
                "/admin/users",
                state.chain(vec![auth(), list_users(state.store.clone())]),
            )
            .delete(
                "/admin/users/:id",
                state.chain(vec![auth(), delete_user(state.store.clone())]),
            );
    }

    router
        .post(
            "/signup",
            state.chain(vec![json_body_middleware(), signup(state.store.clone())]),
        )
        // Before `/user`, which would otherwise claim `/user/feed` by prefix
        .get("/user/feed", state.chain(vec![feed(state.store.clone())]))
        .get("/user", state.chain(vec![find_by_email(state.store.clone())]))
        .patch(
            "/user/:id",
            state.chain(vec![json_body_middleware(), update_user(state.store.clone())]),
        )
        .delete("/user/:id", state.chain(vec![delete_user(state.store.clone())]))
        .post(
            "/work/primes",
            state.chain(vec![json_body_middleware(), count_primes_job(state.pool.clone())]),
        )
        .use_all("/", vec![json_error_handler()]);
}

/// Renders any error as `{success: false, message}` with the error's status
pub fn json_error_handler() -> Handler {
    Handler::error(|err, req, res, _next| {
        if res.is_closed() {
            log::warn!(
                "{} {}: error after the response was sent: {}",
                req.method,
                req.path,
                err
            );
            return Ok(());
        }

        let status = err.status();
        let message = match status {
            Status::InternalServerError => {
                log::error!("{} {}: {}", req.method, req.path, err);
                status.as_str().to_string()
            }
            _ => err.to_string(),
        };
        res.send_json(status, &json!({ "success": false, "message": message }))
    })
}

fn signup(store: Arc<dyn DocumentStore>) -> Handler {
    Handler::terminal(move |req, res| {
        let user = body_object(req)?;
        validate_signup(&user)?;

        let saved = store.save_unique("email", user)?.ok_or_else(|| {
            ServerError::BadRequest("Email is already registered".to_string())
        })?;
        log::info!("Signed up user {}", id_value(&saved));
        res.send_json(
            Status::Created,
            &json!({
                "success": true,
                "name": saved.get("name"),
                "email": saved.get("email"),
                "_id": saved.get(ID_FIELD),
            }),
        )
    })
}

fn feed(store: Arc<dyn DocumentStore>) -> Handler {
    Handler::terminal(move |req, res| {
        let page = positive_query(req, "page").unwrap_or(1);
        let limit = positive_query(req, "limit")
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .min(MAX_PAGE_SIZE);

        let users: Vec<Document> = store
            .find(&Filter::new(), FindOptions::page(page, limit))?
            .into_iter()
            .map(public_view)
            .collect();

        res.send_json(
            Status::Ok,
            &json!({ "success": true, "page": page, "limit": limit, "users": users }),
        )
    })
}

fn find_by_email(store: Arc<dyn DocumentStore>) -> Handler {
    Handler::terminal(move |req, res| {
        let email = req
            .query_param("email")
            .filter(|email| !email.is_empty())
            .ok_or_else(|| ServerError::BadRequest("email query parameter is required".to_string()))?;

        let mut filter = Filter::new();
        filter.insert("email".to_string(), Value::from(email));
        let user = store
            .find(&filter, FindOptions::default())?
            .into_iter()
            .next()
            .ok_or_else(|| ServerError::NotFound(format!("No user with email {}", email)))?;

        res.send_json(Status::Ok, &json!({ "success": true, "user": public_view(user) }))
    })
}

fn update_user(store: Arc<dyn DocumentStore>) -> Handler {
    Handler::terminal(move |req, res| {
        let id = user_id(req)?;
        let changes = body_object(req)?;
        validate_edit(&changes)?;

        let updated = store
            .update_one(&id, changes)?
            .ok_or_else(|| ServerError::NotFound(format!("No user with id {}", id)))?;

        res.send_json(Status::Ok, &json!({ "success": true, "user": public_view(updated) }))
    })
}

fn delete_user(store: Arc<dyn DocumentStore>) -> Handler {
    Handler::terminal(move |req, res| {
        let id = user_id(req)?;
        store
            .delete_one(&id)?
            .ok_or_else(|| ServerError::NotFound(format!("No user with id {}", id)))?;

        log::info!("Deleted user {}", id);
        res.send_json(Status::Ok, &json!({ "success": true, "_id": id }))
    })
}

fn list_users(store: Arc<dyn DocumentStore>) -> Handler {
    Handler::terminal(move |_req, res| {
        let users: Vec<Document> = store
            .find(&Filter::new(), FindOptions::default())?
            .into_iter()
            .map(public_view)
            .collect();
        res.send_json(Status::Ok, &json!({ "success": true, "users": users }))
    })
}

fn count_primes_job(pool: Arc<WorkerPool>) -> Handler {
    Handler::terminal(move |req, res| {
        let limit = body_object(req)?
            .get("limit")
            .and_then(Value::as_u64)
            .filter(|limit| *limit <= MAX_PRIME_LIMIT)
            .ok_or_else(|| {
                ServerError::BadRequest(format!(
                    "limit must be an integer between 0 and {}",
                    MAX_PRIME_LIMIT
                ))
            })?;

        // Dispatch runs off the async reactor, so blocking on the job is fine
        let primes = pool.submit(move || count_primes(limit))?.wait()?;
        res.send_json(Status::Ok, &json!({ "limit": limit, "primes": primes }))
    })
}

/// Number of primes strictly below `limit`
pub fn count_primes(limit: u64) -> u64 {
    if limit < 3 {
        return 0;
    }
    let limit = limit as usize;
    let mut composite = vec![false; limit];
    let mut count = 0;
    for n in 2..limit {
        if composite[n] {
            continue;
        }
        count += 1;
        let mut multiple = n * n;
        while multiple < limit {
            composite[multiple] = true;
            multiple += n;
        }
    }
    count
}

fn body_object(req: &Request) -> ServerResult<Document> {
    req.locals
        .get("body")
        .and_then(Value::as_object)
        .cloned()
        .ok_or_else(|| ServerError::BadRequest("Expected a JSON object body".to_string()))
}

fn user_id(req: &Request) -> ServerResult<String> {
    req.param("id")
        .map(str::to_string)
        .ok_or_else(|| ServerError::BadRequest("Missing user id".to_string()))
}

fn positive_query(req: &Request, name: &str) -> Option<usize> {
    req.query_param(name)
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
}

fn id_value(document: &Document) -> &str {
    document
        .get(ID_FIELD)
        .and_then(Value::as_str)
        .unwrap_or_default()
}

/// The document without its password
fn public_view(mut document: Document) -> Document {
    document.remove("password");
    document
}

fn non_empty_str<'a>(user: &'a Document, field: &str) -> Option<&'a str> {
    user.get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn validate_signup(user: &Document) -> ServerResult<()> {
    let missing: Vec<&str> = ["name", "email", "password"]
        .into_iter()
        .filter(|field| non_empty_str(user, field).is_none())
        .chain((!user.contains_key("skills")).then_some("skills"))
        .collect();
    if !missing.is_empty() {
        return Err(ServerError::BadRequest(format!(
            "Missing required fields: {}",
            missing.join(", ")
        )));
    }

    if !non_empty_str(user, "email").map_or(false, is_email) {
        return Err(ServerError::BadRequest("Email is invalid".to_string()));
    }

    validate_skills(user)
}

fn validate_skills(user: &Document) -> ServerResult<()> {
    match user.get("skills") {
        None => Ok(()),
        Some(Value::Array(skills)) if !skills.is_empty() && skills.iter().all(Value::is_string) => {
            Ok(())
        }
        Some(_) => Err(ServerError::BadRequest(
            "skills must be a non-empty list of strings".to_string(),
        )),
    }
}

fn validate_edit(changes: &Document) -> ServerResult<()> {
    let rejected: Vec<&str> = changes
        .keys()
        .map(String::as_str)
        .filter(|field| !EDITABLE_FIELDS.contains(field))
        .collect();
    if !rejected.is_empty() {
        return Err(ServerError::BadRequest(format!(
            "Fields cannot be edited: {}",
            rejected.join(", ")
        )));
    }
    validate_skills(changes)
}

/// `local@domain.tld` with no whitespace
fn is_email(email: &str) -> bool {
    let (local, domain) = match email.split_once('@') {
        Some(parts) => parts,
        None => return false,
    };
    !local.is_empty()
        && !email.chars().any(char::is_whitespace)
        && !domain.contains('@')
        && domain
            .split_once('.')
            .map_or(false, |(host, tld)| !host.is_empty() && tld.len() >= 2 && !tld.ends_with('.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_count_primes() {
        assert_eq!(count_primes(0), 0);
        assert_eq!(count_primes(2), 0);
        assert_eq!(count_primes(3), 1);
        assert_eq!(count_primes(10), 4);
        assert_eq!(count_primes(100), 25);
    }

    #[test]
    fn test_is_email() {
        assert!(is_email("ada@example.com"));
        assert!(is_email("a.b+c@mail.example.org"));
        assert!(!is_email("ada"));
        assert!(!is_email("@example.com"));
        assert!(!is_email("ada@example"));
        assert!(!is_email("ada@@example.com"));
        assert!(!is_email("a da@example.com"));
    }

    #[test]
    fn test_validate_signup_lists_missing_fields() {
        let err = validate_signup(&doc(json!({"name": "Ada"}))).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("email"));
        assert!(message.contains("password"));
        assert!(message.contains("skills"));
        assert!(!message.contains("name"));
    }

    #[test]
    fn test_validate_signup_rejects_empty_skills() {
        let user = doc(json!({
            "name": "Ada", "email": "ada@example.com", "password": "pw", "skills": []
        }));
        assert!(matches!(validate_signup(&user), Err(ServerError::BadRequest(_))));
    }

    #[test]
    fn test_validate_edit_allows_only_editable_fields() {
        assert!(validate_edit(&doc(json!({"location": "Pune", "skills": ["rust"]}))).is_ok());
        let err = validate_edit(&doc(json!({"email": "x@y.io"}))).unwrap_err();
        assert!(err.to_string().contains("email"));
    }

    #[test]
    fn test_public_view_drops_password() {
        let view = public_view(doc(json!({"name": "Ada", "password": "pw"})));
        assert!(!view.contains_key("password"));
        assert_eq!(view.get("name"), Some(&Value::from("Ada")));
    }
}
