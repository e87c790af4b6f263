use std::{any::Any, net::SocketAddr};

use anyhow::Context;
use axum::{
    http::{header, HeaderValue, Method},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio_util::sync::CancellationToken;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::warn;

use crate::auth::{
    self,
    gates::{self, AccessLevel},
};
use crate::config::AppConfig;
use crate::error::ApiError;
use crate::metrics;
use crate::routes::{
    debug::debug_vars, health::healthcheck, me::me_route, users::list_users,
};
use crate::state::AppState;

/// Every route with the access level it requires. Gates are route layers,
/// so they only run for matched routes.
pub fn api_routes() -> Router<AppState> {
    let public = Router::new()
        .route("/healthcheck", get(healthcheck))
        .merge(auth::router());
    let authenticated = Router::new().route("/me", get(me_route));
    let admin = Router::new().route("/users", get(list_users));

    Router::new()
        .merge(gated(
            Router::new().route("/", get(healthcheck)),
            AccessLevel::Activated,
        ))
        .merge(gated(
            Router::new().route("/debug/vars", get(debug_vars)),
            AccessLevel::Anonymous,
        ))
        .nest(
            "/v1",
            Router::new()
                .merge(gated(public, AccessLevel::Anonymous))
                .merge(gated(authenticated, AccessLevel::Authenticated))
                .merge(gated(admin, AccessLevel::Admin)),
        )
}

fn gated(routes: Router<AppState>, level: AccessLevel) -> Router<AppState> {
    routes.route_layer(middleware::from_fn_with_state(level, gates::enforce))
}

pub fn build_app(state: AppState) -> Router {
    assemble(api_routes(), state)
}

/// Put `routes` behind `authenticate` and the HTTP layers.
fn assemble(routes: Router<AppState>, state: AppState) -> Router {
    let router = routes
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::middleware::authenticate,
        ))
        .with_state(state.clone());
    with_http_layers(router, &state)
}

fn with_http_layers(router: Router, state: &AppState) -> Router {
    router
        .layer(cors_layer(&state.config.cors_trusted_origins))
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(middleware::from_fn_with_state(
            state.metrics.clone(),
            metrics::track,
        ))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    let method = req.method().clone();
                    let uri = req.uri().clone();
                    tracing::info_span!(
                        "http_request",
                        %method,
                        uri = %uri,
                        status = tracing::field::Empty
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     span: &tracing::Span| {
                        let status = res.status();
                        span.record("status", tracing::field::display(status));
                        let latency_ms = latency.as_millis() as u64;
                        if status.is_server_error() {
                            tracing::error!(%status, latency_ms, "response");
                        } else {
                            tracing::info!(%status, latency_ms, "response");
                        }
                    },
                ),
        )
}

/// No trusted origins configured means any origin is allowed.
fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::permissive();
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(%origin, "ignoring unparsable CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
}

/// A panicking request gets a plain 500 and its connection is closed.
fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        "unknown panic payload".to_string()
    };
    let mut response = ApiError::internal(format!("request handler panicked: {detail}")).into_response();
    response
        .headers_mut()
        .insert(header::CONNECTION, HeaderValue::from_static("close"));
    response
}

pub async fn serve(app: Router, config: &AppConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", config.host, config.port))?;

    tracing::info!(%addr, env = %config.env, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::{body::Body, http::Request, http::StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::auth::{
        context::CurrentPrincipal,
        password::Password,
        repo_types::{NewUser, Role, User},
        tokens::{self, Scope},
    };
    use crate::mailer::{Mailer, Notification};
    use crate::memory::MemoryStore;

    #[derive(Default)]
    struct RecordingMailer {
        sent: Mutex<Vec<Notification>>,
    }

    #[async_trait]
    impl Mailer for RecordingMailer {
        async fn send(&self, message: &Notification) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    fn test_state() -> (AppState, Arc<RecordingMailer>) {
        let config = AppConfig::from_source(|key| match key {
            "STORE_BACKEND" => Some("memory".into()),
            "APP_ENV" => Some("test".into()),
            _ => None,
        })
        .unwrap();
        let mailer = Arc::new(RecordingMailer::default());
        let state = AppState::from_parts(
            Arc::new(MemoryStore::new()),
            Arc::new(config),
            mailer.clone(),
        );
        (state, mailer)
    }

    async fn send(
        app: &Router,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> (StatusCode, axum::http::HeaderMap, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let req = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let res = app.clone().oneshot(req).await.unwrap();
        let status = res.status();
        let headers = res.headers().clone();
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, headers, json)
    }

    /// Insert a user directly and hand back a live authentication token.
    async fn seed_user(state: &AppState, email: &str, active: bool, role: Role) -> String {
        let mut user = User::register(NewUser {
            first_name: "Seed".into(),
            last_name: "User".into(),
            username: "seed".into(),
            email: email.into(),
            password: Password::from_hash("unused"),
        });
        user.active = active;
        user.role = role;
        let user = state.store.insert_user(&user).await.unwrap();
        let issued = tokens::generate(user.id, time::Duration::hours(1), Scope::Authentication).unwrap();
        state.store.insert_token(&issued.record).await.unwrap();
        issued.plaintext
    }

    async fn register(app: &Router, email: &str, password: &str) -> (StatusCode, Value) {
        let (status, _, body) = send(
            app,
            Method::POST,
            "/v1/users",
            Some(json!({
                "firstname": "Ada",
                "lastname": "Lovelace",
                "username": "ada",
                "email": email,
                "password": password,
            })),
            None,
        )
        .await;
        (status, body)
    }

    async fn wait_for_mail(mailer: &RecordingMailer) -> Notification {
        for _ in 0..100 {
            if let Some(n) = mailer.sent.lock().unwrap().last().cloned() {
                return n;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no notification was sent");
    }

    #[tokio::test]
    async fn healthcheck_is_open_to_anonymous_callers() {
        let (state, _) = test_state();
        let app = build_app(state);
        let (status, headers, body) = send(&app, Method::GET, "/v1/healthcheck", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "available");
        assert_eq!(body["environment"], "test");
        assert!(headers
            .get_all(header::VARY)
            .iter()
            .any(|v| v == "Authorization"));
    }

    #[tokio::test]
    async fn ungated_handler_sees_anonymous_principal() {
        let (state, _) = test_state();
        let routes = api_routes().route(
            "/whoami",
            get(|CurrentPrincipal(p): CurrentPrincipal| async move {
                if p.is_anonymous() { "anonymous" } else { "identified" }
            }),
        );
        let app = assemble(routes, state);
        let req = Request::builder().uri("/whoami").body(Body::empty()).unwrap();
        let res = app.oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"anonymous");
    }

    #[tokio::test]
    async fn register_activate_login_and_me() {
        let (state, mailer) = test_state();
        let app = build_app(state);

        let (status, body) = register(&app, " Ada@Example.com ", "pa55word-long").await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["user"]["email"], "ada@example.com");
        assert_eq!(body["user"]["active"], false);
        assert!(body["user"].get("password").is_none());

        let mail = wait_for_mail(&mailer).await;
        assert_eq!(mail.template, "user_welcome");
        assert_eq!(mail.recipient, "ada@example.com");

        let (status, _, body) = send(
            &app,
            Method::POST,
            "/v1/users/activated",
            Some(json!({ "token": mail.activation_token })),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["user"]["active"], true);

        // activation tokens are single use
        let (status, _, body) = send(
            &app,
            Method::POST,
            "/v1/users/activated",
            Some(json!({ "token": mail.activation_token })),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["field"], "token");

        let (status, _, body) = send(
            &app,
            Method::POST,
            "/v1/token/authenticate",
            Some(json!({ "email": "ada@example.com", "password": "pa55word-long" })),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let token = body["authentication_token"]["token"].as_str().unwrap().to_string();
        assert_eq!(token.len(), tokens::PLAINTEXT_LEN);
        assert!(body["authentication_token"]["expiry"].is_string());

        let (status, _, body) = send(&app, Method::GET, "/v1/me", None, Some(&token)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["user"]["email"], "ada@example.com");

        // authentication tokens survive reuse
        let (status, _, _) = send(&app, Method::GET, "/v1/me", None, Some(&token)).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn duplicate_email_conflicts() {
        let (state, _) = test_state();
        let app = build_app(state);
        assert_eq!(register(&app, "dup@example.com", "pa55word-long").await.0, StatusCode::CREATED);
        let (status, body) = register(&app, "DUP@example.com", "pa55word-long").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "duplicate_email");
    }

    #[tokio::test]
    async fn invalid_registration_reports_the_field() {
        let (state, _) = test_state();
        let app = build_app(state);
        let (status, body) = register(&app, "not-an-email", "pa55word-long").await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["code"], "validation_failed");
        assert_eq!(body["field"], "email");
    }

    #[tokio::test]
    async fn wrong_password_gets_no_token() {
        let (state, _) = test_state();
        let app = build_app(state);
        register(&app, "bob@example.com", "correct-horse").await;

        let (status, _, body) = send(
            &app,
            Method::POST,
            "/v1/token/authenticate",
            Some(json!({ "email": "bob@example.com", "password": "battery-staple" })),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "invalid_credentials");
        assert!(body.get("authentication_token").is_none());

        let (status, _, body) = send(
            &app,
            Method::POST,
            "/v1/token/authenticate",
            Some(json!({ "email": "nobody@example.com", "password": "battery-staple" })),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "invalid_credentials");
    }

    #[tokio::test]
    async fn inactive_account_cannot_log_in() {
        let (state, _) = test_state();
        let app = build_app(state);
        register(&app, "carol@example.com", "pa55word-long").await;

        let (status, _, body) = send(
            &app,
            Method::POST,
            "/v1/token/authenticate",
            Some(json!({ "email": "carol@example.com", "password": "pa55word-long" })),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "account_inactive");
    }

    #[tokio::test]
    async fn anonymous_request_to_gated_route_needs_authentication() {
        let (state, _) = test_state();
        let app = build_app(state);
        let (status, headers, body) = send(&app, Method::GET, "/v1/me", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "authentication_required");
        assert_eq!(headers.get(header::WWW_AUTHENTICATE).unwrap(), "Bearer");
    }

    #[tokio::test]
    async fn malformed_header_is_rejected_even_on_open_routes() {
        let (state, _) = test_state();
        let app = build_app(state);
        let req = Request::builder()
            .uri("/v1/healthcheck")
            .header(header::AUTHORIZATION, "Basic dXNlcjpwYXNz")
            .body(Body::empty())
            .unwrap();
        let res = app.oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(res.headers().get(header::WWW_AUTHENTICATE).unwrap(), "Bearer");
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["code"], "invalid_credential_format");
    }

    #[tokio::test]
    async fn unknown_token_is_rejected() {
        let (state, _) = test_state();
        let app = build_app(state);
        let (status, _, body) = send(
            &app,
            Method::GET,
            "/v1/healthcheck",
            None,
            Some("ABCDEFGHIJKLMNOPQRSTUVWXYZ"),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "invalid_or_expired_token");
    }

    #[tokio::test]
    async fn admin_gate_checks_activation_before_role() {
        let (state, _) = test_state();
        let inactive_admin = seed_user(&state, "ia@example.com", false, Role::Admin).await;
        let standard = seed_user(&state, "std@example.com", true, Role::Standard).await;
        let admin = seed_user(&state, "admin@example.com", true, Role::Admin).await;
        let app = build_app(state);

        let (status, _, body) = send(&app, Method::GET, "/v1/users", None, Some(&inactive_admin)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "account_inactive");

        let (status, _, body) = send(&app, Method::GET, "/v1/users", None, Some(&standard)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "insufficient_role");

        let (status, _, body) = send(&app, Method::GET, "/v1/users", None, Some(&admin)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["users"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn inactive_user_passes_the_authenticated_gate() {
        let (state, _) = test_state();
        let token = seed_user(&state, "new@example.com", false, Role::Standard).await;
        let app = build_app(state);
        let (status, _, body) = send(&app, Method::GET, "/v1/me", None, Some(&token)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["user"]["active"], false);
    }

    #[tokio::test]
    async fn missing_authenticate_layer_fails_closed() {
        let (state, _) = test_state();
        let app = with_http_layers(api_routes().with_state(state.clone()), &state);

        let (status, headers, body) = send(&app, Method::GET, "/v1/me", None, None).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["code"], "internal_error");
        assert_eq!(headers.get(header::CONNECTION).unwrap(), "close");
    }

    async fn preflight(app: Router, origin: &str) -> Option<HeaderValue> {
        let req = Request::builder()
            .method(Method::OPTIONS)
            .uri("/v1/token/authenticate")
            .header(header::ORIGIN, origin)
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .body(Body::empty())
            .unwrap();
        let res = app.oneshot(req).await.unwrap();
        res.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).cloned()
    }

    #[tokio::test]
    async fn trusted_origins_are_the_only_ones_allowed() {
        let cors = cors_layer(&[
            "https://app.example.com".to_string(),
            "https://bad\u{7f}.example.com".to_string(),
        ]);
        let app = Router::new()
            .route("/v1/token/authenticate", axum::routing::post(|| async { "ok" }))
            .layer(cors);

        assert_eq!(
            preflight(app.clone(), "https://app.example.com").await.unwrap(),
            "https://app.example.com"
        );
        assert!(preflight(app.clone(), "https://evil.example.com").await.is_none());
        assert!(preflight(app, "https://bad.example.com").await.is_none());
    }

    #[tokio::test]
    async fn configured_origins_reach_the_app() {
        let config = AppConfig::from_source(|key| match key {
            "STORE_BACKEND" => Some("memory".into()),
            "CORS_TRUSTED_ORIGINS" => Some("https://app.example.com https://admin.example.com".into()),
            _ => None,
        })
        .unwrap();
        let state = AppState::from_parts(
            Arc::new(MemoryStore::new()),
            Arc::new(config),
            Arc::new(RecordingMailer::default()),
        );
        let app = build_app(state);

        assert_eq!(
            preflight(app.clone(), "https://admin.example.com").await.unwrap(),
            "https://admin.example.com"
        );
        assert!(preflight(app, "https://evil.example.com").await.is_none());
    }

    #[tokio::test]
    async fn empty_origin_list_allows_any_origin() {
        let (state, _) = test_state();
        let app = build_app(state);
        assert_eq!(preflight(app, "https://anywhere.example").await.unwrap(), "*");
    }

    #[tokio::test]
    async fn root_status_requires_an_activated_account() {
        let (state, _) = test_state();
        let inactive = seed_user(&state, "fresh@example.com", false, Role::Standard).await;
        let active = seed_user(&state, "ready@example.com", true, Role::Standard).await;
        let app = build_app(state);

        let (status, _, body) = send(&app, Method::GET, "/", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "authentication_required");

        let (status, _, body) = send(&app, Method::GET, "/", None, Some(&inactive)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "account_inactive");

        let (status, _, body) = send(&app, Method::GET, "/", None, Some(&active)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "available");
    }

    #[tokio::test]
    async fn debug_vars_count_requests_and_statuses() {
        let (state, _) = test_state();
        let app = build_app(state);

        send(&app, Method::GET, "/v1/healthcheck", None, None).await;
        send(&app, Method::GET, "/v1/me", None, None).await;
        send(&app, Method::GET, "/v1/healthcheck", None, Some("ABCDEFGHIJKLMNOPQRSTUVWXYZ")).await;

        let (status, _, body) = send(&app, Method::GET, "/debug/vars", None, None).await;
        assert_eq!(status, StatusCode::OK);
        // the /debug/vars request itself is received but not yet sent
        assert_eq!(body["total_requests_received"], 4);
        assert_eq!(body["total_responses_sent"], 3);
        assert_eq!(body["total_responses_sent_by_status"]["200"], 1);
        assert_eq!(body["total_responses_sent_by_status"]["401"], 2);
        assert!(body["total_processing_time_μs"].is_u64());
        assert!(body["timestamp"].is_i64());
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn caught_panics_are_counted_as_server_errors() {
        let (state, _) = test_state();
        let app = with_http_layers(api_routes().with_state(state.clone()), &state);
        send(&app, Method::GET, "/v1/me", None, None).await;

        let snap = state.metrics.snapshot();
        assert_eq!(snap.total_responses_sent, 1);
        assert_eq!(snap.total_responses_sent_by_status["500"], 1);
    }
}
