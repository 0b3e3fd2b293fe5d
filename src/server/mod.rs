use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{middleware, routing::get, Router as AxumRouter};
use axum_server::{tls_rustls::RustlsConfig, Handle};
use log::{info, warn};
use tokio::net::TcpListener;
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
};

use crate::rooms::router::SyncContext;

pub mod api;
pub mod csrf;
pub mod docs;
pub mod errors;
pub mod ws;

use self::{api::FileCache, csrf::CsrfTokens};
use crate::rate_limit::HttpRateLimiter;

/// How long active handlers get to finish during shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub type Router = AxumRouter<AppState>;

#[derive(Clone)]
pub struct AppState {
    pub context: SyncContext,
    pub csrf: Arc<CsrfTokens>,
    pub http_limiter: Arc<HttpRateLimiter>,
    pub files: Arc<FileCache>,
}

/// Assembles the HTTP surface and serves it until shutdown.
pub async fn run_server(context: SyncContext) {
    let state = AppState {
        context: context.clone(),
        csrf: Arc::new(CsrfTokens::default()),
        http_limiter: Arc::new(HttpRateLimiter::default()),
        files: Arc::new(FileCache::default()),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let router = Router::new()
        .merge(api::router())
        .merge(ws::router())
        .route("/api.json", get(docs::docs))
        .nest_service(
            "/thumbnails",
            ServeDir::new(context.store.thumbnail_dir()),
        )
        .nest_service("/static", ServeDir::new(&context.config.web_dir))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            csrf::csrf_middleware,
        ))
        .with_state(state)
        .layer(cors);

    let addr: SocketAddr = ([0, 0, 0, 0], context.config.port).into();
    let service = router.into_make_service_with_connect_info::<SocketAddr>();

    let use_tls = context.config.use_https
        && context.config.tls_cert.exists()
        && context.config.tls_key.exists();

    if context.config.use_https && !use_tls {
        warn!("use_https is set but certificate or key is missing, serving plain HTTP");
    }

    if use_tls {
        let tls = RustlsConfig::from_pem_file(&context.config.tls_cert, &context.config.tls_key)
            .await
            .expect("TLS material loads");

        let handle = Handle::new();
        tokio::spawn(shutdown_signal(context.clone(), Some(handle.clone())));

        info!("Listening on https://{}", addr);

        axum_server::bind_rustls(addr, tls)
            .handle(handle)
            .serve(service)
            .await
            .expect("server binds");
    } else {
        let listener = TcpListener::bind(&addr).await.expect("server binds");

        info!("Listening on http://{}", addr);

        axum::serve(listener, service)
            .with_graceful_shutdown(shutdown_signal(context, None))
            .await
            .expect("server runs");
    }
}

/// Waits for ctrl-c, tells every room and closes the gateway, then gives
/// active handlers a bounded window before the process is forced out.
async fn shutdown_signal(context: SyncContext, handle: Option<Handle>) {
    let _ = tokio::signal::ctrl_c().await;

    info!("Shutting down...");
    context.rooms.notify_shutdown();
    context.gateway.shutdown();

    if let Some(handle) = &handle {
        handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
    }

    tokio::spawn(async {
        tokio::time::sleep(SHUTDOWN_GRACE).await;
        std::process::exit(0);
    });
}
