//! Apple MDM server binary.
//!
//! Composes storage, the check-in engine, the cert-auth middleware, and the
//! admin API into one axum listener. Configuration comes from the
//! environment; see [`config::Config`].

mod config;

use std::sync::Arc;

use aspen_crypto::CertVerifier;
use aspen_http::{
    basic_auth_middleware, cert_extract_header_middleware,
    cert_extract_mdm_signature_middleware, cert_verify_middleware, checkin_and_command_handler,
    checkin_handler, enqueue_handler, escrow_key_unlock_handler, push_handler,
    store_push_cert_handler, version_handler, ApiAuth, ApiState,
};
use aspen_push::{ApnsProviderFactory, PushService};
use aspen_service::{
    CertAuthMiddleware, CheckinAndCommand, DeclarativeManagementHandler, DmHttpCaller, Dumper,
    Engine, MultiService, Webhook,
};
use aspen_storage::{AllStorage, InMemStorage, SqliteStorage};
use axum::routing::{get, post, put};
use axum::Router;
use color_eyre::eyre::WrapErr as _;
use config::{Config, StorageKind};
use tower_http::trace::TraceLayer;

const API_USERNAME: &str = "aspen";

#[tokio::main]
async fn main() -> color_eyre::eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cfg = Config::from_env().wrap_err("loading configuration")?;

    match cfg.storage {
        StorageKind::InMem => {
            tracing::info!(storage = "inmem", "storage setup");
            run(InMemStorage::new(), cfg).await
        }
        StorageKind::Sqlite => {
            tracing::info!(storage = "sqlite", dsn = %cfg.storage_dsn, "storage setup");
            let storage = SqliteStorage::new(&cfg.storage_dsn)
                .wrap_err("initializing storage")?
                .with_command_deletion(cfg.command_deletion());
            storage.run_migrations().wrap_err("running migrations")?;
            run(storage, cfg).await
        }
    }
}

async fn run<S>(storage: S, cfg: Config) -> color_eyre::eyre::Result<()>
where
    S: AllStorage + Clone + 'static,
{
    let engine = Engine::new(storage.clone());
    match &cfg.dm_url {
        Some(url) => {
            let dm = DmHttpCaller::new(url).wrap_err("configuring Declarative Management")?;
            compose(engine.with_declarative_management(dm), storage, cfg).await
        }
        None => compose(engine, storage, cfg).await,
    }
}

async fn compose<S, D>(
    engine: Engine<S, D>,
    storage: S,
    cfg: Config,
) -> color_eyre::eyre::Result<()>
where
    S: AllStorage + Clone + 'static,
    D: DeclarativeManagementHandler + 'static,
{
    let mut secondaries: Vec<Arc<Webhook>> = Vec::new();
    if let Some(url) = &cfg.webhook_url {
        let tally: Arc<dyn aspen_storage::TokenUpdateTallyStore> = Arc::new(storage.clone());
        secondaries.push(Arc::new(
            Webhook::new(url).with_token_update_tally(tally),
        ));
    }
    let multi = MultiService::new(engine, secondaries);
    let mut certauth = CertAuthMiddleware::new(storage.clone(), multi);
    if cfg.retro {
        certauth = certauth.with_retroactive();
    }

    if cfg.dump {
        serve(Arc::new(Dumper::new(certauth, std::io::stdout())), storage, cfg).await
    } else {
        serve(Arc::new(certauth), storage, cfg).await
    }
}

async fn serve<M, S>(service: Arc<M>, storage: S, cfg: Config) -> color_eyre::eyre::Result<()>
where
    M: CheckinAndCommand + 'static,
    S: AllStorage + Clone + 'static,
{
    let verifier: Arc<dyn CertVerifier> =
        Arc::new(cfg.load_verifier().wrap_err("loading trust anchors")?);

    // device-facing endpoints: cert extraction, then verification, then the
    // protocol handlers
    let mut device = Router::new()
        .route(
            "/mdm",
            put(checkin_and_command_handler::<M>).post(checkin_and_command_handler::<M>),
        )
        .route(
            "/checkin",
            put(checkin_handler::<M>).post(checkin_handler::<M>),
        )
        .with_state(Arc::clone(&service))
        .layer(axum::middleware::from_fn_with_state(
            verifier,
            cert_verify_middleware,
        ));
    device = match &cfg.cert_header {
        Some(header) => device.layer(axum::middleware::from_fn_with_state(
            Arc::new(header.clone()),
            cert_extract_header_middleware,
        )),
        None => device.layer(axum::middleware::from_fn(
            cert_extract_mdm_signature_middleware,
        )),
    };

    let mut app = Router::new().merge(device).route(
        "/version",
        get(version_handler).with_state(Arc::new(env!("CARGO_PKG_VERSION").to_string())),
    );

    if let Some(api_key) = &cfg.api_key {
        let auth = Arc::new(ApiAuth::new(API_USERNAME, api_key.clone(), API_USERNAME));
        let pusher = PushService::new(storage.clone(), ApnsProviderFactory::new());
        let state = ApiState {
            store: Arc::new(storage.clone()),
            pusher: Arc::new(pusher),
        };
        type Ps<S> = PushService<S, ApnsProviderFactory>;
        let mut api = Router::new()
            .route("/v1/push/:ids", post(push_handler::<S, Ps<S>>))
            .route(
                "/v1/enqueue/:ids",
                put(enqueue_handler::<S, Ps<S>>).post(enqueue_handler::<S, Ps<S>>),
            )
            .route("/v1/pushcert", put(store_push_cert_handler::<S, Ps<S>>))
            .route(
                "/v1/escrowkeyunlock",
                post(escrow_key_unlock_handler::<S, Ps<S>>),
            )
            .with_state(state);

        if cfg.migration {
            // migration check-ins skip certificate auth entirely; basic
            // auth still applies
            let migration_engine = Arc::new(Engine::new(storage.clone()));
            api = api.route(
                "/migration",
                put(checkin_handler::<Engine<S>>)
                    .post(checkin_handler::<Engine<S>>)
                    .with_state(migration_engine),
            );
        }

        app = app.merge(api.layer(axum::middleware::from_fn_with_state(
            auth,
            basic_auth_middleware,
        )));
    } else if cfg.migration {
        color_eyre::eyre::bail!("migration endpoint requires an API key");
    }

    let app = app.layer(TraceLayer::new_for_http());

    tracing::info!(listen = %cfg.listen, "starting server");
    let listener = tokio::net::TcpListener::bind(&cfg.listen)
        .await
        .wrap_err("binding listener")?;
    axum::serve(listener, app).await.wrap_err("server error")
}
