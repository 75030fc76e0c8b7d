//! Websocket server for `switchboard`.
//!
//! [`App`] ties the pieces together: it registers a websocket upgrade endpoint
//! for every [`Router`] route, resolves the route's middlewares, connects the
//! cluster backbone when configured, and serves everything with actix-web,
//! optionally over TLS.
//!
//! ```rust,no_run
//! use switchboard_server::{App, config::Config, router::Router};
//! use switchboard_ws::handler::ClientHandler;
//!
//! # async fn run() -> Result<(), switchboard_server::AppError> {
//! let mut app = App::new(Config::default()).await?;
//!
//! app.add_router(Router::new().add_route(
//!     "/echo",
//!     ClientHandler::new().on("*", |client, data| async move {
//!         client.write(data.to_vec()).await?;
//!         Ok(())
//!     }),
//! ));
//!
//! app.listen_and_serve().await
//! # }
//! ```

#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

use std::{collections::BTreeSet, sync::Arc};

use actix_web::web;
use switchboard_pubsub::{PubSub, PubSubError, redis::RedisPubSub};
use switchboard_ws::{
    broadcast::Broadcaster,
    connection::ConnectionHandler,
    fanout::{FanOut, FanOutError},
    middleware::{
        HandshakeMiddleware, MiddlewareBuilder, MiddlewareRegistrationError, ReceiveMiddleware,
        SendMiddleware,
    },
    registry::Registry,
};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    config::{Config, ConfigError},
    router::Router,
    tls::TlsError,
};

pub mod api;
pub mod config;
pub mod demo;
pub mod router;
pub mod tls;
pub mod transport;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error(transparent)]
    PubSub(#[from] PubSubError),
    #[error(transparent)]
    FanOut(#[from] FanOutError),
    #[error(transparent)]
    Middleware(#[from] MiddlewareRegistrationError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("No router added")]
    NoRouter,
}

pub struct App {
    config: Config,
    routers: Vec<Router>,
    middlewares: MiddlewareBuilder,
    registry: Arc<Registry>,
    broadcaster: Broadcaster,
    fan_out_handle: Option<JoinHandle<Result<(), FanOutError>>>,
    token: CancellationToken,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("config", &self.config)
            .field("routers", &self.routers.len())
            .field("clustered", &self.broadcaster.is_clustered())
            .finish_non_exhaustive()
    }
}

impl App {
    /// Creates the app. When `enablePubSub` is set the Redis backbone is
    /// connected here, so an unreachable backbone fails startup.
    ///
    /// # Errors
    ///
    /// * If the config is invalid
    /// * If the backbone cannot be reached
    /// * If the backbone subscription cannot be established
    pub async fn new(config: Config) -> Result<Self, AppError> {
        config.validate()?;

        let pubsub: Option<Arc<dyn PubSub>> = match config.pub_sub_url() {
            Some(url) if config.enable_pub_sub => {
                log::info!("PubSub enabled, connecting to backbone");
                let pubsub = RedisPubSub::connect(url).await?;
                log::info!("Backbone connection established");
                Some(Arc::new(pubsub))
            }
            _ => None,
        };

        Self::with_pubsub(config, pubsub).await
    }

    /// Creates the app on top of an already connected backbone, or in
    /// single-process mode when `pubsub` is `None`.
    ///
    /// # Errors
    ///
    /// * If the backbone subscription cannot be established
    pub async fn with_pubsub(
        config: Config,
        pubsub: Option<Arc<dyn PubSub>>,
    ) -> Result<Self, AppError> {
        let registry = Arc::new(Registry::new());
        let token = CancellationToken::new();

        let (broadcaster, fan_out_handle) = match pubsub {
            Some(pubsub) => {
                let (fan_out, handle) =
                    FanOut::start(pubsub, registry.clone(), token.clone()).await?;
                (Broadcaster::clustered(fan_out), Some(handle))
            }
            None => (Broadcaster::local(registry.clone()), None),
        };

        Ok(Self {
            config,
            routers: vec![],
            middlewares: MiddlewareBuilder::new(),
            registry,
            broadcaster,
            fan_out_handle,
            token,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Broadcast API for handlers. Cluster-wide when the backbone is enabled.
    #[must_use]
    pub fn broadcaster(&self) -> Broadcaster {
        self.broadcaster.clone()
    }

    /// Cancelled when the server stops.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn add_router(&mut self, router: Router) -> &mut Self {
        self.routers.push(router);
        self
    }

    /// Only one handshake middleware applies to a route: the first registered
    /// pattern that matches it.
    ///
    /// # Errors
    ///
    /// * If `pattern` is not a valid regular expression
    pub fn add_handshake_middleware(
        &mut self,
        pattern: &str,
        middleware: HandshakeMiddleware,
    ) -> Result<&mut Self, AppError> {
        self.middlewares.add_handshake(pattern, middleware)?;
        Ok(self)
    }

    /// # Errors
    ///
    /// * If `pattern` is not a valid regular expression
    pub fn add_receive_middleware(
        &mut self,
        pattern: &str,
        middleware: ReceiveMiddleware,
    ) -> Result<&mut Self, AppError> {
        self.middlewares.add_receive(pattern, middleware)?;
        Ok(self)
    }

    /// # Errors
    ///
    /// * If `pattern` is not a valid regular expression
    pub fn add_send_middleware(
        &mut self,
        pattern: &str,
        middleware: SendMiddleware,
    ) -> Result<&mut Self, AppError> {
        self.middlewares.add_send(pattern, middleware)?;
        Ok(self)
    }

    /// Builds one [`ConnectionHandler`] per registered route.
    ///
    /// # Errors
    ///
    /// * If no route has been registered
    pub fn connection_handlers(&self) -> Result<Vec<ConnectionHandler>, AppError> {
        let options = self.config.connection_options();
        let mut paths = BTreeSet::new();
        let mut handlers = vec![];

        for (path, handler) in self.routers.iter().flat_map(Router::routes) {
            if !paths.insert(path.as_str()) {
                log::warn!("Route {path} is registered by more than one router, ignoring");
                continue;
            }

            log::info!("Registering route: {path}");

            handlers.push(ConnectionHandler::new(
                path.clone(),
                handler.clone(),
                self.middlewares.resolve(path),
                self.registry.clone(),
                options,
            ));
        }

        if handlers.is_empty() {
            return Err(AppError::NoRouter);
        }

        Ok(handlers)
    }

    /// Serves every route until the server is stopped, then shuts the
    /// backbone subscription down.
    ///
    /// # Errors
    ///
    /// * If no route has been registered
    /// * If TLS is enabled and the certificate or key cannot be loaded
    /// * If the address cannot be bound
    /// * If the server fails while running
    /// * If the backbone subscription ends while serving
    #[allow(clippy::future_not_send)]
    pub async fn listen_and_serve(mut self) -> Result<(), AppError> {
        let result = self.serve().await;
        let shutdown = self.shutdown().await;
        result.and(shutdown)
    }

    #[allow(clippy::future_not_send)]
    async fn serve(&self) -> Result<(), AppError> {
        let connections = self.connection_handlers()?;
        let registry = self.registry.clone();

        let app = move || {
            let mut app = actix_web::App::new()
                .app_data(web::Data::new(registry.clone()))
                .service(api::health_endpoint);

            for connection in &connections {
                app = app.service(
                    web::resource(connection.path())
                        .app_data(web::Data::new(connection.clone()))
                        .route(web::get().to(api::websocket)),
                );
            }

            app
        };

        let addr = (self.config.host.as_str(), self.config.port);
        let http_server = actix_web::HttpServer::new(app);

        let http_server = if self.config.use_tls {
            let tls = self.config.tls.as_ref().ok_or(ConfigError::MissingTls)?;
            let rustls = tls::load_rustls_config(&tls.cert, &tls.key)?;
            log::info!("Listening on wss://{}:{}", addr.0, addr.1);
            http_server.bind_rustls_0_23(addr, rustls)?
        } else {
            log::info!("Listening on ws://{}:{}", addr.0, addr.1);
            http_server.bind(addr)?
        };

        let server = http_server.run();
        let handle = server.handle();
        let token = self.token.clone();

        actix_web::rt::spawn(async move {
            token.cancelled().await;
            log::info!("Cancelled, stopping server");
            handle.stop(true).await;
        });

        server.await?;

        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), AppError> {
        log::debug!("Shutting down");
        self.token.cancel();

        let Some(handle) = self.fan_out_handle.take() else {
            return Ok(());
        };

        match handle.await {
            Ok(result) => result.map_err(AppError::from),
            Err(e) => {
                log::error!("Backbone subscription loop failed: {e:?}");
                Ok(())
            }
        }
    }
}
