use switchboard_ws::handler::ClientHandler;

/// Ordered table of websocket routes.
#[derive(Debug, Default, Clone)]
pub struct Router {
    routes: Vec<(String, ClientHandler)>,
}

impl Router {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for upgrade requests on `path`. A path that is
    /// already registered keeps its first handler.
    #[must_use]
    pub fn add_route(mut self, path: impl Into<String>, handler: ClientHandler) -> Self {
        let path = path.into();

        if self.routes.iter().any(|(x, _)| *x == path) {
            log::warn!("Route {path} is already registered, ignoring");
            return self;
        }

        self.routes.push((path, handler));
        self
    }

    #[must_use]
    pub fn routes(&self) -> &[(String, ClientHandler)] {
        &self.routes
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
