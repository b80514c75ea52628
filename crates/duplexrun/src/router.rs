//! Named tree of routes and nested routers, with path dispatch.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use duplexrpc::RouteType;
use serde_json::Value;

use crate::route::Failure;
use crate::route::HandlerResult;
use crate::route::Outcome;
use crate::route::Params;
use crate::route::Route;

/// Names that collide with the client-side call surface and are never valid route keys.
pub const RESERVED_NAMES: &[&str] = &[
    "call",
    "apply",
    "then",
    "catch",
    "key",
    "path",
    "prototype",
    "constructor",
    "routes",
    "context",
    "input",
    "output",
    "type",
    "inputSchema",
    "middlewares",
    "query",
    "mutation",
    "subscription",
    "use",
    "mutate",
    "subscribe",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    ReservedName(String),
    DuplicateName(String),
    EmptyName,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReservedName(name) => write!(f, "Route name \"{}\" is reserved", name),
            Self::DuplicateName(name) => write!(f, "Route name \"{}\" is used more than once", name),
            Self::EmptyName => write!(f, "Route name is empty"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

pub enum Node<C> {
    Route(Route<C>),
    Router(Router<C>),
}

pub struct Router<C> {
    routes: BTreeMap<String, Node<C>>,
}

impl<C> Router<C>
where
    C: Send + Sync + 'static,
{
    pub fn builder() -> RouterBuilder<C> {
        RouterBuilder { routes: Vec::new() }
    }

    pub fn get(&self, name: &str) -> Option<&Node<C>> {
        self.routes.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    /// Resolves `path` and runs the route found there.
    ///
    /// Walks one segment at a time. A missing key, a path that stops at a
    /// router, or a route with segments left over all mean "not found".
    /// The route's declared kind must match `kind`, then its input contract
    /// runs, then its middlewares and handler.
    pub async fn call(
        &self,
        path: &[String],
        kind: RouteType,
        input: Value,
        context: Arc<C>,
    ) -> HandlerResult<Outcome> {
        let mut routes = &self.routes;
        let mut rest = path;

        while let Some((segment, tail)) = rest.split_first() {
            match routes.get(segment) {
                Some(Node::Router(router)) => {
                    routes = &router.routes;
                    rest = tail;
                }
                Some(Node::Route(route)) if tail.is_empty() => {
                    if route.kind() != kind {
                        return Err(Failure::new(format!(
                            "Invalid route type: tried to access \"{}\" as \"{}\" but it is a \"{}\"",
                            path.join("/"),
                            kind,
                            route.kind(),
                        ))
                        .into());
                    }

                    let input = route.validate(input).map_err(|errors| {
                        Failure::new(format!("Invalid input: {}", errors.join(", ")))
                    })?;

                    return route.invoke(Params { input, context }).await;
                }
                _ => break,
            }
        }

        Err(Failure::new(format!("RPC method not found: {}", path.join("/"))).into())
    }
}

pub struct RouterBuilder<C> {
    routes: Vec<(String, Node<C>)>,
}

impl<C> RouterBuilder<C>
where
    C: Send + Sync + 'static,
{
    pub fn route(mut self, name: impl Into<String>, route: Route<C>) -> Self {
        self.routes.push((name.into(), Node::Route(route)));
        self
    }

    pub fn router(mut self, name: impl Into<String>, router: Router<C>) -> Self {
        self.routes.push((name.into(), Node::Router(router)));
        self
    }

    /// Fails on the first empty, reserved or repeated name.
    pub fn build(self) -> Result<Router<C>> {
        let mut routes = BTreeMap::new();
        for (name, node) in self.routes {
            if name.is_empty() {
                return Err(Error::EmptyName);
            }
            if RESERVED_NAMES.contains(&name.as_str()) {
                return Err(Error::ReservedName(name));
            }
            if routes.contains_key(&name) {
                return Err(Error::DuplicateName(name));
            }
            routes.insert(name, node);
        }
        Ok(Router { routes })
    }
}
