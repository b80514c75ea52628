//! # Routes
//!
//! A route is one callable operation: a declared kind, an input contract, an
//! ordered list of middlewares and a handler. Routes are immutable once built.
//!
//! ```ignore
//! let ping = Route::<Ctx>::builder()
//!     .middleware(|params: Params<Ctx>| async move {
//!         if params.context.authenticated { Ok(()) } else { Err(Failure::new("Unauthorized")) }
//!     })
//!     .query(|_params| async { Ok("pong") });
//! ```
//!
//! ## Failures vs errors
//!
//! Handlers return [`HandlerResult`]. A [`Failure`] is an expected,
//! caller-facing outcome and its message is sent to the peer. Anything else
//! (`anyhow::Error`, or a panic) is unexpected: the server logs it and the
//! peer only sees a generic internal error.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use duplexrpc::RouteType;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::subscription::Subscription;

/// An explicit, typed failure value. Its message is what the caller sees.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Failure {
    message: String,
}

impl Failure {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for Failure {}

/// Why a dispatch did not produce a value.
#[derive(Debug)]
pub enum RouteError {
    /// Expected outcome, reported to the caller verbatim.
    Failure(Failure),
    /// Unexpected error, only ever logged locally.
    Internal(anyhow::Error),
}

impl fmt::Display for RouteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failure(failure) => write!(f, "{}", failure),
            Self::Internal(e) => write!(f, "Internal error: {}", e),
        }
    }
}

impl std::error::Error for RouteError {}

impl From<Failure> for RouteError {
    fn from(failure: Failure) -> Self {
        Self::Failure(failure)
    }
}

impl From<anyhow::Error> for RouteError {
    fn from(e: anyhow::Error) -> Self {
        Self::Internal(e)
    }
}

pub type HandlerResult<T> = std::result::Result<T, RouteError>;

/// What a handler and its middlewares receive.
pub struct Params<C> {
    /// Input after validation by the route's contract.
    pub input: Value,
    /// Opaque per-connection context supplied by the connection owner.
    pub context: Arc<C>,
}

impl<C> Clone for Params<C> {
    fn clone(&self) -> Self {
        Self {
            input: self.input.clone(),
            context: Arc::clone(&self.context),
        }
    }
}

impl<C> Params<C> {
    /// Deserializes the input into a concrete type.
    pub fn input_as<T: DeserializeOwned>(&self) -> Result<T, Failure> {
        serde_json::from_value(self.input.clone())
            .map_err(|e| Failure::new(format!("Invalid input: {}", e)))
    }
}

/// Validates (and may normalize) raw input before any middleware runs.
///
/// On rejection, returns every problem found; the router joins them into one message.
pub trait InputContract: Send + Sync + 'static {
    fn validate(&self, input: Value) -> Result<Value, Vec<String>>;
}

/// Accepts any input unchanged. The default contract.
#[derive(Clone, Copy, Debug, Default)]
pub struct AnyInput;

impl InputContract for AnyInput {
    fn validate(&self, input: Value) -> Result<Value, Vec<String>> {
        Ok(input)
    }
}

/// Accepts input that deserializes into `T`; passes on `T`'s serialized form.
pub struct Typed<T>(PhantomData<fn() -> T>);

impl<T> Typed<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for Typed<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> InputContract for Typed<T>
where
    T: DeserializeOwned + Serialize + 'static,
{
    fn validate(&self, input: Value) -> Result<Value, Vec<String>> {
        let parsed: T = serde_json::from_value(input).map_err(|e| vec![e.to_string()])?;
        serde_json::to_value(parsed).map_err(|e| vec![e.to_string()])
    }
}

impl<F> InputContract for F
where
    F: Fn(&Value) -> Result<Value, Vec<String>> + Send + Sync + 'static,
{
    fn validate(&self, input: Value) -> Result<Value, Vec<String>> {
        self(&input)
    }
}

/// The successful product of a dispatch.
pub enum Outcome {
    /// Query or mutation result.
    Data(Value),
    /// Subscription ready to be started by the server.
    Subscription(Subscription),
}

impl fmt::Debug for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data(value) => f.debug_tuple("Data").field(value).finish(),
            Self::Subscription(_) => f.write_str("Subscription(..)"),
        }
    }
}

type Middleware<C> = Box<dyn Fn(Params<C>) -> BoxFuture<'static, Result<(), Failure>> + Send + Sync>;
type CallHandler<C> = Box<dyn Fn(Params<C>) -> BoxFuture<'static, HandlerResult<Value>> + Send + Sync>;
type SubscribeHandler<C> = Box<dyn Fn(Params<C>) -> BoxFuture<'static, HandlerResult<Subscription>> + Send + Sync>;

enum Handler<C> {
    Call(CallHandler<C>),
    Subscribe(SubscribeHandler<C>),
}

/// A finished route.
pub struct Route<C> {
    kind: RouteType,
    input: Box<dyn InputContract>,
    middlewares: Vec<Middleware<C>>,
    handler: Handler<C>,
}

impl<C> Route<C>
where
    C: Send + Sync + 'static,
{
    pub fn builder() -> RouteBuilder<C> {
        RouteBuilder::new()
    }

    pub fn kind(&self) -> RouteType {
        self.kind
    }

    pub(crate) fn validate(&self, input: Value) -> Result<Value, Vec<String>> {
        self.input.validate(input)
    }

    /// Runs the middlewares in order, then the handler.
    ///
    /// The first middleware failure becomes the result; the handler never runs.
    pub(crate) async fn invoke(&self, params: Params<C>) -> HandlerResult<Outcome> {
        for middleware in &self.middlewares {
            middleware(params.clone()).await?;
        }

        match &self.handler {
            Handler::Call(handler) => handler(params).await.map(Outcome::Data),
            Handler::Subscribe(handler) => handler(params).await.map(Outcome::Subscription),
        }
    }
}

/// Incremental route construction. Finalized by `query`, `mutation` or `subscription`.
pub struct RouteBuilder<C> {
    input: Box<dyn InputContract>,
    middlewares: Vec<Middleware<C>>,
}

impl<C> RouteBuilder<C>
where
    C: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            input: Box::new(AnyInput),
            middlewares: Vec::new(),
        }
    }

    /// Replaces the input contract.
    pub fn input(mut self, contract: impl InputContract) -> Self {
        self.input = Box::new(contract);
        self
    }

    /// Appends a step that runs before the handler and may short-circuit with a [`Failure`].
    pub fn middleware<F, Fut>(mut self, middleware: F) -> Self
    where
        F: Fn(Params<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Failure>> + Send + 'static,
    {
        self.middlewares.push(Box::new(move |params| middleware(params).boxed()));
        self
    }

    pub fn query<F, Fut, T>(self, handler: F) -> Route<C>
    where
        F: Fn(Params<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<T>> + Send + 'static,
        T: Serialize,
    {
        self.finish_call(RouteType::Query, handler)
    }

    pub fn mutation<F, Fut, T>(self, handler: F) -> Route<C>
    where
        F: Fn(Params<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<T>> + Send + 'static,
        T: Serialize,
    {
        self.finish_call(RouteType::Mutation, handler)
    }

    /// The handler returns a [`Subscription`]; the server starts it after acknowledging.
    pub fn subscription<F, Fut>(self, handler: F) -> Route<C>
    where
        F: Fn(Params<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<Subscription>> + Send + 'static,
    {
        Route {
            kind: RouteType::Subscription,
            input: self.input,
            middlewares: self.middlewares,
            handler: Handler::Subscribe(Box::new(move |params| handler(params).boxed())),
        }
    }

    fn finish_call<F, Fut, T>(self, kind: RouteType, handler: F) -> Route<C>
    where
        F: Fn(Params<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<T>> + Send + 'static,
        T: Serialize,
    {
        let handler: CallHandler<C> = Box::new(move |params| {
            let fut = handler(params);
            async move {
                let output = fut.await?;
                serde_json::to_value(output).map_err(|e| RouteError::Internal(e.into()))
            }
            .boxed()
        });

        Route {
            kind,
            input: self.input,
            middlewares: self.middlewares,
            handler: Handler::Call(handler),
        }
    }
}

impl<C> Default for RouteBuilder<C>
where
    C: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use serde::Deserialize;
    use serde_json::json;

    use super::*;

    struct Ctx {
        name: &'static str,
    }

    fn params(input: Value) -> Params<Ctx> {
        Params { input, context: Arc::new(Ctx { name: "ctx" }) }
    }

    fn data(outcome: Outcome) -> Value {
        match outcome {
            Outcome::Data(value) => value,
            other => panic!("Expected Data, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_query_sees_input_and_context() {
        let route = Route::<Ctx>::builder()
            .query(|p: Params<Ctx>| async move { Ok(format!("{}:{}", p.context.name, p.input)) });

        assert_eq!(route.kind(), RouteType::Query);
        let out = route.invoke(params(json!(5))).await.unwrap();
        assert_eq!(data(out), json!("ctx:5"));
    }

    #[tokio::test]
    async fn test_middlewares_run_in_order_then_handler() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let (a, b, h) = (order.clone(), order.clone(), order.clone());

        let route = Route::<Ctx>::builder()
            .middleware(move |_| {
                a.lock().unwrap().push("first");
                async { Ok(()) }
            })
            .middleware(move |_| {
                b.lock().unwrap().push("second");
                async { Ok(()) }
            })
            .mutation(move |_| {
                h.lock().unwrap().push("handler");
                async { Ok(true) }
            });

        assert_eq!(route.kind(), RouteType::Mutation);
        assert_eq!(data(route.invoke(params(Value::Null)).await.unwrap()), json!(true));
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "handler"]);
    }

    #[tokio::test]
    async fn test_middleware_failure_short_circuits() {
        let handler_calls = Arc::new(AtomicUsize::new(0));
        let later_calls = Arc::new(AtomicUsize::new(0));
        let (hc, lc) = (handler_calls.clone(), later_calls.clone());

        let route = Route::<Ctx>::builder()
            .middleware(|_| async { Err(Failure::new("Unauthorized")) })
            .middleware(move |_| {
                lc.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .query(move |_| {
                hc.fetch_add(1, Ordering::SeqCst);
                async { Ok("secret") }
            });

        match route.invoke(params(Value::Null)).await {
            Err(RouteError::Failure(failure)) => assert_eq!(failure, Failure::new("Unauthorized")),
            other => panic!("Expected Failure, got {:?}", other.map(|_| ())),
        }
        assert_eq!(handler_calls.load(Ordering::SeqCst), 0);
        assert_eq!(later_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_handler_errors_keep_their_kind() {
        let failing = Route::<Ctx>::builder()
            .query(|_| async { Err::<(), _>(Failure::new("expected").into()) });
        let throwing = Route::<Ctx>::builder()
            .query(|_| async { Err::<(), _>(anyhow::anyhow!("database on fire").into()) });

        assert!(matches!(failing.invoke(params(Value::Null)).await, Err(RouteError::Failure(_))));
        assert!(matches!(throwing.invoke(params(Value::Null)).await, Err(RouteError::Internal(_))));
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Point {
        x: i32,
        y: i32,
    }

    #[test]
    fn test_typed_contract() {
        let contract = Typed::<Point>::new();
        assert_eq!(contract.validate(json!({"x": 1, "y": 2, "z": 3})).unwrap(), json!({"x": 1, "y": 2}));

        let errors = contract.validate(json!({"x": "one"})).unwrap_err();
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn test_closure_contract_reports_every_error() {
        let contract = |input: &Value| {
            let mut errors = Vec::new();
            if !input.is_object() {
                errors.push("Expected object".to_string());
            }
            if input.get("name").is_none() {
                errors.push("Required: name".to_string());
            }
            if errors.is_empty() { Ok(input.clone()) } else { Err(errors) }
        };

        assert_eq!(contract.validate(json!(3)).unwrap_err().len(), 2);
        assert!(contract.validate(json!({"name": "a"})).is_ok());
    }

    #[test]
    fn test_params_input_as() {
        let p = params(json!({"x": 1, "y": -1}));
        let point: Point = p.input_as().unwrap();
        assert_eq!((point.x, point.y), (1, -1));

        let err = params(json!("nope")).input_as::<Point>().unwrap_err();
        assert!(err.message().starts_with("Invalid input:"));
    }
}
