//! Tower middleware that consults a [`RateLimitEngine`] before every call.
//!
//! Admitted responses get the `X-RateLimit-*` headers and carry the [`Decision`] in their
//! extensions. Rejections surface as [`GuardError::RateLimited`]; render them with
//! [`headers::too_many_requests`](crate::headers::too_many_requests).
use crate::engine::{Decision, RateLimitEngine};
use crate::error::GuardError;
use crate::headers;
use crate::identity::{client_ip, Identity, Role, RoleResolver};
use crate::policy::EndpointClass;
use async_trait::async_trait;
use http::Method;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// Maps a request to the identity and endpoint class it is limited under.
#[async_trait]
pub trait RequestClassifier<Req: Sync>: Send + Sync {
    async fn classify(&self, request: &Req) -> (Identity, EndpointClass);
}

/// Endpoint class from method and path: auth, upload and moderation routes by path segment,
/// other safe methods as reads, everything else as general API traffic.
pub fn class_for_route(method: &Method, path: &str) -> EndpointClass {
    let has_segment = |name: &str| path.split('/').any(|segment| segment == name);
    if has_segment("auth") || has_segment("login") {
        EndpointClass::Auth
    } else if has_segment("upload") || has_segment("uploads") {
        EndpointClass::Upload
    } else if has_segment("moderation") {
        EndpointClass::Moderation
    } else if *method == Method::GET || *method == Method::HEAD {
        EndpointClass::Read
    } else {
        EndpointClass::Api
    }
}

/// Classifier for `http::Request`s: address from proxy headers, role and user from the
/// session collaborator, class from [`class_for_route`].
#[derive(Debug, Clone)]
pub struct HttpClassifier<R> {
    resolver: R,
}

impl<R> HttpClassifier<R> {
    pub fn new(resolver: R) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl<R, B> RequestClassifier<http::Request<B>> for HttpClassifier<R>
where
    R: RoleResolver<http::Request<B>>,
    B: Sync,
{
    async fn classify(&self, request: &http::Request<B>) -> (Identity, EndpointClass) {
        let header = |name: &str| request.headers().get(name).and_then(|v| v.to_str().ok());
        let ip = client_ip(header("x-forwarded-for"), header("x-real-ip")).to_string();
        let role = self.resolver.resolve_role(request).await.unwrap_or(Role::Unauthenticated);
        let user = self.resolver.resolve_user(request).await;
        let class = class_for_route(request.method(), request.uri().path());
        (Identity::new(&ip, user.as_deref(), role), class)
    }
}

/// A layer that enforces rate limits using a [`RateLimitEngine`].
#[derive(Debug)]
pub struct RateLimitLayer<C> {
    engine: RateLimitEngine,
    classifier: Arc<C>,
}

impl<C> Clone for RateLimitLayer<C> {
    fn clone(&self) -> Self {
        Self { engine: self.engine.clone(), classifier: self.classifier.clone() }
    }
}

impl<C> RateLimitLayer<C> {
    /// Create a new rate limit layer.
    pub fn new(engine: RateLimitEngine, classifier: C) -> Self {
        Self { engine, classifier: Arc::new(classifier) }
    }
}

impl<S, C> Layer<S> for RateLimitLayer<C> {
    type Service = RateLimitService<S, C>;

    fn layer(&self, service: S) -> Self::Service {
        RateLimitService {
            inner: service,
            engine: self.engine.clone(),
            classifier: self.classifier.clone(),
        }
    }
}

/// Middleware service that enforces rate limits.
#[derive(Debug)]
pub struct RateLimitService<S, C> {
    inner: S,
    engine: RateLimitEngine,
    classifier: Arc<C>,
}

impl<S: Clone, C> Clone for RateLimitService<S, C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            engine: self.engine.clone(),
            classifier: self.classifier.clone(),
        }
    }
}

impl<S, C, Req, ResBody> Service<Req> for RateLimitService<S, C>
where
    S: Service<Req, Response = http::Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    C: RequestClassifier<Req> + 'static,
    Req: Send + Sync + 'static,
    ResBody: Send + 'static,
{
    type Response = http::Response<ResBody>;
    type Error = GuardError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(GuardError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let engine = self.engine.clone();
        let classifier = self.classifier.clone();
        // Take the service that was driven to readiness; leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let (identity, class) = classifier.classify(&req).await;
            let decision = engine.evaluate(&identity, class).await;
            if !decision.allowed {
                return Err(GuardError::RateLimited(decision));
            }
            let mut response = inner.call(req).await.map_err(GuardError::Inner)?;
            tag(&mut response, decision, engine.now_millis());
            Ok(response)
        })
    }
}

fn tag<B>(response: &mut http::Response<B>, decision: Decision, now_millis: u64) {
    headers::apply(&decision, response.headers_mut(), now_millis);
    response.extensions_mut().insert(decision);
}
