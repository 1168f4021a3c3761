//! Authentication middleware for the log viewer.
//!
//! Requests must carry `Authorization: Bearer <token>` when a token is
//! configured. Without a token every request passes.

use crate::error::Error;
use crate::log_viewer::actix_error::ApiError;

use actix_web::{
    Error as ActixError,
    dev::{Service, ServiceRequest, ServiceResponse, Transform, forward_ready},
};
use futures::future::{LocalBoxFuture, Ready, ready};
use std::sync::Arc;

/// Authentication middleware factory
pub struct Authentication {
    token: Arc<Option<String>>,
}

impl Authentication {
    /// Create a new Authentication middleware
    pub fn new(token: Arc<Option<String>>) -> Self {
        Self { token }
    }
}

impl<S, B> Transform<S, ServiceRequest> for Authentication
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = ActixError> + 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = ActixError;
    type Transform = AuthenticationMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(AuthenticationMiddleware {
            service,
            token: self.token.clone(),
        }))
    }
}

/// Authentication middleware implementation
pub struct AuthenticationMiddleware<S> {
    service: S,
    token: Arc<Option<String>>,
}

impl<S, B> Service<ServiceRequest> for AuthenticationMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = ActixError> + 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = ActixError;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        if let Some(expected) = self.token.as_ref() {
            let presented = req
                .headers()
                .get("Authorization")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.strip_prefix("Bearer "));

            if presented != Some(expected.as_str()) {
                tracing::warn!(path = %req.path(), "Log viewer rejected request without a valid token");
                return Box::pin(async move {
                    Err(ApiError::from(Error::Unauthorized(
                        "Invalid or missing bearer token".to_string(),
                    ))
                    .into())
                });
            }
        }

        let fut = self.service.call(req);
        Box::pin(async move {
            let res = fut.await?;
            Ok(res)
        })
    }
}
