//! End-user authentication middleware
//!
//! Wraps the `/v1/llm` scope. Per request: assign a request id, apply the
//! global admission rate limit (before any persistence), verify the bearer
//! token, load the user and require active status, then hand off with the
//! authenticated identity in request extensions. A panic below is caught
//! and converted to a 500.

use actix_web::{
    body::{BoxBody, EitherBody},
    dev::{Service, ServiceRequest, ServiceResponse, Transform},
    Error, HttpMessage, HttpResponse, ResponseError,
};
use futures::future::{ok, LocalBoxFuture, Ready};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::rc::Rc;
use tracing::{error, warn};
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::auth::KeyStore;
use crate::Gateway;

use super::auth::{extract_bearer, rate_limit_identity, AuthContext};

/// Middleware factory for bearer authentication and admission rate limiting
pub struct ApiMiddleware {
    gateway: Gateway,
}

impl ApiMiddleware {
    pub fn new(gateway: Gateway) -> Self {
        Self { gateway }
    }
}

impl<S, B> Transform<S, ServiceRequest> for ApiMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B, BoxBody>>;
    type Error = Error;
    type Transform = ApiMiddlewareService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(ApiMiddlewareService {
            service: Rc::new(service),
            gateway: self.gateway.clone(),
        })
    }
}

/// The actual middleware service
pub struct ApiMiddlewareService<S> {
    service: Rc<S>,
    gateway: Gateway,
}

impl<S, B> Service<ServiceRequest> for ApiMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B, BoxBody>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &self,
        ctx: &mut core::task::Context<'_>,
    ) -> core::task::Poll<Result<(), Self::Error>> {
        self.service.poll_ready(ctx)
    }

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let gateway = self.gateway.clone();

        Box::pin(async move {
            let request_id = Uuid::new_v4().to_string();

            // Global admission rate limit, keyed by prefix-or-IP. Runs
            // before verification so abusive callers never reach the
            // database.
            let identity = rate_limit_identity(&req);
            if !gateway.admission.check(&identity) {
                warn!(identity = %identity, "Admission rate limit exceeded");
                return Ok(reject(req, ApiError::RateLimited));
            }

            let token = match extract_bearer(&req) {
                Some(token) => token,
                None => {
                    return Ok(reject(
                        req,
                        ApiError::Unauthorized("bearer token required".to_string()),
                    ));
                }
            };

            // Tokens without the gateway prefix are rejected without any
            // hash lookup.
            if !KeyStore::looks_like_token(&token) {
                return Ok(reject(
                    req,
                    ApiError::Unauthorized("invalid API key".to_string()),
                ));
            }

            let (user_id, key_id) = match gateway.keys.verify(&token).await {
                Ok(identity) => identity,
                Err(e) => return Ok(reject(req, ApiError::from(e))),
            };

            let user = match gateway.users.get(&user_id).await {
                Ok(Some(user)) => user,
                Ok(None) => {
                    return Ok(reject(
                        req,
                        ApiError::Forbidden("user not found".to_string()),
                    ));
                }
                Err(e) => return Ok(reject(req, ApiError::from(e))),
            };
            if !user.is_active() {
                warn!(user_id = %user.id, status = user.status.as_str(), "Inactive user rejected");
                return Ok(reject(
                    req,
                    ApiError::Forbidden("user is not active".to_string()),
                ));
            }

            req.extensions_mut().insert(AuthContext {
                user_id,
                key_id,
                request_id: request_id.clone(),
            });

            // A panic in the handler must not tear down the connection
            // without an answer; the quota guard's Drop releases the
            // concurrency slot independently.
            let http_req = req.request().clone();
            match AssertUnwindSafe(service.call(req)).catch_unwind().await {
                Ok(result) => result.map(|res| res.map_into_left_body()),
                Err(_) => {
                    error!(request_id = %request_id, "Handler panicked");
                    let response =
                        ApiError::Internal("handler panicked".to_string()).error_response();
                    Ok(ServiceResponse::new(http_req, response).map_into_right_body())
                }
            }
        })
    }
}

fn reject<B>(req: ServiceRequest, error: ApiError) -> ServiceResponse<EitherBody<B, BoxBody>> {
    let response: HttpResponse = error.error_response();
    req.into_response(response).map_into_right_body()
}
