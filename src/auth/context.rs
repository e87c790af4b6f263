use std::convert::Infallible;

use axum::{
    async_trait,
    extract::{FromRequestParts, Request},
    http::{request::Parts, Extensions},
};

use crate::auth::principal::Principal;

/// Attach `principal` to the request. A second call replaces the first.
pub fn attach_principal(req: &mut Request, principal: Principal) {
    req.extensions_mut().insert(principal);
}

/// Read the principal set by the `authenticate` middleware.
///
/// # Panics
///
/// Panics if no principal was attached. Every route sits behind
/// `authenticate`, so a missing principal means the router was assembled
/// without it.
pub fn read_principal(extensions: &Extensions) -> &Principal {
    extensions
        .get::<Principal>()
        .expect("missing principal in request extensions; is the authenticate layer installed?")
}

/// Hands the request principal to a handler.
pub struct CurrentPrincipal(pub Principal);

#[async_trait]
impl<S> FromRequestParts<S> for CurrentPrincipal
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(CurrentPrincipal(read_principal(&parts.extensions).clone()))
    }
}
