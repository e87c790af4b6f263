//! Access levels and the ordered checks that enforce them.
//!
//! Each level requires every check of the levels below it, evaluated in a
//! fixed order: authenticated, then activated, then admin role. The first
//! failing check decides the rejection, so an inactive admin is turned away
//! as inactive.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::debug;

use crate::auth::{context::read_principal, principal::Principal, repo_types::User};
use crate::error::ApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AccessLevel {
    Anonymous,
    Authenticated,
    Activated,
    Admin,
}

/// A predicate over the principal paired with the rejection it produces.
pub struct Check {
    pub name: &'static str,
    pub allows: fn(&Principal) -> bool,
    pub rejection: fn() -> ApiError,
}

static CHAIN: [Check; 3] = [
    Check {
        name: "authenticated",
        allows: |p| !p.is_anonymous(),
        rejection: || ApiError::AuthenticationRequired,
    },
    Check {
        name: "activated",
        allows: |p| p.user().is_some_and(|u| u.active),
        rejection: || ApiError::AccountInactive,
    },
    Check {
        name: "admin",
        allows: |p| p.user().is_some_and(User::is_admin),
        rejection: || ApiError::InsufficientRole,
    },
];

impl AccessLevel {
    /// The checks this level runs, in evaluation order.
    pub fn checks(self) -> &'static [Check] {
        let depth = match self {
            AccessLevel::Anonymous => 0,
            AccessLevel::Authenticated => 1,
            AccessLevel::Activated => 2,
            AccessLevel::Admin => 3,
        };
        &CHAIN[..depth]
    }

    pub fn authorize(self, principal: &Principal) -> Result<(), ApiError> {
        for check in self.checks() {
            if !(check.allows)(principal) {
                debug!(level = ?self, failed = check.name, "access denied");
                return Err((check.rejection)());
            }
        }
        Ok(())
    }
}

/// Route middleware: `route_layer(from_fn_with_state(level, enforce))`.
pub async fn enforce(State(level): State<AccessLevel>, req: Request, next: Next) -> Response {
    let decision = level.authorize(read_principal(req.extensions()));
    match decision {
        Ok(()) => next.run(req).await,
        Err(rejection) => rejection.into_response(),
    }
}
