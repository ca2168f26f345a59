use core::convert::Infallible;

use axum::extract::FromRequestParts;
use http::HeaderName;
use http::request::Parts;

use crate::api::server::RouteError;
use crate::db::models::activity::UserId;

/// Set by the upstream auth layer once a session is resolved.
pub const USER_ID_HEADER: HeaderName = HeaderName::from_static("x-user-id");

/// The caller's user id, if the request carried one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestUser(pub Option<UserId>);

impl RequestUser {
    pub fn require(self) -> Result<UserId, RouteError> {
        self.0.ok_or(RouteError::MissingIdentity)
    }
}

impl<S> FromRequestParts<S> for RequestUser
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get(&USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(UserId::from);

        Ok(Self(user_id))
    }
}
