//! Identity of the caller as established by the upstream proxy.

use std::net::SocketAddr;

use axum::extract::ConnectInfo;
use axum::extract::FromRequestParts;
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use termgate_core::Caller;

use crate::error::ApiError;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub caller: Caller,
    pub client_ip: String,
}

impl RequestContext {
    pub fn from_parts(parts: &Parts) -> Result<Self, ApiError> {
        let headers = &parts.headers;
        let user_id = header_str(headers, USER_ID_HEADER)
            .map(str::trim)
            .filter(|user| !user.is_empty())
            .ok_or(ApiError::Unauthenticated)?;

        let mut caller = Caller::new(user_id);
        if let Some(token) = header_str(headers, AUTHORIZATION.as_str())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
        {
            caller = caller.with_token(token);
        }
        if header_str(headers, USER_ROLE_HEADER).is_some_and(|role| role.eq_ignore_ascii_case("admin")) {
            caller = caller.admin();
        }

        let client_ip = header_str(headers, FORWARDED_FOR_HEADER)
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
            .map(str::to_string)
            .or_else(|| {
                parts
                    .extensions
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|ConnectInfo(addr)| addr.ip().to_string())
            })
            .unwrap_or_else(|| "unknown".to_string());

        Ok(Self { caller, client_ip })
    }
}

impl<S: Send + Sync> FromRequestParts<S> for RequestContext {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Self::from_parts(parts)
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use pretty_assertions::assert_eq;

    fn parts(headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::builder().uri("/sessions");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).expect("request").into_parts().0
    }

    #[test]
    fn reads_user_token_role_and_forwarded_ip() {
        let ctx = RequestContext::from_parts(&parts(&[
            ("x-user-id", "u1"),
            ("authorization", "Bearer tok-1"),
            ("x-user-role", "Admin"),
            ("x-forwarded-for", "203.0.113.9, 10.0.0.1"),
        ]))
        .expect("context");
        assert_eq!(ctx.caller, Caller::new("u1").with_token("tok-1").admin());
        assert_eq!(ctx.client_ip, "203.0.113.9");
    }

    #[test]
    fn missing_user_is_rejected() {
        let err = RequestContext::from_parts(&parts(&[("authorization", "Bearer tok")]))
            .expect_err("no user");
        assert!(matches!(err, ApiError::Unauthenticated));
    }

    #[test]
    fn plain_user_without_token() {
        let ctx = RequestContext::from_parts(&parts(&[("x-user-id", "u2")])).expect("context");
        assert_eq!(ctx.caller.token(), None);
        assert!(!ctx.caller.is_admin);
        assert_eq!(ctx.client_ip, "unknown");
    }
}
