//! Organization-context extraction (spec §4.5): derived from
//! `x-organization-*` headers, or failing that from the unverified
//! payload of a bearer JWT. Signature verification is explicitly out of
//! scope — that is an external identity gateway's job; this crate only
//! reads claims that are already trusted by the time they reach it.

use axum::http::HeaderMap;
use base64::Engine;
use serde::Deserialize;

/// An organization as carried in context — either straight from the
/// `x-organization-*` header set or from a bearer JWT's `org` claim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Organization {
    pub id: String,
    pub clerk_id: Option<String>,
    pub name: Option<String>,
    pub slug: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub organization: Option<Organization>,
    pub user_id: Option<String>,
    pub request_id: Option<String>,
}

impl RequestContext {
    /// `organization_id` is kept for callers that only care whether a
    /// context resolved to some organization, e.g. logging.
    pub fn organization_id(&self) -> Option<&str> {
        self.organization.as_ref().map(|o| o.id.as_str())
    }

    pub fn from_headers(headers: &HeaderMap) -> Self {
        if let Some(ctx) = Self::from_organization_headers(headers) {
            return ctx;
        }
        Self::from_bearer_jwt(headers).unwrap_or_default()
    }

    /// All four `x-organization-*` headers must be present to build
    /// context from headers (spec §4.5 step 1).
    fn from_organization_headers(headers: &HeaderMap) -> Option<Self> {
        let id = header_str(headers, "x-organization-id")?;
        let clerk_id = header_str(headers, "x-organization-clerk-id")?;
        let name = header_str(headers, "x-organization-name")?;
        let slug = header_str(headers, "x-organization-slug")?;
        Some(Self {
            organization: Some(Organization {
                id,
                clerk_id: Some(clerk_id),
                name: Some(name),
                slug: Some(slug),
            }),
            user_id: None,
            request_id: None,
        })
    }

    /// Decode (without verifying) the payload segment of a bearer JWT.
    fn from_bearer_jwt(headers: &HeaderMap) -> Option<Self> {
        let auth = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
        let token = auth.strip_prefix("Bearer ")?.trim();
        let mut parts = token.split('.');
        let _header = parts.next()?;
        let payload_b64 = parts.next()?;

        let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(payload_b64)
            .ok()?;
        let payload: JwtPayload = serde_json::from_slice(&decoded).ok()?;

        Some(Self {
            organization: payload.org.map(|org| Organization {
                id: org.id,
                clerk_id: org.clerk_id,
                name: org.name,
                slug: org.slug,
            }),
            user_id: payload.sub,
            request_id: payload.jti,
        })
    }
}

#[derive(Debug, Deserialize, Default)]
struct JwtOrg {
    id: String,
    clerk_id: Option<String>,
    name: Option<String>,
    slug: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct JwtPayload {
    org: Option<JwtOrg>,
    sub: Option<String>,
    jti: Option<String>,
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(name)?.to_str().ok().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn encode_jwt(payload_json: &str) -> String {
        let header = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(b"{\"alg\":\"none\"}");
        let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(payload_json.as_bytes());
        format!("{header}.{payload}.")
    }

    #[test]
    fn organization_headers_take_precedence_over_jwt_when_all_four_present() {
        let mut headers = HeaderMap::new();
        headers.insert("x-organization-id", HeaderValue::from_static("org-from-header"));
        headers.insert("x-organization-clerk-id", HeaderValue::from_static("clerk-1"));
        headers.insert("x-organization-name", HeaderValue::from_static("Acme"));
        headers.insert("x-organization-slug", HeaderValue::from_static("acme"));
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_str(&format!(
                "Bearer {}",
                encode_jwt(r#"{"org":{"id":"org-from-jwt"}}"#)
            ))
            .unwrap(),
        );

        let ctx = RequestContext::from_headers(&headers);
        assert_eq!(ctx.organization_id(), Some("org-from-header"));
    }

    #[test]
    fn partial_organization_headers_fall_through_to_jwt() {
        let mut headers = HeaderMap::new();
        headers.insert("x-organization-id", HeaderValue::from_static("org-from-header"));
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_str(&format!(
                "Bearer {}",
                encode_jwt(r#"{"org":{"id":"org-42"}}"#)
            ))
            .unwrap(),
        );

        let ctx = RequestContext::from_headers(&headers);
        assert_eq!(ctx.organization_id(), Some("org-42"));
    }

    #[test]
    fn falls_back_to_unverified_jwt_payload() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_str(&format!(
                "Bearer {}",
                encode_jwt(r#"{"org":{"id":"org-42","clerk_id":"clerk-1","name":"Acme","slug":"acme"},"sub":"user-1","jti":"jwt-id-9"}"#)
            ))
            .unwrap(),
        );

        let ctx = RequestContext::from_headers(&headers);
        assert_eq!(ctx.organization_id(), Some("org-42"));
        assert_eq!(ctx.organization.as_ref().unwrap().clerk_id.as_deref(), Some("clerk-1"));
        assert_eq!(ctx.user_id.as_deref(), Some("user-1"));
        assert_eq!(ctx.request_id.as_deref(), Some("jwt-id-9"));
    }

    #[test]
    fn no_headers_yields_empty_context() {
        let headers = HeaderMap::new();
        assert_eq!(RequestContext::from_headers(&headers), RequestContext::default());
    }

    #[test]
    fn malformed_jwt_is_ignored_not_fatal() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer not-a-jwt"),
        );
        let ctx = RequestContext::from_headers(&headers);
        assert_eq!(ctx, RequestContext::default());
    }
}
