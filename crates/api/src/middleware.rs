use axum::{
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};

use dirpack_core::OwnerId;

use crate::context::OwnerContext;

/// Header carrying the authenticated owner, set by the fronting gateway.
pub const OWNER_HEADER: &str = "x-owner-id";

pub async fn owner_middleware(
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let owner = extract_owner(req.headers())?;
    req.extensions_mut().insert(OwnerContext::new(owner));
    Ok(next.run(req).await)
}

fn extract_owner(headers: &HeaderMap) -> Result<OwnerId, StatusCode> {
    let value = headers.get(OWNER_HEADER).ok_or(StatusCode::UNAUTHORIZED)?;
    let value = value.to_str().map_err(|_| StatusCode::UNAUTHORIZED)?.trim();
    if value.is_empty() {
        return Err(StatusCode::UNAUTHORIZED);
    }
    value.parse().map_err(|_| StatusCode::UNAUTHORIZED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn owner_header_must_be_a_uuid() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_owner(&headers), Err(StatusCode::UNAUTHORIZED));

        headers.insert(OWNER_HEADER, HeaderValue::from_static("not-a-uuid"));
        assert_eq!(extract_owner(&headers), Err(StatusCode::UNAUTHORIZED));

        let owner = OwnerId::new();
        headers.insert(OWNER_HEADER, HeaderValue::from_str(&format!(" {owner} ")).unwrap());
        assert_eq!(extract_owner(&headers), Ok(owner));
    }
}
