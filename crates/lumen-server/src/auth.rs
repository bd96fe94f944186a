use axum::http::header::{HeaderMap, HeaderName, InvalidHeaderName};

use lumen_core::user::EffectiveUser;

/// Message returned with every 401.
pub const UNAUTHORIZED: &str = "Unauthorized";

const EMAIL_HEADER: &str = "x-lumen-email";

/// Resolves the identity a request runs as.
///
/// `None` rejects the request before any conversation state is touched.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, headers: &HeaderMap) -> Option<EffectiveUser>;
}

/// Trusts identity headers set by an upstream proxy.
#[derive(Clone, Debug)]
pub struct HeaderAuthenticator {
    user_header: HeaderName,
    tenant_header: HeaderName,
    email_header: HeaderName,
}

impl HeaderAuthenticator {
    pub fn new(user_header: &str, tenant_header: &str) -> Result<Self, InvalidHeaderName> {
        Ok(Self {
            user_header: HeaderName::from_bytes(user_header.as_bytes())?,
            tenant_header: HeaderName::from_bytes(tenant_header.as_bytes())?,
            email_header: HeaderName::from_static(EMAIL_HEADER),
        })
    }
}

impl Authenticator for HeaderAuthenticator {
    fn authenticate(&self, headers: &HeaderMap) -> Option<EffectiveUser> {
        let user_id = header_value(headers, &self.user_header)?;
        let tenant_id = header_value(headers, &self.tenant_header)?;
        let mut user = EffectiveUser::new(user_id, tenant_id);
        user.email = header_value(headers, &self.email_header);
        Some(user)
    }
}

fn header_value(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    let value = headers.get(name)?.to_str().ok()?.trim();
    (!value.is_empty()).then(|| value.to_string())
}
