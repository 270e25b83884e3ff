//! Customer identity extraction from trusted proxy headers.
//!
//! Authentication itself lives in front of this service; by the time a
//! request arrives here, the proxy has already verified the caller and
//! stamped the request with identity headers. The extractor only reads
//! them back out.

use axum::{extract::FromRequestParts, http::request::Parts};

use crate::{
    errors::{Error, Result},
    types::CustomerId,
};

/// Header carrying the payment-provider customer id. Required.
pub const CUSTOMER_ID_HEADER: &str = "x-customer-id";
/// Header carrying the subscription tier. Optional, defaults to `free`.
pub const SUBSCRIPTION_TIER_HEADER: &str = "x-subscription-tier";

/// The customer a request is acting on behalf of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentCustomer {
    pub customer_id: CustomerId,
    pub subscription_tier: String,
}

impl<S> FromRequestParts<S> for CurrentCustomer
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self> {
        let customer_id = parts
            .headers
            .get(CUSTOMER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .ok_or(Error::Unauthenticated {
                message: Some(format!("Missing {CUSTOMER_ID_HEADER} header")),
            })?
            .to_string();

        let subscription_tier = parts
            .headers
            .get(SUBSCRIPTION_TIER_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .unwrap_or("free")
            .to_string();

        Ok(CurrentCustomer {
            customer_id,
            subscription_tier,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(request: Request<()>) -> Result<CurrentCustomer> {
        let (mut parts, ()) = request.into_parts();
        CurrentCustomer::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn headers_resolve_to_customer() {
        let request = Request::builder()
            .header(CUSTOMER_ID_HEADER, "cus_123")
            .header(SUBSCRIPTION_TIER_HEADER, "pro")
            .body(())
            .unwrap();

        let customer = extract(request).await.unwrap();
        assert_eq!(customer.customer_id, "cus_123");
        assert_eq!(customer.subscription_tier, "pro");
    }

    #[tokio::test]
    async fn tier_defaults_to_free() {
        let request = Request::builder()
            .header(CUSTOMER_ID_HEADER, "cus_123")
            .body(())
            .unwrap();

        let customer = extract(request).await.unwrap();
        assert_eq!(customer.subscription_tier, "free");
    }

    #[tokio::test]
    async fn missing_customer_header_is_unauthenticated() {
        let request = Request::builder().body(()).unwrap();

        let error = extract(request).await.unwrap_err();
        assert!(matches!(error, Error::Unauthenticated { .. }));
    }
}
