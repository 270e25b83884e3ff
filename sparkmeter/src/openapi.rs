//! OpenAPI document for the client-facing API.
//!
//! The webhook receiver is deliberately absent: it is called by the payment
//! provider with its own signature scheme, not by clients.

use utoipa::{
    Modify, OpenApi,
    openapi::security::{ApiKey, ApiKeyValue, SecurityScheme},
};

use crate::{api, billing, payment_providers};

/// Registers the proxy identity header as the API's security scheme.
struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "x-customer-id",
                SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::with_description(
                    "x-customer-id",
                    "Customer identity stamped by the authenticating proxy",
                ))),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "sparkmeter",
        description = "Usage metering and billing reconciliation for AI request pipelines"
    ),
    modifiers(&SecurityAddon),
    paths(
        api::handlers::usage::get_usage_stats,
        api::handlers::usage::sync_usage,
        api::handlers::subscriptions::get_current_subscription,
        api::handlers::subscriptions::create_subscription,
        api::handlers::subscriptions::update_subscription,
        api::handlers::subscriptions::cancel_subscription,
        api::handlers::payments::attach_payment_method,
        api::handlers::payments::get_upcoming_invoice,
        api::handlers::payments::create_portal_session,
    ),
    components(
        schemas(
            api::models::SyncRequest,
            api::models::CreateSubscriptionRequest,
            api::models::UpdateSubscriptionRequest,
            api::models::AttachPaymentMethodRequest,
            api::models::PortalSessionRequest,
            api::models::CheckoutSessionResponse,
            api::models::PortalSessionResponse,
            billing::SyncResult,
            billing::FailedTrace,
            billing::SkippedTrace,
            billing::UsageStats,
            billing::SubscriptionWithUsage,
            billing::converter::UsageRecord,
            billing::converter::UsageDetail,
            billing::converter::ModelUsage,
            payment_providers::MeterEventConfirmation,
            payment_providers::Subscription,
            payment_providers::UpcomingInvoice,
        )
    ),
    tags(
        (name = "usage", description = "Usage stats and billing sync"),
        (name = "subscriptions", description = "Subscription lifecycle"),
        (name = "payments", description = "Payment methods, invoices and portal"),
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_builds_and_carries_security_scheme() {
        let doc = ApiDoc::openapi();
        let components = doc.components.expect("components present");
        assert!(components.security_schemes.contains_key("x-customer-id"));
        assert!(doc.paths.paths.contains_key("/usage/sync"));
        assert!(doc.paths.paths.contains_key("/subscriptions/{id}"));
    }
}
