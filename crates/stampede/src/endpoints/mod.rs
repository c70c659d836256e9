use axum::Router;
use axum::routing::get;
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use stampede_service::services::random_data::RandomDataService;
use tower::ServiceBuilder;

mod metrics;
mod random_data;

use metrics::MetricsLayer;

use random_data::handle_random_data_request as random_data;

pub async fn healthcheck() -> &'static str {
    stampede_service::metric!(counter("healthcheck") += 1);
    "ok"
}

pub fn create_app(service: RandomDataService) -> Router {
    // The layers here go "top to bottom" according to the reading order here.
    let layer = ServiceBuilder::new()
        .layer(NewSentryLayer::new_from_top())
        .layer(SentryHttpLayer::new().enable_transaction())
        .layer(MetricsLayer);
    Router::new()
        .route("/random-data", get(random_data))
        .with_state(service)
        .layer(layer)
        // the healthcheck is last, as it will bypass all the middlewares
        .route("/healthcheck", get(healthcheck))
}
