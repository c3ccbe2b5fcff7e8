use crate::metrics::MetricsLayer;

use hyper_util::rt::TokioExecutor;
use kube::Result;
use kube::{Client, Config, client::ConfigExt};
use opentelemetry::metrics::Meter;
use tower::{BoxError, ServiceBuilder};

/// Builds a `kube::Client` whose requests are counted and timed on `meter`.
pub async fn new_client_with_metrics(config: Config, meter: &Meter) -> Result<Client> {
    let https = config.rustls_https_connector()?;
    let service = ServiceBuilder::new()
        .layer(MetricsLayer::new(meter))
        .layer(config.base_uri_layer())
        .option_layer(config.auth_layer()?)
        .map_err(BoxError::from)
        .service(hyper_util::client::legacy::Client::builder(TokioExecutor::new()).build(https));

    Ok(Client::new(service, config.default_namespace))
}
