use crate::configuration::HealthCheckConfig;
use hyper::{
    service::{make_service_fn, service_fn},
    Body, Response, Server, StatusCode,
};

use std::convert::Infallible;

/// Serves the liveness endpoint: 200 while the fork loop is working, 417
/// once it is paused or faulted.
pub(crate) async fn healthcheck_server(
    config: HealthCheckConfig,
    indicator: impl HealthIndicator + Clone + Send + Sync + 'static,
) -> hyper::Result<()> {
    let svc = make_service_fn(move |_conn| {
        let indicator = indicator.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |_req| {
                let response = indicator.health_check().response();
                async move { response }
            }))
        }
    });
    let server = Server::bind(&config.addr).serve(svc);
    server.await
}

pub(crate) enum Verdict {
    /// Everything is ok with this indicator
    Healthy,

    /// Something's unhealthy
    Unhealthy(Box<dyn std::error::Error>),
}

impl Verdict {
    fn response(&self) -> Result<Response<Body>, hyper::http::Error> {
        use Verdict::*;
        Response::builder()
            .status(match self {
                Healthy => StatusCode::OK,
                Unhealthy(_) => StatusCode::EXPECTATION_FAILED,
            })
            .body(match self {
                Healthy => Body::from("ok\n"),
                Unhealthy(e) => Body::from(format!("unhealthy: {:?}\n", e)),
            })
    }
}

pub(crate) trait HealthIndicator {
    fn health_check(&self) -> Verdict;
}
