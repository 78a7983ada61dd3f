use tracing::*;
use warp::*;

use podscaler_controller::admission::{mutate_handler, validate_handler};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let mutate_route = path("mutate").and(body::json()).and_then(mutate_handler);
    let validate_route = path("validate").and(body::json()).and_then(validate_handler);
    let routes = mutate_route.or(validate_route).with(trace::request());

    info!("running podscaler-admission-controller");
    serve(post().and(routes))
        .tls()
        .cert_path("/certs/tls.crt")
        .key_path("/certs/tls.key")
        .run(([0, 0, 0, 0], 8443))
        .await;
}
