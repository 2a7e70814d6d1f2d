use hyper::header::CONTENT_TYPE;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use log::error;
use prometheus::{gather, Encoder, TextEncoder};
use std::net::SocketAddr;

async fn serve_metrics(_req: Request<Body>) -> Result<Response<Body>, hyper::Error> {
    let encoder = TextEncoder::new();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&gather(), &mut buffer) {
        error!("Error encoding metrics: {}", e);
        buffer.clear();
    }

    let response = Response::builder()
        .status(200)
        .header(CONTENT_TYPE, encoder.format_type())
        .body(Body::from(buffer))
        .expect("building metrics response");

    Ok(response)
}

/// Serves metrics in Prometheus text format on a dedicated thread.
pub fn start_http_server(addr: SocketAddr) {
    std::thread::spawn(move || {
        let mut runtime = tokio::runtime::Builder::new_current_thread();
        runtime.enable_all();
        let runtime = match runtime.build() {
            Ok(runtime) => runtime,
            Err(e) => {
                error!("Error starting metrics runtime: {}", e);
                return;
            }
        };
        let served = runtime.block_on(async move {
            Server::try_bind(&addr)?
                .serve(make_service_fn(|_| async {
                    Ok::<_, hyper::Error>(service_fn(serve_metrics))
                }))
                .await
        });
        if let Err(e) = served {
            error!("Error serving metrics on {}: {}", addr, e);
        }
    });
}
