//! Read-only HTML status page served on GET `/`.

use std::sync::Arc;

use axum::extract::State;
use axum::response::Html;

use super::listener::GetworkService;

pub async fn status_page(State(service): State<Arc<GetworkService>>) -> Html<String> {
    let registry = service.registry();
    let dag = registry
        .current_job()
        .map(|job| job.dag_id().to_string())
        .unwrap_or_else(|| "-".to_string());

    let mut pools = String::new();
    for upstream in registry.upstreams() {
        let state = if upstream.is_connected() { "connected" } else { "disconnected" };
        let remote = upstream.remote_ip().unwrap_or_else(|| "-".to_string());
        pools.push_str(&format!(
            "<li>{}:{} ({}) {}</li>\n",
            upstream.host(),
            upstream.port(),
            remote,
            state
        ));
    }

    Html(format!(
        "<html><head><title>eth-proxy</title></head><body>\n\
         <h3>Ethereum Stratum proxy</h3>\n\
         <p>DAG: <code>{}</code></p>\n\
         <ul>\n{}</ul>\n\
         </body></html>\n",
        dag, pools
    ))
}
