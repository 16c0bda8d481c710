use std::time::Duration;

use reqwest::Client;

/// Shared connection-pooling client used by an adapter instance.
///
/// Hyper's pool exposes only idle-connection knobs; a short idle timeout
/// keeps DNS changes visible without a connection TTL.
pub(crate) fn build_http_client(connect_timeout: Duration) -> Client {
    Client::builder()
        .connect_timeout(connect_timeout)
        .pool_idle_timeout(Some(Duration::from_secs(5)))
        .tcp_nodelay(true)
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .build()
        .expect("default HTTP client configuration is valid")
}
