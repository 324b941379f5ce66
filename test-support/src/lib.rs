use axum::Router;
use log::LevelFilter;
use simplelog::{Config, SimpleLogger};
use tokio::net::TcpListener;

pub mod fake_brevo;
pub mod fake_ip_api;
pub mod fake_netlify;
pub mod fake_recaptcha;
pub mod fake_smtp;

pub fn setup_logging() {
    let _ = SimpleLogger::init(LevelFilter::Debug, Config::default());
}

/// Serves `router` on an ephemeral local port and returns its base URL, without a trailing slash.
///
/// Routers of several fakes can be combined with [`Router::merge`] so that one base URL serves
/// every external API the system under test talks to.
pub async fn serve(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{address}")
}

/// A base URL on which nothing listens.
pub fn unreachable_url() -> String {
    "http://127.0.0.1:9".into()
}
