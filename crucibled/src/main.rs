use tracing::{Instrument, Level};
use tracing_subscriber::fmt::format::FmtSpan;

mod api;
mod run;

#[tokio::main]
async fn main() {
    tracing::subscriber::set_global_default(
        tracing_subscriber::fmt::fmt()
            .with_span_events(FmtSpan::ACTIVE)
            .with_max_level(Level::DEBUG)
            .finish(),
    )
    .expect("Could not install tracing subscriber");

    axum::Server::bind(&"0.0.0.0:8080".parse().unwrap())
        .serve(api::app().into_make_service())
        .instrument(tracing::info_span!("Agent server"))
        .await
        .expect("Could not start server");
}
