use axum::body::Body;
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use stampede_service::services::random_data::RandomDataService;

const NDJSON: &str = "application/x-ndjson";

/// One line of a random data stream.
#[derive(Debug, Serialize)]
struct RandomDataItem<'a> {
    result: &'a str,
}

fn encode_line(body: &str) -> Result<Vec<u8>, serde_json::Error> {
    let mut line = serde_json::to_vec(&RandomDataItem { result: body })?;
    line.push(b'\n');
    Ok(line)
}

/// Streams the bodies of one fan-out as newline delimited JSON, in completion order.
///
/// A client hanging up drops the response body, which cancels the outstanding fetches.
pub async fn handle_random_data_request(State(service): State<RandomDataService>) -> Response {
    let receiver = service.random_data_stream();

    let lines = futures::stream::unfold(receiver, |mut receiver| async move {
        let body = receiver.recv().await?;
        Some((encode_line(&body), receiver))
    });

    ([(header::CONTENT_TYPE, NDJSON)], Body::from_stream(lines)).into_response()
}
