mod common;

use axum::http::StatusCode;
use serde_json::json;

use common::{HIDDEN, assert_ok, body_json, post_json, router};

fn norm(values: &[serde_json::Value]) -> f64 {
    values
        .iter()
        .map(|v| v.as_f64().unwrap().powi(2))
        .sum::<f64>()
        .sqrt()
}

#[tokio::test]
async fn single_input_is_unit_length() {
    let response = post_json(router(), "/v1/embeddings", json!({"input": "hello world"})).await;
    assert_ok(&response);

    let body = body_json(response).await;
    let data = body["data"].as_array().unwrap();
    assert_eq!(data.len(), 1);
    assert_eq!(data[0]["object"], "embedding");
    assert_eq!(data[0]["index"], 0);

    let vector = data[0]["embedding"].as_array().unwrap();
    assert_eq!(vector.len(), HIDDEN as usize);
    assert!((norm(vector) - 1.0).abs() < 1e-5);
    assert_eq!(body["usage"]["prompt_tokens"], 2);
}

#[tokio::test]
async fn batch_returns_one_vector_per_input_ignoring_padding() {
    let batch = body_json(
        post_json(router(), "/v1/embeddings", json!({"input": ["gamma", "alpha beta gamma"]})).await,
    )
    .await;
    let data = batch["data"].as_array().unwrap();
    assert_eq!(data.len(), 2);
    assert_eq!(data[1]["index"], 1);
    for item in data {
        let vector = item["embedding"].as_array().unwrap();
        assert_eq!(vector.len(), HIDDEN as usize);
        assert!((norm(vector) - 1.0).abs() < 1e-5);
    }

    // the short input was padded inside the batch; alone it must embed the same
    let single = body_json(post_json(router(), "/v1/embeddings", json!({"input": "gamma"})).await).await;
    let padded: Vec<f64> = data[0]["embedding"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_f64().unwrap())
        .collect();
    let alone: Vec<f64> = single["data"][0]["embedding"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_f64().unwrap())
        .collect();
    for (a, b) in padded.iter().zip(&alone) {
        assert!((a - b).abs() < 1e-5);
    }
}

#[tokio::test]
async fn empty_batch_is_rejected() {
    let response = post_json(router(), "/v1/embeddings", json!({"input": []})).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
