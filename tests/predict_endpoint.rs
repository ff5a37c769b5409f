use std::path::Path;
use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use image::{DynamicImage, GenericImageView, GrayImage, Luma, Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};
use tower::ServiceExt;

use pix2pix::image::{encode_image, OutputFormat};
use pix2pix::server::{self, PredictResponse};
use pix2pix::{Architecture, CheckpointLocation, Config, DataUrl, Error, Generator, Predictor};

const BASE_FILTERS: usize = 2;

/// Write a small freshly initialized checkpoint and restore a predictor from it,
/// going through the same startup path as the server.
fn predictor_from_disk(root: &Path) -> Predictor {
    let location = CheckpointLocation::new(root, "pix2pix", "ckpt-1");
    let architecture = Architecture::with_base_filters(BASE_FILTERS).unwrap();
    let mut rng = StdRng::seed_from_u64(2024);
    Generator::initialized(architecture, &mut rng)
        .unwrap()
        .save(location.path())
        .unwrap();

    Predictor::new(Config {
        checkpoint: location,
        base_filters: BASE_FILTERS,
        ..Config::default()
    })
    .unwrap()
}

fn png_data_url(img: &RgbImage) -> String {
    let bytes = encode_image(img, OutputFormat::Png, 95).unwrap();
    DataUrl::new("image/png", bytes).to_string()
}

async fn post_predict(app: Router, body: Value) -> (StatusCode, Value) {
    post_predict_raw(app, body.to_string()).await
}

async fn post_predict_raw(app: Router, body: String) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri("/predict")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

fn decode_response_image(body: &Value) -> DynamicImage {
    let response: PredictResponse = serde_json::from_value(body.clone()).unwrap();
    assert!(response.success);
    let url = DataUrl::parse(&response.image.unwrap()).unwrap();
    image::load_from_memory(url.data()).unwrap()
}

#[tokio::test]
async fn test_white_512_png_yields_256_rgb() {
    let dir = tempfile::tempdir().unwrap();
    let app = server::router(Arc::new(predictor_from_disk(dir.path())), None);

    let white = RgbImage::from_pixel(512, 512, Rgb([255, 255, 255]));
    let (status, body) = post_predict(app, json!({ "image": png_data_url(&white) })).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(true));
    assert!(body["image"]
        .as_str()
        .unwrap()
        .starts_with("data:image/png;base64,"));

    let output = decode_response_image(&body);
    assert_eq!(output.dimensions(), (256, 256));
    assert_eq!(output.color().channel_count(), 3);
}

#[tokio::test]
async fn test_grayscale_input_is_forced_to_rgb() {
    let dir = tempfile::tempdir().unwrap();
    let app = server::router(Arc::new(predictor_from_disk(dir.path())), None);

    let gray = GrayImage::from_pixel(120, 90, Luma([77]));
    let mut bytes = Vec::new();
    DynamicImage::ImageLuma8(gray)
        .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
        .unwrap();
    let url = DataUrl::new("image/png", bytes).to_string();

    let (status, body) = post_predict(app, json!({ "image": url })).await;

    assert_eq!(status, StatusCode::OK);
    let output = decode_response_image(&body);
    assert_eq!(output.dimensions(), (256, 256));
    assert_eq!(output.color().channel_count(), 3);
}

#[tokio::test]
async fn test_multi_megabyte_upload_is_accepted() {
    let dir = tempfile::tempdir().unwrap();
    let app = server::router(Arc::new(predictor_from_disk(dir.path())), None);

    // Noise does not compress, so the encoded body is well past 2 MiB.
    let mut rng = StdRng::seed_from_u64(7);
    let noise = RgbImage::from_fn(1200, 1200, |_, _| Rgb([rng.random(), rng.random(), rng.random()]));
    let url = png_data_url(&noise);
    assert!(url.len() > 4 * 1024 * 1024);

    let (status, body) = post_predict(app, json!({ "image": url })).await;

    assert_eq!(status, StatusCode::OK);
    let output = decode_response_image(&body);
    assert_eq!(output.dimensions(), (256, 256));
}

#[tokio::test]
async fn test_invalid_request_bodies_are_failure_responses() {
    let dir = tempfile::tempdir().unwrap();
    let app = server::router(Arc::new(predictor_from_disk(dir.path())), None);

    for body in [json!({ "img": "x" }).to_string(), "not json".to_string()] {
        let (status, response) = post_predict_raw(app.clone(), body).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        let response: PredictResponse = serde_json::from_value(response).unwrap();
        assert!(!response.success);
        assert!(response.image.is_none());
        assert!(response.error.is_some());
    }
}

#[tokio::test]
async fn test_malformed_base64_is_a_failure_response() {
    let dir = tempfile::tempdir().unwrap();
    let app = server::router(Arc::new(predictor_from_disk(dir.path())), None);

    let (status, body) = post_predict(
        app,
        json!({ "image": "data:image/png;base64,this is %% not base64" }),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], json!(false));
    assert!(body.get("image").is_none());
}

#[tokio::test]
async fn test_service_keeps_serving_after_a_bad_request() {
    let dir = tempfile::tempdir().unwrap();
    let app = server::router(Arc::new(predictor_from_disk(dir.path())), None);

    let garbage = DataUrl::new("image/png", b"\x89PNG but truncated".to_vec()).to_string();
    let (status, body) = post_predict(app.clone(), json!({ "image": garbage })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], json!(false));

    let sketch = RgbImage::from_fn(64, 64, |x, y| {
        if (x + y) % 9 == 0 {
            Rgb([0, 0, 0])
        } else {
            Rgb([255, 255, 255])
        }
    });
    let (status, body) = post_predict(app, json!({ "image": png_data_url(&sketch) })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(true));
}

#[tokio::test]
async fn test_evaluation_mode_responses_are_reproducible() {
    let dir = tempfile::tempdir().unwrap();
    let app = server::router(Arc::new(predictor_from_disk(dir.path())), None);

    let sketch = RgbImage::from_fn(200, 150, |x, _| Rgb([(x % 256) as u8, 128, 64]));
    let request = json!({ "image": png_data_url(&sketch) });

    let (_, first) = post_predict(app.clone(), request.clone()).await;
    let (_, second) = post_predict(app, request).await;

    assert_eq!(first["image"], second["image"]);
}

#[tokio::test]
async fn test_static_files_and_health() {
    let dir = tempfile::tempdir().unwrap();
    let public = dir.path().join("public");
    std::fs::create_dir_all(&public).unwrap();
    std::fs::write(public.join("index.html"), "<h1>sketch</h1>").unwrap();

    let app = server::router(
        Arc::new(predictor_from_disk(dir.path())),
        Some(public.as_path()),
    );

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"<h1>sketch</h1>");

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/missing.js").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[test]
fn test_incompatible_checkpoint_prevents_startup() {
    let dir = tempfile::tempdir().unwrap();
    let location = CheckpointLocation::new(dir.path(), "pix2pix", "ckpt-1");
    let mut rng = StdRng::seed_from_u64(1);
    Generator::initialized(Architecture::with_base_filters(4).unwrap(), &mut rng)
        .unwrap()
        .save(location.path())
        .unwrap();

    let result = Predictor::new(Config {
        checkpoint: location,
        base_filters: BASE_FILTERS,
        ..Config::default()
    });

    assert!(matches!(result, Err(Error::ParameterShape { .. })));
}
