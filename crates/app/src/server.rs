//! Actix Web control server: MJPEG preview, detection JSON, lifecycle and
//! colour endpoints.
//!
//! The server owns its own thread and Actix system so the pipeline never runs
//! on the async runtime. Blocking calls (start, stop, colour saves) go through
//! `web::block`.

use std::{sync::Arc, thread::JoinHandle, time::Duration};

use actix_web::{
    App, HttpResponse, HttpServer,
    http::header,
    web::{self, Bytes},
};
use anyhow::{Context, Result, anyhow};
use async_stream::stream;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::{
    config::{ColorEntry, SourceSpec},
    service::CameraService,
    telemetry,
};

const STREAM_TICK: Duration = Duration::from_millis(33);

/// Handle for the server thread.
pub struct ServerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// Signal a graceful shutdown and block until the thread exits.
    pub fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("http server thread panicked");
            }
        }
    }
}

/// Bind `bind:port` and serve on a dedicated thread. Bind failures are
/// returned to the caller.
pub fn spawn_server(service: Arc<CameraService>, bind: &str, port: u16) -> Result<ServerHandle> {
    let bind = bind.to_owned();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let (ready_tx, ready_rx) = oneshot::channel::<std::io::Result<()>>();
    let data = web::Data::from(service);

    let handle = std::thread::Builder::new()
        .name("http-server".into())
        .spawn(move || {
            let result = actix_web::rt::System::new().block_on(async move {
                let server = HttpServer::new(move || App::new().app_data(data.clone()).configure(routes))
                    .bind((bind.as_str(), port));
                let server = match server {
                    Ok(server) => server.run(),
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return Ok(());
                    }
                };
                let _ = ready_tx.send(Ok(()));
                info!(%bind, port, "http server listening");

                let srv_handle = server.handle();
                actix_web::rt::spawn(async move {
                    let _ = shutdown_rx.await;
                    srv_handle.stop(true).await;
                });

                server.await
            });
            if let Err(err) = result {
                error!("HTTP server error: {err}");
            }
        })
        .context("failed to spawn http server thread")?;

    match ready_rx.blocking_recv() {
        Ok(Ok(())) => Ok(ServerHandle {
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        }),
        Ok(Err(err)) => {
            let _ = handle.join();
            Err(err).context("failed to bind http server")
        }
        Err(_) => {
            let _ = handle.join();
            Err(anyhow!("http server thread exited before binding"))
        }
    }
}

/// Route table, shared with the handler tests.
pub(crate) fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/camera")
            .route("/stream", web::get().to(stream_handler))
            .route("/snapshot", web::get().to(snapshot_handler))
            .route("/detections", web::get().to(detections_handler))
            .route("/tracked", web::get().to(tracked_handler))
            .route("/status", web::get().to(status_handler))
            .route("/start", web::post().to(start_handler))
            .route("/stop", web::post().to(stop_handler)),
    )
    .route("/api/colors", web::get().to(get_colors_handler))
    .route("/api/colors", web::put().to(put_colors_handler))
    .route("/metrics", web::get().to(metrics_handler));
}

#[derive(Debug, Default, Deserialize)]
struct StartRequest {
    #[serde(default)]
    src: Option<SourceSpec>,
}

#[derive(Serialize)]
struct ErrorBody {
    ok: bool,
    error: String,
}

fn error_response(mut builder: actix_web::HttpResponseBuilder, err: &anyhow::Error) -> HttpResponse {
    builder.json(ErrorBody {
        ok: false,
        error: format!("{err:#}"),
    })
}

/// Stream the rendered feed as multipart MJPEG.
async fn stream_handler(service: web::Data<CameraService>) -> HttpResponse {
    let service = service.into_inner();
    let stream = stream! {
        let mut interval = actix_web::rt::time::interval(STREAM_TICK);
        let mut last_sequence = None;
        loop {
            interval.tick().await;
            let snapshot = service.snapshot();
            if !snapshot.has_frame() || last_sequence == Some(snapshot.frame_sequence) {
                continue;
            }
            last_sequence = Some(snapshot.frame_sequence);

            let mut payload = Vec::with_capacity(snapshot.jpeg.len() + 64);
            payload.extend_from_slice(b"--frame\r\n");
            payload.extend_from_slice(b"Content-Type: image/jpeg\r\n\r\n");
            payload.extend_from_slice(&snapshot.jpeg);
            payload.extend_from_slice(b"\r\n");
            yield Ok::<Bytes, actix_web::Error>(Bytes::from(payload));
        }
    };

    HttpResponse::Ok()
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .insert_header((header::ACCESS_CONTROL_ALLOW_HEADERS, "*"))
        .insert_header((header::ACCESS_CONTROL_ALLOW_METHODS, "GET"))
        .append_header(("Cache-Control", "no-cache"))
        .append_header(("Content-Type", "multipart/x-mixed-replace; boundary=frame"))
        .streaming(stream)
}

async fn snapshot_handler(service: web::Data<CameraService>) -> HttpResponse {
    let snapshot = service.snapshot();
    if snapshot.has_frame() {
        HttpResponse::Ok()
            .content_type("image/jpeg")
            .body(snapshot.jpeg.clone())
    } else {
        HttpResponse::NoContent().finish()
    }
}

async fn detections_handler(service: web::Data<CameraService>) -> HttpResponse {
    HttpResponse::Ok().json(service.snapshot().detection_records())
}

async fn tracked_handler(service: web::Data<CameraService>) -> HttpResponse {
    HttpResponse::Ok().json(service.snapshot().tracked_records())
}

async fn status_handler(service: web::Data<CameraService>) -> HttpResponse {
    HttpResponse::Ok().json(service.status())
}

async fn start_handler(service: web::Data<CameraService>, body: Bytes) -> HttpResponse {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        StartRequest::default()
    } else {
        match serde_json::from_slice::<StartRequest>(&body) {
            Ok(request) => request,
            Err(err) => {
                let err = anyhow!(err).context("invalid start request");
                return error_response(HttpResponse::BadRequest(), &err);
            }
        }
    };

    let service = service.into_inner();
    let source = request.src.map(|src| src.to_string());
    match web::block(move || service.start(source)).await {
        Ok(Ok(status)) => HttpResponse::Ok().json(status),
        Ok(Err(err)) => {
            warn!(error = %format!("{err:#}"), "camera start rejected");
            error_response(HttpResponse::ServiceUnavailable(), &err)
        }
        Err(err) => error_response(HttpResponse::InternalServerError(), &anyhow!("{err}")),
    }
}

async fn stop_handler(service: web::Data<CameraService>) -> HttpResponse {
    let service = service.into_inner();
    match web::block(move || service.stop()).await {
        Ok(status) => HttpResponse::Ok().json(status),
        Err(err) => error_response(HttpResponse::InternalServerError(), &anyhow!("{err}")),
    }
}

async fn get_colors_handler(service: web::Data<CameraService>) -> HttpResponse {
    HttpResponse::Ok().json(service.colors())
}

async fn put_colors_handler(
    service: web::Data<CameraService>,
    entries: web::Json<Vec<ColorEntry>>,
) -> HttpResponse {
    let service = service.into_inner();
    let entries = entries.into_inner();
    match web::block(move || service.save_colors(&entries)).await {
        Ok(Ok(specs)) => HttpResponse::Ok().json(specs),
        Ok(Err(err)) => error_response(HttpResponse::BadRequest(), &err),
        Err(err) => error_response(HttpResponse::InternalServerError(), &anyhow!("{err}")),
    }
}

async fn metrics_handler() -> HttpResponse {
    match telemetry::prometheus_handle() {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::ServiceUnavailable().body("metrics recorder not installed"),
    }
}

#[cfg(test)]
mod tests {
    use actix_web::{http::StatusCode, test};
    use serde_json::Value;
    use video_ingest::{CaptureError, CaptureSettings, FrameSource};
    use vision::{Pipeline, PipelineConfig};

    use super::*;
    use crate::config::ColorCatalog;

    fn unplugged(dir: &tempfile::TempDir) -> Arc<CameraService> {
        let catalog = ColorCatalog::load_or_create(&dir.path().join("colors.json")).unwrap();
        let pipeline = Pipeline::with_source_factory(
            PipelineConfig::default(),
            catalog.specs().to_vec(),
            |_: &CaptureSettings| -> Result<FrameSource, CaptureError> {
                Err(CaptureError::Open {
                    uri: "fake://unplugged".into(),
                    reason: "no such device".into(),
                })
            },
        );
        Arc::new(CameraService::from_parts(pipeline, catalog))
    }

    #[actix_web::test]
    async fn idle_service_reports_stopped_and_no_frame() {
        let dir = tempfile::tempdir().unwrap();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::from(unplugged(&dir)))
                .configure(routes),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/camera/status").to_request();
        let status: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(status["state"], "stopped");
        assert_eq!(status["running"], false);

        let req = test::TestRequest::get().uri("/api/camera/snapshot").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let req = test::TestRequest::get().uri("/api/camera/detections").to_request();
        let detections: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(detections, serde_json::json!([]));
    }

    #[actix_web::test]
    async fn start_reports_open_failures() {
        let dir = tempfile::tempdir().unwrap();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::from(unplugged(&dir)))
                .configure(routes),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/camera/start")
            .set_json(serde_json::json!({ "src": "/nonexistent/camera" }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["ok"], false);

        let req = test::TestRequest::post()
            .uri("/api/camera/start")
            .set_payload("{not json")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn colours_round_trip_through_the_api() {
        let dir = tempfile::tempdir().unwrap();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::from(unplugged(&dir)))
                .configure(routes),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/colors").to_request();
        let colors: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(colors.as_array().map(Vec::len), Some(7));

        let req = test::TestRequest::put()
            .uri("/api/colors")
            .set_json(serde_json::json!([
                { "name": "yellow", "action_id": 12 },
                { "name": "teal" }
            ]))
            .to_request();
        let saved: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(saved.as_array().map(Vec::len), Some(1));
        assert_eq!(saved[0]["name"], "yellow");
        assert_eq!(saved[0]["action_id"], 12);
        assert_eq!(saved[0]["lower"], serde_json::json!([22, 100, 100]));

        let req = test::TestRequest::get().uri("/api/colors").to_request();
        let colors: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(colors, saved);
    }
}
