use crate::boundary::BoundarySource;
use crate::config::{AppConfig, StyleConfig};
use crate::error::PipelineError;
use crate::geocode::Geocoder;
use crate::pipeline::{self, PipelineContext, RenderRequest, RunReport};
use crate::render::{escape_html, HexColor, MapStyle};
use crate::types::Mode;
use anyhow::Result;
use axum::{
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, Path, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Router,
};
use std::collections::HashMap;
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

const MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

pub struct AppState {
    pub config: AppConfig,
    pub geocoder: Box<dyn Geocoder + Send + Sync>,
    pub boundaries: Box<dyn BoundarySource + Send + Sync>,
}

/// Fields submitted by the upload form.
#[derive(Debug, Default)]
pub struct RenderForm {
    pub file: Option<Vec<u8>>,
    pub fields: HashMap<String, String>,
}

impl RenderForm {
    fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(|v| v.trim()).filter(|v| !v.is_empty())
    }

    /// Missing fields fall back to the configured style.
    pub fn request(&self, defaults: &StyleConfig) -> Result<RenderRequest, PipelineError> {
        let mode = match self.field("mode") {
            Some(m) => m.parse::<Mode>().map_err(PipelineError::Style)?,
            None => Mode::WithinRegion,
        };

        let marker_scale = match self.field("size") {
            Some(v) => v
                .parse::<f64>()
                .map_err(|_| PipelineError::Style(format!("'{v}' is not a number")))?,
            None => defaults.marker_scale,
        };
        let marker_color = self.field("color").unwrap_or(defaults.marker_color.as_str());

        let boundary = match mode {
            Mode::WithinRegion => {
                let width = match self.field("region_width") {
                    Some(v) => v
                        .parse::<u8>()
                        .map_err(|_| PipelineError::Style(format!("'{v}' is not a line width")))?,
                    None => defaults.region_width,
                };
                Some((width, self.field("region_color").unwrap_or(defaults.region_color.as_str())))
            }
            Mode::CrossRegion => None,
        };

        Ok(RenderRequest {
            mode,
            style: MapStyle::new(marker_scale, marker_color, boundary)?,
        })
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let maps = ServeDir::new(&state.config.output.dir);

    Router::new()
        .route("/", get(index_handler))
        .route("/render", post(render_handler))
        .route("/download/:mode", get(download_handler))
        .nest_service("/maps", maps)
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn start_server(
    config: AppConfig,
    geocoder: Box<dyn Geocoder + Send + Sync>,
    boundaries: Box<dyn BoundarySource + Send + Sync>,
) -> Result<()> {
    let port = config.server.port;
    let state = Arc::new(AppState {
        config,
        geocoder,
        boundaries,
    });

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("Starting server on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Html<String> {
    Html(form_page(&state.config))
}

async fn read_form(mut multipart: Multipart) -> Result<RenderForm, MultipartError> {
    let mut form = RenderForm::default();
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        if name == "file" {
            let bytes = field.bytes().await?;
            if !bytes.is_empty() {
                form.file = Some(bytes.to_vec());
            }
        } else {
            let value = field.text().await?;
            form.fields.insert(name, value);
        }
    }
    Ok(form)
}

async fn render_handler(State(state): State<Arc<AppState>>, multipart: Multipart) -> Response {
    let mut form = match read_form(multipart).await {
        Ok(form) => form,
        Err(e) => return message_page(StatusCode::BAD_REQUEST, "Upload failed", &e.to_string()),
    };

    let Some(file) = form.file.take() else {
        return message_page(StatusCode::BAD_REQUEST, "No file", "Please choose a CSV file.");
    };

    let request = match form.request(&state.config.style) {
        Ok(r) => r,
        Err(e) => return message_page(StatusCode::BAD_REQUEST, "Invalid parameters", &e.to_string()),
    };

    let worker = state.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        let ctx = PipelineContext {
            config: &worker.config,
            geocoder: worker.geocoder.as_ref(),
            boundaries: Some(worker.boundaries.as_ref() as &dyn BoundarySource),
        };
        pipeline::run(Cursor::new(file), &request, &ctx)
    })
    .await;

    match outcome {
        Ok(Ok(report)) => Html(result_page(&state.config, request.mode, &report)).into_response(),
        Ok(Err(e)) if e.is_user_error() => {
            message_page(StatusCode::BAD_REQUEST, "The map could not be created", &e.to_string())
        }
        Ok(Err(e)) => {
            error!("Render failed: {:#}", e);
            message_page(StatusCode::INTERNAL_SERVER_ERROR, "The map could not be created", &e.to_string())
        }
        Err(e) => {
            error!("Render task failed: {}", e);
            message_page(StatusCode::INTERNAL_SERVER_ERROR, "The map could not be created", "Internal error.")
        }
    }
}

async fn download_handler(
    State(state): State<Arc<AppState>>,
    Path(mode): Path<String>,
) -> Response {
    let Ok(mode) = mode.parse::<Mode>() else {
        return message_page(StatusCode::NOT_FOUND, "Not found", "Unknown map.");
    };

    let file_name = state.config.output.file_name(mode).to_string();
    match tokio::fs::read(state.config.output.path_for(mode)).await {
        Ok(bytes) => (
            [
                (header::CONTENT_TYPE, "text/html; charset=utf-8".to_string()),
                (header::CONTENT_DISPOSITION, attachment(&file_name)),
            ],
            bytes,
        )
            .into_response(),
        Err(_) => message_page(StatusCode::NOT_FOUND, "No map yet", "Create a map first."),
    }
}

fn attachment(file_name: &str) -> String {
    let safe: String = file_name
        .chars()
        .filter(|c| *c != '"' && *c != '\\' && !c.is_control())
        .collect();
    format!("attachment; filename=\"{safe}\"")
}

fn form_page(config: &AppConfig) -> String {
    let style = &config.style;
    let color = |value: &str, fallback: &str| {
        HexColor::parse(value)
            .map(|c| c.to_string())
            .unwrap_or_else(|_| fallback.to_string())
    };

    FORM_TEMPLATE
        .replace("{{REGION}}", &escape_html(&config.region.name))
        .replace("{{SIZE}}", &style.marker_scale.to_string())
        .replace("{{COLOR}}", &color(&style.marker_color, "#0000ff"))
        .replace("{{REGION_WIDTH}}", &style.region_width.to_string())
        .replace("{{REGION_COLOR}}", &color(&style.region_color, "#ff0000"))
}

fn result_page(config: &AppConfig, mode: Mode, report: &RunReport) -> String {
    let file_name = escape_html(config.output.file_name(mode));
    let mut body = format!(
        "<p>Map created with {} places. Click to download it:</p>\
         <p><a class=\"button\" href=\"/download/{}\">Download the map</a> \
         <a href=\"/maps/{}\" target=\"_blank\">Preview</a></p>",
        report.places.len(),
        mode.slug(),
        file_name,
    );
    for warning in &report.warnings {
        body.push_str(&format!("<p class=\"warning\">{}</p>", escape_html(warning)));
    }
    if report.skipped_blank > 0 {
        body.push_str(&format!(
            "<p class=\"warning\">{} rows without a place were ignored.</p>",
            report.skipped_blank
        ));
    }
    page("Map ready", &body)
}

fn message_page(status: StatusCode, title: &str, message: &str) -> Response {
    let body = format!("<p class=\"error\">{}</p>", escape_html(message));
    (status, Html(page(title, &body))).into_response()
}

fn page(title: &str, body: &str) -> String {
    PAGE_TEMPLATE
        .replace("{{TITLE}}", &escape_html(title))
        .replace("{{BODY}}", body)
}

const PAGE_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
  <meta charset="utf-8" />
  <title>{{TITLE}}</title>
  <style>
    body { font-family: sans-serif; max-width: 40rem; margin: 2rem auto; }
    .warning { color: #a15c00; }
    .error { color: #b00020; }
    .button { padding: 0.4rem 0.8rem; background: #1d4ed8; color: white; text-decoration: none; border-radius: 4px; }
  </style>
</head>
<body>
  <h1>{{TITLE}}</h1>
  {{BODY}}
  <p><a href="/">Back</a></p>
</body>
</html>
"#;

const FORM_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
  <meta charset="utf-8" />
  <title>Mobility analysis</title>
  <style>
    body { font-family: sans-serif; max-width: 40rem; margin: 2rem auto; }
    label { display: block; margin-top: 1rem; }
  </style>
</head>
<body>
  <h1>Mobility analysis</h1>
  <form action="/render" method="post" enctype="multipart/form-data">
    <label>CSV file <input type="file" name="file" accept=".csv,text/csv" required /></label>
    <label>Mode
      <select name="mode" id="mode">
        <option value="within">Within {{REGION}}</option>
        <option value="cross">Cross-region</option>
      </select>
    </label>
    <label>Circle size <output id="size-out">{{SIZE}}</output>
      <input type="range" name="size" min="0.1" max="1.0" step="0.1" value="{{SIZE}}"
             oninput="document.getElementById('size-out').value = this.value" />
    </label>
    <label>Circle color <input type="color" name="color" value="{{COLOR}}" /></label>
    <fieldset id="region">
      <label>Region line width <output id="width-out">{{REGION_WIDTH}}</output>
        <input type="range" name="region_width" min="1" max="10" step="1" value="{{REGION_WIDTH}}"
               oninput="document.getElementById('width-out').value = this.value" />
      </label>
      <label>Region line color <input type="color" name="region_color" value="{{REGION_COLOR}}" /></label>
    </fieldset>
    <p><button type="submit">Create the map</button></p>
  </form>
  <script>
    const mode = document.getElementById("mode");
    const region = document.getElementById("region");
    mode.addEventListener("change", () => { region.disabled = mode.value !== "within"; });
  </script>
</body>
</html>
"#;
