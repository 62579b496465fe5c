use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use axum::response::Html;
use clap::Parser;
use tower_http::services::{ServeDir, ServeFile};

use unitplan::app::{AppState, router};
use unitplan::catalog::Catalog;
use unitplan::descriptors::DescriptorCatalog;
use unitplan::openai::{OpenAiClient, OpenAiConfig};
use unitplan::render::DocumentRenderer;
use unitplan::store::{LocalFsSessionStore, SessionStore};
use unitplan::synth::UnitGenerator;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct AppArgs {
    #[arg(long, default_value = "127.0.0.1:8080")]
    addr: SocketAddr,

    /// Session and unit records.
    #[arg(long, default_value = "workspace-app")]
    data_dir: PathBuf,

    /// Generated documents (default: `<data_dir>/generated`).
    #[arg(long)]
    out_dir: Option<PathBuf>,

    /// `.docx` template with `{field}` placeholders (default: built-in).
    #[arg(long)]
    template: Option<PathBuf>,

    /// `.docx` evaluation template (default: built-in).
    #[arg(long)]
    eval_template: Option<PathBuf>,

    /// Curriculum catalog (YAML) replacing the built-in one.
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Assessment descriptors (YAML) replacing the built-in ones.
    #[arg(long)]
    descriptors: Option<PathBuf>,

    /// Static web assets directory (serve if exists).
    #[arg(long, default_value = "public")]
    web_dir: PathBuf,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return std::process::ExitCode::FAILURE;
    }
    std::process::ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    unitplan::logging::init_with_default(unitplan::logging::SERVER_FILTER)?;

    let args = AppArgs::parse();
    tracing::info!(?args, "starting unitplan-app");

    let catalog = Catalog::load_or_builtin(args.catalog.as_deref()).context("load catalog")?;
    let descriptors = DescriptorCatalog::load_or_builtin(args.descriptors.as_deref())
        .context("load descriptors")?;
    for template in [&args.template, &args.eval_template].into_iter().flatten() {
        if !template.is_file() {
            anyhow::bail!("template not found: {}", template.display());
        }
    }

    let config = OpenAiConfig::from_env();
    let generator: Option<Arc<dyn UnitGenerator>> =
        match OpenAiClient::from_config(&config).context("build openai client")? {
            Some(client) => {
                tracing::info!(
                    model = %client.model(),
                    base_url = %config.base_url,
                    "unit generation via OpenAI"
                );
                Some(Arc::new(client) as Arc<dyn UnitGenerator>)
            }
            None => {
                tracing::info!("OPENAI_API_KEY is not set; units are partitioned without a model");
                None
            }
        };

    let store: Arc<dyn SessionStore> = Arc::new(LocalFsSessionStore::new(&args.data_dir));
    let out_dir = args
        .out_dir
        .clone()
        .unwrap_or_else(|| args.data_dir.join("generated"));
    let state = AppState {
        catalog: Arc::new(catalog),
        descriptors: Arc::new(descriptors),
        store,
        generator,
        renderer: Arc::new(
            DocumentRenderer::new(args.template.clone(), out_dir)
                .with_evaluation_template(args.eval_template.clone()),
        ),
    };

    let mut app = router(state);

    let web_index = args.web_dir.join("index.html");
    if web_index.exists() {
        let static_files =
            ServeDir::new(&args.web_dir).not_found_service(ServeFile::new(web_index));
        app = app.fallback_service(static_files);
    } else {
        app = app.fallback(|| async {
            Html(
                r#"<!doctype html>
<html>
  <head><meta charset="utf-8"><title>unitplan-app</title></head>
  <body>
    <h1>unitplan-app</h1>
    <p>web assets not found. Put the planner front-end into <code>public/</code>.</p>
  </body>
</html>
"#,
            )
        });
    }

    let listener = tokio::net::TcpListener::bind(args.addr)
        .await
        .map_err(|err| anyhow::anyhow!("bind {}: {err}", args.addr))?;
    tracing::info!(addr = %args.addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "listen for ctrl-c");
            }
            tracing::info!("shutting down");
        })
        .await?;
    Ok(())
}
