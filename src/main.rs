use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{info, warn};

use gantry::{
    Config, Container, ContainerError, EventLoop, Handler, HttpServer, MatchMode, ParamKind,
    ReqLimits, RespLimits, Request, Response, Router, Value, CORE_SECTION,
};

#[derive(Parser)]
#[command(name = "gantry", version, about = "Plugin-hosting HTTP server")]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address override
    #[arg(long)]
    address: Option<String>,

    /// Listen port override
    #[arg(long)]
    port: Option<u16>,

    /// Router match policy override: first or longest
    #[arg(long)]
    match_mode: Option<String>,

    /// Bind a plugin container: ROUTE=PATH/TO/PLUGIN.so (repeatable)
    #[arg(long = "container", value_name = "ROUTE=PLUGIN")]
    containers: Vec<String>,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(level)
        .init();

    let mut config = Config::new();
    register_core_options(&mut config)?;

    // Containers register their options before any value source is read.
    let mut bindings: Vec<(String, Arc<Container>)> = Vec::new();
    for spec in &cli.containers {
        let (route, path) = spec
            .split_once('=')
            .context("--container expects ROUTE=PLUGIN")?;
        let name = container_name(path);
        let container = Container::load(&name, path, &mut config)
            .with_context(|| format!("loading container {name}"))?;
        bindings.push((route.to_string(), container));
    }
    if bindings.is_empty() {
        bindings.push(("/".to_string(), hello_container(&mut config)?));
    }

    if let Some(path) = &cli.config {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        config.load_yaml_str(&text)?;
    }
    config.apply_env()?;
    if let Some(address) = &cli.address {
        config.set(CORE_SECTION, "address", Value::Str(address.clone()))?;
    }
    if let Some(port) = cli.port {
        config.set(CORE_SECTION, "port", Value::Int(i64::from(port)))?;
    }
    if let Some(mode) = &cli.match_mode {
        config.set(CORE_SECTION, "match-mode", Value::Str(mode.clone()))?;
    }

    let address = config.get_str(CORE_SECTION, "address")?.to_string();
    let port = u16::try_from(config.get_int(CORE_SECTION, "port")?)
        .context("core.port out of range")?;
    let mode = match config.get_str(CORE_SECTION, "match-mode")? {
        "first" => MatchMode::First,
        "longest" => MatchMode::Longest,
        other => bail!("unknown match mode {other:?} (expected first or longest)"),
    };

    let eloop = Rc::new(EventLoop::new()?);
    for sig in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(sig, eloop.stop_flag())
            .context("installing signal handler")?;
    }

    let mut router = Router::new(mode)?;
    let config = Arc::new(config);
    for (route, container) in &bindings {
        container.run(config.clone())?;
        router.bind(route, container.clone())?;
        info!("bound {route} to container {}", container.name());
    }

    let server = HttpServer::new(
        eloop.clone(),
        Rc::new(router),
        ReqLimits::default(),
        RespLimits::default(),
    );
    server.start(&address, port)?;
    info!("listening on {address}:{port}");

    eloop.run()?;
    info!("shutting down");

    for (_, container) in &bindings {
        let code = container.shutdown();
        if code != 0 {
            warn!("container {} exited with status {code}", container.name());
        }
    }
    Ok(())
}

fn register_core_options(config: &mut Config) -> anyhow::Result<()> {
    config.opt_add(CORE_SECTION, "address", ParamKind::Str, "listen address")?;
    config.set_default(CORE_SECTION, "address", Value::Str("127.0.0.1".into()))?;
    config.opt_add(CORE_SECTION, "port", ParamKind::Int, "listen port")?;
    config.set_default(CORE_SECTION, "port", Value::Int(8000))?;
    config.opt_add(
        CORE_SECTION,
        "match-mode",
        ParamKind::Str,
        "router match policy (first|longest)",
    )?;
    config.set_default(CORE_SECTION, "match-mode", Value::Str("first".into()))?;
    Ok(())
}

fn container_name(path: &str) -> String {
    Path::new(path)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

/// Built-in stand-in served on `/` when no plugin is configured.
struct HelloHandler {
    body: Vec<u8>,
}

impl Handler for HelloHandler {
    fn setup(&mut self, config: &Config) -> Result<(), ContainerError> {
        if let Ok(greeting) = config.get_str("hello", "greeting") {
            self.body = greeting.as_bytes().to_vec();
        }
        Ok(())
    }

    fn serve(&mut self, _request: &Request, response: &Response) -> Result<(), ContainerError> {
        response.write_status_line(200)?;
        response.write_header("Content-Type", "text/plain; charset=utf-8");
        response.write_header("Content-Length", &self.body.len().to_string());
        response.end_headers();
        response.append_data(&self.body);
        response.end_body();
        Ok(())
    }
}

fn hello_container(config: &mut Config) -> anyhow::Result<Arc<Container>> {
    config.opt_add("hello", "greeting", ParamKind::Str, "response body text")?;
    config.set_default("hello", "greeting", Value::Str("Hello world!".into()))?;
    Ok(Container::custom(
        "hello",
        Box::new(HelloHandler {
            body: b"Hello world!".to_vec(),
        }),
    ))
}
