use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use octolab_config::{LogFormat, Settings};
use octolab_domain::{LabId, Runtime};
use octolab_driver::{ContainerDriver, DriverRegistry, MicroVmDriver};
use octolab_gateway::{guacamole_preflight, PreflightClassification};
use octolab_orchestrator::WatchdogAction;
use octolab_store::{LabStore, PostgresLabStore, PostgresRecipeLookup};

use crate::cli::WatchdogActionArg;
use crate::output;

/// Installs a `tracing_subscriber` reading `settings.log_directive`/
/// `log_format`. Called once, at the top of every subcommand, mirroring
/// the teacher's `tracing_subscriber::fmt()` bootstrap in `main.rs` —
/// moved here because the log format itself is configuration (spec §9
/// "global state replaced by explicit configuration"), so it can't be
/// chosen before `Settings` is loaded.
fn init_tracing(settings: &Settings) {
    let filter = tracing_subscriber::EnvFilter::try_new(&settings.log_directive)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match settings.log_format {
        LogFormat::Json => {
            tracing_subscriber::fmt().with_env_filter(filter).with_target(false).json().init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
        }
    }
}

/// Builds the driver registry shared by `serve` and `watchdog`: the
/// container driver is always available; the microVM driver is only
/// registered when both image paths are configured, so an operator who
/// hasn't set up Firecracker yet still gets a working container-only
/// deployment instead of a startup failure (spec §4.2 "driver registry").
fn build_driver_registry(settings: &Arc<Settings>) -> DriverRegistry {
    let mut registry = DriverRegistry::new();
    registry.register(Runtime::Container, Arc::new(ContainerDriver::new(settings.clone())));
    if settings.kernel_image.is_some() && settings.rootfs_image.is_some() {
        registry.register(Runtime::MicroVm, Arc::new(MicroVmDriver::new(settings.clone())));
    } else {
        warn!("OCTOLAB_KERNEL_IMAGE/OCTOLAB_ROOTFS_IMAGE not set — microVM runtime is not available");
    }
    registry
}

// ── serve ───────────────────────────────────────────────────────────────────

/// Runs the HTTP API plus the teardown worker until a shutdown signal
/// arrives. Grounded in `lab_service.py`'s process lifetime (one long-
/// running server owning both the request surface and the background
/// teardown loop) and the teacher's `axum::serve` bootstrap.
pub async fn serve() -> Result<()> {
    let settings = Arc::new(Settings::from_env().context("loading configuration from OCTOLAB_* environment variables")?);
    init_tracing(&settings);

    let pg_store = PostgresLabStore::connect(&settings.database_url)
        .await
        .context("connecting to the lab database")?;
    let recipes = PostgresRecipeLookup::load(pg_store.pool().clone())
        .await
        .context("loading the recipe catalog")?;
    info!(recipe_count = recipes.len(), "recipe catalog loaded");

    let store: Arc<dyn LabStore> = Arc::new(pg_store);
    let recipes: Arc<dyn octolab_domain::RecipeLookup> = Arc::new(recipes);
    let drivers = Arc::new(build_driver_registry(&settings));

    let app = octolab_api::build_app(store.clone(), drivers.clone(), recipes, settings.clone());

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let worker_handle = tokio::spawn(octolab_orchestrator::run_teardown_worker(
        store.clone(),
        drivers.clone(),
        settings.clone(),
        Duration::from_secs(15),
        shutdown_rx,
    ));

    let listener = tokio::net::TcpListener::bind(&settings.bind_addr)
        .await
        .with_context(|| format!("binding to {}", settings.bind_addr))?;
    info!(addr = %settings.bind_addr, runtimes = ?drivers.active_runtimes(), "OctoLab API listening");

    tokio::select! {
        result = axum::serve(listener, app) => {
            result.context("HTTP server error")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = worker_handle.await {
        warn!(error = %e, "teardown worker task did not shut down cleanly");
    }
    Ok(())
}

// ── doctor ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct DoctorCheck {
    pub name: String,
    pub ok: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DoctorReport {
    pub checks: Vec<DoctorCheck>,
}

impl DoctorReport {
    pub fn all_ok(&self) -> bool {
        self.checks.iter().all(|c| c.ok)
    }
}

/// Read-only diagnostics (spec §4.7, §6 "operator diagnostic scripts"):
/// required binaries present, database reachable, gateway reachable.
/// Grounded in `octolab_doctor.py`'s check-and-report shape, adapted to
/// the Rust subprocess wrapper already used by the drivers.
pub async fn doctor(json: bool) -> Result<()> {
    let settings = Settings::from_env().context("loading configuration from OCTOLAB_* environment variables")?;
    init_tracing(&settings);

    let mut checks = Vec::new();
    checks.push(check_binary("docker", &["--version"]).await);
    checks.push(check_binary_with_args("docker", &["compose", "version"], "docker compose").await);

    if settings.kernel_image.is_some() || settings.rootfs_image.is_some() {
        checks.push(check_binary(&settings.firecracker_bin, &["--version"]).await);
        checks.push(check_path_readable("kernel image", settings.kernel_image.as_deref()));
        checks.push(check_path_readable("rootfs image", settings.rootfs_image.as_deref()));
    } else {
        checks.push(DoctorCheck {
            name: "microvm runtime".to_string(),
            ok: true,
            detail: "not configured (OCTOLAB_KERNEL_IMAGE/OCTOLAB_ROOTFS_IMAGE unset) — skipped".to_string(),
        });
    }

    checks.push(check_database(&settings.database_url).await);
    checks.push(check_gateway(&settings).await);

    let report = DoctorReport { checks };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", output::render_doctor(&report));
    }

    if report.all_ok() {
        Ok(())
    } else {
        anyhow::bail!("one or more doctor checks failed");
    }
}

async fn check_binary(binary: &str, args: &[&str]) -> DoctorCheck {
    check_binary_with_args(binary, args, binary).await
}

async fn check_binary_with_args(binary: &str, args: &[&str], display_name: &str) -> DoctorCheck {
    match octolab_driver::subprocess::run(binary, args, None, &HashMap::new(), &[], Duration::from_secs(5)).await {
        Ok(out) if out.code == 0 => {
            DoctorCheck { name: display_name.to_string(), ok: true, detail: out.log.lines().next().unwrap_or("").to_string() }
        }
        Ok(out) => DoctorCheck {
            name: display_name.to_string(),
            ok: false,
            detail: format!("exited {}: {}", out.code, out.log),
        },
        Err(e) => DoctorCheck { name: display_name.to_string(), ok: false, detail: e.to_string() },
    }
}

fn check_path_readable(name: &str, path: Option<&str>) -> DoctorCheck {
    let Some(path) = path else {
        return DoctorCheck { name: name.to_string(), ok: false, detail: "not configured".to_string() };
    };
    match std::fs::metadata(path) {
        Ok(_) => DoctorCheck { name: name.to_string(), ok: true, detail: path.to_string() },
        Err(e) => DoctorCheck { name: name.to_string(), ok: false, detail: format!("{path}: {e}") },
    }
}

async fn check_database(database_url: &str) -> DoctorCheck {
    match PostgresLabStore::connect(database_url).await {
        Ok(_) => DoctorCheck { name: "database".to_string(), ok: true, detail: "reachable, schema up to date".to_string() },
        Err(e) => DoctorCheck { name: "database".to_string(), ok: false, detail: e.to_string() },
    }
}

async fn check_gateway(settings: &Settings) -> DoctorCheck {
    if !settings.guac_enabled {
        return DoctorCheck { name: "gateway".to_string(), ok: true, detail: "disabled (OCTOLAB_GUAC_ENABLED=false)".to_string() };
    }
    let (Some(base_url), Some(admin_user), Some(admin_password)) =
        (&settings.guac_base_url, &settings.guac_admin_user, &settings.guac_admin_password)
    else {
        return DoctorCheck { name: "gateway".to_string(), ok: false, detail: "enabled but missing OCTOLAB_GUAC_* settings".to_string() };
    };

    let http = reqwest::Client::new();
    let result = guacamole_preflight(&http, base_url, admin_user, admin_password, settings.gateway_http_timeout).await;
    let ok = result.classification == PreflightClassification::Ok;
    DoctorCheck { name: "gateway".to_string(), ok, detail: result.detail }
}

// ── watchdog ────────────────────────────────────────────────────────────────

/// Runs one stuck-ENDING sweep (spec §4.7, §8 scenario S7) and prints what
/// it found and did.
pub async fn watchdog(
    threshold_minutes: i64,
    action: WatchdogActionArg,
    dry_run: bool,
    lab_id: Option<Uuid>,
) -> Result<()> {
    let settings = Arc::new(Settings::from_env().context("loading configuration from OCTOLAB_* environment variables")?);
    init_tracing(&settings);

    let store: Arc<dyn LabStore> = Arc::new(
        PostgresLabStore::connect(&settings.database_url).await.context("connecting to the lab database")?,
    );
    let drivers = Arc::new(build_driver_registry(&settings));

    let action = match action {
        WatchdogActionArg::ForceTeardown => WatchdogAction::ForceTeardown,
        WatchdogActionArg::Fail => WatchdogAction::Fail,
    };

    let report = octolab_orchestrator::run_watchdog_sweep(
        &store,
        &drivers,
        &settings,
        chrono::Duration::minutes(threshold_minutes),
        action,
        dry_run,
        lab_id.map(LabId),
    )
    .await
    .context("running watchdog sweep")?;

    print!("{}", output::render_watchdog(&report));
    Ok(())
}

// ── smoke ───────────────────────────────────────────────────────────────────

/// Boots a minimal microVM under a bounded timeout to catch a broken
/// hypervisor/kernel/rootfs before any real lab tries to use them (spec
/// §4.4.1).
pub async fn smoke(keep_on_success: bool, json: bool) -> Result<()> {
    let settings = Settings::from_env().context("loading configuration from OCTOLAB_* environment variables")?;
    init_tracing(&settings);

    let report = octolab_driver::run_smoke_test(&settings, keep_on_success).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", output::render_smoke(&report));
    }

    if report.ok {
        Ok(())
    } else {
        anyhow::bail!("smoke test failed");
    }
}
