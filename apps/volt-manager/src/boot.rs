//! Boot sequence and the supervisor main loop.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use serde_json::json;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use volt_bus::errors::ErrorBus;
use volt_bus::{BrokerClient, BrokerConfig, StopMode};
use volt_config::{BootError, ConfigModel, Settings};
use volt_protocol::ErrorInstance;
use volt_runtime::{probe_entrypoint, resolve_user, ModuleStartInfo, SpawnContext};

use crate::barrier::StartupBarrier;
use crate::controller::{check_config, ControllerHandle, ControllerRequest};
use crate::status_fifo::{self, StatusFifo};
use crate::supervisor::Fleet;
use crate::Cli;

pub async fn boot(cli: Cli) -> anyhow::Result<()> {
    let mut settings = Settings::load(cli.prefix.clone(), cli.config.clone())?;
    if cli.dontvalidateschema {
        settings.validate_schema = false;
    }

    info!("Voltgrid manager {}", env!("CARGO_PKG_VERSION"));
    info!("using broker at {}", settings.mqtt.endpoint());
    if settings.telemetry_enabled {
        info!("telemetry enabled");
    }
    if let Some(user) = &settings.run_as_user {
        info!("modules will run as user {user}");
    }

    if let Some(dir) = &cli.dumpmanifests {
        dump_all_manifests(&settings, dir)?;
        return Ok(());
    }

    let started = Instant::now();
    let model = volt_config::load(&settings).context("failed to load and validate config")?;
    info!(
        "config loading completed in {}ms",
        started.elapsed().as_millis()
    );

    if let Some(dir) = &cli.dump {
        dump_model(&model, dir)?;
    }
    if cli.check {
        info!("config is valid, terminating as requested");
        return Ok(());
    }

    run(cli, settings, model).await
}

fn dump_all_manifests(settings: &Settings, dir: &Path) -> anyhow::Result<()> {
    let manifests = volt_config::load_all_manifests(settings)?;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("cannot create dump directory {}", dir.display()))?;
    for (module_type, manifest) in manifests {
        let path = dir.join(format!("{module_type}.yaml"));
        std::fs::write(&path, serde_yaml::to_string(&manifest)?)
            .with_context(|| format!("cannot write {}", path.display()))?;
    }
    Ok(())
}

fn dump_model(model: &ConfigModel, dir: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("cannot create dump directory {}", dir.display()))?;
    let doc = model.serialize();
    std::fs::write(
        dir.join("config.json"),
        serde_json::to_string_pretty(&doc["modules"])?,
    )?;
    if let Some(manifests) = doc["manifests"].as_object() {
        for (module_type, manifest) in manifests {
            std::fs::write(
                dir.join(format!("{module_type}.json")),
                serde_json::to_string_pretty(manifest)?,
            )?;
        }
    }
    Ok(())
}

/// Standalone ids from the command line plus entries flagged in the config.
fn effective_standalone(model: &ConfigModel, from_cli: &BTreeSet<String>) -> BTreeSet<String> {
    let mut standalone = from_cli.clone();
    for module_id in model.module_ids() {
        let flagged = model.module(&module_id).is_some_and(|m| m.standalone);
        if flagged && standalone.insert(module_id.clone()) {
            info!(module_id = %module_id, "module marked standalone in config");
        }
    }
    standalone
}

fn build_start_infos(
    model: &ConfigModel,
    settings: &Settings,
    standalone: &BTreeSet<String>,
    ignored: &BTreeSet<String>,
) -> anyhow::Result<Vec<ModuleStartInfo>> {
    let mut infos = Vec::new();
    for module_id in model.module_ids() {
        if ignored.contains(&module_id) {
            info!(module_id = %module_id, "ignoring module");
            continue;
        }
        if standalone.contains(&module_id) {
            info!(module_id = %module_id, "not starting standalone module");
            continue;
        }
        let entry = model.module(&module_id).expect("listed module id");
        if !entry.capabilities.is_empty() {
            info!(
                module_id = %module_id,
                capabilities = %entry.capabilities.join(" "),
                "module requests capabilities"
            );
        }
        let entrypoint = probe_entrypoint(&settings.modules_dir, &entry.module)?;
        infos.push(ModuleStartInfo {
            module_id: module_id.clone(),
            printable_name: model
                .printable_identifier(&module_id)
                .unwrap_or_else(|| module_id.clone()),
            entrypoint,
            capabilities: entry.capabilities.clone(),
        });
    }
    Ok(infos)
}

/// Registers the barrier and spawns the fleet for one config generation.
fn launch(
    model: &ConfigModel,
    settings: &Settings,
    cli_standalone: &BTreeSet<String>,
    ignored: &BTreeSet<String>,
    barrier: &StartupBarrier,
    fleet: &mut Fleet,
    ctx: &SpawnContext,
) -> anyhow::Result<()> {
    let standalone = effective_standalone(model, cli_standalone);
    for module_id in model.module_ids() {
        if !ignored.contains(&module_id) {
            barrier.register(&module_id, standalone.contains(&module_id));
        }
    }
    for info in build_start_infos(model, settings, &standalone, ignored)? {
        fleet
            .spawn(&info, ctx)
            .with_context(|| format!("failed to start module '{}'", info.module_id))?;
    }
    Ok(())
}

async fn teardown(
    barrier: &StartupBarrier,
    fleet: &mut Fleet,
    error_bus: &ErrorBus,
    client: &BrokerClient,
    status: &StatusFifo,
) {
    status.update(status_fifo::SHUTTING_DOWN);
    barrier.deregister_all();
    fleet.shutdown().await;
    error_bus.detach();
    client.stop().await;
}

enum ControllerRecv {
    Request(ControllerRequest),
    Gone,
}

async fn recv_controller(controller: &mut Option<ControllerHandle>) -> ControllerRecv {
    match controller {
        Some(handle) => match handle.recv().await {
            Some(request) => ControllerRecv::Request(request),
            None => ControllerRecv::Gone,
        },
        None => std::future::pending().await,
    }
}

fn origin_label(error: &ErrorInstance) -> String {
    format!("{}/{}", error.origin.module_id, error.origin.impl_id)
}

async fn run(cli: Cli, settings: Settings, mut model: ConfigModel) -> anyhow::Result<()> {
    let cli_standalone: BTreeSet<String> = cli.standalone.iter().cloned().collect();
    let ignored: BTreeSet<String> = cli.ignore.iter().cloned().collect();
    for id in cli_standalone.iter().chain(ignored.iter()) {
        if !model.contains(id) {
            warn!(module_id = %id, "unknown module id on the command line");
        }
    }

    let status = StatusFifo::create_from_path(&cli.status_fifo);

    let broker_config = BrokerConfig {
        host: settings.mqtt.broker_host.clone(),
        port: settings.mqtt.broker_port,
        socket_path: settings.mqtt.broker_socket_path.clone(),
        client_id: format!("volt-manager-{}", std::process::id()),
        connect_timeout: Duration::from_secs(5),
    };
    let client = BrokerClient::over_mqtt(broker_config, &settings.mqtt.internal_prefix, StopMode::Drop);
    if !client.connect().await {
        return Err(BootError::BrokerUnreachable(settings.mqtt.endpoint()).into());
    }
    client.spawn_main_loop();

    let error_bus = ErrorBus::attach(client.clone(), model.error_types().clone());
    error_bus.subscribe_all(
        Arc::new(|e: &ErrorInstance| {
            warn!(
                error_type = %e.error_type,
                sub_type = %e.sub_type,
                origin = %origin_label(e),
                message = %e.message,
                "module error raised"
            );
        }),
        Arc::new(|e: &ErrorInstance| {
            info!(
                error_type = %e.error_type,
                sub_type = %e.sub_type,
                origin = %origin_label(e),
                "module error cleared"
            );
        }),
    );

    let run_as_user = match &settings.run_as_user {
        Some(name) => Some(resolve_user(name)?),
        None => None,
    };
    let spawn_ctx = SpawnContext {
        prefix: settings.prefix.clone(),
        config_file: settings.config_file.clone(),
        validate_schema: settings.validate_schema,
        run_as_user,
        node_modules_dir: settings.node_modules_dir.clone(),
        python_modules_dir: settings.python_modules_dir.clone(),
    };

    let mut fleet = Fleet::new(settings.termination_grace);
    let mut barrier = StartupBarrier::new(client.clone(), status.clone());
    if let Err(e) = launch(
        &model,
        &settings,
        &cli_standalone,
        &ignored,
        &barrier,
        &mut fleet,
        &spawn_ctx,
    ) {
        teardown(&barrier, &mut fleet, &error_bus, &client, &status).await;
        return Err(e);
    }

    let mut controller = ControllerHandle::start(&settings).await?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    loop {
        tokio::select! {
            event = fleet.next_exit() => {
                error!(
                    module_id = %event.module_id,
                    pid = event.pid,
                    status = ?event.status,
                    "module exited unexpectedly, terminating all modules"
                );
                status.update(&format!("{} {}", status_fifo::MODULE_FAILED, event.module_id));
                teardown(&barrier, &mut fleet, &error_bus, &client, &status).await;
                bail!("module '{}' exited unexpectedly", event.module_id);
            }

            received = recv_controller(&mut controller) => match received {
                ControllerRecv::Gone => {
                    error!("controller process exited");
                    teardown(&barrier, &mut fleet, &error_bus, &client, &status).await;
                    bail!("controller process exited");
                }
                ControllerRecv::Request(ControllerRequest::RestartModules) => {
                    info!("controller requested a module restart");
                    barrier.deregister_all();
                    fleet.shutdown().await;
                    model = match volt_config::load(&settings) {
                        Ok(model) => model,
                        Err(e) => {
                            teardown(&barrier, &mut fleet, &error_bus, &client, &status).await;
                            return Err(anyhow::Error::new(e)
                                .context("config reload for module restart failed"));
                        }
                    };
                    barrier = StartupBarrier::new(client.clone(), status.clone());
                    if let Err(e) = launch(
                        &model,
                        &settings,
                        &cli_standalone,
                        &ignored,
                        &barrier,
                        &mut fleet,
                        &spawn_ctx,
                    ) {
                        teardown(&barrier, &mut fleet, &error_bus, &client, &status).await;
                        return Err(e);
                    }
                }
                ControllerRecv::Request(ControllerRequest::CheckConfig { id, path }) => {
                    let reply = match check_config(&settings, &path) {
                        Ok(()) => json!({ "id": id }),
                        Err(message) => json!({ "id": id, "result": message }),
                    };
                    if let Some(handle) = controller.as_mut() {
                        if let Err(e) = handle.send(&reply).await {
                            warn!(error = %e, "cannot answer controller");
                        }
                    }
                }
            },

            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down");
                teardown(&barrier, &mut fleet, &error_bus, &client, &status).await;
                return Ok(());
            }

            _ = sigint.recv() => {
                info!("interrupted, shutting down");
                teardown(&barrier, &mut fleet, &error_bus, &client, &status).await;
                return Ok(());
            }
        }
    }
}
