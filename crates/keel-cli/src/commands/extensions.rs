use console::style;
use std::path::Path;

use keel_config::KeelConfig;
use keel_core::{HOST_VERSION, KeelError, LifecycleState};
use keel_ext::manifest::{ExtensionManifest, MANIFEST_FILE};
use keel_ext::permission::{self, Tier};

use super::{ExtAction, build_runtime, start_runtime};

pub(super) async fn cmd_ext(config: KeelConfig, action: ExtAction) -> keel_core::Result<()> {
    match action {
        ExtAction::List { json } => {
            let runtime = build_runtime(&config)?;
            let report = runtime.discover().await;
            let extensions = runtime.list_extensions();

            if json {
                println!("{}", serde_json::to_string_pretty(&extensions)?);
                return Ok(());
            }
            if extensions.is_empty() && report.failed.is_empty() {
                println!("No extensions installed.");
            }
            for e in &extensions {
                let state = match e.state {
                    LifecycleState::Active => style(e.state.to_string()).green(),
                    _ => style(e.state.to_string()).yellow(),
                };
                println!("  {} v{} [{state}] — {}", style(&e.name).bold(), e.version, e.description);
            }
            for failure in &report.failed {
                println!(
                    "  {} {} — {}",
                    style("✗").red(),
                    failure.path.display(),
                    failure.error
                );
            }
        }
        ExtAction::Install { path } => {
            let runtime = build_runtime(&config)?;
            let name = runtime.install(&path).await?;
            println!("✅ Installed {name}");
            let commands: Vec<String> = runtime
                .list_commands()
                .into_iter()
                .filter(|c| c.owning_extension == name)
                .map(|c| c.name)
                .collect();
            if !commands.is_empty() {
                println!("   Commands: {}", commands.join(", "));
            }
        }
        ExtAction::Uninstall { name, yes } => {
            let runtime = start_runtime(&config).await?;
            if runtime.extension_dir(&name).is_none() {
                return Err(KeelError::ExtensionNotFound(name));
            }
            if !yes && !confirm_uninstall(&name).await? {
                println!("Cancelled.");
                return Ok(());
            }
            if runtime.uninstall(&name).await? {
                println!("✅ Uninstalled {name}");
            } else {
                println!("✅ Unloaded {name} (files outside the extensions directory were kept)");
            }
        }
        ExtAction::Info { name } => {
            let runtime = start_runtime(&config).await?;
            let Some(manifest) = runtime.manifest(&name) else {
                println!("Extension '{name}' is not loaded. Is it installed?");
                return Ok(());
            };
            print_manifest(&manifest);
            if let Some(dir) = runtime.extension_dir(&name) {
                println!("  Path: {}", dir.display());
            }
            let commands: Vec<_> = runtime
                .list_commands()
                .into_iter()
                .filter(|c| c.owning_extension == name)
                .collect();
            if !commands.is_empty() {
                println!("\n  {}", style(format!("Commands ({}):", commands.len())).bold());
                for c in commands {
                    println!("    {} — {}", c.name, c.description);
                }
            }
        }
        ExtAction::Check { path } => check_dir(&path)?,
    }
    Ok(())
}

async fn confirm_uninstall(name: &str) -> keel_core::Result<bool> {
    let prompt = format!("Uninstall '{name}' and delete its data?");
    tokio::task::spawn_blocking(move || {
        use dialoguer::{Confirm, theme::ColorfulTheme};
        Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(prompt)
            .default(false)
            .interact()
            .unwrap_or(false)
    })
    .await
    .map_err(|e| KeelError::Config(e.to_string()))
}

fn print_manifest(manifest: &ExtensionManifest) {
    println!("{} v{}", style(&manifest.name).bold(), manifest.version);
    if !manifest.description.is_empty() {
        println!("  {}", manifest.description);
    }
    println!("  Author: {}", manifest.author);
    if let Some(ref license) = manifest.license {
        println!("  License: {license}");
    }
    if let Some(ref repository) = manifest.repository {
        println!("  Repository: {repository}");
    }
    if let Some(ref checksum) = manifest.checksum {
        println!("  Checksum: {}", checksum.chars().take(16).collect::<String>());
    }
    let compat = &manifest.host_compatibility;
    match &compat.max_version {
        Some(max) => println!("  Host: {} – {max}", compat.min_version),
        None => println!("  Host: >= {}", compat.min_version),
    }
}

/// Validate a directory the way the runtime would, without running any code.
fn check_dir(path: &Path) -> keel_core::Result<()> {
    let bytes = std::fs::read(path.join(MANIFEST_FILE))?;
    let manifest = ExtensionManifest::parse(&bytes)?;
    print_manifest(&manifest);

    let classification = permission::classify(&manifest.permissions);
    println!("\n  {}", style("Permissions:").bold());
    for p in classification.safe.iter().chain(&classification.elevated) {
        let tier = match p.tier() {
            Tier::Elevated => style("elevated").yellow(),
            _ => style("safe").green(),
        };
        println!("    {} [{tier}] — {}", p.token(), p.risk());
    }
    if let Some(reason) = classification.denial_message() {
        println!("    {} {reason}", style("denied:").red().bold());
    }

    let mut problems = Vec::new();
    if let Err(e) = manifest.check_compatibility(HOST_VERSION) {
        problems.push(e.to_string());
    }
    if classification.denial_message().is_some() {
        problems.push("requests permissions that are never granted".to_string());
    }
    let entry = path.join(&manifest.entry_point);
    if !keel_ext::PathGuard::is_safe_entry_file(&entry) {
        problems.push(format!("entry point '{}' is not an allowed file type", manifest.entry_point));
    } else {
        match std::fs::read(&entry) {
            Ok(bytes) if !manifest.verify_checksum(&bytes) => {
                problems.push("entry file does not match checksum".to_string())
            }
            Ok(_) => {}
            Err(e) => problems.push(format!("cannot read entry point: {e}")),
        }
    }

    println!();
    if problems.is_empty() {
        println!("  {} ready to install", style("✓").green());
        Ok(())
    } else {
        for p in &problems {
            println!("  {} {p}", style("✗").red());
        }
        Err(KeelError::LoadRejected {
            extension: manifest.name,
            reason: format!("{} problem(s) found", problems.len()),
        })
    }
}
