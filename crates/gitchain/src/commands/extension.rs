//! Extension commands
//!
//! Listing installed extensions, running them in the foreground and the
//! script console.

use gitchain_ext::{Args, Console, ExitReason, ExtensionControl, ExtensionManager};
use owo_colors::OwoColorize;
use starbase::AppResult;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tracing::{info, warn};

/// Parse a `KEY=VALUE` extension argument
pub fn parse_arg(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

/// Run the extension list command
pub fn run_ext_list(manager: &ExtensionManager) -> AppResult {
    let installed = match manager.installed() {
        Ok(names) => names,
        Err(e) => {
            eprintln!("Error: Failed to list extensions: {}", e);
            return Ok(Some(1));
        }
    };

    if installed.is_empty() {
        println!(
            "No extensions installed in {}",
            manager.loader().dir().display()
        );
        return Ok(None);
    }

    println!("{:<24} Status", "Extension");
    println!("{}", "-".repeat(40));
    for name in &installed {
        let status = if manager.is_running(name) {
            "running".green().to_string()
        } else {
            "idle".dimmed().to_string()
        };
        println!("{:<24} {}", name, status);
    }
    println!("\nTotal: {} extension(s) installed", installed.len());

    Ok(None)
}

/// Run the extension run command
pub async fn run_ext_run(manager: &ExtensionManager, names: &[String], args: Args) -> AppResult {
    let mut controls: Vec<ExtensionControl> = Vec::new();

    for name in names {
        match manager.run(name, args.clone()) {
            Ok(control) => {
                println!("{} {}", "✓".green(), control.name());
                controls.push(control);
            }
            Err(e) => {
                eprintln!("Error: Failed to start extension '{}': {}", name, e);
                warn!(
                    extension = %name,
                    started = controls.len(),
                    "Aborting run, stopping started extensions"
                );
                manager.shutdown();
                manager.wait_idle().await;
                return Ok(Some(1));
            }
        }
    }

    info!(count = controls.len(), "Extensions started");
    wait_for_extensions(manager).await;

    let failed: Vec<&str> = controls
        .iter()
        .filter(|control| {
            matches!(
                control.instance().status().exit_reason(),
                Some(ExitReason::Failed(_))
            )
        })
        .map(|control| control.name())
        .collect();

    if failed.is_empty() {
        Ok(None)
    } else {
        eprintln!("Error: Extension(s) failed: {}", failed.join(", "));
        Ok(Some(1))
    }
}

/// Run the extension console command
pub async fn run_ext_console(
    manager: &ExtensionManager,
    eval: Option<String>,
    file: Option<PathBuf>,
) -> AppResult {
    let source = match (eval, file) {
        (Some(code), _) => Some(code),
        (None, Some(path)) => match std::fs::read_to_string(&path) {
            Ok(code) => Some(code),
            Err(e) => {
                eprintln!("Error: Failed to read {}: {}", path.display(), e);
                return Ok(Some(1));
            }
        },
        (None, None) => None,
    };

    let code = match source {
        Some(source) => evaluate(manager, &source),
        None => repl(manager),
    };

    match code {
        // Extensions started from a one-shot evaluation keep running.
        None if !manager.running().is_empty() => wait_for_extensions(manager).await,
        _ => {
            manager.shutdown();
            manager.wait_idle().await;
        }
    }

    Ok(code)
}

/// Wait for every running extension, stopping them all on Ctrl-C
async fn wait_for_extensions(manager: &ExtensionManager) {
    tokio::select! {
        () = manager.wait_idle() => {
            info!("All extensions finished");
        }
        _ = tokio::signal::ctrl_c() => {
            println!("\nInterrupted, stopping extensions...");
            let running = manager.running();
            info!(?running, "Interrupt received, shutting down extensions");
            manager.shutdown();
            manager.wait_idle().await;
            info!("Extensions stopped");
        }
    }
}

fn evaluate(manager: &ExtensionManager, source: &str) -> Option<u8> {
    let console = match Console::new(manager) {
        Ok(console) => console,
        Err(e) => {
            eprintln!("Error: Failed to start console: {}", e);
            return Some(1);
        }
    };

    match console.eval(source) {
        Ok(value) => {
            if !value.is_null() {
                println!("{}", render(&value));
            }
            None
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            Some(1)
        }
    }
}

fn repl(manager: &ExtensionManager) -> Option<u8> {
    let console = match Console::new(manager) {
        Ok(console) => console,
        Err(e) => {
            eprintln!("Error: Failed to start console: {}", e);
            return Some(1);
        }
    };

    println!(
        "gitchain console ({}), Ctrl-D to exit",
        manager.loader().dir().display()
    );

    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        print!("> ");
        let _ = io::stdout().flush();

        line.clear();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                eprintln!("Error: Failed to read input: {}", e);
                return Some(1);
            }
        }

        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        match console.eval(input) {
            Ok(value) => println!("{}", render(&value)),
            Err(e) => eprintln!("{} {}", "error:".red(), e),
        }
    }

    None
}

fn render(value: &serde_json::Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
