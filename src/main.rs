use std::collections::HashMap;
use std::panic;

use serde::Serialize;
use tracing_subscriber::EnvFilter;

use scriptrunner_rust::{
    CancelSignal, ExecutorConfig, Parameter, ScriptCall, ScriptService, cancel_pair,
};

const USAGE: &str = "usage: scriptrunner-rust <run <script> [args...] | batch <script>... | install <pkg[==version]>... | validate>";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    set_panic_hook();

    let config = ExecutorConfig::from_env()?;
    let service = ScriptService::new(config)?;

    let (handle, cancel) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling in-flight work");
            handle.cancel();
        }
    });

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.split_first() {
        Some((cmd, rest)) if cmd == "run" && !rest.is_empty() => {
            run(&service, &rest[0], &rest[1..], &cancel).await
        }
        Some((cmd, rest)) if cmd == "batch" && !rest.is_empty() => {
            batch(&service, rest, &cancel).await
        }
        Some((cmd, rest)) if cmd == "install" && !rest.is_empty() => {
            install(&service, rest, &cancel).await
        }
        Some((cmd, _)) if cmd == "validate" => print_json(&service.validate_environment().await),
        _ => {
            eprintln!("{}", USAGE);
            std::process::exit(2);
        }
    }
}

async fn run(
    service: &ScriptService,
    script: &str,
    args: &[String],
    cancel: &CancelSignal,
) -> Result<(), Box<dyn std::error::Error>> {
    let parameters = args
        .iter()
        .enumerate()
        .map(|(i, arg)| Parameter::text(format!("arg{}", i), arg.as_str()))
        .collect();

    let result = service.execute_script(script, parameters, cancel).await;
    print_json(&result)?;
    print_json(&service.statistics())?;
    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}

async fn batch(
    service: &ScriptService,
    scripts: &[String],
    cancel: &CancelSignal,
) -> Result<(), Box<dyn std::error::Error>> {
    let calls = scripts
        .iter()
        .map(|script| ScriptCall::new(script.as_str(), Vec::new()))
        .collect();

    let (results, summary) = service.execute_batch(calls, cancel).await;
    print_json(&results)?;
    print_json(&summary)?;
    print_json(&service.statistics())?;
    if summary.failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

async fn install(
    service: &ScriptService,
    packages: &[String],
    cancel: &CancelSignal,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut libraries = Vec::with_capacity(packages.len());
    let mut versions = HashMap::new();
    for package in packages {
        match package.split_once("==") {
            Some((name, version)) => {
                versions.insert(name.to_string(), version.to_string());
                libraries.push(name.to_string());
            }
            None => libraries.push(package.clone()),
        }
    }

    let outcome = service
        .install_libraries(&libraries, &versions, &[], cancel)
        .await;
    print_json(&outcome)?;
    if !outcome.success {
        std::process::exit(1);
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn set_panic_hook() {
    panic::set_hook(Box::new(|panic_info| {
        tracing::error!(
            message = "panic occurred",
            panic = %panic_info
        );
    }));
}
