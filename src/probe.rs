use std::sync::Arc;

use weft_core::config::AppConfig;
use weft_core::traits::UnitRuntime;
use weft_dispatch::{BollardRuntime, ClusterJobRuntime, CliRuntime};

struct CheckResult {
    label: String,
    ok: bool,
    detail: String,
}

pub async fn run_probe(config: &AppConfig) {
    let mut checks = Vec::new();

    checks.push(check_runtime("Container API", Arc::new(BollardRuntime::connect())).await);

    if config.container.cli_enabled {
        let cli = CliRuntime::new(config.container.cli_binary.clone());
        checks.push(check_runtime("Container CLI", Arc::new(cli)).await);
    } else {
        checks.push(CheckResult {
            label: "Container CLI".into(),
            ok: true,
            detail: "Disabled (container.cli_enabled = false)".into(),
        });
    }

    checks.push(check_cluster(config).await);
    checks.push(check_storage(config));

    let mut ok_count = 0;
    let mut fail_count = 0;

    for check in &checks {
        let icon = if check.ok { "[OK]" } else { "[!!]" };
        println!("  {} {}: {}", icon, check.label, check.detail);
        if check.ok {
            ok_count += 1;
        } else {
            fail_count += 1;
        }
    }

    println!();
    println!("  {} passed, {} issues found", ok_count, fail_count);
}

async fn check_runtime(label: &str, runtime: Arc<dyn UnitRuntime>) -> CheckResult {
    match runtime.probe().await {
        Ok(()) => CheckResult {
            label: label.into(),
            ok: true,
            detail: format!("{} reachable", runtime.name()),
        },
        Err(e) => CheckResult {
            label: label.into(),
            ok: false,
            detail: format!("{} ({})", e.message, e.kind),
        },
    }
}

async fn check_cluster(config: &AppConfig) -> CheckResult {
    let Some(cluster) = &config.cluster else {
        return CheckResult {
            label: "Cluster".into(),
            ok: true,
            detail: "Not configured".into(),
        };
    };
    match ClusterJobRuntime::new(cluster) {
        Ok(runtime) => check_runtime("Cluster", Arc::new(runtime)).await,
        Err(e) => CheckResult {
            label: "Cluster".into(),
            ok: false,
            detail: e.to_string(),
        },
    }
}

fn check_storage(config: &AppConfig) -> CheckResult {
    match config.storage_path() {
        None => CheckResult {
            label: "Storage".into(),
            ok: true,
            detail: "In-memory (runs are not persisted)".into(),
        },
        Some(path) => match weft_store::SqliteStore::open(&path) {
            Ok(_) => CheckResult {
                label: "Storage".into(),
                ok: true,
                detail: format!("{} accessible", path.display()),
            },
            Err(e) => CheckResult {
                label: "Storage".into(),
                ok: false,
                detail: format!("{}: {}", path.display(), e),
            },
        },
    }
}
