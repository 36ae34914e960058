use std::process::ExitCode;
use stress_test::{churn_scaling, churn_simulation, ChurnConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };
    match rt.block_on(async_main()) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => {
            eprintln!("\n✗ Some writes never reached the server");
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("\n✗ Simulation failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn async_main() -> Result<bool, medsync_sdk::SyncError> {
    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║            OFFLINE CHURN SIMULATIONS                       ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    let mut clean = true;

    // Run 1: a couple of devices, light churn
    let stats = churn_simulation(ChurnConfig {
        devices: 2,
        writes_per_device: 25,
        flaps: 20,
        seed: 7,
    })
    .await?;
    stats.print();
    clean &= stats.no_write_loss();

    // Run 2: more devices, heavy churn
    let stats = churn_simulation(ChurnConfig {
        devices: 8,
        writes_per_device: 50,
        flaps: 200,
        seed: 42,
    })
    .await?;
    stats.print();
    clean &= stats.no_write_loss();

    // Run 3: scaling analysis
    clean &= churn_scaling(12, 4).await?;

    if clean {
        println!("\n✓ All churn simulations completed without write loss!");
    }
    Ok(clean)
}
