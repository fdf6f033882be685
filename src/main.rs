mod app;

use std::io::Write;

use log::info;
use strategy_supervisor::{ManagerConfig, TaskManager};

use app::cli;

fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        // The console runs in raw mode, so each record starts at column 0.
        .format(|buf, record| {
            writeln!(
                buf,
                "\r[{} {} {}] {}",
                chrono::Local::now().format("%H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let config = ManagerConfig::from_env()?;
    let manager = TaskManager::new(config)?;
    info!("Supervisor running as pid {}.", std::process::id());

    let outcome = cli::run_cli(&manager);
    manager.shutdown();
    outcome?;
    Ok(())
}
