use anyhow::{bail, Context};
use chat_sync_backup::{init_tracing, EngineConfig, ImportMode, SyncService};
use serde::Serialize;

const USAGE: &str = "usage: chat-sync <check|open|status|list|backup|restore <filename> <overwrite|increment>>";

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cfg = EngineConfig::from_env_and_file();
    let service = SyncService::open(&cfg)
        .with_context(|| format!("failed to open data directory {:?}", cfg.app_data_dir))?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        bail!(USAGE);
    };

    match command.as_str() {
        "check" => print_json(&service.check_sync_folder())?,
        "open" => {
            let folder = service.open_sync_folder()?;
            print_json(&folder)?;
        }
        "status" => print_json(&service.get_backup_status())?,
        "list" => print_json(&service.list_backups()?)?,
        "backup" => match service.start_backup().await? {
            Some(info) => print_json(&info)?,
            None => bail!("another backup or restore is already running"),
        },
        "restore" => {
            let (Some(filename), Some(mode)) = (args.get(1), args.get(2)) else {
                bail!(USAGE);
            };
            let mode: ImportMode = mode.parse().map_err(anyhow::Error::msg)?;
            let outcome = service.import_from_sync(filename, mode).await;
            print_json(&outcome)?;
            if !outcome.success {
                std::process::exit(1);
            }
        }
        other => bail!("unknown command '{}'\n{}", other, USAGE),
    }
    Ok(())
}
