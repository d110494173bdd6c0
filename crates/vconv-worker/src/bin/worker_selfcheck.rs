use std::path::Path;

use vconv_media::{check_ffmpeg, check_ffprobe};
use vconv_storage::{S3Backend, StorageLayout};
use vconv_worker::{BackendKind, StorageConfig, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = WorkerConfig::from_env();
    config.validate()?;

    println!(
        "worker-selfcheck: starting with work_dir={}",
        config.work_dir.display()
    );
    ensure_workdir(&config.work_dir).await?;
    ensure_ffmpeg()?;

    let storage = StorageConfig::from_env()?;
    ensure_storage(&storage).await?;

    let layout: StorageLayout = storage.layout();
    println!(
        "worker-selfcheck: input={} catalog={}",
        layout.input_prefix(),
        layout.catalog_key()
    );
    println!("worker-selfcheck: ok");
    Ok(())
}

async fn ensure_workdir<P: AsRef<Path>>(path: P) -> anyhow::Result<()> {
    let path = path.as_ref();
    tokio::fs::create_dir_all(path).await?;
    Ok(())
}

fn ensure_ffmpeg() -> anyhow::Result<()> {
    let ffmpeg = check_ffmpeg().map_err(|e| anyhow::anyhow!("ffmpeg not available: {}", e))?;
    let ffprobe = check_ffprobe().map_err(|e| anyhow::anyhow!("ffprobe not available: {}", e))?;
    println!(
        "worker-selfcheck: ffmpeg={} ffprobe={}",
        ffmpeg.display(),
        ffprobe.display()
    );
    Ok(())
}

async fn ensure_storage(storage: &StorageConfig) -> anyhow::Result<()> {
    match storage.kind {
        BackendKind::S3 => {
            let s3 = S3Backend::new(storage.s3.clone()).await?;
            s3.check_connectivity()
                .await
                .map_err(|e| anyhow::anyhow!("bucket {} not reachable: {}", s3.bucket(), e))?;
        }
        BackendKind::Local => {
            tokio::fs::create_dir_all(&storage.local_root).await?;
        }
        BackendKind::Memory => {
            println!("worker-selfcheck: memory backend keeps nothing between runs");
        }
    }
    Ok(())
}
