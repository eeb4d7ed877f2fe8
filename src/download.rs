use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use tokio::io::AsyncWriteExt;

use crate::cli::BuildArgs;
use crate::storage::{SOURCE_FILE_NAMES, SourceFiles, StoragePaths, file_present_nonempty};

/// Makes sure the three source parquets exist under `source/`, seeding them
/// from `--source-dir` or downloading them from `--base-url`.
pub async fn ensure_inputs(paths: &StoragePaths, opts: &BuildArgs) -> anyhow::Result<SourceFiles> {
    tracing::info!("Ensuring input datasets (local reuse first, then download)...");
    paths.ensure_dirs().context("create data directories")?;
    tracing::info!("Inputs will be stored under {}", paths.source_dir.display());

    let sources = paths.source_files();
    for (fname, dest) in SOURCE_FILE_NAMES
        .iter()
        .zip([&sources.sdud, &sources.product, &sources.dates])
    {
        ensure_one_file(fname, dest, opts).await?;
    }
    Ok(sources)
}

async fn ensure_one_file(fname: &str, dest: &Path, opts: &BuildArgs) -> anyhow::Result<()> {
    if !opts.force_download && file_present_nonempty(dest) {
        return Ok(());
    }

    if !opts.force_download {
        if let Some(dir) = opts.source_dir.as_deref() {
            if seed_from_local(&Path::new(dir).join(fname), dest)
                .context("seed from local source dir")?
            {
                return Ok(());
            }
        }
    }

    let Some(base) = opts.base_url.as_deref() else {
        return Err(anyhow!(
            "Missing required input at {} (pass --source-dir or --base-url).",
            dest.display()
        ));
    };
    let url = source_url(base, fname);
    if opts.offline {
        return Err(anyhow!(
            "Missing required input at {} (run without --offline to auto-download from {}).",
            dest.display(),
            url
        ));
    }
    ensure_download(&url, dest, opts.force_download).await
}

/// Links or copies `src` to `dest`. Returns false when `src` is not usable.
fn seed_from_local(src: &Path, dest: &Path) -> anyhow::Result<bool> {
    if !file_present_nonempty(src) {
        tracing::warn!("Local input {} is missing or empty", src.display());
        return Ok(false);
    }

    // If an empty file was left behind, replace it.
    if std::fs::metadata(dest)
        .map(|m| m.is_file() && m.len() == 0)
        .unwrap_or(false)
    {
        let _ = std::fs::remove_file(dest);
    }
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).ok();
    }

    // Prefer hardlink (no duplication), then symlink, then copy.
    if std::fs::hard_link(src, dest).is_ok() {
        tracing::info!(
            "Reused local input via hardlink: {} -> {}",
            dest.display(),
            src.display()
        );
        return Ok(true);
    }
    if symlink_file(src, dest).is_ok() {
        tracing::info!(
            "Reused local input via symlink: {} -> {}",
            dest.display(),
            src.display()
        );
        return Ok(true);
    }
    std::fs::copy(src, dest)
        .with_context(|| format!("copy {} -> {}", src.display(), dest.display()))?;
    tracing::info!(
        "Reused local input via copy: {} -> {}",
        dest.display(),
        src.display()
    );
    Ok(true)
}

#[cfg(unix)]
fn symlink_file(src: &Path, dest: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(src, dest)
}

#[cfg(windows)]
fn symlink_file(src: &Path, dest: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(src, dest)
}

fn source_url(base: &str, fname: &str) -> String {
    format!("{}/{fname}", base.trim_end_matches('/'))
}

async fn ensure_download(url: &str, dest: &Path, force: bool) -> anyhow::Result<()> {
    if !force && file_present_nonempty(dest) {
        return Ok(());
    }

    let tmp = tmp_path(dest);
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }

    tracing::info!("Downloading {} -> {}", url, dest.display());

    let client = reqwest::Client::new();
    let resp = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("GET {url}"))?;

    if !resp.status().is_success() {
        return Err(anyhow!("Download failed ({}): {}", resp.status(), url));
    }

    let mut file = tokio::fs::File::create(&tmp)
        .await
        .with_context(|| format!("create {}", tmp.display()))?;

    let mut downloaded: u64 = 0;
    let mut stream = resp.bytes_stream();
    use futures_util::StreamExt;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.with_context(|| format!("read body chunk from {url}"))?;
        downloaded += chunk.len() as u64;
        file.write_all(&chunk).await?;

        if downloaded % (50 * 1024 * 1024) < chunk.len() as u64 {
            tracing::info!("... downloaded {} MB", downloaded / (1024 * 1024));
        }
    }

    file.flush().await?;
    drop(file);

    tokio::fs::rename(&tmp, dest)
        .await
        .with_context(|| format!("rename {} -> {}", tmp.display(), dest.display()))?;

    Ok(())
}

fn tmp_path(dest: &Path) -> PathBuf {
    let fname = dest
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("download");
    dest.with_file_name(format!("{fname}.part"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(data_dir: &Path, source_dir: Option<&Path>) -> BuildArgs {
        BuildArgs {
            data_dir: data_dir.display().to_string(),
            source_dir: source_dir.map(|p| p.display().to_string()),
            base_url: Some("https://example.invalid/sdud/".to_string()),
            offline: true,
            force_download: false,
            rebuild: false,
        }
    }

    #[test]
    fn urls_and_part_files() {
        assert_eq!(
            source_url("https://host/data/", "sdud.parquet"),
            "https://host/data/sdud.parquet"
        );
        assert_eq!(
            tmp_path(Path::new("/d/source/dates.parquet")),
            PathBuf::from("/d/source/dates.parquet.part")
        );
    }

    #[tokio::test]
    async fn seeds_inputs_from_source_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("upstream");
        std::fs::create_dir_all(&src).unwrap();
        for f in SOURCE_FILE_NAMES {
            std::fs::write(src.join(f), b"PAR1").unwrap();
        }

        let data = tmp.path().join("data");
        let paths = StoragePaths::new(&data);
        let sources = ensure_inputs(&paths, &args(&data, Some(&src)))
            .await
            .unwrap();
        assert!(file_present_nonempty(&sources.sdud));
        assert!(file_present_nonempty(&sources.product));
        assert!(file_present_nonempty(&sources.dates));
    }

    #[tokio::test]
    async fn offline_without_inputs_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let data = tmp.path().join("data");
        let paths = StoragePaths::new(&data);
        let err = ensure_inputs(&paths, &args(&data, None)).await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("--offline"), "{msg}");
        assert!(msg.contains("https://example.invalid/sdud/sdud.parquet"), "{msg}");
    }
}
