use anyhow::Result;
use std::fs;
use std::io::{Read, Write};
use std::path::Path;

/// Make sure the asset at `url` exists at `dest`.
///
/// If the file is already present the call returns immediately without any
/// integrity check; otherwise the asset is streamed to disk with percentage
/// progress reported through the log. A failed or interrupted transfer never
/// leaves a partial file at `dest`.
pub fn ensure(url: &str, dest: &Path) -> Result<()> {
    if dest.exists() {
        log::info!("asset already present: {}", dest.display());
        return Ok(());
    }

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }

    log::info!("downloading {} to {}", url, dest.display());
    match fetch(url, dest) {
        Ok(()) => {
            log::info!("download complete: {}", dest.display());
            Ok(())
        }
        Err(e) => {
            if dest.exists() {
                let _ = fs::remove_file(dest);
            }
            Err(e)
        }
    }
}

fn fetch(url: &str, dest: &Path) -> Result<()> {
    let response = ureq::get(url).call()?;
    let total: Option<u64> = response
        .header("Content-Length")
        .and_then(|v| v.parse().ok());

    let mut reader = response.into_reader();
    let mut file = fs::File::create(dest)?;
    let mut buf = [0u8; 64 * 1024];
    let mut received: u64 = 0;
    let mut last_reported: u64 = 0;

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])?;
        received += n as u64;

        if let Some(total) = total.filter(|&t| t > 0) {
            let percent = received * 100 / total;
            // report in 10% steps to keep the log readable
            if percent / 10 > last_reported / 10 {
                log::info!("downloading... {percent}%");
                last_reported = percent;
            }
        }
    }

    file.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // port 9 (discard) is never listening locally, so the connect fails fast
    const UNREACHABLE_URL: &str = "http://127.0.0.1:9/u2net.onnx";

    fn scratch_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("img2mesh-test-{}-{}", std::process::id(), name))
    }

    #[test]
    fn existing_file_is_not_refetched() {
        let dest = scratch_path("existing.onnx");
        fs::write(&dest, b"weights").unwrap();

        // the URL is unreachable, so success proves no fetch was attempted
        ensure(UNREACHABLE_URL, &dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"weights");

        fs::remove_file(&dest).unwrap();
    }

    #[test]
    fn failed_download_leaves_no_file() {
        let dest = scratch_path("missing/u2net.onnx");
        assert!(ensure(UNREACHABLE_URL, &dest).is_err());
        assert!(!dest.exists());
    }
}
