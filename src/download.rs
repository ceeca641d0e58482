// ============================================
// RTA Builder - download.rs
// ============================================
// Fetches a source ISO over HTTP(S).
//
// The file is streamed to "<dest>.part" and renamed when complete, so a
// stopped or failed download never leaves something that looks like a
// finished image.
// ============================================

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::blocking::Client;

use crate::cancel::StopFlag;
use crate::error::{BuildError, Result};
use crate::progress::Reporter;

/// Format a byte count for progress messages ("8.6 MB")
pub fn format_size(bytes: u64) -> String {
    if bytes >= 1_073_741_824 {
        format!("{:.1} GB", bytes as f64 / 1_073_741_824.0)
    } else if bytes >= 1_048_576 {
        format!("{:.1} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.0} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} bytes", bytes)
    }
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

fn http_client() -> Result<Client> {
    Client::builder()
        .user_agent(concat!("RTABuilder/", env!("CARGO_PKG_VERSION")))
        .redirect(reqwest::redirect::Policy::limited(10))
        .connect_timeout(Duration::from_secs(30))
        .timeout(None::<Duration>)
        .build()
        .map_err(|e| BuildError::Download {
            reason: format!("failed to create HTTP client: {}", e),
        })
}

/// Download `url` to `dest`, reporting percent when the size is known.
///
/// Returns the number of bytes written. On any failure (including a stop)
/// the partial file is removed.
pub fn download_file(url: &str, dest: &Path, stop: &StopFlag, reporter: &mut Reporter) -> Result<u64> {
    download_with(&http_client()?, url, dest, stop, reporter)
}

fn download_with(client: &Client, url: &str, dest: &Path, stop: &StopFlag, reporter: &mut Reporter) -> Result<u64> {
    reporter.info(&format!("Downloading ISO from {}", url));
    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| BuildError::io_at("Failed to create", parent, e))?;
    }

    let partial = part_path(dest);
    let result = fetch(client, url, &partial, stop, reporter);
    let written = match result {
        Ok(written) => written,
        Err(e) => {
            if partial.exists() {
                let _ = fs::remove_file(&partial);
            }
            return Err(e);
        }
    };

    if dest.exists() {
        fs::remove_file(dest).map_err(|e| BuildError::io_at("Failed to replace", dest, e))?;
    }
    fs::rename(&partial, dest).map_err(|e| BuildError::io_at("Failed to move download to", dest, e))?;

    reporter.info(&format!("Download complete: {} ({})", dest.display(), format_size(written)));
    Ok(written)
}

fn fetch(client: &Client, url: &str, partial: &Path, stop: &StopFlag, reporter: &mut Reporter) -> Result<u64> {
    let mut response = client.get(url).send().map_err(|e| BuildError::Download {
        reason: format!("failed to connect: {}", e),
    })?;
    if !response.status().is_success() {
        return Err(BuildError::Download {
            reason: format!("server returned {}", response.status()),
        });
    }

    let total = response.content_length().unwrap_or(0);
    let mut file = File::create(partial).map_err(|e| BuildError::io_at("Failed to create", partial, e))?;

    let mut buffer = [0u8; 64 * 1024];
    let mut downloaded = 0u64;
    let mut last_percent = None;
    loop {
        stop.check()?;
        let n = response.read(&mut buffer).map_err(|e| BuildError::Download {
            reason: format!("error reading download data: {}", e),
        })?;
        if n == 0 {
            break;
        }
        file.write_all(&buffer[..n])
            .map_err(|e| BuildError::io_at("Failed to write", partial, e))?;
        downloaded += n as u64;

        if total > 0 {
            let percent = ((downloaded * 100) / total).min(100) as u8;
            if last_percent != Some(percent) {
                last_percent = Some(percent);
                reporter.progress(
                    percent,
                    &format!("Downloading: {} of {} ({}%)", format_size(downloaded), format_size(total), percent),
                );
            }
        }
    }
    file.flush().map_err(|e| BuildError::io_at("Failed to write", partial, e))?;

    if total > 0 && downloaded < total {
        return Err(BuildError::Download {
            reason: format!("connection closed after {} of {} bytes", downloaded, total),
        });
    }
    Ok(downloaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufRead;
    use std::net::TcpListener;
    use std::thread;

    fn local_client() -> Client {
        Client::builder().no_proxy().build().unwrap()
    }

    /// Serve one canned HTTP response on a random local port
    fn serve_once(status: &'static str, body: Vec<u8>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut reader = std::io::BufReader::new(stream.try_clone().unwrap());
                let mut line = String::new();
                while reader.read_line(&mut line).unwrap_or(0) > 2 {
                    line.clear();
                }
                let head = format!(
                    "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    status,
                    body.len()
                );
                let _ = stream.write_all(head.as_bytes());
                let _ = stream.write_all(&body);
            }
        });
        format!("http://{}/kali.iso", addr)
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(500), "500 bytes");
        assert_eq!(format_size(1024), "1 KB");
        assert_eq!(format_size(9_000_000), "8.6 MB");
        assert_eq!(format_size(1_073_741_824), "1.0 GB");
    }

    #[test]
    fn test_download_writes_file_and_reports_progress() {
        let body: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let url = serve_once("200 OK", body.clone());
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("downloads").join("kali.iso");

        let mut percents = Vec::new();
        let written = {
            let mut reporter = Reporter::new(|_: &str, p: Option<u8>| {
                if let Some(p) = p {
                    percents.push(p);
                }
            });
            download_with(&local_client(), &url, &dest, &StopFlag::new(), &mut reporter).unwrap()
        };

        assert_eq!(written, body.len() as u64);
        assert_eq!(fs::read(&dest).unwrap(), body);
        assert!(!part_path(&dest).exists());
        assert_eq!(percents.last(), Some(&100));
    }

    #[test]
    fn test_http_error_leaves_nothing_behind() {
        let url = serve_once("404 Not Found", b"missing".to_vec());
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("kali.iso");

        let err = download_with(&local_client(), &url, &dest, &StopFlag::new(), &mut Reporter::silent()).unwrap_err();
        assert!(matches!(err, BuildError::Download { .. }));
        assert!(!dest.exists());
        assert!(!part_path(&dest).exists());
    }

    #[test]
    fn test_stop_removes_partial_file() {
        let url = serve_once("200 OK", vec![7u8; 10_000]);
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("kali.iso");

        let stop = StopFlag::new();
        stop.request_stop();
        let err = download_with(&local_client(), &url, &dest, &stop, &mut Reporter::silent()).unwrap_err();
        assert!(err.is_cancelled());
        assert!(!dest.exists());
        assert!(!part_path(&dest).exists());
    }
}
