use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{RANGE, USER_AGENT};
use serde::de::DeserializeOwned;

use crate::errors::{LauncherError, Result};
use crate::models::Progress;

const CHUNK_SIZE: usize = 64 * 1024;

fn user_agent() -> String {
    format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

/// Blocking HTTP helper used by every provisioning step.
#[derive(Clone)]
pub struct NetworkFetcher {
    client: Client,
    probe_client: Client,
}

impl NetworkFetcher {
    pub fn new(download_timeout: Duration, probe_timeout: Duration) -> Self {
        let client = Client::builder()
            .user_agent(user_agent())
            .timeout(download_timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());
        let probe_client = Client::builder()
            .user_agent(user_agent())
            .timeout(probe_timeout)
            .connect_timeout(probe_timeout)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            probe_client,
        }
    }

    /// Downloads `url` to `dest`. Failure is logged and reported as `false`.
    pub fn fetch(&self, url: &str, dest: &Path, on_progress: Option<Progress>) -> bool {
        match self.download(url, dest, on_progress) {
            Ok(bytes) => {
                tracing::info!("downloaded {} ({} bytes) to {}", url, bytes, dest.display());
                true
            }
            Err(err) => {
                tracing::warn!("download of {} failed: {}", url, err);
                false
            }
        }
    }

    pub fn download(&self, url: &str, dest: &Path, on_progress: Option<Progress>) -> Result<u64> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut response = self.client.get(url).send()?;
        if !response.status().is_success() {
            return Err(LauncherError::Http(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }

        let total = response.content_length().filter(|len| *len > 0);
        let part_path = dest.with_extension("part");
        let written = {
            let mut file = File::create(&part_path)?;
            let mut buffer = vec![0_u8; CHUNK_SIZE];
            let mut written: u64 = 0;
            let mut last_percent: Option<u8> = None;

            loop {
                let read = response.read(&mut buffer)?;
                if read == 0 {
                    break;
                }
                file.write_all(&buffer[..read])?;
                written += read as u64;

                if let (Some(total), Some(report)) = (total, on_progress) {
                    let percent = ((written.min(total) * 100) / total) as u8;
                    if last_percent.map_or(true, |last| percent > last) {
                        last_percent = Some(percent);
                        report(percent, "downloading");
                    }
                }
            }
            file.flush()?;
            written
        };

        if dest.exists() {
            let _ = fs::remove_file(dest);
        }
        fs::rename(&part_path, dest)?;
        Ok(written)
    }

    /// True when `url` answers within `timeout`. Tries HEAD, then a one-byte ranged GET.
    pub fn probe(&self, url: &str, timeout: Duration) -> bool {
        let head = self
            .probe_client
            .head(url)
            .header(USER_AGENT, user_agent())
            .timeout(timeout)
            .send();
        match head {
            Ok(response) if response.status().is_success() || response.status().is_redirection() => {
                return true
            }
            Ok(response) => tracing::debug!("HEAD {} returned {}", url, response.status()),
            Err(err) => tracing::debug!("HEAD {} failed: {}", url, err),
        }

        match self
            .probe_client
            .get(url)
            .header(RANGE, "bytes=0-0")
            .timeout(timeout)
            .send()
        {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                tracing::debug!("ranged GET {} failed: {}", url, err);
                false
            }
        }
    }

    /// Moves the first responsive candidate to the front. Order is otherwise preserved.
    pub fn rank_candidates(&self, candidates: &[String], timeout: Duration) -> Vec<String> {
        let mut ranked = candidates.to_vec();
        if let Some(index) = ranked.iter().position(|url| self.probe(url, timeout)) {
            let preferred = ranked.remove(index);
            ranked.insert(0, preferred);
        }
        ranked
    }

    pub fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self
            .client
            .get(url)
            .header("Accept", "application/vnd.github+json")
            .send()?;
        if !response.status().is_success() {
            return Err(LauncherError::Http(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }
        Ok(response.json::<T>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};
    use std::net::TcpListener;
    use std::sync::Mutex;
    use std::thread;
    use uuid::Uuid;

    /// Serves `body` to every request on a loopback port until `requests` have been answered.
    fn serve(body: &'static [u8], status: &'static str, requests: usize) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
        let addr = listener.local_addr().expect("local addr");
        thread::spawn(move || {
            for stream in listener.incoming().take(requests) {
                let Ok(mut stream) = stream else { continue };
                let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));
                let mut request_line = String::new();
                let _ = reader.read_line(&mut request_line);
                loop {
                    let mut line = String::new();
                    if reader.read_line(&mut line).unwrap_or(0) == 0 || line == "\r\n" {
                        break;
                    }
                }
                let header = format!(
                    "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = stream.write_all(header.as_bytes());
                if !request_line.starts_with("HEAD") {
                    let _ = stream.write_all(body);
                }
                let _ = stream.flush();
            }
        });
        format!("http://{addr}/file.bin")
    }

    /// Rejects HEAD with 405 and answers only a `bytes=0-0` GET, with 206.
    fn serve_range_only(requests: usize) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
        let addr = listener.local_addr().expect("local addr");
        thread::spawn(move || {
            for stream in listener.incoming().take(requests) {
                let Ok(mut stream) = stream else { continue };
                let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));
                let mut request_line = String::new();
                let _ = reader.read_line(&mut request_line);
                let mut ranged = false;
                loop {
                    let mut line = String::new();
                    if reader.read_line(&mut line).unwrap_or(0) == 0 || line == "\r\n" {
                        break;
                    }
                    ranged |= line.to_ascii_lowercase().trim() == "range: bytes=0-0";
                }
                let response: &[u8] = if request_line.starts_with("HEAD") {
                    b"HTTP/1.1 405 Method Not Allowed\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                } else if ranged {
                    b"HTTP/1.1 206 Partial Content\r\nContent-Range: bytes 0-0/10\r\nContent-Length: 1\r\nConnection: close\r\n\r\nx"
                } else {
                    b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                };
                let _ = stream.write_all(response);
                let _ = stream.flush();
            }
        });
        format!("http://{addr}/file.bin")
    }

    fn closed_port_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
        let addr = listener.local_addr().expect("local addr");
        drop(listener);
        format!("http://{addr}/file.bin")
    }

    fn fetcher() -> NetworkFetcher {
        NetworkFetcher::new(Duration::from_secs(10), Duration::from_secs(2))
    }

    #[test]
    fn fetch_writes_body_and_reports_progress() {
        let url = serve(b"hello bootstrap", "200 OK", 1);
        let dir = std::env::temp_dir().join(format!("bootstrap-fetch-{}", Uuid::new_v4()));
        let dest = dir.join("payload.bin");
        let seen = Mutex::new(Vec::new());
        let report = |percent: u8, _status: &str| {
            seen.lock().expect("progress lock").push(percent);
        };

        assert!(fetcher().fetch(&url, &dest, Some(&report)));
        assert_eq!(fs::read(&dest).expect("read payload"), b"hello bootstrap");
        let seen = seen.into_inner().expect("progress values");
        assert_eq!(seen.last(), Some(&100));
        assert!(seen.windows(2).all(|pair| pair[0] < pair[1]));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn fetch_reports_failure_for_error_status() {
        let url = serve(b"missing", "404 Not Found", 1);
        let dir = std::env::temp_dir().join(format!("bootstrap-fetch-{}", Uuid::new_v4()));
        let dest = dir.join("payload.bin");

        assert!(!fetcher().fetch(&url, &dest, None));
        assert!(!dest.exists());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn probe_distinguishes_live_and_dead_hosts() {
        let live = serve(b"", "200 OK", 2);
        assert!(fetcher().probe(&live, Duration::from_secs(2)));
        assert!(!fetcher().probe(&closed_port_url(), Duration::from_millis(500)));
    }

    #[test]
    fn ranking_prefers_first_responsive_candidate() {
        let dead = closed_port_url();
        let live = serve(b"", "200 OK", 2);
        let ranked = fetcher().rank_candidates(&[dead.clone(), live.clone()], Duration::from_millis(500));
        assert_eq!(ranked, vec![live, dead]);
    }

    #[test]
    fn reachability_falls_back_to_ranged_get_when_head_is_rejected() {
        let url = serve_range_only(2);
        assert!(fetcher().probe(&url, Duration::from_secs(2)));
    }

    #[test]
    fn reachability_fails_when_head_and_ranged_get_are_rejected() {
        let url = serve(b"", "405 Method Not Allowed", 2);
        assert!(!fetcher().probe(&url, Duration::from_secs(2)));
    }
}
